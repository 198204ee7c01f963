//! Dexcom G4 receiver driver
//!
//! The receiver answers sync-byte framed commands over a CDC serial link.
//! Data lives in per-type page partitions; each page carries a 28-byte header
//! followed by fixed-size records timestamped in seconds since 2009-01-01.
//! Clock changes are recovered from the display offset history in the
//! user-setting partition.

use chrono::{Datelike, Duration as ChronoDuration, NaiveDateTime};
use log::{debug, info, warn};
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;

use super::{read_frame, Retry};
use crate::codec::bytes::ByteReader;
use crate::codec::sync::SyncCodec;
use crate::codec::{FrameCodec, FrameReader, PacketFrame};
use crate::config::{Period, RetryPolicy};
use crate::error::{NoRecordsError, ProtocolViolationError, Result};
use crate::normalizer::{GlucoseRange, Normalizer};
use crate::records::{seconds_since, RawRecord};
use crate::session::{
    apply_delta, check_device_time, ClockCheck, DeviceDriver, Progress, SessionData, WRONG_DEVICE_TIME,
};
use crate::transport::Transport;
use crate::types::{
    AlertSetting, Annotation, Cbg, CgmSettings, ClinicalEvent, DeviceEvent, DeviceTag, EventKind, Smbg,
    MGDL,
};

/// Command bytes
pub mod cmd {
    pub const ACK: u8 = 1;
    pub const NAK: u8 = 2;
    pub const PING: u8 = 10;
    pub const READ_FIRMWARE_HEADER: u8 = 11;
    pub const READ_DATA_PAGE_RANGE: u8 = 16;
    pub const READ_DATA_PAGES: u8 = 17;
    pub const READ_DISPLAY_TIME_OFFSET: u8 = 29;
    pub const WRITE_DISPLAY_TIME_OFFSET: u8 = 30;
    pub const READ_SYSTEM_TIME: u8 = 34;

    pub fn name(command: u8) -> &'static str {
        match command {
            ACK => "ACK",
            NAK => "NAK",
            PING => "PING",
            READ_FIRMWARE_HEADER => "READ_FIRMWARE_HEADER",
            READ_DATA_PAGE_RANGE => "READ_DATA_PAGE_RANGE",
            READ_DATA_PAGES => "READ_DATA_PAGES",
            READ_DISPLAY_TIME_OFFSET => "READ_DISPLAY_TIME_OFFSET",
            WRITE_DISPLAY_TIME_OFFSET => "WRITE_DISPLAY_TIME_OFFSET",
            READ_SYSTEM_TIME => "READ_SYSTEM_TIME",
            _ => "UNKNOWN",
        }
    }
}

/// Database partitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    Manufacturing = 0,
    Egv = 4,
    Meter = 10,
    UserSetting = 12,
}

impl RecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordType::Manufacturing => "manufacturing",
            RecordType::Egv => "egv",
            RecordType::Meter => "meter",
            RecordType::UserSetting => "userSetting",
        }
    }
}

pub const PAGE_HEADER_LEN: usize = 28;
const MANUFACTURING_HEADER_LEN: usize = 35;
const EGV_RECORD_LEN: usize = 13;
const METER_RECORD_LEN: usize = 16;
const SETTING_RECORD_LEN: usize = 48;

/// Both page numbers are this value when a partition is empty
const EMPTY_PARTITION: u32 = 0xFFFF_FFFF;

/// 2009-01-01T00:00:00 as Unix seconds
const BASE_DATE_UNIX: i64 = 1_230_768_000;
/// Settings written before the receiver was set up carry internal times in this year
const SENTINEL_YEAR: i32 = 2009;
/// `setUpState` of a fully configured receiver
const SETUP_COMPLETE: u8 = 5;

const LOW_ALARM_ENABLED: u32 = 0x010;
const HIGH_ALARM_ENABLED: u32 = 0x020;

const EGV_RANGE: GlucoseRange = GlucoseRange::new(40.0, 400.0);

const TRENDS: [&str; 10] = [
    "None",
    "DoubleUp",
    "SingleUp",
    "FortyFiveUp",
    "Flat",
    "FortyFiveDown",
    "SingleDown",
    "DoubleDown",
    "Not Computable",
    "Rate Out Of Range",
];

pub fn base_date() -> NaiveDateTime {
    NaiveDateTime::default() + ChronoDuration::seconds(BASE_DATE_UNIX)
}

fn receiver_time(seconds: u32) -> NaiveDateTime {
    seconds_since(base_date(), i64::from(seconds))
}

pub fn trend_name(arrow: u8) -> Option<&'static str> {
    TRENDS.get(usize::from(arrow & 0x0F)).copied()
}

/// `Name='value'` attributes of the receiver's XML payloads
pub fn xml_attributes(xml: &str) -> BTreeMap<String, String> {
    let mut attrs = BTreeMap::new();
    let mut cursor = 0;
    while let Some(found) = xml[cursor..].find('=') {
        let eq = cursor + found;
        let quote = match xml[eq + 1..].chars().next() {
            Some(q @ ('\'' | '"')) => q,
            _ => {
                cursor = eq + 1;
                continue;
            }
        };
        let name_start = xml[..eq]
            .char_indices()
            .rev()
            .take_while(|(_, c)| c.is_ascii_alphanumeric() || *c == '_')
            .last()
            .map_or(eq, |(i, _)| i);
        let value_start = eq + 2;
        let Some(len) = xml[value_start..].find(quote) else {
            break;
        };
        if name_start < eq {
            attrs.insert(
                xml[name_start..eq].to_string(),
                xml[value_start..value_start + len].to_string(),
            );
        }
        cursor = value_start + len + 1;
    }
    attrs
}

/// Five base-32 characters, most significant first
pub fn transmitter_id(raw: u32) -> String {
    const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKLMNPQRSTUWXY";
    (0..5)
        .rev()
        .map(|i| char::from(ALPHABET[((raw >> (5 * i)) & 0x1F) as usize]))
        .collect()
}

/// `ProductName` words shortened to three letters, then the serial
pub fn device_id(product_name: &str, serial: &str) -> String {
    let short: String = product_name
        .split_whitespace()
        .map(|word| word.chars().take(3).collect::<String>())
        .collect();
    format!("{}_{}", short, serial)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageHeader {
    pub index: u32,
    pub nrecs: u32,
    pub rectype: u8,
    pub revision: u8,
    pub pagenum: u32,
}

impl PageHeader {
    pub fn parse(reader: &mut ByteReader<'_>) -> Result<Self> {
        let header = Self {
            index: reader.u32_le()?,
            nrecs: reader.u32_le()?,
            rectype: reader.u8()?,
            revision: reader.u8()?,
            pagenum: reader.u32_le()?,
        };
        // r1, r2, r3 and two junk bytes
        reader.skip(14)?;
        Ok(header)
    }
}

/// A glucose-bearing record, before event conversion
#[derive(Debug, Clone, PartialEq)]
pub enum Reading {
    Egv { glucose: u16, trend: u8, system_seconds: u32 },
    Meter { value: u16, system_seconds: u32 },
}

/// One display offset snapshot from the user-setting partition
#[derive(Debug, Clone, PartialEq)]
pub struct UserSetting {
    pub system_seconds: u32,
    pub display_seconds: u32,
    pub system_offset: i32,
    pub display_offset: i32,
    pub transmitter_id: u32,
    pub enable_flags: u32,
    pub high_alarm: u16,
    pub high_snooze: u16,
    pub low_alarm: u16,
    pub low_snooze: u16,
    pub setup_state: u8,
}

impl UserSetting {
    fn parse(reader: &mut ByteReader<'_>) -> Result<Self> {
        let start = reader.offset();
        let setting = Self {
            system_seconds: reader.u32_le()?,
            display_seconds: reader.u32_le()?,
            system_offset: reader.i32_le()?,
            display_offset: reader.i32_le()?,
            transmitter_id: reader.u32_le()?,
            enable_flags: reader.u32_le()?,
            high_alarm: reader.u16_le()?,
            high_snooze: reader.u16_le()?,
            low_alarm: reader.u16_le()?,
            low_snooze: reader.u16_le()?,
            setup_state: {
                // rise, fall, out-of-range snooze, language, alarm profile
                reader.skip(9)?;
                reader.u8()?
            },
        };
        reader.skip(SETTING_RECORD_LEN - (reader.offset() - start))?;
        Ok(setting)
    }

    pub fn internal_time(&self) -> NaiveDateTime {
        receiver_time(self.system_seconds)
    }

    fn display_time_with(&self, offset: i32) -> NaiveDateTime {
        seconds_since(base_date(), i64::from(self.system_seconds) + i64::from(offset))
    }

    fn cgm_settings(&self) -> CgmSettings {
        CgmSettings {
            units: MGDL.to_string(),
            transmitter_id: Some(transmitter_id(self.transmitter_id)),
            low_alerts: Some(AlertSetting {
                enabled: self.enable_flags & LOW_ALARM_ENABLED != 0,
                level: f64::from(self.low_alarm),
                snooze: i64::from(self.low_snooze) * 60_000,
            }),
            high_alerts: Some(AlertSetting {
                enabled: self.enable_flags & HIGH_ALARM_ENABLED != 0,
                level: f64::from(self.high_alarm),
                snooze: i64::from(self.high_snooze) * 60_000,
            }),
        }
    }
}

/// Readings from one EGV page; revisions other than the G4's are refused
pub fn parse_egv_page(page: &[u8]) -> Result<Vec<RawRecord<Reading>>> {
    let mut reader = ByteReader::new(page);
    let header = PageHeader::parse(&mut reader)?;
    if !(1..=3).contains(&header.revision) {
        return Err(ProtocolViolationError::Incompatible(format!(
            "EGV page revision {}",
            header.revision
        ))
        .into());
    }
    let mut records = Vec::with_capacity(header.nrecs as usize);
    for _ in 0..header.nrecs {
        let mut record = ByteReader::new(reader.take(EGV_RECORD_LEN)?);
        let system_seconds = record.u32_le()?;
        let display_seconds = record.u32_le()?;
        let glucose = record.u16_le()?;
        let trend = record.u8()?;
        records.push(RawRecord::new(
            u64::from(system_seconds),
            receiver_time(display_seconds),
            Reading::Egv {
                glucose,
                trend,
                system_seconds,
            },
        ));
    }
    Ok(records)
}

pub fn parse_meter_page(page: &[u8]) -> Result<Vec<RawRecord<Reading>>> {
    let mut reader = ByteReader::new(page);
    let header = PageHeader::parse(&mut reader)?;
    let mut records = Vec::with_capacity(header.nrecs as usize);
    for _ in 0..header.nrecs {
        let mut record = ByteReader::new(reader.take(METER_RECORD_LEN)?);
        let system_seconds = record.u32_le()?;
        let display_seconds = record.u32_le()?;
        let value = record.u16_le()?;
        records.push(RawRecord::new(
            u64::from(system_seconds),
            receiver_time(display_seconds),
            Reading::Meter {
                value,
                system_seconds,
            },
        ));
    }
    Ok(records)
}

pub fn parse_setting_page(page: &[u8]) -> Result<Vec<UserSetting>> {
    let mut reader = ByteReader::new(page);
    let header = PageHeader::parse(&mut reader)?;
    (0..header.nrecs)
        .map(|_| UserSetting::parse(&mut reader))
        .collect()
}

/// XML attributes of the newest manufacturing page
pub fn parse_manufacturing_page(page: &[u8]) -> Result<BTreeMap<String, String>> {
    let mut reader = ByteReader::new(page);
    reader.skip(MANUFACTURING_HEADER_LEN)?;
    let xml = reader.zstring(reader.remaining())?;
    Ok(xml_attributes(&xml))
}

/// Glucose value for an EGV record, or `None` for the values the receiver
/// uses as markers
pub fn egv_value(raw: u16) -> Option<(f64, Option<Annotation>)> {
    // records with the high bit set are superseded by the next one
    if raw & 0x8000 != 0 {
        return None;
    }
    let glucose = raw & 0x3FF;
    if glucose < 20 {
        return None;
    }
    Some(Normalizer::clamp_glucose(f64::from(glucose), &EGV_RANGE))
}

/// Clock changes and settings snapshots from the user-setting history
///
/// Settings whose internal time lies in 2009 predate setup and are ignored.
/// The first offset seen is the starting point, not a change.
pub fn settings_changes(settings: &[UserSetting]) -> (Vec<ClinicalEvent>, Vec<ClinicalEvent>) {
    let mut sorted: Vec<&UserSetting> = settings.iter().collect();
    sorted.sort_by_key(|s| s.system_seconds);

    let mut changes = Vec::new();
    let mut snapshots: Vec<ClinicalEvent> = Vec::new();
    let mut last_offset: Option<i32> = None;
    let mut last_settings: Option<CgmSettings> = None;

    for setting in sorted {
        if setting.internal_time().year() == SENTINEL_YEAR {
            continue;
        }
        if let Some(last) = last_offset.filter(|last| *last != setting.display_offset) {
            let from = setting.display_time_with(last);
            let to = setting.display_time_with(setting.display_offset);
            changes.push(
                ClinicalEvent::new(from, EventKind::DeviceEvent(DeviceEvent::time_change(from, to, "manual")))
                    .with_index(u64::from(setting.system_seconds))
                    .with_payload(json!({
                        "systemSeconds": setting.system_seconds,
                        "oldDisplayOffset": last,
                        "newDisplayOffset": setting.display_offset,
                    })),
            );
        }
        last_offset = Some(setting.display_offset);

        let id = transmitter_id(setting.transmitter_id);
        if setting.setup_state < SETUP_COMPLETE || id == "60000" {
            continue;
        }
        let current = setting.cgm_settings();
        if last_settings.as_ref() != Some(&current) {
            snapshots.push(
                ClinicalEvent::new(
                    receiver_time(setting.display_seconds),
                    EventKind::CgmSettings(current.clone()),
                )
                .with_index(u64::from(setting.system_seconds))
                .with_payload(json!({
                    "internalTime": crate::types::format_device_time(&setting.internal_time()),
                })),
            );
        }
        last_settings = Some(current);
    }
    (changes, snapshots)
}

fn reading_events(records: Vec<RawRecord<Reading>>) -> Vec<ClinicalEvent> {
    let mut events = Vec::with_capacity(records.len());
    for record in records {
        match record.kind {
            Reading::Egv {
                glucose,
                trend,
                system_seconds,
            } => {
                let Some((value, annotation)) = egv_value(glucose) else {
                    debug!("skipping EGV marker {:#06x} at {}", glucose, system_seconds);
                    continue;
                };
                let mut event = ClinicalEvent::new(
                    record.device_time,
                    EventKind::Cbg(Cbg {
                        value,
                        units: MGDL.to_string(),
                        trend: trend_name(trend).map(str::to_string),
                    }),
                )
                .with_index(record.index)
                .with_payload(json!({
                    "internalTime": crate::types::format_device_time(&receiver_time(system_seconds)),
                }));
                if let Some(annotation) = annotation {
                    event.annotate(annotation);
                }
                events.push(event);
            }
            Reading::Meter { value, .. } => {
                let value = f64::from(value);
                events.push(
                    ClinicalEvent::new(
                        record.device_time,
                        EventKind::Smbg(Smbg {
                            value,
                            units: MGDL.to_string(),
                            sub_type: Some("manual".to_string()),
                        }),
                    )
                    .with_index(record.index),
                );
                events.push(
                    ClinicalEvent::new(
                        record.device_time,
                        EventKind::DeviceEvent(DeviceEvent::calibration(value, MGDL)),
                    )
                    .with_index(record.index),
                );
            }
        }
    }
    events
}

pub struct DexcomDriver {
    transport: Box<dyn Transport>,
    reader: FrameReader<SyncCodec>,
    timeout: Duration,
    retry: RetryPolicy,
    firmware: BTreeMap<String, String>,
    display_offset: i32,
    readings: Vec<RawRecord<Reading>>,
    settings: Vec<UserSetting>,
}

impl DexcomDriver {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            reader: FrameReader::new(SyncCodec::dexcom()),
            timeout: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            firmware: BTreeMap::new(),
            display_offset: 0,
            readings: Vec::new(),
            settings: Vec::new(),
        }
    }

    async fn exchange(&mut self, packet: &[u8]) -> Result<PacketFrame> {
        self.transport.flush().await?;
        self.reader.clear();
        self.transport.send(packet, self.timeout).await?;
        read_frame(self.transport.as_mut(), &mut self.reader, self.timeout).await
    }

    /// Send one command and return the payload of its ACK
    async fn command(&mut self, command: u8, payload: &[u8]) -> Result<Vec<u8>> {
        let packet = self.reader.codec().encode(command, payload)?;
        let mut retry = Retry::from_policy(&self.retry);
        loop {
            match self.exchange(&packet).await {
                Ok(frame) if frame.descriptor == cmd::ACK => return Ok(frame.payload),
                Ok(frame) => {
                    return Err(ProtocolViolationError::Nak {
                        code: frame.descriptor,
                        reason: format!("{} answered with {}", cmd::name(command), cmd::name(frame.descriptor)),
                    }
                    .into())
                }
                Err(e) => retry.after(e).await?,
            }
        }
    }

    async fn read_i32(&mut self, command: u8) -> Result<i32> {
        let payload = self.command(command, &[]).await?;
        Ok(ByteReader::new(&payload).i32_le()?)
    }

    /// First and last page of a partition, `None` when it is empty
    async fn page_range(&mut self, rectype: RecordType) -> Result<Option<(u32, u32)>> {
        let payload = self.command(cmd::READ_DATA_PAGE_RANGE, &[rectype as u8]).await?;
        let mut reader = ByteReader::new(&payload);
        let (lo, hi) = (reader.u32_le()?, reader.u32_le()?);
        if lo == EMPTY_PARTITION && hi == EMPTY_PARTITION {
            debug!("{} partition is empty", rectype.as_str());
            return Ok(None);
        }
        debug!("{} pages {}..={}", rectype.as_str(), lo, hi);
        Ok(Some((lo, hi)))
    }

    async fn read_page(&mut self, rectype: RecordType, page: u32) -> Result<Vec<u8>> {
        let mut payload = vec![rectype as u8];
        payload.extend_from_slice(&page.to_le_bytes());
        payload.push(1);
        self.command(cmd::READ_DATA_PAGES, &payload).await
    }

    async fn read_pages(
        &mut self,
        rectype: RecordType,
        range: Option<(u32, u32)>,
        progress: &mut Progress,
        share: (f64, f64),
    ) -> Result<Vec<Vec<u8>>> {
        let Some((lo, hi)) = range else {
            return Ok(Vec::new());
        };
        if hi < lo {
            return Err(ProtocolViolationError::InvalidRecord(format!(
                "{} page range {}..={}",
                rectype.as_str(),
                lo,
                hi
            ))
            .into());
        }
        let total = (u64::from(hi) - u64::from(lo) + 1) as f64;
        let mut pages = Vec::new();
        for (n, page) in (lo..=hi).enumerate() {
            pages.push(self.read_page(rectype, page).await?);
            progress.report(share.0 + (share.1 - share.0) * (n + 1) as f64 / total);
        }
        Ok(pages)
    }

    async fn read_firmware_header(&mut self, data: &mut SessionData) -> Result<()> {
        let payload = self.command(cmd::READ_FIRMWARE_HEADER, &[]).await?;
        self.firmware = xml_attributes(&String::from_utf8_lossy(&payload));
        let attr = |name: &str| self.firmware.get(name).cloned().unwrap_or_default();
        data.info.model = attr("ProductId");
        data.info.firmware = self.firmware.get("FirmwareVersion").cloned();
        data.info.manufacturers = vec!["Dexcom".to_string()];
        data.info.tags = vec![DeviceTag::Cgm];
        info!(
            "found {} (software {}, firmware {})",
            attr("ProductName"),
            attr("SoftwareNumber"),
            attr("FirmwareVersion")
        );
        Ok(())
    }

    async fn read_serial_number(&mut self) -> Result<String> {
        let Some((_, hi)) = self.page_range(RecordType::Manufacturing).await? else {
            return Err(ProtocolViolationError::InvalidRecord("no manufacturing data".to_string()).into());
        };
        // the receiver may have been reworked; the newest page wins
        let page = self.read_page(RecordType::Manufacturing, hi).await?;
        let attrs = parse_manufacturing_page(&page)?;
        attrs.get("SerialNumber").cloned().ok_or_else(|| {
            ProtocolViolationError::InvalidRecord("manufacturing data has no SerialNumber".to_string()).into()
        })
    }
}

#[async_trait::async_trait]
impl DeviceDriver for DexcomDriver {
    fn name(&self) -> &'static str {
        "Dexcom"
    }

    fn supports_detect(&self) -> bool {
        true
    }

    async fn detect(&mut self, data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        self.setup(data, progress).await?;
        self.connect(data, progress).await?;
        let found = self.read_firmware_header(data).await;
        self.transport.disconnect().await?;
        found
    }

    async fn setup(&mut self, data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        self.timeout = Duration::from_millis(data.config.timeouts.dexcom_ms);
        self.retry = data.config.retry;
        progress.report(100.0);
        Ok(())
    }

    async fn connect(&mut self, data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        self.transport.connect(&data.device).await?;
        self.command(cmd::PING, &[]).await?;
        progress.report(100.0);
        Ok(())
    }

    async fn get_config_info(&mut self, data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        self.read_firmware_header(data).await?;
        progress.report(25.0);

        let serial = self.read_serial_number().await?;
        let product_name = self.firmware.get("ProductName").cloned().unwrap_or_default();
        data.info.device_id = device_id(&product_name, &serial);
        data.info.serial_number = serial;
        progress.report(50.0);

        self.display_offset = self.read_i32(cmd::READ_DISPLAY_TIME_OFFSET).await?;
        let system_time = self.read_i32(cmd::READ_SYSTEM_TIME).await?;
        let device_time = seconds_since(
            base_date(),
            i64::from(system_time) + i64::from(self.display_offset),
        );

        if let ClockCheck::Write(reference) = check_device_time(data, device_time, true)? {
            let difference = (device_time - reference).num_seconds();
            let new_offset = i64::from(self.display_offset) - difference;
            let new_offset = i32::try_from(new_offset).map_err(|_| {
                ProtocolViolationError::InvalidRecord(format!("display offset {} out of range", new_offset))
            })?;
            self.command(cmd::WRITE_DISPLAY_TIME_OFFSET, &new_offset.to_le_bytes())
                .await?;
            info!("display offset {} -> {}", self.display_offset, new_offset);
            self.display_offset = new_offset;
            data.annotate(Annotation::new(WRONG_DEVICE_TIME));
        }
        progress.report(100.0);
        Ok(())
    }

    async fn fetch_data(&mut self, data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        let egv_range = self
            .page_range(RecordType::Egv)
            .await?
            .ok_or(NoRecordsError::NoRecords)?;
        let meter_range = self.page_range(RecordType::Meter).await?;
        let setting_range = self.page_range(RecordType::UserSetting).await?;

        let mut readings = Vec::new();
        for page in self
            .read_pages(RecordType::Egv, Some(egv_range), progress, (0.0, 60.0))
            .await?
        {
            readings.extend(parse_egv_page(&page)?);
        }
        for page in self
            .read_pages(RecordType::Meter, meter_range, progress, (60.0, 80.0))
            .await?
        {
            readings.extend(parse_meter_page(&page)?);
        }
        let mut settings = Vec::new();
        for page in self
            .read_pages(RecordType::UserSetting, setting_range, progress, (80.0, 100.0))
            .await?
        {
            settings.extend(parse_setting_page(&page)?);
        }
        info!("read {} readings and {} setting records", readings.len(), settings.len());

        self.readings = apply_delta(readings, data)?;
        self.settings = settings;
        progress.report(100.0);
        Ok(())
    }

    async fn process_data(&mut self, data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        let (changes, snapshots) = settings_changes(&self.settings);
        let position = match data.config.period {
            Period::Delta => data.last_end_position,
            Period::All => None,
        };
        let newer = |event: &ClinicalEvent| match (position, event.index) {
            (Some(position), Some(index)) => index > position,
            _ => true,
        };

        let mut events = reading_events(std::mem::take(&mut self.readings));
        events.extend(snapshots.into_iter().filter(|e| newer(e)));
        progress.report(50.0);

        let (placed, changes) = data.reconcile(events, changes)?;
        let mut post: Vec<ClinicalEvent> = changes.into_iter().filter(|e| newer(e)).collect();
        post.extend(placed);
        post.sort_by_key(|e| e.time);
        debug!("{} events ready ({:?})", post.len(), data.time_processing);
        data.post_records = post;
        progress.report(100.0);
        Ok(())
    }

    async fn disconnect(&mut self, _data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        if let Err(e) = self.transport.disconnect().await {
            warn!("disconnect failed: {}", e);
            return Err(e.into());
        }
        progress.report(100.0);
        Ok(())
    }

    async fn cleanup(&mut self, _data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        self.reader.clear();
        self.readings.clear();
        self.settings.clear();
        progress.report(100.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Decoded;
    use crate::config::{DeltaStore, SessionConfig};
    use crate::session::{FixedClock, SessionOutcome, SessionRunner};
    use crate::transport::{DeviceDescriptor, ScriptedTransport, WriteLog};
    use crate::types::{EventKind, TimeProcessing};
    use crate::upload::RecordingUploader;
    use chrono::{TimeZone, Utc};
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::sync::Arc;

    const FIRMWARE: &str = "<FirmwareHeader SchemaVersion='1' ApiVersion='2.2.0.0' \
        ProductId='G4Receiver' ProductName='Dexcom G4 Receiver' SoftwareNumber='SW10050' \
        FirmwareVersion='2.0.1.104' />";

    fn page(rectype: RecordType, revision: u8, records: &[Vec<u8>]) -> Vec<u8> {
        let mut page = Vec::new();
        page.extend(0u32.to_le_bytes());
        page.extend((records.len() as u32).to_le_bytes());
        page.push(rectype as u8);
        page.push(revision);
        page.extend(0u32.to_le_bytes());
        page.extend([0u8; 14]);
        for record in records {
            page.extend(record);
        }
        page
    }

    fn egv(system: u32, display: u32, glucose: u16, trend: u8) -> Vec<u8> {
        let mut record = Vec::new();
        record.extend(system.to_le_bytes());
        record.extend(display.to_le_bytes());
        record.extend(glucose.to_le_bytes());
        record.push(trend);
        record.extend([0u8; 2]);
        record
    }

    fn meter(system: u32, display: u32, value: u16) -> Vec<u8> {
        let mut record = Vec::new();
        record.extend(system.to_le_bytes());
        record.extend(display.to_le_bytes());
        record.extend(value.to_le_bytes());
        record.extend(display.to_le_bytes());
        record.extend([0u8; 2]);
        record
    }

    fn setting_record(system: u32, display_offset: i32, setup_state: u8) -> Vec<u8> {
        let mut record = Vec::new();
        record.extend(system.to_le_bytes());
        record.extend(((system as i64 + display_offset as i64) as u32).to_le_bytes());
        record.extend(0i32.to_le_bytes());
        record.extend(display_offset.to_le_bytes());
        // "ABCDE" in the receiver's alphabet
        record.extend(((10u32 << 20) | (11 << 15) | (12 << 10) | (13 << 5) | 14).to_le_bytes());
        record.extend((LOW_ALARM_ENABLED | HIGH_ALARM_ENABLED).to_le_bytes());
        for value in [200u16, 30, 70, 15, 2, 2, 30, 1] {
            record.extend(value.to_le_bytes());
        }
        record.push(1);
        record.push(setup_state);
        record.extend([0u8; 6]);
        assert_eq!(record.len(), SETTING_RECORD_LEN);
        record
    }

    fn setting(system: u32, display_offset: i32) -> UserSetting {
        let record = setting_record(system, display_offset, SETUP_COMPLETE);
        UserSetting::parse(&mut ByteReader::new(&record)).unwrap()
    }

    fn seconds_at(time: NaiveDateTime) -> u32 {
        (time - base_date()).num_seconds() as u32
    }

    /// In-memory receiver answering the command set
    struct FakeReceiver {
        pages: HashMap<u8, Vec<Vec<u8>>>,
        display_offset: i32,
        system_time: u32,
        nak: Option<u8>,
    }

    impl FakeReceiver {
        fn respond(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
            let codec = SyncCodec::dexcom();
            let Ok(Decoded::Frame { frame, .. }) = codec.decode(bytes) else {
                return Vec::new();
            };
            if self.nak == Some(frame.descriptor) {
                return vec![codec.encode(cmd::NAK, &[]).unwrap()];
            }
            let payload = match frame.descriptor {
                cmd::PING => Vec::new(),
                cmd::READ_FIRMWARE_HEADER => FIRMWARE.as_bytes().to_vec(),
                cmd::READ_DATA_PAGE_RANGE => match self.pages.get(&frame.payload[0]) {
                    Some(pages) if !pages.is_empty() => {
                        [7u32.to_le_bytes(), (7 + pages.len() as u32 - 1).to_le_bytes()].concat()
                    }
                    _ => [EMPTY_PARTITION.to_le_bytes(), EMPTY_PARTITION.to_le_bytes()].concat(),
                },
                cmd::READ_DATA_PAGES => {
                    let mut reader = ByteReader::new(&frame.payload);
                    let rectype = reader.u8().unwrap();
                    let number = reader.u32_le().unwrap();
                    self.pages[&rectype][(number - 7) as usize].clone()
                }
                cmd::READ_DISPLAY_TIME_OFFSET => self.display_offset.to_le_bytes().to_vec(),
                cmd::READ_SYSTEM_TIME => self.system_time.to_le_bytes().to_vec(),
                cmd::WRITE_DISPLAY_TIME_OFFSET => {
                    self.display_offset = ByteReader::new(&frame.payload).i32_le().unwrap();
                    Vec::new()
                }
                _ => return vec![codec.encode(cmd::NAK, &[]).unwrap()],
            };
            vec![codec.encode(cmd::ACK, &payload).unwrap()]
        }
    }

    fn now() -> NaiveDateTime {
        crate::records::build_device_time(2015, 6, 1, 12, 0, 0).unwrap()
    }

    /// A receiver whose user moved the display clock forward an hour a day ago
    fn receiver(egv_pages: Vec<Vec<u8>>) -> FakeReceiver {
        let offset = 3600;
        let mut manufacturing = vec![0u8; MANUFACTURING_HEADER_LEN];
        manufacturing.extend_from_slice(b"<ManufacturingParameters SerialNumber='SM40331934' HardwarePartNumber='MT21255'/>\0");

        let mut pages = HashMap::new();
        pages.insert(RecordType::Manufacturing as u8, vec![manufacturing]);
        pages.insert(RecordType::Egv as u8, egv_pages);
        FakeReceiver {
            pages,
            display_offset: offset,
            system_time: seconds_at(now()) - offset as u32,
            nak: None,
        }
    }

    fn full_receiver() -> FakeReceiver {
        let change = seconds_at(now()) - 86_400;
        let before = change - 7200;
        let after = change + 300;
        let mut receiver = receiver(vec![page(
            RecordType::Egv,
            2,
            &[
                egv(before + 60, before + 60, 120, 4),
                egv(before + 360, before + 360, 0x8000 | 130, 4),
                egv(after, after + 3600, 30, 7),
                egv(after + 300, after + 3900, 450, 1),
                egv(after + 600, after + 4200, 5, 0),
            ],
        )]);
        receiver.pages.insert(
            RecordType::Meter as u8,
            vec![page(RecordType::Meter, 1, &[meter(after + 900, after + 4500, 110)])],
        );
        receiver.pages.insert(
            RecordType::UserSetting as u8,
            vec![page(
                RecordType::UserSetting,
                4,
                &[
                    setting_record(1000, -5000, 1),
                    setting_record(before, 0, SETUP_COMPLETE),
                    setting_record(change, 3600, SETUP_COMPLETE),
                ],
            )],
        );
        receiver
    }

    fn session(period: Period) -> SessionData {
        let clock = FixedClock(Utc.with_ymd_and_hms(2015, 6, 1, 12, 0, 0).unwrap());
        SessionData::new(
            SessionConfig::new("UTC").with_period(period),
            DeviceDescriptor::new("Dexcom").with_path("/dev/ttyACM0"),
        )
        .with_clock(Arc::new(clock))
    }

    fn dexcom(mut fake: FakeReceiver) -> (DexcomDriver, WriteLog) {
        let transport = ScriptedTransport::new().with_responder(move |bytes| fake.respond(bytes));
        let log = transport.writes();
        (DexcomDriver::new(Box::new(transport)), log)
    }

    #[test]
    fn test_xml_attributes() {
        let attrs = xml_attributes(FIRMWARE);
        assert_eq!(attrs["ProductId"], "G4Receiver");
        assert_eq!(attrs["ProductName"], "Dexcom G4 Receiver");
        assert_eq!(attrs["FirmwareVersion"], "2.0.1.104");
        assert_eq!(xml_attributes("<X A=\"1\" broken= B='2'/>")["B"], "2");
    }

    #[test]
    fn test_device_id_and_transmitter() {
        assert_eq!(device_id("Dexcom G4 Receiver", "SM40331934"), "DexG4Rec_SM40331934");
        assert_eq!(transmitter_id((10 << 20) | (11 << 15) | (12 << 10) | (13 << 5) | 14), "ABCDE");
        assert_eq!(transmitter_id(6 << 20), "60000");
    }

    #[test]
    fn test_egv_values() {
        assert_eq!(egv_value(120), Some((120.0, None)));
        assert_eq!(egv_value(0x8000 | 120), None);
        assert_eq!(egv_value(5), None);

        let (low, annotation) = egv_value(30).unwrap();
        assert_eq!(low, 39.0);
        assert_eq!(annotation, Some(Annotation::out_of_range("low", 40.0)));

        let (high, annotation) = egv_value(450).unwrap();
        assert_eq!(high, 401.0);
        assert_eq!(annotation, Some(Annotation::out_of_range("high", 400.0)));
    }

    #[tokio::test]
    async fn test_full_width_page_range_fails_cleanly() {
        let mut fake = receiver(Vec::new());
        fake.nak = Some(cmd::READ_DATA_PAGES);
        let (mut driver, _) = dexcom(fake);
        driver.transport.connect(&DeviceDescriptor::new("Dexcom")).await.unwrap();
        let err = driver
            .read_pages(RecordType::Egv, Some((0, u32::MAX)), &mut Progress::silent(), (0.0, 100.0))
            .await
            .unwrap_err();
        assert!(matches!(err, crate::error::UplinkError::Protocol(ProtocolViolationError::Nak { .. })));
    }

    #[test]
    fn test_unknown_egv_revision_is_incompatible() {
        let err = parse_egv_page(&page(RecordType::Egv, 9, &[])).unwrap_err();
        assert_eq!(err.code(), "E_DEVICE_UPLOAD");
    }

    #[test]
    fn test_one_clock_change_and_sentinel_ignored() {
        let base = seconds_at(now());
        let settings = vec![
            setting(base + 100, 3600),
            // written before setup, internal time in 2009
            setting(500, -7200),
            setting(base, 0),
            setting(base + 200, 3600),
        ];
        let (changes, snapshots) = settings_changes(&settings);
        assert_eq!(changes.len(), 1);

        let change = &changes[0];
        assert_eq!(change.index, Some(u64::from(base + 100)));
        let detail = change.device_event().and_then(|e| e.change.clone()).unwrap();
        assert_eq!(detail.from, now() + ChronoDuration::seconds(100));
        assert_eq!(detail.to, now() + ChronoDuration::seconds(3700));
        assert_eq!(change.device_time, detail.from);
        assert_eq!(change.payload.as_ref().unwrap()["oldDisplayOffset"], 0);

        // identical snapshots collapse
        assert_eq!(snapshots.len(), 1);
        let EventKind::CgmSettings(cgm) = &snapshots[0].kind else {
            panic!("expected cgm settings");
        };
        assert_eq!(cgm.transmitter_id.as_deref(), Some("ABCDE"));
        assert_eq!(cgm.low_alerts.as_ref().map(|a| a.snooze), Some(15 * 60_000));
        assert_eq!(cgm.high_alerts.as_ref().map(|a| a.level), Some(200.0));
    }

    #[tokio::test]
    async fn test_full_session() {
        let (mut driver, _) = dexcom(full_receiver());
        let mut data = session(Period::All);
        let uploader = RecordingUploader::new();
        let mut store = DeltaStore::new();

        let outcome = SessionRunner::run(&mut driver, &mut data, &uploader, &mut store, &mut Progress::silent())
            .await
            .unwrap();
        let SessionOutcome::Uploaded { count, last_end_position } = outcome else {
            panic!("expected upload, got {:?}", outcome);
        };

        let events = uploader.events().await;
        assert_eq!(count, events.len());
        let sessions = uploader.sessions().await;
        assert_eq!(sessions[0].device_id, "DexG4Rec_SM40331934");
        assert_eq!(sessions[0].device_model, "G4Receiver");
        assert_eq!(sessions[0].time_processing, TimeProcessing::UtcBootstrapping);
        assert!(sessions[0].annotations.is_empty());

        let count_of = |name: &str| events.iter().filter(|e| e.type_name() == name).count();
        assert_eq!(count_of("cbg"), 3);
        assert_eq!(count_of("smbg"), 1);
        assert_eq!(count_of("cgmSettings"), 1);
        // one time change, calibration alongside it
        assert_eq!(count_of("deviceEvent"), 2);

        let cbg: Vec<&ClinicalEvent> = events.iter().filter(|e| e.type_name() == "cbg").collect();
        // before the change the display clock ran an hour behind
        assert_eq!(cbg[0].timezone_offset, Some(-60));
        assert_eq!(cbg[1].timezone_offset, Some(0));
        assert!(cbg[1].is_annotated("bg/out-of-range"));
        assert_eq!(cbg[2].kind, EventKind::Cbg(Cbg {
            value: 401.0,
            units: MGDL.to_string(),
            trend: Some("DoubleUp".to_string()),
        }));

        let meter_entry = seconds_at(now()) - 86_400 + 1200;
        assert_eq!(last_end_position, Some(u64::from(meter_entry)));
        assert_eq!(store.last_end_position("DexG4Rec_SM40331934"), last_end_position);
    }

    #[tokio::test]
    async fn test_empty_receiver_is_up_to_date() {
        let (mut driver, _) = dexcom(receiver(Vec::new()));
        let mut data = session(Period::All);
        let uploader = RecordingUploader::new();
        let outcome = SessionRunner::run(
            &mut driver,
            &mut data,
            &uploader,
            &mut DeltaStore::new(),
            &mut Progress::silent(),
        )
        .await
        .unwrap();
        assert_eq!(outcome, SessionOutcome::UpToDate(NoRecordsError::NoRecords));
        assert_eq!(uploader.calls().await, 0);
    }

    #[tokio::test]
    async fn test_wrong_clock_rewrites_display_offset() {
        let mut fake = full_receiver();
        // ten minutes fast
        fake.system_time += 600;
        let (mut driver, log) = dexcom(fake);
        let mut data = session(Period::All);
        data.config.set_device_time = true;

        let mut progress = Progress::silent();
        driver.setup(&mut data, &mut progress).await.unwrap();
        driver.connect(&mut data, &mut progress).await.unwrap();
        // within tolerance: nothing written
        driver.get_config_info(&mut data, &mut progress).await.unwrap();
        let writes = |log: &WriteLog| {
            log.all()
                .iter()
                .filter(|w| w[3] == cmd::WRITE_DISPLAY_TIME_OFFSET)
                .count()
        };
        assert_eq!(writes(&log), 0);

        let mut fake = full_receiver();
        fake.system_time += 3600;
        let (mut driver, log) = dexcom(fake);
        driver.setup(&mut data, &mut progress).await.unwrap();
        driver.connect(&mut data, &mut progress).await.unwrap();
        driver.get_config_info(&mut data, &mut progress).await.unwrap();
        assert_eq!(writes(&log), 1);
        assert_eq!(driver.display_offset, 0);
        assert!(data.annotations.iter().any(|a| a.code == WRONG_DEVICE_TIME));
    }

    #[tokio::test]
    async fn test_nak_is_not_retried() {
        let mut fake = full_receiver();
        fake.nak = Some(cmd::READ_FIRMWARE_HEADER);
        let (mut driver, log) = dexcom(fake);
        let mut data = session(Period::All);
        let mut progress = Progress::silent();
        driver.setup(&mut data, &mut progress).await.unwrap();
        driver.connect(&mut data, &mut progress).await.unwrap();

        let err = driver.get_config_info(&mut data, &mut progress).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::UplinkError::Protocol(ProtocolViolationError::Nak { code: cmd::NAK, .. })
        ));
        // ping, then a single firmware request
        assert_eq!(log.len(), 2);
    }

    #[tokio::test]
    async fn test_delta_session_skips_uploaded_readings() {
        let change = seconds_at(now()) - 86_400;
        let (mut driver, _) = dexcom(full_receiver());
        let mut data = session(Period::Delta);
        let uploader = RecordingUploader::new();
        let mut store = DeltaStore::new();
        store.record("DexG4Rec_SM40331934", u64::from(change + 300));

        SessionRunner::run(&mut driver, &mut data, &uploader, &mut store, &mut Progress::silent())
            .await
            .unwrap();
        let events = uploader.events().await;
        // the 401 reading, the meter entry and its calibration
        assert_eq!(events.len(), 3);
        assert_eq!(store.last_end_position("DexG4Rec_SM40331934"), Some(u64::from(change + 1200)));
    }
}
