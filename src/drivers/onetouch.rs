//! OneTouch UltraMini meters
//!
//! STX-framed commands over a USB-serial cable. The meter acknowledges every
//! command with an empty link packet before it sends the response, and the
//! host acknowledges the response in turn. Records are numbered from the
//! newest; timestamps are local time counted in seconds from 1970.

use chrono::NaiveDateTime;
use log::{debug, info, warn};
use std::time::Duration;

use super::{read_frame, Retry};
use crate::codec::bytes::ByteReader;
use crate::codec::stx::{link, LinkState, StxCodec};
use crate::codec::{FrameCodec, FrameReader, PacketFrame};
use crate::config::{Period, RetryPolicy};
use crate::error::{ProtocolViolationError, Result};
use crate::normalizer::{GlucoseRange, Normalizer, OutOfRange};
use crate::records::{seconds_since, RawRecord};
use crate::session::{
    apply_delta, check_device_time, ClockCheck, DeviceDriver, Progress, SessionData, WRONG_DEVICE_TIME,
};
use crate::transport::Transport;
use crate::types::{format_device_time, format_utc, Annotation, ClinicalEvent, DeviceTag, EventKind, Smbg, MGDL};

/// Command payloads
pub mod cmd {
    pub const READ_SOFTWARE_VERSION: [u8; 3] = [0x05, 0x0D, 0x02];
    pub const READ_SERIAL_NUMBER: [u8; 12] = [0x05, 0x0B, 0x02, 0x00, 0x00, 0x00, 0x00, 0x84, 0x6A, 0xE8, 0x73, 0x00];
    pub const READ_UNIT_SETTINGS: [u8; 8] = [0x05, 0x09, 0x02, 0x09, 0x00, 0x00, 0x00, 0x00];
    pub const READ_RTC: [u8; 7] = [0x05, 0x20, 0x02, 0x00, 0x00, 0x00, 0x00];
    /// Followed by the record number, u16 LE
    pub const READ_RECORD: [u8; 2] = [0x05, 0x1F];
    /// Followed by the new time, i32 LE
    pub const WRITE_RTC: [u8; 3] = [0x05, 0x20, 0x01];
    /// Record number that answers with the record count
    pub const RECORD_COUNT: u16 = 501;
}

/// Glucose the meter stores for a "LO" reading
pub const LO_READING: u32 = 0xFFFE;
/// Glucose the meter stores for a "HI" reading
pub const HI_READING: u32 = 0xFFFF;

const METER_RANGE: GlucoseRange = GlucoseRange::new(20.0, 600.0);

pub const MODEL: &str = "OneTouch UltraMini";

fn meter_time(seconds: u32) -> NaiveDateTime {
    seconds_since(NaiveDateTime::default(), i64::from(seconds))
}

pub fn read_record_command(number: u16) -> Vec<u8> {
    let mut command = cmd::READ_RECORD.to_vec();
    command.extend_from_slice(&number.to_le_bytes());
    command
}

/// Responses start with two bytes echoing the command
fn response_body(payload: &[u8]) -> Result<ByteReader<'_>> {
    let mut reader = ByteReader::new(payload);
    reader.skip(2)?;
    Ok(reader)
}

/// Glucose value in mg/dL, clamped for the meter's LO and HI markers
///
/// mmol/L meters store mg/dL as well.
pub fn glucose_value(raw: u32) -> (f64, Option<Annotation>) {
    let side = match raw {
        LO_READING => OutOfRange::Low,
        HI_READING => OutOfRange::High,
        _ => return (f64::from(raw), None),
    };
    let (value, annotation) = Normalizer::out_of_range(&METER_RANGE, side);
    (value, Some(annotation))
}

fn reading_event(record: &RawRecord<u32>) -> ClinicalEvent {
    let (value, annotation) = glucose_value(record.kind);
    let mut event = ClinicalEvent::new(
        record.device_time,
        EventKind::Smbg(Smbg {
            value,
            units: MGDL.to_string(),
            sub_type: None,
        }),
    )
    .with_index(record.index);
    if let Some(annotation) = annotation {
        event.annotate(annotation);
    }
    event
}

pub struct OneTouchDriver {
    transport: Box<dyn Transport>,
    reader: FrameReader<StxCodec>,
    link: LinkState,
    timeout: Duration,
    retry: RetryPolicy,
    serial_number: String,
    nrecs: u16,
    records: Vec<RawRecord<u32>>,
}

impl OneTouchDriver {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            reader: FrameReader::new(StxCodec::onetouch()),
            link: LinkState::new(),
            timeout: Duration::from_secs(1),
            retry: RetryPolicy::default(),
            serial_number: String::new(),
            nrecs: 0,
            records: Vec::new(),
        }
    }

    async fn send_packet(&mut self, flags: u8, payload: &[u8]) -> Result<()> {
        let packet = self.reader.codec().encode(self.link.control(flags), payload)?;
        self.transport.send(&packet, self.timeout).await?;
        Ok(())
    }

    async fn read_packet(&mut self) -> Result<PacketFrame> {
        read_frame(self.transport.as_mut(), &mut self.reader, self.timeout).await
    }

    /// Command, link acknowledgement, response, host acknowledgement
    async fn try_command(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        self.reader.clear();
        self.send_packet(link::NONE, command).await?;

        let ack = self.read_packet().await?;
        if !self.link.is_valid_ack(&ack) {
            warn!("invalid link acknowledgement {:#04x}", ack.descriptor);
        }
        self.link.toggle_send();

        let response = self.read_packet().await?;
        self.link.toggle_receive();
        self.send_packet(link::ACK, &[]).await?;
        Ok(response.payload)
    }

    async fn command(&mut self, command: &[u8]) -> Result<Vec<u8>> {
        let mut retry = Retry::from_policy(&self.retry);
        loop {
            match self.try_command(command).await {
                Ok(payload) => return Ok(payload),
                Err(e) => retry.after(e).await?,
            }
        }
    }

    /// Restart the link counters; the meter answers with a disconnect
    async fn reset_link(&mut self) -> Result<()> {
        self.reader.clear();
        self.link.reset_for_disconnect();
        self.send_packet(link::DISC, &[]).await?;
        let reply = self.read_packet().await?;
        if reply.descriptor & link::DISC == 0 {
            warn!("disconnect answered with {:#04x}", reply.descriptor);
        }
        Ok(())
    }

    async fn read_software_version(&mut self) -> Result<(String, String)> {
        let payload = self.command(&cmd::READ_SOFTWARE_VERSION).await?;
        let mut reader = ByteReader::new(&payload);
        reader.skip(3)?;
        let version = reader.zstring(9)?;
        let created = reader.zstring(8)?;
        Ok((version.trim().to_string(), created.trim().to_string()))
    }

    async fn read_serial_number(&mut self) -> Result<String> {
        let payload = self.command(&cmd::READ_SERIAL_NUMBER).await?;
        let mut reader = response_body(&payload)?;
        let serial = reader.zstring(reader.remaining())?;
        Ok(serial.trim().to_string())
    }

    async fn read_u16(&mut self, command: &[u8]) -> Result<u16> {
        let payload = self.command(command).await?;
        Ok(response_body(&payload)?.u16_le()?)
    }

    async fn read_rtc(&mut self) -> Result<u32> {
        let payload = self.command(&cmd::READ_RTC).await?;
        Ok(response_body(&payload)?.u32_le()?)
    }

    async fn write_rtc(&mut self, time: NaiveDateTime) -> Result<u32> {
        let seconds = (time - NaiveDateTime::default()).num_seconds();
        let seconds = i32::try_from(seconds).map_err(|_| {
            ProtocolViolationError::InvalidRecord(format!("{} does not fit the meter clock", format_device_time(&time)))
        })?;
        let mut command = cmd::WRITE_RTC.to_vec();
        command.extend_from_slice(&seconds.to_le_bytes());
        let payload = self.command(&command).await?;
        Ok(response_body(&payload)?.u32_le()?)
    }

    async fn read_record(&mut self, number: u16) -> Result<RawRecord<u32>> {
        let payload = self.command(&read_record_command(number)).await?;
        let mut reader = response_body(&payload)?;
        let timestamp = reader.u32_le()?;
        let glucose = reader.u32_le()?;
        Ok(RawRecord::new(u64::from(timestamp), meter_time(timestamp), glucose))
    }
}

#[async_trait::async_trait]
impl DeviceDriver for OneTouchDriver {
    fn name(&self) -> &'static str {
        "OneTouchUltraMini"
    }

    async fn setup(&mut self, data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        self.timeout = Duration::from_millis(data.config.timeouts.onetouch_ms);
        self.retry = data.config.retry;
        progress.report(100.0);
        Ok(())
    }

    async fn connect(&mut self, data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        self.transport.connect(&data.device).await?;
        self.reset_link().await?;
        let (version, created) = self.read_software_version().await?;
        info!("{} software {} ({})", MODEL, version, created);
        data.info.firmware = Some(version);
        progress.report(50.0);
        self.serial_number = self.read_serial_number().await?;
        progress.report(100.0);
        Ok(())
    }

    async fn get_config_info(&mut self, data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        data.info.model = MODEL.to_string();
        data.info.serial_number = self.serial_number.clone();
        data.info.device_id = format!("OneTouchMini{}", self.serial_number);
        data.info.manufacturers = vec!["LifeScan".to_string()];
        data.info.tags = vec![DeviceTag::Bgm];

        self.nrecs = self.read_u16(&read_record_command(cmd::RECORD_COUNT)).await?;
        progress.report(30.0);
        let units = match self.read_u16(&cmd::READ_UNIT_SETTINGS).await? & 0xFF {
            0 => "mg/dL",
            1 => "mmol/L",
            other => {
                return Err(ProtocolViolationError::InvalidRecord(format!("unit setting {}", other)).into());
            }
        };
        info!("{} records, meter shows {}", self.nrecs, units);
        progress.report(60.0);

        let device_time = meter_time(self.read_rtc().await?);
        if let ClockCheck::Write(reference) = check_device_time(data, device_time, true)? {
            data.annotate(Annotation::new(WRONG_DEVICE_TIME));
            let written = self.write_rtc(reference).await?;
            info!("meter clock set to {}", format_device_time(&meter_time(written)));
        }
        progress.report(100.0);
        Ok(())
    }

    async fn fetch_data(&mut self, data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        let position = match data.config.period {
            Period::Delta => data.last_end_position,
            Period::All => None,
        };
        let mut records = Vec::with_capacity(usize::from(self.nrecs));
        for number in 0..self.nrecs {
            let record = self.read_record(number).await?;
            progress.report(100.0 * f64::from(number + 1) / f64::from(self.nrecs));
            // newest first: everything past this was uploaded before
            let seen = position.is_some_and(|position| record.index <= position);
            records.push(record);
            if seen {
                debug!("stopping at record {}, already uploaded", number);
                break;
            }
        }
        info!("read {} of {} records", records.len(), self.nrecs);
        self.records = apply_delta(records, data)?;
        progress.report(100.0);
        Ok(())
    }

    async fn process_data(&mut self, data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        let events: Vec<ClinicalEvent> = self.records.iter().map(reading_event).collect();
        let (mut placed, _) = data.reconcile(events, Vec::new())?;
        placed.sort_by_key(|e| e.time);
        for pair in placed.windows(2) {
            if pair[0].time == pair[1].time {
                if let Some(time) = pair[0].time {
                    debug!("two readings at {}", format_utc(&time));
                }
            }
        }
        data.post_records = placed;
        progress.report(100.0);
        Ok(())
    }

    async fn disconnect(&mut self, _data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        progress.report(100.0);
        Ok(())
    }

    async fn cleanup(&mut self, _data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        self.reader.clear();
        self.records.clear();
        self.transport.disconnect().await?;
        progress.report(100.0);
        Ok(())
    }
}
