//! Bayer Contour Next meters
//!
//! The meter speaks ASTM E1381 over 64-byte HID reports. Once the host has
//! acknowledged its ENQ, the meter sends one record per ACK: a header with
//! model, serial and clock, a patient record, the glucose results and finally
//! the terminator. The whole memory is sent in one pass, so the clock can
//! only be checked (and rewritten) after the transfer.

use chrono::{NaiveDateTime, Timelike};
use log::{debug, info, warn};
use serde_json::json;
use std::collections::HashSet;
use std::time::Duration;
use tokio::time::Instant;

use crate::codec::astm::{self, AstmFrame, AstmMessage, ACK, ENQ, EOT, ETB, ETX, NAK};
use crate::codec::to_hex;
use crate::config::RetryPolicy;
use crate::error::{DeviceTimeError, ProtocolViolationError, Result, UplinkError};
use crate::normalizer::{GlucoseRange, Normalizer, OutOfRange};
use crate::records::{parse_compact_timestamp, RawRecord};
use crate::session::{
    apply_delta, check_device_time, ClockCheck, DeviceDriver, Progress, SessionData, WRONG_DEVICE_TIME,
};
use crate::transport::{timed_out, Transport};
use crate::types::{format_device_time, format_utc, Annotation, ClinicalEvent, DeviceTag, EventKind, Smbg, MGDL};

pub const HID_REPORT_LEN: usize = 64;
const REPORT_HEADER_LEN: usize = 3;
/// Data bytes carried by a full report
const REPORT_DATA_LEN: usize = HID_REPORT_LEN - REPORT_HEADER_LEN - 1;

pub const UNREPORTED_THRESHOLD: &str = "bayer/smbg/unreported-hi-lo-threshold";

/// Marketing name for the model number in the header
pub fn model_name(model: &str) -> Option<&'static str> {
    let number = model.trim_start_matches("Bayer").trim_start_matches("Contour");
    let name = match number {
        "6200" | "6300" => "Contour Next Link",
        "6210" => "Contour Next Link 2.4",
        "7350" | "7900" => "Contour Next",
        "7390" => "Contour USB",
        "7410" => "Contour Next USB",
        "7800" => "Contour Next One",
        "7150" | "7220" => "Contour",
        "7160" => "Contour Next EZ",
        "7600" => "Contour Plus",
        "7950" => "Contour Plus Blue",
        _ => return None,
    };
    Some(name)
}

/// Meters that leave transfer mode without being sent EOT
fn skips_eot(model: &str) -> bool {
    model_name(model) == Some("Contour Next One") || model == "Contour7900"
}

/// Wrap outgoing bytes in a report with a blank header
///
/// The transport prefixes the report ID.
pub fn build_report(data: &[u8]) -> Vec<u8> {
    let mut report = vec![0u8; REPORT_HEADER_LEN];
    report.push(data.len() as u8);
    report.extend_from_slice(data);
    report
}

/// Reassembles one ASTM message from successive reports
#[derive(Debug, Default)]
pub struct ReportAssembler {
    buffer: Vec<u8>,
}

impl ReportAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the data of one report; true once the message is complete
    pub fn push(&mut self, report: &[u8]) -> bool {
        let Some(&declared) = report.get(REPORT_HEADER_LEN) else {
            return false;
        };
        let data = &report[REPORT_HEADER_LEN + 1..];
        let data = &data[..usize::from(declared).min(data.len())];
        if data.is_empty() {
            return false;
        }
        self.buffer.extend_from_slice(data);

        let terminator = data.len().checked_sub(5).map(|i| data[i]);
        data.len() < REPORT_DATA_LEN
            || matches!(data[0], ENQ | EOT | ACK)
            || matches!(terminator, Some(ETX | ETB))
    }

    pub fn take(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// `7358-1611135` → `1611135`, `7830H5001733` → `5001733`
pub fn serial_number(raw: &str) -> Option<String> {
    let digits = raw.bytes().take_while(u8::is_ascii_digit).count();
    let separator = raw[digits..].chars().next()?;
    if digits == 0 || !(separator.is_ascii_alphanumeric() || separator == '_' || separator == '-') {
        return None;
    }
    let serial: String = raw[digits + 1..]
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
        .collect();
    (!serial.is_empty()).then_some(serial)
}

/// Meter range from the `V=` setting, always in mg/dL
///
/// `V=20600` is 20 to 600. Meters set to mmol/L (`U=1`) report tenths of
/// mmol/L.
fn reported_range(settings: &str) -> Option<GlucoseRange> {
    let mut mmol = false;
    for setting in settings.split('^') {
        let Some((key, value)) = setting.split_once('=') else {
            continue;
        };
        match key {
            "U" => mmol = value.starts_with('1'),
            "V" => {
                let low: u16 = value.get(0..2)?.parse().ok()?;
                let high: u16 = value.get(2..5)?.parse().ok()?;
                let (low, high) = (f64::from(low), f64::from(high));
                return Some(if mmol {
                    GlucoseRange::new(
                        Normalizer::mmoll_to_mgdl(low / 10.0).round(),
                        Normalizer::mmoll_to_mgdl(high / 10.0).round(),
                    )
                } else {
                    GlucoseRange::new(low, high)
                });
            }
            _ => {}
        }
    }
    None
}

/// `YYYYMMDDhhmmss`, seconds optional
fn parse_header_time(raw: &str) -> Option<NaiveDateTime> {
    let time = parse_compact_timestamp(raw)?;
    match raw.get(12..14).and_then(|s| s.parse::<u32>().ok()) {
        Some(seconds) => time.with_second(seconds),
        None => Some(time),
    }
}

/// The `H` record
#[derive(Debug, Clone, PartialEq)]
pub struct MeterHeader {
    /// Model number as sent, e.g. `Bayer7350`
    pub model: String,
    pub firmware: Option<String>,
    pub serial_number: String,
    pub nrecs: u32,
    pub device_time: NaiveDateTime,
    pub range: GlucoseRange,
    /// The meter did not say where its range ends; the defaults are used
    pub unreported_threshold: bool,
}

impl MeterHeader {
    /// `H|\^&||pw|model^version^serial^...|settings|nrecs|||||P|1|timestamp`
    pub fn parse(text: &str) -> Result<Self> {
        let invalid = |what: &str| ProtocolViolationError::InvalidRecord(format!("header {}: {}", what, text));
        let fields: Vec<&str> = text.split('|').collect();
        let sender: Vec<&str> = fields
            .get(4)
            .ok_or_else(|| invalid("has no sender field"))?
            .split('^')
            .collect();
        let serial_number = sender
            .get(2)
            .and_then(|s| serial_number(s))
            .ok_or_else(|| invalid("has no serial number"))?;
        let device_time = fields
            .get(13)
            .and_then(|s| parse_header_time(s))
            .ok_or_else(|| invalid("has no valid timestamp"))?;
        let range = fields.get(5).and_then(|s| reported_range(s));

        Ok(Self {
            model: sender[0].to_string(),
            firmware: sender.get(1).filter(|s| !s.is_empty()).map(|s| s.to_string()),
            serial_number,
            nrecs: fields.get(6).and_then(|s| s.parse().ok()).unwrap_or(0),
            device_time,
            range: range.unwrap_or_default(),
            unreported_threshold: range.is_none(),
        })
    }

    pub fn device_id(&self) -> String {
        format!("{}-{}", self.model, self.serial_number)
    }
}

/// One glucose result
#[derive(Debug, Clone, PartialEq)]
pub struct MeterResult {
    pub value: f64,
    pub units: String,
    /// Slash-separated markers, e.g. `>/B/T1`
    pub flags: String,
}

impl MeterResult {
    /// `R|seq|^^^Glucose|value|units^method||flags||YYYYMMDDhhmm`
    ///
    /// `None` for results that are not glucose readings.
    pub fn parse(text: &str) -> Option<RawRecord<MeterResult>> {
        let fields: Vec<&str> = text.split('|').collect();
        if fields.first() != Some(&"R") || fields.get(2) != Some(&"^^^Glucose") {
            return None;
        }
        let sequence: u64 = fields.get(1)?.parse().ok()?;
        let value = fields.get(3)?;
        if value.is_empty() || !value.chars().all(|c| c.is_ascii_digit() || c == '.') {
            return None;
        }
        let units = fields.get(4)?.split('^').next()?;
        if !units.contains('/') {
            return None;
        }
        let time = parse_compact_timestamp(fields.get(8)?)?;
        Some(RawRecord::new(
            sequence,
            time,
            MeterResult {
                value: value.parse().ok()?,
                units: units.to_string(),
                flags: fields.get(6).copied().unwrap_or_default().to_string(),
            },
        ))
    }

    /// Control solution tests are never uploaded
    pub fn is_control(&self) -> bool {
        self.flags.contains('C')
    }

    pub fn out_of_range(&self) -> Option<OutOfRange> {
        if self.flags.contains('>') {
            Some(OutOfRange::High)
        } else if self.flags.contains('<') {
            Some(OutOfRange::Low)
        } else {
            None
        }
    }

    pub fn marks(&self) -> Vec<&'static str> {
        self.flags
            .split('/')
            .filter_map(|flag| match flag {
                "B" => Some("pre-meal"),
                "A" => Some("post-meal"),
                "D" => Some("logbook"),
                _ => None,
            })
            .collect()
    }
}

/// What one pull from the meter produced
#[derive(Debug, Clone, PartialEq)]
pub enum MeterRecord {
    Header(MeterHeader),
    Result(RawRecord<MeterResult>),
    /// `L`: the transfer is complete
    Terminator,
    EndOfTransmission,
    /// Patient records, non-glucose results and stray control bytes
    Other(char),
}

impl MeterRecord {
    fn parse(frame: &AstmFrame) -> Result<Self> {
        Ok(match frame.record_type() {
            Some('H') => MeterRecord::Header(MeterHeader::parse(&frame.text)?),
            Some('R') => MeterResult::parse(&frame.text).map_or(MeterRecord::Other('R'), MeterRecord::Result),
            Some('L') => MeterRecord::Terminator,
            Some(other) => MeterRecord::Other(other),
            None => MeterRecord::Other('?'),
        })
    }
}

fn describe(message: &AstmMessage) -> String {
    match message {
        AstmMessage::Control(ACK) => "ACK".to_string(),
        AstmMessage::Control(NAK) => "NAK".to_string(),
        AstmMessage::Control(ENQ) => "ENQ".to_string(),
        AstmMessage::Control(EOT) => "EOT".to_string(),
        AstmMessage::Control(byte) => format!("{:#04x}", byte),
        AstmMessage::Frame(frame) => format!("{} record", frame.record_type().unwrap_or('?')),
    }
}

fn unexpected(expected: &str, actual: &AstmMessage) -> UplinkError {
    ProtocolViolationError::UnexpectedResponse {
        expected: expected.to_string(),
        actual: describe(actual),
    }
    .into()
}

fn result_event(record: RawRecord<MeterResult>, header: &MeterHeader) -> Option<ClinicalEvent> {
    let result = &record.kind;
    if result.is_control() {
        debug!("discarding control test #{}", record.index);
        return None;
    }
    let (value, units, out_of_range) = match result.out_of_range() {
        Some(side) => {
            let (value, annotation) = Normalizer::out_of_range(&header.range, side);
            (value, MGDL, Some(annotation))
        }
        None => (result.value, Normalizer::canonical_units(&result.units), None),
    };

    let mut payload = json!({ "flags": result.flags });
    let marks = result.marks();
    if !marks.is_empty() {
        payload["marks"] = json!(marks);
    }
    let mut event = ClinicalEvent::new(
        record.device_time,
        EventKind::Smbg(Smbg {
            value,
            units: units.to_string(),
            sub_type: None,
        }),
    )
    .with_index(record.index)
    .with_payload(payload);

    if let Some(annotation) = out_of_range {
        if header.unreported_threshold {
            event.annotate(Annotation::new(UNREPORTED_THRESHOLD));
        }
        event.annotate(annotation);
    }
    Some(event)
}

pub struct BayerDriver {
    transport: Box<dyn Transport>,
    assembler: ReportAssembler,
    timeout: Duration,
    retry: RetryPolicy,
    header: Option<MeterHeader>,
    results: Vec<RawRecord<MeterResult>>,
}

impl BayerDriver {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            assembler: ReportAssembler::new(),
            timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            header: None,
            results: Vec::new(),
        }
    }

    /// Send `bytes` in one report and read back a whole message
    async fn exchange(&mut self, bytes: &[u8]) -> Result<AstmMessage> {
        self.transport.flush().await?;
        self.assembler.clear();
        self.transport.send(&build_report(bytes), self.timeout).await?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(timed_out(self.timeout).into());
            }
            let report = self.transport.receive(remaining).await?;
            if self.assembler.push(&report) {
                break;
            }
        }
        let message = self.assembler.take();
        debug!("message {}", to_hex(&message));
        Ok(astm::parse_message(&message)?)
    }

    /// ACK the previous record and read the next one
    ///
    /// A frame that fails its checksum is NAKed so the meter sends it again.
    async fn next_record(&mut self) -> Result<MeterRecord> {
        let attempts = self.retry.frame_attempts.max(1);
        let mut reply = ACK;
        let mut failures = 0;
        let mut enquiries = 0;
        loop {
            match self.exchange(&[reply]).await {
                Ok(AstmMessage::Control(ENQ)) => {
                    enquiries += 1;
                    if enquiries > attempts {
                        return Err(unexpected("record", &AstmMessage::Control(ENQ)));
                    }
                    debug!("ENQ received, sending ACK");
                    reply = ACK;
                }
                Ok(AstmMessage::Control(EOT)) => return Ok(MeterRecord::EndOfTransmission),
                Ok(AstmMessage::Control(byte)) => return Ok(MeterRecord::Other(char::from(byte))),
                Ok(AstmMessage::Frame(frame)) => return MeterRecord::parse(&frame),
                Err(UplinkError::Frame(e)) => {
                    failures += 1;
                    if failures >= attempts {
                        warn!("giving up after {} bad frames: {}", failures, e);
                        return Err(e.into());
                    }
                    warn!("bad frame ({}), sending NAK", e);
                    reply = NAK;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn expect_ack(&mut self, bytes: &[u8], step: &str) -> Result<()> {
        match self.exchange(bytes).await? {
            AstmMessage::Control(ACK) => Ok(()),
            other => Err(unexpected(&format!("ACK to {}", step), &other)),
        }
    }

    /// NAK until the meter leaves transfer mode
    async fn await_eot(&mut self) -> Result<()> {
        let attempts = self.retry.frame_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.exchange(&[NAK]).await {
                Ok(AstmMessage::Control(EOT)) => return Ok(()),
                Ok(other) => {
                    debug!("waiting for EOT, got {}", describe(&other));
                    last_error = None;
                }
                Err(e) if e.is_transient() || matches!(e, UplinkError::Frame(_)) => {
                    debug!("waiting for EOT: {}", e);
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
            if attempt < attempts {
                tokio::time::sleep(self.retry.backoff()).await;
            }
        }
        // a meter that keeps talking without ending the transfer is out of protocol
        Err(last_error.unwrap_or_else(|| ProtocolViolationError::RetryLimitReached { attempts }.into()))
    }

    /// Write `time` to the meter clock
    async fn set_date_time(&mut self, model: &str, time: NaiveDateTime) -> Result<()> {
        // not every meter answers this one
        self.transport.send(&build_report(&[ACK]), self.timeout).await?;
        if !skips_eot(model) {
            self.exchange(&[EOT]).await?;
        }
        self.await_eot().await?;
        self.expect_ack(&[ENQ], "ENQ").await?;

        self.expect_ack(b"W|", "WRITE").await?;
        self.expect_ack(b"D|", "DATE").await?;
        let date = format!("{}\r", time.format("%y%m%d|"));
        match self.exchange(date.as_bytes()).await? {
            AstmMessage::Control(ACK) => {}
            AstmMessage::Control(NAK) if model_name(model).is_some_and(|m| m.contains("Next Link")) => {
                info!("{} takes its clock from the pump", model);
                return Err(DeviceTimeError::SetByPump.into());
            }
            AstmMessage::Control(NAK) => return Err(DeviceTimeError::WriteRejected.into()),
            other => return Err(unexpected("ACK to SETDATE", &other)),
        }

        self.expect_ack(b"W|", "WRITE").await?;
        self.expect_ack(b"T|", "TIME").await?;
        let clock = format!("{}\r", time.format("%H%M|"));
        self.expect_ack(clock.as_bytes(), "SETTIME").await?;
        info!("meter clock set to {}", format_device_time(&time));
        Ok(())
    }

    fn header(&self) -> Result<&MeterHeader> {
        self.header
            .as_ref()
            .ok_or_else(|| ProtocolViolationError::InvalidRecord("no header record read".to_string()).into())
    }
}

#[async_trait::async_trait]
impl DeviceDriver for BayerDriver {
    fn name(&self) -> &'static str {
        "BayerContourNext"
    }

    async fn setup(&mut self, data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        self.timeout = Duration::from_millis(data.config.timeouts.bayer_ms);
        self.retry = data.config.retry;
        progress.report(100.0);
        Ok(())
    }

    async fn connect(&mut self, data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        self.transport.connect(&data.device).await?;
        progress.report(100.0);
        Ok(())
    }

    async fn get_config_info(&mut self, data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        let attempts = self.retry.frame_attempts.max(1);
        let mut header = None;
        for _ in 0..attempts {
            match self.next_record().await? {
                MeterRecord::Header(found) => {
                    header = Some(found);
                    break;
                }
                MeterRecord::EndOfTransmission => {
                    return Err(unexpected("header record", &AstmMessage::Control(EOT)));
                }
                other => debug!("skipping {:?} before the header", other),
            }
        }
        let header = header.ok_or_else(|| ProtocolViolationError::InvalidRecord("meter sent no header".to_string()))?;

        let name = model_name(&header.model).unwrap_or("Unknown Bayer model");
        info!(
            "found {} ({}), serial {}, {} records",
            name, header.model, header.serial_number, header.nrecs
        );
        data.info.model = name.to_string();
        data.info.firmware = header.firmware.clone();
        data.info.serial_number = header.serial_number.clone();
        data.info.device_id = header.device_id();
        data.info.device_time = Some(header.device_time);
        data.info.manufacturers = vec!["Bayer".to_string(), "Ascensia".to_string()];
        data.info.tags = vec![DeviceTag::Bgm];
        self.header = Some(header);
        progress.report(100.0);
        Ok(())
    }

    async fn fetch_data(&mut self, data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        let (model, nrecs, device_time) = {
            let header = self.header()?;
            (header.model.clone(), header.nrecs, header.device_time)
        };

        let mut results = Vec::new();
        loop {
            match self.next_record().await? {
                MeterRecord::Result(record) => {
                    if nrecs > 0 {
                        progress.report(100.0 * record.index as f64 / f64::from(nrecs));
                    }
                    results.push(record);
                }
                MeterRecord::Terminator | MeterRecord::EndOfTransmission => break,
                MeterRecord::Header(_) => warn!("ignoring a second header record"),
                MeterRecord::Other(kind) => debug!("skipping {} record", kind),
            }
        }
        info!("read {} glucose results", results.len());

        // checked here and not in get_config_info: the meter takes the date
        // command only after the record transfer has ended
        if let ClockCheck::Write(reference) = check_device_time(data, device_time, true)? {
            data.annotate(Annotation::new(WRONG_DEVICE_TIME));
            self.set_date_time(&model, reference).await?;
        }

        self.results = apply_delta(results, data)?;
        progress.report(100.0);
        Ok(())
    }

    async fn process_data(&mut self, data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        let header = self.header()?.clone();
        let events: Vec<ClinicalEvent> = std::mem::take(&mut self.results)
            .into_iter()
            .filter_map(|record| result_event(record, &header))
            .collect();
        progress.report(50.0);

        let (mut placed, _) = data.reconcile(events, Vec::new())?;
        let mut seen = HashSet::new();
        for event in &placed {
            if let Some(time) = event.time.filter(|time| !seen.insert(*time)) {
                warn!("two readings at {} on {}", format_utc(&time), event.device_id);
            }
        }
        placed.sort_by_key(|e| e.time);
        data.post_records = placed;
        progress.report(100.0);
        Ok(())
    }

    async fn disconnect(&mut self, _data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        if self.transport.is_connected() {
            // a final ACK releases the meter's pending read
            let ack = build_report(&[ACK]);
            if let Err(e) = self.transport.send(&ack, self.timeout).await {
                debug!("final ACK not sent: {}", e);
            }
        }
        self.transport.disconnect().await?;
        progress.report(100.0);
        Ok(())
    }

    async fn cleanup(&mut self, _data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        self.assembler.clear();
        self.results.clear();
        progress.report(100.0);
        Ok(())
    }
}
