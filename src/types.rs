//! Core types for device uploads
//!
//! This module defines the canonical event model produced by every driver,
//! the annotations attached to those events, and the per-upload session
//! metadata handed to the upload adapter.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Device tag for provenance tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceTag {
    Bgm,
    Cgm,
    InsulinPump,
}

impl DeviceTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceTag::Bgm => "bgm",
            DeviceTag::Cgm => "cgm",
            DeviceTag::InsulinPump => "insulin-pump",
        }
    }
}

/// Glucose units as reported on the wire
pub const MGDL: &str = "mg/dL";
pub const MMOLL: &str = "mmol/L";

/// A note attached to an event (or a session) explaining how a value was derived
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

impl Annotation {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            value: None,
            threshold: None,
        }
    }

    /// `bg/out-of-range` with direction and the device threshold that was crossed
    pub fn out_of_range(value: &str, threshold: f64) -> Self {
        Self {
            code: "bg/out-of-range".to_string(),
            value: Some(value.to_string()),
            threshold: Some(threshold),
        }
    }
}

/// Add `annotation` unless one with the same code is already present
pub fn annotate(annotations: &mut Vec<Annotation>, annotation: Annotation) {
    if !annotations.iter().any(|a| a.code == annotation.code) {
        annotations.push(annotation);
    }
}

/// Canonical, platform-ready event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClinicalEvent {
    /// UTC time, filled in by timezone reconciliation
    #[serde(default, with = "utc_millis", skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    /// Device-local time, no offset
    #[serde(with = "device_time")]
    pub device_time: NaiveDateTime,
    /// Minutes east of UTC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone_offset: Option<i32>,
    /// Milliseconds of clock drift absorbed by the offset rounding
    #[serde(default)]
    pub clock_drift_offset: i64,
    /// Milliseconds of non-timezone clock error
    #[serde(default)]
    pub conversion_offset: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device_id: String,
    #[serde(flatten)]
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Device record sequence number; used for offset lookup, stripped before upload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,
}

/// Type-specific part of a clinical event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventKind {
    Smbg(Smbg),
    Cbg(Cbg),
    Bolus(Bolus),
    Basal(Basal),
    Wizard(Wizard),
    DeviceEvent(DeviceEvent),
    PumpSettings(PumpSettings),
    CgmSettings(CgmSettings),
}

impl EventKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::Smbg(_) => "smbg",
            EventKind::Cbg(_) => "cbg",
            EventKind::Bolus(_) => "bolus",
            EventKind::Basal(_) => "basal",
            EventKind::Wizard(_) => "wizard",
            EventKind::DeviceEvent(_) => "deviceEvent",
            EventKind::PumpSettings(_) => "pumpSettings",
            EventKind::CgmSettings(_) => "cgmSettings",
        }
    }
}

/// Fingerstick blood glucose
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Smbg {
    pub value: f64,
    pub units: String,
    /// `manual` or `linked`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_type: Option<String>,
}

/// Continuous glucose reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cbg {
    pub value: f64,
    pub units: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trend: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BolusSubType {
    #[serde(rename = "normal")]
    Normal,
    #[serde(rename = "square")]
    Square,
    #[serde(rename = "dual/square")]
    DualSquare,
}

/// Insulin bolus; volumes in units, durations in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bolus {
    pub sub_type: BolusSubType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normal: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_normal: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_extended: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_duration: Option<i64>,
}

impl Bolus {
    pub fn normal(volume: f64) -> Self {
        Self {
            sub_type: BolusSubType::Normal,
            normal: Some(volume),
            expected_normal: None,
            extended: None,
            expected_extended: None,
            duration: None,
            expected_duration: None,
        }
    }

    pub fn square(extended: f64, duration_ms: i64) -> Self {
        Self {
            sub_type: BolusSubType::Square,
            normal: None,
            expected_normal: None,
            extended: Some(extended),
            expected_extended: None,
            duration: Some(duration_ms),
            expected_duration: None,
        }
    }

    pub fn dual(normal: f64, extended: f64, duration_ms: i64) -> Self {
        Self {
            sub_type: BolusSubType::DualSquare,
            normal: Some(normal),
            expected_normal: None,
            extended: Some(extended),
            expected_extended: None,
            duration: Some(duration_ms),
            expected_duration: None,
        }
    }

    /// True when nothing was delivered and no amendment says otherwise
    pub fn is_zero_volume(&self) -> bool {
        self.normal.unwrap_or(0.0) == 0.0
            && self.extended.unwrap_or(0.0) == 0.0
            && self.expected_normal.is_none()
            && self.expected_extended.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeliveryType {
    Scheduled,
    Temp,
    Suspend,
}

/// The scheduled rate a temp basal or suspend replaced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SuppressedBasal {
    pub delivery_type: DeliveryType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_name: Option<String>,
}

/// Basal delivery segment; rate in units/hour, duration in milliseconds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Basal {
    pub delivery_type: DeliveryType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    /// Programmed duration when delivery ended early
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_duration: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppressed: Option<SuppressedBasal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Box<ClinicalEvent>>,
}

impl Basal {
    pub fn scheduled(rate: f64, schedule_name: Option<String>) -> Self {
        Self {
            delivery_type: DeliveryType::Scheduled,
            rate: Some(rate),
            duration: None,
            expected_duration: None,
            schedule_name,
            percent: None,
            suppressed: None,
            previous: None,
        }
    }

    pub fn temp(rate: f64, duration_ms: i64) -> Self {
        Self {
            delivery_type: DeliveryType::Temp,
            rate: Some(rate),
            duration: Some(duration_ms),
            expected_duration: None,
            schedule_name: None,
            percent: None,
            suppressed: None,
            previous: None,
        }
    }

    pub fn suspend() -> Self {
        Self {
            delivery_type: DeliveryType::Suspend,
            rate: None,
            duration: None,
            expected_duration: None,
            schedule_name: None,
            percent: None,
            suppressed: None,
            previous: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommended {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correction: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BgTarget {
    pub target: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high: Option<f64>,
}

/// Bolus calculator record, optionally linked to the bolus it produced
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wizard {
    pub units: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommended: Option<Recommended>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bg_input: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub carb_input: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insulin_on_board: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insulin_carb_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insulin_sensitivity: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bg_target: Option<BgTarget>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bolus: Option<Box<ClinicalEvent>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeviceEventSubType {
    Status,
    Prime,
    ReservoirChange,
    Calibration,
    TimeChange,
    Alarm,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PumpStatus {
    Suspended,
    Resumed,
}

/// A device clock edit as seen by the device: `from` is the old reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeChangeDetail {
    #[serde(with = "device_time")]
    pub from: NaiveDateTime,
    #[serde(with = "device_time")]
    pub to: NaiveDateTime,
    pub agent: String,
}

/// Pump or meter device event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEvent {
    pub sub_type: DeviceEventSubType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PumpStatus>,
    /// `{"suspended": "manual"}`, `{"resumed": "manual"}` or `"new_pod"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Box<ClinicalEvent>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<TimeChangeDetail>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alarm_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<String>,
}

impl DeviceEvent {
    fn bare(sub_type: DeviceEventSubType) -> Self {
        Self {
            sub_type,
            status: None,
            reason: None,
            duration: None,
            previous: None,
            change: None,
            alarm_type: None,
            value: None,
            units: None,
        }
    }

    pub fn suspend(reason: serde_json::Value) -> Self {
        Self {
            status: Some(PumpStatus::Suspended),
            reason: Some(reason),
            ..Self::bare(DeviceEventSubType::Status)
        }
    }

    pub fn resume(reason: serde_json::Value) -> Self {
        Self {
            status: Some(PumpStatus::Resumed),
            reason: Some(reason),
            ..Self::bare(DeviceEventSubType::Status)
        }
    }

    pub fn time_change(from: NaiveDateTime, to: NaiveDateTime, agent: &str) -> Self {
        Self {
            change: Some(TimeChangeDetail {
                from,
                to,
                agent: agent.to_string(),
            }),
            ..Self::bare(DeviceEventSubType::TimeChange)
        }
    }

    pub fn calibration(value: f64, units: &str) -> Self {
        Self {
            value: Some(value),
            units: Some(units.to_string()),
            ..Self::bare(DeviceEventSubType::Calibration)
        }
    }

    pub fn alarm(alarm_type: &str) -> Self {
        Self {
            alarm_type: Some(alarm_type.to_string()),
            ..Self::bare(DeviceEventSubType::Alarm)
        }
    }

    pub fn reservoir_change() -> Self {
        Self::bare(DeviceEventSubType::ReservoirChange)
    }

    pub fn is_suspend(&self) -> bool {
        self.sub_type == DeviceEventSubType::Status && self.status == Some(PumpStatus::Suspended)
    }

    pub fn is_resume(&self) -> bool {
        self.sub_type == DeviceEventSubType::Status && self.status == Some(PumpStatus::Resumed)
    }
}

/// One segment of a basal schedule; `start` is milliseconds from midnight
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleSegment {
    pub start: i64,
    pub rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingsUnits {
    pub carb: String,
    pub bg: String,
}

/// Pump configuration snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PumpSettings {
    pub active_schedule: String,
    pub basal_schedules: BTreeMap<String, Vec<ScheduleSegment>>,
    pub units: SettingsUnits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insulin_duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bolus: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_basal: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertSetting {
    pub enabled: bool,
    pub level: f64,
    /// Milliseconds
    pub snooze: i64,
}

/// CGM receiver configuration snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CgmSettings {
    pub units: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transmitter_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_alerts: Option<AlertSetting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_alerts: Option<AlertSetting>,
}

impl ClinicalEvent {
    /// Create an event with only its device-local time and kind set
    pub fn new(device_time: NaiveDateTime, kind: EventKind) -> Self {
        Self {
            time: None,
            device_time,
            timezone_offset: None,
            clock_drift_offset: 0,
            conversion_offset: 0,
            device_id: String::new(),
            kind,
            annotations: Vec::new(),
            payload: None,
            index: None,
        }
    }

    pub fn with_index(mut self, index: u64) -> Self {
        self.index = Some(index);
        self
    }

    pub fn with_device_id(mut self, device_id: &str) -> Self {
        self.device_id = device_id.to_string();
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_annotation(mut self, annotation: Annotation) -> Self {
        self.annotate(annotation);
        self
    }

    pub fn annotate(&mut self, annotation: Annotation) {
        annotate(&mut self.annotations, annotation);
    }

    pub fn is_annotated(&self, code: &str) -> bool {
        self.annotations.iter().any(|a| a.code == code)
    }

    pub fn type_name(&self) -> &'static str {
        self.kind.type_name()
    }

    pub fn basal(&self) -> Option<&Basal> {
        match &self.kind {
            EventKind::Basal(b) => Some(b),
            _ => None,
        }
    }

    pub fn basal_mut(&mut self) -> Option<&mut Basal> {
        match &mut self.kind {
            EventKind::Basal(b) => Some(b),
            _ => None,
        }
    }

    pub fn bolus(&self) -> Option<&Bolus> {
        match &self.kind {
            EventKind::Bolus(b) => Some(b),
            _ => None,
        }
    }

    pub fn bolus_mut(&mut self) -> Option<&mut Bolus> {
        match &mut self.kind {
            EventKind::Bolus(b) => Some(b),
            _ => None,
        }
    }

    pub fn device_event(&self) -> Option<&DeviceEvent> {
        match &self.kind {
            EventKind::DeviceEvent(e) => Some(e),
            _ => None,
        }
    }

    pub fn device_event_mut(&mut self) -> Option<&mut DeviceEvent> {
        match &mut self.kind {
            EventKind::DeviceEvent(e) => Some(e),
            _ => None,
        }
    }

    /// Copy of this event suitable for embedding as `previous`: nested links dropped
    pub fn as_previous(&self) -> Box<ClinicalEvent> {
        let mut copy = self.clone();
        match &mut copy.kind {
            EventKind::Basal(b) => b.previous = None,
            EventKind::DeviceEvent(e) => e.previous = None,
            _ => {}
        }
        Box::new(copy)
    }
}

/// Incremental upload bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeltaInfo {
    pub last_end_position: u64,
}

/// How local timestamps were converted to UTC for an upload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeProcessing {
    #[serde(rename = "across-the-board-timezone")]
    AcrossTheBoard,
    #[serde(rename = "utc-bootstrapping")]
    UtcBootstrapping,
}

/// Per-upload metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub upload_id: Uuid,
    pub device_tags: Vec<DeviceTag>,
    pub device_manufacturers: Vec<String>,
    pub device_model: String,
    pub device_serial_number: String,
    pub device_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "device_time_opt")]
    pub device_time: Option<NaiveDateTime>,
    #[serde(with = "utc_millis_required")]
    pub start: DateTime<Utc>,
    pub time_processing: TimeProcessing,
    pub tz_name: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<DeltaInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub annotations: Vec<Annotation>,
}

/// Wire format for `deviceTime`
pub const DEVICE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Format a UTC time the way the platform expects (`2015-04-01T04:00:00.000Z`)
pub fn format_utc(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn format_device_time(time: &NaiveDateTime) -> String {
    time.format(DEVICE_TIME_FORMAT).to_string()
}

pub fn parse_device_time(s: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(s, DEVICE_TIME_FORMAT).ok()
}

mod utc_millis {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<DateTime<Utc>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(t) => s.serialize_str(&super::format_utc(t)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<DateTime<Utc>>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|s| {
            DateTime::parse_from_rfc3339(&s)
                .map(|t| t.with_timezone(&Utc))
                .map_err(serde::de::Error::custom)
        })
        .transpose()
    }
}

mod utc_millis_required {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_utc(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

mod device_time {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_device_time(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        super::parse_device_time(&raw)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid device time: {}", raw)))
    }
}

mod device_time_opt {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<NaiveDateTime>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(t) => s.serialize_str(&super::format_device_time(t)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveDateTime>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|s| {
            super::parse_device_time(&s)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid device time: {}", s)))
        })
        .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};
    use pretty_assertions::assert_eq;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2015, 4, 1)
            .and_then(|d| d.and_hms_opt(h, m, 0))
            .unwrap()
    }

    #[test]
    fn test_smbg_json_shape() {
        let mut event = ClinicalEvent::new(
            at(0, 0),
            EventKind::Smbg(Smbg {
                value: 93.0,
                units: MGDL.to_string(),
                sub_type: None,
            }),
        )
        .with_device_id("Contour7350-5001733");
        event.time = Some(Utc.with_ymd_and_hms(2015, 4, 1, 4, 0, 0).unwrap());
        event.timezone_offset = Some(-240);

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "smbg");
        assert_eq!(json["time"], "2015-04-01T04:00:00.000Z");
        assert_eq!(json["deviceTime"], "2015-04-01T00:00:00");
        assert_eq!(json["timezoneOffset"], -240);
        assert_eq!(json["deviceId"], "Contour7350-5001733");
        assert_eq!(json["value"], 93.0);
        assert!(json.get("annotations").is_none());
    }

    #[test]
    fn test_bolus_and_basal_json_shape() {
        let bolus = ClinicalEvent::new(at(8, 0), EventKind::Bolus(Bolus::dual(1.5, 2.0, 3_600_000)));
        let json = serde_json::to_value(&bolus).unwrap();
        assert_eq!(json["type"], "bolus");
        assert_eq!(json["subType"], "dual/square");
        assert_eq!(json["duration"], 3_600_000);

        let basal = ClinicalEvent::new(
            at(8, 0),
            EventKind::Basal(Basal::scheduled(0.85, Some("Weekday".to_string()))),
        );
        let json = serde_json::to_value(&basal).unwrap();
        assert_eq!(json["type"], "basal");
        assert_eq!(json["deliveryType"], "scheduled");
        assert_eq!(json["scheduleName"], "Weekday");
    }

    #[test]
    fn test_event_roundtrips_through_json() {
        let event = ClinicalEvent::new(
            at(9, 30),
            EventKind::DeviceEvent(DeviceEvent::time_change(at(9, 30), at(10, 30), "manual")),
        )
        .with_index(12);
        let json = serde_json::to_string(&event).unwrap();
        let back: ClinicalEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_annotations_are_deduplicated_by_code() {
        let mut event = ClinicalEvent::new(at(0, 0), EventKind::Basal(Basal::suspend()));
        event.annotate(Annotation::new("basal/unknown-duration"));
        event.annotate(Annotation::new("basal/unknown-duration"));
        event.annotate(Annotation::out_of_range("low", 40.0));
        assert_eq!(event.annotations.len(), 2);
        assert!(event.is_annotated("bg/out-of-range"));
    }

    #[test]
    fn test_zero_volume_bolus() {
        assert!(Bolus::normal(0.0).is_zero_volume());
        let mut cancelled = Bolus::normal(0.0);
        cancelled.expected_normal = Some(2.0);
        assert!(!cancelled.is_zero_volume());
        assert!(!Bolus::normal(0.05).is_zero_volume());
    }

    #[test]
    fn test_as_previous_drops_nested_links() {
        let first = ClinicalEvent::new(at(0, 0), EventKind::Basal(Basal::scheduled(1.0, None)));
        let mut second = ClinicalEvent::new(at(1, 0), EventKind::Basal(Basal::scheduled(0.5, None)));
        if let Some(b) = second.basal_mut() {
            b.previous = Some(first.as_previous());
        }
        let prev = second.as_previous();
        assert!(prev.basal().and_then(|b| b.previous.as_ref()).is_none());
    }

    #[test]
    fn test_session_info_serializes_time_processing() {
        let info = SessionInfo {
            upload_id: Uuid::nil(),
            device_tags: vec![DeviceTag::InsulinPump],
            device_manufacturers: vec!["Insulet".to_string()],
            device_model: "OmniPod".to_string(),
            device_serial_number: "123".to_string(),
            device_id: "InsOmn-123".to_string(),
            device_time: None,
            start: Utc.with_ymd_and_hms(2016, 1, 1, 0, 0, 0).unwrap(),
            time_processing: TimeProcessing::UtcBootstrapping,
            tz_name: "US/Eastern".to_string(),
            version: "0.1.0".to_string(),
            delta: Some(DeltaInfo {
                last_end_position: 41,
            }),
            annotations: Vec::new(),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["timeProcessing"], "utc-bootstrapping");
        assert_eq!(json["deviceTags"][0], "insulin-pump");
        assert_eq!(json["delta"]["lastEndPosition"], 41);
        assert_eq!(json["start"], "2016-01-01T00:00:00.000Z");
    }
}
