//! Insulet OmniPod PDMs
//!
//! The PDM mounts as storage and exposes its memory as a single `.ibf` file:
//! a run of fixed records (versions, basal program names, EEPROM settings,
//! profiles, log header) followed by the log records. Only history log
//! records are decoded. Volumes and rates are stored in hundredths of a unit.
//!
//! Pump history is a list of actions, so events go through the
//! [`Simulator`] to become basal segments, paired suspends and resumes and
//! amended boluses.

use chrono::{Datelike, NaiveDateTime};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use crate::codec::ibf::IbfRecords;
use crate::codec::ByteReader;
use crate::error::{ProtocolViolationError, Result};
use crate::normalizer::{fix_floating_point, hundredths, GlucoseRange, Normalizer, OutOfRange};
use crate::records::{build_device_time, RawRecord};
use crate::session::{apply_delta, check_device_time, DeviceDriver, Progress, SessionData};
use crate::simulator::{Simulator, Termination};
use crate::transport::Transport;
use crate::types::{
    format_device_time, Basal, BgTarget, Bolus, ClinicalEvent, DeliveryType, DeviceEvent, DeviceEventSubType,
    DeviceTag, EventKind, PumpSettings, Recommended, ScheduleSegment, SettingsUnits, Smbg, SuppressedBasal,
    Wizard, MGDL,
};

/// History record types
pub mod rectype {
    pub const DEACTIVATE: u32 = 0x0001;
    pub const TIME_CHANGE: u32 = 0x0002;
    pub const BOLUS: u32 = 0x0004;
    pub const BASAL_RATE: u32 = 0x0008;
    pub const SUSPEND: u32 = 0x0010;
    pub const DATE_CHANGE: u32 = 0x0020;
    pub const SUGGESTED_CALC: u32 = 0x0040;
    pub const REMOTE_HAZARD_ALARM: u32 = 0x0080;
    pub const ALARM: u32 = 0x0400;
    pub const BLOOD_GLUCOSE: u32 = 0x0800;
    pub const TERMINATE_BOLUS: u32 = 0x2000;
    pub const ACTIVATE: u32 = 0x8000;
    pub const RESUME: u32 = 0x10000;
    pub const OCCLUSION: u32 = 0x40000;
    /// Set on records the PDM has deleted
    pub const DELETED: u32 = 0x8000_0000;
}

mod bg_flag {
    pub const MANUAL: u8 = 0x01;
    pub const TEMPERATURE: u8 = 0x02;
    pub const RANGE_LOW: u8 = 0x10;
    pub const RANGE_HIGH: u8 = 0x20;
    pub const OTHER_ERROR: u8 = 0x40;
}

const HISTORY_LOG: u8 = 0x03;
pub const HISTORY_HEADER_LEN: usize = 29;
const PROFILE_COUNT: usize = 11;
const PROFILE_STEPS: usize = 48;
const BASAL_PROGRAM_SLOTS: usize = 7;
/// Profile index of the first basal program
const FIRST_BASAL_PROFILE: u8 = 15;
const HALF_HOUR_MS: i64 = 30 * 60_000;

/// The PDM resets its clock to 2007 (Eros) or late 2015 (Dash) after some
/// faults; changes away from those dates are not real clock edits
const CLOCK_RESET_YEAR: i32 = 2015;
/// Remote hazard alarms dated up to this year mark a PDM shutdown
const SHUTDOWN_YEAR: i32 = 2016;

/// Build a `ProtocolViolationError::Incompatible` for a fixed record
fn incompatible(record: &str) -> ProtocolViolationError {
    ProtocolViolationError::Incompatible(format!("{} record is incompatible with this driver", record))
}

#[derive(Debug, Clone, PartialEq)]
pub struct IbfVersion {
    pub ibf: [u16; 3],
    pub engine: [u16; 3],
    pub vendor: String,
    pub product: String,
}

impl IbfVersion {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        let ibf = [r.u16_be()?, r.u16_be()?, r.u16_be()?];
        let engine = [r.u16_be()?, r.u16_be()?, r.u16_be()?];
        Ok(Self {
            ibf,
            engine,
            vendor: r.zstring(8)?,
            product: r.zstring(8)?,
        })
    }

    pub fn check(&self) -> Result<()> {
        let compatible = self.ibf[0] == 0
            && self.ibf[1] >= 1
            && self.engine[0] == 0
            && self.vendor == "Insulet"
            && self.product == "OmniPod";
        if compatible {
            Ok(())
        } else {
            Err(incompatible("ibf_version").into())
        }
    }

    /// `InsOmn`, the prefix of the device id
    pub fn id_prefix(&self) -> String {
        let head = |s: &str| s.chars().take(3).collect::<String>();
        format!("{}{}", head(&self.vendor), head(&self.product))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PdmVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl PdmVersion {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        Ok(Self {
            major: r.u16_be()?,
            minor: r.u16_be()?,
            patch: r.u16_be()?,
        })
    }

    /// Eros from 2.3, Dash 3.0
    pub fn check(&self) -> Result<()> {
        match (self.major, self.minor) {
            (2, minor) if minor >= 3 => Ok(()),
            (3, 0) => Ok(()),
            _ => Err(incompatible("pdm_version").into()),
        }
    }

    pub fn is_dash(&self) -> bool {
        self.major >= 3
    }

    pub fn model(&self) -> &'static str {
        if self.is_dash() {
            "Dash"
        } else {
            "Eros"
        }
    }
}

/// User names of the seven basal program slots
#[derive(Debug, Clone, PartialEq)]
pub struct BasalPrograms {
    pub enabled: usize,
    pub names: Vec<String>,
}

impl BasalPrograms {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        let _count = r.u16_be()?;
        let enabled = usize::from(r.u16_be()?);
        let name_size = usize::from(r.u16_be()?);
        let mut names = Vec::with_capacity(BASAL_PROGRAM_SLOTS);
        for _ in 0..BASAL_PROGRAM_SLOTS {
            let _index = r.u16_be()?;
            let name = r.zstring(name_size)?;
            names.push(name.replace('.', "-").replace('$', ""));
        }
        Ok(Self { enabled, names })
    }

    pub fn active(&self) -> Option<&str> {
        self.names
            .get(self.enabled)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }
}

/// The EEPROM settings the uploader needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EepromSettings {
    pub bolus_increment: u32,
    pub bolus_max: u32,
    pub basal_max: u32,
    pub remote_id: u32,
    pub temp_basal_type: u8,
    pub extended_bolus_type: u8,
    pub bolus_calcs: u8,
    pub bg_display: u8,
    /// Half hours
    pub insulin_duration: u8,
    pub pdm_config: u32,
}

impl EepromSettings {
    pub const LEN: usize = 114;

    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        r.skip(13)?;
        let bolus_increment = r.u32_le()?;
        let bolus_max = r.u32_le()?;
        let basal_max = r.u32_le()?;
        // low volume, auto-off, language and the alert settings
        r.skip(28)?;
        let remote_id = r.u32_le()?;
        r.skip(19)?;
        let temp_basal_type = r.u8()?;
        let extended_bolus_type = r.u8()?;
        r.skip(1)?;
        let bolus_calcs = r.u8()?;
        r.skip(1)?;
        let bg_display = r.u8()?;
        // sound and the three glucose goals
        r.skip(7)?;
        let insulin_duration = r.u8()?;
        r.skip(20)?;
        let pdm_config = r.u32_le()?;
        Ok(Self {
            bolus_increment,
            bolus_max,
            basal_max,
            remote_id,
            temp_basal_type,
            extended_bolus_type,
            bolus_calcs,
            bg_display,
            insulin_duration,
            pdm_config,
        })
    }

    pub fn serial_number(&self, dash: bool) -> String {
        if dash {
            decode_serial(self.remote_id)
        } else {
            self.remote_id.to_string()
        }
    }

    pub fn bg_units(&self) -> &'static str {
        if self.bg_display == 0 {
            "mg/dL"
        } else {
            "mmol/L"
        }
    }

    /// Highest reading the built-in meter reports
    pub fn meter_highest(&self) -> f64 {
        match (self.pdm_config & 0x3C0) >> 6 {
            // Abbott FreeStyle
            0 => 500.0,
            _ => 600.0,
        }
    }
}

/// Dash PDMs pack their serial number into the remote id
pub fn decode_serial(encoded: u32) -> String {
    let family = (encoded & 0x7E00_0000) >> 25;
    let year = (encoded & 0x01E0_0000) >> 21;
    let reset = (encoded & 0x001E_0000) >> 17;
    let sequence = (encoded & 0x0001_FFFC) >> 2;
    format!("{:02}{:02}{:02}-{:05}", family, year, reset, sequence)
}

/// One of the eleven half-hourly profiles
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    pub index: u8,
    pub steps: Vec<i32>,
}

impl Profile {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        let index = r.u8()?;
        r.skip(6)?;
        let _error_code = r.u16_be()?;
        let _operation_time = r.u32_le()?;
        let steps = (0..PROFILE_STEPS).map(|_| r.i32_le()).collect::<std::result::Result<_, _>>()?;
        Ok(Self { index, steps })
    }

    /// Slot in the basal program names, for basal profiles
    pub fn basal_slot(&self) -> Option<usize> {
        let slot = self.index.checked_sub(FIRST_BASAL_PROFILE)?;
        let slot = usize::from(slot);
        (slot < BASAL_PROGRAM_SLOTS).then_some(slot)
    }

    /// Rate changes of a basal profile, one segment per change
    pub fn schedule(&self) -> Vec<ScheduleSegment> {
        let mut segments: Vec<ScheduleSegment> = Vec::new();
        for (i, step) in self.steps.iter().enumerate() {
            let rate = hundredths(*step);
            if segments.last().map_or(true, |s| s.rate != rate) {
                segments.push(ScheduleSegment {
                    start: i as i64 * HALF_HOUR_MS,
                    rate,
                });
            }
        }
        segments
    }
}

/// Clock reading at the time the file was written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogHeader {
    pub device_time: Option<NaiveDateTime>,
    pub descriptions: u16,
}

impl LogHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        // five revision bytes
        r.skip(5)?;
        let day = r.u8()?;
        let month = r.u8()?;
        let year = r.u16_be()?;
        let second = r.u8()?;
        let minute = r.u8()?;
        let hour = r.u8()?;
        r.skip(1)?;
        let descriptions = r.u16_be()?;
        Ok(Self {
            device_time: build_device_time(
                i32::from(year),
                u32::from(month),
                u32::from(day),
                u32::from(hour),
                u32::from(minute),
                u32::from(second),
            ),
            descriptions,
        })
    }
}

/// The fixed records at the start of the file
#[derive(Debug, Clone, PartialEq)]
pub struct PdmFile {
    pub ibf: IbfVersion,
    pub pdm: PdmVersion,
    pub programs: BasalPrograms,
    pub eeprom: EepromSettings,
    pub profiles: Vec<Profile>,
    pub log: LogHeader,
    /// Byte offset of the first log record
    pub log_offset: usize,
}

impl PdmFile {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let mut records = IbfRecords::new(bytes);
        let ibf = IbfVersion::parse(&records.expect_record("ibf_version")?)?;
        ibf.check()?;
        let pdm = PdmVersion::parse(&records.expect_record("pdm_version")?)?;
        pdm.check()?;
        let mfg = records.expect_record("mfg_data")?;
        debug!("manufacturing data: {}", String::from_utf8_lossy(&mfg).trim_end_matches('\0'));
        let programs = BasalPrograms::parse(&records.expect_record("basal_programs")?)?;
        let eeprom = EepromSettings::parse(&records.expect_record("eeprom_settings")?)?;
        let mut profiles = Vec::with_capacity(PROFILE_COUNT);
        for _ in 0..PROFILE_COUNT {
            profiles.push(Profile::parse(&records.expect_record("profile")?)?);
        }
        let log = LogHeader::parse(&records.expect_record("log_header")?)?;
        Ok(Self {
            ibf,
            pdm,
            programs,
            eeprom,
            profiles,
            log,
            log_offset: records.offset(),
        })
    }

    pub fn serial_number(&self) -> String {
        self.eeprom.serial_number(self.pdm.is_dash())
    }

    pub fn device_id(&self) -> String {
        format!("{}-{}", self.ibf.id_prefix(), self.serial_number())
    }

    /// Named basal programs with their schedules
    pub fn basal_schedules(&self) -> BTreeMap<String, Vec<ScheduleSegment>> {
        self.profiles
            .iter()
            .filter_map(|profile| {
                let name = self.programs.names.get(profile.basal_slot()?)?;
                (!name.is_empty()).then(|| (name.clone(), profile.schedule()))
            })
            .collect()
    }

    pub fn pump_settings(&self) -> PumpSettings {
        PumpSettings {
            active_schedule: self.programs.active().unwrap_or_default().to_string(),
            basal_schedules: self.basal_schedules(),
            // values are in mg/dL whatever the display shows
            units: SettingsUnits {
                carb: "grams".to_string(),
                bg: MGDL.to_string(),
            },
            insulin_duration_ms: Some(i64::from(self.eeprom.insulin_duration) * HALF_HOUR_MS),
            max_bolus: Some(hundredths(self.eeprom.bolus_max)),
            max_basal: Some(hundredths(self.eeprom.basal_max)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BolusDetail {
    pub volume: f64,
    /// `None` for a bolus with no extended part
    pub extended_ms: Option<i64>,
    /// Records from this one to its calculator record, 0 for a quick bolus
    pub calc_offset: u16,
    pub immediate_ms: i64,
}

/// A bolus calculator record; insulin in units, glucose in mg/dL
///
/// Ratio, sensitivity and carb fields are raw; Dash PDMs store them scaled.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CalculatorDetail {
    pub correction_delivered: f64,
    pub carb_bolus_delivered: f64,
    pub correction_programmed: f64,
    pub carb_bolus_programmed: f64,
    /// Negative when BG is below target
    pub correction_suggested: f64,
    pub carb_bolus_suggested: f64,
    pub correction_iob: f64,
    pub meal_iob: f64,
    pub correction_factor: u16,
    /// `None` when no BG was entered
    pub current_bg: Option<u16>,
    pub target_bg: u16,
    pub bg_correction_threshold: u16,
    /// `None` when no carbs were entered
    pub carb_grams: Option<u16>,
    pub ic_ratio: u16,
}

impl CalculatorDetail {
    const NOT_ENTERED: u16 = 0xFFFF;

    fn parse(r: &mut ByteReader<'_>) -> Result<Self> {
        let entered = |v: u16| (v != Self::NOT_ENTERED).then_some(v);
        Ok(Self {
            correction_delivered: hundredths(r.u32_le()?),
            carb_bolus_delivered: hundredths(r.u32_le()?),
            correction_programmed: hundredths(r.u32_le()?),
            carb_bolus_programmed: hundredths(r.u32_le()?),
            correction_suggested: fix_floating_point(f64::from(r.i32_le()?) / 100.0, 2),
            carb_bolus_suggested: hundredths(r.u32_le()?),
            correction_iob: hundredths(r.u32_le()?),
            meal_iob: hundredths(r.u32_le()?),
            correction_factor: r.u16_le()?,
            current_bg: entered(r.u16_le()?),
            target_bg: r.u16_le()?,
            bg_correction_threshold: r.u16_le()?,
            carb_grams: entered(r.u16_le()?),
            ic_ratio: r.u16_le()?,
        })
    }

    /// Net dose the calculator recommended, never below zero
    ///
    /// IOB and the correction only count when a BG was entered.
    pub fn net_recommendation(&self) -> f64 {
        let mut total = self.carb_bolus_suggested;
        if self.current_bg.is_some() {
            if self.meal_iob < self.correction_suggested {
                total += self.correction_suggested - self.meal_iob;
            } else if self.correction_suggested < 0.0 {
                total += self.correction_suggested;
            }
            total -= self.correction_iob;
        }
        fix_floating_point(total, 2).max(0.0)
    }
}

/// Type-specific part of a history record
#[derive(Debug, Clone, PartialEq)]
pub enum Detail {
    Deactivate,
    TimeChange { hour: u8, minute: u8, second: u8 },
    Bolus(BolusDetail),
    BasalRate {
        rate: f64,
        duration_ms: i64,
        /// Fraction of the scheduled rate for percent temp basals
        percent: Option<f64>,
    },
    Suspend,
    DateChange { year: u16, month: u8, day: u8 },
    SuggestedCalc(CalculatorDetail),
    Alarm { alarm_type: u16 },
    BloodGlucose { error_code: u32, reading: u16, flags: u8 },
    TerminateBolus { insulin_left: f64, time_left_ms: i64 },
    Activate,
    Resume,
    Occlusion,
    Other(u32),
}

impl Detail {
    fn parse(rectype: u32, r: &mut ByteReader<'_>) -> Result<Self> {
        let detail = match rectype {
            rectype::DEACTIVATE => Detail::Deactivate,
            rectype::TIME_CHANGE => {
                let second = r.u8()?;
                let minute = r.u8()?;
                let hour = r.u8()?;
                Detail::TimeChange { hour, minute, second }
            }
            rectype::BOLUS => {
                let volume = hundredths(r.u32_le()?);
                let extended_ms = match r.u16_le()? {
                    0 => None,
                    // extended part interrupted before it delivered anything
                    0xFFFF => Some(0),
                    minutes => Some(i64::from(minutes) * 60_000),
                };
                let calc_offset = r.u16_le()?;
                let immediate_ms = i64::from(r.u16_le()?) * 1000;
                Detail::Bolus(BolusDetail {
                    volume,
                    extended_ms,
                    calc_offset,
                    immediate_ms,
                })
            }
            rectype::BASAL_RATE => {
                let rate = hundredths(r.u32_le()?);
                let duration_ms = i64::from(r.u16_le()?) * 60_000;
                let percent = match r.i16_le()? {
                    0 => None,
                    p => Some(fix_floating_point(1.0 + f64::from(p) / 100.0, 2)),
                };
                Detail::BasalRate {
                    rate,
                    duration_ms,
                    percent,
                }
            }
            rectype::SUSPEND => Detail::Suspend,
            rectype::DATE_CHANGE => {
                let day = r.u8()?;
                let month = r.u8()?;
                let year = r.u16_le()?;
                Detail::DateChange { year, month, day }
            }
            rectype::SUGGESTED_CALC => Detail::SuggestedCalc(CalculatorDetail::parse(r)?),
            rectype::ALARM | rectype::REMOTE_HAZARD_ALARM => {
                // the alarm's own copy of the timestamp
                r.skip(8)?;
                Detail::Alarm {
                    alarm_type: r.u16_le()?,
                }
            }
            rectype::BLOOD_GLUCOSE => {
                let error_code = r.u32_le()?;
                let reading = r.u16_le()?;
                // two user tags, not uploaded
                r.skip(48)?;
                let flags = r.u8()?;
                Detail::BloodGlucose {
                    error_code,
                    reading,
                    flags,
                }
            }
            rectype::TERMINATE_BOLUS => {
                let insulin_left = hundredths(r.u32_le()?);
                let time_left_ms = i64::from(r.u16_le()?) * 60_000;
                Detail::TerminateBolus {
                    insulin_left,
                    time_left_ms,
                }
            }
            rectype::ACTIVATE => Detail::Activate,
            rectype::RESUME => Detail::Resume,
            rectype::OCCLUSION => Detail::Occlusion,
            other => Detail::Other(other),
        };
        Ok(detail)
    }

    fn is_clock_change(&self) -> bool {
        matches!(self, Detail::TimeChange { .. } | Detail::DateChange { .. })
    }
}

/// A history log record
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub log_index: i32,
    pub error_code: u16,
    pub year: u16,
    pub device_time: Option<NaiveDateTime>,
    pub rectype: u32,
    pub flags: u16,
    pub detail: Detail,
}

impl HistoryRecord {
    /// Decode one log record; `None` for deleted records and other log types
    pub fn parse(data: &[u8]) -> Result<Option<Self>> {
        let mut r = ByteReader::new(data);
        let log_id = r.u8()?;
        if log_id != HISTORY_LOG {
            debug!("skipping log record of type {}", log_id);
            return Ok(None);
        }
        let log_index = r.i32_be()?;
        let _record_size = r.u16_be()?;
        let error_code = r.u16_be()?;
        let day = r.u8()?;
        let month = r.u8()?;
        let year = r.u16_le()?;
        let second = r.u8()?;
        let minute = r.u8()?;
        let hour = r.u8()?;
        r.skip(1)?;
        let _since_powerup = r.u32_le()?;
        let rectype = r.i32_le()? as u32;
        let flags = r.u16_le()?;
        r.skip(2)?;
        if rectype & rectype::DELETED != 0 {
            return Ok(None);
        }
        let detail = Detail::parse(rectype, &mut r)?;
        Ok(Some(Self {
            log_index,
            error_code,
            year,
            device_time: build_device_time(
                i32::from(year),
                u32::from(month),
                u32::from(day),
                u32::from(hour),
                u32::from(minute),
                u32::from(second),
            ),
            rectype,
            flags,
            detail,
        }))
    }

    fn is_shutdown(&self) -> bool {
        self.rectype == rectype::REMOTE_HAZARD_ALARM && i32::from(self.year) <= SHUTDOWN_YEAR
    }
}

/// Decode the log records after the fixed records
///
/// Reading stops at the most recent PDM shutdown; the clock reset that
/// comes with it makes earlier records impossible to place.
pub fn parse_log(bytes: &[u8]) -> Result<Vec<RawRecord<HistoryRecord>>> {
    let mut records = IbfRecords::new(bytes);
    let mut history = Vec::new();
    while let Some(data) = records.next_record()? {
        let Some(record) = HistoryRecord::parse(&data)? else {
            continue;
        };
        if record.error_code != 0 {
            debug!("dropping record {} with error code {}", record.log_index, record.error_code);
            continue;
        }
        if record.is_shutdown() {
            info!("stopping at PDM shutdown, record {}", record.log_index);
            break;
        }
        let (Ok(index), Some(device_time)) = (u64::try_from(record.log_index), record.device_time) else {
            debug!("record {} has no usable index or timestamp", record.log_index);
            continue;
        };
        history.push(RawRecord::new(index, device_time, record));
    }
    Ok(history)
}

fn event(record: &RawRecord<HistoryRecord>, kind: EventKind) -> ClinicalEvent {
    ClinicalEvent::new(record.device_time, kind).with_index(record.index)
}

fn suspend_events(record: &RawRecord<HistoryRecord>, reason: &str) -> [ClinicalEvent; 2] {
    [
        event(
            record,
            EventKind::DeviceEvent(DeviceEvent::suspend(json!({ "suspended": reason }))),
        ),
        event(record, EventKind::Basal(Basal::suspend())),
    ]
}

/// Name, explanation and whether delivery stops, for documented alarm codes
fn alarm_info(code: u16) -> Option<(&'static str, &'static str, Option<bool>)> {
    let info = match code {
        0..=9 => ("AlrmPDM_ERROR", "PDM error", None),
        10 => ("AlrmSYSTEM_ERROR", "system error", Some(false)),
        12 | 28 => ("AlrmSYSTEM_ERROR", "system error", None),
        13 => ("AlrmHAZ_REMOTE", "clock reset alarm", Some(false)),
        14 => ("AlrmHAZ_PUMP_VOL", "empty reservoir", Some(true)),
        15 => ("AlrmHAZ_PUMP_AUTO_OFF", "auto-off", Some(true)),
        16 => ("AlrmHAZ_PUMP_EXPIRED", "pod expired", Some(true)),
        17 => ("AlrmHAZ_PUMP_OCCL", "pump site occluded", Some(true)),
        18 => ("AlrmHAZ_PUMP_ACTIVATE", "pod is a lump of coal", Some(false)),
        21 => ("AlrmADV_KEY", "PDM stuck key detected", Some(false)),
        23 => ("AlrmADV_PUMP_VOL", "low reservoir", Some(false)),
        24 => ("AlrmADV_PUMP_AUTO_OFF", "15 minutes to auto-off warning", Some(false)),
        25 => ("AlrmADV_PUMP_SUSPEND", "suspend done", Some(false)),
        26 => ("AlrmADV_PUMP_EXP1", "pod expiration advisory", Some(false)),
        27 => ("AlrmADV_PUMP_EXP2", "pod expiration alert", Some(false)),
        37 => ("AlrmEXP_WARNING", "pod expiration advisory", Some(false)),
        39 => ("AlrmHAZ_PDM_AUTO_OFF", "auto-off", Some(true)),
        _ => return None,
    };
    Some(info)
}

/// Alarm, plus a suspend when the alarm stopped delivery
fn alarm_events(record: &RawRecord<HistoryRecord>, code: u16) -> Vec<ClinicalEvent> {
    let alarm_type = match code {
        23 => "low_insulin",
        14 => "no_insulin",
        17 => "occlusion",
        16 => "no_delivery",
        15 | 39 => "auto_off",
        _ => "other",
    };
    let mut alarm = event(record, EventKind::DeviceEvent(DeviceEvent::alarm(alarm_type)));
    let Some((name, explanation, stops)) = alarm_info(code) else {
        debug!("undocumented alarm code {}", code);
        return vec![alarm];
    };
    alarm = alarm.with_payload(json!({
        "alarmText": name,
        "explanation": explanation,
        "stopsDelivery": stops.map_or(json!("unknown"), |s| json!(s)),
    }));
    let mut events = vec![alarm];
    if alarm_type != "other" && alarm_type != "low_insulin" {
        events.extend(suspend_events(record, "automatic"));
    }
    events
}

fn basal_event(
    record: &RawRecord<HistoryRecord>,
    rate: f64,
    duration_ms: i64,
    percent: Option<f64>,
    schedule: Option<&str>,
) -> ClinicalEvent {
    if duration_ms == 0 {
        return event(record, EventKind::Basal(Basal::scheduled(rate, schedule.map(str::to_string))));
    }
    let mut basal = Basal::temp(rate, duration_ms);
    if let Some(percent) = percent {
        basal.percent = Some(percent);
        // the schedule name is filled in from the basal this one replaced
        basal.suppressed = Some(SuppressedBasal {
            delivery_type: DeliveryType::Scheduled,
            rate: Some(fix_floating_point(rate / percent, 2)),
            schedule_name: None,
        });
    }
    event(record, EventKind::Basal(basal))
}

fn glucose_event(record: &RawRecord<HistoryRecord>, reading: u16, flags: u8, highest: f64) -> ClinicalEvent {
    let sub_type = if flags & bg_flag::MANUAL != 0 { "manual" } else { "linked" };
    let range = GlucoseRange::new(20.0, highest);
    let side = if flags & bg_flag::RANGE_LOW != 0 {
        Some(OutOfRange::Low)
    } else if flags & bg_flag::RANGE_HIGH != 0 {
        Some(OutOfRange::High)
    } else {
        None
    };
    let (value, annotation) = match side {
        Some(side) => {
            let (value, annotation) = Normalizer::out_of_range(&range, side);
            (value, Some(annotation))
        }
        None => (f64::from(reading), None),
    };
    let mut smbg = event(
        record,
        EventKind::Smbg(Smbg {
            value,
            units: MGDL.to_string(),
            sub_type: Some(sub_type.to_string()),
        }),
    );
    if let Some(annotation) = annotation {
        smbg.annotate(annotation);
    }
    smbg
}

/// What ties the records of one bolus together
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum BolusKey {
    /// Log index of the calculator record
    Calculator(u64),
    /// Quick boluses have no calculator record; their parts share a timestamp
    Quick(NaiveDateTime),
}

#[derive(Debug, Default)]
struct BolusParts {
    immediate: Option<usize>,
    extended: Vec<usize>,
}

fn bolus_detail(record: &RawRecord<HistoryRecord>) -> Option<&BolusDetail> {
    match &record.kind.detail {
        Detail::Bolus(detail) => Some(detail),
        _ => None,
    }
}

/// Wizard event for `bolus`, from the calculator record it was dosed from
pub fn wizard_event(calc: &CalculatorDetail, bolus: &ClinicalEvent, dash: bool) -> ClinicalEvent {
    let (sensitivity, ratio, carbs) = if dash {
        (
            f64::from(calc.correction_factor) / 100.0,
            f64::from(calc.ic_ratio) / 10.0,
            calc.carb_grams.map(|g| f64::from(g) / 10.0),
        )
    } else {
        (
            f64::from(calc.correction_factor),
            f64::from(calc.ic_ratio),
            calc.carb_grams.map(f64::from),
        )
    };
    let iob = calc.correction_iob + calc.meal_iob;
    let wizard = Wizard {
        units: MGDL.to_string(),
        recommended: Some(Recommended {
            carb: Some(calc.carb_bolus_suggested),
            correction: Some(calc.correction_suggested),
            net: Some(calc.net_recommendation()),
        }),
        bg_input: calc.current_bg.map(f64::from),
        carb_input: carbs,
        insulin_on_board: (iob != 0.0).then(|| fix_floating_point(iob, 2)),
        insulin_carb_ratio: Some(ratio),
        insulin_sensitivity: Some(sensitivity),
        bg_target: (calc.target_bg != 0 && calc.bg_correction_threshold != 0).then(|| BgTarget {
            target: f64::from(calc.target_bg),
            high: Some(f64::from(calc.bg_correction_threshold)),
        }),
        bolus: Some(Box::new(bolus.clone())),
    };
    // stamped with the bolus: a calculator record for an extended bolus may sit at midnight
    let mut event = ClinicalEvent::new(bolus.device_time, EventKind::Wizard(wizard));
    event.index = bolus.index;
    match serde_json::to_value(calc) {
        Ok(payload) => event.with_payload(payload),
        Err(_) => event,
    }
}

/// Combine bolus records into normal, square and dual boluses
///
/// A dual bolus is logged as an immediate and an extended record pointing at
/// the same calculator record. An extended part crossing midnight is split
/// into two records. A bolus whose calculator record is in the log is
/// preceded by its wizard event.
pub fn bolus_events(records: &[RawRecord<HistoryRecord>], dash: bool) -> Vec<ClinicalEvent> {
    let calculations: HashMap<u64, &CalculatorDetail> = records
        .iter()
        .filter_map(|r| match &r.kind.detail {
            Detail::SuggestedCalc(calc) => Some((r.index, calc)),
            _ => None,
        })
        .collect();

    let mut order = Vec::new();
    let mut groups: HashMap<BolusKey, BolusParts> = HashMap::new();
    for (position, record) in records.iter().enumerate() {
        let Some(detail) = bolus_detail(record) else {
            continue;
        };
        let key = match detail.calc_offset {
            0 => BolusKey::Quick(record.device_time),
            offset => BolusKey::Calculator(record.index + u64::from(offset)),
        };
        let parts = groups.entry(key).or_insert_with(|| {
            order.push(key);
            BolusParts::default()
        });
        if detail.extended_ms.is_some() {
            parts.extended.push(position);
        } else if parts.immediate.is_some() {
            debug!("second immediate bolus for one calculation at record {}", record.index);
            parts.extended.push(position);
        } else {
            parts.immediate = Some(position);
        }
    }

    let mut events = Vec::new();
    for key in order {
        let Some(parts) = groups.get(&key) else {
            continue;
        };
        let extended: Vec<(&RawRecord<HistoryRecord>, &BolusDetail)> = parts
            .extended
            .iter()
            .filter_map(|p| records.get(*p).and_then(|r| bolus_detail(r).map(|d| (r, d))))
            .collect();
        let volume = fix_floating_point(extended.iter().map(|(_, d)| d.volume).sum(), 2);
        let duration: i64 = extended.iter().map(|(_, d)| d.extended_ms.unwrap_or(0)).sum();
        let immediate = parts
            .immediate
            .and_then(|p| records.get(p))
            .and_then(|r| bolus_detail(r).map(|d| (r, d)));

        let bolus = match (immediate, extended.first()) {
            (Some((record, detail)), Some(_)) => {
                event(record, EventKind::Bolus(Bolus::dual(detail.volume, volume, duration)))
            }
            (None, Some((record, _))) => event(record, EventKind::Bolus(Bolus::square(volume, duration))),
            (Some((record, detail)), None) => {
                if detail.immediate_ms == 0 && detail.volume != 0.0 {
                    debug!("bolus of {} with no duration at record {}", detail.volume, record.index);
                    continue;
                }
                // zero volumes are kept; a termination may amend them
                event(record, EventKind::Bolus(Bolus::normal(detail.volume)))
            }
            (None, None) => continue,
        };
        let calc = match key {
            BolusKey::Calculator(index) => calculations.get(&index).copied(),
            BolusKey::Quick(_) => None,
        };
        match calc {
            Some(calc) => events.push(wizard_event(calc, &bolus, dash)),
            None if matches!(key, BolusKey::Calculator(_)) => {
                debug!("calculator record for bolus {:?} is not in the log", bolus.index)
            }
            None => {}
        }
        events.push(bolus);
    }
    events
}

/// Group runs of date and time change records into clock changes
///
/// Changes away from the PDM's reset dates are dropped.
pub fn clock_changes(records: &[RawRecord<HistoryRecord>]) -> Vec<ClinicalEvent> {
    let mut changes = Vec::new();
    let mut i = 0;
    while i < records.len() {
        if !records[i].kind.detail.is_clock_change() {
            i += 1;
            continue;
        }
        let first = &records[i];
        let mut date = first.device_time.date();
        let mut time = first.device_time.time();
        while i < records.len() && records[i].kind.detail.is_clock_change() {
            match records[i].kind.detail {
                Detail::DateChange { year, month, day } => {
                    if let Some(d) = chrono::NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day)) {
                        date = d;
                    }
                }
                Detail::TimeChange { hour, minute, second } => {
                    if let Some(t) =
                        chrono::NaiveTime::from_hms_opt(u32::from(hour), u32::from(minute), u32::from(second))
                    {
                        time = t;
                    }
                }
                _ => {}
            }
            i += 1;
        }
        if first.device_time.year() <= CLOCK_RESET_YEAR {
            debug!("ignoring clock change from reset date {}", format_device_time(&first.device_time));
            continue;
        }
        changes.push(event(
            first,
            EventKind::DeviceEvent(DeviceEvent::time_change(first.device_time, date.and_time(time), "manual")),
        ));
    }
    changes
}

/// Bolus terminations by log index; applied to the bolus open at that point
pub fn terminations(records: &[RawRecord<HistoryRecord>]) -> Vec<(u64, Termination)> {
    records
        .iter()
        .filter_map(|record| match record.kind.detail {
            Detail::TerminateBolus {
                insulin_left,
                time_left_ms,
            } => Some((
                record.index,
                Termination {
                    missed_insulin: insulin_left,
                    duration_left_ms: time_left_ms,
                },
            )),
            _ => None,
        })
        .collect()
}

/// Clinical events for every history record except clock changes and terminations
pub fn history_events(records: &[RawRecord<HistoryRecord>], file: &PdmFile) -> Vec<ClinicalEvent> {
    let schedule = file.programs.active();
    let highest = file.eeprom.meter_highest();
    let mut activations = Vec::new();
    let mut alarms = Vec::new();
    let mut suspends = Vec::new();
    let mut resumes = Vec::new();
    let mut basals = Vec::new();
    let mut readings = Vec::new();

    for record in records {
        match &record.kind.detail {
            Detail::Activate => activations.push(event(
                record,
                EventKind::DeviceEvent(DeviceEvent::resume(json!("new_pod"))),
            )),
            Detail::Alarm { alarm_type } => alarms.extend(alarm_events(record, *alarm_type)),
            Detail::Occlusion => alarms.push(event(record, EventKind::DeviceEvent(DeviceEvent::alarm("occlusion")))),
            Detail::Deactivate => {
                suspends.push(
                    event(record, EventKind::DeviceEvent(DeviceEvent::reservoir_change()))
                        .with_payload(json!({ "event": "pod_deactivation" })),
                );
                suspends.extend(suspend_events(record, "manual"));
            }
            Detail::Suspend => suspends.extend(suspend_events(record, "manual")),
            Detail::Resume => resumes.push(event(
                record,
                EventKind::DeviceEvent(DeviceEvent::resume(json!({ "resumed": "manual" }))),
            )),
            Detail::BasalRate {
                rate,
                duration_ms,
                percent,
            } => basals.push(basal_event(record, *rate, *duration_ms, *percent, schedule)),
            Detail::BloodGlucose {
                error_code,
                reading,
                flags,
            } => {
                if *error_code != 0 || flags & (bg_flag::TEMPERATURE | bg_flag::OTHER_ERROR) != 0 {
                    debug!("skipping errored reading at record {}", record.index);
                    continue;
                }
                readings.push(glucose_event(record, *reading, *flags, highest));
            }
            _ => {}
        }
    }

    // the order within one timestamp follows the order of these groups
    let mut events = activations;
    events.extend(alarms);
    events.extend(suspends);
    events.extend(resumes);
    events.extend(basals);
    events.extend(bolus_events(records, file.pdm.is_dash()));
    events.extend(readings);
    events
}

/// Simulator entry point for an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    Basal,
    Bolus,
    Wizard,
    Suspend,
    Resume,
    PodActivation,
    Alarm,
    ReservoirChange,
    TimeChange,
    Settings,
    Plain,
}

fn route(event: &ClinicalEvent) -> Route {
    match &event.kind {
        EventKind::Basal(_) => Route::Basal,
        EventKind::Bolus(_) => Route::Bolus,
        EventKind::Wizard(_) => Route::Wizard,
        EventKind::PumpSettings(_) => Route::Settings,
        EventKind::DeviceEvent(e) => match e.sub_type {
            DeviceEventSubType::Status if e.is_suspend() => Route::Suspend,
            DeviceEventSubType::Status if e.reason == Some(json!("new_pod")) => Route::PodActivation,
            DeviceEventSubType::Status => Route::Resume,
            DeviceEventSubType::Alarm => Route::Alarm,
            DeviceEventSubType::ReservoirChange => Route::ReservoirChange,
            DeviceEventSubType::TimeChange => Route::TimeChange,
            _ => Route::Plain,
        },
        _ => Route::Plain,
    }
}

fn feed(simulator: &mut Simulator, event: ClinicalEvent) -> std::result::Result<(), ProtocolViolationError> {
    match route(&event) {
        Route::Basal => simulator.basal(event),
        Route::Bolus => simulator.bolus(event),
        Route::Wizard => simulator.wizard(event),
        Route::Suspend => simulator.suspend(event),
        Route::Resume => simulator.resume(event),
        Route::PodActivation => simulator.pod_activation(event),
        Route::Alarm => simulator.alarm(event),
        Route::ReservoirChange => simulator.change_reservoir(event),
        Route::TimeChange => simulator.change_device_time(event),
        Route::Settings => simulator.pump_settings(event),
        Route::Plain => simulator.simulate(event),
    }
}

/// Run reconciled events through the simulator in time order
///
/// Terminations carry no event of their own; each is applied just before the
/// first event logged after it.
pub fn simulate(
    mut events: Vec<ClinicalEvent>,
    terminations: Vec<(u64, Termination)>,
    settings: PumpSettings,
) -> std::result::Result<Vec<ClinicalEvent>, ProtocolViolationError> {
    events.sort_by_key(|e| (crate::simulator::instant(e), e.index));
    let mut pending: VecDeque<(u64, Termination)> = terminations.into();
    pending.make_contiguous().sort_by_key(|(index, _)| *index);

    let mut simulator = Simulator::new("insulet").with_settings(settings);
    for event in events {
        if let Some(index) = event.index {
            while pending.front().map_or(false, |(at, _)| *at < index) {
                if let Some((_, termination)) = pending.pop_front() {
                    simulator.bolus_termination(termination);
                }
            }
        }
        feed(&mut simulator, event)?;
    }
    for (_, termination) in pending {
        simulator.bolus_termination(termination);
    }
    simulator.finalize();
    Ok(simulator.events())
}

pub struct InsuletDriver {
    transport: Box<dyn Transport>,
    file: Vec<u8>,
    pdm: Option<PdmFile>,
    records: Vec<RawRecord<HistoryRecord>>,
}

impl InsuletDriver {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            file: Vec::new(),
            pdm: None,
            records: Vec::new(),
        }
    }

    fn pdm(&self) -> Result<&PdmFile> {
        self.pdm
            .as_ref()
            .ok_or_else(|| ProtocolViolationError::InvalidRecord("fixed records not read".to_string()).into())
    }
}

#[async_trait::async_trait]
impl DeviceDriver for InsuletDriver {
    fn name(&self) -> &'static str {
        "InsuletOmniPod"
    }

    async fn setup(&mut self, _data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        progress.report(100.0);
        Ok(())
    }

    /// Read the file and validate every record checksum
    async fn connect(&mut self, data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        self.transport.connect(&data.device).await?;
        self.file = self.transport.receive(Duration::from_secs(5)).await?;
        progress.report(50.0);

        let mut records = IbfRecords::new(&self.file);
        let mut count = 0usize;
        while records.next_record()?.is_some() {
            count += 1;
        }
        info!("{} records in {} bytes", count, self.file.len());
        progress.report(100.0);
        Ok(())
    }

    async fn get_config_info(&mut self, data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        let pdm = PdmFile::parse(&self.file)?;
        progress.report(50.0);

        data.info.model = pdm.pdm.model().to_string();
        data.info.firmware = Some(format!("{}.{}.{}", pdm.pdm.major, pdm.pdm.minor, pdm.pdm.patch));
        data.info.serial_number = pdm.serial_number();
        data.info.device_id = pdm.device_id();
        data.info.manufacturers = vec!["Insulet".to_string()];
        data.info.tags = vec![DeviceTag::InsulinPump];
        if !pdm.pdm.is_dash() {
            // the Eros PDM has a built-in meter
            data.info.manufacturers.push("Abbott".to_string());
            data.info.tags.push(DeviceTag::Bgm);
        }
        info!(
            "{} PDM {}, glucose shown in {}",
            data.info.model,
            data.info.serial_number,
            pdm.eeprom.bg_units()
        );

        match pdm.log.device_time {
            // the clock can only be read from the file
            Some(device_time) => {
                check_device_time(data, device_time, false)?;
            }
            None => warn!("log header has no valid clock reading"),
        }
        self.pdm = Some(pdm);
        progress.report(100.0);
        Ok(())
    }

    async fn fetch_data(&mut self, data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        let offset = self.pdm()?.log_offset;
        let records = parse_log(self.file.get(offset..).unwrap_or_default())?;
        info!("{} history records", records.len());
        self.records = apply_delta(records, data)?;
        progress.report(100.0);
        Ok(())
    }

    async fn process_data(&mut self, data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        let pdm = self.pdm()?;
        let settings = pdm.pump_settings();
        let mut events = history_events(&self.records, pdm);
        if let Some(device_time) = pdm.log.device_time {
            let mut snapshot = ClinicalEvent::new(device_time, EventKind::PumpSettings(settings.clone()));
            snapshot.index = self.records.iter().map(|r| r.index).max();
            events.push(snapshot);
        }
        let changes = clock_changes(&self.records);
        let terminations = terminations(&self.records);
        progress.report(30.0);

        let (mut placed, changes) = data.reconcile(events, changes)?;
        placed.extend(changes);
        progress.report(60.0);

        let post = simulate(placed, terminations, settings)?;
        debug!("{} events from {} records", post.len(), self.records.len());
        data.post_records = post;
        progress.report(100.0);
        Ok(())
    }

    async fn disconnect(&mut self, _data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        self.transport.disconnect().await?;
        progress.report(100.0);
        Ok(())
    }

    async fn cleanup(&mut self, _data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        self.file.clear();
        self.records.clear();
        self.pdm = None;
        progress.report(100.0);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::ibf::IbfCodec;
    use crate::codec::FrameCodec;
    use crate::config::{DeltaStore, Period, SessionConfig};
    use crate::session::{FixedClock, SessionOutcome, SessionRunner};
    use crate::transport::{BlockTransport, DeviceDescriptor};
    use crate::types::{Annotation, TimeProcessing};
    use crate::upload::RecordingUploader;
    use chrono::{TimeZone, Timelike, Utc};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        build_device_time(2015, 6, 1, h, m, 0).unwrap()
    }

    fn record(payload: &[u8]) -> Vec<u8> {
        IbfCodec.encode(0, payload).unwrap()
    }

    fn ibf_version() -> Vec<u8> {
        let mut data = Vec::new();
        for v in [0u16, 1, 0, 0, 1, 0] {
            data.extend_from_slice(&v.to_be_bytes());
        }
        data.extend_from_slice(b"Insulet\0OmniPod\0");
        data
    }

    fn pdm_version(major: u16, minor: u16) -> Vec<u8> {
        [major, minor, 0].iter().flat_map(|v| v.to_be_bytes()).collect()
    }

    fn programs() -> Vec<u8> {
        let mut data = Vec::new();
        for v in [2u16, 0, 16] {
            data.extend_from_slice(&v.to_be_bytes());
        }
        for (i, name) in ["weekday", "week.end$", "", "", "", "", ""].iter().enumerate() {
            data.extend_from_slice(&(i as u16).to_be_bytes());
            let mut field = name.as_bytes().to_vec();
            field.resize(16, 0);
            data.extend(field);
        }
        data
    }

    fn eeprom(remote_id: u32) -> Vec<u8> {
        let mut data = vec![0u8; EepromSettings::LEN];
        data[13..17].copy_from_slice(&5u32.to_le_bytes());
        data[17..21].copy_from_slice(&1000u32.to_le_bytes());
        data[21..25].copy_from_slice(&300u32.to_le_bytes());
        data[53..57].copy_from_slice(&remote_id.to_le_bytes());
        data[76] = 1;
        data[77] = 2;
        data[79] = 1;
        data[81] = 0;
        data[89] = 8;
        // LifeScan board
        data[110..114].copy_from_slice(&(2u32 << 6).to_le_bytes());
        data
    }

    fn profile(index: u8) -> Vec<u8> {
        let mut data = vec![index, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        for step in 0..PROFILE_STEPS {
            let value: i32 = match index {
                // 0.80 U/h until 08:00, then 1.00 U/h
                15 if step < 16 => 80,
                15 => 100,
                16 => 50,
                _ => 0,
            };
            data.extend_from_slice(&value.to_le_bytes());
        }
        data
    }

    fn log_header(time: NaiveDateTime) -> Vec<u8> {
        let mut data = vec![0u8; 5];
        data.push(time.day() as u8);
        data.push(time.month() as u8);
        data.extend_from_slice(&(time.year() as u16).to_be_bytes());
        data.extend_from_slice(&[time.second() as u8, time.minute() as u8, time.hour() as u8, 0]);
        data.extend_from_slice(&0u16.to_be_bytes());
        data
    }

    fn history(index: i32, time: NaiveDateTime, rectype: u32, detail: &[u8]) -> Vec<u8> {
        let mut data = vec![HISTORY_LOG];
        data.extend_from_slice(&index.to_be_bytes());
        data.extend_from_slice(&((HISTORY_HEADER_LEN + detail.len()) as u16).to_be_bytes());
        data.extend_from_slice(&0u16.to_be_bytes());
        data.push(time.day() as u8);
        data.push(time.month() as u8);
        data.extend_from_slice(&(time.year() as u16).to_le_bytes());
        data.extend_from_slice(&[time.second() as u8, time.minute() as u8, time.hour() as u8, 0]);
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&(rectype as i32).to_le_bytes());
        data.extend_from_slice(&[0, 0, 0, 0]);
        data.extend_from_slice(detail);
        data
    }

    fn basal(rate: u32, minutes: u16, percent: i16) -> Vec<u8> {
        let mut detail = rate.to_le_bytes().to_vec();
        detail.extend_from_slice(&minutes.to_le_bytes());
        detail.extend_from_slice(&percent.to_le_bytes());
        detail
    }

    fn bolus(volume: u32, extended_minutes: u16, calc_offset: u16, immediate_seconds: u16) -> Vec<u8> {
        let mut detail = volume.to_le_bytes().to_vec();
        for v in [extended_minutes, calc_offset, immediate_seconds] {
            detail.extend_from_slice(&v.to_le_bytes());
        }
        detail
    }

    /// Calculator detail: suggested doses and IOB in hundredths, then BG, carbs and ratios
    fn calculation(carb_suggested: u32, correction_suggested: i32, correction_iob: u32, bg: u16, carbs: u16) -> Vec<u8> {
        let mut detail = Vec::new();
        for v in [0u32, 0, 0, 0] {
            detail.extend_from_slice(&v.to_le_bytes());
        }
        detail.extend_from_slice(&correction_suggested.to_le_bytes());
        for v in [carb_suggested, correction_iob, 0] {
            detail.extend_from_slice(&v.to_le_bytes());
        }
        // sensitivity 50, target 100, correct above 150, 1 U per 15 g
        for v in [50u16, bg, 100, 150, carbs, 15] {
            detail.extend_from_slice(&v.to_le_bytes());
        }
        detail
    }

    fn glucose(reading: u16, flags: u8) -> Vec<u8> {
        let mut detail = 0u32.to_le_bytes().to_vec();
        detail.extend_from_slice(&reading.to_le_bytes());
        detail.extend(vec![0u8; 48]);
        detail.extend_from_slice(&[flags, 0]);
        detail
    }

    fn file(pdm: (u16, u16), remote_id: u32, log: &[Vec<u8>]) -> Vec<u8> {
        let mut bytes = record(&ibf_version());
        bytes.extend(record(&pdm_version(pdm.0, pdm.1)));
        bytes.extend(record(b"MFG 2015\0"));
        bytes.extend(record(&programs()));
        bytes.extend(record(&eeprom(remote_id)));
        for index in 11..22u8 {
            bytes.extend(record(&profile(index)));
        }
        bytes.extend(record(&log_header(at(12, 0))));
        for payload in log {
            bytes.extend(record(payload));
        }
        bytes
    }

    fn day_log() -> Vec<Vec<u8>> {
        vec![
            history(1, at(8, 0), rectype::BASAL_RATE, &basal(80, 0, 0)),
            history(2, at(8, 30), rectype::BOLUS, &bolus(250, 0, 0, 60)),
            history(3, at(9, 0), rectype::BLOOD_GLUCOSE, &glucose(0, bg_flag::RANGE_LOW | bg_flag::MANUAL)),
            history(4, at(10, 0), rectype::BASAL_RATE, &basal(40, 30, -50)),
            history(5, at(10, 30), rectype::BASAL_RATE, &basal(100, 0, 0)),
            history(6, at(11, 0), rectype::SUSPEND, &[]),
            history(7, at(11, 30), rectype::RESUME, &[]),
            history(8, at(11, 30), rectype::BASAL_RATE, &basal(100, 0, 0)),
        ]
    }

    fn session(period: Period) -> SessionData {
        let clock = FixedClock(Utc.with_ymd_and_hms(2015, 6, 1, 12, 0, 0).unwrap());
        SessionData::new(
            SessionConfig::new("UTC").with_period(period),
            DeviceDescriptor::new("InsuletOmniPod"),
        )
        .with_clock(Arc::new(clock))
    }

    fn insulet(bytes: Vec<u8>) -> InsuletDriver {
        InsuletDriver::new(Box::new(BlockTransport::from_bytes(bytes)))
    }

    fn raw(index: u64, time: NaiveDateTime, detail: Detail) -> RawRecord<HistoryRecord> {
        RawRecord::new(
            index,
            time,
            HistoryRecord {
                log_index: index as i32,
                error_code: 0,
                year: time.year() as u16,
                device_time: Some(time),
                rectype: 0,
                flags: 0,
                detail,
            },
        )
    }

    fn bolus_record(
        index: u64,
        time: NaiveDateTime,
        volume: f64,
        extended_ms: Option<i64>,
        calc_offset: u16,
    ) -> RawRecord<HistoryRecord> {
        raw(
            index,
            time,
            Detail::Bolus(BolusDetail {
                volume,
                extended_ms,
                calc_offset,
                immediate_ms: if extended_ms.is_some() { 0 } else { 30_000 },
            }),
        )
    }

    #[test]
    fn test_decode_dash_serial() {
        let encoded = (1 << 25) | (4 << 21) | (2 << 17) | (12345 << 2);
        assert_eq!(decode_serial(encoded), "010402-12345");
    }

    #[test]
    fn test_fixed_records() {
        let bytes = file((2, 7), 123_456, &[]);
        let pdm = PdmFile::parse(&bytes).unwrap();
        assert_eq!(pdm.device_id(), "InsOmn-123456");
        assert_eq!(pdm.pdm.model(), "Eros");
        assert_eq!(pdm.programs.names[1], "week-end");
        assert_eq!(pdm.programs.active(), Some("weekday"));
        assert_eq!(pdm.eeprom.bolus_max, 1000);
        assert_eq!(pdm.eeprom.temp_basal_type, 1);
        assert_eq!(pdm.eeprom.meter_highest(), 600.0);
        assert_eq!(pdm.log.device_time, Some(at(12, 0)));
        assert_eq!(pdm.log_offset, bytes.len());

        let settings = pdm.pump_settings();
        assert_eq!(settings.active_schedule, "weekday");
        assert_eq!(
            settings.basal_schedules["weekday"],
            vec![
                ScheduleSegment { start: 0, rate: 0.8 },
                ScheduleSegment {
                    start: 16 * HALF_HOUR_MS,
                    rate: 1.0
                },
            ]
        );
        assert_eq!(settings.basal_schedules["week-end"].len(), 1);
        assert_eq!(settings.max_bolus, Some(10.0));
        assert_eq!(settings.max_basal, Some(3.0));
        assert_eq!(settings.insulin_duration_ms, Some(4 * 3_600_000));
    }

    #[test]
    fn test_incompatible_versions() {
        let bytes = file((2, 1), 1, &[]);
        let err = PdmFile::parse(&bytes).unwrap_err();
        assert_eq!(err.code(), "E_DEVICE_UPLOAD");

        let dash = PdmFile::parse(&file((3, 0), (1 << 25) | (7 << 2), &[])).unwrap();
        assert!(dash.pdm.is_dash());
        assert_eq!(dash.serial_number(), "010000-00007");
    }

    #[test]
    fn test_history_record_layout() {
        let payload = history(42, at(9, 15), rectype::BASAL_RATE, &basal(125, 60, 0));
        let record = HistoryRecord::parse(&payload).unwrap().unwrap();
        assert_eq!(record.log_index, 42);
        assert_eq!(record.device_time, Some(at(9, 15)));
        assert_eq!(
            record.detail,
            Detail::BasalRate {
                rate: 1.25,
                duration_ms: 3_600_000,
                percent: None
            }
        );

        let deleted = history(43, at(9, 20), rectype::BOLUS | rectype::DELETED, &bolus(100, 0, 0, 30));
        assert_eq!(HistoryRecord::parse(&deleted).unwrap(), None);

        let mut alarm_log = payload.clone();
        alarm_log[0] = 0x05;
        assert_eq!(HistoryRecord::parse(&alarm_log).unwrap(), None);

        let interrupted = history(44, at(9, 30), rectype::BOLUS, &bolus(100, 0xFFFF, 0, 0));
        let record = HistoryRecord::parse(&interrupted).unwrap().unwrap();
        assert!(matches!(
            record.detail,
            Detail::Bolus(BolusDetail {
                extended_ms: Some(0),
                ..
            })
        ));
    }

    #[test]
    fn test_errored_records_and_shutdown() {
        let mut errored = history(2, at(9, 0), rectype::SUSPEND, &[]);
        errored[7..9].copy_from_slice(&4u16.to_be_bytes());
        let reset = build_device_time(2007, 1, 1, 0, 0, 0).unwrap();
        let mut alarm = vec![0u8; 8];
        alarm.extend_from_slice(&13u16.to_le_bytes());
        alarm.extend(vec![0u8; 6]);

        let log: Vec<u8> = [
            history(1, at(8, 0), rectype::RESUME, &[]),
            errored,
            history(3, reset, rectype::REMOTE_HAZARD_ALARM, &alarm),
            history(4, at(10, 0), rectype::SUSPEND, &[]),
        ]
        .iter()
        .flat_map(|p| record(p))
        .collect();

        let records = parse_log(&log).unwrap();
        let indices: Vec<u64> = records.iter().map(|r| r.index).collect();
        assert_eq!(indices, vec![1]);
    }

    #[test]
    fn test_dual_and_square_boluses() {
        let records = vec![
            // immediate and extended parts of one calculation at position 2
            bolus_record(1, at(8, 0), 1.0, None, 2),
            bolus_record(2, at(8, 0), 1.5, Some(3_600_000), 1),
            raw(3, at(8, 0), Detail::Other(0x40)),
            // a square bolus split at midnight
            bolus_record(4, at(23, 0), 0.5, Some(3_600_000), 2),
            bolus_record(5, build_device_time(2015, 6, 2, 0, 0, 0).unwrap(), 0.75, Some(1_800_000), 1),
            raw(6, at(23, 0), Detail::Other(0x40)),
            // quick bolus
            bolus_record(7, at(9, 0), 2.0, None, 0),
        ];
        let events = bolus_events(&records, false);
        let boluses: Vec<(u64, Bolus)> = events
            .iter()
            .map(|e| (e.index.unwrap(), e.bolus().unwrap().clone()))
            .collect();
        assert_eq!(
            boluses,
            vec![
                (1, Bolus::dual(1.0, 1.5, 3_600_000)),
                (4, Bolus::square(1.25, 5_400_000)),
                (7, Bolus::normal(2.0)),
            ]
        );
    }

    #[test]
    fn test_clock_changes_grouped() {
        let later = |h, m| build_device_time(2017, 3, 4, h, m, 0).unwrap();
        let reset = build_device_time(2007, 1, 1, 0, 5, 0).unwrap();
        let records = vec![
            raw(1, later(8, 0), Detail::Suspend),
            raw(2, later(9, 0), Detail::DateChange { year: 2017, month: 3, day: 5 }),
            raw(3, later(9, 0), Detail::TimeChange { hour: 7, minute: 30, second: 0 }),
            raw(4, later(10, 0), Detail::Resume),
            raw(5, reset, Detail::DateChange { year: 2017, month: 3, day: 5 }),
        ];
        let changes = clock_changes(&records);
        assert_eq!(changes.len(), 1);
        let change = changes[0].device_event().unwrap().change.clone().unwrap();
        assert_eq!(change.from, later(9, 0));
        assert_eq!(change.to, build_device_time(2017, 3, 5, 7, 30, 0).unwrap());
        assert_eq!(changes[0].index, Some(2));
    }

    #[test]
    fn test_termination_amends_bolus() {
        let settings = PdmFile::parse(&file((2, 7), 1, &[])).unwrap().pump_settings();
        let events = vec![
            ClinicalEvent::new(at(8, 0), EventKind::Bolus(Bolus::normal(1.0))).with_index(1),
            ClinicalEvent::new(at(9, 0), EventKind::Bolus(Bolus::normal(2.0))).with_index(3),
        ];
        let terminations = vec![(
            2,
            Termination {
                missed_insulin: 0.5,
                duration_left_ms: 0,
            },
        )];
        let out = simulate(events, terminations, settings).unwrap();
        assert_eq!(out[0].bolus().unwrap().expected_normal, Some(1.5));
        assert_eq!(out[1].bolus().unwrap().expected_normal, None);
    }

    #[test]
    fn test_stopping_alarm_suspends() {
        let record = raw(9, at(14, 0), Detail::Alarm { alarm_type: 17 });
        let events = alarm_events(&record, 17);
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].device_event().unwrap().alarm_type.as_deref(), Some("occlusion"));
        assert_eq!(events[0].payload.as_ref().unwrap()["stopsDelivery"], true);
        assert!(events[1].device_event().unwrap().is_suspend());
        assert_eq!(events[2].basal().unwrap().delivery_type, DeliveryType::Suspend);

        assert_eq!(alarm_events(&record, 23).len(), 1);
        assert_eq!(alarm_events(&record, 99)[0].payload, None);
    }

    #[tokio::test]
    async fn test_full_session() {
        let mut driver = insulet(file((2, 7), 123_456, &day_log()));
        let mut data = session(Period::All);
        let uploader = RecordingUploader::new();
        let mut store = DeltaStore::new();

        let outcome = SessionRunner::run(&mut driver, &mut data, &uploader, &mut store, &mut Progress::silent())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SessionOutcome::Uploaded {
                count: 10,
                last_end_position: Some(8)
            }
        );
        assert_eq!(data.time_processing, TimeProcessing::AcrossTheBoard);

        let sessions = uploader.sessions().await;
        assert_eq!(sessions[0].device_id, "InsOmn-123456");
        assert_eq!(sessions[0].device_tags, vec![DeviceTag::InsulinPump, DeviceTag::Bgm]);

        let events = uploader.events().await;
        let basals: Vec<(DeliveryType, Option<i64>)> = events
            .iter()
            .filter_map(|e| e.basal())
            .map(|b| (b.delivery_type, b.duration))
            .collect();
        assert_eq!(
            basals[..4].to_vec(),
            vec![
                (DeliveryType::Scheduled, Some(2 * 3_600_000)),
                (DeliveryType::Temp, Some(1_800_000)),
                (DeliveryType::Scheduled, Some(1_800_000)),
                (DeliveryType::Suspend, Some(1_800_000)),
            ]
        );
        assert_eq!(basals.len(), 5);

        let temp = events.iter().filter_map(|e| e.basal()).find(|b| b.delivery_type == DeliveryType::Temp).unwrap();
        assert_eq!(temp.percent, Some(0.5));
        assert_eq!(
            temp.suppressed,
            Some(SuppressedBasal {
                delivery_type: DeliveryType::Scheduled,
                rate: Some(0.8),
                schedule_name: Some("weekday".to_string()),
            })
        );

        let smbg = events.iter().find(|e| e.type_name() == "smbg").unwrap();
        assert!(matches!(&smbg.kind, EventKind::Smbg(s) if s.value == 19.0 && s.sub_type.as_deref() == Some("manual")));
        assert_eq!(smbg.annotations, vec![Annotation::out_of_range("low", 20.0)]);

        let resume = events
            .iter()
            .filter_map(|e| e.device_event())
            .find(|e| e.is_resume())
            .unwrap();
        assert!(resume.previous.is_some());
        assert_eq!(events.iter().filter(|e| e.type_name() == "pumpSettings").count(), 1);
    }

    #[tokio::test]
    async fn test_delta_upload() {
        let mut driver = insulet(file((2, 7), 123_456, &day_log()));
        let mut data = session(Period::Delta);
        let uploader = RecordingUploader::new();
        let mut store = DeltaStore::new();
        store.record("InsOmn-123456", 6);

        let outcome = SessionRunner::run(&mut driver, &mut data, &uploader, &mut store, &mut Progress::silent())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            SessionOutcome::Uploaded {
                last_end_position: Some(8),
                ..
            }
        ));
        let events = uploader.events().await;
        assert!(events.iter().all(|e| e.device_time >= at(11, 30)));
    }

    #[tokio::test]
    async fn test_corrupt_file_fails_connect() {
        let mut bytes = file((2, 7), 1, &day_log());
        let n = bytes.len();
        bytes[n - 3] ^= 0x01;
        let mut driver = insulet(bytes);
        let mut data = session(Period::All);
        let err = driver.connect(&mut data, &mut Progress::silent()).await.unwrap_err();
        assert_eq!(err.code(), "E_DEVICE_CONNECTION");
    }

    #[test]
    fn test_calculator_record_layout() {
        let bytes = history(12, at(9, 0), rectype::SUGGESTED_CALC, &calculation(300, -40, 20, 90, 0xFFFF));
        let record = HistoryRecord::parse(&bytes).unwrap().unwrap();
        let Detail::SuggestedCalc(calc) = record.detail else {
            panic!("expected a calculator record, got {:?}", record.detail);
        };
        assert_eq!(calc.carb_bolus_suggested, 3.0);
        assert_eq!(calc.correction_suggested, -0.4);
        assert_eq!(calc.current_bg, Some(90));
        assert_eq!(calc.carb_grams, None);
        assert_eq!(calc.ic_ratio, 15);
        // negative correction lowers the dose, then IOB comes off
        assert_eq!(calc.net_recommendation(), 2.4);

        let no_bg = CalculatorDetail {
            current_bg: None,
            ..calc
        };
        assert_eq!(no_bg.net_recommendation(), 3.0);

        let bolus = ClinicalEvent::new(at(9, 1), EventKind::Bolus(Bolus::normal(2.4))).with_index(11);
        let wizard = wizard_event(&calc, &bolus, true);
        assert_eq!(wizard.index, Some(11));
        assert_eq!(wizard.device_time, at(9, 1));
        let EventKind::Wizard(w) = &wizard.kind else {
            panic!("expected a wizard");
        };
        assert_eq!(w.insulin_sensitivity, Some(0.5));
        assert_eq!(w.insulin_carb_ratio, Some(1.5));
        assert_eq!(w.insulin_on_board, Some(0.2));
        assert_eq!(w.bg_target, Some(BgTarget { target: 100.0, high: Some(150.0) }));
        assert_eq!(wizard.payload.as_ref().unwrap()["carb_grams"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn test_wizard_with_carbs_keeps_zero_bolus() {
        let log = vec![
            history(1, at(8, 0), rectype::BASAL_RATE, &basal(80, 0, 0)),
            // 30 g entered, then the bolus was cancelled down to nothing
            history(2, at(9, 0), rectype::BOLUS, &bolus(0, 0, 1, 0)),
            history(3, at(9, 0), rectype::SUGGESTED_CALC, &calculation(200, 0, 0, 0xFFFF, 30)),
            // correction only, 0.2 U still on board
            history(4, at(10, 0), rectype::BOLUS, &bolus(80, 0, 1, 30)),
            history(5, at(10, 0), rectype::SUGGESTED_CALC, &calculation(0, 100, 20, 180, 0xFFFF)),
            // nothing dosed and no carbs
            history(6, at(11, 0), rectype::BOLUS, &bolus(0, 0, 1, 0)),
            history(7, at(11, 0), rectype::SUGGESTED_CALC, &calculation(0, 0, 0, 110, 0xFFFF)),
        ];
        let mut driver = insulet(file((2, 7), 123_456, &log));
        let mut data = session(Period::All);
        let uploader = RecordingUploader::new();
        let mut store = DeltaStore::new();

        SessionRunner::run(&mut driver, &mut data, &uploader, &mut store, &mut Progress::silent())
            .await
            .unwrap();
        let events = uploader.events().await;

        let boluses: Vec<(NaiveDateTime, f64)> = events
            .iter()
            .filter_map(|e| e.bolus().map(|b| (e.device_time, b.normal.unwrap_or(0.0))))
            .collect();
        assert_eq!(boluses, vec![(at(9, 0), 0.0), (at(10, 0), 0.8)]);

        let wizards: Vec<&Wizard> = events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::Wizard(w) => Some(w),
                _ => None,
            })
            .collect();
        assert_eq!(wizards.len(), 2);

        assert_eq!(wizards[0].carb_input, Some(30.0));
        assert_eq!(wizards[0].bg_input, None);
        assert_eq!(wizards[0].recommended.as_ref().unwrap().net, Some(2.0));
        assert_eq!(wizards[0].bolus.as_ref().unwrap().index, Some(2));

        assert_eq!(wizards[1].bg_input, Some(180.0));
        assert_eq!(wizards[1].insulin_on_board, Some(0.2));
        assert_eq!(wizards[1].recommended.as_ref().unwrap().net, Some(0.8));
        assert_eq!(wizards[1].insulin_sensitivity, Some(50.0));
        assert!(wizards[1].bolus.as_ref().unwrap().time.is_some());
    }
}
