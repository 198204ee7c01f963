//! Raw device records
//!
//! A record parser turns one validated frame, line or IBF record into a
//! `RawRecord`. The record is consumed exactly once by the driver's
//! `process_data` stage.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Device-specific decoded log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord<K> {
    /// Device sequence number (record number, system seconds, log index)
    pub index: u64,
    /// Device-local timestamp as the device reported it
    pub device_time: NaiveDateTime,
    pub kind: K,
}

impl<K> RawRecord<K> {
    pub fn new(index: u64, device_time: NaiveDateTime, kind: K) -> Self {
        Self {
            index,
            device_time,
            kind,
        }
    }
}

/// Keep only records strictly after `last_end_position`
pub fn newer_than<K>(records: Vec<RawRecord<K>>, last_end_position: Option<u64>) -> Vec<RawRecord<K>> {
    match last_end_position {
        Some(position) => records.into_iter().filter(|r| r.index > position).collect(),
        None => records,
    }
}

/// Highest index in a batch, the next `lastEndPosition`
pub fn end_position<K>(records: &[RawRecord<K>]) -> Option<u64> {
    records.iter().map(|r| r.index).max()
}

/// Build a local timestamp, `None` when the device sent an impossible date
pub fn build_device_time(
    year: i32,
    month: u32,
    day: u32,
    hour: u32,
    minute: u32,
    second: u32,
) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(hour, minute, second)
}

/// Seconds since `epoch`, as used by receivers that count from a fixed base date
pub fn seconds_since(epoch: NaiveDateTime, seconds: i64) -> NaiveDateTime {
    epoch + Duration::seconds(seconds)
}

/// Parse a compact `YYYYMMDDhhmm` timestamp
pub fn parse_compact_timestamp(raw: &str) -> Option<NaiveDateTime> {
    if raw.len() < 12 || !raw.is_char_boundary(12) {
        return None;
    }
    NaiveDateTime::parse_from_str(&raw[..12], "%Y%m%d%H%M").ok()
}
