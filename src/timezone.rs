//! Timezone reconciliation
//!
//! Converts device-local timestamps to UTC. Without clock changes every
//! timestamp is read in the user's named zone. With the device's own record
//! of clock changes, the offset is bootstrapped backwards from the most recent
//! datum: each change moves the running offset by the rounded size of the
//! change, and every record index falls into exactly one offset interval.

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use log::debug;

use crate::error::TimezoneError;
use crate::types::{Annotation, ClinicalEvent, DeviceEventSubType, EventKind, TimeProcessing};

/// Offset changes are rounded to this many minutes unless configured otherwise
pub const DEFAULT_ROUNDING_MINUTES: i64 = 60;

/// UTC+14 to UTC-12
const MAX_OFFSET_DIFF_MINUTES: i64 = 1560;
const MAX_TIMEZONE_OFFSET: i32 = 840;
const MIN_TIMEZONE_OFFSET: i32 = -720;
const DAY_MINUTES: i32 = 1440;
const MS_PER_MINUTE: i64 = 60_000;

pub const UNCERTAIN_TIMESTAMP: &str = "uncertain-timestamp";

/// Resolve an IANA zone name
pub fn parse_timezone(name: &str) -> Result<Tz, TimezoneError> {
    name.parse::<Tz>()
        .map_err(|_| TimezoneError::UnknownTimezone(name.to_string()))
}

/// Read a device-local time in `tz`
///
/// Ambiguous local times resolve to the earlier instant; times inside a
/// spring-forward gap use the offset in force before the gap.
pub fn apply_timezone(local: NaiveDateTime, tz: &Tz) -> DateTime<Utc> {
    match tz.from_local_datetime(&local) {
        LocalResult::Single(t) => t.with_timezone(&Utc),
        LocalResult::Ambiguous(earliest, _) => earliest.with_timezone(&Utc),
        LocalResult::None => {
            let before = tz.offset_from_utc_datetime(&(local - Duration::days(1)));
            let seconds = before.fix().local_minus_utc();
            Utc.from_utc_datetime(&(local - Duration::seconds(i64::from(seconds))))
        }
    }
}

/// Minutes east of UTC for `tz` at the instant `utc`
pub fn offset_minutes(utc: &DateTime<Utc>, tz: &Tz) -> i32 {
    tz.offset_from_utc_datetime(&utc.naive_utc()).fix().local_minus_utc() / 60
}

/// UTC instant for a local time under explicit offsets
pub fn time_from_offsets(local: NaiveDateTime, timezone_offset: i32, conversion_offset: i64) -> DateTime<Utc> {
    let utc = local
        - Duration::minutes(i64::from(timezone_offset))
        - Duration::milliseconds(conversion_offset);
    Utc.from_utc_datetime(&utc)
}

/// The UTC fields computed for one timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UtcInfo {
    pub time: DateTime<Utc>,
    pub timezone_offset: i32,
    pub clock_drift_offset: i64,
    pub conversion_offset: i64,
}

/// A device clock change, validated out of a `timeChange` device event
#[derive(Debug, Clone, PartialEq)]
pub struct ClockChange {
    pub from: NaiveDateTime,
    pub to: NaiveDateTime,
    pub index: u64,
    /// Filled in once the change itself has been reconciled
    pub time: Option<DateTime<Utc>>,
}

impl ClockChange {
    pub fn from_event(event: &ClinicalEvent) -> Result<Self, TimezoneError> {
        let change = match &event.kind {
            EventKind::DeviceEvent(e) if e.sub_type == DeviceEventSubType::TimeChange => {
                e.change.as_ref()
            }
            _ => None,
        };
        let change = change.ok_or_else(|| {
            TimezoneError::NotATimeChange(format!(
                "{} at {}",
                event.type_name(),
                event.device_time
            ))
        })?;
        let index = event.index.ok_or_else(|| {
            TimezoneError::NotATimeChange(format!("time change at {} has no index", event.device_time))
        })?;
        Ok(Self {
            from: change.from,
            to: change.to,
            index,
            time: None,
        })
    }

    fn minutes_changed(&self) -> i64 {
        (self.from - self.to).num_minutes()
    }

    fn milliseconds_changed(&self) -> i64 {
        (self.from - self.to).num_seconds() * 1000
    }
}

/// Offsets in force over a span of record indices
#[derive(Debug, Clone, PartialEq)]
struct OffsetInterval {
    start: Option<DateTime<Utc>>,
    end: DateTime<Utc>,
    start_index: Option<u64>,
    end_index: Option<u64>,
    timezone_offset: i32,
    clock_drift_offset: i64,
    conversion_offset: i64,
}

impl OffsetInterval {
    fn contains_index(&self, index: u64) -> bool {
        match (self.start_index, self.end_index) {
            (Some(start), Some(end)) => index > start && index <= end,
            (Some(start), None) => index > start,
            (None, Some(end)) => index <= end,
            (None, None) => false,
        }
    }

    fn contains_time(&self, utc: &DateTime<Utc>) -> bool {
        match self.start {
            Some(start) => *utc >= start,
            None => *utc <= self.end,
        }
    }

    fn info(&self, local: NaiveDateTime) -> UtcInfo {
        UtcInfo {
            time: time_from_offsets(local, self.timezone_offset, self.conversion_offset),
            timezone_offset: self.timezone_offset,
            clock_drift_offset: self.clock_drift_offset,
            conversion_offset: self.conversion_offset,
        }
    }
}

/// Running offsets while walking the clock changes newest to oldest
struct RunningOffsets {
    timezone_offset: i32,
    clock_drift_offset: i64,
    conversion_offset: i64,
    rounding: i64,
}

impl RunningOffsets {
    fn adjust(&mut self, change: &ClockChange) {
        let minutes = change.minutes_changed() as f64;
        let rounding = self.rounding as f64;
        let offset_difference = ((minutes / rounding) + 0.5).floor() as i64 * self.rounding;
        let raw_difference = change.milliseconds_changed();

        if offset_difference.abs() <= MAX_OFFSET_DIFF_MINUTES {
            self.timezone_offset += offset_difference as i32;
            self.clock_drift_offset += raw_difference - offset_difference * MS_PER_MINUTE;
        } else {
            self.conversion_offset += raw_difference;
        }

        // an impossible zone offset is moved a day at a time into the conversion offset
        while self.timezone_offset > MAX_TIMEZONE_OFFSET {
            self.timezone_offset -= DAY_MINUTES;
            self.conversion_offset += i64::from(DAY_MINUTES) * MS_PER_MINUTE;
        }
        while self.timezone_offset < MIN_TIMEZONE_OFFSET {
            self.timezone_offset += DAY_MINUTES;
            self.conversion_offset -= i64::from(DAY_MINUTES) * MS_PER_MINUTE;
        }
    }
}

/// Builds UTC information for every event of one upload
#[derive(Debug, Clone)]
pub struct TimezoneOffsetUtil {
    tz: Tz,
    intervals: Vec<OffsetInterval>,
    records: Vec<ClinicalEvent>,
}

impl TimezoneOffsetUtil {
    /// Set up reconciliation with the default offset rounding
    pub fn new(
        tz_name: &str,
        most_recent: &str,
        changes: Vec<ClinicalEvent>,
    ) -> Result<Self, TimezoneError> {
        Self::with_rounding(tz_name, most_recent, changes, DEFAULT_ROUNDING_MINUTES)
    }

    /// Set up reconciliation, rounding clock changes to `rounding_minutes`
    pub fn with_rounding(
        tz_name: &str,
        most_recent: &str,
        changes: Vec<ClinicalEvent>,
        rounding_minutes: i64,
    ) -> Result<Self, TimezoneError> {
        let tz = parse_timezone(tz_name)?;
        let most_recent = DateTime::parse_from_rfc3339(most_recent)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| TimezoneError::InvalidTimestamp(most_recent.to_string()))?;

        let mut parsed = changes
            .iter()
            .map(ClockChange::from_event)
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .zip(changes)
            .collect::<Vec<_>>();
        parsed.sort_by(|a, b| b.0.index.cmp(&a.0.index));

        debug!(
            "reconciling {} clock changes in {} (most recent {})",
            parsed.len(),
            tz_name,
            most_recent
        );

        let mut util = Self {
            tz,
            intervals: Vec::new(),
            records: Vec::with_capacity(parsed.len()),
        };
        if parsed.is_empty() {
            return Ok(util);
        }

        let mut running = RunningOffsets {
            timezone_offset: offset_minutes(&most_recent, &tz),
            clock_drift_offset: 0,
            conversion_offset: 0,
            rounding: rounding_minutes.max(1),
        };
        let mut previous: Option<(u64, DateTime<Utc>)> = None;

        for (mut change, mut event) in parsed {
            let time = match previous {
                None => {
                    apply_timezone(change.to, &tz) - Duration::milliseconds(running.conversion_offset)
                }
                Some(_) => time_from_offsets(change.to, running.timezone_offset, running.conversion_offset),
            };
            change.time = Some(time);

            event.time = Some(time);
            event.timezone_offset = Some(running.timezone_offset);
            event.clock_drift_offset = running.clock_drift_offset;
            event.conversion_offset = running.conversion_offset;

            let (end, end_index) = match previous {
                None => (most_recent, None),
                Some((index, time)) => (time, Some(index)),
            };
            util.intervals.push(OffsetInterval {
                start: Some(time),
                end,
                start_index: Some(change.index),
                end_index,
                timezone_offset: running.timezone_offset,
                clock_drift_offset: running.clock_drift_offset,
                conversion_offset: running.conversion_offset,
            });
            running.adjust(&change);

            previous = Some((change.index, time));
            util.records.push(event);
        }

        if let Some((index, time)) = previous {
            util.intervals.push(OffsetInterval {
                start: None,
                end: time,
                start_index: None,
                end_index: Some(index),
                timezone_offset: running.timezone_offset,
                clock_drift_offset: running.clock_drift_offset,
                conversion_offset: running.conversion_offset,
            });
        }
        debug!("computed {} offset intervals", util.intervals.len());
        Ok(util)
    }

    pub fn time_processing(&self) -> TimeProcessing {
        if self.intervals.is_empty() {
            TimeProcessing::AcrossTheBoard
        } else {
            TimeProcessing::UtcBootstrapping
        }
    }

    pub fn timezone(&self) -> &Tz {
        &self.tz
    }

    /// The clock changes, newest first, with their own UTC fields filled in
    pub fn records(&self) -> &[ClinicalEvent] {
        &self.records
    }

    pub fn into_records(self) -> Vec<ClinicalEvent> {
        self.records
    }

    /// UTC information for a local time, by record index when known
    pub fn lookup(&self, local: NaiveDateTime, index: Option<u64>) -> Option<UtcInfo> {
        if self.intervals.is_empty() {
            let time = apply_timezone(local, &self.tz);
            return Some(UtcInfo {
                time,
                timezone_offset: offset_minutes(&time, &self.tz),
                clock_drift_offset: 0,
                conversion_offset: 0,
            });
        }

        for interval in &self.intervals {
            let info = interval.info(local);
            let matched = match index {
                Some(index) => interval.contains_index(index),
                // in range, before the oldest change, or set into the future
                None => interval.contains_time(&info.time),
            };
            if matched {
                return Some(info);
            }
        }
        None
    }

    /// Fill in `time` and the offsets of `event`
    ///
    /// Events without an index are placed by time only and annotated
    /// `uncertain-timestamp`. Returns false when no interval matched.
    pub fn fill_in_utc_info(&self, event: &mut ClinicalEvent, local: NaiveDateTime) -> bool {
        match self.lookup(local, event.index) {
            Some(info) => {
                event.time = Some(info.time);
                event.timezone_offset = Some(info.timezone_offset);
                event.clock_drift_offset = info.clock_drift_offset;
                event.conversion_offset = info.conversion_offset;
                if event.index.is_none() {
                    event.annotate(Annotation::new(UNCERTAIN_TIMESTAMP));
                }
                true
            }
            None => {
                debug!("could not look up UTC info for {} at {}", event.type_name(), local);
                false
            }
        }
    }
}
