//! Basal schedule lookups
//!
//! Schedules are lists of segments keyed by milliseconds after local
//! midnight. The last segment runs until midnight.

use chrono::{Duration, NaiveDateTime, Timelike};

use crate::normalizer::fix_floating_point;
use crate::types::{Annotation, ClinicalEvent, PumpSettings, ScheduleSegment};

pub const DAY_MS: i64 = 86_400_000;

pub const UNKNOWN_DURATION: &str = "basal/unknown-duration";
pub const FABRICATED_FROM_SCHEDULE: &str = "final-basal/fabricated-from-schedule";

/// `<source>/basal/off-schedule-rate`
pub fn off_schedule_rate(source: &str) -> String {
    format!("{}/basal/off-schedule-rate", source)
}

/// Local wall-clock time of an event, after reconciliation when available
pub fn local_time(event: &ClinicalEvent) -> NaiveDateTime {
    match (event.time, event.timezone_offset) {
        (Some(time), Some(offset)) => time.naive_utc() + Duration::minutes(i64::from(offset)),
        _ => event.device_time,
    }
}

pub fn ms_from_midnight(event: &ClinicalEvent) -> i64 {
    let local = local_time(event);
    i64::from(local.num_seconds_from_midnight()) * 1000 + i64::from(local.nanosecond() / 1_000_000)
}

/// Index of the segment in force at `ms` after midnight
pub fn segment_index(schedule: &[ScheduleSegment], ms: i64) -> Option<usize> {
    schedule.iter().rposition(|s| s.start <= ms)
}

/// Milliseconds from `ms` until the segment at `index` ends
pub fn remaining_in_segment(schedule: &[ScheduleSegment], index: usize, ms: i64) -> i64 {
    match schedule.get(index + 1) {
        Some(next) => next.start - ms,
        None => DAY_MS - ms,
    }
}

/// Scheduled rate of `schedule_name` at `ms` after midnight
pub fn rate_at(settings: &PumpSettings, schedule_name: &str, ms: i64) -> Option<f64> {
    let schedule = settings.basal_schedules.get(schedule_name)?;
    segment_index(schedule, ms).map(|i| schedule[i].rate)
}

/// Give the last scheduled basal of a stream a duration
///
/// When its rate matches the schedule, the basal is assumed to run to the end
/// of its segment. Otherwise it keeps any duration it has, or gets zero and is
/// flagged.
pub fn final_scheduled_basal(event: &mut ClinicalEvent, settings: &PumpSettings, source: &str) {
    let ms = ms_from_midnight(event);
    let Some(basal) = event.basal() else {
        return;
    };
    let schedule = basal
        .schedule_name
        .as_ref()
        .and_then(|name| settings.basal_schedules.get(name))
        .filter(|schedule| !schedule.is_empty());
    let has_duration = basal.duration.is_some();
    let rate = basal.rate.map(|r| fix_floating_point(r, 3));

    let mut annotations = Vec::new();
    let duration = match schedule {
        None => {
            annotations.push(UNKNOWN_DURATION.to_string());
            None
        }
        Some(schedule) => {
            let index = segment_index(schedule, ms).unwrap_or(0);
            let on_schedule = rate.map_or(false, |r| (schedule[index].rate - r).abs() < 1e-9);
            if on_schedule {
                annotations.push(FABRICATED_FROM_SCHEDULE.to_string());
                Some(remaining_in_segment(schedule, index, ms))
            } else {
                annotations.push(off_schedule_rate(source));
                annotations.push(UNKNOWN_DURATION.to_string());
                None
            }
        }
    };

    let fabricated = duration.is_some();
    if !fabricated && has_duration {
        return;
    }
    if let Some(basal) = event.basal_mut() {
        basal.duration = Some(duration.unwrap_or(0));
    }
    for code in annotations {
        event.annotate(Annotation::new(code));
    }
}
