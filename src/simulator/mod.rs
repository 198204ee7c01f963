//! Event reconstruction
//!
//! Device logs record discrete actions: a basal rate was set, a bolus started,
//! delivery was suspended. The simulator folds those entries, in time order,
//! into continuous clinical events: basal segments with durations, suspends
//! paired with their resumes, boluses amended by their terminations.
//!
//! Basal events are only emitted once the next basal (or `finalize`) fixes
//! their duration, so `events` re-sorts the output by time.

pub mod schedule;

use chrono::NaiveDateTime;
use log::debug;
use serde_json::json;
use std::collections::HashSet;

use crate::error::ProtocolViolationError;
use crate::normalizer::fix_floating_point;
use crate::types::{
    format_device_time, Annotation, BolusSubType, ClinicalEvent, DeliveryType, EventKind,
    PumpSettings, SuppressedBasal,
};

pub use schedule::{FABRICATED_FROM_SCHEDULE, UNKNOWN_DURATION};

pub const FLAT_RATE: &str = "basal/flat-rate";

/// Longest duration a single flat-rate basal may claim
pub const MAX_BASAL_DURATION_MS: i64 = 5 * 1440 * 60_000;

/// A bolus cut short on the device
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Termination {
    /// Units programmed but not delivered
    pub missed_insulin: f64,
    /// Milliseconds of extended delivery that did not run
    pub duration_left_ms: i64,
}

/// Everything the simulator still holds open
#[derive(Debug, Clone, Default)]
pub struct PendingState {
    /// Basal awaiting the next basal to fix its duration
    pub basal: Option<ClinicalEvent>,
    /// Position in the output of the bolus a termination would amend
    pub bolus: Option<usize>,
    /// Last suspend or resume
    pub status: Option<ClinicalEvent>,
    /// Pod activation waiting to be confirmed as a resume
    pub activation: Option<ClinicalEvent>,
    /// Latest timestamp accepted so far
    pub last_time: Option<NaiveDateTime>,
}

impl PendingState {
    pub fn is_suspended(&self) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.device_event())
            .map_or(false, |e| e.is_suspend())
    }
}

/// The instant used to order events: UTC once reconciled, else device time
pub fn instant(event: &ClinicalEvent) -> NaiveDateTime {
    event.time.map(|t| t.naive_utc()).unwrap_or(event.device_time)
}

fn millis_between(later: &ClinicalEvent, earlier: &ClinicalEvent) -> i64 {
    (instant(later) - instant(earlier)).num_milliseconds()
}

/// Folds device log entries into clinical events
pub struct Simulator {
    source: String,
    settings: Option<PumpSettings>,
    state: PendingState,
    events: Vec<ClinicalEvent>,
}

impl Simulator {
    /// `source` prefixes source-specific annotations, e.g. `insulet`
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            settings: None,
            state: PendingState::default(),
            events: Vec::new(),
        }
    }

    /// Settings used to give the final scheduled basal a duration
    pub fn with_settings(mut self, settings: PumpSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    pub fn state(&self) -> &PendingState {
        &self.state
    }

    fn ensure_order(&mut self, event: &ClinicalEvent) -> Result<(), ProtocolViolationError> {
        let time = instant(event);
        if let Some(last) = self.state.last_time {
            if last > time {
                return Err(ProtocolViolationError::OutOfOrder {
                    previous: format_device_time(&last),
                    current: format_device_time(&time),
                });
            }
        }
        self.state.last_time = Some(time);
        Ok(())
    }

    /// Events that need no reconstruction: smbg, cbg, wizard, alarm, settings
    pub fn simulate(&mut self, event: ClinicalEvent) -> Result<(), ProtocolViolationError> {
        self.ensure_order(&event)?;
        self.events.push(event);
        Ok(())
    }

    pub fn smbg(&mut self, event: ClinicalEvent) -> Result<(), ProtocolViolationError> {
        self.simulate(event)
    }

    pub fn wizard(&mut self, event: ClinicalEvent) -> Result<(), ProtocolViolationError> {
        self.simulate(event)
    }

    pub fn alarm(&mut self, event: ClinicalEvent) -> Result<(), ProtocolViolationError> {
        self.simulate(event)
    }

    pub fn change_device_time(&mut self, event: ClinicalEvent) -> Result<(), ProtocolViolationError> {
        self.simulate(event)
    }

    pub fn change_reservoir(&mut self, event: ClinicalEvent) -> Result<(), ProtocolViolationError> {
        self.simulate(event)
    }

    pub fn pump_settings(&mut self, event: ClinicalEvent) -> Result<(), ProtocolViolationError> {
        self.simulate(event)
    }

    pub fn bolus(&mut self, event: ClinicalEvent) -> Result<(), ProtocolViolationError> {
        self.simulate(event)?;
        self.state.bolus = Some(self.events.len() - 1);
        Ok(())
    }

    /// Amend the open bolus with what its termination says was not delivered
    pub fn bolus_termination(&mut self, termination: Termination) {
        let bolus = self
            .state
            .bolus
            .and_then(|i| self.events.get_mut(i))
            .and_then(|e| e.bolus_mut());
        let Some(bolus) = bolus else {
            debug!("no bolus to amend with termination {:?}, device was likely reset", termination);
            return;
        };

        let missed = termination.missed_insulin;
        if bolus.sub_type != BolusSubType::Normal && termination.duration_left_ms > 0 {
            let extended = bolus.extended.unwrap_or(0.0);
            bolus.expected_extended = Some(fix_floating_point(extended + missed, 2));
            bolus.expected_duration = Some(bolus.duration.unwrap_or(0) + termination.duration_left_ms);
        } else {
            let normal = bolus.normal.unwrap_or(0.0);
            bolus.expected_normal = Some(fix_floating_point(normal + missed, 2));
        }
    }

    /// Record a pod activation; it becomes a resume once a basal confirms delivery
    pub fn pod_activation(&mut self, event: ClinicalEvent) -> Result<(), ProtocolViolationError> {
        self.ensure_order(&event)?;
        self.state.activation = Some(event);
        Ok(())
    }

    pub fn suspend(&mut self, event: ClinicalEvent) -> Result<(), ProtocolViolationError> {
        if self.state.is_suspended() {
            return Ok(());
        }
        self.ensure_order(&event)?;
        // a stray activation is no longer relevant once delivery stops again
        self.state.activation = None;
        self.state.status = Some(event.clone());
        self.events.push(event);
        Ok(())
    }

    pub fn resume(&mut self, mut event: ClinicalEvent) -> Result<(), ProtocolViolationError> {
        self.ensure_order(&event)?;
        if self.state.is_suspended() {
            let previous = self.state.status.as_ref().map(|s| s.as_previous());
            if let Some(resume) = event.device_event_mut() {
                resume.previous = previous;
            }
        }
        self.state.status = Some(event.clone());
        self.events.push(event);
        Ok(())
    }

    /// Turn the pending activation into a resume, linked to the open suspend
    fn complete_activation(&mut self) {
        let Some(mut resume) = self.state.activation.take() else {
            return;
        };
        let previous = if self.state.is_suspended() {
            self.state.status.as_ref().map(|s| s.as_previous())
        } else {
            None
        };
        if let Some(e) = resume.device_event_mut() {
            e.previous = previous;
            e.reason = Some(json!({ "resumed": "manual" }));
        }
        self.state.status = Some(resume.clone());
        self.events.push(resume);
    }

    pub fn basal(&mut self, mut event: ClinicalEvent) -> Result<(), ProtocolViolationError> {
        self.ensure_order(&event)?;
        let incoming = match event.basal() {
            Some(b) => b.delivery_type,
            None => return self.simulate_unexpected(event),
        };

        match self.state.basal.take() {
            Some(mut current) => {
                let current_type = current.basal().map(|b| b.delivery_type);
                if current_type == Some(DeliveryType::Suspend) && incoming == DeliveryType::Suspend {
                    self.state.basal = Some(current);
                    return Ok(());
                }
                if self.state.is_suspended() {
                    if self.state.activation.is_some() {
                        self.complete_activation();
                    } else if incoming != DeliveryType::Suspend {
                        // delivery moved on without a recorded resume
                        self.state.status = None;
                    }
                }

                let elapsed = millis_between(&event, &current);
                if let Some(b) = current.basal_mut() {
                    if b.duration.is_none() {
                        b.duration = Some(elapsed);
                    }
                }
                fill_in_suppressed(&mut current);
                truncate_duration(&mut current);

                if let Some(b) = event.basal_mut() {
                    b.previous = Some(current.as_previous());
                }
                self.events.push(current);
            }
            None => self.complete_activation(),
        }
        self.state.basal = Some(event);
        Ok(())
    }

    fn simulate_unexpected(&mut self, event: ClinicalEvent) -> Result<(), ProtocolViolationError> {
        debug!("{} passed as basal, emitting unchanged", event.type_name());
        self.events.push(event);
        Ok(())
    }

    /// Close the open basal at the end of the stream
    pub fn finalize(&mut self) {
        let Some(mut current) = self.state.basal.take() else {
            return;
        };
        let delivery_type = current.basal().map(|b| b.delivery_type);
        match delivery_type {
            Some(DeliveryType::Temp) => fill_in_suppressed(&mut current),
            Some(DeliveryType::Scheduled) => match &self.settings {
                Some(settings) => schedule::final_scheduled_basal(&mut current, settings, &self.source),
                None => mark_unknown_duration(&mut current),
            },
            _ => {
                if current.basal().map_or(false, |b| b.duration.is_none()) {
                    mark_unknown_duration(&mut current);
                }
            }
        }
        truncate_duration(&mut current);
        self.events.push(current);
    }

    /// The reconstructed events, zero-volume boluses dropped, sorted by time
    pub fn events(self) -> Vec<ClinicalEvent> {
        let mut events = self.events;
        refresh_wizard_boluses(&mut events);

        // boluses a wizard with carbs points at are kept even when empty
        let carb_boluses: HashSet<u64> = events
            .iter()
            .filter_map(|e| match &e.kind {
                EventKind::Wizard(w) if w.carb_input.unwrap_or(0.0) > 0.0 => {
                    w.bolus.as_ref().and_then(|b| b.index)
                }
                _ => None,
            })
            .collect();

        let mut events: Vec<ClinicalEvent> = events
            .into_iter()
            .filter(|e| match &e.kind {
                EventKind::Bolus(b) => {
                    !b.is_zero_volume() || e.index.map_or(false, |i| carb_boluses.contains(&i))
                }
                EventKind::Wizard(w) => match w.bolus.as_ref().and_then(|b| b.bolus()) {
                    Some(bolus) => !bolus.is_zero_volume() || w.carb_input.unwrap_or(0.0) > 0.0,
                    None => true,
                },
                _ => true,
            })
            .collect();
        events.sort_by_key(instant);
        events
    }
}

/// Wizards carry a copy of their bolus; bring it up to date with any amendment
fn refresh_wizard_boluses(events: &mut [ClinicalEvent]) {
    let boluses: Vec<(u64, ClinicalEvent)> = events
        .iter()
        .filter(|e| e.bolus().is_some())
        .filter_map(|e| e.index.map(|i| (i, e.clone())))
        .collect();
    for event in events.iter_mut() {
        if let EventKind::Wizard(w) = &mut event.kind {
            let index = w.bolus.as_ref().and_then(|b| b.index);
            if let Some(found) = index.and_then(|i| boluses.iter().find(|(bi, _)| *bi == i)) {
                w.bolus = Some(Box::new(found.1.clone()));
            }
        }
    }
}

fn mark_unknown_duration(event: &mut ClinicalEvent) {
    if let Some(b) = event.basal_mut() {
        b.duration = Some(0);
    }
    event.annotate(Annotation::new(UNKNOWN_DURATION));
}

/// Carry the scheduled rate a temp basal or suspend replaced
///
/// The suppressed rate comes from the previous scheduled basal, or from what
/// the previous temp basal itself suppressed. Without either it is dropped.
fn fill_in_suppressed(event: &mut ClinicalEvent) {
    let Some(basal) = event.basal_mut() else {
        return;
    };
    if basal.suppressed.is_none() {
        return;
    }
    let source = basal.previous.as_ref().and_then(|p| p.basal()).and_then(|p| {
        match p.delivery_type {
            DeliveryType::Scheduled => Some((p.schedule_name.clone(), p.rate)),
            DeliveryType::Temp => p
                .suppressed
                .as_ref()
                .filter(|s| s.delivery_type == DeliveryType::Scheduled)
                .map(|s| (s.schedule_name.clone(), s.rate)),
            DeliveryType::Suspend => None,
        }
    });
    basal.suppressed = match source {
        Some((Some(schedule_name), rate)) => Some(SuppressedBasal {
            delivery_type: DeliveryType::Scheduled,
            rate,
            schedule_name: Some(schedule_name),
        }),
        _ => None,
    };
}

/// Cap a flat-rate basal at five days; a basal without a duration gets zero
pub fn truncate_duration(event: &mut ClinicalEvent) {
    let Some(basal) = event.basal_mut() else {
        return;
    };
    match basal.duration {
        Some(duration) if duration > MAX_BASAL_DURATION_MS => {
            basal.duration = Some(MAX_BASAL_DURATION_MS);
            event.annotate(Annotation::new(FLAT_RATE));
        }
        Some(_) => {}
        None => mark_unknown_duration(event),
    }
}

/// Annotations that only existed because the following event was missing
const PROVISIONAL_ANNOTATIONS: [&str; 2] = [FABRICATED_FROM_SCHEDULE, UNKNOWN_DURATION];

/// Recompute the duration of `last`, uploaded previously, now that `event` follows it
pub fn update_duration(event: &ClinicalEvent, last: &ClinicalEvent) -> Option<ClinicalEvent> {
    let mut updated_duration = millis_between(event, last);
    if let Some(bolus) = event.bolus() {
        if let (Some(_), Some(duration)) = (bolus.extended, bolus.duration) {
            updated_duration = duration;
        }
    }
    if updated_duration < 0 {
        return None;
    }

    let mut last = last.clone();
    match &mut last.kind {
        EventKind::Basal(b) => {
            if let Some(duration) = b.duration.filter(|d| *d > 0) {
                b.expected_duration = Some(duration);
            }
            b.duration = Some(updated_duration);
        }
        EventKind::DeviceEvent(e) => e.duration = Some(updated_duration),
        _ => return None,
    }
    last.annotations
        .retain(|a| !PROVISIONAL_ANNOTATIONS.contains(&a.code.as_str()));
    Some(last)
}

/// Fix the durations of the last basal and suspend of the previous upload
///
/// `last_basal` and `last_status` are the newest records of those kinds the
/// platform already holds for this device. Updated copies are appended to
/// `records`; a resume merged into the previous suspend is removed.
pub fn update_previous_durations(
    records: &mut Vec<ClinicalEvent>,
    last_basal: Option<&ClinicalEvent>,
    last_status: Option<&ClinicalEvent>,
) {
    let Some(last_basal) = last_basal else {
        return;
    };
    let updated = records
        .iter()
        .find(|e| e.basal().is_some())
        .and_then(|first| update_duration(first, last_basal));
    if let Some(updated) = updated {
        debug!("updating duration of last basal from previous upload");
        records.push(updated);
    }

    let was_suspended = last_basal.basal().map(|b| b.delivery_type) == Some(DeliveryType::Suspend);
    let last_status = last_status.filter(|s| s.device_event().map_or(false, |e| e.is_suspend()));
    let (true, Some(last_status)) = (was_suspended, last_status) else {
        return;
    };
    let Some(position) = records
        .iter()
        .position(|e| e.device_event().map_or(false, |d| d.is_resume()))
    else {
        return;
    };

    if let Some(mut updated) = update_duration(&records[position], last_status) {
        let resumed = records[position]
            .device_event()
            .and_then(|e| e.reason.as_ref())
            .and_then(|r| r.get("resumed"))
            .cloned();
        if let (Some(e), Some(resumed)) = (updated.device_event_mut(), resumed) {
            let mut reason = e.reason.take().unwrap_or_else(|| json!({}));
            if let Some(map) = reason.as_object_mut() {
                map.insert("resumed".to_string(), resumed);
            }
            e.reason = Some(reason);
        }
        records.remove(position);
        records.push(updated);
    }
}
