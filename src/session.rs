//! Session state machine
//!
//! Every driver walks the same stages:
//! `detect → setup → connect → get_config_info → fetch_data → process_data →
//! upload_data → disconnect → cleanup`. A failing stage aborts the rest, but
//! `disconnect` and `cleanup` always run.

use chrono::{DateTime, NaiveDateTime, Utc};
use chrono_tz::Tz;
use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::config::{DeltaStore, Period, SessionConfig};
use crate::error::{DeviceTimeError, NoRecordsError, Result, StageError, TimezoneError, UplinkError};
use crate::records::{end_position, newer_than, RawRecord};
use crate::simulator::update_previous_durations;
use crate::timezone::{parse_timezone, TimezoneOffsetUtil};
use crate::transport::DeviceDescriptor;
use crate::types::{
    annotate, format_device_time, format_utc, Annotation, ClinicalEvent, DeltaInfo, DeviceTag,
    SessionInfo, TimeProcessing,
};
use crate::upload::{upload_in_batches, UploadAdapter};

pub const WRONG_DEVICE_TIME: &str = "wrong-device-time";

/// One step of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    Detect,
    Setup,
    Connect,
    GetConfigInfo,
    FetchData,
    ProcessData,
    UploadData,
    Disconnect,
    Cleanup,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Detect => "detect",
            Stage::Setup => "setup",
            Stage::Connect => "connect",
            Stage::GetConfigInfo => "getConfigInfo",
            Stage::FetchData => "fetchData",
            Stage::ProcessData => "processData",
            Stage::UploadData => "uploadData",
            Stage::Disconnect => "disconnect",
            Stage::Cleanup => "cleanup",
        }
    }

    /// Share of the whole session, in percent, covered by this stage
    pub fn range(&self) -> (f64, f64) {
        match self {
            Stage::Detect | Stage::Setup => (0.0, 3.0),
            Stage::Connect => (3.0, 6.0),
            Stage::GetConfigInfo => (6.0, 10.0),
            Stage::FetchData => (10.0, 70.0),
            Stage::ProcessData => (70.0, 75.0),
            Stage::UploadData => (75.0, 90.0),
            Stage::Disconnect => (90.0, 95.0),
            Stage::Cleanup => (95.0, 100.0),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type ProgressFn = Box<dyn FnMut(Stage, f64) + Send>;

/// Scales stage-local progress into the session's overall percentage
pub struct Progress {
    stage: Stage,
    last: f64,
    callback: Option<ProgressFn>,
}

impl Progress {
    pub fn new<F>(callback: F) -> Self
    where
        F: FnMut(Stage, f64) + Send + 'static,
    {
        Self {
            stage: Stage::Setup,
            last: 0.0,
            callback: Some(Box::new(callback)),
        }
    }

    /// Progress that goes nowhere
    pub fn silent() -> Self {
        Self {
            stage: Stage::Setup,
            last: 0.0,
            callback: None,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Overall percentage reported so far
    pub fn overall(&self) -> f64 {
        self.last
    }

    pub fn set_stage(&mut self, stage: Stage) {
        self.stage = stage;
        self.report(0.0);
    }

    /// Report `percent` (0 to 100) of the current stage as done
    pub fn report(&mut self, percent: f64) {
        let (low, high) = self.stage.range();
        let scaled = low + (high - low) * percent.clamp(0.0, 100.0) / 100.0;
        // never move backwards
        self.last = self.last.max(scaled);
        let (stage, overall) = (self.stage, self.last);
        if let Some(callback) = self.callback.as_mut() {
            callback(stage, overall);
        }
    }
}

/// What `get_config_info` learned about the device
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub model: String,
    pub serial_number: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware: Option<String>,
    pub device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_time: Option<NaiveDateTime>,
    pub manufacturers: Vec<String>,
    pub tags: Vec<DeviceTag>,
}

/// Source of the reference time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Always the same instant
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// State shared by every stage of one session
pub struct SessionData {
    pub config: SessionConfig,
    pub device: DeviceDescriptor,
    pub info: DeviceInfo,
    /// Position of the newest record already uploaded
    pub last_end_position: Option<u64>,
    /// Position of the newest record in this upload
    pub new_end_position: Option<u64>,
    /// Canonical events ready for upload
    pub post_records: Vec<ClinicalEvent>,
    pub time_processing: TimeProcessing,
    /// Session-level annotations, such as `wrong-device-time`
    pub annotations: Vec<Annotation>,
    pub started: DateTime<Utc>,
    clock: Arc<dyn Clock>,
}

impl SessionData {
    pub fn new(config: SessionConfig, device: DeviceDescriptor) -> Self {
        Self {
            config,
            device,
            info: DeviceInfo::default(),
            last_end_position: None,
            new_end_position: None,
            post_records: Vec::new(),
            time_processing: TimeProcessing::AcrossTheBoard,
            annotations: Vec::new(),
            started: Utc::now(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.started = clock.now();
        self.clock = clock;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn timezone(&self) -> std::result::Result<Tz, TimezoneError> {
        parse_timezone(&self.config.timezone)
    }

    /// Current wall-clock time in the user's timezone
    pub fn reference_local_time(&self) -> std::result::Result<NaiveDateTime, TimezoneError> {
        let tz = self.timezone()?;
        Ok(self.now().with_timezone(&tz).naive_local())
    }

    pub fn annotate(&mut self, annotation: Annotation) {
        annotate(&mut self.annotations, annotation);
    }

    /// Fill in UTC times for `events` from the device's clock changes
    ///
    /// Returns the clock changes themselves, reconciled, for inclusion in the
    /// upload. Events that fall outside every offset interval are dropped.
    pub fn reconcile(
        &mut self,
        events: Vec<ClinicalEvent>,
        changes: Vec<ClinicalEvent>,
    ) -> std::result::Result<(Vec<ClinicalEvent>, Vec<ClinicalEvent>), TimezoneError> {
        let tz = self.timezone()?;
        let most_recent = events
            .iter()
            .chain(changes.iter())
            .map(|e| e.device_time)
            .max()
            .map(|local| crate::timezone::apply_timezone(local, &tz))
            .unwrap_or_else(|| self.now());

        let util = TimezoneOffsetUtil::with_rounding(
            &self.config.timezone,
            &format_utc(&most_recent),
            changes,
            self.config.offset_rounding_minutes,
        )?;
        self.time_processing = util.time_processing();

        let device_id = self.info.device_id.clone();
        let mut placed = Vec::with_capacity(events.len());
        for mut event in events {
            let local = event.device_time;
            if util.fill_in_utc_info(&mut event, local) {
                event.device_id = device_id.clone();
                placed.push(event);
            } else {
                warn!(
                    "dropping {} at {}: no offset interval matched",
                    event.type_name(),
                    format_device_time(&local)
                );
            }
        }
        let changes = util
            .into_records()
            .into_iter()
            .map(|e| e.with_device_id(&device_id))
            .collect();
        Ok((placed, changes))
    }

    /// Metadata for the upload record
    pub fn session_info(&self) -> SessionInfo {
        SessionInfo {
            upload_id: uuid::Uuid::new_v4(),
            device_tags: self.info.tags.clone(),
            device_manufacturers: self.info.manufacturers.clone(),
            device_model: self.info.model.clone(),
            device_serial_number: self.info.serial_number.clone(),
            device_id: self.info.device_id.clone(),
            device_time: self.info.device_time,
            start: self.started,
            time_processing: self.time_processing,
            tz_name: self.config.timezone.clone(),
            version: self.config.version.clone(),
            delta: self.new_end_position.map(|position| DeltaInfo {
                last_end_position: position,
            }),
            annotations: self.annotations.clone(),
        }
    }
}

/// Keep the records a delta upload needs and note the new end position
///
/// A device with no records at all is `NoRecords`; with nothing after the
/// stored position it is `NoNewRecords`.
pub fn apply_delta<K>(
    records: Vec<RawRecord<K>>,
    data: &mut SessionData,
) -> std::result::Result<Vec<RawRecord<K>>, NoRecordsError> {
    if records.is_empty() {
        return Err(NoRecordsError::NoRecords);
    }
    let position = match data.config.period {
        Period::Delta => data.last_end_position,
        Period::All => None,
    };
    let total = records.len();
    let kept = newer_than(records, position);
    if kept.is_empty() {
        return Err(NoRecordsError::NoNewRecords {
            last_end_position: position.unwrap_or_default(),
        });
    }
    debug!("keeping {} of {} records after {:?}", kept.len(), total, position);
    data.new_end_position = end_position(&kept);
    Ok(kept)
}

/// Result of comparing the device clock with the reference clock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockCheck {
    InTolerance,
    /// The driver should write this local time to the device
    Write(NaiveDateTime),
    /// Left alone; the session carries `wrong-device-time`
    Annotated,
}

/// Verify the device clock against the reference time in the user's zone
pub fn check_device_time(
    data: &mut SessionData,
    device_time: NaiveDateTime,
    can_write: bool,
) -> std::result::Result<ClockCheck, TimezoneError> {
    data.info.device_time = Some(device_time);
    let reference = data.reference_local_time()?;
    let difference = (device_time - reference).num_minutes();
    if difference.abs() <= data.config.time_tolerance_minutes {
        return Ok(ClockCheck::InTolerance);
    }
    if data.config.set_device_time && can_write {
        info!("device clock is {} minutes off, updating", difference);
        return Ok(ClockCheck::Write(reference));
    }
    let mismatch = DeviceTimeError::Mismatch {
        device: format_device_time(&device_time),
        reference: format_device_time(&reference),
        difference_minutes: difference,
    };
    warn!("{}", mismatch);
    data.annotate(Annotation::new(WRONG_DEVICE_TIME));
    Ok(ClockCheck::Annotated)
}

/// Hand `post_records` to the uploader in batches
///
/// In delta mode the newest basal and suspend already on the platform get
/// their durations fixed by the first records of this upload.
pub async fn upload_records(
    data: &mut SessionData,
    uploader: &dyn UploadAdapter,
    progress: &mut Progress,
) -> Result<usize> {
    let mut events = std::mem::take(&mut data.post_records);
    for event in events.iter_mut() {
        event.index = None;
    }

    if data.config.period == Period::Delta && data.last_end_position.is_some() {
        let device_id = data.info.device_id.as_str();
        let last_basal = uploader.latest_record(device_id, "basal", None).await?;
        let last_status = uploader
            .latest_record(device_id, "deviceEvent", Some("status"))
            .await?;
        update_previous_durations(&mut events, last_basal.as_ref(), last_status.as_ref());
    }

    let info = data.session_info();
    uploader.start_session(&info).await?;
    let stored = upload_in_batches(uploader, &events, &info, data.config.batch_size, |p| {
        progress.report(p)
    })
    .await?;
    uploader.finish_session(&info).await?;
    info!("uploaded {} records for {}", stored, info.device_id);
    data.post_records = events;
    Ok(stored)
}

/// One device family's implementation of the session stages
#[async_trait::async_trait]
pub trait DeviceDriver: Send {
    /// Family key, as in the manifest
    fn name(&self) -> &'static str;

    /// Whether `detect` can identify the device without a full connect
    fn supports_detect(&self) -> bool {
        false
    }

    async fn detect(&mut self, data: &mut SessionData, progress: &mut Progress) -> Result<()> {
        let _ = (data, progress);
        Ok(())
    }

    async fn setup(&mut self, data: &mut SessionData, progress: &mut Progress) -> Result<()>;

    async fn connect(&mut self, data: &mut SessionData, progress: &mut Progress) -> Result<()>;

    /// Model, serial, firmware and the device clock check
    async fn get_config_info(&mut self, data: &mut SessionData, progress: &mut Progress) -> Result<()>;

    async fn fetch_data(&mut self, data: &mut SessionData, progress: &mut Progress) -> Result<()>;

    /// Parse and reconstruct into `data.post_records`
    async fn process_data(&mut self, data: &mut SessionData, progress: &mut Progress) -> Result<()>;

    async fn upload_data(
        &mut self,
        data: &mut SessionData,
        uploader: &dyn UploadAdapter,
        progress: &mut Progress,
    ) -> Result<usize> {
        upload_records(data, uploader, progress).await
    }

    async fn disconnect(&mut self, data: &mut SessionData, progress: &mut Progress) -> Result<()>;

    async fn cleanup(&mut self, data: &mut SessionData, progress: &mut Progress) -> Result<()>;
}

/// How a session ended when nothing went wrong
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    Uploaded {
        count: usize,
        last_end_position: Option<u64>,
    },
    /// The device had nothing (new) to upload
    UpToDate(NoRecordsError),
}

fn stage_error(stage: Stage, data: &SessionData, source: UplinkError) -> StageError {
    let mut err = StageError::new(stage, source);
    if !data.info.model.is_empty() {
        err.model = Some(data.info.model.clone());
    }
    err.firmware = data.info.firmware.clone();
    err
}

/// Aborts a running session from another task
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<watch::Sender<bool>>);

impl CancelHandle {
    /// A handle and the signal a session listens on
    pub fn pair() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (Self(Arc::new(tx)), CancelSignal(rx))
    }

    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Receiving side of a [`CancelHandle`]
#[derive(Debug, Clone)]
pub struct CancelSignal(watch::Receiver<bool>);

impl CancelSignal {
    /// A signal that never fires
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once the handle cancels; pends forever if it is dropped first
    pub async fn cancelled(&mut self) {
        loop {
            let cancelled = *self.0.borrow_and_update();
            if cancelled {
                return;
            }
            if self.0.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Drives a [`DeviceDriver`] through its stages
pub struct SessionRunner;

impl SessionRunner {
    /// Run a full upload session
    ///
    /// `disconnect` and `cleanup` run whatever happens before them. Running
    /// out of records is reported as [`SessionOutcome::UpToDate`].
    pub async fn run<D>(
        driver: &mut D,
        data: &mut SessionData,
        uploader: &dyn UploadAdapter,
        store: &mut DeltaStore,
        progress: &mut Progress,
    ) -> std::result::Result<SessionOutcome, StageError>
    where
        D: DeviceDriver + ?Sized,
    {
        Self::run_until_cancelled(driver, data, uploader, store, progress, CancelSignal::never())
            .await
    }

    /// Like [`SessionRunner::run`], but stops at the first await after `cancel`
    /// fires and reports [`UplinkError::Cancelled`] against the interrupted stage.
    /// The device is still disconnected and cleaned up.
    pub async fn run_until_cancelled<D>(
        driver: &mut D,
        data: &mut SessionData,
        uploader: &dyn UploadAdapter,
        store: &mut DeltaStore,
        progress: &mut Progress,
        mut cancel: CancelSignal,
    ) -> std::result::Result<SessionOutcome, StageError>
    where
        D: DeviceDriver + ?Sized,
    {
        info!("starting {} session ({})", driver.name(), data.config.period.as_str());
        let finished = if cancel.is_cancelled() {
            None
        } else {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = Self::run_stages(driver, data, uploader, store, progress) => Some(result),
            }
        };
        let result = match finished {
            Some(result) => result,
            None => {
                warn!("{} session cancelled during {}", driver.name(), progress.stage());
                Err(stage_error(progress.stage(), data, UplinkError::Cancelled))
            }
        };
        let closed = Self::close(driver, data, progress).await;

        match result {
            Ok(outcome) => closed.map(|_| outcome),
            Err(StageError {
                source: UplinkError::NoRecords(reason),
                ..
            }) => {
                info!("{}: {}", driver.name(), reason);
                Ok(SessionOutcome::UpToDate(reason))
            }
            Err(err) => {
                warn!("{} session failed: {}", driver.name(), err);
                Err(err)
            }
        }
    }

    async fn run_stages<D>(
        driver: &mut D,
        data: &mut SessionData,
        uploader: &dyn UploadAdapter,
        store: &mut DeltaStore,
        progress: &mut Progress,
    ) -> std::result::Result<SessionOutcome, StageError>
    where
        D: DeviceDriver + ?Sized,
    {
        progress.set_stage(Stage::Setup);
        driver
            .setup(data, progress)
            .await
            .map_err(|e| stage_error(Stage::Setup, data, e))?;

        progress.set_stage(Stage::Connect);
        driver
            .connect(data, progress)
            .await
            .map_err(|e| stage_error(Stage::Connect, data, e))?;

        progress.set_stage(Stage::GetConfigInfo);
        driver
            .get_config_info(data, progress)
            .await
            .map_err(|e| stage_error(Stage::GetConfigInfo, data, e))?;
        if data.config.period == Period::Delta {
            data.last_end_position = store
                .last_end_position(&data.info.device_id)
                .or(data.last_end_position);
        }
        info!(
            "{} {} (serial {}), last end position {:?}",
            driver.name(),
            data.info.model,
            data.info.serial_number,
            data.last_end_position
        );

        progress.set_stage(Stage::FetchData);
        driver
            .fetch_data(data, progress)
            .await
            .map_err(|e| stage_error(Stage::FetchData, data, e))?;

        progress.set_stage(Stage::ProcessData);
        driver
            .process_data(data, progress)
            .await
            .map_err(|e| stage_error(Stage::ProcessData, data, e))?;

        progress.set_stage(Stage::UploadData);
        let count = driver
            .upload_data(data, uploader, progress)
            .await
            .map_err(|e| stage_error(Stage::UploadData, data, e))?;

        if let Some(position) = data.new_end_position {
            store.record(&data.info.device_id, position);
        }
        Ok(SessionOutcome::Uploaded {
            count,
            last_end_position: data.new_end_position,
        })
    }

    async fn close<D>(
        driver: &mut D,
        data: &mut SessionData,
        progress: &mut Progress,
    ) -> std::result::Result<(), StageError>
    where
        D: DeviceDriver + ?Sized,
    {
        progress.set_stage(Stage::Disconnect);
        let disconnected = driver
            .disconnect(data, progress)
            .await
            .map_err(|e| stage_error(Stage::Disconnect, data, e));
        progress.set_stage(Stage::Cleanup);
        let cleaned = driver
            .cleanup(data, progress)
            .await
            .map_err(|e| stage_error(Stage::Cleanup, data, e));
        progress.report(100.0);
        disconnected.and(cleaned)
    }

    /// Identify the device without fetching data
    pub async fn detect<D>(
        driver: &mut D,
        data: &mut SessionData,
        progress: &mut Progress,
    ) -> std::result::Result<DeviceInfo, StageError>
    where
        D: DeviceDriver + ?Sized,
    {
        if driver.supports_detect() {
            progress.set_stage(Stage::Detect);
            driver
                .detect(data, progress)
                .await
                .map_err(|e| stage_error(Stage::Detect, data, e))?;
            return Ok(data.info.clone());
        }

        progress.set_stage(Stage::Setup);
        let opened = match driver.setup(data, progress).await {
            Ok(()) => {
                progress.set_stage(Stage::Connect);
                driver
                    .connect(data, progress)
                    .await
                    .map_err(|e| stage_error(Stage::Connect, data, e))
            }
            Err(e) => Err(stage_error(Stage::Setup, data, e)),
        };
        let closed = Self::close(driver, data, progress).await;
        opened?;
        closed?;
        Ok(data.info.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventKind, Smbg};
    use crate::upload::RecordingUploader;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    struct MockDriver {
        calls: Vec<Stage>,
        fail_at: Option<Stage>,
        records: Vec<RawRecord<f64>>,
        kept: Vec<RawRecord<f64>>,
        /// Cancel from inside fetch_data, then hang like a silent device
        hang_in_fetch: Option<CancelHandle>,
    }

    impl MockDriver {
        fn new(indices: &[u64]) -> Self {
            let records = indices
                .iter()
                .map(|&i| {
                    let time = crate::records::build_device_time(2015, 5, 1, 8, i as u32 % 60, 0).unwrap();
                    RawRecord::new(i, time, 100.0 + i as f64)
                })
                .collect();
            Self {
                calls: Vec::new(),
                fail_at: None,
                records,
                kept: Vec::new(),
                hang_in_fetch: None,
            }
        }

        fn step(&mut self, stage: Stage) -> Result<()> {
            self.calls.push(stage);
            if self.fail_at == Some(stage) {
                return Err(crate::error::TimeoutError { timeout_ms: 1000 }.into());
            }
            Ok(())
        }
    }

    #[async_trait::async_trait]
    impl DeviceDriver for MockDriver {
        fn name(&self) -> &'static str {
            "mock"
        }

        async fn setup(&mut self, _data: &mut SessionData, _progress: &mut Progress) -> Result<()> {
            self.step(Stage::Setup)
        }

        async fn connect(&mut self, _data: &mut SessionData, _progress: &mut Progress) -> Result<()> {
            self.step(Stage::Connect)
        }

        async fn get_config_info(&mut self, data: &mut SessionData, _progress: &mut Progress) -> Result<()> {
            data.info.model = "Mock".to_string();
            data.info.device_id = "Mock-1".to_string();
            self.step(Stage::GetConfigInfo)
        }

        async fn fetch_data(&mut self, data: &mut SessionData, progress: &mut Progress) -> Result<()> {
            self.step(Stage::FetchData)?;
            progress.report(50.0);
            if let Some(handle) = &self.hang_in_fetch {
                handle.cancel();
                std::future::pending::<()>().await;
            }
            self.kept = apply_delta(std::mem::take(&mut self.records), data)?;
            Ok(())
        }

        async fn process_data(&mut self, data: &mut SessionData, _progress: &mut Progress) -> Result<()> {
            self.step(Stage::ProcessData)?;
            let events = self
                .kept
                .iter()
                .map(|r| {
                    ClinicalEvent::new(
                        r.device_time,
                        EventKind::Smbg(Smbg {
                            value: r.kind,
                            units: "mg/dL".to_string(),
                            sub_type: None,
                        }),
                    )
                    .with_index(r.index)
                })
                .collect();
            let (events, _) = data.reconcile(events, Vec::new())?;
            data.post_records = events;
            Ok(())
        }

        async fn upload_data(
            &mut self,
            data: &mut SessionData,
            uploader: &dyn UploadAdapter,
            progress: &mut Progress,
        ) -> Result<usize> {
            self.step(Stage::UploadData)?;
            upload_records(data, uploader, progress).await
        }

        async fn disconnect(&mut self, _data: &mut SessionData, _progress: &mut Progress) -> Result<()> {
            self.step(Stage::Disconnect)
        }

        async fn cleanup(&mut self, _data: &mut SessionData, _progress: &mut Progress) -> Result<()> {
            self.step(Stage::Cleanup)
        }
    }

    fn session(period: Period) -> SessionData {
        let clock = FixedClock(Utc.with_ymd_and_hms(2015, 5, 2, 12, 0, 0).unwrap());
        SessionData::new(
            SessionConfig::new("US/Eastern").with_period(period),
            DeviceDescriptor::new("mock"),
        )
        .with_clock(Arc::new(clock))
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::GetConfigInfo.to_string(), "getConfigInfo");
        assert_eq!(Stage::FetchData.range(), (10.0, 70.0));
    }

    #[tokio::test]
    async fn test_stages_run_in_order() {
        let mut driver = MockDriver::new(&[1, 2, 3]);
        let mut data = session(Period::All);
        let uploader = RecordingUploader::new();
        let mut store = DeltaStore::new();

        let outcome = SessionRunner::run(&mut driver, &mut data, &uploader, &mut store, &mut Progress::silent())
            .await
            .unwrap();

        assert_eq!(
            driver.calls,
            vec![
                Stage::Setup,
                Stage::Connect,
                Stage::GetConfigInfo,
                Stage::FetchData,
                Stage::ProcessData,
                Stage::UploadData,
                Stage::Disconnect,
                Stage::Cleanup,
            ]
        );
        assert_eq!(
            outcome,
            SessionOutcome::Uploaded {
                count: 3,
                last_end_position: Some(3)
            }
        );
        assert_eq!(store.last_end_position("Mock-1"), Some(3));

        let events = uploader.events().await;
        assert!(events.iter().all(|e| e.index.is_none()));
        assert_eq!(events[0].device_id, "Mock-1");
        assert_eq!(events[0].timezone_offset, Some(-240));

        let sessions = uploader.sessions().await;
        assert_eq!(sessions[0].delta, Some(DeltaInfo { last_end_position: 3 }));
    }

    #[tokio::test]
    async fn test_failed_stage_still_disconnects() {
        let mut driver = MockDriver::new(&[1]);
        driver.fail_at = Some(Stage::FetchData);
        let mut data = session(Period::All);
        let uploader = RecordingUploader::new();

        let err = SessionRunner::run(
            &mut driver,
            &mut data,
            &uploader,
            &mut DeltaStore::new(),
            &mut Progress::silent(),
        )
        .await
        .unwrap_err();

        assert_eq!(err.stage, Stage::FetchData);
        assert_eq!(err.model.as_deref(), Some("Mock"));
        assert!(err.source.is_transient());
        assert!(!driver.calls.contains(&Stage::ProcessData));
        assert_eq!(&driver.calls[driver.calls.len() - 2..], &[Stage::Disconnect, Stage::Cleanup]);
        assert_eq!(uploader.calls().await, 0);
    }

    #[tokio::test]
    async fn test_delta_with_nothing_new_skips_upload() {
        let mut driver = MockDriver::new(&[39, 40, 41]);
        let mut data = session(Period::Delta);
        let uploader = RecordingUploader::new();
        let mut store = DeltaStore::new();
        store.record("Mock-1", 41);

        let outcome = SessionRunner::run(&mut driver, &mut data, &uploader, &mut store, &mut Progress::silent())
            .await
            .unwrap();

        let SessionOutcome::UpToDate(reason) = outcome else {
            panic!("expected up to date, got {:?}", outcome);
        };
        assert_eq!(reason.code(), "E_NO_NEW_RECORDS");
        assert_eq!(uploader.calls().await, 0);
        assert!(uploader.sessions().await.is_empty());
        assert!(driver.calls.ends_with(&[Stage::Disconnect, Stage::Cleanup]));
    }

    #[tokio::test]
    async fn test_delta_uploads_only_newer_records() {
        let mut driver = MockDriver::new(&[40, 41, 42, 43]);
        let mut data = session(Period::Delta);
        let uploader = RecordingUploader::new();
        let mut store = DeltaStore::new();
        store.record("Mock-1", 41);

        let outcome = SessionRunner::run(&mut driver, &mut data, &uploader, &mut store, &mut Progress::silent())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SessionOutcome::Uploaded {
                count: 2,
                last_end_position: Some(43)
            }
        );
        assert_eq!(store.last_end_position("Mock-1"), Some(43));
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let mut progress = Progress::new(move |_stage, pct| sink.lock().unwrap().push(pct));

        let mut driver = MockDriver::new(&[1, 2]);
        let mut data = session(Period::All);
        SessionRunner::run(
            &mut driver,
            &mut data,
            &RecordingUploader::new(),
            &mut DeltaStore::new(),
            &mut progress,
        )
        .await
        .unwrap();

        let seen = seen.lock().unwrap().clone();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
        assert!(seen.contains(&40.0));
        assert_eq!(seen.last().copied(), Some(100.0));
    }

    #[tokio::test]
    async fn test_detect_falls_back_to_connect() {
        let mut driver = MockDriver::new(&[]);
        let mut data = session(Period::All);
        SessionRunner::detect(&mut driver, &mut data, &mut Progress::silent())
            .await
            .unwrap();
        assert_eq!(
            driver.calls,
            vec![Stage::Setup, Stage::Connect, Stage::Disconnect, Stage::Cleanup]
        );
    }

    #[test]
    fn test_empty_device_has_no_records() {
        let mut data = session(Period::All);
        let err = apply_delta::<()>(Vec::new(), &mut data).unwrap_err();
        assert_eq!(err, NoRecordsError::NoRecords);
    }

    #[test]
    fn test_device_time_check() {
        // reference is 2015-05-02T08:00 in US/Eastern
        let mut data = session(Period::All);
        let close = crate::records::build_device_time(2015, 5, 2, 8, 10, 0).unwrap();
        assert_eq!(check_device_time(&mut data, close, true).unwrap(), ClockCheck::InTolerance);

        let off = crate::records::build_device_time(2015, 5, 2, 9, 0, 0).unwrap();
        assert_eq!(check_device_time(&mut data, off, true).unwrap(), ClockCheck::Annotated);
        assert_eq!(data.annotations, vec![Annotation::new(WRONG_DEVICE_TIME)]);
        assert_eq!(data.info.device_time, Some(off));

        let mut data = session(Period::All);
        data.config.set_device_time = true;
        let reference = crate::records::build_device_time(2015, 5, 2, 8, 0, 0).unwrap();
        assert_eq!(
            check_device_time(&mut data, off, true).unwrap(),
            ClockCheck::Write(reference)
        );
        assert_eq!(check_device_time(&mut data, off, false).unwrap(), ClockCheck::Annotated);
    }

    #[tokio::test]
    async fn test_cancel_mid_fetch_still_closes() {
        let (handle, signal) = CancelHandle::pair();
        let mut driver = MockDriver::new(&[1, 2, 3]);
        driver.hang_in_fetch = Some(handle);
        let mut data = session(Period::All);
        let uploader = RecordingUploader::new();
        let mut store = DeltaStore::new();

        let err = SessionRunner::run_until_cancelled(
            &mut driver,
            &mut data,
            &uploader,
            &mut store,
            &mut Progress::silent(),
            signal,
        )
        .await
        .unwrap_err();

        assert_eq!(err.stage, Stage::FetchData);
        assert!(matches!(err.source, UplinkError::Cancelled));
        assert_eq!(err.source.code(), "E_UPLOAD_CANCELLED");
        assert_eq!(
            driver.calls,
            vec![
                Stage::Setup,
                Stage::Connect,
                Stage::GetConfigInfo,
                Stage::FetchData,
                Stage::Disconnect,
                Stage::Cleanup,
            ]
        );
        assert_eq!(store.last_end_position("Mock-1"), None);
    }

    #[tokio::test]
    async fn test_cancel_before_start_skips_stages() {
        let (handle, signal) = CancelHandle::pair();
        handle.cancel();
        let mut driver = MockDriver::new(&[1]);
        let mut data = session(Period::All);
        let mut store = DeltaStore::new();

        let err = SessionRunner::run_until_cancelled(
            &mut driver,
            &mut data,
            &RecordingUploader::new(),
            &mut store,
            &mut Progress::silent(),
            signal,
        )
        .await
        .unwrap_err();

        assert!(matches!(err.source, UplinkError::Cancelled));
        assert_eq!(driver.calls, vec![Stage::Disconnect, Stage::Cleanup]);
    }
}
