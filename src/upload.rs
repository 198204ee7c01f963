//! Upload adapter contract
//!
//! The HTTP client lives outside this crate. A session hands its events to an
//! [`UploadAdapter`] in blocks; a block the platform rejects as too large is
//! split in half and retried.

use log::{debug, info, warn};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::error::UploadError;
use crate::types::{ClinicalEvent, SessionInfo};

/// Events per upload request
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Destination for one session's events
#[async_trait::async_trait]
pub trait UploadAdapter: Send + Sync {
    /// Post the upload record before any data
    async fn start_session(&self, info: &SessionInfo) -> Result<(), UploadError> {
        let _ = info;
        Ok(())
    }

    /// Post one block of events; returns how many were stored
    async fn upload(&self, events: &[ClinicalEvent], info: &SessionInfo) -> Result<usize, UploadError>;

    /// Close the upload once every block is stored
    async fn finish_session(&self, info: &SessionInfo) -> Result<(), UploadError> {
        let _ = info;
        Ok(())
    }

    /// Newest stored record of a type for a device, used to fix durations across uploads
    async fn latest_record(
        &self,
        device_id: &str,
        type_name: &str,
        sub_type: Option<&str>,
    ) -> Result<Option<ClinicalEvent>, UploadError> {
        let _ = (device_id, type_name, sub_type);
        Ok(None)
    }
}

/// Upload `events` in blocks of `batch_size`
///
/// `progress` receives the share of blocks sent so far, 0 to 100. A
/// `Duplicate` error reports the index within `events`.
pub async fn upload_in_batches<U, F>(
    adapter: &U,
    events: &[ClinicalEvent],
    info: &SessionInfo,
    batch_size: usize,
    mut progress: F,
) -> Result<usize, UploadError>
where
    U: UploadAdapter + ?Sized,
    F: FnMut(f64) + Send,
{
    let batch_size = batch_size.max(1);
    let blocks: Vec<(usize, &[ClinicalEvent])> = events
        .chunks(batch_size)
        .enumerate()
        .map(|(i, chunk)| (i * batch_size, chunk))
        .collect();
    info!("uploading {} records in {} blocks", events.len(), blocks.len());

    let mut stored = 0;
    for (n, (offset, block)) in blocks.iter().enumerate() {
        progress((n + 1) as f64 / blocks.len() as f64 * 100.0);
        stored += upload_block(adapter, block, *offset, info).await?;
    }
    Ok(stored)
}

/// Post one block, halving it for as long as the platform says it is too large
async fn upload_block<U>(
    adapter: &U,
    block: &[ClinicalEvent],
    offset: usize,
    info: &SessionInfo,
) -> Result<usize, UploadError>
where
    U: UploadAdapter + ?Sized,
{
    // depth-first, left half before right half
    let mut pending = vec![(offset, block)];
    let mut stored = 0;
    while let Some((offset, part)) = pending.pop() {
        match adapter.upload(part, info).await {
            Ok(count) => stored += count,
            Err(UploadError::PayloadTooLarge { .. }) if part.len() > 1 => {
                let half = part.len() / 2;
                warn!("block of {} records too large, splitting", part.len());
                pending.push((offset + half, &part[half..]));
                pending.push((offset, &part[..half]));
            }
            Err(UploadError::Duplicate { index }) => {
                return Err(UploadError::Duplicate {
                    index: index.map(|i| i + offset),
                })
            }
            Err(e) => return Err(e),
        }
    }
    debug!("stored {} records from block at {}", stored, offset);
    Ok(stored)
}

/// Keeps everything it is given; used by replays and tests
#[derive(Default)]
pub struct RecordingUploader {
    batches: Mutex<Vec<Vec<ClinicalEvent>>>,
    sessions: Mutex<Vec<SessionInfo>>,
    max_batch: Option<usize>,
    duplicate_at: Option<usize>,
    latest: HashMap<String, ClinicalEvent>,
}

impl RecordingUploader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject blocks larger than `max` as too large
    pub fn with_max_batch(mut self, max: usize) -> Self {
        self.max_batch = Some(max);
        self
    }

    /// Report a duplicate at this position of the first block containing it
    pub fn with_duplicate_at(mut self, index: usize) -> Self {
        self.duplicate_at = Some(index);
        self
    }

    /// Serve `event` as the newest stored record of its type
    pub fn with_latest_record(mut self, event: ClinicalEvent) -> Self {
        let key = latest_key(event.type_name(), status_sub_type(&event));
        self.latest.insert(key, event);
        self
    }

    pub async fn batches(&self) -> Vec<Vec<ClinicalEvent>> {
        self.batches.lock().await.clone()
    }

    pub async fn events(&self) -> Vec<ClinicalEvent> {
        self.batches.lock().await.iter().flatten().cloned().collect()
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.lock().await.clone()
    }

    /// Number of upload calls that stored data
    pub async fn calls(&self) -> usize {
        self.batches.lock().await.len()
    }
}

fn latest_key(type_name: &str, sub_type: Option<&str>) -> String {
    match sub_type {
        Some(sub_type) => format!("{}/{}", type_name, sub_type),
        None => type_name.to_string(),
    }
}

fn status_sub_type(event: &ClinicalEvent) -> Option<&'static str> {
    event
        .device_event()
        .filter(|e| e.is_suspend() || e.is_resume())
        .map(|_| "status")
}

#[async_trait::async_trait]
impl UploadAdapter for RecordingUploader {
    async fn start_session(&self, info: &SessionInfo) -> Result<(), UploadError> {
        self.sessions.lock().await.push(info.clone());
        Ok(())
    }

    async fn upload(&self, events: &[ClinicalEvent], _info: &SessionInfo) -> Result<usize, UploadError> {
        if let Some(max) = self.max_batch {
            if events.len() > max {
                return Err(UploadError::PayloadTooLarge { count: events.len() });
            }
        }
        if let Some(index) = self.duplicate_at {
            let uploaded: usize = self.batches.lock().await.iter().map(Vec::len).sum();
            if index >= uploaded && index < uploaded + events.len() {
                return Err(UploadError::Duplicate {
                    index: Some(index - uploaded),
                });
            }
        }
        self.batches.lock().await.push(events.to_vec());
        Ok(events.len())
    }

    async fn latest_record(
        &self,
        _device_id: &str,
        type_name: &str,
        sub_type: Option<&str>,
    ) -> Result<Option<ClinicalEvent>, UploadError> {
        Ok(self.latest.get(&latest_key(type_name, sub_type)).cloned())
    }
}
