//! Error types for device uploads
//!
//! Every failure surfaced by a session falls into one of the categories below.
//! Framing and timeout errors are transient and retried within a bound; the
//! rest are terminal for the session but still let `disconnect`/`cleanup` run.

use thiserror::Error;

use crate::session::Stage;

/// Result type alias for uplink operations
pub type Result<T> = std::result::Result<T, UplinkError>;

/// Main error type for uplink operations
#[derive(Debug, Error)]
pub enum UplinkError {
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Device time error: {0}")]
    DeviceTime(#[from] DeviceTimeError),

    #[error("{0}")]
    NoRecords(#[from] NoRecordsError),

    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolViolationError),

    #[error("Timezone error: {0}")]
    Timezone(#[from] TimezoneError),

    #[error("Upload error: {0}")]
    Upload(#[from] UploadError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Failed to parse device record: {0}")]
    Parse(String),

    #[error("Upload cancelled")]
    Cancelled,
}

impl From<TimeoutError> for UplinkError {
    fn from(e: TimeoutError) -> Self {
        UplinkError::Transport(TransportError::Timeout(e))
    }
}

impl UplinkError {
    /// Timeouts and checksum failures may be retried; nothing else is.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UplinkError::Frame(FrameError::BadChecksum { .. })
                | UplinkError::Transport(TransportError::Timeout(_))
        )
    }

    /// Stable error code shown to the user
    pub fn code(&self) -> &'static str {
        match self {
            UplinkError::NoRecords(e) => e.code(),
            UplinkError::Transport(TransportError::Disconnected { .. })
            | UplinkError::Transport(TransportError::ClaimFailed { .. }) => "E_UNPLUG_AND_RETRY",
            UplinkError::Transport(TransportError::NotFound { .. }) => "E_SERIAL_CONNECTION",
            UplinkError::Transport(_) | UplinkError::Frame(_) => "E_DEVICE_CONNECTION",
            UplinkError::DeviceTime(DeviceTimeError::SetByPump) => "E_DATETIME_SET_BY_PUMP",
            UplinkError::DeviceTime(_) => "E_DEVICE_TIME",
            UplinkError::Upload(UploadError::Duplicate { .. }) => "E_DUPLICATE",
            UplinkError::Upload(_) => "E_SERVER_ERR",
            UplinkError::Timezone(_) | UplinkError::Config(_) | UplinkError::Json(_) => "E_INIT",
            UplinkError::Protocol(_) | UplinkError::Parse(_) => "E_DEVICE_UPLOAD",
            UplinkError::Cancelled => "E_UPLOAD_CANCELLED",
        }
    }
}

/// Errors produced while framing or unframing packets
#[derive(Debug, Error, Clone, PartialEq)]
pub enum FrameError {
    #[error("Bad checksum: expected {expected:#06x}, got {actual:#06x}")]
    BadChecksum { expected: u32, actual: u32 },

    #[error("Expected sync byte {expected:#04x}, got {actual:#04x}")]
    BadSync { expected: u8, actual: u8 },

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Payload too large for frame: {size} bytes exceeds {max}")]
    PayloadTooLarge { size: usize, max: usize },
}

/// No response within the bound
#[derive(Debug, Error, Clone, PartialEq)]
#[error("No response after {timeout_ms}ms")]
pub struct TimeoutError {
    pub timeout_ms: u64,
}

/// Errors from the device link itself
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{0}")]
    Timeout(#[from] TimeoutError),

    #[error("Device disconnected: {reason}")]
    Disconnected { reason: String },

    #[error("Permission denied opening {device}")]
    PermissionDenied { device: String },

    #[error("Could not claim interface on {device}")]
    ClaimFailed { device: String },

    #[error("Device not found: {device}")]
    NotFound { device: String },

    #[error("Transport is not connected")]
    NotConnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Hint shown next to the error
    pub fn remediation(&self) -> &'static str {
        match self {
            TransportError::Timeout(_) => "Make sure the device is awake and retry",
            TransportError::Disconnected { .. } | TransportError::ClaimFailed { .. } => {
                "Please unplug device and try again"
            }
            TransportError::PermissionDenied { .. } => {
                "Close other software that may be talking to the device"
            }
            TransportError::NotFound { .. } | TransportError::NotConnected => {
                "Your device doesn't appear to be connected"
            }
            TransportError::Io(_) => "Try another USB cable or port",
        }
    }
}

/// Device clock problems found during `get_config_info`
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DeviceTimeError {
    #[error("Device time {device} is {difference_minutes} minutes away from {reference}")]
    Mismatch {
        device: String,
        reference: String,
        difference_minutes: i64,
    },

    #[error("Device date/time is controlled by the linked pump")]
    SetByPump,

    #[error("Device rejected the new time")]
    WriteRejected,
}

/// The device has nothing to upload; surfaced as "up to date", not a failure
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NoRecordsError {
    #[error("No records to upload")]
    NoRecords,

    #[error("No new records to upload since position {last_end_position}")]
    NoNewRecords { last_end_position: u64 },
}

impl NoRecordsError {
    pub fn code(&self) -> &'static str {
        match self {
            NoRecordsError::NoRecords => "E_NO_RECORDS",
            NoRecordsError::NoNewRecords { .. } => "E_NO_NEW_RECORDS",
        }
    }
}

/// Broken invariants and unexpected device behaviour
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolViolationError {
    #[error("Event at {current} arrived after {previous}")]
    OutOfOrder { previous: String, current: String },

    #[error("Device sent NAK: {reason} ({code:#04x})")]
    Nak { code: u8, reason: String },

    #[error("Unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse { expected: String, actual: String },

    #[error("Communication retry limit reached after {attempts} attempts")]
    RetryLimitReached { attempts: u32 },

    #[error("Incompatible device: {0}")]
    Incompatible(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

/// Timezone reconciliation construction errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TimezoneError {
    #[error("Unrecognized timezone name: {0}")]
    UnknownTimezone(String),

    #[error("Invalid timestamp for most recent datum: {0}")]
    InvalidTimestamp(String),

    #[error("Wrong subType of object passed as time change: {0}")]
    NotATimeChange(String),
}

/// Errors reported by an upload adapter
#[derive(Debug, Error, Clone, PartialEq)]
pub enum UploadError {
    #[error("Payload of {count} records too large")]
    PayloadTooLarge { count: usize },

    #[error("Duplicate upload detected at record {index:?}")]
    Duplicate { index: Option<usize> },

    #[error("Upload rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Upload failed: {0}")]
    Failed(String),
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// A failed session stage, with enough context for remote diagnosis
#[derive(Debug, Error)]
#[error(
    "Stage {stage} failed (model {}, firmware {}): {source}",
    or_unknown(.model),
    or_unknown(.firmware)
)]
pub struct StageError {
    pub stage: Stage,
    pub model: Option<String>,
    pub firmware: Option<String>,
    #[source]
    pub source: UplinkError,
}

impl StageError {
    pub fn new(stage: Stage, source: UplinkError) -> Self {
        Self {
            stage,
            model: None,
            firmware: None,
            source,
        }
    }

    /// True when the session ended because there was nothing new to upload
    pub fn is_up_to_date(&self) -> bool {
        matches!(self.source, UplinkError::NoRecords(_))
    }
}

fn or_unknown(value: &Option<String>) -> &str {
    value.as_deref().unwrap_or("unknown")
}
