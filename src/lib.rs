//! Diabetes Uplink - Acquisition and normalization engine for diabetes devices
//!
//! Uplink talks to blood-glucose meters, CGM receivers and insulin pumps over
//! their native link protocols, turns their records into canonical clinical
//! events and hands them to an upload adapter:
//! transport → framing → driver stages → simulation → timezone reconciliation → upload.
//!
//! ## Modules
//!
//! - **Drivers**: Dexcom receivers, Bayer Contour meters, OneTouch UltraMini, Insulet OmniPod
//! - **Session**: the staged upload workflow and delta bookkeeping
//! - **Simulator**: folds pump history into basal segments and paired suspends

pub mod codec;
pub mod config;
pub mod drivers;
pub mod error;
pub mod normalizer;
pub mod records;
pub mod session;
pub mod simulator;
pub mod timezone;
pub mod transport;
pub mod types;
pub mod upload;

pub use config::{DeltaStore, Period, SessionConfig};
pub use drivers::{build_driver, DeviceManifest, DriverKind};
pub use error::{Result, UplinkError};
pub use session::{
    CancelHandle, CancelSignal, DeviceDriver, Progress, SessionData, SessionOutcome, SessionRunner,
};
pub use types::{ClinicalEvent, EventKind, SessionInfo};
pub use upload::{RecordingUploader, UploadAdapter};

/// Uplink version stamped into every upload
pub const UPLINK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Uploader name for session metadata
pub const PRODUCER_NAME: &str = "diabetes-uplink";
