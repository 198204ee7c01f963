//! Device transports
//!
//! A transport moves raw bytes between the host and one device. Push-based
//! links (HID, BLE) are fed by a listener into a queue; pull-based links
//! (serial, USB bulk) are read on demand. Every wait is bounded by a timeout.

pub mod block;
pub mod memory;
pub mod pull;
pub mod push;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{TimeoutError, TransportError};

pub use block::BlockTransport;
pub use memory::{ScriptedTransport, WriteLog};
pub use pull::{ByteStream, PullTransport};
pub use push::{DeviceEnd, PushTransport};

/// Which kind of link a device family uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Hid,
    Serial,
    Usb,
    Bluetooth,
    Block,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Hid => "hid",
            TransportMode::Serial => "serial",
            TransportMode::Usb => "usb",
            TransportMode::Bluetooth => "bluetooth",
            TransportMode::Block => "block",
        }
    }

    /// Whether received data arrives through a listener queue
    pub fn is_push(&self) -> bool {
        matches!(self, TransportMode::Hid | TransportMode::Bluetooth)
    }
}

/// A plugged device, as found by enumeration or chosen by the user
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    /// Driver family key from the manifest
    pub family: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<u16>,
    /// Serial port, HID path or file path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl DeviceDescriptor {
    pub fn new(family: &str) -> Self {
        Self {
            family: family.to_string(),
            ..Self::default()
        }
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }

    pub fn with_usb_ids(mut self, vendor_id: u16, product_id: u16) -> Self {
        self.vendor_id = Some(vendor_id);
        self.product_id = Some(product_id);
        self
    }

    /// Label used in error messages
    pub fn label(&self) -> String {
        match (&self.path, self.vendor_id, self.product_id) {
            (Some(path), _, _) => format!("{} at {}", self.family, path),
            (None, Some(vid), Some(pid)) => format!("{} ({:04x}:{:04x})", self.family, vid, pid),
            _ => self.family.clone(),
        }
    }
}

/// Link parameters a driver hands to its transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
    pub mode: TransportMode,
    /// Prefixed to every HID write
    #[serde(default)]
    pub report_id: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receive_timeout_ms: Option<u64>,
}

impl TransportConfig {
    pub fn new(mode: TransportMode) -> Self {
        Self {
            mode,
            report_id: 0,
            bitrate: None,
            receive_timeout_ms: None,
        }
    }
}

/// Byte-level link to one device
#[async_trait]
pub trait Transport: Send {
    /// Open the link
    async fn connect(&mut self, device: &DeviceDescriptor) -> Result<(), TransportError>;

    /// Write one packet or report; a stalled write fails with `TransportError::Timeout`
    async fn send(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), TransportError>;

    /// Next chunk of received bytes, or `TransportError::Timeout`
    async fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError>;

    /// Drop anything received but not yet read
    async fn flush(&mut self) -> Result<(), TransportError>;

    /// Close the link; calling it again is a no-op
    async fn disconnect(&mut self) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;
}

/// Map an elapsed `tokio::time::timeout` into the transport error
pub(crate) fn timed_out(timeout: Duration) -> TransportError {
    TransportError::Timeout(TimeoutError {
        timeout_ms: timeout.as_millis() as u64,
    })
}
