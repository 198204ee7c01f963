//! Push-based transport (HID, BLE)
//!
//! A platform listener pushes every incoming report onto a queue; `receive`
//! awaits the queue under a timeout. Outgoing reports are prefixed with the
//! driver's report ID and handed to the platform writer.

use async_trait::async_trait;
use log::{debug, warn};
use std::time::Duration;
use tokio::sync::mpsc;

use super::{timed_out, DeviceDescriptor, Transport};
use crate::codec::to_hex;
use crate::error::TransportError;

/// Queue depth between the listener and the session
const QUEUE_DEPTH: usize = 256;

pub struct PushTransport {
    incoming: mpsc::Receiver<Vec<u8>>,
    outgoing: mpsc::Sender<Vec<u8>>,
    report_id: u8,
    connected: bool,
}

/// The platform side of a push transport
pub struct DeviceEnd {
    /// Listener pushes received reports here
    pub reports: mpsc::Sender<Vec<u8>>,
    /// Writes from the host, report ID included
    pub writes: mpsc::Receiver<Vec<u8>>,
}

impl PushTransport {
    /// Create a transport and the platform end that feeds it
    pub fn channel(report_id: u8) -> (Self, DeviceEnd) {
        let (report_tx, report_rx) = mpsc::channel(QUEUE_DEPTH);
        let (write_tx, write_rx) = mpsc::channel(QUEUE_DEPTH);
        (
            Self {
                incoming: report_rx,
                outgoing: write_tx,
                report_id,
                connected: false,
            },
            DeviceEnd {
                reports: report_tx,
                writes: write_rx,
            },
        )
    }

    pub fn report_id(&self) -> u8 {
        self.report_id
    }
}

#[async_trait]
impl Transport for PushTransport {
    async fn connect(&mut self, device: &DeviceDescriptor) -> Result<(), TransportError> {
        if self.outgoing.is_closed() {
            return Err(TransportError::ClaimFailed {
                device: device.label(),
            });
        }
        debug!("push transport connected to {}", device.label());
        self.connected = true;
        Ok(())
    }

    async fn send(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let mut report = Vec::with_capacity(bytes.len() + 1);
        report.push(self.report_id);
        report.extend_from_slice(bytes);
        debug!("hid write: {}", to_hex(&report));
        match tokio::time::timeout(timeout, self.outgoing.send(report)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Disconnected {
                reason: "device writer closed".to_string(),
            }),
            Err(_) => Err(timed_out(timeout)),
        }
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        match tokio::time::timeout(timeout, self.incoming.recv()).await {
            Ok(Some(report)) => Ok(report),
            Ok(None) => Err(TransportError::Disconnected {
                reason: "listener closed".to_string(),
            }),
            Err(_) => Err(timed_out(timeout)),
        }
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        let mut dropped = 0;
        while self.incoming.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            warn!("flushed {} unread reports", dropped);
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if self.connected {
            self.incoming.close();
            self.connected = false;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
