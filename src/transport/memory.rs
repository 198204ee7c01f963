//! In-memory scripted transport
//!
//! Plays back recorded device output and captures everything the host wrote.
//! A responder closure can stand in for a device that answers each write.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::{timed_out, DeviceDescriptor, Transport};
use crate::error::TransportError;

/// Produces the device's replies to one host write
pub type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

/// Shared handle to the writes captured by a [`ScriptedTransport`]
#[derive(Debug, Clone, Default)]
pub struct WriteLog {
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl WriteLog {
    fn push(&self, bytes: &[u8]) {
        let mut writes = self.writes.lock().unwrap_or_else(|p| p.into_inner());
        writes.push(bytes.to_vec());
    }

    /// Every write so far, in order
    pub fn all(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn len(&self) -> usize {
        self.writes.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct ScriptedTransport {
    pending: VecDeque<Vec<u8>>,
    responder: Option<Responder>,
    writes: WriteLog,
    connected: bool,
    disconnects: usize,
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self {
            pending: VecDeque::new(),
            responder: None,
            writes: WriteLog::default(),
            connected: false,
            disconnects: 0,
        }
    }

    /// Replay `responses` in order, regardless of what the host sends
    pub fn with_responses<I>(mut self, responses: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        self.pending.extend(responses);
        self
    }

    /// Answer every write through `responder`
    pub fn with_responder<F>(mut self, responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        self.responder = Some(Box::new(responder));
        self
    }

    pub fn push_response(&mut self, bytes: Vec<u8>) {
        self.pending.push_back(bytes);
    }

    pub fn writes(&self) -> WriteLog {
        self.writes.clone()
    }

    /// Number of chunks not yet received
    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    /// How many times the link was actually closed
    pub fn disconnects(&self) -> usize {
        self.disconnects
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(&mut self, _device: &DeviceDescriptor) -> Result<(), TransportError> {
        self.connected = true;
        Ok(())
    }

    async fn send(&mut self, bytes: &[u8], _timeout: Duration) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.writes.push(bytes);
        if let Some(responder) = self.responder.as_mut() {
            self.pending.extend(responder(bytes));
        }
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        self.pending.pop_front().ok_or_else(|| timed_out(timeout))
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if self.connected {
            self.connected = false;
            self.disconnects += 1;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
