//! Pull-based transport (serial, USB bulk)
//!
//! Wraps any async byte stream: a serial port, a USB bulk endpoint adapter,
//! or an in-process duplex pipe. Each `receive` is one bounded read.

use async_trait::async_trait;
use log::debug;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{timed_out, DeviceDescriptor, Transport};
use crate::codec::to_hex;
use crate::error::TransportError;

/// Size of one read from the stream
const READ_CHUNK: usize = 1024;

/// Bound on closing the write half during disconnect
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// A bidirectional byte stream a driver can talk over
pub trait ByteStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ByteStream for T {}

pub struct PullTransport<S> {
    stream: S,
    connected: bool,
}

impl<S: ByteStream> PullTransport<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            connected: false,
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

#[async_trait]
impl<S: ByteStream> Transport for PullTransport<S> {
    async fn connect(&mut self, device: &DeviceDescriptor) -> Result<(), TransportError> {
        debug!("stream transport connected to {}", device.label());
        self.connected = true;
        Ok(())
    }

    async fn send(&mut self, bytes: &[u8], timeout: Duration) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        debug!("write: {}", to_hex(bytes));
        let stream = &mut self.stream;
        let write = async move {
            stream.write_all(bytes).await?;
            stream.flush().await
        };
        match tokio::time::timeout(timeout, write).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(timed_out(timeout)),
        }
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        let mut chunk = vec![0u8; READ_CHUNK];
        match tokio::time::timeout(timeout, self.stream.read(&mut chunk)).await {
            Ok(Ok(0)) => Err(TransportError::Disconnected {
                reason: "stream closed".to_string(),
            }),
            Ok(Ok(n)) => {
                chunk.truncate(n);
                debug!("read: {}", to_hex(&chunk));
                Ok(chunk)
            }
            Ok(Err(e)) => Err(TransportError::Io(e)),
            Err(_) => Err(timed_out(timeout)),
        }
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        if !self.connected {
            return Ok(());
        }
        // drain whatever is already waiting without blocking on the device
        let mut chunk = vec![0u8; READ_CHUNK];
        while let Ok(Ok(n)) =
            tokio::time::timeout(Duration::from_millis(1), self.stream.read(&mut chunk)).await
        {
            if n == 0 {
                break;
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        if self.connected {
            self.connected = false;
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.stream.shutdown()).await {
                Ok(result) => result?,
                Err(_) => return Err(timed_out(SHUTDOWN_TIMEOUT)),
            }
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}
