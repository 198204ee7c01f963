//! Block-device transport
//!
//! Some devices mount as storage and expose their log as a file. The whole
//! file is read on connect and handed out by a single `receive`.

use async_trait::async_trait;
use log::{debug, info};
use std::io::ErrorKind;
use std::time::Duration;

use super::{DeviceDescriptor, Transport};
use crate::error::TransportError;

#[derive(Debug, Default)]
pub struct BlockTransport {
    contents: Option<Vec<u8>>,
    delivered: bool,
    connected: bool,
}

impl BlockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// A transport over bytes already in memory
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            contents: Some(bytes),
            delivered: false,
            connected: false,
        }
    }
}

#[async_trait]
impl Transport for BlockTransport {
    async fn connect(&mut self, device: &DeviceDescriptor) -> Result<(), TransportError> {
        if self.contents.is_none() {
            let path = device.path.as_deref().ok_or_else(|| TransportError::NotFound {
                device: device.label(),
            })?;
            let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
                ErrorKind::NotFound => TransportError::NotFound {
                    device: device.label(),
                },
                ErrorKind::PermissionDenied => TransportError::PermissionDenied {
                    device: device.label(),
                },
                _ => TransportError::Io(e),
            })?;
            info!("read {} bytes from {}", bytes.len(), path);
            self.contents = Some(bytes);
        }
        self.delivered = false;
        self.connected = true;
        Ok(())
    }

    async fn send(&mut self, bytes: &[u8], _timeout: Duration) -> Result<(), TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        debug!("ignoring {} byte write to block device", bytes.len());
        Ok(())
    }

    async fn receive(&mut self, _timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !self.connected {
            return Err(TransportError::NotConnected);
        }
        if self.delivered {
            return Err(TransportError::Disconnected {
                reason: "end of file".to_string(),
            });
        }
        self.delivered = true;
        Ok(self.contents.clone().unwrap_or_default())
    }

    async fn flush(&mut self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[tokio::test]
    async fn test_reads_file_once() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0x00, 0x04, 0xAA, 0xBB]).unwrap();
        let path = file.path().to_string_lossy().into_owned();

        let mut transport = BlockTransport::new();
        transport
            .connect(&DeviceDescriptor::new("insulet").with_path(&path))
            .await
            .unwrap();
        let bytes = transport.receive(Duration::from_secs(1)).await.unwrap();
        assert_eq!(bytes, vec![0x00, 0x04, 0xAA, 0xBB]);
        assert!(matches!(
            transport.receive(Duration::from_secs(1)).await,
            Err(TransportError::Disconnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.ibf");
        let mut transport = BlockTransport::new();
        let err = transport
            .connect(&DeviceDescriptor::new("insulet").with_path(&path.to_string_lossy()))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_in_memory_contents() {
        let mut transport = BlockTransport::from_bytes(vec![1, 2, 3]);
        transport.connect(&DeviceDescriptor::new("insulet")).await.unwrap();
        assert_eq!(transport.receive(Duration::from_secs(1)).await.unwrap(), vec![1, 2, 3]);
        transport.disconnect().await.unwrap();
        transport.disconnect().await.unwrap();
        assert!(!transport.is_connected());
    }
}
