//! Device drivers
//!
//! One driver per device family. Each implements [`DeviceDriver`] over a
//! boxed [`Transport`], so the same driver runs against real hardware, a
//! recorded capture or an in-memory script.

pub mod bayer;
pub mod dexcom;
pub mod insulet;
pub mod manifest;
pub mod onetouch;

pub use bayer::BayerDriver;
pub use dexcom::DexcomDriver;
pub use insulet::InsuletDriver;
pub use manifest::{DeviceManifest, ManifestEntry, UsbId};
pub use onetouch::OneTouchDriver;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::codec::{FrameCodec, FrameReader, PacketFrame};
use crate::config::RetryPolicy;
use crate::error::{Result, UplinkError};
use crate::session::DeviceDriver;
use crate::transport::{Transport, TransportMode};

/// Device families with a built driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    Dexcom,
    Bayer,
    OneTouch,
    Insulet,
}

impl DriverKind {
    pub const ALL: [DriverKind; 4] = [
        DriverKind::Dexcom,
        DriverKind::Bayer,
        DriverKind::OneTouch,
        DriverKind::Insulet,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DriverKind::Dexcom => "dexcom",
            DriverKind::Bayer => "bayer",
            DriverKind::OneTouch => "onetouch",
            DriverKind::Insulet => "insulet",
        }
    }

    /// Manifest key of the family
    pub fn family(&self) -> &'static str {
        match self {
            DriverKind::Dexcom => "Dexcom",
            DriverKind::Bayer => "BayerContourNext",
            DriverKind::OneTouch => "OneTouchUltraMini",
            DriverKind::Insulet => "InsuletOmniPod",
        }
    }

    /// Accepts either the short name or the manifest key, any case
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| {
            kind.as_str().eq_ignore_ascii_case(name) || kind.family().eq_ignore_ascii_case(name)
        })
    }

    pub fn mode(&self) -> TransportMode {
        match self {
            DriverKind::Dexcom | DriverKind::OneTouch => TransportMode::Serial,
            DriverKind::Bayer => TransportMode::Hid,
            DriverKind::Insulet => TransportMode::Block,
        }
    }
}

/// Build the driver for `kind` over an already-chosen transport
pub fn build_driver(kind: DriverKind, transport: Box<dyn Transport>) -> Box<dyn DeviceDriver> {
    match kind {
        DriverKind::Dexcom => Box::new(DexcomDriver::new(transport)),
        DriverKind::Bayer => Box::new(BayerDriver::new(transport)),
        DriverKind::OneTouch => Box::new(OneTouchDriver::new(transport)),
        DriverKind::Insulet => Box::new(InsuletDriver::new(transport)),
    }
}

/// Receive until `reader` yields a whole frame or `timeout` runs out
///
/// A corrupt frame is an error; the caller decides whether to retry.
pub(crate) async fn read_frame<C: FrameCodec>(
    transport: &mut dyn Transport,
    reader: &mut FrameReader<C>,
    timeout: Duration,
) -> Result<PacketFrame> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(frame) = reader.next_frame()? {
            return Ok(frame);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(crate::transport::timed_out(timeout).into());
        }
        let chunk = transport.receive(remaining).await?;
        reader.push(&chunk);
    }
}

/// Bounded retry of transient failures
///
/// ```ignore
/// let mut retry = Retry::from_policy(&policy);
/// loop {
///     match self.try_command(cmd).await {
///         Ok(v) => return Ok(v),
///         Err(e) => retry.after(e).await?,
///     }
/// }
/// ```
pub(crate) struct Retry {
    attempts: u32,
    tried: u32,
    backoff: Duration,
}

impl Retry {
    pub(crate) fn new(attempts: u32, backoff: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            tried: 0,
            backoff,
        }
    }

    pub(crate) fn from_policy(policy: &RetryPolicy) -> Self {
        Self::new(policy.attempts, policy.backoff())
    }

    /// Wait before the next attempt, or give up with the final error
    ///
    /// Once the attempts run out the last transient error is returned as is.
    pub(crate) async fn after(&mut self, err: UplinkError) -> Result<()> {
        self.tried += 1;
        if !err.is_transient() {
            return Err(err);
        }
        if self.tried >= self.attempts {
            log::warn!("giving up after {} attempts: {}", self.tried, err);
            return Err(err);
        }
        log::warn!("attempt {} of {} failed: {}", self.tried, self.attempts, err);
        tokio::time::sleep(self.backoff).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::sync::SyncCodec;
    use crate::error::{TimeoutError, TransportError};
    use crate::transport::{DeviceDescriptor, ScriptedTransport};

    #[test]
    fn test_driver_names() {
        assert_eq!(DriverKind::from_name("dexcom"), Some(DriverKind::Dexcom));
        assert_eq!(DriverKind::from_name("BayerContourNext"), Some(DriverKind::Bayer));
        assert_eq!(DriverKind::from_name("insuletomnipod"), Some(DriverKind::Insulet));
        assert_eq!(DriverKind::from_name("Tandem"), None);
        assert_eq!(DriverKind::Insulet.mode(), TransportMode::Block);
    }

    #[tokio::test]
    async fn test_read_frame_across_chunks() {
        let packet = SyncCodec::dexcom().encode(1, &[7, 8, 9]).unwrap();
        let mut transport =
            ScriptedTransport::new().with_responses(vec![packet[..2].to_vec(), packet[2..].to_vec()]);
        transport.connect(&DeviceDescriptor::new("Dexcom")).await.unwrap();
        let mut reader = FrameReader::new(SyncCodec::dexcom());

        let frame = read_frame(&mut transport, &mut reader, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(frame.payload, vec![7, 8, 9]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up_on_transient_errors() {
        let mut retry = Retry::new(3, Duration::from_millis(10));
        let timeout = || UplinkError::from(TimeoutError { timeout_ms: 5 });
        assert!(retry.after(timeout()).await.is_ok());
        assert!(retry.after(timeout()).await.is_ok());
        let err = retry.after(timeout()).await.unwrap_err();
        assert!(matches!(
            &err,
            UplinkError::Transport(TransportError::Timeout(t)) if t.timeout_ms == 5
        ));
        assert_eq!(err.code(), "E_DEVICE_CONNECTION");
        match err {
            UplinkError::Transport(e) => {
                assert_eq!(e.remediation(), "Make sure the device is awake and retry")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retry_passes_semantic_errors_through() {
        let mut retry = Retry::new(3, Duration::from_millis(10));
        let err = retry.after(UplinkError::Parse("bad".to_string())).await.unwrap_err();
        assert!(matches!(err, UplinkError::Parse(_)));
    }
}
