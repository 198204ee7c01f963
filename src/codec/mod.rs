//! Packet codecs
//!
//! Each device family keeps its own wire format. A codec turns a descriptor
//! (command, link-control byte or frame number) plus payload into bytes, and
//! recognises complete, checksum-valid frames in a receive buffer.

pub mod astm;
pub mod bytes;
pub mod checksum;
pub mod crc;
pub mod ibf;
pub mod stx;
pub mod sync;

use log::{debug, warn};

use crate::error::FrameError;

pub use bytes::{from_hex, to_hex, ByteReader};

/// A validated frame
#[derive(Debug, Clone, PartialEq)]
pub struct PacketFrame {
    /// Command byte, link-control byte or frame number, depending on the family
    pub descriptor: u8,
    pub payload: Vec<u8>,
    /// Checksum carried on the wire
    pub checksum: u32,
}

/// Outcome of scanning a receive buffer
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// A complete frame; `consumed` includes any junk skipped before it
    Frame { frame: PacketFrame, consumed: usize },
    /// The declared length has not fully arrived
    NeedMoreData,
}

/// Framing for one device family
pub trait FrameCodec {
    /// Build a packet around `payload`
    fn encode(&self, descriptor: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError>;

    /// Recognise the first frame in `bytes`
    fn decode(&self, bytes: &[u8]) -> Result<Decoded, FrameError>;
}

/// Accumulates received chunks and yields whole frames
pub struct FrameReader<C> {
    codec: C,
    buffer: Vec<u8>,
}

impl<C: FrameCodec> FrameReader<C> {
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            buffer: Vec::new(),
        }
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Next complete frame, if one is buffered
    ///
    /// A frame with a bad checksum is discarded together with everything
    /// buffered before the next read.
    pub fn next_frame(&mut self) -> Result<Option<PacketFrame>, FrameError> {
        match self.codec.decode(&self.buffer) {
            Ok(Decoded::Frame { frame, consumed }) => {
                debug!("frame {:#04x}: {}", frame.descriptor, to_hex(&self.buffer[..consumed]));
                self.buffer.drain(..consumed);
                Ok(Some(frame))
            }
            Ok(Decoded::NeedMoreData) => Ok(None),
            Err(e) => {
                warn!("discarding {} buffered bytes: {}", self.buffer.len(), e);
                self.buffer.clear();
                Err(e)
            }
        }
    }
}
