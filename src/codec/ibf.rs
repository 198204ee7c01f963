//! Insulet IBF record framing
//!
//! `u16 BE recsize | data (recsize - 2 bytes) | u16 BE checksum`. The
//! checksum is the byte sum of the data truncated to 16 bits, and a record
//! occupies `recsize + 2` bytes of the file.

use super::checksum::sum16;
use super::{Decoded, FrameCodec, PacketFrame};
use crate::error::FrameError;

/// IBF codec; records carry no descriptor, so it is always 0
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IbfCodec;

impl FrameCodec for IbfCodec {
    fn encode(&self, _descriptor: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        let recsize = payload.len() + 2;
        if recsize > u16::MAX as usize {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: u16::MAX as usize - 2,
            });
        }
        let mut record = Vec::with_capacity(recsize + 2);
        record.extend_from_slice(&(recsize as u16).to_be_bytes());
        record.extend_from_slice(payload);
        record.extend_from_slice(&sum16(payload).to_be_bytes());
        Ok(record)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Decoded, FrameError> {
        if bytes.len() < 2 {
            return Ok(Decoded::NeedMoreData);
        }
        let recsize = u16::from_be_bytes([bytes[0], bytes[1]]) as usize;
        if recsize < 2 {
            return Err(FrameError::Malformed(format!("record size {}", recsize)));
        }
        let packet_len = recsize + 2;
        if bytes.len() < packet_len {
            return Ok(Decoded::NeedMoreData);
        }

        let data = &bytes[2..recsize];
        let expected = u16::from_be_bytes([bytes[recsize], bytes[recsize + 1]]);
        let actual = sum16(data);
        if expected != actual {
            return Err(FrameError::BadChecksum {
                expected: u32::from(expected),
                actual: u32::from(actual),
            });
        }

        Ok(Decoded::Frame {
            frame: PacketFrame {
                descriptor: 0,
                payload: data.to_vec(),
                checksum: u32::from(expected),
            },
            consumed: packet_len,
        })
    }
}

/// Walks the records of a whole IBF file in order
pub struct IbfRecords<'a> {
    bytes: &'a [u8],
    offset: usize,
}

impl<'a> IbfRecords<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Next record, `Ok(None)` at end of file or when the final record is truncated
    pub fn next_record(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        if self.offset >= self.bytes.len() {
            return Ok(None);
        }
        match IbfCodec.decode(&self.bytes[self.offset..])? {
            Decoded::Frame { frame, consumed } => {
                self.offset += consumed;
                Ok(Some(frame.payload))
            }
            Decoded::NeedMoreData => {
                self.offset = self.bytes.len();
                Ok(None)
            }
        }
    }

    /// Next record, which must be present
    pub fn expect_record(&mut self, name: &str) -> Result<Vec<u8>, FrameError> {
        self.next_record()?
            .ok_or_else(|| FrameError::Malformed(format!("missing {} record", name)))
    }
}
