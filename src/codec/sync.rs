//! Sync-byte framing
//!
//! `SYNC | u16 LE length | command | payload | u16 LE CRC`. The length counts
//! the whole packet and the CRC covers every byte before it.

use super::crc::CrcFlavor;
use super::{Decoded, FrameCodec, PacketFrame};
use crate::error::FrameError;

/// Sync byte, length and command
pub const HEADER_LEN: usize = 4;
pub const CRC_LEN: usize = 2;

/// Sync-byte codec for one family
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncCodec {
    pub sync: u8,
    pub crc: CrcFlavor,
    /// Largest packet the device will send or accept
    pub max_packet: usize,
}

impl SyncCodec {
    /// Dexcom receivers: SYNC 0x01, CRC with zero initial remainder
    pub fn dexcom() -> Self {
        Self {
            sync: 0x01,
            crc: CrcFlavor::D,
            max_packet: 1590,
        }
    }
}

impl FrameCodec for SyncCodec {
    fn encode(&self, descriptor: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        let total = payload.len() + HEADER_LEN + CRC_LEN;
        if total > self.max_packet {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.max_packet - HEADER_LEN - CRC_LEN,
            });
        }
        let mut packet = Vec::with_capacity(total);
        packet.push(self.sync);
        packet.extend_from_slice(&(total as u16).to_le_bytes());
        packet.push(descriptor);
        packet.extend_from_slice(payload);
        let crc = self.crc.checksum(&packet);
        packet.extend_from_slice(&crc.to_le_bytes());
        Ok(packet)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Decoded, FrameError> {
        let start = match bytes.iter().position(|b| *b == self.sync) {
            Some(start) => start,
            None => return Ok(Decoded::NeedMoreData),
        };
        let packet = &bytes[start..];
        if packet.len() < HEADER_LEN {
            return Ok(Decoded::NeedMoreData);
        }

        let total = u16::from_le_bytes([packet[1], packet[2]]) as usize;
        if total < HEADER_LEN + CRC_LEN {
            return Err(FrameError::Malformed(format!(
                "declared length {} shorter than header",
                total
            )));
        }
        if total > self.max_packet {
            return Err(FrameError::PayloadTooLarge {
                size: total,
                max: self.max_packet,
            });
        }
        if packet.len() < total {
            return Ok(Decoded::NeedMoreData);
        }

        let body = &packet[..total - CRC_LEN];
        let expected = u16::from_le_bytes([packet[total - 2], packet[total - 1]]);
        let actual = self.crc.checksum(body);
        if expected != actual {
            return Err(FrameError::BadChecksum {
                expected: u32::from(expected),
                actual: u32::from(actual),
            });
        }

        Ok(Decoded::Frame {
            frame: PacketFrame {
                descriptor: packet[3],
                payload: body[HEADER_LEN..].to_vec(),
                checksum: u32::from(expected),
            },
            consumed: start + total,
        })
    }
}
