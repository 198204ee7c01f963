//! STX/ETX framing with a link-control byte
//!
//! `STX | length | link-control | payload | ETX | u16 LE CRC_A`. The length
//! counts the whole packet; the CRC covers every byte up to and including ETX.

use super::crc::CrcFlavor;
use super::{Decoded, FrameCodec, PacketFrame};
use crate::error::FrameError;

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;

/// Link-control bits
pub mod link {
    pub const MORE: u8 = 0x10;
    pub const DISC: u8 = 0x08;
    pub const ACK: u8 = 0x04;
    /// Last bit of the expected receive counter
    pub const E: u8 = 0x02;
    /// Last bit of the send counter
    pub const S: u8 = 0x01;
    pub const NONE: u8 = 0x00;
}

/// How the length field is laid out and read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LengthField {
    /// One byte
    Single,
    /// Two bytes, low byte first
    TwoByte,
    /// Two bytes, low byte first, read as `high << (8 + low)`
    ///
    /// This reproduces a legacy reader whose length expression
    /// `high_byte << 8 + low_byte` was parsed with addition binding tighter
    /// than the shift. The shift count is masked to 5 bits and the result is
    /// 32 bits wide. Writers still emit the correct two-byte length. Kept for
    /// wire compatibility until the protocol owner confirms the intent.
    LegacyPrecedence,
}

impl LengthField {
    pub fn width(&self) -> usize {
        match self {
            LengthField::Single => 1,
            LengthField::TwoByte | LengthField::LegacyPrecedence => 2,
        }
    }

    /// Decode a length field, `raw` holds at least `width()` bytes
    pub fn read(&self, raw: &[u8]) -> u32 {
        match self {
            LengthField::Single => u32::from(raw[0]),
            LengthField::TwoByte => u32::from(u16::from_le_bytes([raw[0], raw[1]])),
            LengthField::LegacyPrecedence => legacy_length(raw[1], raw[0]),
        }
    }

    fn write(&self, total: usize, out: &mut Vec<u8>) {
        match self {
            LengthField::Single => out.push(total as u8),
            LengthField::TwoByte | LengthField::LegacyPrecedence => {
                out.extend_from_slice(&(total as u16).to_le_bytes())
            }
        }
    }

    fn max_total(&self) -> usize {
        match self {
            LengthField::Single => u8::MAX as usize,
            LengthField::TwoByte | LengthField::LegacyPrecedence => u16::MAX as usize,
        }
    }
}

/// `high_byte << 8 + low_byte` evaluated the way the legacy reader did
pub fn legacy_length(high: u8, low: u8) -> u32 {
    let shift = (8 + u32::from(low)) & 31;
    u32::from(high).wrapping_shl(shift)
}

/// STX codec; the descriptor is the link-control byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StxCodec {
    pub length: LengthField,
    pub crc: CrcFlavor,
}

impl StxCodec {
    /// OneTouch UltraMini framing
    pub fn onetouch() -> Self {
        Self {
            length: LengthField::Single,
            crc: CrcFlavor::A,
        }
    }

    pub fn with_length(mut self, length: LengthField) -> Self {
        self.length = length;
        self
    }

    fn overhead(&self) -> usize {
        // STX, length, link-control, ETX, CRC
        1 + self.length.width() + 1 + 1 + 2
    }
}

impl FrameCodec for StxCodec {
    fn encode(&self, descriptor: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        let total = payload.len() + self.overhead();
        if total > self.length.max_total() {
            return Err(FrameError::PayloadTooLarge {
                size: payload.len(),
                max: self.length.max_total() - self.overhead(),
            });
        }
        let mut packet = Vec::with_capacity(total);
        packet.push(STX);
        self.length.write(total, &mut packet);
        packet.push(descriptor);
        packet.extend_from_slice(payload);
        packet.push(ETX);
        let crc = self.crc.checksum(&packet);
        packet.extend_from_slice(&crc.to_le_bytes());
        Ok(packet)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Decoded, FrameError> {
        let start = match bytes.iter().position(|b| *b == STX) {
            Some(start) => start,
            None => return Ok(Decoded::NeedMoreData),
        };
        let packet = &bytes[start..];
        let header = 1 + self.length.width();
        if packet.len() < header {
            return Ok(Decoded::NeedMoreData);
        }

        let total = self.length.read(&packet[1..header]) as usize;
        if total < self.overhead() {
            return Err(FrameError::Malformed(format!(
                "declared length {} shorter than framing",
                total
            )));
        }
        if packet.len() < total {
            return Ok(Decoded::NeedMoreData);
        }

        let expected = u16::from_le_bytes([packet[total - 2], packet[total - 1]]);
        let actual = self.crc.checksum(&packet[..total - 2]);
        if expected != actual {
            return Err(FrameError::BadChecksum {
                expected: u32::from(expected),
                actual: u32::from(actual),
            });
        }
        if packet[total - 3] != ETX {
            return Err(FrameError::Malformed(format!(
                "expected ETX, got {:#04x}",
                packet[total - 3]
            )));
        }

        Ok(Decoded::Frame {
            frame: PacketFrame {
                descriptor: packet[header],
                payload: packet[header + 1..total - 3].to_vec(),
                checksum: u32::from(expected),
            },
            consumed: start + total,
        })
    }
}

/// Alternating send/receive sequence bits of the link layer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkState {
    send_bit: u8,
    expected_receive_bit: u8,
}

impl LinkState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Link-control byte for an outgoing packet
    pub fn control(&self, flags: u8) -> u8 {
        flags | self.send_bit | self.expected_receive_bit
    }

    /// A disconnect restarts the counters with both bits set
    pub fn reset_for_disconnect(&mut self) {
        self.send_bit = link::S;
        self.expected_receive_bit = link::E;
    }

    pub fn toggle_send(&mut self) {
        self.send_bit ^= link::S;
    }

    pub fn toggle_receive(&mut self) {
        self.expected_receive_bit ^= link::E;
    }

    /// Check the E and S bits of a received byte, resynchronising on mismatch
    pub fn check(&mut self, control: u8) -> bool {
        if control & link::E != self.expected_receive_bit {
            self.toggle_receive();
            return false;
        }
        if control & link::S != self.send_bit {
            self.toggle_send();
            return false;
        }
        true
    }

    /// An acknowledgement carries no payload and has the ACK bit set
    pub fn is_valid_ack(&mut self, frame: &PacketFrame) -> bool {
        frame.payload.is_empty() && frame.descriptor & link::ACK != 0 && self.check(frame.descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::crc::crc_a;

    #[test]
    fn test_ack_packet_matches_crc_vector() {
        let packet = StxCodec::onetouch().encode(link::NONE, &[]).unwrap();
        assert_eq!(&packet[..4], &[0x02, 0x06, 0x00, 0x03]);
        assert_eq!(&packet[4..], &crc_a(&packet[..4]).to_le_bytes());
    }

    #[test]
    fn test_link_ack_with_bits() {
        // 02 06 06 03: ACK with E set, the CRC_A test vector
        let packet = StxCodec::onetouch().encode(link::ACK | link::E, &[]).unwrap();
        assert_eq!(&packet[..4], &[0x02, 0x06, 0x06, 0x03]);
        assert_eq!(&packet[4..], &[0xCD, 0x41]);
    }

    #[test]
    fn test_decode_payload() {
        let codec = StxCodec::onetouch();
        let packet = codec.encode(link::NONE, &[0x05, 0x0D, 0x02]).unwrap();
        let mut bytes = vec![0x00, 0xFF];
        bytes.extend_from_slice(&packet);
        match codec.decode(&bytes).unwrap() {
            Decoded::Frame { frame, consumed } => {
                assert_eq!(frame.payload, vec![0x05, 0x0D, 0x02]);
                assert_eq!(frame.descriptor, link::NONE);
                assert_eq!(consumed, bytes.len());
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_and_corrupt() {
        let codec = StxCodec::onetouch();
        let packet = codec.encode(link::NONE, &[0x05, 0x1F, 0x01, 0x00]).unwrap();
        assert_eq!(codec.decode(&packet[..packet.len() - 1]).unwrap(), Decoded::NeedMoreData);

        let mut corrupt = packet.clone();
        corrupt[4] ^= 0x80;
        assert!(matches!(codec.decode(&corrupt), Err(FrameError::BadChecksum { .. })));
    }

    #[test]
    fn test_two_byte_length() {
        let codec = StxCodec::onetouch().with_length(LengthField::TwoByte);
        let payload = vec![0xAB; 300];
        let packet = codec.encode(link::MORE, &payload).unwrap();
        assert_eq!(u16::from_le_bytes([packet[1], packet[2]]) as usize, packet.len());
        match codec.decode(&packet).unwrap() {
            Decoded::Frame { frame, .. } => assert_eq!(frame.payload, payload),
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_legacy_length_expression() {
        // high << (8 + low), not (high << 8) + low
        assert_eq!(legacy_length(0x00, 0x0A), 0);
        assert_eq!(legacy_length(0x01, 0x02), 1 << 10);
        assert_eq!(legacy_length(0x01, 0x00), 256);
        // shift count wraps at 32
        assert_eq!(legacy_length(0x03, 24), 3);
        assert_ne!(legacy_length(0x01, 0x2C), 0x012C);
    }

    #[test]
    fn test_legacy_length_reader_misreads_short_packets() {
        let writer = StxCodec::onetouch().with_length(LengthField::TwoByte);
        let packet = writer.encode(link::NONE, &[0x01, 0x02]).unwrap();

        // 9 bytes on the wire: low 0x09, high 0x00, so the legacy reader sees 0
        let legacy = StxCodec::onetouch().with_length(LengthField::LegacyPrecedence);
        assert_eq!(LengthField::LegacyPrecedence.read(&packet[1..3]), 0);
        assert!(matches!(legacy.decode(&packet), Err(FrameError::Malformed(_))));
    }

    #[test]
    fn test_link_state_sequence() {
        let mut state = LinkState::new();
        assert_eq!(state.control(link::NONE), 0x00);

        state.toggle_send();
        assert_eq!(state.control(link::NONE), link::S);
        assert!(state.check(link::ACK | link::S));

        // wrong E bit resynchronises the expected bit
        assert!(!state.check(link::ACK | link::E | link::S));
        assert!(state.check(link::ACK | link::E | link::S));

        state.reset_for_disconnect();
        assert_eq!(state.control(link::DISC), link::DISC | link::S | link::E);
    }
}
