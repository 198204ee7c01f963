//! ASTM E1381 low-level framing
//!
//! `STX | FN | text | ETX or ETB | C1 C2 | CR LF`, where FN is an ASCII digit
//! and C1 C2 are the uppercase hex digits of the modulo-256 sum of FN, text
//! and terminator. Control characters travel on their own.

use super::checksum::{hex_digits, parse_hex_digits, sum_mod256};
use super::{Decoded, FrameCodec, PacketFrame};
use crate::error::FrameError;

pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const EOT: u8 = 0x04;
pub const ENQ: u8 = 0x05;
pub const ACK: u8 = 0x06;
pub const LF: u8 = 0x0A;
pub const CR: u8 = 0x0D;
pub const NAK: u8 = 0x15;
pub const ETB: u8 = 0x17;

/// Whether a control byte ends or steers a transfer
pub fn is_control(byte: u8) -> bool {
    matches!(byte, EOT | ENQ | ACK | NAK)
}

/// Checksum of a frame body, FN through terminator
pub fn frame_checksum(body: &[u8]) -> u8 {
    sum_mod256(body)
}

/// A decoded ASTM frame
#[derive(Debug, Clone, PartialEq)]
pub struct AstmFrame {
    /// Frame number, 0 to 7
    pub number: u8,
    /// Record text without the trailing CR and terminator
    pub text: String,
    /// ETX: last frame of the record; ETB: intermediate frame
    pub last: bool,
    pub checksum: u8,
}

impl AstmFrame {
    /// First character of the text: `H`, `P`, `R`, `L`
    pub fn record_type(&self) -> Option<char> {
        self.text.chars().next()
    }
}

/// What one message on the wire turned out to be
#[derive(Debug, Clone, PartialEq)]
pub enum AstmMessage {
    Control(u8),
    Frame(AstmFrame),
}

/// Parse one complete message
pub fn parse_message(message: &[u8]) -> Result<AstmMessage, FrameError> {
    match message.first() {
        None => Err(FrameError::Malformed("empty message".to_string())),
        Some(&STX) => parse_frame(message).map(AstmMessage::Frame),
        Some(&byte) if is_control(byte) => Ok(AstmMessage::Control(byte)),
        Some(&byte) => Err(FrameError::BadSync {
            expected: STX,
            actual: byte,
        }),
    }
}

fn parse_frame(message: &[u8]) -> Result<AstmFrame, FrameError> {
    // STX, FN, terminator, two checksum digits, CR, LF
    if message.len() < 7 {
        return Err(FrameError::Malformed(format!(
            "frame of {} bytes is too short",
            message.len()
        )));
    }
    let end = message.len() - 4;
    let terminator = message[end - 1];
    if terminator != ETX && terminator != ETB {
        return Err(FrameError::Malformed(format!(
            "expected ETX or ETB, got {:#04x}",
            terminator
        )));
    }

    let body = &message[1..end];
    let declared = parse_hex_digits([message[end], message[end + 1]])
        .ok_or_else(|| FrameError::Malformed("checksum is not hex".to_string()))?;
    let actual = frame_checksum(body);
    if declared != actual {
        return Err(FrameError::BadChecksum {
            expected: u32::from(declared),
            actual: u32::from(actual),
        });
    }

    let number = message[1];
    if !number.is_ascii_digit() {
        return Err(FrameError::Malformed(format!(
            "frame number {:#04x} is not a digit",
            number
        )));
    }

    let mut text = &message[2..end - 1];
    if let Some((&CR, rest)) = text.split_last() {
        text = rest;
    }
    let text = text.split(|b| *b == 0).next().unwrap_or_default();

    Ok(AstmFrame {
        number: number - b'0',
        text: String::from_utf8_lossy(text).into_owned(),
        last: terminator == ETX,
        checksum: declared,
    })
}

/// Build a frame around `text`; a CR is appended to the record text
pub fn build_frame(number: u8, text: &str, last: bool) -> Vec<u8> {
    let mut body = Vec::with_capacity(text.len() + 3);
    body.push(b'0' + (number % 8));
    body.extend_from_slice(text.as_bytes());
    body.push(CR);
    body.push(if last { ETX } else { ETB });

    let mut frame = Vec::with_capacity(body.len() + 5);
    frame.push(STX);
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&hex_digits(frame_checksum(&body)));
    frame.push(CR);
    frame.push(LF);
    frame
}

/// ASTM codec; the descriptor is the frame number
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AstmCodec;

impl FrameCodec for AstmCodec {
    fn encode(&self, descriptor: u8, payload: &[u8]) -> Result<Vec<u8>, FrameError> {
        let text = std::str::from_utf8(payload)
            .map_err(|e| FrameError::Malformed(format!("frame text is not ASCII: {}", e)))?;
        Ok(build_frame(descriptor, text, true))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Decoded, FrameError> {
        let start = match bytes.iter().position(|b| *b == STX) {
            Some(start) => start,
            None => return Ok(Decoded::NeedMoreData),
        };
        let terminator = match bytes[start..].iter().position(|b| *b == ETX || *b == ETB) {
            Some(offset) => start + offset,
            None => return Ok(Decoded::NeedMoreData),
        };
        let end = terminator + 5;
        if bytes.len() < end {
            return Ok(Decoded::NeedMoreData);
        }
        let frame = parse_frame(&bytes[start..end])?;
        Ok(Decoded::Frame {
            frame: PacketFrame {
                descriptor: frame.number,
                payload: frame.text.into_bytes(),
                checksum: u32::from(frame.checksum),
            },
            consumed: end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECORD: &str = "R|3|^^^Glucose|93|mg/dL^P||A/M0/T1||201505261150";

    fn wire(number: u8, text: &str, terminator: u8) -> Vec<u8> {
        let mut body = vec![b'0' + number];
        body.extend_from_slice(text.as_bytes());
        body.push(CR);
        body.push(terminator);
        let sum = body.iter().fold(0u32, |acc, b| acc + u32::from(*b)) % 256;
        let mut out = vec![STX];
        out.extend_from_slice(&body);
        out.extend_from_slice(format!("{:02X}", sum).as_bytes());
        out.extend_from_slice(&[CR, LF]);
        out
    }

    #[test]
    fn test_build_matches_wire_layout() {
        assert_eq!(build_frame(5, RECORD, false), wire(5, RECORD, ETB));
        assert_eq!(build_frame(1, "L|1||N", true), wire(1, "L|1||N", ETX));
    }

    #[test]
    fn test_parse_record_frame() {
        let message = wire(5, RECORD, ETB);
        match parse_message(&message).unwrap() {
            AstmMessage::Frame(frame) => {
                assert_eq!(frame.number, 5);
                assert_eq!(frame.text, RECORD);
                assert!(!frame.last);
                assert_eq!(frame.record_type(), Some('R'));
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }

    #[test]
    fn test_control_messages() {
        assert_eq!(parse_message(&[EOT]).unwrap(), AstmMessage::Control(EOT));
        assert_eq!(parse_message(&[ENQ]).unwrap(), AstmMessage::Control(ENQ));
        assert!(matches!(parse_message(&[0x41]), Err(FrameError::BadSync { .. })));
    }

    #[test]
    fn test_bad_checksum() {
        let mut message = wire(5, RECORD, ETB);
        message[10] = b'9';
        assert!(matches!(
            parse_message(&message),
            Err(FrameError::BadChecksum { .. })
        ));
    }

    #[test]
    fn test_codec_needs_whole_frame() {
        let codec = AstmCodec;
        let message = wire(2, "P|1", ETX);
        assert_eq!(codec.decode(&message[..message.len() - 1]).unwrap(), Decoded::NeedMoreData);
        match codec.decode(&message).unwrap() {
            Decoded::Frame { frame, consumed } => {
                assert_eq!(frame.descriptor, 2);
                assert_eq!(frame.payload, b"P|1".to_vec());
                assert_eq!(consumed, message.len());
            }
            other => panic!("expected frame, got {:?}", other),
        }
    }
}
