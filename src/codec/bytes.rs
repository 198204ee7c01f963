//! Bounds-checked cursor over device payloads
//!
//! Record layouts mix little- and big-endian fields, so every read names its
//! byte order explicitly.

use crate::error::FrameError;

#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.offset)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn take(&mut self, len: usize) -> Result<&'a [u8], FrameError> {
        if self.remaining() < len {
            return Err(FrameError::Malformed(format!(
                "need {} bytes at offset {}, have {}",
                len,
                self.offset,
                self.remaining()
            )));
        }
        let slice = &self.data[self.offset..self.offset + len];
        self.offset += len;
        Ok(slice)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), FrameError> {
        self.take(len).map(|_| ())
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], FrameError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.array::<1>()?[0])
    }

    pub fn i8(&mut self) -> Result<i8, FrameError> {
        Ok(i8::from_le_bytes(self.array()?))
    }

    pub fn u16_le(&mut self) -> Result<u16, FrameError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn i16_le(&mut self) -> Result<i16, FrameError> {
        Ok(i16::from_le_bytes(self.array()?))
    }

    pub fn u16_be(&mut self) -> Result<u16, FrameError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    pub fn u32_le(&mut self) -> Result<u32, FrameError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn i32_le(&mut self) -> Result<i32, FrameError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub fn u32_be(&mut self) -> Result<u32, FrameError> {
        Ok(u32::from_be_bytes(self.array()?))
    }

    pub fn i32_be(&mut self) -> Result<i32, FrameError> {
        Ok(i32::from_be_bytes(self.array()?))
    }

    /// Fixed-width, NUL-padded ASCII field
    pub fn zstring(&mut self, len: usize) -> Result<String, FrameError> {
        let raw = self.take(len)?;
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        Ok(String::from_utf8_lossy(&raw[..end]).trim().to_string())
    }
}

/// Hex dump used in frame-level debug logs
pub fn to_hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse a hex string; whitespace between byte pairs is ignored
pub fn from_hex(text: &str) -> Result<Vec<u8>, FrameError> {
    let digits: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return Err(FrameError::Malformed("odd number of hex digits".to_string()));
    }
    digits
        .chunks(2)
        .map(|pair| {
            std::str::from_utf8(pair)
                .ok()
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| {
                    FrameError::Malformed(format!("invalid hex pair {:?}", String::from_utf8_lossy(pair)))
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mixed_endianness() {
        let data = [0x01, 0x02, 0x01, 0x02, 0xFF, 0xFF, 0xFF, 0xFF];
        let mut reader = ByteReader::new(&data);
        assert_eq!(reader.u16_le().unwrap(), 0x0201);
        assert_eq!(reader.u16_be().unwrap(), 0x0102);
        assert_eq!(reader.i32_le().unwrap(), -1);
        assert!(reader.is_empty());
    }

    #[test]
    fn test_short_read_is_malformed() {
        let mut reader = ByteReader::new(&[0x01]);
        assert!(matches!(reader.u32_le(), Err(FrameError::Malformed(_))));
        // cursor did not advance
        assert_eq!(reader.u8().unwrap(), 0x01);
    }

    #[test]
    fn test_zstring() {
        let mut reader = ByteReader::new(b"PDM\0\0\0XY");
        assert_eq!(reader.zstring(6).unwrap(), "PDM");
        assert_eq!(reader.remaining(), 2);
    }

    #[test]
    fn test_hex_helpers() {
        assert_eq!(from_hex("02 06 06 03").unwrap(), vec![2, 6, 6, 3]);
        assert_eq!(to_hex(&[0x41, 0xcd]), "41 cd");
        assert!(from_hex("0").is_err());
        assert!(from_hex("zz").is_err());
    }
}
