//! Simple additive checksums

/// Sum of all bytes, modulo 256 (ASTM E1381)
pub fn sum_mod256(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// XOR of all bytes
pub fn xor8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Byte sum truncated to 16 bits (Insulet IBF records)
pub fn sum16(bytes: &[u8]) -> u16 {
    bytes.iter().fold(0u16, |acc, b| acc.wrapping_add(u16::from(*b)))
}

/// Fletcher-16 check value
pub fn fletcher16(bytes: &[u8]) -> u16 {
    let (mut a, mut b) = (0u16, 0u16);
    for byte in bytes {
        a = (a + u16::from(*byte)) % 255;
        b = (b + a) % 255;
    }
    (b << 8) | a
}

/// Two uppercase hex digits, as ASTM frames carry their checksum
pub fn hex_digits(value: u8) -> [u8; 2] {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    [HEX[(value >> 4) as usize], HEX[(value & 0x0F) as usize]]
}

/// Parse two ASCII hex digits
pub fn parse_hex_digits(digits: [u8; 2]) -> Option<u8> {
    let text = std::str::from_utf8(&digits).ok()?;
    u8::from_str_radix(text, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_wraps() {
        assert_eq!(sum_mod256(&[0xFF, 0x02]), 0x01);
        assert_eq!(sum16(&[0xFF; 300]), (0xFF * 300) as u16);
    }

    #[test]
    fn test_xor() {
        assert_eq!(xor8(&[0x01, 0x02, 0x04]), 0x07);
        assert_eq!(xor8(&[0xAA, 0xAA]), 0x00);
    }

    #[test]
    fn test_fletcher16_reference() {
        assert_eq!(fletcher16(b"abcde"), 0xC8F0);
        assert_eq!(fletcher16(b"abcdef"), 0x2057);
    }

    #[test]
    fn test_hex_digits() {
        assert_eq!(&hex_digits(0x3C), b"3C");
        assert_eq!(parse_hex_digits(*b"3C"), Some(0x3C));
        assert_eq!(parse_hex_digits(*b"3c"), Some(0x3C));
        assert_eq!(parse_hex_digits(*b"G0"), None);
    }
}
