//! CRC-16/CCITT variants
//!
//! Polynomial 0x1021, MSB first, no reflection, no final XOR. The families
//! differ only in the initial remainder.

use crc::{Crc, CRC_16_IBM_3740, CRC_16_XMODEM};

/// Initial remainder 0xFFFF (OneTouch, Asante)
pub const CRC_A: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Initial remainder 0x0000 (Dexcom)
pub const CRC_D: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Which initial remainder a family uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrcFlavor {
    A,
    D,
}

impl CrcFlavor {
    pub fn checksum(&self, bytes: &[u8]) -> u16 {
        match self {
            CrcFlavor::A => CRC_A.checksum(bytes),
            CrcFlavor::D => CRC_D.checksum(bytes),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CrcFlavor::A => "crc-a",
            CrcFlavor::D => "crc-d",
        }
    }
}

pub fn crc_a(bytes: &[u8]) -> u16 {
    CRC_A.checksum(bytes)
}

pub fn crc_d(bytes: &[u8]) -> u16 {
    CRC_D.checksum(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const VECTOR: [u8; 4] = [0x02, 0x06, 0x06, 0x03];

    #[test]
    fn test_known_vectors() {
        assert_eq!(crc_a(&VECTOR), 0x41CD);
        assert_eq!(crc_d(&VECTOR), 0xC50D);
    }

    #[test]
    fn test_standard_check_strings() {
        // "123456789" check values for CCITT-FALSE and XMODEM
        assert_eq!(crc_a(b"123456789"), 0x29B1);
        assert_eq!(crc_d(b"123456789"), 0x31C3);
    }

    #[test]
    fn test_flavor_dispatch() {
        assert_eq!(CrcFlavor::A.checksum(&VECTOR), crc_a(&VECTOR));
        assert_eq!(CrcFlavor::D.checksum(&VECTOR), crc_d(&VECTOR));
        assert_eq!(crc_a(&[]), 0xFFFF);
        assert_eq!(crc_d(&[]), 0x0000);
    }
}
