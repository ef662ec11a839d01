//! CRC-8 over 4-byte stream groups.
//!
//! Polynomial `x^8 + x^2 + x + 1` (0x107), initial value 0xFF, MSB first, no final
//! XOR.

use crc::{Algorithm, Crc};

/// Generator polynomial without the implicit x^8 term.
pub const POLYNOMIAL: u8 = 0x07;

/// Initial register value.
pub const INIT: u8 = 0xFF;

/// Parameters of the return-stream checksum.
pub const STREAM_CRC: Algorithm<u8> = Algorithm {
    width: 8,
    poly: POLYNOMIAL,
    init: INIT,
    refin: false,
    refout: false,
    xorout: 0x00,
    check: 0xFB,
    residue: 0x00,
};

const CRC8: Crc<u8> = Crc::<u8>::new(&STREAM_CRC);

/// Compute the CRC-8 of `bytes`.
pub fn crc8(bytes: &[u8]) -> u8 {
    CRC8.checksum(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitwise(bytes: &[u8]) -> u8 {
        let mut crc = INIT;
        for &byte in bytes {
            crc ^= byte;
            for _ in 0..8 {
                crc = if crc & 0x80 != 0 {
                    (crc << 1) ^ POLYNOMIAL
                } else {
                    crc << 1
                };
            }
        }
        crc
    }

    #[test]
    fn check_value() {
        assert_eq!(crc8(b"123456789"), STREAM_CRC.check);
        assert_eq!(bitwise(b"123456789"), STREAM_CRC.check);
    }

    #[test]
    fn table_matches_bitwise_reference() {
        for group in [[0u8; 4], [0xFF; 4], [0x00, 0x12, 0x34, 0x56], [0xF0, 1, 2, 3]] {
            assert_eq!(crc8(&group), bitwise(&group));
        }
    }

    #[test]
    fn single_bit_flips_are_detected() {
        let group = [0x03u8, 0x00, 0x00, 0x2A];
        let good = crc8(&group);
        for byte in 0..4 {
            for bit in 0..8 {
                let mut flipped = group;
                flipped[byte] ^= 1 << bit;
                assert_ne!(crc8(&flipped), good);
            }
        }
    }

    #[test]
    fn empty_input_is_init() {
        assert_eq!(crc8(&[]), INIT);
    }
}
