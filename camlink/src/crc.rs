//! Checksum codecs for camera protocol frames.
//!
//! Two distinct checksums protect disjoint regions of every frame: a CRC-16
//! over the 10-byte header prefix and a CRC-32 over the whole frame up to
//! its own trailing four bytes. The parameters below reproduce the camera
//! firmware's tables; both directions of the link validate against them.

use crc_all::CrcAlgo;

/// Calculates the header CRC-16 over a slice of bytes.
///
/// Reflected CRC-16-CCITT with the camera's seed of 0x496C and no output
/// XOR. The caller passes exactly the byte range the frame layout assigns
/// to this checksum (the header prefix); the codec itself is range-agnostic.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = CRC16_INIT;
    CRC16.update_crc(&mut crc, data);
    CRC16.finish_crc(&crc)
}

const CRC16_INIT: u16 = 0x496C;

const CRC16: CrcAlgo<u16> = CrcAlgo::<u16>::new(
    0x1021,     // polynomial (CCITT)
    16,         // width
    CRC16_INIT, // init
    0,          // xorout
    true,       // reflect
);

/// Calculates the frame CRC-32 over a slice of bytes.
///
/// Reflected IEEE polynomial with the camera's seed of 0x3B9ACA07 and no
/// output XOR. Covers everything from the start-of-frame byte through the
/// end of the payload.
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc = CRC32_INIT;
    CRC32.update_crc(&mut crc, data);
    CRC32.finish_crc(&crc)
}

const CRC32_INIT: u32 = 0x3B9A_CA07;

const CRC32: CrcAlgo<u32> = CrcAlgo::<u32>::new(
    0x04C1_1DB7, // polynomial (IEEE)
    32,          // width
    CRC32_INIT,  // init
    0,           // xorout
    true,        // reflect
);

#[cfg(test)]
mod tests {
    use test_case::test_case;

    #[test_case(&[]; "empty")]
    #[test_case(&[0x00]; "single zero")]
    #[test_case(&[0xAA, 0x1A, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00]; "header prefix")]
    fn crc16_is_deterministic(data: &[u8]) {
        assert_eq!(super::crc16(data), super::crc16(data));
    }

    #[test_case(&[]; "empty")]
    #[test_case(&[0xAA]; "sof only")]
    #[test_case(&[0xAA, 0x12, 0x00, 0x20, 0x00, 0x00, 0x00, 0x00, 0x34, 0x12]; "header prefix")]
    fn crc32_is_deterministic(data: &[u8]) {
        assert_eq!(super::crc32(data), super::crc32(data));
    }

    #[test]
    fn crc16_detects_single_bit_flips() {
        let reference = [0xAA, 0x1A, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00];
        let good = super::crc16(&reference);
        for byte in 0..reference.len() {
            for bit in 0..8 {
                let mut tampered = reference;
                tampered[byte] ^= 1 << bit;
                assert_ne!(
                    super::crc16(&tampered),
                    good,
                    "flip at byte {byte} bit {bit} went undetected"
                );
            }
        }
    }

    #[test]
    fn crc32_detects_single_bit_flips() {
        let reference = [
            0xAA, 0x17, 0x00, 0x22, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x5C, 0x9E, 0x1D, 0x03,
            0x00,
        ];
        let good = super::crc32(&reference);
        for byte in 0..reference.len() {
            for bit in 0..8 {
                let mut tampered = reference;
                tampered[byte] ^= 1 << bit;
                assert_ne!(
                    super::crc32(&tampered),
                    good,
                    "flip at byte {byte} bit {bit} went undetected"
                );
            }
        }
    }

    #[test]
    fn crc16_depends_on_byte_order() {
        assert_ne!(super::crc16(&[0x01, 0x02]), super::crc16(&[0x02, 0x01]));
    }

    #[test]
    fn crc32_depends_on_length() {
        assert_ne!(super::crc32(&[0x00]), super::crc32(&[0x00, 0x00]));
    }
}
