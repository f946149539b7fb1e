//! CRC-16/MODBUS checksum.
//!
//! Seed `0xFFFF`, reflected polynomial `0xA001`, no final XOR. The checksum
//! is appended to RTU frames low byte first.

use bytes::BufMut;

const POLYNOMIAL: u16 = 0xA001;

const fn build_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u16;
        let mut bit = 0;
        while bit < 8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ POLYNOMIAL;
            } else {
                crc >>= 1;
            }
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

static TABLE: [u16; 256] = build_table();

/// Compute the Modbus CRC16 of `data`.
///
/// # Examples
///
/// ```
/// use locker_protocol::crc::crc16;
///
/// // Write Single Coil, slave 1, coil 0, ON
/// assert_eq!(crc16(&[0x01, 0x05, 0x00, 0x00, 0xFF, 0x00]), 0x3A8C);
/// ```
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0xFFFF, |crc, &byte| {
        (crc >> 8) ^ TABLE[((crc ^ byte as u16) & 0x00FF) as usize]
    })
}

/// Append the CRC of everything already in `buf`, low byte first.
pub fn append_crc(buf: &mut impl BufMutExt) {
    let crc = crc16(buf.written());
    buf.put_u16_le(crc);
}

/// Check the trailing two CRC bytes of a complete frame.
///
/// Returns `(expected, actual)` on mismatch, where `expected` is computed
/// over the payload and `actual` is what the frame carries.
pub fn check_crc(frame: &[u8]) -> Result<(), (u16, u16)> {
    if frame.len() < 2 {
        return Err((crc16(frame), 0));
    }
    let (payload, tail) = frame.split_at(frame.len() - 2);
    let expected = crc16(payload);
    let actual = u16::from_le_bytes([tail[0], tail[1]]);
    if expected == actual {
        Ok(())
    } else {
        Err((expected, actual))
    }
}

/// A byte buffer that exposes what has been written so far.
pub trait BufMutExt: BufMut {
    fn written(&self) -> &[u8];
}

impl BufMutExt for bytes::BytesMut {
    fn written(&self) -> &[u8] {
        self
    }
}

impl BufMutExt for Vec<u8> {
    fn written(&self) -> &[u8] {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    /// Bit-by-bit reference: XOR each byte, eight right shifts, XOR 0xA001
    /// whenever the shifted-out bit is 1.
    fn reference_crc16(data: &[u8]) -> u16 {
        let mut crc: u16 = 0xFFFF;
        for &byte in data {
            crc ^= byte as u16;
            for _ in 0..8 {
                if crc & 0x0001 != 0 {
                    crc = (crc >> 1) ^ 0xA001;
                } else {
                    crc >>= 1;
                }
            }
        }
        crc
    }

    #[rstest]
    #[case(&[0x01, 0x05, 0x00, 0x00, 0xFF, 0x00], [0x8C, 0x3A])]
    #[case(&[0x01, 0x05, 0x00, 0x00, 0x00, 0x00], [0xCD, 0xCA])]
    #[case(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x01], [0x84, 0x0A])]
    #[case(&[0x00, 0x03, 0x40, 0x00, 0x00, 0x01], [0x90, 0x1B])]
    fn test_known_frames(#[case] payload: &[u8], #[case] wire: [u8; 2]) {
        let crc = crc16(payload);
        assert_eq!(crc.to_le_bytes(), wire);
        assert_eq!(reference_crc16(payload), crc);
    }

    #[test]
    fn test_empty_input_is_seed() {
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn test_append_then_check() {
        let mut frame = vec![0x02, 0x0F, 0x00, 0x03, 0x00, 0x01, 0x01, 0x01];
        append_crc(&mut frame);
        assert_eq!(frame.len(), 10);
        assert!(check_crc(&frame).is_ok());

        frame[3] ^= 0x01;
        assert!(check_crc(&frame).is_err());
    }

    #[test]
    fn test_check_short_frame() {
        assert!(check_crc(&[0x01]).is_err());
    }

    proptest! {
        /// The table-driven CRC agrees with the bitwise reference.
        #[test]
        fn prop_table_matches_reference(data in prop::collection::vec(any::<u8>(), 0..64)) {
            prop_assert_eq!(crc16(&data), reference_crc16(&data));
        }

        /// A frame with its CRC appended has a zero residue.
        #[test]
        fn prop_residue_is_zero(data in prop::collection::vec(any::<u8>(), 1..64)) {
            let mut frame = data.clone();
            append_crc(&mut frame);
            prop_assert_eq!(crc16(&frame), 0);
        }
    }
}
