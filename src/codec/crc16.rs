//! Frame checksum algorithms.
//!
//! Each variant appends a 16-bit check over everything before the last two
//! bytes. Verification returns `ChecksumMismatch` as a value; a corrupted
//! frame is counted and skipped, never a crash.

use crc::{CRC_16_ARC, CRC_16_IBM_3740, CRC_16_XMODEM, Crc};

use crate::error::DecodeError;

/// CRC-CCITT (poly 0x1021, init 0xFFFF), for IEEE C37.118 frames.
pub const CRC_CCITT: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// CRC-16/ARC (poly 0x8005, reflected), for IEEE 1344 frames.
pub const CRC_ARC: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);

/// CRC-16/XMODEM (poly 0x1021, init 0x0000), for BPA PDCstream frames.
pub const CRC_XMODEM: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

/// Byte order of the appended checksum word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumOrder {
    BigEndian,
    LittleEndian,
}

/// Compute the checksum a well-formed frame of `len` bytes would carry.
pub fn compute(algo: &Crc<u16>, frame_without_check: &[u8]) -> u16 {
    algo.checksum(frame_without_check)
}

/// Verify the trailing checksum of a complete frame image.
pub fn verify(algo: &Crc<u16>, order: ChecksumOrder, frame: &[u8]) -> Result<(), DecodeError> {
    if frame.len() < 2 {
        return Err(DecodeError::short_read("frame checksum", 2, frame.len()));
    }
    let (body, tail) = frame.split_at(frame.len() - 2);
    let received = match order {
        ChecksumOrder::BigEndian => u16::from_be_bytes([tail[0], tail[1]]),
        ChecksumOrder::LittleEndian => u16::from_le_bytes([tail[0], tail[1]]),
    };
    let computed = algo.checksum(body);
    if received != computed {
        return Err(DecodeError::ChecksumMismatch { received, computed });
    }
    Ok(())
}

/// Append the checksum footer to a frame body.
pub fn append(algo: &Crc<u16>, order: ChecksumOrder, body: &mut Vec<u8>) {
    let check = algo.checksum(body);
    match order {
        ChecksumOrder::BigEndian => body.extend_from_slice(&check.to_be_bytes()),
        ChecksumOrder::LittleEndian => body.extend_from_slice(&check.to_le_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_verify() {
        let mut frame = vec![0xAA, 0x41, 0x00, 0x08, 0x00, 0x07];
        append(&CRC_CCITT, ChecksumOrder::BigEndian, &mut frame);
        assert_eq!(frame.len(), 8);
        verify(&CRC_CCITT, ChecksumOrder::BigEndian, &frame).unwrap();
    }

    #[test]
    fn single_flipped_byte_is_caught() {
        let mut frame = vec![0xAA, 0x01, 0x00, 0x10, 0x12, 0x34, 0x56, 0x78];
        append(&CRC_XMODEM, ChecksumOrder::LittleEndian, &mut frame);
        frame[4] ^= 0x01;
        let err = verify(&CRC_XMODEM, ChecksumOrder::LittleEndian, &frame).unwrap_err();
        assert!(matches!(err, DecodeError::ChecksumMismatch { .. }));
    }

    #[test]
    fn known_ccitt_vector() {
        // CRC-16/IBM-3740 check value for "123456789".
        assert_eq!(compute(&CRC_CCITT, b"123456789"), 0x29B1);
        assert_eq!(compute(&CRC_ARC, b"123456789"), 0xBB3D);
        assert_eq!(compute(&CRC_XMODEM, b"123456789"), 0x31C3);
    }
}
