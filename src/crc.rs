//! CRC-16 variants used by MPEG audio.
//!
//! Both use polynomial 0x8005. The LAME tag checksum is the reflected form with a zero
//! initial value (CRC-16/ARC); the frame protection CRC is MSB-first with an initial
//! value of 0xFFFF.

use crc::{Crc, CRC_16_ARC, CRC_16_CMS};

use crate::header::FrameHeader;

const LAME_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_ARC);
const FRAME_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_CMS);

/// Checksum stored in the last two bytes of a LAME tag.
pub fn lame_crc(bytes: &[u8]) -> u16 {
    LAME_CRC.checksum(bytes)
}

/// Recompute and store the protection CRC of a frame, if the header declares one.
///
/// The CRC covers the last two header bytes and the side information.
pub fn update_frame_crc(header: &FrameHeader, frame: &mut [u8]) {
    if !header.has_crc() {
        return;
    }
    let side_info_end = header.side_info_end();
    if frame.len() < side_info_end {
        return;
    }
    let mut digest = FRAME_CRC.digest();
    digest.update(&frame[2..4]);
    digest.update(&frame[6..side_info_end]);
    let crc = digest.finalize();
    frame[4..6].copy_from_slice(&crc.to_be_bytes());
}

/// Check a protected frame against its stored CRC. Unprotected frames always pass.
pub fn frame_crc_matches(header: &FrameHeader, frame: &[u8]) -> bool {
    if !header.has_crc() {
        return true;
    }
    let side_info_end = header.side_info_end();
    if frame.len() < side_info_end {
        return false;
    }
    let mut digest = FRAME_CRC.digest();
    digest.update(&frame[2..4]);
    digest.update(&frame[6..side_info_end]);
    digest.finalize() == u16::from_be_bytes([frame[4], frame[5]])
}
