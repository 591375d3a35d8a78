//! Synthetic frames for unit tests.

use crate::header::FrameHeader;

/// MPEG1 layer III, 128 kbps, 44100 Hz, stereo: 417-byte frames.
pub const CBR_128: [u8; 4] = [0xFF, 0xFB, 0x90, 0x00];
/// Same as [`CBR_128`] but mono.
pub const MONO_128: [u8; 4] = [0xFF, 0xFB, 0x90, 0xC0];
/// MPEG1 layer III, 32 kbps, 44100 Hz, stereo: 104-byte frames.
pub const CBR_32: [u8; 4] = [0xFF, 0xFB, 0x10, 0x00];
/// MPEG1 layer III, 160 kbps, 44100 Hz, stereo: 522-byte frames.
pub const CBR_160: [u8; 4] = [0xFF, 0xFB, 0xA0, 0x00];

/// Build a frame with the given `main_data_begin` and a non-silent side info.
/// The main data is filled with `fill`.
pub fn frame(header: [u8; 4], reservoir_ptr: u16, fill: u8) -> Vec<u8> {
    let h = FrameHeader::decode(header).unwrap();
    let mut data = vec![0u8; h.frame_len()];
    data[..4].copy_from_slice(&header);
    let start = h.side_info_start();
    if h.max_reservoir() == 511 {
        data[start] = (reservoir_ptr >> 1) as u8;
        data[start + 1] = ((reservoir_ptr & 1) as u8) << 7;
    } else {
        data[start] = reservoir_ptr as u8;
    }
    data[h.side_info_end() - 1] = 0x5A;
    for b in &mut data[h.side_info_end()..] {
        *b = fill;
    }
    data
}

/// `count` contiguous frames; frame `i` has reservoir pointer `ptr(i)` and fill `i`.
pub fn music(header: [u8; 4], count: usize, ptr: impl Fn(usize) -> u16) -> Vec<u8> {
    let mut data = Vec::new();
    for i in 0..count {
        data.extend(frame(header, ptr(i), (i % 200) as u8));
    }
    data
}
