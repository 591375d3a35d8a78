//! Xing/Info VBR header and embedded LAME tag
//!
//! The tag lives in the main data area of the first frame, right after the side
//! information:
//!
//! ```text
//! "Xing"|"Info"  flags(4)  [frames(4)] [bytes(4)] [toc(100)] [vbr scale(4)]  LAME tag(36)
//! ```
//!
//! Offsets inside the 36-byte LAME tag:
//!
//! ```text
//! 0x00 encoder string (9)    0x0B peak amplitude (4)   0x0F radio/audiophile gain (4)
//! 0x13 flags + ATH type      0x15 delay/padding (12+12 bits)
//! 0x1C music length (4)      0x20 music CRC (2)        0x22 tag CRC (2)
//! ```

use log::debug;

use crate::crc::lame_crc;
use crate::error::{CutError, Result};
use crate::header::FrameHeader;

/// Positions of a VBR header magic, counted from the frame start
/// (4-byte header + 9, 17 or 32 bytes of side information).
pub const XING_OFFSETS: [usize; 3] = [13, 21, 36];

/// Delay/padding reported when a tag without a verified LAME section holds nonsense.
pub const FALLBACK_DELAY: u16 = 576;
pub const FALLBACK_PADDING: u16 = 0;

/// Largest encoder delay/padding the 12-bit fields can carry.
pub const MAX_DELAY_PADDING: i64 = 4095;

/// Flag-byte masks clearing the no-gap bits when the start or end of a stream is cut.
pub const MASK_ATH_KILL_NO_GAP_START: u8 = 0x7F;
pub const MASK_ATH_KILL_NO_GAP_END: u8 = 0xBF;

const FLAG_FRAMES: u8 = 0x01;
const FLAG_BYTES: u8 = 0x02;
const FLAG_TOC: u8 = 0x04;
const FLAG_VBR_SCALE: u8 = 0x08;

const TOC_LEN: usize = 100;
const LAME_TAG_LEN: usize = 0x24;
const LAME_REPLAY_GAIN: usize = 0x0B;
const LAME_FLAGS: usize = 0x13;
const LAME_DELAY: usize = 0x15;
const LAME_MUSIC_LENGTH: usize = 0x1C;
const LAME_TAG_CRC: usize = 0x22;

/// Bytes carried over from a source tag: the VBR scale field plus the LAME tag.
const CARRIED_LEN: usize = 4 + LAME_TAG_LEN;

/// Header frames are never smaller than this, so the whole tag always fits.
const MIN_HEADER_FRAME_SIZE: usize = 0xC0;

/// Plausibility bounds for delay/padding read from an unverified tag.
const MAX_PLAUSIBLE_DELAY: u16 = 2880;
const MAX_PLAUSIBLE_PADDING: u16 = 2304;

/// Check for "Xing" or "Info" at any of the standard offsets.
pub fn has_xing_frame_tag(frame: &[u8]) -> bool {
    XING_OFFSETS.iter().any(|&offset| {
        matches!(
            frame.get(offset..offset + 4),
            Some(b"Xing") | Some(b"Info")
        )
    })
}

fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Parsed VBR header frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XingLameTag {
    pub has_xing_tag: bool,
    pub has_info_tag: bool,
    pub has_lame_tag: bool,
    pub frame_count: Option<u32>,
    pub byte_count: Option<u32>,
    pub toc: Option<Vec<u8>>,
    pub vbr_scale: Option<u32>,
    pub enc_delay: u16,
    pub enc_padding: u16,
    /// Encoder version string, e.g. "LAME3.100".
    pub encoder: Option<String>,
    raw: Vec<u8>,
    /// Offset of the VBR scale field that precedes the LAME tag.
    lame_offset: usize,
}

impl XingLameTag {
    /// Parse the first frame of a stream. Returns `None` when it carries no VBR header.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        let header = FrameHeader::decode(frame.get(..4)?.try_into().ok()?).ok()?;
        let mut offset = 4 + header.side_info_size();

        let magic = frame.get(offset..offset + 4)?;
        let has_xing_tag = magic == b"Xing";
        let has_info_tag = magic == b"Info";
        if !has_xing_tag && !has_info_tag {
            return None;
        }
        offset += 4;

        let flags = *frame.get(offset + 3)?;
        offset += 4;

        let mut frame_count = None;
        if flags & FLAG_FRAMES != 0 {
            frame_count = Some(read_u32(frame, offset)?);
            offset += 4;
        }
        let mut byte_count = None;
        if flags & FLAG_BYTES != 0 {
            byte_count = Some(read_u32(frame, offset)?);
            offset += 4;
        }
        let mut toc = None;
        if flags & FLAG_TOC != 0 {
            toc = Some(frame.get(offset..offset + TOC_LEN)?.to_vec());
            offset += TOC_LEN;
        }
        let mut vbr_scale = None;
        if flags & FLAG_VBR_SCALE != 0 {
            vbr_scale = Some(read_u32(frame, offset)?);
            offset += 4;
        }

        let lame = offset;
        let tag_end = lame + LAME_TAG_LEN;
        let mut has_lame_tag = false;
        let mut enc_delay = FALLBACK_DELAY;
        let mut enc_padding = FALLBACK_PADDING;
        let mut encoder = None;

        if frame.len() >= tag_end {
            let magic = &frame[lame..lame + 4];
            let stored_crc = u16::from_be_bytes([frame[tag_end - 2], frame[tag_end - 1]]);
            has_lame_tag = magic == b"LAME"
                || magic == b"GOGO"
                || lame_crc(&frame[..tag_end - 2]) == stored_crc;

            let d = lame + LAME_DELAY;
            enc_delay = (u16::from(frame[d]) << 4) | u16::from(frame[d + 1] >> 4);
            enc_padding = (u16::from(frame[d + 1] & 0x0F) << 8) | u16::from(frame[d + 2]);

            if has_lame_tag {
                let version = String::from_utf8_lossy(&frame[lame..lame + 9]);
                let version = version.trim_end_matches('\0').trim();
                if !version.is_empty() {
                    encoder = Some(version.to_string());
                }
            } else if enc_delay > MAX_PLAUSIBLE_DELAY || enc_padding > MAX_PLAUSIBLE_PADDING {
                debug!(
                    "discarding implausible delay/padding {}/{} from unverified tag",
                    enc_delay, enc_padding
                );
                enc_delay = FALLBACK_DELAY;
                enc_padding = FALLBACK_PADDING;
            }
        }

        Some(Self {
            has_xing_tag,
            has_info_tag,
            has_lame_tag,
            frame_count,
            byte_count,
            toc,
            vbr_scale,
            enc_delay,
            enc_padding,
            encoder,
            raw: frame[..header.frame_len().min(frame.len())].to_vec(),
            lame_offset: lame - 4,
        })
    }

    /// The frame the tag was parsed from.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Offset of the LAME section (preceded by the 4-byte VBR scale) within the frame.
    pub fn lame_offset(&self) -> usize {
        self.lame_offset
    }

    /// VBR scale field followed by the 36-byte LAME tag, if one was identified.
    fn carried_bytes(&self) -> Option<&[u8]> {
        if !self.has_lame_tag {
            return None;
        }
        let start = self.lame_offset();
        self.raw().get(start..start + CARRIED_LEN)
    }

    /// Synthesize a header frame for a rewritten stream.
    pub fn build(params: &HeaderFrameParams<'_>) -> Result<Vec<u8>> {
        let header = pick_header_frame(&params.like, params.kbps)?;
        let frame_size = header.frame_len();
        let total_bytes = (frame_size as u32).saturating_add(params.music_bytes);

        let mut frame = vec![0u8; frame_size];
        frame[..4].copy_from_slice(&header.encode());

        let mut pos = 4 + header.side_info_size();
        let mut put = |frame: &mut [u8], bytes: &[u8]| {
            frame[pos..pos + bytes.len()].copy_from_slice(bytes);
            pos += bytes.len();
        };
        put(&mut frame, if params.vbr { b"Xing" } else { b"Info" });
        put(&mut frame, &[0, 0, 0, FLAG_FRAMES | FLAG_BYTES | FLAG_TOC | FLAG_VBR_SCALE]);
        put(&mut frame, &params.frame_count.to_be_bytes());
        put(&mut frame, &total_bytes.to_be_bytes());
        put(&mut frame, params.seek_table);
        put(&mut frame, &params.vbr_scale.to_be_bytes());
        let lame = pos;

        match params.source.and_then(XingLameTag::carried_bytes) {
            Some(carried) => {
                frame[lame - 4..lame + LAME_TAG_LEN].copy_from_slice(carried);
                frame[lame + LAME_REPLAY_GAIN..lame + LAME_REPLAY_GAIN + 8].fill(0);
                frame[lame + LAME_FLAGS] &= params.ath_mask;
            }
            None => frame[lame..lame + 4].copy_from_slice(b"LAME"),
        }

        let delay = params.enc_delay.clamp(0, MAX_DELAY_PADDING) as u16;
        let padding = params.enc_padding.clamp(0, MAX_DELAY_PADDING) as u16;
        let d = lame + LAME_DELAY;
        frame[d] = (delay >> 4) as u8;
        frame[d + 1] = (((delay & 0x0F) << 4) | (padding >> 8)) as u8;
        frame[d + 2] = padding as u8;

        let music = lame + LAME_MUSIC_LENGTH;
        frame[music..music + 4].copy_from_slice(&total_bytes.to_be_bytes());

        let crc_at = lame + LAME_TAG_CRC;
        let crc = lame_crc(&frame[..crc_at]);
        frame[crc_at..crc_at + 2].copy_from_slice(&crc.to_be_bytes());
        Ok(frame)
    }
}

/// Inputs for [`XingLameTag::build`].
#[derive(Debug, Clone)]
pub struct HeaderFrameParams<'a> {
    /// Header the new frame must resemble (version, sample rate, channel mode).
    pub like: FrameHeader,
    pub vbr: bool,
    /// Average bitrate of the music; the header frame's bitrate is chosen closest to it.
    pub kbps: f32,
    pub frame_count: u32,
    /// Bytes of music following the header frame.
    pub music_bytes: u32,
    pub vbr_scale: u32,
    pub seek_table: &'a [u8; 100],
    pub enc_delay: i64,
    pub enc_padding: i64,
    /// Tag whose LAME section is carried over, if any.
    pub source: Option<&'a XingLameTag>,
    /// Applied to the LAME flags byte of a carried-over tag.
    pub ath_mask: u8,
}

/// Smallest-distance bitrate whose frame can hold the whole tag.
fn pick_header_frame(like: &FrameHeader, kbps: f32) -> Result<FrameHeader> {
    let base = like.without_crc();
    let mut best: Option<(FrameHeader, f32)> = None;
    for index in 1..15 {
        let candidate = base.with_bitrate_index(index)?;
        if candidate.frame_len() < MIN_HEADER_FRAME_SIZE {
            continue;
        }
        let distance = (kbps - candidate.bitrate_kbps() as f32).abs();
        if best.map_or(true, |(_, d)| distance < d) {
            best = Some((candidate, distance));
        }
    }
    best.map(|(header, _)| header).ok_or(CutError::NoFittingBitrate)
}
