//! Two-pass sample-accurate cutting
//!
//! The scan pass walks the whole stream once, recording every music frame in a
//! [`FrameIndex`] together with the LAME delay/padding and an optional "PCUT" start
//! marker left by an earlier cut. The crop pass maps a sample range onto a frame range,
//! rebuilds the bit reservoir the first kept frame depends on inside a synthesized
//! filler frame, and writes a new Xing/LAME header frame describing the result.
//!
//! Filler ("PCUT") frame main data layout:
//!
//! ```text
//! "PCUT"  revision(1)  absolute start sample(5, big-endian)  0x78 ...  reservoir bytes
//! ```

use log::{debug, warn};
use serde::Serialize;
use std::io::{self, Read, Seek, SeekFrom, Write};

use crate::bitstream::{FrameFilter, FrameParser, JunkCounter, StreamEnd};
use crate::crc::{frame_crc_matches, update_frame_crc};
use crate::error::{CutError, Result};
use crate::header::{ChannelMode, FrameHeader, Layer, MpegVersion, HEADER_LEN, MAX_FRAME_SIZE};
use crate::index::{FrameIndex, FrameIndexEntry};
use crate::xing::{
    has_xing_frame_tag, HeaderFrameParams, XingLameTag, MASK_ATH_KILL_NO_GAP_END, MASK_ATH_KILL_NO_GAP_START,
    MAX_DELAY_PADDING,
};

/// Decoder context kept before the first and after the last requested sample.
pub const START_OVERLAP_SAMPLES: i64 = 576;
pub const END_OVERLAP_SAMPLES: i64 = 1152;

const PCUT_MAGIC: &[u8; 4] = b"PCUT";
const PCUT_REVISION: u8 = 0;
const PCUT_TAG_LEN: usize = 10;
const PCUT_FILL: u8 = 0x78;

const VBR_SCALE: u32 = 50;
const SEEK_TABLE_LEN: usize = 100;

#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    /// Encoder delay assumed when the stream has no LAME tag.
    pub default_delay: u16,
    /// Encoder padding assumed when the stream has no LAME tag.
    pub default_padding: u16,
    /// Stop scanning after this many bytes (e.g. before an ID3v1 tag).
    pub stream_limit: Option<u64>,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            default_delay: 576,
            default_padding: 1152,
            stream_limit: None,
        }
    }
}

/// Summary of a scanned stream.
#[derive(Debug, Clone, Serialize)]
pub struct ScanResult {
    pub version: MpegVersion,
    pub layer: Layer,
    pub sample_rate: u32,
    pub channel_mode: ChannelMode,
    /// Bitrate of the first frame (the VBR header frame, if any).
    pub first_bitrate_kbps: u32,
    /// Music frames, excluding a VBR header frame.
    pub frame_count: usize,
    pub samples_per_frame: u32,
    pub avg_bitrate_kbps: f32,
    pub is_vbr: bool,
    pub enc_delay: u16,
    pub enc_padding: u16,
    pub has_lame_tag: bool,
    pub encoder: Option<String>,
    /// Absolute start sample recorded by an earlier cut.
    pub start_sample: Option<i64>,
    pub junk_bytes: u64,
    pub stream_end: StreamEnd,
    /// Frames whose `main_data_begin` exceeds the reservoir built by earlier frames.
    pub reservoir_violations: usize,
}

impl ScanResult {
    /// Playable samples: frame count times samples per frame, minus delay and padding.
    pub fn total_samples(&self) -> i64 {
        self.frame_count as i64 * i64::from(self.samples_per_frame)
            - i64::from(self.enc_delay)
            - i64::from(self.enc_padding)
    }

    pub fn duration_secs(&self) -> f64 {
        self.total_samples().max(0) as f64 / f64::from(self.sample_rate)
    }
}

/// Running bit reservoir level, capped at the format's `main_data_begin` range.
#[derive(Debug, Clone, Copy)]
pub struct Reservoir {
    level: usize,
    max: usize,
}

impl Reservoir {
    pub fn new(max: usize) -> Self {
        Self { level: 0, max }
    }

    pub fn with_level(max: usize, level: usize) -> Self {
        Self {
            level: level.min(max),
            max,
        }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    /// Whether a frame reading `pointer` bytes back can be decoded.
    pub fn satisfies(&self, pointer: u16) -> bool {
        usize::from(pointer) <= self.level
    }

    /// Account for a frame's main data becoming available to later frames.
    pub fn feed(&mut self, main_data: usize) {
        self.level = (self.level + main_data).min(self.max);
    }
}

/// Reservoir bytes that could not be recovered ahead of the first kept frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReservoirShortfall {
    pub needed: usize,
    pub available: usize,
}

/// Outcome of a crop.
#[derive(Debug, Clone, Serialize)]
pub struct CropReport {
    /// Requested range after clamping.
    pub start_sample: i64,
    pub end_sample: i64,
    /// Kept source frames, `first_frame..last_frame`.
    pub first_frame: usize,
    pub last_frame: usize,
    pub enc_delay: i64,
    pub enc_padding: i64,
    pub filler_frame: bool,
    /// Source frames whose main data was copied into the filler frame.
    pub reservoir_frames: usize,
    pub silenced_frames: usize,
    pub bytes_written: u64,
    pub degraded: Option<ReservoirShortfall>,
}

impl CropReport {
    pub fn sample_count(&self) -> i64 {
        self.end_sample - self.start_sample
    }

    /// The degradation as an error value, for callers that want to treat it as one.
    pub fn degradation(&self) -> Option<CutError> {
        self.degraded.map(|s| CutError::ReservoirUnsatisfiable {
            needed: s.needed,
            available: s.available,
        })
    }
}

/// A scanned stream, ready to be cropped any number of times.
#[derive(Debug)]
pub struct ScannedMp3 {
    result: ScanResult,
    index: FrameIndex,
    xing: Option<XingLameTag>,
    first_header: FrameHeader,
    /// Position of the scanned region within the source handed to `crop`.
    base_offset: u64,
}

impl ScannedMp3 {
    /// Scan `reader`, which starts `base_offset` bytes into the source file.
    pub fn scan<R: Read>(reader: R, base_offset: u64, options: &ScanOptions) -> Result<Self> {
        let mut parser =
            FrameParser::new(reader, JunkCounter::default()).with_limit(options.stream_limit);
        parser.set_filter(FrameFilter::LAYER3);

        let mut index = FrameIndex::new();
        let mut first: Option<FrameHeader> = None;
        let mut xing: Option<XingLameTag> = None;
        let mut reservoir = Reservoir::new(0);
        let mut skip_header_frame = false;
        let mut is_vbr = false;
        let mut music_kbps: Option<u32> = None;
        let mut start_sample = None;
        let mut violations = 0;
        let mut music_bytes: u64 = 0;
        let mut enc_delay = options.default_delay;
        let mut enc_padding = options.default_padding;

        loop {
            let frame = match parser.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(CutError::InconsistentStream { offset }) if index.len() >= 2 => {
                    warn!(
                        "inconsistent frame at offset {}, keeping {} frames",
                        offset,
                        index.len()
                    );
                    break;
                }
                Err(e) => return Err(e),
            };

            let header = frame.header;
            let offset = frame.offset;
            let frame_len = frame.data.len();
            let pointer = header.reservoir_pointer(frame.data);
            let side_info_silent = frame.data[header.side_info_start()..header.side_info_end()]
                .iter()
                .all(|&b| b == 0);
            let pcut = read_pcut(&header, frame.data);
            let tag = match first {
                None => XingLameTag::parse(frame.data),
                Some(_) => {
                    if has_xing_frame_tag(frame.data) {
                        debug!("VBR header inside the stream at offset {}", offset);
                    }
                    None
                }
            };
            if header.has_crc() && !frame_crc_matches(&header, frame.data) {
                debug!("frame CRC mismatch at offset {}", offset);
            }

            match first {
                None => {
                    debug!("first frame at offset {}: {}", offset, header);
                    reservoir = Reservoir::new(header.max_reservoir());
                    parser.set_filter(FrameFilter::for_header(&header));
                    first = Some(header);
                    if let Some(tag) = tag {
                        debug!("VBR header frame at offset {}", offset);
                        is_vbr |= tag.has_xing_tag;
                        if tag.has_lame_tag {
                            enc_delay = tag.enc_delay;
                            enc_padding = tag.enc_padding;
                        }
                        xing = Some(tag);
                        skip_header_frame = true;
                    }
                }
                Some(_) => {}
            }

            if skip_header_frame {
                skip_header_frame = false;
                continue;
            }

            // VBR detection compares music frames only, never the header frame
            let mut check_bitrate = true;
            if index.is_empty() {
                // first music frame, possibly a filler written by an earlier cut
                match pcut {
                    Some(sample) => {
                        debug!("PCUT filler frame, absolute start sample {}", sample);
                        start_sample = Some(sample);
                        check_bitrate = false;
                    }
                    None => check_bitrate = !side_info_silent,
                }
            }
            if check_bitrate {
                match music_kbps {
                    None => music_kbps = Some(header.bitrate_kbps()),
                    Some(kbps) if kbps != header.bitrate_kbps() => is_vbr = true,
                    Some(_) => {}
                }
            }

            if !reservoir.satisfies(pointer) {
                debug!(
                    "frame {} needs {} reservoir bytes, {} available",
                    index.len(),
                    pointer,
                    reservoir.level()
                );
                violations += 1;
            }
            let main_data = frame_len - header.side_info_end();
            reservoir.feed(main_data);
            index.push(FrameIndexEntry::new(offset, frame_len, pointer, main_data)?);
            music_bytes += frame_len as u64;
        }

        let first_header = first.ok_or(CutError::NoFramesFound)?;
        if index.is_empty() {
            return Err(CutError::NoFramesFound);
        }

        let junk = parser.junk();
        if junk.bytes > 0 {
            debug!("skipped {} junk bytes in {} runs", junk.bytes, junk.blocks);
        }
        let stream_end = parser.stream_end().unwrap_or(StreamEnd::EndOfStream);
        match stream_end {
            StreamEnd::EndOfStream => {}
            other => warn!("stream ended early: {:?}", other),
        }

        let frame_count = index.len();
        let samples_per_frame = first_header.samples_per_frame();
        let frame_rate = first_header.sample_rate() as f32 / samples_per_frame as f32;
        let avg_bitrate_kbps = music_bytes as f32 / frame_count as f32 * frame_rate / 125.0;

        let result = ScanResult {
            version: first_header.version(),
            layer: first_header.layer(),
            sample_rate: first_header.sample_rate(),
            channel_mode: first_header.channel_mode(),
            first_bitrate_kbps: first_header.bitrate_kbps(),
            frame_count,
            samples_per_frame,
            avg_bitrate_kbps,
            is_vbr,
            enc_delay,
            enc_padding,
            has_lame_tag: xing.as_ref().is_some_and(|t| t.has_lame_tag),
            encoder: xing.as_ref().and_then(|t| t.encoder.clone()),
            start_sample,
            junk_bytes: junk.bytes,
            stream_end,
            reservoir_violations: violations,
        };
        debug!(
            "scanned {} frames in {} bytes ({} index pages), delay {}, padding {}, {:.1} kbps",
            frame_count,
            parser.position(),
            index.page_count(),
            enc_delay,
            enc_padding,
            avg_bitrate_kbps
        );

        Ok(Self {
            result,
            index,
            xing,
            first_header,
            base_offset,
        })
    }

    pub fn result(&self) -> &ScanResult {
        &self.result
    }

    pub fn index(&self) -> &FrameIndex {
        &self.index
    }

    pub fn xing(&self) -> Option<&XingLameTag> {
        self.xing.as_ref()
    }

    pub fn total_samples(&self) -> i64 {
        self.result.total_samples()
    }

    fn entry(&self, frame: usize) -> Result<&FrameIndexEntry> {
        self.index
            .get(frame)
            .ok_or(CutError::IndexOverflow("frame number"))
    }

    /// Write samples `start..end` of the scanned stream to `out`.
    ///
    /// `source` is the file the scan read from; frames are fetched by seeking.
    pub fn crop<R, W>(&self, start: i64, end: i64, source: &mut R, out: &mut W) -> Result<CropReport>
    where
        R: Read + Seek,
        W: Write,
    {
        let spf = i64::from(self.result.samples_per_frame);
        let delay = i64::from(self.result.enc_delay);
        let padding = i64::from(self.result.enc_padding);
        let total = self.total_samples();
        let frame_count = self.index.len() as i64;
        let max_res = self.first_header.max_reservoir();

        let start = start.max(-delay);
        let end = end.min(total + padding);

        let mut ath_mask = 0xFF;
        if start != 0 {
            ath_mask &= MASK_ATH_KILL_NO_GAP_START;
        }
        if end != total {
            ath_mask &= MASK_ATH_KILL_NO_GAP_END;
        }

        let first = ((start + delay - START_OVERLAP_SAMPLES) / spf).max(0);
        let last = ((end + delay + END_OVERLAP_SAMPLES + spf - 1) / spf).min(frame_count);
        if end <= start || first >= last {
            return Err(CutError::EmptyRange { start, end });
        }
        let mut new_delay = delay + start - first * spf;
        let new_padding = (last - first) * spf - new_delay - (end - start);
        let first = first as usize;
        let last = last as usize;

        let needed = usize::from(self.entry(first)?.bit_res_ptr);
        let mut gathered = 0;
        let mut pre_frames = 0;
        while first - pre_frames > 0 && needed > gathered && new_delay + spf <= MAX_DELAY_PADDING {
            pre_frames += 1;
            gathered += usize::from(self.entry(first - pre_frames)?.main_data_size);
        }

        let stream_len = source.seek(SeekFrom::End(0))?;
        let mut buffer = vec![0u8; MAX_FRAME_SIZE];

        let mut first_frame_num = first as i64;
        let mut bit_res = 0;
        let filler = if new_delay + spf <= MAX_DELAY_PADDING {
            first_frame_num -= 1;
            new_delay += spf;
            let absolute = start + self.result.start_sample.unwrap_or(0);
            let mut filler = build_filler(&self.first_header, needed, absolute)?;

            let mut reservoir: Vec<u8> = Vec::with_capacity(max_res + MAX_FRAME_SIZE);
            if needed > 0 {
                for entry in self.index.range(first - pre_frames..first) {
                    let frame = self.read_frame(source, stream_len, entry, &mut buffer)?;
                    let main_data = usize::from(entry.main_data_size);
                    reservoir.extend_from_slice(&frame[frame.len() - main_data..]);
                    if reservoir.len() > max_res {
                        reservoir.drain(..reservoir.len() - max_res);
                    }
                }
            }
            bit_res = needed.min(reservoir.len());
            let filler_len = filler.len();
            filler[filler_len - bit_res..].copy_from_slice(&reservoir[reservoir.len() - bit_res..]);
            debug!(
                "filler frame of {} bytes carrying {} reservoir bytes from {} frames",
                filler_len, bit_res, pre_frames
            );
            Some(filler)
        } else {
            warn!("encoder delay {} leaves no room for a filler frame", new_delay);
            None
        };

        let degraded = (bit_res < needed).then(|| ReservoirShortfall {
            needed,
            available: bit_res,
        });
        if let Some(shortfall) = degraded {
            warn!(
                "only {} of {} reservoir bytes recovered for frame {}",
                shortfall.available, shortfall.needed, first
            );
        }

        let filler_len = filler.as_ref().map_or(0, Vec::len);
        let mut kept_sizes = Vec::with_capacity(last - first);
        let mut music_len = filler_len as u64;
        for entry in self.index.range(first..last) {
            kept_sizes.push(music_len);
            music_len += u64::from(entry.frame_size);
        }
        let seek_table = build_seek_table(&kept_sizes, music_len);

        let frame_rate = self.first_header.sample_rate() as f32 / spf as f32;
        let kbps = music_len as f32 / (last - first) as f32 * frame_rate / 125.0;

        let header_frame = XingLameTag::build(&HeaderFrameParams {
            like: self.first_header,
            vbr: self.result.is_vbr,
            kbps,
            frame_count: (last as i64 - first_frame_num) as u32,
            music_bytes: u32::try_from(music_len).map_err(|_| CutError::IndexOverflow("music length"))?,
            vbr_scale: VBR_SCALE,
            seek_table: &seek_table,
            enc_delay: new_delay,
            enc_padding: new_padding,
            source: self.xing.as_ref(),
            ath_mask,
        })?;

        out.write_all(&header_frame)?;
        let mut bytes_written = header_frame.len() as u64;
        if let Some(filler) = &filler {
            out.write_all(filler)?;
            bytes_written += filler.len() as u64;
        }

        let mut available = Reservoir::with_level(max_res, bit_res);
        let mut silenced = 0;
        for entry in self.index.range(first..last) {
            let frame = self.read_frame(source, stream_len, entry, &mut buffer)?;
            if !available.satisfies(entry.bit_res_ptr) {
                silence_frame(frame)?;
                silenced += 1;
            }
            out.write_all(frame)?;
            bytes_written += frame.len() as u64;
            available.feed(usize::from(entry.main_data_size));
        }
        if silenced > 0 {
            debug!("silenced {} frames lacking reservoir data", silenced);
        }

        Ok(CropReport {
            start_sample: start,
            end_sample: end,
            first_frame: first,
            last_frame: last,
            enc_delay: new_delay.clamp(0, MAX_DELAY_PADDING),
            enc_padding: new_padding.clamp(0, MAX_DELAY_PADDING),
            filler_frame: filler.is_some(),
            reservoir_frames: if needed > 0 && filler.is_some() { pre_frames } else { 0 },
            silenced_frames: silenced,
            bytes_written,
            degraded,
        })
    }

    /// Read one indexed frame from `source` into `buffer`.
    fn read_frame<'b, R: Read + Seek>(
        &self,
        source: &mut R,
        stream_len: u64,
        entry: &FrameIndexEntry,
        buffer: &'b mut [u8],
    ) -> Result<&'b mut [u8]> {
        let offset = self.base_offset + u64::from(entry.file_offset);
        let frame_len = usize::from(entry.frame_size);
        if self.base_offset + entry.end_offset() > stream_len {
            return Err(CutError::FrameExceedsStream {
                offset,
                frame_len,
                stream_len,
            });
        }
        source.seek(SeekFrom::Start(offset))?;
        let frame = &mut buffer[..frame_len];
        let mut got = 0;
        while got < frame_len {
            match source.read(&mut frame[got..]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if got < frame_len {
            return Err(CutError::TruncatedPayload {
                offset,
                expected: frame_len,
                got,
            });
        }
        Ok(frame)
    }
}

/// 100 byte positions sampled evenly over the kept frames, scaled to 0..=255.
fn build_seek_table(positions: &[u64], music_len: u64) -> [u8; SEEK_TABLE_LEN] {
    let mut table = [0u8; SEEK_TABLE_LEN];
    let count = positions.len();
    if count == 0 || music_len == 0 {
        return table;
    }
    for (i, slot) in table.iter_mut().enumerate() {
        let frame = (i + 1) * count / (SEEK_TABLE_LEN + 1);
        let position = positions[frame.min(count - 1)];
        *slot = (position as f64 * 255.0 / music_len as f64).round() as u8;
    }
    table
}

/// Absolute start sample from a filler frame's PCUT tag.
fn read_pcut(header: &FrameHeader, frame: &[u8]) -> Option<i64> {
    let start = header.side_info_end();
    let tag = frame.get(start..start + PCUT_TAG_LEN)?;
    if &tag[..4] != PCUT_MAGIC {
        return None;
    }
    let raw = tag[5..10]
        .iter()
        .fold(0u64, |acc, &b| (acc << 8) | u64::from(b));
    // sign-extend the 40-bit field
    Some(((raw << 24) as i64) >> 24)
}

/// Smallest frame shaped like `like` whose main data holds the PCUT tag and
/// `reservoir_bytes` more. Side info is zero, so the frame decodes to silence.
fn build_filler(like: &FrameHeader, reservoir_bytes: usize, absolute_start: i64) -> Result<Vec<u8>> {
    let base = like.without_crc();
    for index in 1..15 {
        let header = base.with_bitrate_index(index)?;
        if header.main_data_size() < reservoir_bytes + PCUT_TAG_LEN {
            continue;
        }
        let mut frame = vec![0u8; header.frame_len()];
        frame[..HEADER_LEN].copy_from_slice(&header.encode());
        let main_data = header.side_info_end();
        frame[main_data..].fill(PCUT_FILL);
        frame[main_data..main_data + 4].copy_from_slice(PCUT_MAGIC);
        frame[main_data + 4] = PCUT_REVISION;
        frame[main_data + 5..main_data + PCUT_TAG_LEN]
            .copy_from_slice(&absolute_start.to_be_bytes()[3..]);
        return Ok(frame);
    }
    Err(CutError::NoFittingBitrate)
}

/// Zero the side information so the frame decodes to silence without touching the
/// reservoir, then refresh the CRC if the frame is protected.
pub fn silence_frame(frame: &mut [u8]) -> Result<()> {
    let bytes: [u8; 4] = frame
        .get(..HEADER_LEN)
        .and_then(|b| b.try_into().ok())
        .ok_or(CutError::SyncNotFound)?;
    let header = FrameHeader::decode(bytes)?;
    let end = header.side_info_end().min(frame.len());
    frame[HEADER_LEN..end].fill(0);
    update_frame_crc(&header, frame);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crc::frame_crc_matches;
    use crate::test_support::{frame, music, CBR_128, CBR_160, CBR_32, MONO_128};
    use proptest::prelude::*;
    use std::io::Cursor;

    fn scan(data: &[u8]) -> ScannedMp3 {
        ScannedMp3::scan(Cursor::new(data), 0, &ScanOptions::default()).unwrap()
    }

    fn crop(scanned: &ScannedMp3, data: &[u8], start: i64, end: i64) -> (Vec<u8>, CropReport) {
        let mut out = Vec::new();
        let report = scanned
            .crop(start, end, &mut Cursor::new(data), &mut out)
            .unwrap();
        (out, report)
    }

    fn vbr_header_frame(delay: i64, padding: i64) -> Vec<u8> {
        let table = [0u8; 100];
        XingLameTag::build(&HeaderFrameParams {
            like: FrameHeader::decode(CBR_128).unwrap(),
            vbr: true,
            kbps: 128.0,
            frame_count: 10,
            music_bytes: 4170,
            vbr_scale: 50,
            seek_table: &table,
            enc_delay: delay,
            enc_padding: padding,
            source: None,
            ath_mask: 0xFF,
        })
        .unwrap()
    }

    #[test]
    fn test_scan_plain_cbr() {
        let data = music(CBR_128, 20, |_| 0);
        let scanned = scan(&data);
        let result = scanned.result();
        assert_eq!(result.frame_count, 20);
        assert_eq!(result.samples_per_frame, 1152);
        assert_eq!(result.sample_rate, 44100);
        assert!(!result.is_vbr);
        assert!(!result.has_lame_tag);
        assert_eq!((result.enc_delay, result.enc_padding), (576, 1152));
        assert_eq!(result.total_samples(), 20 * 1152 - 576 - 1152);
        assert_eq!(result.start_sample, None);
        assert_eq!(result.stream_end, StreamEnd::EndOfStream);
        assert_eq!(result.reservoir_violations, 0);
        assert!((result.avg_bitrate_kbps - 128.0).abs() < 1.0);
        assert_eq!(scanned.index().get(3).unwrap().file_offset, 3 * 417);
    }

    #[test]
    fn test_scan_custom_defaults() {
        let data = music(CBR_128, 4, |_| 0);
        let options = ScanOptions {
            default_delay: 1105,
            default_padding: 0,
            stream_limit: None,
        };
        let scanned = ScannedMp3::scan(Cursor::new(&data), 0, &options).unwrap();
        assert_eq!(scanned.result().enc_delay, 1105);
        assert_eq!(scanned.result().enc_padding, 0);
    }

    #[test]
    fn test_scan_vbr_header_not_counted() {
        let mut data = vbr_header_frame(1105, 500);
        data.extend(music(CBR_128, 10, |_| 0));
        let scanned = scan(&data);
        let result = scanned.result();
        assert_eq!(result.frame_count, 10);
        assert!(result.is_vbr);
        assert!(result.has_lame_tag);
        assert_eq!(result.encoder.as_deref(), Some("LAME"));
        assert_eq!((result.enc_delay, result.enc_padding), (1105, 500));
        assert_eq!(scanned.index().get(0).unwrap().file_offset, 417);
    }

    #[test]
    fn test_scan_detects_bitrate_changes() {
        let mut data = music(CBR_128, 3, |_| 0);
        data.extend(frame(CBR_160, 0, 7));
        data.extend(music(CBR_128, 3, |_| 0));
        let result = scan(&data).result().clone();
        assert!(result.is_vbr);
        assert_eq!(result.frame_count, 7);
    }

    #[test]
    fn test_low_bitrate_cbr_stays_cbr_after_crop() {
        let data = music(CBR_32, 30, |_| 0);
        let scanned = scan(&data);
        assert!(!scanned.result().is_vbr);

        let (out, _) = crop(&scanned, &data, 5000, 20000);
        // the header frame needs a larger bitrate to hold its tag
        let header = FrameHeader::decode(out[..4].try_into().unwrap()).unwrap();
        assert_eq!(header.bitrate_kbps(), 64);

        let rescanned = scan(&out);
        assert!(!rescanned.result().is_vbr);
        assert!(rescanned.xing().unwrap().has_info_tag);
        assert_eq!(rescanned.result().first_bitrate_kbps, 64);
        assert_eq!(rescanned.total_samples(), 15_000);

        let (again, _) = crop(&rescanned, &out, 1000, 9000);
        assert_eq!(&again[4 + 32..4 + 36], b"Info");
    }

    #[test]
    fn test_scan_counts_junk_and_reservoir_violations() {
        let mut data = vec![0u8; 7];
        data.extend(frame(CBR_128, 0, 1));
        data.extend(frame(CBR_128, 500, 2));
        data.extend(frame(CBR_128, 300, 3));
        let result = scan(&data).result().clone();
        assert_eq!(result.junk_bytes, 7);
        assert_eq!(result.reservoir_violations, 1);
    }

    #[test]
    fn test_scan_without_frames() {
        let err = ScannedMp3::scan(Cursor::new(vec![0x55u8; 4000]), 0, &ScanOptions::default());
        assert!(matches!(err, Err(CutError::NoFramesFound)));

        let header_only = vbr_header_frame(576, 0);
        let err = ScannedMp3::scan(Cursor::new(header_only), 0, &ScanOptions::default());
        assert!(matches!(err, Err(CutError::NoFramesFound)));
    }

    #[test]
    fn test_scan_inconsistent_stream() {
        let mut data = frame(CBR_128, 0, 1);
        data.extend(frame(MONO_128, 0, 2));
        let err = ScannedMp3::scan(Cursor::new(&data), 0, &ScanOptions::default());
        assert!(matches!(err, Err(CutError::InconsistentStream { offset: 417 })));

        let mut data = music(CBR_128, 3, |_| 0);
        data.extend(frame(MONO_128, 0, 2));
        data.extend(music(CBR_128, 3, |_| 0));
        let result = scan(&data).result().clone();
        assert_eq!(result.frame_count, 3);
        assert_eq!(
            result.stream_end,
            StreamEnd::InconsistentStream { offset: 3 * 417 }
        );
    }

    #[test]
    fn test_full_range_crop_keeps_sample_count() {
        let data = music(CBR_128, 20, |_| 0);
        let scanned = scan(&data);
        let total = scanned.total_samples();
        let (out, report) = crop(&scanned, &data, 0, total);

        assert_eq!(report.first_frame, 0);
        assert_eq!(report.last_frame, 20);
        assert!(report.filler_frame);
        assert_eq!(report.silenced_frames, 0);
        assert_eq!(report.degraded, None);
        assert_eq!(report.bytes_written, out.len() as u64);

        let rescanned = scan(&out);
        let result = rescanned.result();
        assert!(result.has_lame_tag);
        assert!(!result.is_vbr);
        assert_eq!(result.start_sample, Some(0));
        assert_eq!(result.frame_count, 21);
        assert_eq!(result.total_samples(), total);
        assert_eq!(rescanned.xing().unwrap().frame_count, Some(21));

        // kept frames are copied verbatim after the header and filler frames
        let tail = &out[out.len() - data.len()..];
        assert_eq!(tail, &data[..]);
    }

    #[test]
    fn test_crop_records_start_and_accumulates() {
        let data = music(CBR_128, 20, |_| 0);
        let scanned = scan(&data);
        let (out, report) = crop(&scanned, &data, 5000, 15000);
        assert_eq!((report.first_frame, report.last_frame), (4, 15));
        assert_eq!((report.enc_delay, report.enc_padding), (968 + 1152, 1704));
        assert_eq!(report.sample_count(), 10_000);

        let second = scan(&out);
        assert_eq!(second.result().start_sample, Some(5000));
        assert_eq!(second.total_samples(), 10_000);
        assert_eq!(second.result().enc_delay, 2120);

        let (out, _) = crop(&second, &out, 1000, 3000);
        let third = scan(&out);
        assert_eq!(third.result().start_sample, Some(6000));
        assert_eq!(third.total_samples(), 2000);
    }

    #[test]
    fn test_crop_rebuilds_reservoir() {
        let data = music(CBR_128, 20, |i| if i == 0 { 0 } else { 100 });
        let scanned = scan(&data);
        let (out, report) = crop(&scanned, &data, 5000, 15000);
        assert_eq!(report.reservoir_frames, 1);
        assert_eq!(report.silenced_frames, 0);
        assert_eq!(report.degraded, None);

        let header_len = 417;
        let filler = FrameHeader::decode(out[header_len..header_len + 4].try_into().unwrap()).unwrap();
        let filler_len = filler.frame_len();
        assert_eq!(filler_len, 156);
        // the last 100 bytes of frame 3's main data end the filler
        let filler_data = &out[header_len..header_len + filler_len];
        assert!(filler_data[filler_len - 100..].iter().all(|&b| b == 3));
        assert_eq!(&filler_data[36..40], b"PCUT");
        assert_eq!(filler_data[46], PCUT_FILL);

        let kept = &out[header_len + filler_len..];
        assert_eq!(kept, &data[4 * 417..15 * 417]);
        assert_eq!(scan(&out).result().reservoir_violations, 0);
    }

    #[test]
    fn test_crop_silences_unsatisfied_frames() {
        let mut data = frame(CBR_128, 0, 1);
        data.extend(frame(CBR_128, 500, 2));
        data.extend(music(CBR_128, 8, |_| 0));
        let scanned = scan(&data);
        assert_eq!(scanned.result().reservoir_violations, 1);

        let (out, report) = crop(&scanned, &data, 0, scanned.total_samples());
        assert_eq!(report.silenced_frames, 1);
        let second = out.len() - data.len() + 417;
        assert!(out[second + 4..second + 36].iter().all(|&b| b == 0));
        assert!(out[second + 36..second + 417].iter().all(|&b| b == 2));
        assert_eq!(scan(&out).result().reservoir_violations, 0);
    }

    #[test]
    fn test_crop_reports_short_reservoir() {
        let mut data = frame(CBR_128, 0, 1);
        data.extend(frame(CBR_128, 500, 2));
        data.extend(music(CBR_128, 8, |_| 0));
        let scanned = scan(&data);

        let (_, report) = crop(&scanned, &data, 1152, 5000);
        assert_eq!(report.first_frame, 1);
        assert_eq!(
            report.degraded,
            Some(ReservoirShortfall {
                needed: 500,
                available: 381
            })
        );
        assert!(matches!(
            report.degradation(),
            Some(CutError::ReservoirUnsatisfiable {
                needed: 500,
                available: 381
            })
        ));
        assert_eq!(report.silenced_frames, 1);
    }

    #[test]
    fn test_crop_clamps_range() {
        let data = music(CBR_128, 10, |_| 0);
        let scanned = scan(&data);
        let total = scanned.total_samples();
        let (_, report) = crop(&scanned, &data, -100_000, 100_000);
        assert_eq!(report.start_sample, -576);
        assert_eq!(report.end_sample, total + 1152);
        assert_eq!((report.first_frame, report.last_frame), (0, 10));
    }

    #[test]
    fn test_crop_empty_range() {
        let data = music(CBR_128, 10, |_| 0);
        let scanned = scan(&data);
        let mut out = Vec::new();
        assert!(matches!(
            scanned.crop(5000, 5000, &mut Cursor::new(&data), &mut out),
            Err(CutError::EmptyRange { .. })
        ));
        assert!(matches!(
            scanned.crop(1_000_000, 2_000_000, &mut Cursor::new(&data), &mut out),
            Err(CutError::EmptyRange { .. })
        ));
        assert!(out.is_empty());
    }

    #[test]
    fn test_crop_with_base_offset() {
        let mut data = vec![0xAAu8; 10];
        data.extend(music(CBR_128, 10, |_| 0));
        let scanned =
            ScannedMp3::scan(Cursor::new(&data[10..]), 10, &ScanOptions::default()).unwrap();
        let (out, _) = crop(&scanned, &data, 0, scanned.total_samples());
        assert_eq!(&out[out.len() - 417..], &data[data.len() - 417..]);
    }

    #[test]
    fn test_crop_short_source() {
        let data = music(CBR_128, 10, |_| 0);
        let scanned = scan(&data);
        let mut out = Vec::new();
        let short = &data[..data.len() - 100];
        assert!(matches!(
            scanned.crop(0, scanned.total_samples(), &mut Cursor::new(short), &mut out),
            Err(CutError::FrameExceedsStream { .. })
        ));
    }

    #[test]
    fn test_ath_mask_applied_to_carried_tag() {
        let mut source = vbr_header_frame(576, 1152);
        source[156 + 0x13] = 0xFF;
        let crc = crate::crc::lame_crc(&source[..190]);
        source[190..192].copy_from_slice(&crc.to_be_bytes());
        source.extend(music(CBR_128, 10, |_| 0));
        let scanned = scan(&source);

        let (out, _) = crop(&scanned, &source, 0, scanned.total_samples());
        assert_eq!(out[156 + 0x13], 0xFF);
        let (out, _) = crop(&scanned, &source, 2000, scanned.total_samples());
        assert_eq!(out[156 + 0x13], 0x7F);
        let (out, _) = crop(&scanned, &source, 2000, 5000);
        assert_eq!(out[156 + 0x13], 0x3F);
    }

    #[test]
    fn test_pcut_roundtrip_negative_start() {
        let header = FrameHeader::decode(CBR_128).unwrap();
        let filler = build_filler(&header, 0, -576).unwrap();
        assert_eq!(filler.len(), 104);
        assert_eq!(read_pcut(&header, &filler), Some(-576));
        let filler = build_filler(&header, 200, 1 << 38).unwrap();
        assert!(header.with_bitrate_index(1).unwrap().main_data_size() < 210);
        assert_eq!(read_pcut(&header, &filler), Some(1 << 38));
    }

    #[test]
    fn test_silence_protected_frame() {
        let header = [0xFF, 0xFA, 0x90, 0x00];
        let mut data = frame(header, 300, 0x44);
        silence_frame(&mut data).unwrap();
        assert!(data[6..38].iter().all(|&b| b == 0));
        assert!(data[38..].iter().all(|&b| b == 0x44));
        assert!(frame_crc_matches(&FrameHeader::decode(header).unwrap(), &data));
    }

    #[test]
    fn test_seek_table() {
        let positions: Vec<u64> = (0..202).map(|i| i * 10).collect();
        let table = build_seek_table(&positions, 2020);
        assert_eq!(table[0], 3);
        assert_eq!(table[99], 252);
        assert!(table.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(build_seek_table(&[], 0), [0u8; 100]);
    }

    #[test]
    fn test_reservoir_level_capped() {
        let mut reservoir = Reservoir::new(511);
        assert!(reservoir.satisfies(0));
        assert!(!reservoir.satisfies(1));
        reservoir.feed(381);
        reservoir.feed(381);
        assert_eq!(reservoir.level(), 511);
        assert!(reservoir.satisfies(511));
        assert_eq!(Reservoir::with_level(255, 400).level(), 255);
    }

    proptest! {
        #[test]
        fn test_reservoir_never_exceeds_max(
            feeds in proptest::collection::vec(0usize..3000, 0..50),
            mpeg1 in any::<bool>(),
        ) {
            let max = if mpeg1 { 511 } else { 255 };
            let mut reservoir = Reservoir::new(max);
            for feed in feeds {
                reservoir.feed(feed);
                prop_assert!(reservoir.level() <= max);
            }
        }

        #[test]
        fn test_cropped_stream_reservoir_consistent(
            pointers in proptest::collection::vec(0u16..512, 12..20),
            start in 0i64..10_000,
        ) {
            let data = music(CBR_128, pointers.len(), |i| pointers[i]);
            let scanned = scan(&data);
            let (out, report) = crop(&scanned, &data, start, start + 3000);
            let rescanned = scan(&out);
            prop_assert_eq!(rescanned.result().reservoir_violations, 0);
            prop_assert_eq!(rescanned.total_samples(), report.sample_count());
        }
    }
}
