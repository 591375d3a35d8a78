//! Frame-level bitstream scanner
//!
//! Bytes are consumed one at a time through a 4-byte sliding window so that arbitrary
//! garbage (tag remnants, damaged frames) in front of or between frames is tolerated.
//! A failed header verification only advances the window by one byte, which is what
//! lets the scanner recover from false sync matches. Every byte that does not end up
//! inside a frame is forwarded to a [`JunkSink`].

use bitflags::bitflags;
use log::debug;
use serde::Serialize;
use std::io::{self, Read};

use crate::error::{CutError, Result};
use crate::header::{FrameHeader, Layer, MpegVersion, HEADER_LEN, MAX_FRAME_SIZE};

bitflags! {
    /// Restricts which headers the scanner accepts.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFilter: u32 {
        const MPEG1 = 0x0001;
        const MPEG2 = 0x0002;
        const MPEG25 = 0x0004;
        const LAYER1 = 0x0008;
        const LAYER2 = 0x0010;
        const LAYER3 = 0x0020;
        const HZ32000 = 0x0040;
        const HZ44100 = 0x0080;
        const HZ48000 = 0x0100;
        const MONO = 0x0200;
        const STEREO = 0x0400;
    }
}

impl FrameFilter {
    /// Filter that only accepts frames shaped like `header`.
    ///
    /// Sample rates are matched by family (44.1k/22.05k/11.025k share a table index),
    /// which together with the version pins the exact rate.
    pub fn for_header(header: &FrameHeader) -> Self {
        let version = match header.version() {
            MpegVersion::Mpeg1 => FrameFilter::MPEG1,
            MpegVersion::Mpeg2 => FrameFilter::MPEG2,
            MpegVersion::Mpeg25 => FrameFilter::MPEG25,
        };
        let layer = match header.layer() {
            Layer::Layer1 => FrameFilter::LAYER1,
            Layer::Layer2 => FrameFilter::LAYER2,
            Layer::Layer3 => FrameFilter::LAYER3,
        };
        let rate = match header.sample_rate_index() {
            0 => FrameFilter::HZ44100,
            1 => FrameFilter::HZ48000,
            _ => FrameFilter::HZ32000,
        };
        let mode = if header.channels() == 1 {
            FrameFilter::MONO
        } else {
            FrameFilter::STEREO
        };
        version | layer | rate | mode
    }

    /// Header word mask and the value the masked word must equal.
    fn mask_and_value(&self) -> (u32, u32) {
        let mut mask = 0xFFE0_0000;
        let mut value = 0xFFE0_0000;

        if self.contains(FrameFilter::MPEG1) {
            mask |= 0x0018_0000;
            value |= 0x0018_0000;
        } else if self.contains(FrameFilter::MPEG2) {
            mask |= 0x0018_0000;
            value |= 0x0010_0000;
        } else if self.contains(FrameFilter::MPEG25) {
            mask |= 0x0018_0000;
        }

        if self.contains(FrameFilter::LAYER1) {
            mask |= 0x0006_0000;
            value |= 0x0006_0000;
        } else if self.contains(FrameFilter::LAYER2) {
            mask |= 0x0006_0000;
            value |= 0x0004_0000;
        } else if self.contains(FrameFilter::LAYER3) {
            mask |= 0x0006_0000;
            value |= 0x0002_0000;
        }

        if self.contains(FrameFilter::HZ32000) {
            mask |= 0x0000_0C00;
            value |= 0x0000_0800;
        } else if self.contains(FrameFilter::HZ44100) {
            mask |= 0x0000_0C00;
        } else if self.contains(FrameFilter::HZ48000) {
            mask |= 0x0000_0C00;
            value |= 0x0000_0400;
        }

        if self.contains(FrameFilter::MONO) {
            mask |= 0x0000_00C0;
            value |= 0x0000_00C0;
        }
        (mask, value)
    }

    pub fn accepts(&self, header: &FrameHeader) -> bool {
        let (mask, value) = self.mask_and_value();
        if header.word() & mask != value {
            return false;
        }
        !(self.contains(FrameFilter::STEREO) && header.channels() != 2)
    }
}

/// Receives every byte the scanner rejects.
pub trait JunkSink {
    fn write(&mut self, byte: u8);
    /// Called when a run of junk ends (a frame was found or the stream ended).
    fn end_of_block(&mut self);
}

/// Junk sink that only keeps statistics.
#[derive(Debug, Default, Clone, Copy)]
pub struct JunkCounter {
    pub bytes: u64,
    pub blocks: u64,
    pending: u64,
}

impl JunkSink for JunkCounter {
    fn write(&mut self, _byte: u8) {
        self.bytes += 1;
        self.pending += 1;
    }

    fn end_of_block(&mut self) {
        if self.pending > 0 {
            self.blocks += 1;
            self.pending = 0;
        }
    }
}

impl JunkSink for Vec<u8> {
    fn write(&mut self, byte: u8) {
        self.push(byte);
    }

    fn end_of_block(&mut self) {}
}

impl<J: JunkSink + ?Sized> JunkSink for &mut J {
    fn write(&mut self, byte: u8) {
        (**self).write(byte);
    }

    fn end_of_block(&mut self) {
        (**self).end_of_block();
    }
}

/// A frame as extracted by the scanner. The payload borrows the scanner's buffer
/// and is only valid until the next call to [`FrameParser::next_frame`].
#[derive(Debug)]
pub struct MpegFrame<'a> {
    pub header: FrameHeader,
    /// Offset of the header's first byte, relative to where scanning started.
    pub offset: u64,
    /// Whole frame, header included.
    pub data: &'a [u8],
}

/// Why the scanner stopped producing frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StreamEnd {
    EndOfStream,
    /// End of stream was reached in the middle of a frame.
    TruncatedPayload { offset: u64, expected: usize, got: usize },
    /// A frame would run past the byte limit given to the scanner.
    FrameExceedsStream { offset: u64, frame_len: usize },
    /// A frame contiguous with the previous one failed the filter.
    InconsistentStream { offset: u64 },
}

#[derive(Debug, Clone, Copy)]
enum State {
    Seeking,
    SyncCandidate,
    HeaderVerified(FrameHeader),
    PayloadRead(FrameHeader, u64),
    Done,
}

pub struct FrameParser<R, J> {
    reader: R,
    junk: J,
    filter: FrameFilter,
    window: [u8; 4],
    filled: usize,
    position: u64,
    since_frame: u64,
    frames_seen: bool,
    limit: Option<u64>,
    buffer: Vec<u8>,
    end: Option<StreamEnd>,
}

impl<R: Read, J: JunkSink> FrameParser<R, J> {
    pub fn new(reader: R, junk: J) -> Self {
        Self {
            reader,
            junk,
            filter: FrameFilter::empty(),
            window: [0; 4],
            filled: 0,
            position: 0,
            since_frame: 0,
            frames_seen: false,
            limit: None,
            buffer: vec![0; MAX_FRAME_SIZE],
            end: None,
        }
    }

    /// Never consume more than `limit` bytes from the reader.
    pub fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit;
        self
    }

    pub fn set_filter(&mut self, filter: FrameFilter) {
        self.filter = filter;
    }

    /// Bytes consumed from the reader so far.
    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn stream_end(&self) -> Option<StreamEnd> {
        self.end
    }

    pub fn junk(&self) -> &J {
        &self.junk
    }

    /// Find and read the next frame. `Ok(None)` means the stream is exhausted;
    /// [`FrameParser::stream_end`] tells how it ended.
    pub fn next_frame(&mut self) -> Result<Option<MpegFrame<'_>>> {
        let mut state = if self.end.is_some() {
            State::Done
        } else {
            State::Seeking
        };

        loop {
            state = match state {
                State::Seeking => match self.read_byte()? {
                    None => {
                        self.flush_window();
                        self.end = Some(StreamEnd::EndOfStream);
                        State::Done
                    }
                    Some(byte) => {
                        self.push(byte);
                        if self.filled == HEADER_LEN
                            && self.window[0] == 0xFF
                            && self.window[1] & 0xE0 == 0xE0
                        {
                            State::SyncCandidate
                        } else {
                            State::Seeking
                        }
                    }
                },
                State::SyncCandidate => match FrameHeader::decode(self.window) {
                    Err(_) => State::Seeking,
                    Ok(header) if !self.filter.accepts(&header) => {
                        let offset = self.position - HEADER_LEN as u64;
                        if self.frames_seen && self.since_frame == HEADER_LEN as u64 {
                            self.end = Some(StreamEnd::InconsistentStream { offset });
                            return Err(CutError::InconsistentStream { offset });
                        }
                        debug!("rejected filtered header {:08X} at {}", header.word(), offset);
                        State::Seeking
                    }
                    Ok(header) => State::HeaderVerified(header),
                },
                State::HeaderVerified(header) => {
                    let offset = self.position - HEADER_LEN as u64;
                    let frame_len = header.frame_len();
                    match self.limit {
                        Some(limit) if offset + frame_len as u64 > limit => {
                            self.flush_window();
                            self.end = Some(StreamEnd::FrameExceedsStream { offset, frame_len });
                            State::Done
                        }
                        _ => {
                            self.buffer[..HEADER_LEN].copy_from_slice(&self.window);
                            let got = self.read_payload(frame_len)?;
                            if got < frame_len {
                                for i in 0..got {
                                    self.junk.write(self.buffer[i]);
                                }
                                self.junk.end_of_block();
                                self.filled = 0;
                                self.end = Some(StreamEnd::TruncatedPayload {
                                    offset,
                                    expected: frame_len,
                                    got,
                                });
                                State::Done
                            } else {
                                State::PayloadRead(header, offset)
                            }
                        }
                    }
                }
                State::PayloadRead(header, offset) => {
                    self.junk.end_of_block();
                    self.filled = 0;
                    self.since_frame = 0;
                    self.frames_seen = true;
                    return Ok(Some(MpegFrame {
                        header,
                        offset,
                        data: &self.buffer[..header.frame_len()],
                    }));
                }
                State::Done => return Ok(None),
            };
        }
    }

    fn push(&mut self, byte: u8) {
        if self.filled == HEADER_LEN {
            self.junk.write(self.window[0]);
            self.window.copy_within(1.., 0);
            self.window[HEADER_LEN - 1] = byte;
        } else {
            self.window[self.filled] = byte;
            self.filled += 1;
        }
    }

    fn flush_window(&mut self) {
        for i in 0..self.filled {
            self.junk.write(self.window[i]);
        }
        self.filled = 0;
        self.junk.end_of_block();
    }

    fn read_byte(&mut self) -> Result<Option<u8>> {
        if matches!(self.limit, Some(limit) if self.position >= limit) {
            return Ok(None);
        }
        let mut byte = [0u8; 1];
        loop {
            match self.reader.read(&mut byte) {
                Ok(0) => return Ok(None),
                Ok(_) => {
                    self.position += 1;
                    self.since_frame += 1;
                    return Ok(Some(byte[0]));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Fill the buffer up to `frame_len`, returning how many bytes (header included) it holds.
    fn read_payload(&mut self, frame_len: usize) -> Result<usize> {
        let mut got = HEADER_LEN;
        while got < frame_len {
            match self.reader.read(&mut self.buffer[got..frame_len]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let payload = (got - HEADER_LEN) as u64;
        self.position += payload;
        self.since_frame += payload;
        Ok(got)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{frame, CBR_128, MONO_128};
    use proptest::prelude::*;
    use std::io::Cursor;

    fn collect<J: JunkSink>(parser: &mut FrameParser<Cursor<Vec<u8>>, J>) -> Vec<(u64, usize)> {
        let mut frames = Vec::new();
        while let Some(f) = parser.next_frame().unwrap() {
            frames.push((f.offset, f.data.len()));
        }
        frames
    }

    #[test]
    fn test_frames_after_garbage() {
        let mut data = vec![0x00, 0x01, 0x02, 0x03, 0x04];
        data.extend(frame(CBR_128, 0, 0x11));
        data.extend(frame(CBR_128, 0, 0x22));

        let mut parser = FrameParser::new(Cursor::new(data), JunkCounter::default());
        let frames = collect(&mut parser);
        assert_eq!(frames, vec![(5, 417), (422, 417)]);
        assert_eq!(parser.stream_end(), Some(StreamEnd::EndOfStream));
        assert_eq!(parser.junk().bytes, 5);
        assert_eq!(parser.junk().blocks, 1);
        assert_eq!(parser.position(), 5 + 2 * 417);
    }

    #[test]
    fn test_false_sync_slides_by_one() {
        // FF FF FB 90 is a layer I header with bitrate index 15
        let mut data = vec![0xFF];
        data.extend(frame(CBR_128, 0, 0x33));

        let mut junk = Vec::new();
        let mut parser = FrameParser::new(Cursor::new(data), &mut junk);
        let frames = collect(&mut parser);
        assert_eq!(frames, vec![(1, 417)]);
        drop(parser);
        assert_eq!(junk, vec![0xFF]);
    }

    #[test]
    fn test_truncated_tail_goes_to_junk() {
        let mut data = frame(CBR_128, 0, 0x11);
        data.extend(&frame(CBR_128, 0, 0x22)[..200]);

        let mut parser = FrameParser::new(Cursor::new(data), JunkCounter::default());
        let frames = collect(&mut parser);
        assert_eq!(frames.len(), 1);
        assert_eq!(
            parser.stream_end(),
            Some(StreamEnd::TruncatedPayload {
                offset: 417,
                expected: 417,
                got: 200
            })
        );
        assert_eq!(parser.junk().bytes, 200);
    }

    #[test]
    fn test_limit_stops_before_oversized_frame() {
        let mut data = frame(CBR_128, 0, 0x11);
        data.extend(frame(CBR_128, 0, 0x22));
        data.extend(b"TAG");

        let mut parser =
            FrameParser::new(Cursor::new(data), JunkCounter::default()).with_limit(Some(417 + 300));
        let frames = collect(&mut parser);
        assert_eq!(frames.len(), 1);
        assert_eq!(
            parser.stream_end(),
            Some(StreamEnd::FrameExceedsStream {
                offset: 417,
                frame_len: 417
            })
        );
    }

    #[test]
    fn test_filter_rejects_contiguous_inconsistent_frame() {
        let first = FrameHeader::decode(CBR_128).unwrap();
        let mut data = frame(CBR_128, 0, 0x11);
        data.extend(frame(MONO_128, 0, 0x22));

        let mut parser = FrameParser::new(Cursor::new(data), JunkCounter::default());
        parser.set_filter(FrameFilter::for_header(&first));
        assert!(parser.next_frame().unwrap().is_some());
        assert!(matches!(
            parser.next_frame(),
            Err(CutError::InconsistentStream { offset: 417 })
        ));
        assert_eq!(
            parser.stream_end(),
            Some(StreamEnd::InconsistentStream { offset: 417 })
        );
        assert!(parser.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_filter_skips_inconsistent_frame_after_junk() {
        let first = FrameHeader::decode(CBR_128).unwrap();
        let mut data = frame(CBR_128, 0, 0x11);
        data.extend([0x00, 0x00]);
        data.extend(frame(MONO_128, 0, 0x00));
        data.extend(frame(CBR_128, 0, 0x22));

        let mut parser = FrameParser::new(Cursor::new(data), JunkCounter::default());
        parser.set_filter(FrameFilter::for_header(&first));
        let frames = collect(&mut parser);
        assert_eq!(frames, vec![(0, 417), (419 + 417, 417)]);
        assert_eq!(parser.junk().bytes, 2 + 417);
    }

    #[test]
    fn test_filter_for_header() {
        let stereo = FrameHeader::decode(CBR_128).unwrap();
        let mono = FrameHeader::decode(MONO_128).unwrap();
        let mpeg2 = FrameHeader::decode([0xFF, 0xF3, 0x80, 0x00]).unwrap();
        let filter = FrameFilter::for_header(&stereo);
        assert_eq!(
            filter,
            FrameFilter::MPEG1 | FrameFilter::LAYER3 | FrameFilter::HZ44100 | FrameFilter::STEREO
        );
        assert!(filter.accepts(&stereo));
        assert!(filter.accepts(&stereo.with_bitrate_index(14).unwrap()));
        assert!(!filter.accepts(&mono));
        assert!(!filter.accepts(&mpeg2));
        assert!(FrameFilter::for_header(&mono).accepts(&mono));
        assert!(FrameFilter::for_header(&mpeg2).accepts(&mpeg2));
        assert!(!FrameFilter::LAYER3.accepts(
            &FrameHeader::decode([0xFF, 0xFD, 0x90, 0x00]).unwrap()
        ));
    }

    proptest! {
        #[test]
        fn test_resync_after_arbitrary_garbage(
            garbage in proptest::collection::vec(0u8..0xFF, 0..2000),
            count in 1usize..5,
        ) {
            let mut data = garbage.clone();
            for i in 0..count {
                data.extend(frame(CBR_128, 0, i as u8));
            }
            let mut parser = FrameParser::new(Cursor::new(data), JunkCounter::default());
            let frames = collect(&mut parser);
            let expected: Vec<(u64, usize)> = (0..count)
                .map(|i| ((garbage.len() + i * 417) as u64, 417))
                .collect();
            prop_assert_eq!(frames, expected);
            prop_assert_eq!(parser.junk().bytes, garbage.len() as u64);
        }

        #[test]
        fn test_resync_after_false_syncs(
            chunks in proptest::collection::vec(
                prop_oneof![
                    (0u8..0xFF).prop_map(|b| vec![b]),
                    // sync bits set, reserved layer 00: never decodes
                    (any::<u8>(), 0u8..0xFF, 0u8..0xFF)
                        .prop_map(|(b1, b2, b3)| vec![0xFF, 0xE0 | (b1 & 0x19), b2, b3]),
                ],
                0..400,
            ),
            count in 1usize..5,
        ) {
            let garbage: Vec<u8> = chunks.concat();
            let mut data = garbage.clone();
            for i in 0..count {
                data.extend(frame(CBR_128, 0, i as u8));
            }
            let mut parser = FrameParser::new(Cursor::new(data), JunkCounter::default());
            let frames = collect(&mut parser);
            let expected: Vec<(u64, usize)> = (0..count)
                .map(|i| ((garbage.len() + i * 417) as u64, 417))
                .collect();
            prop_assert_eq!(frames, expected);
            prop_assert_eq!(parser.junk().bytes, garbage.len() as u64);
        }
    }
}
