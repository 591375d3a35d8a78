//! MPEG audio frame header codec
//!
//! Frame header structure (4 bytes, big-endian):
//! AAAAAAAA AAABBCCD EEEEFFGH IIJJKLMM
//!
//! A = sync (11 bits)
//! B = MPEG version (2 bits): 00=2.5, 01=reserved, 10=2, 11=1
//! C = Layer (2 bits): 00=reserved, 01=III, 10=II, 11=I
//! D = Protection bit (0 means a 16-bit CRC follows the header)
//! E = Bitrate index (4 bits)
//! F = Sample rate index (2 bits)
//! G = Padding bit
//! H = Private bit
//! I = Channel mode (2 bits)
//! J = Mode extension (2 bits)
//! K = Copyright
//! L = Original
//! M = Emphasis (2 bits)
//!
//! A `FrameHeader` can only be obtained through validation, so every accessor
//! maps to a defined table entry.

use serde::Serialize;
use std::fmt;

use crate::error::{CutError, Result};

/// Length in bytes of the header word.
pub const HEADER_LEN: usize = 4;

/// Largest frame any valid header can describe, header included.
pub const MAX_FRAME_SIZE: usize = 2881;

const SYNC_MASK: u32 = 0xFFE0_0000;
const PROTECTION_BIT: u32 = 0x0001_0000;
const BITRATE_MASK: u32 = 0x0000_F000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MpegVersion {
    Mpeg1,
    Mpeg2,
    Mpeg25,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Layer {
    Layer1,
    Layer2,
    Layer3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChannelMode {
    Stereo,
    JointStereo,
    DualMono,
    Mono,
}

/// Meaning of the mode extension bits, which depends on layer and channel mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ModeExtension {
    NotApplicable,
    /// Layer I/II intensity stereo: first band of the joint range.
    Bands(u8),
    None,
    IntensityStereo,
    MsStereo,
    IntensityMsStereo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Emphasis {
    None,
    Ms50_15,
    CcittJ17,
}

impl fmt::Display for MpegVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MpegVersion::Mpeg1 => "1.0",
            MpegVersion::Mpeg2 => "2.0",
            MpegVersion::Mpeg25 => "2.5",
        })
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Layer::Layer1 => "I",
            Layer::Layer2 => "II",
            Layer::Layer3 => "III",
        })
    }
}

impl fmt::Display for ChannelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChannelMode::Stereo => "Stereo",
            ChannelMode::JointStereo => "Joint stereo",
            ChannelMode::DualMono => "Dual mono",
            ChannelMode::Mono => "Mono",
        })
    }
}

impl ChannelMode {
    pub fn channel_count(&self) -> usize {
        match self {
            ChannelMode::Mono => 1,
            _ => 2,
        }
    }
}

// Bitrate lookup tables (kbps), index 0 (free format) and 15 (bad) are rejected
const BITRATES_V1_L1: [u32; 15] = [0, 32, 64, 96, 128, 160, 192, 224, 256, 288, 320, 352, 384, 416, 448];
const BITRATES_V1_L2: [u32; 15] = [0, 32, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384];
const BITRATES_V1_L3: [u32; 15] = [0, 32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320];
const BITRATES_V2_L1: [u32; 15] = [0, 32, 48, 56, 64, 80, 96, 112, 128, 144, 160, 176, 192, 224, 256];
const BITRATES_V2_L23: [u32; 15] = [0, 8, 16, 24, 32, 40, 48, 56, 64, 80, 96, 112, 128, 144, 160];

/// Sample rate table
const SAMPLE_RATE_TABLE: [[u32; 3]; 3] = [
    [44100, 48000, 32000], // MPEG1
    [22050, 24000, 16000], // MPEG2
    [11025, 12000, 8000],  // MPEG2.5
];

/// A validated 32-bit MPEG audio frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FrameHeader(u32);

impl FrameHeader {
    /// Decode four header bytes.
    pub fn decode(bytes: [u8; 4]) -> Result<Self> {
        Self::from_word(u32::from_be_bytes(bytes))
    }

    /// Validate a raw header word. Sync is checked first so random data is rejected cheaply.
    pub fn from_word(word: u32) -> Result<Self> {
        if word & SYNC_MASK != SYNC_MASK {
            return Err(CutError::SyncNotFound);
        }
        if (word >> 19) & 0x03 == 0b01 {
            return Err(CutError::InvalidField("version"));
        }
        if (word >> 17) & 0x03 == 0b00 {
            return Err(CutError::InvalidField("layer"));
        }
        let bitrate_index = (word >> 12) & 0x0F;
        if bitrate_index == 0 || bitrate_index == 15 {
            return Err(CutError::InvalidField("bitrate"));
        }
        if (word >> 10) & 0x03 == 0b11 {
            return Err(CutError::InvalidField("sample rate"));
        }
        if word & 0x03 == 0b10 {
            return Err(CutError::InvalidField("emphasis"));
        }
        Ok(FrameHeader(word))
    }

    /// Inverse of [`FrameHeader::decode`].
    pub fn encode(&self) -> [u8; 4] {
        self.0.to_be_bytes()
    }

    pub fn word(&self) -> u32 {
        self.0
    }

    pub fn version(&self) -> MpegVersion {
        match (self.0 >> 19) & 0x03 {
            0b00 => MpegVersion::Mpeg25,
            0b10 => MpegVersion::Mpeg2,
            _ => MpegVersion::Mpeg1,
        }
    }

    pub fn layer(&self) -> Layer {
        match (self.0 >> 17) & 0x03 {
            0b01 => Layer::Layer3,
            0b10 => Layer::Layer2,
            _ => Layer::Layer1,
        }
    }

    /// True when a 16-bit CRC follows the header (protection bit cleared).
    pub fn has_crc(&self) -> bool {
        self.0 & PROTECTION_BIT == 0
    }

    pub fn bitrate_index(&self) -> usize {
        ((self.0 >> 12) & 0x0F) as usize
    }

    pub fn bitrate_kbps(&self) -> u32 {
        let table = match (self.version(), self.layer()) {
            (MpegVersion::Mpeg1, Layer::Layer1) => &BITRATES_V1_L1,
            (MpegVersion::Mpeg1, Layer::Layer2) => &BITRATES_V1_L2,
            (MpegVersion::Mpeg1, Layer::Layer3) => &BITRATES_V1_L3,
            (_, Layer::Layer1) => &BITRATES_V2_L1,
            (_, _) => &BITRATES_V2_L23,
        };
        table[self.bitrate_index()]
    }

    pub fn sample_rate_index(&self) -> usize {
        ((self.0 >> 10) & 0x03) as usize
    }

    pub fn sample_rate(&self) -> u32 {
        let version_index = match self.version() {
            MpegVersion::Mpeg1 => 0,
            MpegVersion::Mpeg2 => 1,
            MpegVersion::Mpeg25 => 2,
        };
        SAMPLE_RATE_TABLE[version_index][self.sample_rate_index()]
    }

    pub fn padding(&self) -> bool {
        self.0 & 0x200 != 0
    }

    pub fn private(&self) -> bool {
        self.0 & 0x100 != 0
    }

    pub fn channel_mode(&self) -> ChannelMode {
        match (self.0 >> 6) & 0x03 {
            0b00 => ChannelMode::Stereo,
            0b01 => ChannelMode::JointStereo,
            0b10 => ChannelMode::DualMono,
            _ => ChannelMode::Mono,
        }
    }

    pub fn channels(&self) -> usize {
        self.channel_mode().channel_count()
    }

    pub fn mode_extension(&self) -> ModeExtension {
        if self.channel_mode() != ChannelMode::JointStereo {
            return ModeExtension::NotApplicable;
        }
        let bits = ((self.0 >> 4) & 0x03) as u8;
        match self.layer() {
            Layer::Layer1 | Layer::Layer2 => ModeExtension::Bands(4 + 4 * bits),
            Layer::Layer3 => match bits {
                0 => ModeExtension::None,
                1 => ModeExtension::IntensityStereo,
                2 => ModeExtension::MsStereo,
                _ => ModeExtension::IntensityMsStereo,
            },
        }
    }

    pub fn copyright(&self) -> bool {
        self.0 & 0x08 != 0
    }

    pub fn original(&self) -> bool {
        self.0 & 0x04 != 0
    }

    pub fn emphasis(&self) -> Emphasis {
        match self.0 & 0x03 {
            0b00 => Emphasis::None,
            0b01 => Emphasis::Ms50_15,
            _ => Emphasis::CcittJ17,
        }
    }

    pub fn samples_per_frame(&self) -> u32 {
        match (self.version(), self.layer()) {
            (_, Layer::Layer1) => 384,
            (_, Layer::Layer2) | (MpegVersion::Mpeg1, Layer::Layer3) => 1152,
            (_, Layer::Layer3) => 576,
        }
    }

    /// Frame length in bytes, header included. Division truncates, matching decoders.
    pub fn frame_len(&self) -> usize {
        let bitrate = self.bitrate_kbps();
        let sample_rate = self.sample_rate();
        let pad = u32::from(self.padding());
        let len = match self.layer() {
            Layer::Layer1 => (12_000 * bitrate / sample_rate + pad) * 4,
            _ => self.samples_per_frame() / 8 * 1000 * bitrate / sample_rate + pad,
        };
        len as usize
    }

    /// Offset from frame start to side information
    pub fn side_info_start(&self) -> usize {
        if self.has_crc() {
            6
        } else {
            4
        }
    }

    pub fn side_info_size(&self) -> usize {
        match (self.version(), self.channels()) {
            (MpegVersion::Mpeg1, 2) => 32,
            (MpegVersion::Mpeg1, _) => 17,
            (_, 2) => 17,
            (_, _) => 9,
        }
    }

    /// `(start, size)` of the side information within the frame.
    pub fn side_info_geometry(&self) -> (usize, usize) {
        (self.side_info_start(), self.side_info_size())
    }

    pub fn side_info_end(&self) -> usize {
        let (start, size) = self.side_info_geometry();
        start + size
    }

    /// Bytes following the side information, which feed the bit reservoir.
    pub fn main_data_size(&self) -> usize {
        self.frame_len().saturating_sub(self.side_info_end())
    }

    /// Largest value `main_data_begin` can hold.
    pub fn max_reservoir(&self) -> usize {
        match self.version() {
            MpegVersion::Mpeg1 => 511,
            _ => 255,
        }
    }

    /// Read `main_data_begin` (9 bits for MPEG1, 8 otherwise) from a frame's side info.
    pub fn reservoir_pointer(&self, frame: &[u8]) -> u16 {
        let start = self.side_info_start();
        let Some(&first) = frame.get(start) else {
            return 0;
        };
        match self.version() {
            MpegVersion::Mpeg1 => {
                let second = frame.get(start + 1).copied().unwrap_or(0);
                (u16::from(first) << 1) | u16::from(second >> 7)
            }
            _ => u16::from(first),
        }
    }

    /// Same header with the CRC disabled.
    pub fn without_crc(&self) -> Self {
        FrameHeader(self.0 | PROTECTION_BIT)
    }

    /// Same header with a different bitrate index.
    pub fn with_bitrate_index(&self, index: usize) -> Result<Self> {
        if index > 0x0F {
            return Err(CutError::InvalidField("bitrate"));
        }
        Self::from_word((self.0 & !BITRATE_MASK) | ((index as u32) << 12))
    }
}

impl fmt::Display for FrameHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "MPEG {} layer {}, {} kbps, {} Hz, {}",
            self.version(),
            self.layer(),
            self.bitrate_kbps(),
            self.sample_rate(),
            self.channel_mode()
        )?;
        if self.mode_extension() != ModeExtension::NotApplicable {
            write!(f, " ({:?})", self.mode_extension())?;
        }
        if self.emphasis() != Emphasis::None {
            write!(f, ", emphasis {:?}", self.emphasis())?;
        }
        let flags = [
            (self.has_crc(), "crc"),
            (self.copyright(), "copyright"),
            (self.original(), "original"),
            (self.private(), "private"),
        ];
        for (_, name) in flags.iter().filter(|(set, _)| *set) {
            write!(f, ", {}", name)?;
        }
        Ok(())
    }
}
