//! ID3 tags around the MPEG frame region
//!
//! A leading ID3v2 tag is skipped before scanning, and a trailing 128-byte ID3v1
//! block bounds the scan so its bytes are never mistaken for frame data.

use std::io::{Read, Seek, SeekFrom};

use crate::error::Result;

const ID3V2_HEADER_LEN: usize = 10;
const ID3V2_FOOTER_FLAG: u8 = 0x10;

pub const ID3V1_LEN: u64 = 128;

/// Length of an ID3v2 tag at the beginning of `data`, or 0 if there is none.
pub fn id3v2_len(data: &[u8]) -> usize {
    if data.len() < ID3V2_HEADER_LEN || &data[0..3] != b"ID3" {
        return 0;
    }

    // ID3v2 size is stored as syncsafe integer (7 bits per byte)
    let size = ((data[6] as usize & 0x7F) << 21)
        | ((data[7] as usize & 0x7F) << 14)
        | ((data[8] as usize & 0x7F) << 7)
        | (data[9] as usize & 0x7F);

    let footer = if data[5] & ID3V2_FOOTER_FLAG != 0 {
        ID3V2_HEADER_LEN
    } else {
        0
    };
    ID3V2_HEADER_LEN + size + footer
}

/// Text fields of an ID3v1 block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Id3v1 {
    pub title: String,
    pub artist: String,
    pub album: String,
}

impl Id3v1 {
    pub fn parse(block: &[u8]) -> Option<Self> {
        if block.len() < ID3V1_LEN as usize || &block[0..3] != b"TAG" {
            return None;
        }
        Some(Self {
            title: latin1_field(&block[3..33]),
            artist: latin1_field(&block[33..63]),
            album: latin1_field(&block[63..93]),
        })
    }
}

fn latin1_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    bytes[..end]
        .iter()
        .map(|&b| b as char)
        .collect::<String>()
        .trim()
        .to_string()
}

/// Byte range of a file that may hold MPEG frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioRegion {
    pub start: u64,
    pub end: u64,
}

impl AudioRegion {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Find the audio region of `source` and leave it positioned at the region start.
pub fn locate_audio<R: Read + Seek>(source: &mut R) -> Result<(AudioRegion, Option<Id3v1>)> {
    let file_len = source.seek(SeekFrom::End(0))?;

    let mut header = [0u8; ID3V2_HEADER_LEN];
    let mut start = 0;
    if file_len >= ID3V2_HEADER_LEN as u64 {
        source.seek(SeekFrom::Start(0))?;
        source.read_exact(&mut header)?;
        start = (id3v2_len(&header) as u64).min(file_len);
    }

    let mut end = file_len;
    let mut tag = None;
    if file_len - start >= ID3V1_LEN {
        let mut block = [0u8; ID3V1_LEN as usize];
        source.seek(SeekFrom::Start(file_len - ID3V1_LEN))?;
        source.read_exact(&mut block)?;
        tag = Id3v1::parse(&block);
        if tag.is_some() {
            end = file_len - ID3V1_LEN;
        }
    }

    source.seek(SeekFrom::Start(start))?;
    Ok((AudioRegion { start, end }, tag))
}
