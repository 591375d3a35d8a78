//! Paged, append-only table of per-frame metadata
//!
//! Entries are written once, in scan order, and looked up by frame number with
//! page/slot arithmetic. Pages are fixed-size and allocated on demand so memory
//! grows in bounded steps however long the stream is.

use crate::error::{CutError, Result};

/// Serialized size of one record (offset + three 16-bit fields).
const RECORD_SIZE: usize = 4 + 2 + 2 + 2;

/// Records per page, sized so a page stays within 8 KiB.
pub const PAGE_CAPACITY: usize = 0x2000 / RECORD_SIZE;

/// Metadata of one music frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameIndexEntry {
    /// Offset of the frame header relative to the start of the scan.
    pub file_offset: u32,
    pub frame_size: u16,
    /// `main_data_begin`: how many reservoir bytes the frame reads from earlier frames.
    pub bit_res_ptr: u16,
    /// Bytes after the side information, which later frames may borrow.
    pub main_data_size: u16,
}

impl FrameIndexEntry {
    pub fn new(
        file_offset: u64,
        frame_size: usize,
        bit_res_ptr: u16,
        main_data_size: usize,
    ) -> Result<Self> {
        Ok(Self {
            file_offset: u32::try_from(file_offset)
                .map_err(|_| CutError::IndexOverflow("file offset"))?,
            frame_size: u16::try_from(frame_size)
                .map_err(|_| CutError::IndexOverflow("frame size"))?,
            bit_res_ptr,
            main_data_size: u16::try_from(main_data_size)
                .map_err(|_| CutError::IndexOverflow("main data size"))?,
        })
    }

    /// Offset one past the last byte of the frame.
    pub fn end_offset(&self) -> u64 {
        u64::from(self.file_offset) + u64::from(self.frame_size)
    }
}

#[derive(Debug, Default)]
pub struct FrameIndex {
    pages: Vec<Vec<FrameIndexEntry>>,
    len: usize,
}

impl FrameIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the entry for the next frame and return its frame number.
    pub fn push(&mut self, entry: FrameIndexEntry) -> usize {
        let slot = self.len % PAGE_CAPACITY;
        if slot == 0 {
            self.pages.push(Vec::with_capacity(PAGE_CAPACITY));
        }
        if let Some(page) = self.pages.last_mut() {
            page.push(entry);
        }
        self.len += 1;
        self.len - 1
    }

    pub fn get(&self, frame: usize) -> Option<&FrameIndexEntry> {
        self.pages
            .get(frame / PAGE_CAPACITY)
            .and_then(|page| page.get(frame % PAGE_CAPACITY))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Entries `range.start..range.end` in frame order.
    pub fn range(
        &self,
        range: std::ops::Range<usize>,
    ) -> impl Iterator<Item = &FrameIndexEntry> + '_ {
        range.filter_map(move |frame| self.get(frame))
    }
}
