//! Transfer splitting for the dispatcher
//!
//! A single request may be larger than the backing store accepts in one
//! transaction. The dispatcher walks the request in pieces of at most
//! `max_transfer` bytes, never past the end of the volume.
//!
//! ```text
//! request [offset ............................. offset+length)
//!         ├── piece 0: max_transfer ──┤
//!                                     ├── piece 1: max_transfer ──┤
//!                                                                 ├ tail ┤
//! ```

use crate::SECTOR_SIZE;

/// One piece of a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRange {
    /// Byte offset into the volume
    pub offset: u64,
    /// Offset of this piece inside the request buffer
    pub buf_offset: usize,
    /// Number of bytes in this piece
    pub length: u64,
}

/// Splits byte ranges into store-sized pieces
#[derive(Debug, Clone)]
pub struct TransferSplitter {
    /// Largest piece in bytes
    max_transfer: u64,
}

impl TransferSplitter {
    /// Create a splitter with the given maximum piece size
    pub fn new(max_transfer: u64) -> Self {
        assert!(max_transfer > 0, "Transfer size must be positive");
        Self { max_transfer }
    }

    /// Split `[offset, offset + length)` into pieces, stopping at `limit`.
    ///
    /// Bytes at or beyond `limit` are not covered, so the sum of piece
    /// lengths may be shorter than `length`.
    pub fn split(&self, offset: u64, length: u64, limit: u64) -> Vec<TransferRange> {
        let end = offset.saturating_add(length).min(limit);
        if offset >= end {
            return Vec::new();
        }

        let count = (end - offset).div_ceil(self.max_transfer);
        let mut ranges = Vec::with_capacity(count as usize);
        let mut pos = offset;

        while pos < end {
            let piece = (end - pos).min(self.max_transfer);
            ranges.push(TransferRange {
                offset: pos,
                buf_offset: (pos - offset) as usize,
                length: piece,
            });
            pos += piece;
        }

        ranges
    }
}

/// Convert a byte count to whole sectors
pub fn bytes_to_sectors(bytes: u64) -> u64 {
    bytes / SECTOR_SIZE
}
