//! Byte-range reader/writer lock over a volume's address space
//!
//! Readers of overlapping ranges coexist; a writer excludes every
//! overlapping range. Writers hold their range while the store computes
//! checksums over the caller's buffer, so the buffer cannot change
//! underneath, and a DELETE cannot race a READ or WRITE of the same bytes.

use std::collections::BTreeMap;

use parking_lot::{Condvar, Mutex};

/// Lock mode of a region
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeMode {
    /// Shared access
    Reader,
    /// Exclusive access
    Writer,
}

#[derive(Debug, Clone, Copy)]
struct Region {
    offset: u64,
    length: u64,
    mode: RangeMode,
}

impl Region {
    fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }

    fn overlaps(&self, offset: u64, length: u64) -> bool {
        if self.length == 0 || length == 0 {
            return false;
        }
        self.offset < offset.saturating_add(length) && offset < self.end()
    }

    fn conflicts_with(&self, offset: u64, length: u64, mode: RangeMode) -> bool {
        if !self.overlaps(offset, length) {
            return false;
        }
        !(self.mode == RangeMode::Reader && mode == RangeMode::Reader)
    }
}

#[derive(Debug, Default)]
struct Held {
    regions: BTreeMap<u64, Region>,
    next_id: u64,
}

impl Held {
    fn conflicts(&self, offset: u64, length: u64, mode: RangeMode) -> bool {
        self.regions
            .values()
            .any(|r| r.conflicts_with(offset, length, mode))
    }

    fn insert(&mut self, offset: u64, length: u64, mode: RangeMode) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.regions.insert(
            id,
            Region {
                offset,
                length,
                mode,
            },
        );
        id
    }
}

/// Range lock for one volume
#[derive(Debug, Default)]
pub struct RangeLock {
    held: Mutex<Held>,
    released: Condvar,
}

impl RangeLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `[offset, offset + length)` can be held in `mode`
    pub fn acquire(&self, offset: u64, length: u64, mode: RangeMode) -> RangeGuard<'_> {
        let mut held = self.held.lock();
        while held.conflicts(offset, length, mode) {
            self.released.wait(&mut held);
        }
        let id = held.insert(offset, length, mode);
        RangeGuard {
            lock: self,
            id,
            offset,
            length,
            mode,
        }
    }

    /// Take the range if it is free right now
    pub fn try_acquire(&self, offset: u64, length: u64, mode: RangeMode) -> Option<RangeGuard<'_>> {
        let mut held = self.held.lock();
        if held.conflicts(offset, length, mode) {
            return None;
        }
        let id = held.insert(offset, length, mode);
        Some(RangeGuard {
            lock: self,
            id,
            offset,
            length,
            mode,
        })
    }

    /// Number of regions currently held
    pub fn held(&self) -> usize {
        self.held.lock().regions.len()
    }

    fn release(&self, id: u64) {
        let mut held = self.held.lock();
        held.regions.remove(&id);
        drop(held);
        self.released.notify_all();
    }
}

/// A held region. Dropping it releases the region.
#[must_use = "the range is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct RangeGuard<'a> {
    lock: &'a RangeLock,
    id: u64,
    offset: u64,
    length: u64,
    mode: RangeMode,
}

impl RangeGuard<'_> {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn mode(&self) -> RangeMode {
        self.mode
    }
}

impl Drop for RangeGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(self.id);
    }
}
