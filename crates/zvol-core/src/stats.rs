//! Per-volume I/O statistics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::request::IoOp;

/// Lock-free I/O counters for one volume
#[derive(Debug, Default)]
pub struct IoStats {
    read_ops: AtomicU64,
    write_ops: AtomicU64,
    delete_ops: AtomicU64,
    flush_ops: AtomicU64,
    read_bytes: AtomicU64,
    write_bytes: AtomicU64,
    freed_bytes: AtomicU64,
    /// Requests routed through the deferred worker
    deferred_ops: AtomicU64,
    /// Requests completed with an error
    failed_ops: AtomicU64,
}

/// Point-in-time copy of [`IoStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IoStatsSnapshot {
    pub read_ops: u64,
    pub write_ops: u64,
    pub delete_ops: u64,
    pub flush_ops: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub freed_bytes: u64,
    pub deferred_ops: u64,
    pub failed_ops: u64,
}

impl IoStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a finished request
    pub fn record(&self, op: IoOp, bytes: u64, failed: bool) {
        match op {
            IoOp::Read => {
                self.read_ops.fetch_add(1, Ordering::Relaxed);
                self.read_bytes.fetch_add(bytes, Ordering::Relaxed);
            }
            IoOp::Write => {
                self.write_ops.fetch_add(1, Ordering::Relaxed);
                self.write_bytes.fetch_add(bytes, Ordering::Relaxed);
            }
            IoOp::Delete => {
                self.delete_ops.fetch_add(1, Ordering::Relaxed);
                self.freed_bytes.fetch_add(bytes, Ordering::Relaxed);
            }
            IoOp::Flush => {
                self.flush_ops.fetch_add(1, Ordering::Relaxed);
            }
            IoOp::Query(_) => {}
        }
        if failed {
            self.failed_ops.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a request handed to the deferred worker
    pub fn record_deferred(&self) {
        self.deferred_ops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IoStatsSnapshot {
        IoStatsSnapshot {
            read_ops: self.read_ops.load(Ordering::Relaxed),
            write_ops: self.write_ops.load(Ordering::Relaxed),
            delete_ops: self.delete_ops.load(Ordering::Relaxed),
            flush_ops: self.flush_ops.load(Ordering::Relaxed),
            read_bytes: self.read_bytes.load(Ordering::Relaxed),
            write_bytes: self.write_bytes.load(Ordering::Relaxed),
            freed_bytes: self.freed_bytes.load(Ordering::Relaxed),
            deferred_ops: self.deferred_ops.load(Ordering::Relaxed),
            failed_ops: self.failed_ops.load(Ordering::Relaxed),
        }
    }
}
