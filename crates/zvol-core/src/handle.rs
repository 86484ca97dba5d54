//! Open volume handles
//!
//! All I/O goes through a [`VolumeHandle`]. Holding one keeps an open
//! reference on the volume; dropping it closes the reference.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{BlockError, BlockResult};
use crate::request::{Attribute, Completion, PendingCompletion, Request, SeekWhence};
use crate::stats::IoStatsSnapshot;
use crate::volume::{OpenMode, Zvol};

/// An open reference on a volume
pub struct VolumeHandle {
    zvol: Arc<Zvol>,
    mode: OpenMode,
}

impl VolumeHandle {
    pub(crate) fn new(zvol: Arc<Zvol>, mode: OpenMode) -> Self {
        Self { zvol, mode }
    }

    /// Access this handle was opened with
    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn name(&self) -> String {
        self.zvol.name()
    }

    /// Volume size in bytes
    pub fn size(&self) -> u64 {
        self.zvol.size()
    }

    pub fn block_size(&self) -> u32 {
        self.zvol.block_size()
    }

    pub fn stats(&self) -> IoStatsSnapshot {
        self.zvol.stats()
    }

    fn check_access(&self, request: &Request) -> BlockResult<()> {
        if request.op.is_mutating() && !self.mode.write {
            return Err(BlockError::ReadOnly(format!(
                "{} opened without write access",
                self.zvol.name()
            )));
        }
        Ok(())
    }

    /// Execute a request in the calling thread, blocking as needed
    pub fn submit(&self, request: Request) -> Completion {
        let request = self.apply_open_sync(request);
        if let Err(err) = self.check_access(&request) {
            return self.zvol.finish(Completion::failed(&request, err));
        }
        self.zvol.submit_inline(&request)
    }

    /// Hand a request to the volume's deferred worker without blocking on
    /// I/O. The completion arrives through the returned handle.
    pub fn submit_deferred(&self, request: Request) -> BlockResult<PendingCompletion> {
        let request = self.apply_open_sync(request);
        self.check_access(&request)?;
        self.zvol.enqueue(request)
    }

    fn apply_open_sync(&self, request: Request) -> Request {
        if self.mode.sync && request.op.is_mutating() {
            request.with_sync()
        } else {
            request
        }
    }

    /// Read `length` bytes at `offset`. Short at the end of the volume.
    pub fn read(&self, offset: u64, length: u64) -> BlockResult<Bytes> {
        let completion = self.submit(Request::read(offset, length)).into_result()?;
        Ok(completion.data.unwrap_or_default())
    }

    /// Write `data` at `offset`, returning the bytes written
    pub fn write(&self, offset: u64, data: impl Into<Bytes>) -> BlockResult<u64> {
        let completion = self.submit(Request::write(offset, data)).into_result()?;
        Ok(completion.bytes_transferred)
    }

    /// Write and commit the log before returning
    pub fn write_sync(&self, offset: u64, data: impl Into<Bytes>) -> BlockResult<u64> {
        let completion = self
            .submit(Request::write(offset, data).with_sync())
            .into_result()?;
        Ok(completion.bytes_transferred)
    }

    /// Free `length` bytes at `offset`
    pub fn delete(&self, offset: u64, length: u64) -> BlockResult<u64> {
        let completion = self.submit(Request::delete(offset, length)).into_result()?;
        Ok(completion.bytes_transferred)
    }

    /// Commit the intent log
    pub fn flush(&self) -> BlockResult<()> {
        self.submit(Request::flush()).into_result().map(|_| ())
    }

    /// Answer an attribute query
    pub fn query(&self, attr: Attribute) -> BlockResult<u64> {
        let completion = self.submit(Request::query(attr)).into_result()?;
        completion
            .value
            .ok_or_else(|| BlockError::Internal(format!("no value for {}", attr.name())))
    }

    /// Answer an attribute query by provider-facing name
    pub fn query_named(&self, name: &str) -> BlockResult<u64> {
        let attr = Attribute::from_name(name)
            .ok_or_else(|| BlockError::Unsupported(format!("attribute {name}")))?;
        self.query(attr)
    }

    /// Byte-stream read. Reading at the volume size returns no data.
    pub fn read_at(&self, offset: u64, length: u64) -> BlockResult<Bytes> {
        self.zvol.read_at(offset, length)
    }

    /// Byte-stream write
    pub fn write_at(&self, offset: u64, data: impl Into<Bytes>, sync: bool) -> BlockResult<u64> {
        if !self.mode.write {
            return Err(BlockError::ReadOnly(format!(
                "{} opened without write access",
                self.zvol.name()
            )));
        }
        self.zvol
            .write_at(offset, &data.into(), sync || self.mode.sync)
    }

    /// Next data or hole offset at or after `offset`
    pub fn seek(&self, offset: u64, whence: SeekWhence) -> BlockResult<u64> {
        self.zvol.seek(offset, whence)
    }

    /// Close the handle. Same as dropping it.
    pub fn close(self) {}
}

impl Drop for VolumeHandle {
    fn drop(&mut self) {
        self.zvol.close_ref(self.mode);
    }
}

impl fmt::Debug for VolumeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VolumeHandle")
            .field("volume", &self.zvol.name())
            .field("mode", &self.mode)
            .finish()
    }
}
