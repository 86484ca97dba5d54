//! Request dispatch
//!
//! Every request runs the same way, whether it arrives inline from a
//! blocking submitter or from the deferred worker:
//!
//! ```text
//! suspend read hold ─▶ (open log) ─▶ check bounds ─▶ range lock
//!        ─▶ pieces of max_transfer ─▶ release range ─▶ (log commit)
//!        ─▶ complete
//! ```
//!
//! The caller passes its suspend hold in; `execute` consumes it. Opening
//! the intent log on the first mutating request briefly trades the hold for
//! a write hold and downgrades again.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::SECTOR_SIZE;
use crate::backend::{Dataset, IntentLog, SyncPolicy, TxHold};
use crate::chunk::bytes_to_sectors;
use crate::error::{BlockError, BlockResult};
use crate::range_lock::RangeMode;
use crate::request::{Attribute, Completion, IoOp, Request, SeekWhence};
use crate::suspend::SuspendRead;
use crate::volume::Zvol;

impl Zvol {
    /// Run a request to completion in the calling thread
    pub(crate) fn submit_inline(&self, request: &Request) -> Completion {
        let read = self.suspend.read();
        let completion = self.execute(read, request);
        self.finish(completion)
    }

    /// Record and deliver a finished request
    pub(crate) fn finish(&self, completion: Completion) -> Completion {
        self.io_stats().record(
            completion.op,
            completion.bytes_transferred,
            completion.error.is_some(),
        );
        if let Some(err) = &completion.error {
            debug!(
                request = completion.request_id,
                op = %completion.op,
                "request failed: {}",
                err
            );
        }
        let provider = self.state.lock().provider;
        if let Some(provider) = provider {
            self.backends.devices.deliver(provider, &completion);
        }
        completion
    }

    /// Execute one request under the caller's suspend hold
    pub(crate) fn execute(&self, read: SuspendRead<'_>, request: &Request) -> Completion {
        if let Err(err) = request.validate() {
            return Completion::failed(request, err);
        }

        let (dataset, read_only) = {
            let state = self.state.lock();
            match state.dataset.clone() {
                Some(dataset) => (dataset, state.flags.read_only),
                None => {
                    return Completion::failed(request, BlockError::NotOpen(state.name.clone()));
                }
            }
        };

        match request.op {
            IoOp::Query(attr) => {
                let mut completion = Completion::new(request);
                completion.value = Some(self.attribute(dataset.as_ref(), attr));
                completion
            }
            IoOp::Flush => self.flush(read, request, read_only),
            IoOp::Read | IoOp::Write | IoOp::Delete => {
                self.strategy(read, request, &dataset, read_only)
            }
        }
    }

    fn flush(&self, read: SuspendRead<'_>, request: &Request, read_only: bool) -> Completion {
        let mut completion = Completion::new(request);
        if read_only {
            return completion;
        }
        match self.ensure_log(read) {
            Ok((_read, Some(log))) => {
                if let Err(err) = log.commit() {
                    completion.error = Some(err.into_caller_visible());
                }
            }
            Ok((_read, None)) => {}
            Err(err) => completion.error = Some(err.into_caller_visible()),
        }
        completion
    }

    fn strategy(
        &self,
        read: SuspendRead<'_>,
        request: &Request,
        dataset: &Arc<dyn Dataset>,
        read_only: bool,
    ) -> Completion {
        let mutating = request.op.is_mutating();
        if mutating && read_only {
            return Completion::failed(request, BlockError::ReadOnly(self.name()));
        }

        // Opening the log may trade the suspend hold, letting a resize in.
        // The size is only read once the hold is settled.
        let (_read, log) = if request.op.needs_log() {
            match self.ensure_log(read) {
                Ok(held) => held,
                Err(err) => return Completion::failed(request, err.into_caller_visible()),
            }
        } else {
            (read, None)
        };

        let size = self.size();
        if request.length > 0 && request.offset >= size {
            return Completion::failed(
                request,
                BlockError::OutOfRange {
                    offset: request.offset,
                    size,
                },
            );
        }

        let sync = mutating
            && match dataset.sync_policy() {
                SyncPolicy::Always => true,
                SyncPolicy::Standard => request.sync,
                SyncPolicy::Disabled => false,
            };

        let mode = if request.op == IoOp::Read {
            RangeMode::Reader
        } else {
            RangeMode::Writer
        };
        let range = self
            .range_lock
            .acquire(request.offset, request.length, mode);

        let mut completion = Completion::new(request);
        let result = match request.op {
            IoOp::Read => self.read_pieces(dataset.as_ref(), request, size, &mut completion),
            IoOp::Write => self.write_pieces(
                dataset.as_ref(),
                log.as_deref(),
                request,
                size,
                sync,
                &mut completion,
            ),
            _ => self.free(dataset.as_ref(), log.as_deref(), request, size, sync, &mut completion),
        };
        drop(range);

        if let Err(err) = result {
            completion.error = Some(err.into_caller_visible());
        }

        if sync
            && let Some(log) = &log
            && let Err(err) = log.commit()
            && completion.error.is_none()
        {
            completion.error = Some(err.into_caller_visible());
        }

        trace!(
            request = request.id,
            op = %request.op,
            offset = request.offset,
            length = request.length,
            transferred = completion.bytes_transferred,
            "request complete"
        );
        completion
    }

    fn read_pieces(
        &self,
        dataset: &dyn Dataset,
        request: &Request,
        size: u64,
        completion: &mut Completion,
    ) -> BlockResult<()> {
        let pieces = self.splitter.split(request.offset, request.length, size);
        let mut buf = BytesMut::with_capacity(pieces.iter().map(|p| p.length as usize).sum());

        let mut result = Ok(());
        for piece in pieces {
            match dataset.read(piece.offset, piece.length) {
                Ok(data) => {
                    buf.extend_from_slice(&data);
                    completion.bytes_transferred += piece.length;
                }
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        completion.data = Some(buf.freeze());
        result
    }

    fn write_pieces(
        &self,
        dataset: &dyn Dataset,
        log: Option<&dyn IntentLog>,
        request: &Request,
        size: u64,
        sync: bool,
        completion: &mut Completion,
    ) -> BlockResult<()> {
        let Some(data) = &request.data else {
            return Err(BlockError::InvalidRequest("write without payload".to_string()));
        };

        for piece in self.splitter.split(request.offset, request.length, size) {
            let chunk = data.slice(piece.buf_offset..piece.buf_offset + piece.length as usize);
            write_piece(dataset, log, piece.offset, &chunk, sync)?;
            completion.bytes_transferred += piece.length;
        }
        Ok(())
    }

    fn free(
        &self,
        dataset: &dyn Dataset,
        log: Option<&dyn IntentLog>,
        request: &Request,
        size: u64,
        sync: bool,
        completion: &mut Completion,
    ) -> BlockResult<()> {
        if !self.config.unmap_enabled {
            completion.bytes_transferred = request.length;
            return Ok(());
        }

        let tx = dataset.begin_tx(TxHold::LogOnly)?;
        if let Some(log) = log
            && let Err(err) = log.log_truncate(tx.txg(), request.offset, request.length, sync)
        {
            tx.abort();
            return Err(err);
        }
        tx.commit()?;

        let length = request.length.min(size.saturating_sub(request.offset));
        dataset.free_range(request.offset, length)?;
        completion.bytes_transferred = request.length;
        Ok(())
    }

    /// Answer an attribute query. Space figures are in 512-byte sectors.
    fn attribute(&self, dataset: &dyn Dataset, attr: Attribute) -> u64 {
        match attr {
            Attribute::CanDelete => u64::from(self.config.unmap_enabled),
            Attribute::BlocksAvail => bytes_to_sectors(dataset.space_usage().available),
            Attribute::BlocksUsed => bytes_to_sectors(dataset.space_usage().referenced),
            Attribute::PoolBlocksAvail => {
                let space = self.backends.pool.class_space();
                bytes_to_sectors(space.capacity.saturating_sub(space.allocated))
            }
            Attribute::PoolBlocksUsed => {
                bytes_to_sectors(self.backends.pool.class_space().allocated)
            }
            Attribute::MediaSize => self.size(),
            Attribute::SectorSize => SECTOR_SIZE,
            Attribute::StripeSize => u64::from(self.block_size()),
            Attribute::StripeOffset => 0,
        }
    }

    // ── Byte-stream path ─────────────────────────────────────────────────────

    /// Read through the byte-stream interface. An offset equal to the
    /// volume size reads nothing.
    pub(crate) fn read_at(&self, offset: u64, length: u64) -> BlockResult<Bytes> {
        let _read = self.suspend.read();
        let dataset = self.open_dataset()?;
        let size = self.size();
        check_stream_offset(offset, length, size)?;

        let _range = self.range_lock.acquire(offset, length, RangeMode::Reader);
        let pieces = self.splitter.split(offset, length, size);
        let mut buf = BytesMut::with_capacity(pieces.iter().map(|p| p.length as usize).sum());
        let result: BlockResult<()> = pieces.iter().try_for_each(|piece| {
            let data = dataset.read(piece.offset, piece.length)?;
            buf.extend_from_slice(&data);
            Ok(())
        });

        self.io_stats()
            .record(IoOp::Read, buf.len() as u64, result.is_err());
        result.map_err(BlockError::into_caller_visible)?;
        Ok(buf.freeze())
    }

    /// Write through the byte-stream interface. Returns the bytes written,
    /// which is short when the range runs past the end of the volume.
    pub(crate) fn write_at(&self, offset: u64, data: &Bytes, sync: bool) -> BlockResult<u64> {
        let read = self.suspend.read();
        let length = data.len() as u64;
        if offset.checked_add(length).is_none() {
            return Err(BlockError::InvalidRequest(format!(
                "range {offset}+{length} overflows"
            )));
        }
        if self.flags().read_only {
            return Err(BlockError::ReadOnly(self.name()));
        }
        let (_read, log) = self.ensure_log(read)?;

        let dataset = self.open_dataset()?;
        let size = self.size();
        check_stream_offset(offset, length, size)?;

        let sync = match dataset.sync_policy() {
            SyncPolicy::Always => true,
            SyncPolicy::Standard => sync,
            SyncPolicy::Disabled => false,
        };

        let range = self.range_lock.acquire(offset, length, RangeMode::Writer);
        let mut written = 0;
        let mut result = Ok(());
        for piece in self.splitter.split(offset, length, size) {
            let chunk = data.slice(piece.buf_offset..piece.buf_offset + piece.length as usize);
            if let Err(err) = write_piece(dataset.as_ref(), log.as_deref(), piece.offset, &chunk, sync)
            {
                result = Err(err);
                break;
            }
            written += piece.length;
        }
        drop(range);

        if sync && let Some(log) = &log {
            let committed = log.commit();
            if result.is_ok() {
                result = committed;
            }
        }
        self.io_stats().record(IoOp::Write, written, result.is_err());
        result.map_err(BlockError::into_caller_visible)?;
        Ok(written)
    }

    /// Find the next data or hole offset at or after `offset`
    pub(crate) fn seek(&self, offset: u64, whence: SeekWhence) -> BlockResult<u64> {
        let _read = self.suspend.read();
        let dataset = self.open_dataset()?;
        let size = self.size();
        if offset >= size {
            return Err(BlockError::OutOfRange { offset, size });
        }
        let found = dataset.next_offset(offset, whence == SeekWhence::Hole)?;
        Ok(found.min(size))
    }

    fn open_dataset(&self) -> BlockResult<Arc<dyn Dataset>> {
        let state = self.state.lock();
        state
            .dataset
            .clone()
            .ok_or_else(|| BlockError::NotOpen(state.name.clone()))
    }
}

/// One transaction: assign, stage, log, commit
fn write_piece(
    dataset: &dyn Dataset,
    log: Option<&dyn IntentLog>,
    offset: u64,
    data: &Bytes,
    sync: bool,
) -> BlockResult<()> {
    let mut tx = dataset.begin_tx(TxHold::Write {
        offset,
        length: data.len() as u64,
    })?;
    if let Err(err) = tx.write(offset, data) {
        tx.abort();
        return Err(err);
    }
    if let Some(log) = log
        && let Err(err) = log.log_write(tx.txg(), offset, data, sync)
    {
        warn!(offset, "failed to log write: {}", err);
        tx.abort();
        return Err(err);
    }
    tx.commit()
}

fn check_stream_offset(offset: u64, length: u64, size: u64) -> BlockResult<()> {
    if offset.checked_add(length).is_none() {
        return Err(BlockError::InvalidRequest(format!(
            "range {offset}+{length} overflows"
        )));
    }
    if offset > size {
        return Err(BlockError::OutOfRange { offset, size });
    }
    Ok(())
}
