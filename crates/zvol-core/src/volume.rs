//! Volume descriptor
//!
//! One [`Zvol`] exists per registered volume. It owns the range lock, the
//! suspend lock, the deferred queue and, while the volume is open, the
//! backing dataset and its intent log.
//!
//! Locks, in acquisition order:
//!
//! 1. `suspend` (reader/writer, see [`crate::suspend`])
//! 2. `state` (mutex over [`VolumeState`])
//! 3. `log` (leaf mutex around the intent log slot; nothing is acquired
//!    while it is held)
//! 4. `worker` (leaf mutex around the worker's join handle)
//!
//! The range lock is taken with the suspend lock held for reading and no
//! other lock held.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::backend::{Backends, Dataset, IntentLog, OwnMode, ProviderId, VolumeMode};
use crate::chunk::TransferSplitter;
use crate::config::ZvolConfig;
use crate::error::{BlockError, BlockResult};
use crate::range_lock::RangeLock;
use crate::request::{Completion, Request};
use crate::stats::{IoStats, IoStatsSnapshot};
use crate::suspend::{SuspendLock, SuspendRead, SuspendWrite};

/// How often a destroyer re-checks a worker that has not retired yet
const RETIRE_POLL: Duration = Duration::from_millis(100);

/// Descriptor lifecycle. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Lifecycle {
    /// Accepting opens and I/O
    Active,
    /// Destroy requested; the worker drains its queue
    Draining,
    /// Worker gone, resources may be released
    Retired,
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Draining => write!(f, "draining"),
            Self::Retired => write!(f, "retired"),
        }
    }
}

/// Volume flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VolumeFlags {
    /// Writes are refused
    pub read_only: bool,
    /// Held by a single exclusive opener
    pub exclusive: bool,
    /// Written since the current first open
    pub written_to: bool,
}

/// Access requested by an opener
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenMode {
    pub write: bool,
    pub exclusive: bool,
    pub sync: bool,
}

impl OpenMode {
    /// Read-only access
    pub fn read() -> Self {
        Self::default()
    }

    /// Read-write access
    pub fn read_write() -> Self {
        Self {
            write: true,
            ..Self::default()
        }
    }

    /// Refuse other openers while this one is open
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Every write through this opener is synchronous
    pub fn sync(mut self) -> Self {
        self.sync = true;
        self
    }
}

/// A request waiting for the deferred worker
pub(crate) struct QueuedRequest {
    pub request: Request,
    pub done: oneshot::Sender<Completion>,
}

/// Mutable descriptor state, guarded by `Zvol::state`
pub(crate) struct VolumeState {
    pub name: String,
    pub flags: VolumeFlags,
    open_count: u32,
    sync_count: u32,
    lifecycle: Lifecycle,
    pub dataset: Option<Arc<dyn Dataset>>,
    pub provider: Option<ProviderId>,
    /// Last size handed to the device framework
    pub announced_size: Option<u64>,
    pub queue: VecDeque<QueuedRequest>,
}

impl VolumeState {
    pub fn open_count(&self) -> u32 {
        self.open_count
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    /// Refuse opens of volumes that are going away or not exposed
    fn ensure_openable(&self, mode: VolumeMode) -> BlockResult<()> {
        if self.lifecycle != Lifecycle::Active || !mode.is_exposed() {
            return Err(BlockError::VolumeNotFound(self.name.clone()));
        }
        Ok(())
    }

    /// Access checks made after the backing dataset has been inspected
    fn check_open_mode(&self, mode: OpenMode) -> BlockResult<()> {
        if mode.write && self.flags.read_only {
            return Err(BlockError::ReadOnly(self.name.clone()));
        }
        if self.flags.exclusive {
            return Err(BlockError::Busy(format!("{} is open exclusively", self.name)));
        }
        if mode.exclusive && self.open_count != 0 {
            return Err(BlockError::Busy(format!(
                "{} has {} open references",
                self.name, self.open_count
            )));
        }
        Ok(())
    }

    fn bump(&mut self, mode: OpenMode) -> bool {
        if mode.exclusive {
            self.flags.exclusive = true;
        }
        self.open_count += 1;
        if mode.sync {
            self.sync_count += 1;
            return self.sync_count == 1;
        }
        false
    }

    fn unbump(&mut self, mode: OpenMode) {
        if self.flags.exclusive {
            debug_assert_eq!(self.open_count, 1);
            self.flags.exclusive = false;
        }
        self.open_count -= 1;
        if mode.sync {
            self.sync_count = self.sync_count.saturating_sub(1);
        }
    }

    /// Add a reference to an already-open volume.
    ///
    /// Returns `None` when the count is zero: taking the first reference
    /// needs the suspend lock, see [`Self::add_first_ref`]. Otherwise
    /// returns whether this was the first sync opener.
    fn add_ref(&mut self, mode: OpenMode) -> Option<bool> {
        if self.open_count == 0 {
            return None;
        }
        Some(self.bump(mode))
    }

    /// Take the first reference. Requires the suspend read hold.
    fn add_first_ref(&mut self, mode: OpenMode, _proof: &SuspendRead<'_>) -> bool {
        debug_assert_eq!(self.open_count, 0);
        self.bump(mode)
    }

    /// Drop a reference that is not the last one. Returns `false` when it
    /// would be the last: see [`Self::drop_last_ref`].
    fn drop_ref(&mut self, mode: OpenMode) -> bool {
        if self.open_count <= 1 {
            return false;
        }
        self.unbump(mode);
        true
    }

    /// Drop the last reference. Requires the suspend read hold.
    fn drop_last_ref(&mut self, mode: OpenMode, _proof: &SuspendRead<'_>) {
        debug_assert_eq!(self.open_count, 1);
        self.unbump(mode);
    }

    /// ACTIVE -> DRAINING
    pub fn begin_drain(&mut self) -> BlockResult<()> {
        if self.lifecycle != Lifecycle::Active {
            return Err(BlockError::VolumeNotFound(self.name.clone()));
        }
        self.lifecycle = Lifecycle::Draining;
        Ok(())
    }

    /// DRAINING -> RETIRED. Waiters on `Zvol::retired` must be notified
    /// once the state lock is released.
    pub fn retire(&mut self) {
        debug_assert_eq!(self.lifecycle, Lifecycle::Draining);
        self.lifecycle = Lifecycle::Retired;
    }
}

/// Snapshot of a descriptor, for listings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    pub size: u64,
    pub block_size: u32,
    pub mode: VolumeMode,
    pub open_count: u32,
    pub flags: VolumeFlags,
    pub lifecycle: Lifecycle,
    pub provider: Option<ProviderId>,
}

/// Per-volume descriptor
pub struct Zvol {
    pub(crate) state: Mutex<VolumeState>,
    /// Signalled when the deferred queue becomes non-empty or draining starts
    pub(crate) queue_ready: Condvar,
    /// Signalled when the worker moves the volume to RETIRED
    pub(crate) retired: Condvar,
    pub(crate) suspend: SuspendLock,
    pub(crate) range_lock: RangeLock,
    log: Mutex<Option<Arc<dyn IntentLog>>>,
    size: AtomicU64,
    block_size: u32,
    mode: VolumeMode,
    pub(crate) backends: Backends,
    pub(crate) config: Arc<ZvolConfig>,
    pub(crate) splitter: TransferSplitter,
    stats: IoStats,
    pub(crate) worker: Mutex<Option<JoinHandle<()>>>,
}

impl Zvol {
    pub(crate) fn new(
        name: &str,
        size: u64,
        block_size: u32,
        mode: VolumeMode,
        read_only: bool,
        backends: Backends,
        config: Arc<ZvolConfig>,
    ) -> Self {
        Self {
            state: Mutex::new(VolumeState {
                name: name.to_string(),
                flags: VolumeFlags {
                    read_only,
                    ..VolumeFlags::default()
                },
                open_count: 0,
                sync_count: 0,
                lifecycle: Lifecycle::Active,
                dataset: None,
                provider: None,
                announced_size: None,
                queue: VecDeque::new(),
            }),
            queue_ready: Condvar::new(),
            retired: Condvar::new(),
            suspend: SuspendLock::new(),
            range_lock: RangeLock::new(),
            log: Mutex::new(None),
            size: AtomicU64::new(size),
            block_size,
            mode,
            splitter: TransferSplitter::new(config.max_transfer),
            backends,
            config,
            stats: IoStats::new(),
            worker: Mutex::new(None),
        }
    }

    /// Current name
    pub fn name(&self) -> String {
        self.state.lock().name.clone()
    }

    /// Logical size in bytes
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub(crate) fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Release);
    }

    /// Volume block size
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Exposure mode
    pub fn mode(&self) -> VolumeMode {
        self.mode
    }

    pub fn stats(&self) -> IoStatsSnapshot {
        self.stats.snapshot()
    }

    pub(crate) fn io_stats(&self) -> &IoStats {
        &self.stats
    }

    pub fn info(&self) -> VolumeInfo {
        let state = self.state.lock();
        VolumeInfo {
            name: state.name.clone(),
            size: self.size(),
            block_size: self.block_size,
            mode: self.mode,
            open_count: state.open_count,
            flags: state.flags,
            lifecycle: state.lifecycle,
            provider: state.provider,
        }
    }

    /// Hand the current size to the device framework. The first assignment
    /// after creation is silent; later changes raise a resize event.
    pub(crate) fn update_capacity(&self, state: &mut VolumeState, size: u64) {
        let Some(provider) = state.provider else {
            return;
        };
        match state.announced_size {
            None => self.backends.devices.set_media_size(provider, size),
            Some(prev) if prev != size => self.backends.devices.resize(provider, size),
            Some(_) => return,
        }
        state.announced_size = Some(size);
    }

    // ── Open / close ─────────────────────────────────────────────────────────

    /// Take an open reference
    pub(crate) fn open_ref(&self, mode: OpenMode) -> BlockResult<()> {
        // Fast path: the volume is already set up, no suspend hold needed.
        {
            let mut state = self.state.lock();
            state.ensure_openable(self.mode)?;
            if state.open_count > 0 {
                state.check_open_mode(mode)?;
                if let Some(first_sync) = state.add_ref(mode) {
                    drop(state);
                    if first_sync {
                        self.promote_log();
                    }
                    return Ok(());
                }
            }
        }

        // Possibly the first reference: hold off reconfiguration while the
        // backing dataset is set up.
        let suspend = self.suspend.read();
        let mut state = self.state.lock();
        state.ensure_openable(self.mode)?;

        let first = state.open_count == 0;
        if first {
            self.first_open(&mut state, &suspend)?;
        }
        if let Err(err) = state.check_open_mode(mode) {
            if first {
                self.last_close(&mut state, &suspend);
            }
            return Err(err);
        }

        let first_sync = if first {
            state.add_first_ref(mode, &suspend)
        } else {
            // Another opener won the race; the volume is already set up.
            state.add_ref(mode).unwrap_or(false)
        };
        debug!(volume = %state.name, open_count = state.open_count, "opened");
        drop(state);
        drop(suspend);

        if first_sync {
            self.promote_log();
        }
        Ok(())
    }

    /// Drop an open reference
    pub(crate) fn close_ref(&self, mode: OpenMode) {
        {
            let mut state = self.state.lock();
            if state.drop_ref(mode) {
                return;
            }
        }

        let suspend = self.suspend.read();
        let mut state = self.state.lock();
        if state.drop_ref(mode) {
            return;
        }
        if state.open_count == 0 {
            error!(volume = %state.name, "close without matching open");
            return;
        }
        state.drop_last_ref(mode, &suspend);
        self.last_close(&mut state, &suspend);
        debug!(volume = %state.name, "last reference closed");
    }

    /// Set up the backing dataset for the first opener.
    ///
    /// Two-phase open: the dataset is owned provisionally read-only for
    /// inspection; the final access mode is decided by the caller once the
    /// read-only property has been looked up.
    fn first_open(&self, state: &mut VolumeState, _proof: &SuspendRead<'_>) -> BlockResult<()> {
        let dataset = self.backends.pool.own(&state.name, OwnMode::Inspect)?;
        if let Err(err) = self.setup(state, dataset.as_ref()) {
            dataset.release();
            return Err(err);
        }
        state.dataset = Some(dataset);
        Ok(())
    }

    fn setup(&self, state: &mut VolumeState, dataset: &dyn Dataset) -> BlockResult<()> {
        let readonly_prop = self
            .backends
            .properties
            .get_bool(&state.name, "readonly")?
            .unwrap_or(false);
        let size = dataset.volume_size()?;

        state.flags.written_to = false;
        state.flags.read_only =
            readonly_prop || dataset.is_snapshot() || !self.backends.pool.is_writable();

        self.set_size(size);
        self.update_capacity(state, size);
        Ok(())
    }

    /// Tear down what the first open set up
    fn last_close(&self, state: &mut VolumeState, _proof: &SuspendRead<'_>) {
        let log = self.log.lock().take();
        if let Some(log) = log
            && let Err(e) = log.close()
        {
            warn!(volume = %state.name, "failed to close intent log: {}", e);
        }

        if let Some(dataset) = state.dataset.take() {
            if state.flags.written_to && self.backends.pool.is_writable() {
                dataset.wait_synced();
            }
            dataset.release();
        }
        state.flags.written_to = false;
    }

    // ── Intent log ───────────────────────────────────────────────────────────

    /// Current log handle, if one is open
    pub(crate) fn log(&self) -> Option<Arc<dyn IntentLog>> {
        self.log.lock().clone()
    }

    fn promote_log(&self) {
        if let Some(log) = self.log() {
            log.async_to_sync();
        }
    }

    /// Make sure the log is open before a mutating request.
    ///
    /// The log slot is installed under the suspend write hold so no I/O sees
    /// it change; the hold is downgraded back to a read hold afterwards.
    pub(crate) fn ensure_log<'a>(
        &'a self,
        read: SuspendRead<'a>,
    ) -> BlockResult<(SuspendRead<'a>, Option<Arc<dyn IntentLog>>)> {
        if let Some(log) = self.log() {
            return Ok((read, Some(log)));
        }

        drop(read);
        let write: SuspendWrite<'a> = self.suspend.write();
        if self.log.lock().is_none() {
            let (dataset, promote) = {
                let mut state = self.state.lock();
                let dataset = state
                    .dataset
                    .clone()
                    .ok_or_else(|| BlockError::NotOpen(state.name.clone()))?;
                state.flags.written_to = true;
                (dataset, state.sync_count > 0)
            };
            if let Some(log) = dataset.open_log()? {
                if promote {
                    log.async_to_sync();
                }
                *self.log.lock() = Some(log);
            }
        }
        let read = write.downgrade();
        Ok((read, self.log()))
    }

    // ── Destroy handshake ────────────────────────────────────────────────────

    /// Wait until the descriptor is RETIRED. Without a worker the caller
    /// retires it directly. Plain thread blocking, so safe to call from
    /// inside an async runtime.
    pub(crate) fn wait_retired(&self) {
        let mut state = self.state.lock();
        while state.lifecycle == Lifecycle::Draining {
            let finished = self.worker.lock().as_ref().map(JoinHandle::is_finished);
            match finished {
                None => state.retire(),
                Some(true) => {
                    warn!(volume = %state.name, "worker exited without retiring the volume");
                    state.retire();
                }
                Some(false) => {
                    self.retired.wait_for(&mut state, RETIRE_POLL);
                }
            }
        }
    }

    /// Join the worker thread once it has exited
    pub(crate) fn join_worker(&self) {
        let handle = self.worker.lock().take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            error!(volume = %self.name(), "deferred worker panicked");
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    pub fn open_count(&self) -> u32 {
        self.state.lock().open_count
    }

    pub fn flags(&self) -> VolumeFlags {
        self.state.lock().flags
    }
}

impl fmt::Debug for Zvol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Zvol")
            .field("info", &self.info())
            .finish_non_exhaustive()
    }
}
