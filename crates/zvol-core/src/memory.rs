//! In-memory collaborators
//!
//! A sparse block store, an in-memory intent log, a property map and a
//! recording device framework. They back the simulator and the tests, and
//! expose a few hooks for fault injection (corrupt a block, fail the next
//! transaction assigns).

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::backend::{
    Dataset, DeviceFramework, IntentLog, LogRecord, ObjectPool, OwnMode, PoolSpace, PropertyStore,
    ProviderId, SpaceUsage, SyncPolicy, Transaction, TxHold, VolumeMode,
};
use crate::error::{BlockError, BlockResult};
use crate::journal::FileJournal;
use crate::request::Completion;

// ============================================================================
// Block store
// ============================================================================

/// Pool-wide allocation accounting
#[derive(Debug)]
struct Accounting {
    capacity: u64,
    allocated: AtomicU64,
}

#[derive(Debug, Clone)]
struct StoredBlock {
    data: Vec<u8>,
    checksum: u32,
}

impl StoredBlock {
    fn zeroed(block_size: u64) -> Self {
        let data = vec![0u8; block_size as usize];
        let checksum = crc32c::crc32c(&data);
        Self { data, checksum }
    }

    fn reseal(&mut self) {
        self.checksum = crc32c::crc32c(&self.data);
    }
}

/// Sparse block map with a CRC32C per block
#[derive(Debug)]
struct BlockStore {
    block_size: u64,
    blocks: RwLock<BTreeMap<u64, StoredBlock>>,
    accounting: Arc<Accounting>,
}

impl BlockStore {
    fn new(block_size: u64, accounting: Arc<Accounting>) -> Self {
        Self {
            block_size,
            blocks: RwLock::new(BTreeMap::new()),
            accounting,
        }
    }

    fn read(&self, offset: u64, length: u64) -> BlockResult<Bytes> {
        let mut out = BytesMut::zeroed(length as usize);
        if length == 0 {
            return Ok(out.freeze());
        }
        let bs = self.block_size;
        let end = offset + length;
        let blocks = self.blocks.read();

        for (&idx, block) in blocks.range(offset / bs..=(end - 1) / bs) {
            let block_start = idx * bs;
            if crc32c::crc32c(&block.data) != block.checksum {
                return Err(BlockError::Checksum {
                    offset: block_start,
                });
            }
            let from = offset.max(block_start);
            let to = end.min(block_start + bs);
            out[(from - offset) as usize..(to - offset) as usize]
                .copy_from_slice(&block.data[(from - block_start) as usize..(to - block_start) as usize]);
        }
        Ok(out.freeze())
    }

    fn write(&self, offset: u64, data: &[u8]) {
        let bs = self.block_size;
        let end = offset + data.len() as u64;
        let mut blocks = self.blocks.write();
        let mut pos = offset;

        while pos < end {
            let idx = pos / bs;
            let block_start = idx * bs;
            let to = end.min(block_start + bs);
            let block = blocks.entry(idx).or_insert_with(|| {
                self.accounting.allocated.fetch_add(bs, Ordering::Relaxed);
                StoredBlock::zeroed(bs)
            });
            block.data[(pos - block_start) as usize..(to - block_start) as usize]
                .copy_from_slice(&data[(pos - offset) as usize..(to - offset) as usize]);
            block.reseal();
            pos = to;
        }
    }

    fn free(&self, offset: u64, length: u64) {
        if length == 0 {
            return;
        }
        let bs = self.block_size;
        let end = offset.saturating_add(length);
        let mut blocks = self.blocks.write();

        let touched: Vec<u64> = blocks
            .range(offset / bs..=(end - 1) / bs)
            .map(|(&idx, _)| idx)
            .collect();
        for idx in touched {
            let block_start = idx * bs;
            let from = offset.max(block_start);
            let to = end.min(block_start + bs);
            if from == block_start && to == block_start + bs {
                blocks.remove(&idx);
                self.accounting.allocated.fetch_sub(bs, Ordering::Relaxed);
            } else if let Some(block) = blocks.get_mut(&idx) {
                block.data[(from - block_start) as usize..(to - block_start) as usize].fill(0);
                block.reseal();
            }
        }
    }

    fn next_offset(&self, offset: u64, hole: bool) -> Option<u64> {
        let bs = self.block_size;
        let blocks = self.blocks.read();
        let mut idx = offset / bs;
        if hole {
            while blocks.contains_key(&idx) {
                idx += 1;
            }
            Some(offset.max(idx * bs))
        } else {
            blocks
                .range(idx..)
                .next()
                .map(|(&found, _)| offset.max(found * bs))
        }
    }

    fn allocated(&self) -> u64 {
        self.blocks.read().len() as u64 * self.block_size
    }

    fn corrupt(&self, offset: u64) -> bool {
        let idx = offset / self.block_size;
        let mut blocks = self.blocks.write();
        match blocks.get_mut(&idx) {
            Some(block) => {
                let at = (offset % self.block_size) as usize;
                block.data[at] ^= 0xff;
                true
            }
            None => false,
        }
    }

    fn snapshot(&self, accounting: Arc<Accounting>) -> Self {
        let blocks = self.blocks.read().clone();
        accounting
            .allocated
            .fetch_add(blocks.len() as u64 * self.block_size, Ordering::Relaxed);
        Self {
            block_size: self.block_size,
            blocks: RwLock::new(blocks),
            accounting,
        }
    }
}

// ============================================================================
// Pool and datasets
// ============================================================================

/// Backing-store call counters of one dataset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCalls {
    pub reads: u64,
    pub tx_assigns: u64,
    pub frees: u64,
}

#[derive(Debug, Default)]
struct CallCounters {
    reads: AtomicU64,
    tx_assigns: AtomicU64,
    frees: AtomicU64,
}

enum DatasetLog {
    Memory(Arc<MemoryLog>),
    Journal(Arc<FileJournal>),
}

/// One volume dataset held by a [`MemoryPool`]
pub struct MemoryDataset {
    name: String,
    size: AtomicU64,
    snapshot: bool,
    sync_policy: Mutex<SyncPolicy>,
    store: Arc<BlockStore>,
    log: DatasetLog,
    next_txg: Arc<AtomicU64>,
    owners: AtomicU32,
    skip_assigns: AtomicU32,
    fail_assigns: AtomicU32,
    synced: AtomicU64,
    calls: CallCounters,
}

impl MemoryDataset {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current ownership count
    pub fn owners(&self) -> u32 {
        self.owners.load(Ordering::Acquire)
    }

    pub fn set_sync_policy(&self, policy: SyncPolicy) {
        *self.sync_policy.lock() = policy;
    }

    /// Make the next `count` transaction assigns fail
    pub fn fail_next_assigns(&self, count: u32) {
        self.fail_assigns(0, count);
    }

    /// Let `skip` assigns through, then fail the following `count`
    pub fn fail_assigns(&self, skip: u32, count: u32) {
        self.skip_assigns.store(skip, Ordering::Release);
        self.fail_assigns.store(count, Ordering::Release);
    }

    /// Flip a byte in the stored block covering `offset` without updating
    /// its checksum. Returns `false` if no block is stored there.
    pub fn corrupt(&self, offset: u64) -> bool {
        self.store.corrupt(offset)
    }

    pub fn store_calls(&self) -> StoreCalls {
        StoreCalls {
            reads: self.calls.reads.load(Ordering::Relaxed),
            tx_assigns: self.calls.tx_assigns.load(Ordering::Relaxed),
            frees: self.calls.frees.load(Ordering::Relaxed),
        }
    }

    /// How many times a closing owner waited for sync
    pub fn sync_waits(&self) -> u64 {
        self.synced.load(Ordering::Relaxed)
    }

    /// The in-memory log, when the dataset is not journal-backed
    pub fn memory_log(&self) -> Option<Arc<MemoryLog>> {
        match &self.log {
            DatasetLog::Memory(log) => Some(Arc::clone(log)),
            DatasetLog::Journal(_) => None,
        }
    }

    /// Bytes of stored blocks
    pub fn allocated(&self) -> u64 {
        self.store.allocated()
    }
}

impl Dataset for MemoryDataset {
    fn volume_size(&self) -> BlockResult<u64> {
        Ok(self.size.load(Ordering::Acquire))
    }

    fn set_volume_size(&self, size: u64) -> BlockResult<()> {
        if self.snapshot {
            return Err(BlockError::ReadOnly(self.name.clone()));
        }
        self.size.store(size, Ordering::Release);
        Ok(())
    }

    fn block_size(&self) -> BlockResult<u32> {
        u32::try_from(self.store.block_size)
            .map_err(|_| BlockError::Backend(format!("{}: block size out of range", self.name)))
    }

    fn is_snapshot(&self) -> bool {
        self.snapshot
    }

    fn sync_policy(&self) -> SyncPolicy {
        *self.sync_policy.lock()
    }

    fn read(&self, offset: u64, length: u64) -> BlockResult<Bytes> {
        self.calls.reads.fetch_add(1, Ordering::Relaxed);
        self.store.read(offset, length)
    }

    fn begin_tx(&self, hold: TxHold) -> BlockResult<Box<dyn Transaction>> {
        self.calls.tx_assigns.fetch_add(1, Ordering::Relaxed);
        if self.snapshot {
            return Err(BlockError::ReadOnly(self.name.clone()));
        }
        let skipped = self
            .skip_assigns
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        let injected = !skipped
            && self
                .fail_assigns
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok();
        if injected {
            return Err(BlockError::TxAssign(format!("{}: injected failure", self.name)));
        }
        if let TxHold::Write { length, .. } = hold {
            let accounting = &self.store.accounting;
            if accounting.allocated.load(Ordering::Relaxed) + length > accounting.capacity {
                return Err(BlockError::TxAssign(format!("{}: out of space", self.name)));
            }
        }

        Ok(Box::new(MemoryTransaction {
            store: Arc::clone(&self.store),
            txg: self.next_txg.fetch_add(1, Ordering::AcqRel),
            staged: Vec::new(),
        }))
    }

    fn free_range(&self, offset: u64, length: u64) -> BlockResult<()> {
        self.calls.frees.fetch_add(1, Ordering::Relaxed);
        if self.snapshot {
            return Err(BlockError::ReadOnly(self.name.clone()));
        }
        self.store.free(offset, length);
        Ok(())
    }

    fn space_usage(&self) -> SpaceUsage {
        let accounting = &self.store.accounting;
        SpaceUsage {
            referenced: self.store.allocated(),
            available: accounting
                .capacity
                .saturating_sub(accounting.allocated.load(Ordering::Relaxed)),
            used_objects: 2,
            available_objects: u64::from(u32::MAX),
        }
    }

    fn next_offset(&self, offset: u64, hole: bool) -> BlockResult<u64> {
        let size = self.size.load(Ordering::Acquire);
        match self.store.next_offset(offset, hole) {
            Some(found) => Ok(found),
            None => Err(BlockError::OutOfRange { offset, size }),
        }
    }

    fn open_log(&self) -> BlockResult<Option<Arc<dyn IntentLog>>> {
        Ok(Some(match &self.log {
            DatasetLog::Memory(log) => Arc::clone(log) as Arc<dyn IntentLog>,
            DatasetLog::Journal(journal) => Arc::clone(journal) as Arc<dyn IntentLog>,
        }))
    }

    fn wait_synced(&self) {
        self.synced.fetch_add(1, Ordering::Relaxed);
    }

    fn release(&self) {
        let released = self
            .owners
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if released.is_err() {
            warn!(dataset = %self.name, "release without ownership");
        }
    }
}

struct MemoryTransaction {
    store: Arc<BlockStore>,
    txg: u64,
    staged: Vec<(u64, Vec<u8>)>,
}

impl Transaction for MemoryTransaction {
    fn txg(&self) -> u64 {
        self.txg
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> BlockResult<()> {
        self.staged.push((offset, data.to_vec()));
        Ok(())
    }

    fn commit(self: Box<Self>) -> BlockResult<()> {
        for (offset, data) in &self.staged {
            self.store.write(*offset, data);
        }
        Ok(())
    }

    fn abort(self: Box<Self>) {
        debug!(txg = self.txg, staged = self.staged.len(), "transaction aborted");
    }
}

/// In-memory object pool
pub struct MemoryPool {
    datasets: RwLock<HashMap<String, Arc<MemoryDataset>>>,
    writable: AtomicBool,
    accounting: Arc<Accounting>,
    next_txg: Arc<AtomicU64>,
    journal_dir: Option<PathBuf>,
}

impl MemoryPool {
    /// Pool with `capacity` bytes and in-memory intent logs
    pub fn new(capacity: u64) -> Self {
        Self {
            datasets: RwLock::new(HashMap::new()),
            writable: AtomicBool::new(true),
            accounting: Arc::new(Accounting {
                capacity,
                allocated: AtomicU64::new(0),
            }),
            next_txg: Arc::new(AtomicU64::new(1)),
            journal_dir: None,
        }
    }

    /// Pool whose volumes log to journal files under `dir`
    pub fn with_journal_dir(capacity: u64, dir: impl Into<PathBuf>) -> Self {
        Self {
            journal_dir: Some(dir.into()),
            ..Self::new(capacity)
        }
    }

    /// Create a volume dataset
    pub fn create_volume(
        &self,
        name: &str,
        size: u64,
        block_size: u32,
    ) -> BlockResult<Arc<MemoryDataset>> {
        if block_size < 512 || !block_size.is_power_of_two() {
            return Err(BlockError::InvalidSize(format!(
                "block size {block_size} is not a power of two of at least 512"
            )));
        }
        if size == 0 || size % u64::from(block_size) != 0 {
            return Err(BlockError::InvalidSize(format!(
                "volume size {size} is not a non-zero multiple of {block_size}"
            )));
        }

        let log = match &self.journal_dir {
            Some(dir) => {
                let path = dir.join(format!("{}.journal", name.replace('/', "_")));
                DatasetLog::Journal(Arc::new(FileJournal::open(path)?))
            }
            None => DatasetLog::Memory(Arc::new(MemoryLog::new())),
        };
        let store = BlockStore::new(u64::from(block_size), Arc::clone(&self.accounting));
        self.insert(name, size, false, store, log)
    }

    /// Snapshot an existing volume. Snapshots are read-only.
    pub fn create_snapshot(&self, source: &str, name: &str) -> BlockResult<Arc<MemoryDataset>> {
        let origin = self
            .dataset(source)
            .ok_or_else(|| BlockError::VolumeNotFound(source.to_string()))?;
        let store = origin.store.snapshot(Arc::clone(&self.accounting));
        let size = origin.size.load(Ordering::Acquire);
        self.insert(name, size, true, store, DatasetLog::Memory(Arc::new(MemoryLog::new())))
    }

    fn insert(
        &self,
        name: &str,
        size: u64,
        snapshot: bool,
        store: BlockStore,
        log: DatasetLog,
    ) -> BlockResult<Arc<MemoryDataset>> {
        let mut datasets = self.datasets.write();
        if datasets.contains_key(name) {
            return Err(BlockError::VolumeExists(name.to_string()));
        }
        let dataset = Arc::new(MemoryDataset {
            name: name.to_string(),
            size: AtomicU64::new(size),
            snapshot,
            sync_policy: Mutex::new(SyncPolicy::Standard),
            store: Arc::new(store),
            log,
            next_txg: Arc::clone(&self.next_txg),
            owners: AtomicU32::new(0),
            skip_assigns: AtomicU32::new(0),
            fail_assigns: AtomicU32::new(0),
            synced: AtomicU64::new(0),
            calls: CallCounters::default(),
        });
        datasets.insert(name.to_string(), Arc::clone(&dataset));
        Ok(dataset)
    }

    /// Rename a dataset in the store
    pub fn rename_dataset(&self, old: &str, new: &str) -> BlockResult<()> {
        let mut datasets = self.datasets.write();
        if datasets.contains_key(new) {
            return Err(BlockError::VolumeExists(new.to_string()));
        }
        let dataset = datasets
            .remove(old)
            .ok_or_else(|| BlockError::VolumeNotFound(old.to_string()))?;
        datasets.insert(new.to_string(), dataset);
        Ok(())
    }

    pub fn dataset(&self, name: &str) -> Option<Arc<MemoryDataset>> {
        self.datasets.read().get(name).cloned()
    }

    /// Put the pool in or out of read-only mode
    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::Release);
    }
}

impl ObjectPool for MemoryPool {
    fn own(&self, name: &str, mode: OwnMode) -> BlockResult<Arc<dyn Dataset>> {
        let dataset = self
            .dataset(name)
            .ok_or_else(|| BlockError::VolumeNotFound(name.to_string()))?;
        if mode == OwnMode::Modify && (dataset.snapshot || !self.is_writable()) {
            return Err(BlockError::ReadOnly(name.to_string()));
        }
        dataset.owners.fetch_add(1, Ordering::AcqRel);
        Ok(dataset as Arc<dyn Dataset>)
    }

    fn is_writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    fn class_space(&self) -> PoolSpace {
        PoolSpace {
            capacity: self.accounting.capacity,
            allocated: self.accounting.allocated.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Intent log
// ============================================================================

/// In-memory intent log.
///
/// Records stay pending until the log is closed cleanly, which stands in
/// for the store having synced them. Records left behind (or pushed with
/// [`MemoryLog::push`]) are what a replay sees.
#[derive(Debug, Default)]
pub struct MemoryLog {
    records: Mutex<Vec<(u64, LogRecord)>>,
    sync_mode: AtomicBool,
    commits: AtomicU64,
    sync_records: AtomicU64,
}

impl MemoryLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed commits
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::Acquire)
    }

    /// Records logged with the sync flag (or after promotion)
    pub fn sync_record_count(&self) -> u64 {
        self.sync_records.load(Ordering::Relaxed)
    }

    /// Whether the log has been promoted to synchronous
    pub fn is_sync(&self) -> bool {
        self.sync_mode.load(Ordering::Acquire)
    }

    /// Pending records, oldest first
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().iter().map(|(_, r)| r.clone()).collect()
    }

    /// Append a record as if a previous owner had crashed before syncing it
    pub fn push(&self, record: LogRecord) {
        self.records.lock().push((0, record));
    }

    fn append(&self, txg: u64, record: LogRecord, sync: bool) {
        if sync || self.is_sync() {
            self.sync_records.fetch_add(1, Ordering::Relaxed);
        }
        self.records.lock().push((txg, record));
    }
}

impl IntentLog for MemoryLog {
    fn log_write(&self, txg: u64, offset: u64, data: &Bytes, sync: bool) -> BlockResult<()> {
        self.append(
            txg,
            LogRecord::Write {
                offset,
                data: data.clone(),
            },
            sync,
        );
        Ok(())
    }

    fn log_truncate(&self, txg: u64, offset: u64, length: u64, sync: bool) -> BlockResult<()> {
        self.append(txg, LogRecord::Truncate { offset, length }, sync);
        Ok(())
    }

    fn commit(&self) -> BlockResult<()> {
        self.commits.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn async_to_sync(&self) {
        self.sync_mode.store(true, Ordering::Release);
    }

    fn has_pending(&self) -> bool {
        !self.records.lock().is_empty()
    }

    fn replay(&self, apply: &mut dyn FnMut(LogRecord) -> BlockResult<()>) -> BlockResult<usize> {
        let records = std::mem::take(&mut *self.records.lock());
        let count = records.len();
        for (_, record) in records {
            apply(record)?;
        }
        Ok(count)
    }

    fn discard(&self) -> BlockResult<()> {
        self.records.lock().clear();
        Ok(())
    }

    fn close(&self) -> BlockResult<()> {
        self.records.lock().clear();
        self.sync_mode.store(false, Ordering::Release);
        Ok(())
    }
}

// ============================================================================
// Properties
// ============================================================================

/// In-memory property store
#[derive(Debug, Default)]
pub struct MemoryProperties {
    props: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl MemoryProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, dataset: &str, key: &str, value: impl Into<String>) {
        self.props
            .write()
            .entry(dataset.to_string())
            .or_default()
            .insert(key.to_string(), value.into());
    }

    pub fn unset(&self, dataset: &str, key: &str) {
        if let Some(props) = self.props.write().get_mut(dataset) {
            props.remove(key);
        }
    }
}

impl PropertyStore for MemoryProperties {
    fn get_bool(&self, dataset: &str, key: &str) -> BlockResult<Option<bool>> {
        match self.get_string(dataset, key)?.as_deref() {
            None => Ok(None),
            Some("on" | "true" | "1") => Ok(Some(true)),
            Some("off" | "false" | "0") => Ok(Some(false)),
            Some(other) => Err(BlockError::Backend(format!(
                "{dataset}: property {key}={other} is not a boolean"
            ))),
        }
    }

    fn get_string(&self, dataset: &str, key: &str) -> BlockResult<Option<String>> {
        Ok(self
            .props
            .read()
            .get(dataset)
            .and_then(|props| props.get(key))
            .cloned())
    }
}

// ============================================================================
// Device framework
// ============================================================================

/// Something the volume layer told the device framework
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    Announced {
        provider: ProviderId,
        name: String,
        mode: VolumeMode,
    },
    MediaSize {
        provider: ProviderId,
        size: u64,
    },
    Resized {
        provider: ProviderId,
        size: u64,
    },
    Retired {
        provider: ProviderId,
    },
}

/// Provider as seen by the device framework
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderInfo {
    pub name: String,
    pub mode: VolumeMode,
    pub sector_size: u32,
    pub stripe_size: u32,
    pub media_size: u64,
    pub retired: bool,
}

/// Device framework that records every call
#[derive(Debug, Default)]
pub struct MemoryDevices {
    next_id: AtomicU64,
    providers: Mutex<HashMap<ProviderId, ProviderInfo>>,
    events: Mutex<Vec<DeviceEvent>>,
    delivered: Mutex<Vec<(ProviderId, Completion)>>,
}

impl MemoryDevices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<DeviceEvent> {
        self.events.lock().clone()
    }

    pub fn provider(&self, provider: ProviderId) -> Option<ProviderInfo> {
        self.providers.lock().get(&provider).cloned()
    }

    /// The live provider registered under `name`
    pub fn active_provider(&self, name: &str) -> Option<(ProviderId, ProviderInfo)> {
        self.providers
            .lock()
            .iter()
            .find(|(_, info)| info.name == name && !info.retired)
            .map(|(id, info)| (*id, info.clone()))
    }

    /// How many times `provider` was retired
    pub fn retire_count(&self, provider: ProviderId) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, DeviceEvent::Retired { provider: p } if *p == provider))
            .count()
    }

    /// Resize events raised for `provider`
    pub fn resize_events(&self, provider: ProviderId) -> Vec<u64> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                DeviceEvent::Resized { provider: p, size } if *p == provider => Some(*size),
                _ => None,
            })
            .collect()
    }

    /// Completions delivered so far
    pub fn delivered(&self) -> Vec<(ProviderId, Completion)> {
        self.delivered.lock().clone()
    }

    fn record(&self, event: DeviceEvent) {
        self.events.lock().push(event);
    }
}

impl DeviceFramework for MemoryDevices {
    fn announce(
        &self,
        name: &str,
        mode: VolumeMode,
        sector_size: u32,
        stripe_size: u32,
    ) -> BlockResult<ProviderId> {
        let provider = ProviderId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.providers.lock().insert(
            provider,
            ProviderInfo {
                name: name.to_string(),
                mode,
                sector_size,
                stripe_size,
                media_size: 0,
                retired: false,
            },
        );
        self.record(DeviceEvent::Announced {
            provider,
            name: name.to_string(),
            mode,
        });
        Ok(provider)
    }

    fn set_media_size(&self, provider: ProviderId, size: u64) {
        if let Some(info) = self.providers.lock().get_mut(&provider) {
            info.media_size = size;
        }
        self.record(DeviceEvent::MediaSize { provider, size });
    }

    fn resize(&self, provider: ProviderId, size: u64) {
        if let Some(info) = self.providers.lock().get_mut(&provider) {
            info.media_size = size;
        }
        self.record(DeviceEvent::Resized { provider, size });
    }

    fn retire(&self, provider: ProviderId) {
        if let Some(info) = self.providers.lock().get_mut(&provider) {
            if info.retired {
                warn!(%provider, "provider retired twice");
            }
            info.retired = true;
        }
        self.record(DeviceEvent::Retired { provider });
    }

    fn deliver(&self, provider: ProviderId, completion: &Completion) {
        self.delivered.lock().push((provider, completion.clone()));
    }
}
