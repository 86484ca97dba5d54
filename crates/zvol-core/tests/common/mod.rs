//! Shared setup for the integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};

use bytes::Bytes;
use parking_lot::Mutex;
use zvol_core::memory::{MemoryDataset, MemoryDevices, MemoryLog, MemoryPool, MemoryProperties};
use zvol_core::{
    Backends, BlockResult, Dataset, IntentLog, ObjectPool, OwnMode, PoolSpace, PropertyStore,
    SpaceUsage, SyncPolicy, Transaction, TxHold, ZvolConfig, ZvolManager,
};

pub const POOL_CAPACITY: u64 = 256 * 1024 * 1024;
pub const VOL_SIZE: u64 = 1024 * 1024;
pub const BLOCK_SIZE: u32 = 4096;

/// A manager wired to in-memory collaborators
pub struct Harness {
    pub manager: ZvolManager,
    pub pool: Arc<MemoryPool>,
    pub props: Arc<MemoryProperties>,
    pub devices: Arc<MemoryDevices>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ZvolConfig::default())
    }

    pub fn with_config(config: ZvolConfig) -> Self {
        Self::with_pool(MemoryPool::new(POOL_CAPACITY), config)
    }

    pub fn with_pool(pool: MemoryPool, config: ZvolConfig) -> Self {
        let pool = Arc::new(pool);
        let props = Arc::new(MemoryProperties::new());
        let devices = Arc::new(MemoryDevices::new());
        let backends = Backends::new(pool.clone(), props.clone(), devices.clone());
        let manager = ZvolManager::new(backends, config).expect("valid config");
        Self {
            manager,
            pool,
            props,
            devices,
        }
    }

    /// Collaborators that stop at `sync_gate` when a request reads the
    /// dataset sync policy, and at `volmode_gate` when create looks up the
    /// `volmode` property.
    pub fn gated(sync_gate: &Arc<Gate>, volmode_gate: &Arc<Gate>) -> Self {
        let pool = Arc::new(MemoryPool::new(POOL_CAPACITY));
        let props = Arc::new(MemoryProperties::new());
        let devices = Arc::new(MemoryDevices::new());
        let backends = Backends::new(
            Arc::new(GatedPool {
                inner: pool.clone(),
                gate: Arc::clone(sync_gate),
            }),
            Arc::new(GatedProperties {
                inner: props.clone(),
                gate: Arc::clone(volmode_gate),
            }),
            devices.clone(),
        );
        let manager = ZvolManager::new(backends, ZvolConfig::default()).expect("valid config");
        Self {
            manager,
            pool,
            props,
            devices,
        }
    }

    /// Create the dataset and register the volume
    pub fn volume(&self, name: &str) -> Arc<MemoryDataset> {
        self.volume_sized(name, VOL_SIZE)
    }

    pub fn volume_sized(&self, name: &str, size: u64) -> Arc<MemoryDataset> {
        let dataset = self
            .pool
            .create_volume(name, size, BLOCK_SIZE)
            .expect("create dataset");
        self.manager.create_minor(name).expect("create minor");
        dataset
    }

    pub fn log(&self, name: &str) -> Arc<MemoryLog> {
        self.pool
            .dataset(name)
            .and_then(|ds| ds.memory_log())
            .expect("memory log")
    }
}

/// Deterministic pattern for a given seed
pub fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len)
        .map(|i| seed.wrapping_add((i % 251) as u8))
        .collect()
}

/// A pause point. Once armed, the first thread to pass stops there until
/// the test releases it; later passes go straight through.
#[derive(Default)]
pub struct Gate {
    armed: Mutex<Option<(Sender<()>, Receiver<()>)>>,
}

impl Gate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns a receiver signalled when a thread stops at the gate, and
    /// the sender that lets it continue.
    pub fn arm(&self) -> (Receiver<()>, Sender<()>) {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        *self.armed.lock() = Some((entered_tx, release_rx));
        (entered_rx, release_tx)
    }

    pub fn pass(&self) {
        let armed = self.armed.lock().take();
        if let Some((entered, release)) = armed {
            let _ = entered.send(());
            let _ = release.recv();
        }
    }
}

struct GatedPool {
    inner: Arc<MemoryPool>,
    gate: Arc<Gate>,
}

impl ObjectPool for GatedPool {
    fn own(&self, name: &str, mode: OwnMode) -> BlockResult<Arc<dyn Dataset>> {
        let inner = self.inner.own(name, mode)?;
        Ok(Arc::new(GatedDataset {
            inner,
            gate: Arc::clone(&self.gate),
        }))
    }

    fn is_writable(&self) -> bool {
        self.inner.is_writable()
    }

    fn class_space(&self) -> PoolSpace {
        self.inner.class_space()
    }
}

struct GatedDataset {
    inner: Arc<dyn Dataset>,
    gate: Arc<Gate>,
}

impl Dataset for GatedDataset {
    fn volume_size(&self) -> BlockResult<u64> {
        self.inner.volume_size()
    }

    fn set_volume_size(&self, size: u64) -> BlockResult<()> {
        self.inner.set_volume_size(size)
    }

    fn block_size(&self) -> BlockResult<u32> {
        self.inner.block_size()
    }

    fn is_snapshot(&self) -> bool {
        self.inner.is_snapshot()
    }

    fn sync_policy(&self) -> SyncPolicy {
        self.gate.pass();
        self.inner.sync_policy()
    }

    fn read(&self, offset: u64, length: u64) -> BlockResult<Bytes> {
        self.inner.read(offset, length)
    }

    fn begin_tx(&self, hold: TxHold) -> BlockResult<Box<dyn Transaction>> {
        self.inner.begin_tx(hold)
    }

    fn free_range(&self, offset: u64, length: u64) -> BlockResult<()> {
        self.inner.free_range(offset, length)
    }

    fn space_usage(&self) -> SpaceUsage {
        self.inner.space_usage()
    }

    fn next_offset(&self, offset: u64, hole: bool) -> BlockResult<u64> {
        self.inner.next_offset(offset, hole)
    }

    fn open_log(&self) -> BlockResult<Option<Arc<dyn IntentLog>>> {
        self.inner.open_log()
    }

    fn wait_synced(&self) {
        self.inner.wait_synced();
    }

    fn release(&self) {
        self.inner.release();
    }
}

struct GatedProperties {
    inner: Arc<MemoryProperties>,
    gate: Arc<Gate>,
}

impl PropertyStore for GatedProperties {
    fn get_bool(&self, dataset: &str, key: &str) -> BlockResult<Option<bool>> {
        self.inner.get_bool(dataset, key)
    }

    fn get_string(&self, dataset: &str, key: &str) -> BlockResult<Option<String>> {
        if key == "volmode" {
            self.gate.pass();
        }
        self.inner.get_string(dataset, key)
    }
}
