//! Volume lifecycle management
//!
//! [`ZvolManager`] owns the registry and the collaborators, and runs the
//! create / open / rename / resize / destroy protocols.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::SECTOR_SIZE;
use crate::backend::{Backends, Dataset, IntentLog, LogRecord, OwnMode, TxHold, VolumeMode};
use crate::config::ZvolConfig;
use crate::error::{BlockError, BlockResult};
use crate::handle::VolumeHandle;
use crate::registry::VolumeRegistry;
use crate::volume::{Lifecycle, OpenMode, VolumeInfo, Zvol};
use crate::worker;

/// Volume subsystem root
pub struct ZvolManager {
    registry: VolumeRegistry,
    backends: Backends,
    config: Arc<ZvolConfig>,
}

impl ZvolManager {
    /// Create a manager over the given collaborators
    pub fn new(backends: Backends, config: ZvolConfig) -> BlockResult<Self> {
        config.validate()?;
        Ok(Self {
            registry: VolumeRegistry::new(),
            backends,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &ZvolConfig {
        &self.config
    }

    /// Look up a registered volume
    pub fn find(&self, name: &str) -> Option<Arc<Zvol>> {
        self.registry.find(name)
    }

    /// Whether any volume is registered
    pub fn busy(&self) -> bool {
        !self.registry.is_empty()
    }

    /// Snapshot of every registered volume, sorted by name
    pub fn list(&self) -> Vec<VolumeInfo> {
        let mut infos = Vec::with_capacity(self.registry.len());
        self.registry.for_each(|_, zvol| infos.push(zvol.info()));
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    // ── Create ───────────────────────────────────────────────────────────────

    /// Register the volume backed by dataset `name`
    pub fn create_minor(&self, name: &str) -> BlockResult<Arc<Zvol>> {
        let (zvol, created) = self.registry.find_or_create(
            name,
            || self.build_minor(name),
            |loser| {
                debug!(volume = %name, "lost the create race, tearing down");
                self.discard_minor(loser);
            },
        )?;
        if !created {
            return Err(BlockError::VolumeExists(name.to_string()));
        }

        info!(
            volume = %name,
            size = zvol.size(),
            block_size = zvol.block_size(),
            mode = %zvol.mode(),
            read_only = zvol.flags().read_only,
            "Created volume"
        );
        Ok(zvol)
    }

    fn build_minor(&self, name: &str) -> BlockResult<Arc<Zvol>> {
        // Provisional read-only ownership: the final access mode is fixed
        // at open, after the read-only property has been looked up.
        let dataset = self.backends.pool.own(name, OwnMode::Inspect)?;
        let result = self.inspect(name, dataset.as_ref());
        dataset.release();
        let zvol = Arc::new(result?);

        if zvol.mode().is_exposed() {
            let provider = self.backends.devices.announce(
                name,
                zvol.mode(),
                SECTOR_SIZE as u32,
                zvol.block_size(),
            )?;
            zvol.state.lock().provider = Some(provider);
        }

        if zvol.mode() == VolumeMode::Geom {
            match worker::spawn(Arc::clone(&zvol), name) {
                Ok(handle) => *zvol.worker.lock() = Some(handle),
                Err(err) => {
                    self.retire_provider(&zvol);
                    return Err(err);
                }
            }
        }
        Ok(zvol)
    }

    /// Read geometry and mode, and bring the log up to date
    fn inspect(&self, name: &str, dataset: &dyn Dataset) -> BlockResult<Zvol> {
        let size = dataset.volume_size()?;
        let block_size = dataset.block_size()?;
        let mode = self
            .backends
            .properties
            .get_string(name, "volmode")?
            .and_then(|value| VolumeMode::from_property(&value))
            .unwrap_or(self.config.default_volmode);
        let writable = self.backends.pool.is_writable();
        let read_only = dataset.is_snapshot() || !writable;

        if writable && !dataset.is_snapshot() {
            self.settle_log(name, dataset)?;
        }

        Ok(Zvol::new(
            name,
            size,
            block_size,
            mode,
            read_only,
            self.backends.clone(),
            Arc::clone(&self.config),
        ))
    }

    /// Replay (or discard) log records a previous owner left behind
    fn settle_log(&self, name: &str, dataset: &dyn Dataset) -> BlockResult<()> {
        let Some(log) = dataset.open_log()? else {
            return Ok(());
        };
        if log.has_pending() {
            if self.config.replay_disabled {
                warn!(volume = %name, "discarding unreplayed log records");
                log.discard()?;
            } else {
                let applied = replay(dataset, log.as_ref())?;
                info!(volume = %name, applied, "replayed intent log");
            }
        }
        log.close()
    }

    // ── Open ─────────────────────────────────────────────────────────────────

    /// Open a volume for I/O
    pub fn open(&self, name: &str, mode: OpenMode) -> BlockResult<VolumeHandle> {
        let zvol = self
            .registry
            .find(name)
            .ok_or_else(|| BlockError::VolumeNotFound(name.to_string()))?;
        zvol.open_ref(mode)?;
        Ok(VolumeHandle::new(zvol, mode))
    }

    // ── Rename ───────────────────────────────────────────────────────────────

    /// Re-register a volume under a new name with a fresh provider
    pub fn rename_minor(&self, old: &str, new: &str) -> BlockResult<()> {
        self.registry.rename(old, new, |zvol| {
            let _suspend = zvol.suspend.write();
            let mut state = zvol.state.lock();
            if state.lifecycle() != Lifecycle::Active {
                return Err(BlockError::VolumeNotFound(old.to_string()));
            }

            if zvol.mode().is_exposed() {
                let provider = self.backends.devices.announce(
                    new,
                    zvol.mode(),
                    SECTOR_SIZE as u32,
                    zvol.block_size(),
                )?;
                if let Some(size) = state.announced_size {
                    self.backends.devices.set_media_size(provider, size);
                }
                if let Some(previous) = state.provider.replace(provider) {
                    self.backends.devices.retire(previous);
                }
            }
            state.name = new.to_string();
            Ok(())
        })?;

        info!(from = %old, to = %new, "Renamed volume");
        Ok(())
    }

    // ── Resize ───────────────────────────────────────────────────────────────

    /// Change the logical size of a volume
    pub fn resize(&self, name: &str, new_size: u64) -> BlockResult<()> {
        let zvol = self
            .registry
            .find(name)
            .ok_or_else(|| BlockError::VolumeNotFound(name.to_string()))?;
        let block_size = u64::from(zvol.block_size());
        if new_size == 0 || new_size % block_size != 0 {
            return Err(BlockError::InvalidSize(format!(
                "{new_size} is not a non-zero multiple of the block size {block_size}"
            )));
        }

        let _suspend = zvol.suspend.write();
        let mut state = zvol.state.lock();
        if state.lifecycle() != Lifecycle::Active {
            return Err(BlockError::VolumeNotFound(name.to_string()));
        }
        if state.flags.read_only {
            return Err(BlockError::ReadOnly(name.to_string()));
        }

        let old_size = zvol.size();
        let (dataset, owned_here) = match state.dataset.clone() {
            Some(dataset) => (dataset, false),
            None => (self.backends.pool.own(name, OwnMode::Modify)?, true),
        };
        let result = dataset.set_volume_size(new_size).and_then(|()| {
            if new_size < old_size {
                dataset.free_range(new_size, old_size - new_size)
            } else {
                Ok(())
            }
        });
        if owned_here {
            dataset.release();
        }
        result?;

        zvol.set_size(new_size);
        zvol.update_capacity(&mut state, new_size);
        info!(volume = %name, old_size, new_size, "Resized volume");
        Ok(())
    }

    // ── Destroy ──────────────────────────────────────────────────────────────

    /// Tear down an unopened volume
    pub fn destroy_minor(&self, name: &str) -> BlockResult<()> {
        let zvol = self
            .registry
            .find(name)
            .ok_or_else(|| BlockError::VolumeNotFound(name.to_string()))?;

        {
            let mut state = zvol.state.lock();
            if state.open_count() > 0 {
                error!(
                    volume = %name,
                    open_count = state.open_count(),
                    "destroy requested while the volume is open"
                );
                return Err(BlockError::ContractViolation(format!(
                    "{name} has {} open references",
                    state.open_count()
                )));
            }
            state.begin_drain()?;
        }
        self.drain(&zvol);

        // A rename may have landed between the lookup and the drain.
        self.registry.remove(&zvol.name());
        info!(volume = %name, "Destroyed volume");
        Ok(())
    }

    /// Wake the worker, wait for RETIRED and withdraw the provider
    fn drain(&self, zvol: &Zvol) {
        zvol.queue_ready.notify_all();
        debug!(volume = %zvol.name(), "waiting for the deferred worker to drain");
        zvol.wait_retired();
        zvol.join_worker();
        self.retire_provider(zvol);
    }

    /// Tear down a descriptor that never made it into the registry
    fn discard_minor(&self, zvol: &Zvol) {
        if zvol.state.lock().begin_drain().is_ok() {
            self.drain(zvol);
        }
    }

    fn retire_provider(&self, zvol: &Zvol) {
        let _suspend = zvol.suspend.write();
        let provider = zvol.state.lock().provider.take();
        if let Some(provider) = provider {
            self.backends.devices.retire(provider);
        }
    }

    /// Destroy every volume that is not open. Returns the names that could
    /// not be destroyed.
    pub fn shutdown(&self) -> Vec<String> {
        let mut remaining = Vec::new();
        for name in self.registry.names() {
            if let Err(err) = self.destroy_minor(&name) {
                warn!(volume = %name, "not destroyed at shutdown: {}", err);
                remaining.push(name);
            }
        }
        remaining
    }
}

impl Drop for ZvolManager {
    /// Destroy what can be destroyed. Volumes still open keep working
    /// inline, but their deferred workers are told to drain and exit so
    /// nothing stays parked on a descriptor nobody can destroy.
    fn drop(&mut self) {
        for name in self.shutdown() {
            let Some(zvol) = self.registry.remove(&name) else {
                continue;
            };
            warn!(volume = %name, "volume still open when the manager was dropped");
            if zvol.state.lock().begin_drain().is_ok() {
                zvol.queue_ready.notify_all();
            }
        }
    }
}

/// Apply every unreplayed record to the dataset
fn replay(dataset: &dyn Dataset, log: &dyn IntentLog) -> BlockResult<usize> {
    log.replay(&mut |record| match record {
        LogRecord::Write { offset, data } => {
            let mut tx = dataset.begin_tx(TxHold::Write {
                offset,
                length: data.len() as u64,
            })?;
            if let Err(err) = tx.write(offset, &data) {
                tx.abort();
                return Err(err);
            }
            tx.commit()
        }
        LogRecord::Truncate { offset, length } => dataset.free_range(offset, length),
    })
}
