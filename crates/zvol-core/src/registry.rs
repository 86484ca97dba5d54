//! Name-to-descriptor registry
//!
//! The registry lock comes first in the lock order. Rename holds it for
//! writing across the descriptor's suspend write hold; no other path keeps
//! it while taking a per-volume lock.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{BlockError, BlockResult};
use crate::volume::Zvol;

/// Registered volumes, by name
#[derive(Default)]
pub struct VolumeRegistry {
    volumes: RwLock<HashMap<String, Arc<Zvol>>>,
}

impl VolumeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a volume
    pub fn find(&self, name: &str) -> Option<Arc<Zvol>> {
        self.volumes.read().get(name).cloned()
    }

    /// Register a volume under its current name
    pub fn insert(&self, zvol: Arc<Zvol>) -> BlockResult<()> {
        let name = zvol.name();
        let mut volumes = self.volumes.write();
        if volumes.contains_key(&name) {
            return Err(BlockError::VolumeExists(name));
        }
        volumes.insert(name, zvol);
        Ok(())
    }

    /// Return the registered volume, or register the one `create` builds.
    ///
    /// `create` runs without the registry lock, so setting up one volume
    /// never stalls lookups of the others. If another caller registers the
    /// name first, the freshly built volume goes to `discard` and the winner
    /// is returned.
    pub fn find_or_create<F, D>(
        &self,
        name: &str,
        create: F,
        discard: D,
    ) -> BlockResult<(Arc<Zvol>, bool)>
    where
        F: FnOnce() -> BlockResult<Arc<Zvol>>,
        D: FnOnce(&Arc<Zvol>),
    {
        if let Some(zvol) = self.find(name) {
            return Ok((zvol, false));
        }
        let zvol = create()?;
        match self.insert(Arc::clone(&zvol)) {
            Ok(()) => Ok((zvol, true)),
            Err(err) => {
                discard(&zvol);
                // The winner may already be gone again.
                self.find(name).map(|existing| (existing, false)).ok_or(err)
            }
        }
    }

    /// Unregister a volume
    pub fn remove(&self, name: &str) -> Option<Arc<Zvol>> {
        self.volumes.write().remove(name)
    }

    /// Move a volume to a new name.
    ///
    /// `reconfigure` runs with the registry write lock held, after both
    /// names have been checked; if it fails nothing is renamed.
    pub fn rename<F>(&self, old: &str, new: &str, reconfigure: F) -> BlockResult<Arc<Zvol>>
    where
        F: FnOnce(&Arc<Zvol>) -> BlockResult<()>,
    {
        let mut volumes = self.volumes.write();
        if volumes.contains_key(new) {
            return Err(BlockError::VolumeExists(new.to_string()));
        }
        let zvol = volumes
            .get(old)
            .cloned()
            .ok_or_else(|| BlockError::VolumeNotFound(old.to_string()))?;

        reconfigure(&zvol)?;

        volumes.remove(old);
        volumes.insert(new.to_string(), Arc::clone(&zvol));
        Ok(zvol)
    }

    /// Visit every registered volume. The registry is read-locked for the
    /// duration, so `f` must not call back into the registry.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&str, &Arc<Zvol>),
    {
        for (name, zvol) in self.volumes.read().iter() {
            f(name, zvol);
        }
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.volumes.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.volumes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.read().is_empty()
    }
}
