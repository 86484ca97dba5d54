//! Suspend/resume coordination for one volume
//!
//! Every I/O holds the suspend lock for reading ("configuration is stable,
//! proceed"); resize, rename and destroy hold it for writing ("no I/O may
//! proceed").
//!
//! Lock order: registry lock, then suspend lock, then the volume state lock.
//! The state operations that take the first open reference or drop the last
//! one take a [`SuspendRead`] as a parameter, so those paths cannot be
//! written without holding the suspend lock first.
//!
//! The lock is not reentrant. A thread holding a [`SuspendRead`] passes it
//! down instead of acquiring again; a second read acquisition behind a
//! queued writer would deadlock.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Per-volume suspend lock
#[derive(Debug, Default)]
pub struct SuspendLock {
    lock: RwLock<()>,
}

impl SuspendLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold off reconfiguration
    pub fn read(&self) -> SuspendRead<'_> {
        SuspendRead {
            _guard: self.lock.read(),
        }
    }

    /// Hold off reconfiguration if nobody is reconfiguring right now
    pub fn try_read(&self) -> Option<SuspendRead<'_>> {
        self.lock.try_read().map(|guard| SuspendRead { _guard: guard })
    }

    /// Suspend all I/O
    pub fn write(&self) -> SuspendWrite<'_> {
        SuspendWrite {
            guard: self.lock.write(),
        }
    }

    /// Whether a writer currently holds the lock
    pub fn is_suspended(&self) -> bool {
        self.lock.is_locked_exclusive()
    }
}

/// Proof that the suspend lock is held for reading
#[must_use]
pub struct SuspendRead<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

/// Proof that the suspend lock is held for writing
#[must_use]
pub struct SuspendWrite<'a> {
    guard: RwLockWriteGuard<'a, ()>,
}

impl<'a> SuspendWrite<'a> {
    /// Atomically turn the write hold into a read hold
    pub fn downgrade(self) -> SuspendRead<'a> {
        SuspendRead {
            _guard: RwLockWriteGuard::downgrade(self.guard),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readers_exclude_writer() {
        let lock = SuspendLock::new();
        let r1 = lock.read();
        let r2 = lock.try_read();
        assert!(r2.is_some());
        assert!(!lock.is_suspended());
        drop(r1);
        drop(r2);

        let w = lock.write();
        assert!(lock.is_suspended());
        assert!(lock.try_read().is_none());
        drop(w);
        assert!(lock.try_read().is_some());
    }

    #[test]
    fn test_downgrade_keeps_readers_out_of_writers_way() {
        let lock = SuspendLock::new();
        let read = lock.write().downgrade();
        assert!(!lock.is_suspended());
        assert!(lock.try_read().is_some());
        drop(read);
    }
}
