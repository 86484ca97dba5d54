#![allow(clippy::result_large_err)]
//! Block-volume emulation and I/O dispatch
//!
//! This crate exposes datasets of a transactional object store as
//! fixed-size, block-addressable volumes. It serializes concurrent I/O with
//! a byte-range lock, coordinates reconfiguration (resize, rename, destroy)
//! against in-flight I/O, and dispatches each request to the store and the
//! intent log.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  submit / submit_deferred
//! │   VolumeHandle   │────────────────────────────┐
//! └────────┬─────────┘                            │
//!          │ open / close               ┌─────────▼─────────┐
//! ┌────────▼─────────┐                  │  Deferred worker  │
//! │   ZvolManager    │                  └─────────┬─────────┘
//! │  - Registry      │                            │
//! │  - create/rename │        ┌───────────────────▼───────────┐
//! │  - resize/destroy│        │ Dispatcher                    │
//! └────────┬─────────┘        │  suspend lock ─▶ range lock   │
//!          │                  │  ─▶ transactions ─▶ intent log│
//!          │                  └───────────────────┬───────────┘
//! ┌────────▼──────────────────────────────────────▼───────────┐
//! │ Collaborators: ObjectPool, Dataset, IntentLog,            │
//! │                PropertyStore, DeviceFramework             │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! The [`memory`] and [`journal`] modules provide in-process collaborators
//! for tests and the simulator.

pub mod backend;
pub mod chunk;
pub mod config;
mod dispatch;
pub mod error;
pub mod handle;
pub mod journal;
pub mod manager;
pub mod memory;
pub mod range_lock;
pub mod registry;
pub mod request;
pub mod stats;
pub mod suspend;
pub mod volume;
mod worker;

pub use backend::{
    Backends, Dataset, DeviceFramework, IntentLog, LogRecord, ObjectPool, OwnMode, PoolSpace,
    PropertyStore, ProviderId, SpaceUsage, SyncPolicy, Transaction, TxHold, VolumeMode,
};
pub use config::{DEFAULT_MAX_TRANSFER, ZvolConfig};
pub use error::{BlockError, BlockResult, ErrorClass};
pub use handle::VolumeHandle;
pub use journal::{FileJournal, JournalEntry};
pub use manager::ZvolManager;
pub use range_lock::{RangeGuard, RangeLock, RangeMode};
pub use registry::VolumeRegistry;
pub use request::{Attribute, Completion, IoOp, PendingCompletion, Request, SeekWhence};
pub use stats::{IoStats, IoStatsSnapshot};
pub use suspend::{SuspendLock, SuspendRead, SuspendWrite};
pub use volume::{Lifecycle, OpenMode, VolumeFlags, VolumeInfo, Zvol};

/// Sector size reported to the device framework
pub const SECTOR_SIZE: u64 = 512;
