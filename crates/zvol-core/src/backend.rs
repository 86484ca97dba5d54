//! Collaborator interfaces consumed by the volume layer
//!
//! The core never reimplements the object store, the intent log, the
//! property store or the device framework. It talks to them through the
//! traits below. All of them are synchronous: every call may block the
//! calling thread (transaction assign and log commit in particular).
//!
//! ```text
//! ┌──────────────┐   own()    ┌──────────┐  begin_tx()  ┌─────────────┐
//! │  ObjectPool  │──────────▶ │ Dataset  │────────────▶ │ Transaction │
//! └──────────────┘            └────┬─────┘              └─────────────┘
//!                                  │ open_log()
//!                             ┌────▼──────┐
//!                             │ IntentLog │
//!                             └───────────┘
//! ```

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::BlockResult;
use crate::request::Completion;

/// How a volume is exposed to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeMode {
    /// Provider with a deferred worker for non-blocking submitters
    Geom,
    /// Plain device node, requests always run in the caller's context
    Dev,
    /// Not exposed at all
    None,
}

impl VolumeMode {
    /// Parse the `volmode` property value. `default` and unknown values
    /// yield `None` so the configured default applies.
    pub fn from_property(value: &str) -> Option<Self> {
        match value {
            "geom" | "full" => Some(Self::Geom),
            "dev" => Some(Self::Dev),
            "none" => Some(Self::None),
            _ => None,
        }
    }

    /// Whether the volume gets a provider registration
    pub fn is_exposed(&self) -> bool {
        !matches!(self, Self::None)
    }
}

impl fmt::Display for VolumeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Geom => write!(f, "geom"),
            Self::Dev => write!(f, "dev"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Ownership mode requested from the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnMode {
    /// Provisional read-only ownership, used to inspect a dataset before
    /// its final access mode is known.
    Inspect,
    /// Ownership for modification (size updates)
    Modify,
}

/// Dataset sync policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPolicy {
    /// Sync only when the request asks for it
    #[default]
    Standard,
    /// Every mutating request is committed to the log before completion
    Always,
    /// Never wait for the log
    Disabled,
}

/// Space accounting for one dataset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpaceUsage {
    /// Bytes referenced by the dataset
    pub referenced: u64,
    /// Bytes still available to the dataset
    pub available: u64,
    /// Objects in use
    pub used_objects: u64,
    /// Objects that can still be allocated
    pub available_objects: u64,
}

/// Space accounting for the pool's normal allocation class
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSpace {
    /// Total capacity in bytes
    pub capacity: u64,
    /// Allocated bytes
    pub allocated: u64,
}

/// What a transaction intends to touch, declared before assignment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxHold {
    /// Write `length` bytes at `offset`
    Write { offset: u64, length: u64 },
    /// Log-only transaction (truncate intent)
    LogOnly,
}

/// Log record handed to the replay callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// Data written at offset
    Write { offset: u64, data: Bytes },
    /// Range freed
    Truncate { offset: u64, length: u64 },
}

/// Provider registration handle issued by the device framework
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProviderId(pub u64);

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "provider-{}", self.0)
    }
}

/// Storage pool holding volume datasets
pub trait ObjectPool: Send + Sync {
    /// Take ownership of the named dataset
    fn own(&self, name: &str, mode: OwnMode) -> BlockResult<Arc<dyn Dataset>>;

    /// Whether the pool accepts writes at all
    fn is_writable(&self) -> bool;

    /// Space accounting for the pool's normal class
    fn class_space(&self) -> PoolSpace;
}

/// One owned volume dataset
pub trait Dataset: Send + Sync {
    /// Logical volume size stored in the dataset
    fn volume_size(&self) -> BlockResult<u64>;

    /// Persist a new logical volume size
    fn set_volume_size(&self, size: u64) -> BlockResult<()>;

    /// Data block size of the volume object
    fn block_size(&self) -> BlockResult<u32>;

    /// Whether the dataset is a snapshot
    fn is_snapshot(&self) -> bool;

    /// Sync policy configured on the dataset
    fn sync_policy(&self) -> SyncPolicy;

    /// Read `length` bytes at `offset`. May fail with `BlockError::Checksum`.
    fn read(&self, offset: u64, length: u64) -> BlockResult<Bytes>;

    /// Create a transaction and assign it to a transaction group,
    /// waiting for admission.
    fn begin_tx(&self, hold: TxHold) -> BlockResult<Box<dyn Transaction>>;

    /// Free the backing storage of a range
    fn free_range(&self, offset: u64, length: u64) -> BlockResult<()>;

    /// Space accounting
    fn space_usage(&self) -> SpaceUsage;

    /// Next offset at or after `offset` that starts a hole (`hole == true`)
    /// or data
    fn next_offset(&self, offset: u64, hole: bool) -> BlockResult<u64>;

    /// Open the dataset's intent log. `None` if the dataset has no log.
    fn open_log(&self) -> BlockResult<Option<Arc<dyn IntentLog>>>;

    /// Block until all committed transactions are on stable storage
    fn wait_synced(&self);

    /// Give up ownership
    fn release(&self);
}

/// An assigned backing-store transaction
pub trait Transaction: Send {
    /// Transaction group this transaction was assigned to
    fn txg(&self) -> u64;

    /// Stage a write inside the transaction
    fn write(&mut self, offset: u64, data: &[u8]) -> BlockResult<()>;

    /// Commit the transaction
    fn commit(self: Box<Self>) -> BlockResult<()>;

    /// Abort the transaction, discarding staged writes
    fn abort(self: Box<Self>);
}

/// Write-ahead intent log of one dataset
pub trait IntentLog: Send + Sync {
    /// Record a write intent
    fn log_write(&self, txg: u64, offset: u64, data: &Bytes, sync: bool) -> BlockResult<()>;

    /// Record a truncate (free) intent
    fn log_truncate(&self, txg: u64, offset: u64, length: u64, sync: bool) -> BlockResult<()>;

    /// Block until every record logged so far is durable
    fn commit(&self) -> BlockResult<()>;

    /// Treat all future records as synchronous
    fn async_to_sync(&self);

    /// Whether unreplayed records exist
    fn has_pending(&self) -> bool;

    /// Feed every unreplayed record to `apply`, in log order. Returns the
    /// number of records applied.
    fn replay(&self, apply: &mut dyn FnMut(LogRecord) -> BlockResult<()>) -> BlockResult<usize>;

    /// Drop unreplayed records without applying them
    fn discard(&self) -> BlockResult<()>;

    /// Commit outstanding records and close the log
    fn close(&self) -> BlockResult<()>;
}

/// Dataset property lookup
pub trait PropertyStore: Send + Sync {
    /// Boolean property, `None` when unset
    fn get_bool(&self, dataset: &str, key: &str) -> BlockResult<Option<bool>>;

    /// String property, `None` when unset
    fn get_string(&self, dataset: &str, key: &str) -> BlockResult<Option<String>>;
}

/// Host device-registration framework
pub trait DeviceFramework: Send + Sync {
    /// Register a provider. Media size starts at zero.
    fn announce(
        &self,
        name: &str,
        mode: VolumeMode,
        sector_size: u32,
        stripe_size: u32,
    ) -> BlockResult<ProviderId>;

    /// Set the media size without raising a resize event
    fn set_media_size(&self, provider: ProviderId, size: u64);

    /// Raise a resize event with the new media size
    fn resize(&self, provider: ProviderId, size: u64);

    /// Withdraw a provider
    fn retire(&self, provider: ProviderId);

    /// Deliver a request completion
    fn deliver(&self, provider: ProviderId, completion: &Completion);
}

/// The collaborators one volume layer instance talks to
#[derive(Clone)]
pub struct Backends {
    pub pool: Arc<dyn ObjectPool>,
    pub properties: Arc<dyn PropertyStore>,
    pub devices: Arc<dyn DeviceFramework>,
}

impl Backends {
    pub fn new(
        pool: Arc<dyn ObjectPool>,
        properties: Arc<dyn PropertyStore>,
        devices: Arc<dyn DeviceFramework>,
    ) -> Self {
        Self {
            pool,
            properties,
            devices,
        }
    }
}
