//! I/O requests and their completions

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::error::{BlockError, BlockResult};

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Attribute names answered by an attribute query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attribute {
    /// Whether DELETE frees storage
    CanDelete,
    /// Sectors available to the volume
    BlocksAvail,
    /// Sectors referenced by the volume
    BlocksUsed,
    /// Sectors available in the pool
    PoolBlocksAvail,
    /// Sectors allocated in the pool
    PoolBlocksUsed,
    /// Volume size in bytes
    MediaSize,
    /// Sector size in bytes
    SectorSize,
    /// Volume block size in bytes
    StripeSize,
    /// Offset of the first stripe
    StripeOffset,
}

impl Attribute {
    /// Look up an attribute by its provider-facing name
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "GEOM::candelete" => Self::CanDelete,
            "blocksavail" => Self::BlocksAvail,
            "blocksused" => Self::BlocksUsed,
            "poolblocksavail" => Self::PoolBlocksAvail,
            "poolblocksused" => Self::PoolBlocksUsed,
            "mediasize" => Self::MediaSize,
            "sectorsize" => Self::SectorSize,
            "stripesize" => Self::StripeSize,
            "stripeoffset" => Self::StripeOffset,
            _ => return None,
        })
    }

    /// Provider-facing name
    pub fn name(&self) -> &'static str {
        match self {
            Self::CanDelete => "GEOM::candelete",
            Self::BlocksAvail => "blocksavail",
            Self::BlocksUsed => "blocksused",
            Self::PoolBlocksAvail => "poolblocksavail",
            Self::PoolBlocksUsed => "poolblocksused",
            Self::MediaSize => "mediasize",
            Self::SectorSize => "sectorsize",
            Self::StripeSize => "stripesize",
            Self::StripeOffset => "stripeoffset",
        }
    }
}

/// I/O operation carried by a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoOp {
    Read,
    Write,
    Delete,
    Flush,
    Query(Attribute),
}

impl IoOp {
    /// Whether the operation changes volume contents
    pub fn is_mutating(&self) -> bool {
        matches!(self, Self::Write | Self::Delete)
    }

    /// Whether the operation needs the intent log
    pub fn needs_log(&self) -> bool {
        matches!(self, Self::Write | Self::Delete | Self::Flush)
    }
}

impl fmt::Display for IoOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Delete => write!(f, "delete"),
            Self::Flush => write!(f, "flush"),
            Self::Query(attr) => write!(f, "query({})", attr.name()),
        }
    }
}

/// A device-level I/O request
#[derive(Debug, Clone)]
pub struct Request {
    /// Unique request id
    pub id: u64,
    /// Operation
    pub op: IoOp,
    /// Byte offset into the volume
    pub offset: u64,
    /// Length in bytes
    pub length: u64,
    /// Payload, WRITE only
    pub data: Option<Bytes>,
    /// Commit the log before completing
    pub sync: bool,
}

impl Request {
    fn new(op: IoOp, offset: u64, length: u64, data: Option<Bytes>) -> Self {
        Self {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            op,
            offset,
            length,
            data,
            sync: false,
        }
    }

    /// Read `length` bytes at `offset`
    pub fn read(offset: u64, length: u64) -> Self {
        Self::new(IoOp::Read, offset, length, None)
    }

    /// Write `data` at `offset`
    pub fn write(offset: u64, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let length = data.len() as u64;
        Self::new(IoOp::Write, offset, length, Some(data))
    }

    /// Free `length` bytes at `offset`
    pub fn delete(offset: u64, length: u64) -> Self {
        Self::new(IoOp::Delete, offset, length, None)
    }

    /// Commit the log
    pub fn flush() -> Self {
        Self::new(IoOp::Flush, 0, 0, None)
    }

    /// Attribute query
    pub fn query(attr: Attribute) -> Self {
        Self::new(IoOp::Query(attr), 0, 0, None)
    }

    /// Mark the request synchronous
    pub fn with_sync(mut self) -> Self {
        self.sync = true;
        self
    }

    pub(crate) fn validate(&self) -> BlockResult<()> {
        if self.op == IoOp::Write {
            match &self.data {
                Some(data) if data.len() as u64 == self.length => {}
                Some(data) => {
                    return Err(BlockError::InvalidRequest(format!(
                        "write length {} does not match payload of {} bytes",
                        self.length,
                        data.len()
                    )));
                }
                None => {
                    return Err(BlockError::InvalidRequest(
                        "write without payload".to_string(),
                    ));
                }
            }
        }
        if self.offset.checked_add(self.length).is_none() {
            return Err(BlockError::InvalidRequest(format!(
                "range {}+{} overflows",
                self.offset, self.length
            )));
        }
        Ok(())
    }
}

/// Outcome of one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Id of the completed request
    pub request_id: u64,
    /// Operation of the completed request
    pub op: IoOp,
    /// Bytes actually transferred
    pub bytes_transferred: u64,
    /// Data read, READ only
    pub data: Option<Bytes>,
    /// Attribute value, queries only
    pub value: Option<u64>,
    /// Error, if any. A partial transfer may carry both a count and an error.
    pub error: Option<BlockError>,
}

impl Completion {
    pub(crate) fn new(request: &Request) -> Self {
        Self {
            request_id: request.id,
            op: request.op,
            bytes_transferred: 0,
            data: None,
            value: None,
            error: None,
        }
    }

    pub(crate) fn failed(request: &Request, error: BlockError) -> Self {
        Self {
            error: Some(error),
            ..Self::new(request)
        }
    }

    /// Whether the request finished without error
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Convert into a result, keeping the completion on success
    pub fn into_result(self) -> BlockResult<Self> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self),
        }
    }
}

/// Where to look when seeking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhence {
    Data,
    Hole,
}

/// Completion of a request handed to the deferred worker
#[derive(Debug)]
pub struct PendingCompletion {
    request_id: u64,
    rx: oneshot::Receiver<Completion>,
}

impl PendingCompletion {
    pub(crate) fn new(request_id: u64) -> (oneshot::Sender<Completion>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self { request_id, rx })
    }

    /// Id of the queued request
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Block the current thread until the worker completes the request.
    ///
    /// Must not be called from inside an async runtime.
    pub fn wait(self) -> BlockResult<Completion> {
        let id = self.request_id;
        self.rx.blocking_recv().map_err(|_| {
            BlockError::Internal(format!("request {id} dropped without completion"))
        })
    }

    /// Await the completion
    pub async fn recv(self) -> BlockResult<Completion> {
        let id = self.request_id;
        self.rx.await.map_err(|_| {
            BlockError::Internal(format!("request {id} dropped without completion"))
        })
    }

    /// Non-blocking poll
    pub fn try_recv(&mut self) -> Option<Completion> {
        self.rx.try_recv().ok()
    }
}
