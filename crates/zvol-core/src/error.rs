//! Volume layer error types

use thiserror::Error;

/// Coarse error class, used by callers that only care about how to react
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad offset, length or size
    Validation,
    /// Read-only volume
    Permission,
    /// Exclusive-open conflict or destroy with open references
    Busy,
    /// No such volume, or volume not open
    NotFound,
    /// Name already registered
    Exists,
    /// Operation not recognized
    Unsupported,
    /// Generic I/O failure, including checksum failures
    Io,
    /// Allocation, registration or transaction failure
    Resource,
}

/// Volume layer error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BlockError {
    /// Volume not found
    #[error("Volume not found: {0}")]
    VolumeNotFound(String),

    /// Volume already exists
    #[error("Volume already exists: {0}")]
    VolumeExists(String),

    /// Volume has no open reference, so no backing dataset is held
    #[error("Volume is not open: {0}")]
    NotOpen(String),

    /// Mutating access to a read-only volume
    #[error("Volume is read-only: {0}")]
    ReadOnly(String),

    /// Exclusive-open conflict
    #[error("Volume is busy: {0}")]
    Busy(String),

    /// Caller broke a lifecycle precondition (e.g. destroy while open)
    #[error("Contract violation: {0}")]
    ContractViolation(String),

    /// Invalid volume size
    #[error("Invalid volume size: {0}")]
    InvalidSize(String),

    /// Malformed request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Offset beyond the end of the volume
    #[error("Offset {offset} is beyond volume size {size}")]
    OutOfRange { offset: u64, size: u64 },

    /// Operation or attribute not recognized
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Generic I/O failure as seen by callers
    #[error("I/O error: {0}")]
    Io(String),

    /// Backing-store checksum validation failed. Never leaves the dispatcher.
    #[error("Checksum mismatch at offset {offset}")]
    Checksum { offset: u64 },

    /// Transaction could not be assigned to a transaction group
    #[error("Transaction assign failed: {0}")]
    TxAssign(String),

    /// Allocation or registration failure
    #[error("Resource error: {0}")]
    Resource(String),

    /// Intent journal error
    #[error("Journal error: {0}")]
    Journal(String),

    /// Backend storage error
    #[error("Backend error: {0}")]
    Backend(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BlockError {
    /// Classify this error
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidSize(_) | Self::InvalidRequest(_) | Self::OutOfRange { .. } => {
                ErrorClass::Validation
            }
            Self::ReadOnly(_) => ErrorClass::Permission,
            Self::Busy(_) | Self::ContractViolation(_) => ErrorClass::Busy,
            Self::VolumeNotFound(_) | Self::NotOpen(_) => ErrorClass::NotFound,
            Self::VolumeExists(_) => ErrorClass::Exists,
            Self::Unsupported(_) => ErrorClass::Unsupported,
            Self::Io(_) | Self::Checksum { .. } => ErrorClass::Io,
            Self::TxAssign(_)
            | Self::Resource(_)
            | Self::Journal(_)
            | Self::Backend(_)
            | Self::Internal(_) => ErrorClass::Resource,
        }
    }

    /// Map store-internal errors to what a caller is allowed to see.
    ///
    /// Checksum failures become a generic I/O error: the caller can only
    /// retry or report, so the storage detail is not useful to it.
    pub fn into_caller_visible(self) -> Self {
        match self {
            Self::Checksum { offset } => {
                Self::Io(format!("data integrity failure at offset {offset}"))
            }
            other => other,
        }
    }
}

impl From<std::io::Error> for BlockError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Result type for volume operations
pub type BlockResult<T> = Result<T, BlockError>;
