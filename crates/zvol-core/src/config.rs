//! Configuration for the volume layer

use serde::{Deserialize, Serialize};

use crate::SECTOR_SIZE;
use crate::backend::VolumeMode;
use crate::error::{BlockError, BlockResult};

/// Default maximum bytes moved by a single transaction: half of the
/// store's 64 MiB maximum access size.
pub const DEFAULT_MAX_TRANSFER: u64 = 32 * 1024 * 1024;

/// Volume layer tunables
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ZvolConfig {
    /// Maximum bytes read or written per backing-store transaction
    pub max_transfer: u64,
    /// Whether DELETE requests free backing storage
    pub unmap_enabled: bool,
    /// Discard unreplayed log content at create instead of replaying it
    pub replay_disabled: bool,
    /// Mode used when a volume has no `volmode` property
    pub default_volmode: VolumeMode,
    /// Prefix for deferred worker thread names
    pub worker_name_prefix: String,
}

impl Default for ZvolConfig {
    fn default() -> Self {
        Self {
            max_transfer: DEFAULT_MAX_TRANSFER,
            unmap_enabled: true,
            replay_disabled: false,
            default_volmode: VolumeMode::Geom,
            worker_name_prefix: "zvol".to_string(),
        }
    }
}

impl ZvolConfig {
    /// Config with a small transfer limit, handy for exercising chunking
    pub fn with_max_transfer(max_transfer: u64) -> Self {
        Self {
            max_transfer,
            ..Self::default()
        }
    }

    /// Reject tunables the volume layer cannot run with
    pub fn validate(&self) -> BlockResult<()> {
        if self.max_transfer == 0 || self.max_transfer % SECTOR_SIZE != 0 {
            return Err(BlockError::InvalidRequest(format!(
                "max_transfer must be a non-zero multiple of {SECTOR_SIZE}, got {}",
                self.max_transfer
            )));
        }
        if self.worker_name_prefix.contains('\0') {
            return Err(BlockError::InvalidRequest(
                "worker_name_prefix contains a NUL byte".to_string(),
            ));
        }
        Ok(())
    }
}
