//! The snapshot store trait and its query types.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vigil_core::types::{DiffId, NetworkSnapshot, ScanProfile, SnapshotDiff, SnapshotId};
use vigil_core::{Transient, VigilError};

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Snapshot not found: {0}")]
    NotFound(SnapshotId),

    #[error("Invalid record: {0}")]
    Invalid(String),

    #[error("Integrity check failed for snapshot {0}: stored checksum does not match content")]
    Corrupt(SnapshotId),

    #[error("Storage schema version {found} is newer than supported version {supported}")]
    Schema { found: u32, supported: u32 },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::Unavailable(_) | StoreError::Io(_)
        )
    }
}

impl From<StoreError> for VigilError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => VigilError::NotFound {
                kind: "snapshot",
                id: id.to_string(),
            },
            StoreError::Invalid(msg) => VigilError::Validation(msg),
            StoreError::Unavailable(msg) => VigilError::Infrastructure(msg),
            StoreError::Io(e) => VigilError::Infrastructure(e.to_string()),
            StoreError::Serialization(e) => VigilError::Infrastructure(e.to_string()),
            StoreError::Corrupt(id) => {
                VigilError::Infrastructure(format!("snapshot {id} failed integrity check"))
            }
            StoreError::Schema { found, supported } => VigilError::Infrastructure(format!(
                "storage schema {found} newer than supported {supported}"
            )),
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Filter for snapshot listings.
#[derive(Debug, Clone, Default)]
pub struct SnapshotFilter {
    /// Only snapshots taken at or after this time.
    pub from: Option<DateTime<Utc>>,
    /// Only snapshots taken at or before this time.
    pub to: Option<DateTime<Utc>>,
    /// Only snapshots produced by this profile.
    pub scan_type: Option<ScanProfile>,
    /// Only snapshots with at least this many devices.
    pub min_devices: Option<u32>,
}

impl SnapshotFilter {
    pub fn matches(&self, snapshot: &NetworkSnapshot) -> bool {
        if let Some(from) = &self.from {
            if snapshot.timestamp < *from {
                return false;
            }
        }
        if let Some(to) = &self.to {
            if snapshot.timestamp > *to {
                return false;
            }
        }
        if let Some(scan_type) = &self.scan_type {
            if snapshot.metadata.scan_type != *scan_type {
                return false;
            }
        }
        if let Some(min) = self.min_devices {
            if snapshot.device_count < min {
                return false;
            }
        }
        true
    }
}

/// Offset/limit pagination.
#[derive(Debug, Clone, Copy)]
pub struct Pagination {
    pub offset: usize,
    pub limit: usize,
}

impl Default for Pagination {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

/// One page of a listing, with the total match count before paging.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
}

/// Durable, append-only persistence for snapshots and diffs.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Create the storage layout and apply pending schema upgrades.
    /// Rejects layouts written by a newer schema than this build supports.
    async fn migrate(&self) -> Result<()>;

    /// Cheap connectivity check used by the health loop.
    async fn probe(&self) -> Result<()>;

    /// Persist a snapshot. Re-submitting an already-stored id is a no-op.
    async fn create(&self, snapshot: &NetworkSnapshot) -> Result<SnapshotId>;

    /// Fetch a snapshot by id, verifying content integrity.
    async fn get_by_id(&self, id: SnapshotId) -> Result<NetworkSnapshot>;

    /// The most recent snapshot, if any exist.
    async fn get_latest(&self) -> Result<Option<NetworkSnapshot>>;

    /// List snapshots matching the filter, newest first.
    async fn list(
        &self,
        filter: &SnapshotFilter,
        page: Pagination,
    ) -> Result<Page<NetworkSnapshot>>;

    /// Persist a diff. Re-submitting a diff for an existing (from, to) pair
    /// is an idempotent no-op returning the stored id; a self-pair is
    /// rejected as invalid.
    async fn create_diff(&self, diff: &SnapshotDiff) -> Result<DiffId>;

    /// Diffs computed at or after `since`, ascending by timestamp.
    async fn list_recent_diffs(&self, since: DateTime<Utc>) -> Result<Vec<SnapshotDiff>>;

    /// Remove a snapshot. Retention sweeps only; history is otherwise
    /// append-only.
    async fn delete(&self, id: SnapshotId) -> Result<()>;
}
