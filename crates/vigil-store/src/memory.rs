//! In-memory snapshot store.
//!
//! Backs tests and ephemeral runs. The availability toggle lets tests
//! inject storage outages and watch the callers degrade.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vigil_core::types::{DiffId, NetworkSnapshot, SnapshotDiff, SnapshotId};

use crate::store::{Page, Pagination, Result, SnapshotFilter, SnapshotStore, StoreError};

#[derive(Default)]
struct Inner {
    snapshots: Vec<NetworkSnapshot>,
    diffs: BTreeMap<(SnapshotId, SnapshotId), SnapshotDiff>,
}

/// Append-only store held entirely in memory.
pub struct MemorySnapshotStore {
    inner: Mutex<Inner>,
    available: AtomicBool,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle simulated availability. While unavailable every operation
    /// fails with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ))
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for MemorySnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn migrate(&self) -> Result<()> {
        self.check_available()
    }

    async fn probe(&self) -> Result<()> {
        self.check_available()
    }

    async fn create(&self, snapshot: &NetworkSnapshot) -> Result<SnapshotId> {
        self.check_available()?;
        if !snapshot.verify_integrity() {
            return Err(StoreError::Invalid(format!(
                "snapshot {} checksum does not match its device list",
                snapshot.id
            )));
        }

        let mut inner = self.lock();
        if !inner.snapshots.iter().any(|s| s.id == snapshot.id) {
            inner.snapshots.push(snapshot.clone());
        }
        Ok(snapshot.id)
    }

    async fn get_by_id(&self, id: SnapshotId) -> Result<NetworkSnapshot> {
        self.check_available()?;
        let inner = self.lock();
        inner
            .snapshots
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn get_latest(&self) -> Result<Option<NetworkSnapshot>> {
        self.check_available()?;
        let inner = self.lock();
        Ok(inner
            .snapshots
            .iter()
            .max_by_key(|s| (s.timestamp, s.id))
            .cloned())
    }

    async fn list(
        &self,
        filter: &SnapshotFilter,
        page: Pagination,
    ) -> Result<Page<NetworkSnapshot>> {
        self.check_available()?;
        let inner = self.lock();

        let mut matches: Vec<NetworkSnapshot> = inner
            .snapshots
            .iter()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        matches.sort_by(|a, b| (b.timestamp, b.id).cmp(&(a.timestamp, a.id)));

        let total = matches.len();
        let items = matches
            .into_iter()
            .skip(page.offset)
            .take(page.limit)
            .collect();

        Ok(Page {
            items,
            total,
            offset: page.offset,
            limit: page.limit,
        })
    }

    async fn create_diff(&self, diff: &SnapshotDiff) -> Result<DiffId> {
        self.check_available()?;
        if diff.from_snapshot == diff.to_snapshot {
            return Err(StoreError::Invalid(
                "diff must reference two distinct snapshots".to_string(),
            ));
        }

        let mut inner = self.lock();
        let key = (diff.from_snapshot, diff.to_snapshot);
        if let Some(existing) = inner.diffs.get(&key) {
            return Ok(existing.id);
        }
        inner.diffs.insert(key, diff.clone());
        Ok(diff.id)
    }

    async fn list_recent_diffs(&self, since: DateTime<Utc>) -> Result<Vec<SnapshotDiff>> {
        self.check_available()?;
        let inner = self.lock();
        let mut diffs: Vec<SnapshotDiff> = inner
            .diffs
            .values()
            .filter(|d| d.timestamp >= since)
            .cloned()
            .collect();
        diffs.sort_by_key(|d| (d.timestamp, d.id.0));
        Ok(diffs)
    }

    async fn delete(&self, id: SnapshotId) -> Result<()> {
        self.check_available()?;
        let mut inner = self.lock();
        let before = inner.snapshots.len();
        inner.snapshots.retain(|s| s.id != id);
        if inner.snapshots.len() == before {
            return Err(StoreError::NotFound(id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::types::{ScanProfile, SnapshotMetadata};

    fn snapshot() -> NetworkSnapshot {
        NetworkSnapshot::assemble(
            vec![],
            SnapshotMetadata {
                scan_duration_ms: 10,
                scan_type: ScanProfile::Quick,
                errors: vec![],
            },
        )
    }

    #[tokio::test]
    async fn roundtrip() {
        let store = MemorySnapshotStore::new();
        let snap = snapshot();
        store.create(&snap).await.unwrap();
        assert_eq!(store.get_by_id(snap.id).await.unwrap(), snap);
        assert_eq!(store.get_latest().await.unwrap().unwrap().id, snap.id);
    }

    #[tokio::test]
    async fn unavailable_store_fails_every_operation() {
        let store = MemorySnapshotStore::new();
        store.set_available(false);

        assert!(matches!(
            store.probe().await.unwrap_err(),
            StoreError::Unavailable(_)
        ));
        assert!(matches!(
            store.create(&snapshot()).await.unwrap_err(),
            StoreError::Unavailable(_)
        ));

        store.set_available(true);
        store.probe().await.unwrap();
    }
}
