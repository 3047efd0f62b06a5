//! Filesystem-backed snapshot store.
//!
//! Snapshots are stored as JSON documents in a date-partitioned tree, diffs
//! as pair-keyed documents, with a schema version file at the root:
//!
//! ```text
//! {root}/
//!   schema.json
//!   snapshots/
//!     2026/
//!       08/
//!         04/
//!           {snapshot_id}.json
//!   diffs/
//!     {from_id}__{to_id}.json
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vigil_core::types::{DiffId, NetworkSnapshot, SnapshotDiff, SnapshotId};

use crate::store::{Page, Pagination, Result, SnapshotFilter, SnapshotStore, StoreError};

/// Current on-disk layout version.
const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct SchemaInfo {
    version: u32,
}

/// Date-partitioned JSON document store.
pub struct FsSnapshotStore {
    root: PathBuf,
}

impl FsSnapshotStore {
    /// Create a store rooted at the given directory. No I/O happens until
    /// [`SnapshotStore::migrate`] is called.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn schema_path(&self) -> PathBuf {
        self.root.join("schema.json")
    }

    fn snapshots_dir(&self) -> PathBuf {
        self.root.join("snapshots")
    }

    fn diffs_dir(&self) -> PathBuf {
        self.root.join("diffs")
    }

    fn snapshot_path(&self, snapshot: &NetworkSnapshot) -> PathBuf {
        let date = snapshot.timestamp.format("%Y/%m/%d");
        self.snapshots_dir()
            .join(format!("{}/{}.json", date, snapshot.id))
    }

    fn diff_path(&self, from: SnapshotId, to: SnapshotId) -> PathBuf {
        self.diffs_dir().join(format!("{from}__{to}.json"))
    }

    fn find_snapshot_path(&self, id: SnapshotId) -> Result<PathBuf> {
        let filename = format!("{id}.json");
        find_file_recursive(&self.snapshots_dir(), &filename).ok_or(StoreError::NotFound(id))
    }

    fn read_snapshot(&self, path: &Path) -> Result<NetworkSnapshot> {
        let json = fs::read_to_string(path)?;
        let snapshot: NetworkSnapshot = serde_json::from_str(&json)?;
        if !snapshot.verify_integrity() {
            return Err(StoreError::Corrupt(snapshot.id));
        }
        Ok(snapshot)
    }

    fn collect_snapshots(&self, filter: &SnapshotFilter) -> Result<Vec<NetworkSnapshot>> {
        let mut results = Vec::new();
        collect_json_recursive(&self.snapshots_dir(), &mut |path| {
            let snapshot = self.read_snapshot(path)?;
            if filter.matches(&snapshot) {
                results.push(snapshot);
            }
            Ok(())
        })?;
        Ok(results)
    }
}

#[async_trait]
impl SnapshotStore for FsSnapshotStore {
    async fn migrate(&self) -> Result<()> {
        fs::create_dir_all(self.snapshots_dir())?;
        fs::create_dir_all(self.diffs_dir())?;

        let schema_path = self.schema_path();
        let version = if schema_path.exists() {
            let json = fs::read_to_string(&schema_path)?;
            let info: SchemaInfo = serde_json::from_str(&json)?;
            info.version
        } else {
            0
        };

        if version > SCHEMA_VERSION {
            return Err(StoreError::Schema {
                found: version,
                supported: SCHEMA_VERSION,
            });
        }

        if version < SCHEMA_VERSION {
            // Upgrades between layout versions slot in here; version 0 is a
            // fresh directory that only needs stamping.
            let info = SchemaInfo {
                version: SCHEMA_VERSION,
            };
            fs::write(&schema_path, serde_json::to_string_pretty(&info)?)?;
            tracing::info!(
                from_version = version,
                to_version = SCHEMA_VERSION,
                root = %self.root.display(),
                "Storage schema upgraded"
            );
        }

        Ok(())
    }

    async fn probe(&self) -> Result<()> {
        let json = fs::read_to_string(self.schema_path())
            .map_err(|e| StoreError::Unavailable(format!("storage root unreadable: {e}")))?;
        serde_json::from_str::<SchemaInfo>(&json)
            .map_err(|e| StoreError::Unavailable(format!("schema file unreadable: {e}")))?;
        Ok(())
    }

    async fn create(&self, snapshot: &NetworkSnapshot) -> Result<SnapshotId> {
        if !snapshot.verify_integrity() {
            return Err(StoreError::Invalid(format!(
                "snapshot {} checksum does not match its device list",
                snapshot.id
            )));
        }

        let path = self.snapshot_path(snapshot);
        if path.exists() {
            tracing::debug!(snapshot_id = %snapshot.id, "Snapshot already stored, skipping");
            return Ok(snapshot.id);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_string_pretty(snapshot)?)?;

        tracing::debug!(
            snapshot_id = %snapshot.id,
            device_count = snapshot.device_count,
            path = %path.display(),
            "Snapshot saved"
        );

        Ok(snapshot.id)
    }

    async fn get_by_id(&self, id: SnapshotId) -> Result<NetworkSnapshot> {
        let path = self.find_snapshot_path(id)?;
        self.read_snapshot(&path)
    }

    async fn get_latest(&self) -> Result<Option<NetworkSnapshot>> {
        let all = self.collect_snapshots(&SnapshotFilter::default())?;
        Ok(all.into_iter().max_by_key(|s| (s.timestamp, s.id)))
    }

    async fn list(
        &self,
        filter: &SnapshotFilter,
        page: Pagination,
    ) -> Result<Page<NetworkSnapshot>> {
        let mut matches = self.collect_snapshots(filter)?;
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
        if diff.from_snapshot == diff.to_snapshot {
            return Err(StoreError::Invalid(
                "diff must reference two distinct snapshots".to_string(),
            ));
        }

        let path = self.diff_path(diff.from_snapshot, diff.to_snapshot);
        if path.exists() {
            let json = fs::read_to_string(&path)?;
            let existing: SnapshotDiff = serde_json::from_str(&json)?;
            tracing::debug!(
                diff_id = %existing.id,
                from = %diff.from_snapshot,
                to = %diff.to_snapshot,
                "Diff already stored for this pair, skipping"
            );
            return Ok(existing.id);
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_string_pretty(diff)?)?;

        tracing::debug!(
            diff_id = %diff.id,
            from = %diff.from_snapshot,
            to = %diff.to_snapshot,
            total_changes = diff.summary.total_changes(),
            "Diff saved"
        );

        Ok(diff.id)
    }

    async fn list_recent_diffs(&self, since: DateTime<Utc>) -> Result<Vec<SnapshotDiff>> {
        let mut results = Vec::new();
        collect_json_recursive(&self.diffs_dir(), &mut |path| {
            let json = fs::read_to_string(path)?;
            let diff: SnapshotDiff = serde_json::from_str(&json)?;
            if diff.timestamp >= since {
                results.push(diff);
            }
            Ok(())
        })?;

        results.sort_by_key(|d| (d.timestamp, d.id.0));
        Ok(results)
    }

    async fn delete(&self, id: SnapshotId) -> Result<()> {
        let path = self.find_snapshot_path(id)?;
        fs::remove_file(&path)?;
        tracing::debug!(snapshot_id = %id, "Snapshot deleted");
        Ok(())
    }
}

/// Recursively find a file by name.
fn find_file_recursive(dir: &Path, filename: &str) -> Option<PathBuf> {
    if !dir.is_dir() {
        return None;
    }

    let entries = fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            if let Some(found) = find_file_recursive(&path, filename) {
                return Some(found);
            }
        } else if path.file_name().and_then(|n| n.to_str()) == Some(filename) {
            return Some(path);
        }
    }

    None
}

/// Recursively visit every `.json` file under a directory.
fn collect_json_recursive(dir: &Path, visit: &mut dyn FnMut(&Path) -> Result<()>) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }

    let entries = fs::read_dir(dir)?;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect_json_recursive(&path, visit)?;
        } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
            visit(&path)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use vigil_core::types::{
        Device, DiffSummary, Port, PortState, Protocol, RiskLevel, ScanProfile, SnapshotMetadata,
    };

    fn device(ip: &str) -> Device {
        Device {
            ip: ip.parse().unwrap(),
            mac: None,
            hostname: None,
            vendor: None,
            os_info: None,
            ports: vec![Port {
                number: 22,
                protocol: Protocol::Tcp,
                state: PortState::Open,
                service_name: Some("ssh".to_string()),
                banner: None,
            }],
            services: vec![],
            last_seen: Utc::now(),
            is_active: true,
            risk_level: RiskLevel::Low,
        }
    }

    fn snapshot_at(hour: u32) -> NetworkSnapshot {
        NetworkSnapshot::assemble_at(
            vec![device("10.0.0.1"), device("10.0.0.2")],
            SnapshotMetadata {
                scan_duration_ms: 500,
                scan_type: ScanProfile::Discovery,
                errors: vec![],
            },
            Utc.with_ymd_and_hms(2026, 8, 4, hour, 0, 0).unwrap(),
        )
    }

    fn diff_between(a: &NetworkSnapshot, b: &NetworkSnapshot) -> SnapshotDiff {
        SnapshotDiff {
            id: DiffId::new(),
            from_snapshot: a.id,
            to_snapshot: b.id,
            timestamp: b.timestamp,
            summary: DiffSummary::default(),
            device_changes: vec![],
        }
    }

    async fn store() -> (tempfile::TempDir, FsSnapshotStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsSnapshotStore::new(dir.path());
        store.migrate().await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn save_and_retrieve() {
        let (_dir, store) = store().await;
        let snap = snapshot_at(9);
        let id = store.create(&snap).await.unwrap();

        let back = store.get_by_id(id).await.unwrap();
        assert_eq!(back, snap);
    }

    #[tokio::test]
    async fn get_missing_returns_not_found() {
        let (_dir, store) = store().await;
        let err = store.get_by_id(SnapshotId::new()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn create_is_idempotent_per_id() {
        let (_dir, store) = store().await;
        let snap = snapshot_at(9);
        store.create(&snap).await.unwrap();
        store.create(&snap).await.unwrap();

        let page = store
            .list(&SnapshotFilter::default(), Pagination::default())
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn latest_picks_newest_timestamp() {
        let (_dir, store) = store().await;
        let old = snapshot_at(8);
        let new = snapshot_at(15);
        store.create(&new).await.unwrap();
        store.create(&old).await.unwrap();

        let latest = store.get_latest().await.unwrap().unwrap();
        assert_eq!(latest.id, new.id);
    }

    #[tokio::test]
    async fn latest_is_none_when_empty() {
        let (_dir, store) = store().await;
        assert!(store.get_latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_filters_and_paginates() {
        let (_dir, store) = store().await;
        for hour in [6, 9, 12, 15] {
            store.create(&snapshot_at(hour)).await.unwrap();
        }

        let filter = SnapshotFilter {
            from: Some(Utc.with_ymd_and_hms(2026, 8, 4, 9, 0, 0).unwrap()),
            ..Default::default()
        };
        let page = store
            .list(
                &filter,
                Pagination {
                    offset: 0,
                    limit: 2,
                },
            )
            .await
            .unwrap();

        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 2);
        // Newest first.
        assert!(page.items[0].timestamp > page.items[1].timestamp);
    }

    #[tokio::test]
    async fn list_filters_by_min_devices() {
        let (_dir, store) = store().await;
        store.create(&snapshot_at(9)).await.unwrap();

        let filter = SnapshotFilter {
            min_devices: Some(10),
            ..Default::default()
        };
        let page = store
            .list(&filter, Pagination::default())
            .await
            .unwrap();
        assert_eq!(page.total, 0);
    }

    #[tokio::test]
    async fn duplicate_diff_is_a_no_op() {
        let (_dir, store) = store().await;
        let a = snapshot_at(9);
        let b = snapshot_at(10);
        let first = diff_between(&a, &b);
        let id = store.create_diff(&first).await.unwrap();

        // A second submission for the same pair keeps the stored record.
        let second = diff_between(&a, &b);
        let again = store.create_diff(&second).await.unwrap();
        assert_eq!(id, again);

        let diffs = store
            .list_recent_diffs(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap())
            .await
            .unwrap();
        assert_eq!(diffs.len(), 1);
    }

    #[tokio::test]
    async fn self_pair_diff_is_rejected() {
        let (_dir, store) = store().await;
        let a = snapshot_at(9);
        let diff = diff_between(&a, &a);
        let err = store.create_diff(&diff).await.unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[tokio::test]
    async fn recent_diffs_are_ascending_and_windowed() {
        let (_dir, store) = store().await;
        let s = [snapshot_at(8), snapshot_at(10), snapshot_at(12)];
        store.create_diff(&diff_between(&s[0], &s[1])).await.unwrap();
        store.create_diff(&diff_between(&s[1], &s[2])).await.unwrap();

        let since = s[1].timestamp - Duration::minutes(1);
        let diffs = store.list_recent_diffs(since).await.unwrap();
        assert_eq!(diffs.len(), 2);
        assert!(diffs[0].timestamp <= diffs[1].timestamp);

        let none = store
            .list_recent_diffs(s[2].timestamp + Duration::minutes(1))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn tampered_snapshot_fails_integrity_on_read() {
        let (_dir, store) = store().await;
        let snap = snapshot_at(9);
        store.create(&snap).await.unwrap();

        let path = store.find_snapshot_path(snap.id).unwrap();
        let mut tampered: NetworkSnapshot =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        tampered.devices[0].hostname = Some("imposter".to_string());
        fs::write(&path, serde_json::to_string_pretty(&tampered).unwrap()).unwrap();

        let err = store.get_by_id(snap.id).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(_)));
    }

    #[tokio::test]
    async fn delete_removes_snapshot() {
        let (_dir, store) = store().await;
        let snap = snapshot_at(9);
        store.create(&snap).await.unwrap();
        store.delete(snap.id).await.unwrap();

        let err = store.get_by_id(snap.id).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn migrate_rejects_newer_schema() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsSnapshotStore::new(dir.path());
        fs::write(dir.path().join("schema.json"), r#"{"version": 99}"#).unwrap();

        let err = store.migrate().await.unwrap_err();
        assert!(matches!(err, StoreError::Schema { found: 99, .. }));
    }

    #[tokio::test]
    async fn probe_fails_before_migrate() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsSnapshotStore::new(dir.path());
        assert!(matches!(
            store.probe().await.unwrap_err(),
            StoreError::Unavailable(_)
        ));

        store.migrate().await.unwrap();
        store.probe().await.unwrap();
    }
}
