//! Orchestrator pipeline and lifecycle tests with a scripted scanner and
//! the in-memory store.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};

use vigil_core::events::{EventPayload, MonitorEvent};
use vigil_core::types::{
    ComponentState, Device, Port, PortState, Protocol, RiskLevel, ScanProfile, SnapshotId,
};
use vigil_core::VigilError;
use vigil_monitor::config::{MonitorConfig, TargetSchedule};
use vigil_monitor::orchestrator::{LifecycleState, Orchestrator};
use vigil_monitor::scanner::{ScanError, Scanner};
use vigil_monitor::target::ScanTarget;
use vigil_store::{MemorySnapshotStore, Pagination, SnapshotFilter};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Returns one scripted device list per scan, then empty lists.
struct ScriptedScanner {
    runs: Mutex<VecDeque<Vec<Device>>>,
}

impl ScriptedScanner {
    fn new(runs: Vec<Vec<Device>>) -> Self {
        Self {
            runs: Mutex::new(runs.into()),
        }
    }
}

#[async_trait]
impl Scanner for ScriptedScanner {
    async fn scan(
        &self,
        _target: &ScanTarget,
        _profile: ScanProfile,
        _timeout: Duration,
    ) -> Result<Vec<Device>, ScanError> {
        let mut runs = self.runs.lock().unwrap();
        Ok(runs.pop_front().unwrap_or_default())
    }
}

fn device(ip: &str, ports: &[u16]) -> Device {
    Device {
        ip: ip.parse().unwrap(),
        mac: None,
        hostname: None,
        vendor: None,
        os_info: None,
        ports: ports
            .iter()
            .map(|&number| Port {
                number,
                protocol: Protocol::Tcp,
                state: PortState::Open,
                service_name: None,
                banner: None,
            })
            .collect(),
        services: vec![],
        last_seen: Utc::now(),
        is_active: true,
        risk_level: RiskLevel::Low,
    }
}

fn config() -> MonitorConfig {
    MonitorConfig {
        significant_change_threshold: 0,
        health_interval_secs: 1,
        min_interval_secs: 1,
        max_retries: 1,
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 50,
        shutdown_grace_secs: 2,
        storage_failure_threshold: 3,
        storage_reset_timeout_secs: 5,
        ..Default::default()
    }
}

async fn wait_for_recorded(events: &mut broadcast::Receiver<MonitorEvent>, id: SnapshotId) {
    loop {
        let event = timeout(Duration::from_secs(60), events.recv())
            .await
            .expect("timed out waiting for SnapshotRecorded")
            .unwrap();
        if let EventPayload::SnapshotRecorded { snapshot_id, .. } = event.payload {
            if snapshot_id == id {
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn scan_pipeline_persists_snapshots_and_diffs() {
    let store = Arc::new(MemorySnapshotStore::new());
    let scanner = Arc::new(ScriptedScanner::new(vec![
        vec![device("10.0.0.1", &[22])],
        vec![device("10.0.0.1", &[22, 80]), device("10.0.0.2", &[443])],
    ]));
    let orch = Orchestrator::new(config(), scanner, store.clone());
    let mut events = orch.subscribe();
    orch.start().await.unwrap();

    let first = orch
        .trigger_manual_scan(Some("10.0.0.0/24"), None, None)
        .await
        .unwrap();
    wait_for_recorded(&mut events, first.id).await;

    let second = orch
        .trigger_manual_scan(Some("10.0.0.0/24"), None, None)
        .await
        .unwrap();
    wait_for_recorded(&mut events, second.id).await;

    let latest = orch.get_latest_snapshot().await.unwrap().unwrap();
    assert_eq!(latest.id, second.id);

    let page = orch
        .list_snapshots(SnapshotFilter::default(), Pagination::default())
        .await
        .unwrap();
    assert_eq!(page.total, 2);

    let changes = orch.get_recent_changes(24).await.unwrap();
    assert_eq!(changes.len(), 1);
    let diff = &changes[0];
    assert_eq!(diff.from_snapshot, first.id);
    assert_eq!(diff.to_snapshot, second.id);
    assert_eq!(diff.summary.devices_added, 1);
    assert_eq!(diff.summary.devices_changed, 1);
    assert_eq!(diff.summary.ports_changed, 1);

    // Threshold 0: any non-empty diff raises the significant-change signal.
    let significant = loop {
        let event = timeout(Duration::from_secs(60), events.recv())
            .await
            .expect("timed out waiting for SignificantChange")
            .unwrap();
        if let EventPayload::SignificantChange { total_changes, .. } = event.payload {
            break total_changes;
        }
    };
    assert_eq!(significant, 3);

    let metrics = orch.get_metrics();
    assert_eq!(metrics.scans_completed, 2);
    assert_eq!(metrics.devices_discovered, 3);
    assert_eq!(metrics.changes_detected, 3);
    assert_eq!(metrics.significant_changes, 1);
    assert!(metrics.last_scan_at.is_some());

    orch.stop().await.unwrap();
    assert_eq!(orch.state(), LifecycleState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn lifecycle_guards_reject_wrong_states() {
    let store = Arc::new(MemorySnapshotStore::new());
    let orch = Orchestrator::new(config(), Arc::new(ScriptedScanner::new(vec![])), store);

    let err = orch
        .trigger_manual_scan(Some("10.0.0.1"), None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, VigilError::WrongState { .. }));

    orch.start().await.unwrap();
    assert_eq!(orch.state(), LifecycleState::Running);
    assert!(matches!(
        orch.start().await.unwrap_err(),
        VigilError::WrongState { .. }
    ));

    // No range given and no targets configured.
    let err = orch.trigger_manual_scan(None, None, None).await.unwrap_err();
    assert!(matches!(err, VigilError::Validation(_)));

    orch.stop().await.unwrap();
    orch.stop().await.unwrap();
    assert_eq!(orch.state(), LifecycleState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn failed_startup_enters_error_state_and_restart_recovers() {
    let store = Arc::new(MemorySnapshotStore::new());
    store.set_available(false);
    let orch = Orchestrator::new(
        config(),
        Arc::new(ScriptedScanner::new(vec![])),
        store.clone(),
    );

    let err = orch.start().await.unwrap_err();
    assert!(matches!(err, VigilError::Infrastructure(_)));
    assert_eq!(orch.state(), LifecycleState::Error);

    store.set_available(true);
    orch.restart().await.unwrap();
    assert_eq!(orch.state(), LifecycleState::Running);

    orch.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn storage_outage_degrades_health_without_stopping() {
    let store = Arc::new(MemorySnapshotStore::new());
    let orch = Orchestrator::new(
        config(),
        Arc::new(ScriptedScanner::new(vec![])),
        store.clone(),
    );
    orch.start().await.unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(orch.get_health().state, ComponentState::Healthy);

    store.set_available(false);
    tokio::time::sleep(Duration::from_secs(2)).await;
    let health = orch.get_health();
    assert_eq!(health.state, ComponentState::Degraded);
    assert!(health
        .components
        .iter()
        .any(|c| c.name == "storage" && c.state == ComponentState::Unhealthy));
    assert_eq!(orch.state(), LifecycleState::Running);

    store.set_available(true);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(orch.get_health().state, ComponentState::Healthy);

    orch.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn compare_snapshots_by_id() {
    let store = Arc::new(MemorySnapshotStore::new());
    let scanner = Arc::new(ScriptedScanner::new(vec![
        vec![device("10.0.0.1", &[22])],
        vec![device("10.0.0.1", &[22]), device("10.0.0.9", &[443])],
    ]));
    let orch = Orchestrator::new(config(), scanner, store);
    let mut events = orch.subscribe();
    orch.start().await.unwrap();

    let first = orch
        .trigger_manual_scan(Some("10.0.0.0/24"), None, None)
        .await
        .unwrap();
    wait_for_recorded(&mut events, first.id).await;
    let second = orch
        .trigger_manual_scan(Some("10.0.0.0/24"), None, None)
        .await
        .unwrap();
    wait_for_recorded(&mut events, second.id).await;

    let diff = orch.compare_snapshots(first.id, second.id).await.unwrap();
    assert_eq!(diff.summary.devices_added, 1);
    assert_eq!(diff.summary.devices_removed, 0);

    let reverse = orch.compare_snapshots(second.id, first.id).await.unwrap();
    assert_eq!(reverse.summary.devices_removed, 1);

    let self_diff = orch.compare_snapshots(first.id, first.id).await.unwrap();
    assert!(self_diff.is_empty());

    let err = orch
        .compare_snapshots(first.id, SnapshotId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, VigilError::NotFound { .. }));

    orch.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn threshold_gates_the_significant_change_signal() {
    let mut cfg = config();
    cfg.significant_change_threshold = 100;

    let store = Arc::new(MemorySnapshotStore::new());
    let scanner = Arc::new(ScriptedScanner::new(vec![
        vec![device("10.0.0.1", &[22])],
        vec![device("10.0.0.2", &[22])],
    ]));
    let orch = Orchestrator::new(cfg, scanner, store);
    let mut events = orch.subscribe();
    orch.start().await.unwrap();

    let first = orch
        .trigger_manual_scan(Some("10.0.0.0/24"), None, None)
        .await
        .unwrap();
    wait_for_recorded(&mut events, first.id).await;
    let second = orch
        .trigger_manual_scan(Some("10.0.0.0/24"), None, None)
        .await
        .unwrap();
    wait_for_recorded(&mut events, second.id).await;

    // Changes happened but stayed under the threshold.
    let metrics = orch.get_metrics();
    assert_eq!(metrics.changes_detected, 2);
    assert_eq!(metrics.significant_changes, 0);

    orch.stop().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn configured_targets_scan_on_schedule() {
    let mut cfg = config();
    cfg.targets = vec![TargetSchedule {
        range: "10.0.0.0/24".to_string(),
        name: Some("lan".to_string()),
        profile: Some(ScanProfile::Quick),
        interval_secs: 60,
        enabled: true,
    }];

    let store = Arc::new(MemorySnapshotStore::new());
    let scanner = Arc::new(ScriptedScanner::new(vec![vec![device("10.0.0.1", &[22])]]));
    let orch = Orchestrator::new(cfg, scanner, store);
    let mut events = orch.subscribe();
    orch.start().await.unwrap();

    // The first occurrence dispatches without any manual trigger.
    loop {
        let event = timeout(Duration::from_secs(120), events.recv())
            .await
            .expect("configured target never scanned")
            .unwrap();
        if let EventPayload::SnapshotRecorded { device_count, .. } = event.payload {
            assert_eq!(device_count, 1);
            break;
        }
    }

    orch.stop().await.unwrap();
}
