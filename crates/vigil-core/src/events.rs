//! Event types for the notification stream.
//!
//! The orchestrator publishes these on a broadcast channel consumed at the
//! API boundary by notification collaborators. Delivery is fire-and-forget:
//! a lagging or absent subscriber never fails the monitoring pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{DiffId, JobId, ScanProfile, SnapshotId};

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// An event emitted by the monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorEvent {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl MonitorEvent {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: EventId::new(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// The event payload, tagged by type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum EventPayload {
    /// A scan execution began.
    ScanStarted {
        job_id: JobId,
        target: String,
        profile: ScanProfile,
    },
    /// A scan exhausted its retries and was marked failed.
    ScanFailed {
        job_id: JobId,
        target: String,
        error: String,
        attempts: u32,
    },
    /// A completed snapshot was persisted.
    SnapshotRecorded {
        snapshot_id: SnapshotId,
        device_count: u32,
        total_ports: u32,
        scan_duration_ms: u64,
    },
    /// A diff crossed the configured alerting threshold.
    SignificantChange {
        diff_id: DiffId,
        from_snapshot: SnapshotId,
        to_snapshot: SnapshotId,
        total_changes: u32,
        threshold: u32,
    },
}
