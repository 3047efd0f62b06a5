//! Core domain types for the Vigil network inventory.
//!
//! These types describe what a scan discovered (devices, ports, services),
//! the immutable snapshots assembled from scan results, and the diff records
//! computed between consecutive snapshots.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ── Identifiers ───────────────────────────────────────────────────

/// Unique identifier for a network snapshot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SnapshotId(pub Uuid);

impl SnapshotId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SnapshotId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a snapshot diff.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct DiffId(pub Uuid);

impl DiffId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DiffId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DiffId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a scheduled or manual scan job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Inventory Types ───────────────────────────────────────────────

/// Transport protocol of a port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
    Other(String),
}

impl Protocol {
    pub fn parse(proto: &str) -> Self {
        match proto.to_lowercase().as_str() {
            "tcp" => Protocol::Tcp,
            "udp" => Protocol::Udp,
            other => Protocol::Other(other.to_string()),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
            Protocol::Other(p) => write!(f, "{p}"),
        }
    }
}

/// Observed state of a port.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PortState {
    Open,
    Closed,
    Filtered,
}

impl std::fmt::Display for PortState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortState::Open => write!(f, "open"),
            PortState::Closed => write!(f, "closed"),
            PortState::Filtered => write!(f, "filtered"),
        }
    }
}

/// A port on a device. `(number, protocol)` is unique per device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Port {
    pub number: u16,
    pub protocol: Protocol,
    pub state: PortState,
    pub service_name: Option<String>,
    pub banner: Option<String>,
}

impl Port {
    /// Identity key of this port within a device.
    pub fn key(&self) -> (u16, Protocol) {
        (self.number, self.protocol.clone())
    }
}

/// A service identified on a device, keyed by port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Service {
    pub port: u16,
    pub name: String,
    pub product: Option<String>,
    pub version: Option<String>,
    /// Identification confidence (0.0 – 1.0).
    pub confidence: f64,
}

/// Operating system fingerprint for a device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OsInfo {
    pub name: String,
    pub version: Option<String>,
}

/// Assessed risk level of a device.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Default for RiskLevel {
    fn default() -> Self {
        RiskLevel::Low
    }
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RiskLevel::Critical => write!(f, "critical"),
            RiskLevel::High => write!(f, "high"),
            RiskLevel::Medium => write!(f, "medium"),
            RiskLevel::Low => write!(f, "low"),
            RiskLevel::Info => write!(f, "info"),
        }
    }
}

/// A discovered network device. The IP address is the identity key:
/// unique within a snapshot, and the default join key when diffing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Device {
    pub ip: IpAddr,
    pub mac: Option<String>,
    pub hostname: Option<String>,
    pub vendor: Option<String>,
    pub os_info: Option<OsInfo>,
    pub ports: Vec<Port>,
    pub services: Vec<Service>,
    pub last_seen: DateTime<Utc>,
    pub is_active: bool,
    pub risk_level: RiskLevel,
}

// ── Scan Profiles ─────────────────────────────────────────────────

/// Named preset controlling scan depth and speed.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScanProfile {
    /// Host discovery only.
    Quick,
    /// Host discovery + common ports and service names.
    #[default]
    Discovery,
    /// Full port range, service versions, OS fingerprinting.
    Comprehensive,
}

impl std::fmt::Display for ScanProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanProfile::Quick => write!(f, "quick"),
            ScanProfile::Discovery => write!(f, "discovery"),
            ScanProfile::Comprehensive => write!(f, "comprehensive"),
        }
    }
}

// ── Snapshots ─────────────────────────────────────────────────────

/// Execution metadata recorded with a snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotMetadata {
    pub scan_duration_ms: u64,
    pub scan_type: ScanProfile,
    /// Non-fatal errors encountered while producing the snapshot
    /// (e.g. messages from retried scan attempts).
    pub errors: Vec<String>,
}

/// An immutable record of all discovered devices at one point in time.
///
/// Snapshots are created exactly once, via [`NetworkSnapshot::assemble`],
/// which sorts devices by IP, derives the counts, and computes the content
/// checksum. They are never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkSnapshot {
    pub id: SnapshotId,
    pub timestamp: DateTime<Utc>,
    pub device_count: u32,
    pub total_ports: u32,
    /// BLAKE3 hex digest of the device list, set at assembly.
    pub checksum: String,
    pub devices: Vec<Device>,
    pub metadata: SnapshotMetadata,
}

// ── Diffs ─────────────────────────────────────────────────────────

/// Classification of what changed about a device between two snapshots.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    DeviceJoined,
    DeviceLeft,
    DeviceChanged,
    DeviceInactive,
    PortOpened,
    PortClosed,
    ServiceChanged,
    OsChanged,
}

/// Kind of change to a single port.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PortChangeKind {
    Added,
    Removed,
    StateChanged,
}

/// A change to one `(number, protocol)` port pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortChange {
    pub port: u16,
    pub protocol: Protocol,
    pub change_type: PortChangeKind,
    pub from_state: Option<PortState>,
    pub to_state: Option<PortState>,
}

/// Kind of change to a single service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ServiceChangeKind {
    Added,
    Removed,
    Changed,
}

/// A change to the service observed on one port.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServiceChange {
    pub port: u16,
    pub change_type: ServiceChangeKind,
    pub from: Option<Service>,
    pub to: Option<Service>,
}

/// A change to a scalar device property (hostname, vendor, OS, …).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PropertyChange {
    pub field: String,
    pub from: Option<String>,
    pub to: Option<String>,
}

/// All changes detected for one device.
///
/// Unchanged devices produce no entry at all; `change_type` carries the
/// dominant classification while the detail lives in the change lists.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceDiff {
    pub device_ip: IpAddr,
    pub change_type: ChangeType,
    pub device_added: Option<Device>,
    pub device_removed: Option<Device>,
    pub port_changes: Vec<PortChange>,
    pub service_changes: Vec<ServiceChange>,
    pub property_changes: Vec<PropertyChange>,
}

/// Aggregate change counters for a diff.
///
/// The total is always derived from the five counters; it is never stored
/// or accepted from an external source.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DiffSummary {
    pub devices_added: u32,
    pub devices_removed: u32,
    pub devices_changed: u32,
    pub ports_changed: u32,
    pub services_changed: u32,
}

impl DiffSummary {
    /// Sum of all five counters.
    pub fn total_changes(&self) -> u32 {
        self.devices_added
            + self.devices_removed
            + self.devices_changed
            + self.ports_changed
            + self.services_changed
    }

    pub fn is_empty(&self) -> bool {
        self.total_changes() == 0
    }
}

/// Computed delta between two snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotDiff {
    pub id: DiffId,
    pub from_snapshot: SnapshotId,
    pub to_snapshot: SnapshotId,
    pub timestamp: DateTime<Utc>,
    pub summary: DiffSummary,
    /// Change-only entries, sorted by device IP ascending.
    pub device_changes: Vec<DeviceDiff>,
}

impl SnapshotDiff {
    pub fn is_empty(&self) -> bool {
        self.device_changes.is_empty()
    }
}

// ── Health & Metrics ──────────────────────────────────────────────

/// Health classification of a component or of the whole monitor.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ComponentState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health of one monitored component.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ComponentHealth {
    pub name: String,
    pub state: ComponentState,
    pub message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

/// Aggregate health, recomputed by the health-check loop. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthStatus {
    pub state: ComponentState,
    pub components: Vec<ComponentHealth>,
    pub checked_at: DateTime<Utc>,
}

/// Running counters maintained by the orchestrator. Never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct MonitoringMetrics {
    pub scans_completed: u64,
    pub scans_failed: u64,
    pub devices_discovered: u64,
    pub changes_detected: u64,
    pub significant_changes: u64,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub uptime_secs: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_parse_and_display() {
        assert_eq!(Protocol::parse("tcp"), Protocol::Tcp);
        assert_eq!(Protocol::parse("UDP"), Protocol::Udp);
        assert_eq!(Protocol::parse("sctp"), Protocol::Other("sctp".to_string()));
        assert_eq!(Protocol::Tcp.to_string(), "tcp");
    }

    #[test]
    fn change_type_serializes_snake_case() {
        let json = serde_json::to_string(&ChangeType::DeviceJoined).unwrap();
        assert_eq!(json, "\"device_joined\"");

        let json = serde_json::to_string(&ChangeType::PortOpened).unwrap();
        assert_eq!(json, "\"port_opened\"");
    }

    #[test]
    fn port_change_kind_serializes_lowercase() {
        let json = serde_json::to_string(&PortChangeKind::Added).unwrap();
        assert_eq!(json, "\"added\"");
        let json = serde_json::to_string(&PortChangeKind::StateChanged).unwrap();
        assert_eq!(json, "\"state_changed\"");
    }

    #[test]
    fn summary_total_is_derived() {
        let summary = DiffSummary {
            devices_added: 1,
            devices_removed: 2,
            devices_changed: 3,
            ports_changed: 4,
            services_changed: 5,
        };
        assert_eq!(summary.total_changes(), 15);
        assert!(!summary.is_empty());
        assert!(DiffSummary::default().is_empty());
    }

    #[test]
    fn device_serialization_roundtrip() {
        let device = Device {
            ip: "10.0.1.42".parse().unwrap(),
            mac: Some("aa:bb:cc:dd:ee:ff".to_string()),
            hostname: Some("web-01".to_string()),
            vendor: Some("Supermicro".to_string()),
            os_info: Some(OsInfo {
                name: "Linux".to_string(),
                version: Some("6.1".to_string()),
            }),
            ports: vec![Port {
                number: 443,
                protocol: Protocol::Tcp,
                state: PortState::Open,
                service_name: Some("https".to_string()),
                banner: None,
            }],
            services: vec![Service {
                port: 443,
                name: "https".to_string(),
                product: Some("nginx".to_string()),
                version: Some("1.24".to_string()),
                confidence: 0.9,
            }],
            last_seen: Utc::now(),
            is_active: true,
            risk_level: RiskLevel::Medium,
        };

        let json = serde_json::to_string(&device).unwrap();
        let back: Device = serde_json::from_str(&json).unwrap();
        assert_eq!(device, back);
    }
}
