//! Snapshot assembly and content hashing.
//!
//! A snapshot is assembled exactly once from a scan's device list: devices
//! are sorted by IP (duplicate addresses collapse, last entry wins), the
//! counts are derived, and a BLAKE3 checksum of the device list is computed.
//! The checksum lets the store detect tampering or corruption on read.

use std::collections::BTreeMap;
use std::net::IpAddr;

use chrono::Utc;

use crate::types::{Device, NetworkSnapshot, SnapshotId, SnapshotMetadata};

/// Compute the BLAKE3 hex digest of a device list.
///
/// Callers must pass the list already in snapshot order (sorted by IP);
/// [`NetworkSnapshot::assemble`] guarantees this.
pub fn compute_checksum(devices: &[Device]) -> String {
    let json = serde_json::to_vec(devices).expect("device list serialization cannot fail");
    blake3::hash(&json).to_hex().to_string()
}

impl NetworkSnapshot {
    /// Assemble an immutable snapshot from a scan's device list.
    pub fn assemble(devices: Vec<Device>, metadata: SnapshotMetadata) -> Self {
        Self::assemble_at(devices, metadata, Utc::now())
    }

    /// Assemble with an explicit timestamp.
    pub fn assemble_at(
        devices: Vec<Device>,
        metadata: SnapshotMetadata,
        timestamp: chrono::DateTime<Utc>,
    ) -> Self {
        let mut by_ip: BTreeMap<IpAddr, Device> = BTreeMap::new();
        for device in devices {
            by_ip.insert(device.ip, device);
        }
        let devices: Vec<Device> = by_ip.into_values().collect();

        let total_ports = devices.iter().map(|d| d.ports.len() as u32).sum();
        let checksum = compute_checksum(&devices);

        Self {
            id: SnapshotId::new(),
            timestamp,
            device_count: devices.len() as u32,
            total_ports,
            checksum,
            devices,
            metadata,
        }
    }

    /// Verify that the stored checksum matches a freshly computed one.
    pub fn verify_integrity(&self) -> bool {
        self.checksum == compute_checksum(&self.devices)
    }
}
