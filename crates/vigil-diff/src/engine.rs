//! Change detection between two network snapshots.
//!
//! The engine compares device sets keyed by identity, then per matched
//! device compares port sets keyed by `(number, protocol)`, service sets
//! keyed by port, and the scalar properties. All comparisons run over
//! BTree-ordered keys and the output is sorted by IP, so recomputing a diff
//! yields byte-identical results.

use std::collections::{BTreeMap, BTreeSet};

use uuid::Uuid;

use vigil_core::types::{
    ChangeType, Device, DeviceDiff, DiffId, DiffSummary, NetworkSnapshot, Port, PortChange,
    PortChangeKind, PropertyChange, Protocol, Service, ServiceChange, ServiceChangeKind,
    SnapshotDiff,
};

/// Namespace for deterministic diff IDs derived from the snapshot pair.
const VIGIL_NS: Uuid = Uuid::from_bytes([
    0x6b, 0xa7, 0xb8, 0x11, 0x9d, 0xad, 0x11, 0xd1, 0x80, 0xb4, 0x00, 0xc0, 0x4f, 0xd4, 0x30, 0xc8,
]);

/// Which device field joins the two snapshots.
///
/// Under `Ip` (the default) a MAC change with a stable IP is a property
/// change. Under `Mac` devices are matched by MAC address, falling back to
/// the IP when a device has none, and an IP change with a stable MAC is a
/// property change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DeviceIdentity {
    #[default]
    Ip,
    Mac,
}

/// Tunables for a diff computation.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffOptions {
    pub identity: DeviceIdentity,
}

/// Compare two snapshots under the default options.
pub fn compute_diff(from: &NetworkSnapshot, to: &NetworkSnapshot) -> SnapshotDiff {
    compute_diff_with(from, to, &DiffOptions::default())
}

/// Compare two snapshots.
///
/// Total over structurally valid input: never errors, and `diff(S, S)` is
/// the empty diff. Devices unchanged in every dimension produce no entry.
pub fn compute_diff_with(
    from: &NetworkSnapshot,
    to: &NetworkSnapshot,
    options: &DiffOptions,
) -> SnapshotDiff {
    let from_map = index_devices(&from.devices, options.identity);
    let to_map = index_devices(&to.devices, options.identity);

    let mut device_changes = Vec::new();
    let mut summary = DiffSummary::default();

    for (key, to_dev) in &to_map {
        match from_map.get(key) {
            None => {
                summary.devices_added += 1;
                device_changes.push(joined(to_dev));
            }
            Some(from_dev) => {
                if let Some(diff) = diff_device(from_dev, to_dev) {
                    summary.devices_changed += 1;
                    summary.ports_changed += diff.port_changes.len() as u32;
                    summary.services_changed += diff.service_changes.len() as u32;
                    device_changes.push(diff);
                }
            }
        }
    }

    for (key, from_dev) in &from_map {
        if !to_map.contains_key(key) {
            summary.devices_removed += 1;
            device_changes.push(left(from_dev));
        }
    }

    device_changes.sort_by_key(|c| c.device_ip);

    SnapshotDiff {
        id: diff_id(from, to),
        from_snapshot: from.id,
        to_snapshot: to.id,
        timestamp: to.timestamp,
        summary,
        device_changes,
    }
}

/// Deterministic diff ID: the same ordered snapshot pair always maps to the
/// same ID, so recomputation is stable and storage stays idempotent.
fn diff_id(from: &NetworkSnapshot, to: &NetworkSnapshot) -> DiffId {
    DiffId(Uuid::new_v5(
        &VIGIL_NS,
        format!("diff:{}:{}", from.id, to.id).as_bytes(),
    ))
}

fn index_devices(devices: &[Device], identity: DeviceIdentity) -> BTreeMap<String, &Device> {
    devices
        .iter()
        .map(|d| (device_key(d, identity), d))
        .collect()
}

fn device_key(device: &Device, identity: DeviceIdentity) -> String {
    match identity {
        DeviceIdentity::Ip => device.ip.to_string(),
        DeviceIdentity::Mac => device
            .mac
            .as_ref()
            .map(|m| m.to_lowercase())
            .unwrap_or_else(|| device.ip.to_string()),
    }
}

fn joined(device: &Device) -> DeviceDiff {
    DeviceDiff {
        device_ip: device.ip,
        change_type: ChangeType::DeviceJoined,
        device_added: Some(device.clone()),
        device_removed: None,
        port_changes: vec![],
        service_changes: vec![],
        property_changes: vec![],
    }
}

fn left(device: &Device) -> DeviceDiff {
    DeviceDiff {
        device_ip: device.ip,
        change_type: ChangeType::DeviceLeft,
        device_added: None,
        device_removed: Some(device.clone()),
        port_changes: vec![],
        service_changes: vec![],
        property_changes: vec![],
    }
}

/// Compare one device present in both snapshots. Returns `None` when
/// nothing changed in any dimension.
fn diff_device(from: &Device, to: &Device) -> Option<DeviceDiff> {
    let port_changes = diff_ports(&from.ports, &to.ports);
    let service_changes = diff_services(&from.services, &to.services);
    let property_changes = diff_properties(from, to);

    if port_changes.is_empty() && service_changes.is_empty() && property_changes.is_empty() {
        return None;
    }

    let change_type = classify(from, to, &port_changes, &service_changes);

    Some(DeviceDiff {
        device_ip: to.ip,
        change_type,
        device_added: None,
        device_removed: None,
        port_changes,
        service_changes,
        property_changes,
    })
}

/// Dominant classification for a changed device. The full detail stays in
/// the change lists; precedence: inactive > os > ports > services > rest.
fn classify(
    from: &Device,
    to: &Device,
    port_changes: &[PortChange],
    service_changes: &[ServiceChange],
) -> ChangeType {
    if from.is_active && !to.is_active {
        ChangeType::DeviceInactive
    } else if from.os_info != to.os_info {
        ChangeType::OsChanged
    } else if port_changes
        .iter()
        .any(|c| c.change_type == PortChangeKind::Added)
    {
        ChangeType::PortOpened
    } else if port_changes
        .iter()
        .any(|c| c.change_type == PortChangeKind::Removed)
    {
        ChangeType::PortClosed
    } else if !service_changes.is_empty() {
        ChangeType::ServiceChanged
    } else {
        ChangeType::DeviceChanged
    }
}

fn diff_ports(from: &[Port], to: &[Port]) -> Vec<PortChange> {
    let from_map: BTreeMap<(u16, Protocol), &Port> = from.iter().map(|p| (p.key(), p)).collect();
    let to_map: BTreeMap<(u16, Protocol), &Port> = to.iter().map(|p| (p.key(), p)).collect();

    let keys: BTreeSet<&(u16, Protocol)> = from_map.keys().chain(to_map.keys()).collect();

    let mut changes = Vec::new();
    for key in keys {
        match (from_map.get(key), to_map.get(key)) {
            (None, Some(p)) => changes.push(PortChange {
                port: p.number,
                protocol: p.protocol.clone(),
                change_type: PortChangeKind::Added,
                from_state: None,
                to_state: Some(p.state),
            }),
            (Some(p), None) => changes.push(PortChange {
                port: p.number,
                protocol: p.protocol.clone(),
                change_type: PortChangeKind::Removed,
                from_state: Some(p.state),
                to_state: None,
            }),
            (Some(a), Some(b)) if a.state != b.state => changes.push(PortChange {
                port: b.number,
                protocol: b.protocol.clone(),
                change_type: PortChangeKind::StateChanged,
                from_state: Some(a.state),
                to_state: Some(b.state),
            }),
            _ => {}
        }
    }
    changes
}

fn diff_services(from: &[Service], to: &[Service]) -> Vec<ServiceChange> {
    let from_map: BTreeMap<u16, &Service> = from.iter().map(|s| (s.port, s)).collect();
    let to_map: BTreeMap<u16, &Service> = to.iter().map(|s| (s.port, s)).collect();

    let keys: BTreeSet<&u16> = from_map.keys().chain(to_map.keys()).collect();

    let mut changes = Vec::new();
    for key in keys {
        match (from_map.get(key), to_map.get(key)) {
            (None, Some(s)) => changes.push(ServiceChange {
                port: s.port,
                change_type: ServiceChangeKind::Added,
                from: None,
                to: Some((*s).clone()),
            }),
            (Some(s), None) => changes.push(ServiceChange {
                port: s.port,
                change_type: ServiceChangeKind::Removed,
                from: Some((*s).clone()),
                to: None,
            }),
            (Some(a), Some(b)) if a != b => changes.push(ServiceChange {
                port: b.port,
                change_type: ServiceChangeKind::Changed,
                from: Some((*a).clone()),
                to: Some((*b).clone()),
            }),
            _ => {}
        }
    }
    changes
}

fn diff_properties(from: &Device, to: &Device) -> Vec<PropertyChange> {
    let mut changes = Vec::new();

    push_changed(&mut changes, "ip", Some(from.ip.to_string()), Some(to.ip.to_string()));
    push_changed(&mut changes, "mac", from.mac.clone(), to.mac.clone());
    push_changed(
        &mut changes,
        "hostname",
        from.hostname.clone(),
        to.hostname.clone(),
    );
    push_changed(&mut changes, "vendor", from.vendor.clone(), to.vendor.clone());
    push_changed(
        &mut changes,
        "os",
        from.os_info.as_ref().map(|o| o.name.clone()),
        to.os_info.as_ref().map(|o| o.name.clone()),
    );
    push_changed(
        &mut changes,
        "os_version",
        from.os_info.as_ref().and_then(|o| o.version.clone()),
        to.os_info.as_ref().and_then(|o| o.version.clone()),
    );
    push_changed(
        &mut changes,
        "risk_level",
        Some(from.risk_level.to_string()),
        Some(to.risk_level.to_string()),
    );
    push_changed(
        &mut changes,
        "is_active",
        Some(from.is_active.to_string()),
        Some(to.is_active.to_string()),
    );

    changes
}

fn push_changed(
    changes: &mut Vec<PropertyChange>,
    field: &str,
    from: Option<String>,
    to: Option<String>,
) {
    if from != to {
        changes.push(PropertyChange {
            field: field.to_string(),
            from,
            to,
        });
    }
}
