//! Read-only tabular queries over VMs.

use pkg_bridge::{BandwidthStats, Bridges};
use pkg_constants::network::{DEFAULT_BRIDGE, DISCONNECTED_VLAN};

use crate::error::VmError;
use crate::kvm::KvmVm;
use crate::registry::CcClients;

/// Every mask `vm info` understands, in canonical order.
pub const MASKS: &[&str] = &[
    "id", "name", "memory", "vcpus", "state", "migrate", "disk", "snapshot", "initrd", "kernel",
    "cdrom", "append", "bridge", "tap", "mac", "bandwidth", "tags", "ip", "ip6", "vlan", "uuid",
    "cc_active", "type",
];

fn list(items: Vec<String>) -> String {
    format!("[{}]", items.join(", "))
}

/// One row of `vm info` for one VM.
pub async fn vm_info(
    vm: &KvmVm,
    masks: &[String],
    bridges: &Bridges,
    bandwidth: &BandwidthStats,
    cc: &CcClients,
) -> Result<Vec<String>, VmError> {
    let config = vm.config_snapshot();
    let display_bridge = |name: &str| {
        if name.is_empty() {
            DEFAULT_BRIDGE.to_string()
        } else {
            name.to_string()
        }
    };

    let mut row = Vec::with_capacity(masks.len());
    for mask in masks {
        let value = match mask.as_str() {
            "id" => vm.id().to_string(),
            "name" => vm.name().to_string(),
            "memory" => config.memory_mb.to_string(),
            "vcpus" => config.vcpus.to_string(),
            "state" => vm.state().to_string(),
            "migrate" => config.migrate_path.clone().unwrap_or_default(),
            "disk" => format!("{:?}", config.disk_paths),
            "snapshot" => config.snapshot.to_string(),
            "initrd" => config.initrd_path.clone().unwrap_or_default(),
            "kernel" => config.kernel_path.clone().unwrap_or_default(),
            "cdrom" => config.cdrom_path.clone().unwrap_or_default(),
            "append" => config.append.clone(),
            "bridge" => list(
                config
                    .networks
                    .iter()
                    .map(|n| display_bridge(&n.bridge))
                    .collect(),
            ),
            "tap" => list(config.networks.iter().map(|n| n.tap.clone()).collect()),
            "mac" => list(config.networks.iter().map(|n| n.mac.clone()).collect()),
            "bandwidth" => {
                let stats: Vec<String> = config
                    .networks
                    .iter()
                    .map(|n| match bandwidth.get(&n.tap) {
                        Some((rx, tx)) => format!("{:.1}/{:.1}", rx, tx),
                        None => "0.0/0.0".to_string(),
                    })
                    .collect();
                list(stats)
            }
            "tags" => {
                let tags: Vec<String> = vm
                    .tags()
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect();
                list(tags)
            }
            "ip" => {
                let mut ips = Vec::new();
                for net in &config.networks {
                    if let Ok(b) = bridges.get(&net.bridge).await {
                        if let Some(entry) =
                            b.learner().and_then(|iml| iml.ip_from_mac(&net.mac))
                        {
                            if let Some(ip) = entry.v4 {
                                ips.push(ip);
                            }
                        }
                    }
                }
                list(ips)
            }
            "ip6" => {
                let mut ips = Vec::new();
                for net in &config.networks {
                    if let Ok(b) = bridges.get(&net.bridge).await {
                        if let Some(entry) =
                            b.learner().and_then(|iml| iml.ip_from_mac(&net.mac))
                        {
                            if let Some(ip) = entry.v6 {
                                ips.push(ip);
                            }
                        }
                    }
                }
                list(ips)
            }
            "vlan" => {
                let vlans: Vec<String> = config
                    .networks
                    .iter()
                    .map(|n| {
                        if n.vlan == DISCONNECTED_VLAN {
                            "disconnected".to_string()
                        } else {
                            n.vlan.to_string()
                        }
                    })
                    .collect();
                list(vlans)
            }
            "uuid" => config.uuid.clone(),
            "cc_active" => cc.is_active(&config.uuid).to_string(),
            "type" => "kvm".to_string(),
            other => return Err(VmError::InvalidMask(other.to_string())),
        };
        row.push(value);
    }

    Ok(row)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
