//! Host-side taps.
//!
//! A host tap is an OVS internal port on a bridge, brought up promiscuous
//! on the host so the operator can reach the VLAN directly. It may carry
//! no address, a DHCP lease, or a static CIDR.

use crate::error::BridgeError;
use crate::link;
use crate::registry::Bridges;

/// Wildcard accepted by [`delete`] to sweep every host tap.
pub const WILDCARD: &str = "*";

/// Create a host tap on a bridge. `ip` is `none`, `dhcp`, or a static
/// CIDR. With no name, one is drawn from the allocator; a caller-supplied
/// name is assumed to be a device the caller owns.
pub async fn create(
    bridges: &Bridges,
    bridge: &str,
    ip: &str,
    name: Option<&str>,
    vlan: i32,
) -> Result<String, BridgeError> {
    let b = bridges.get(bridge).await?;

    let tap = match name {
        Some(n) => n.to_string(),
        None => bridges.take_tap_name().await,
    };

    b.tap_add(&tap, vlan, true).await?;

    if let Err(e) = finish(bridges, &tap, ip).await {
        // Roll back self-allocated taps; leave caller-supplied ones.
        if name.is_none() {
            if let Err(rm_err) = b.tap_remove(&tap).await {
                tracing::error!("[hosttap] defunct tap {}: {}", tap, rm_err);
            }
        }
        return Err(e);
    }

    Ok(tap)
}

async fn finish(bridges: &Bridges, tap: &str, ip: &str) -> Result<(), BridgeError> {
    let shell = bridges.shell();
    link::up(shell, tap, true).await?;

    match ip.to_lowercase().as_str() {
        "none" => {}
        "dhcp" => {
            tracing::debug!("[hosttap] obtaining dhcp on tap {}", tap);
            link::dhcp(shell, tap).await?;
        }
        cidr => {
            tracing::debug!("[hosttap] setting ip on tap {}", tap);
            link::addr_add(shell, tap, cidr).await?;
        }
    }
    Ok(())
}

/// Delete a host tap by name, or every host tap with the wildcard.
/// Deleting a non-host tap by name is refused; the wildcard sweep simply
/// skips guest taps.
pub async fn delete(bridges: &Bridges, tap: &str) -> Result<(), BridgeError> {
    if tap == WILDCARD {
        for name in bridges.enumerate().await {
            let b = match bridges.get(&name).await {
                Ok(b) => b,
                Err(e) => {
                    tracing::error!("[hosttap] {}", e);
                    continue;
                }
            };
            for (tap_name, tap_info) in b.taps().await {
                if tap_info.host {
                    if let Err(e) = b.host_tap_delete(&tap_name).await {
                        tracing::info!("[hosttap] could not delete {}: {}", tap_name, e);
                    }
                }
            }
        }
        return Ok(());
    }

    let b = bridges.from_tap(tap).await?;
    let is_host = b
        .taps()
        .await
        .iter()
        .any(|(name, info)| name == tap && info.host);
    if !is_host {
        return Err(BridgeError::NotHostTap);
    }

    b.host_tap_delete(tap).await
}

/// Tabular listing of host taps: (bridge, tap, vlan).
pub async fn list(bridges: &Bridges) -> Vec<(String, String, i32)> {
    let mut rows = Vec::new();
    for name in bridges.enumerate().await {
        if let Ok(b) = bridges.get(&name).await {
            for (tap, info) in b.taps().await {
                if info.host {
                    rows.push((name.clone(), tap, info.vlan));
                }
            }
        }
    }
    rows
}

// ─── Tests ───────────────────────────────────────────────────────────────────
