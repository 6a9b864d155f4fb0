//! Process-wide bridge registry.
//!
//! Maps bridge names to live [`Bridge`] handles, creating them on first
//! reference. Every successful creation rewrites the persisted inventory
//! file so external tools can see which bridges megad owns and which it
//! merely adopted. Lock order is always registry lock, then per-bridge
//! lock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use pkg_constants::network::DEFAULT_BRIDGE;
use pkg_constants::paths::BRIDGE_FILE;
use pkg_shell::Process;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::bridge::Bridge;
use crate::error::BridgeError;
use crate::names::TapNames;
use crate::netflow::Netflow;
use crate::ovs::Ovs;

pub struct Bridges {
    shell: Arc<Process>,
    ovs: Arc<Ovs>,
    names: TapNames,
    base: PathBuf,
    map: Mutex<HashMap<String, Arc<Bridge>>>,
}

impl Bridges {
    pub fn new(shell: Arc<Process>, names: TapNames, base: PathBuf) -> Self {
        let ovs = Arc::new(Ovs::new(shell.clone()));
        Self {
            shell,
            ovs,
            names,
            base,
            map: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn shell(&self) -> &Arc<Process> {
        &self.shell
    }

    /// Draw a fresh host interface name from the shared allocator.
    pub async fn take_tap_name(&self) -> String {
        self.names.take().await
    }

    /// Look up a bridge, creating it on first reference. The empty name
    /// resolves to the default bridge.
    pub async fn get(&self, name: &str) -> Result<Arc<Bridge>, BridgeError> {
        let name = if name.is_empty() { DEFAULT_BRIDGE } else { name };

        let mut map = self.map.lock().await;
        if let Some(b) = map.get(name) {
            return Ok(b.clone());
        }

        let bridge = Arc::new(
            Bridge::new(
                name,
                self.shell.clone(),
                self.ovs.clone(),
                self.names.clone(),
            )
            .await?,
        );
        map.insert(name.to_string(), bridge.clone());

        self.write_inventory(&map).await;

        Ok(bridge)
    }

    /// Names of all registered bridges, sorted.
    pub async fn enumerate(&self) -> Vec<String> {
        let map = self.map.lock().await;
        let mut names: Vec<String> = map.keys().cloned().collect();
        names.sort();
        names
    }

    /// Find the bridge a tap is attached to.
    pub async fn from_tap(&self, tap: &str) -> Result<Arc<Bridge>, BridgeError> {
        debug!("[bridges] looking for tap {}", tap);

        let bridges: Vec<Arc<Bridge>> = {
            let map = self.map.lock().await;
            map.values().cloned().collect()
        };

        for b in bridges {
            if b.has_tap(tap).await {
                debug!("[bridges] found tap {} on bridge {}", tap, b.name());
                return Ok(b);
            }
        }

        Err(BridgeError::TapNotFound(tap.to_string()))
    }

    /// The NetFlow collector bound to a named bridge.
    pub async fn netflow_from(&self, name: &str) -> Result<Netflow, BridgeError> {
        let bridge = {
            let map = self.map.lock().await;
            map.get(name)
                .cloned()
                .ok_or_else(|| BridgeError::NotFound(name.to_string()))?
        };

        bridge
            .netflow()
            .await
            .ok_or_else(|| BridgeError::NoNetflow(name.to_string()))
    }

    /// Tear down one bridge: destroy its taps, remove it from the
    /// registry, and delete it from OVS unless it pre-existed.
    pub async fn destroy(&self, name: &str) -> Result<(), BridgeError> {
        let bridge = {
            let map = self.map.lock().await;
            map.get(name)
                .cloned()
                .ok_or_else(|| BridgeError::NotFound(name.to_string()))?
        };

        // Per-tap failures are logged inside; the sweep continues.
        bridge.destroy_taps().await;

        let mut map = self.map.lock().await;
        if !bridge.pre_exist() {
            bridge.delete_from_ovs().await?;
        }
        map.remove(name);
        self.write_inventory(&map).await;

        Ok(())
    }

    /// Tear down every bridge and remove the inventory file. Errors are
    /// accumulated so one stuck bridge does not shadow the rest.
    pub async fn destroy_all(&self) -> Result<(), BridgeError> {
        let names = self.enumerate().await;

        let mut errs: Vec<String> = Vec::new();
        for name in names {
            if let Err(e) = self.destroy(&name).await {
                errs.push(e.to_string());
            }
        }

        let path = self.base.join(BRIDGE_FILE);
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!("[bridges] could not remove bridge file: {}", e);
            }
        }

        if errs.is_empty() {
            Ok(())
        } else {
            Err(BridgeError::Cleanup(errs.join(" : ")))
        }
    }

    /// Render the inventory table: name, adoption flag, active VLANs.
    pub async fn inventory(&self) -> String {
        let map = self.map.lock().await;
        self.render_inventory(&map).await
    }

    async fn render_inventory(&self, map: &HashMap<String, Arc<Bridge>>) -> String {
        if map.is_empty() {
            return String::new();
        }

        let mut names: Vec<&String> = map.keys().collect();
        names.sort();

        let mut out = format!(
            "{:<20} {:<22} {}\n",
            "Bridge", "Existed before megad", "Active VLANs"
        );
        for name in names {
            let b = &map[name];
            out.push_str(&format!(
                "{:<20} {:<22} {:?}\n",
                b.name(),
                b.pre_exist(),
                b.active_vlans().await
            ));
        }
        out
    }

    /// Rewrite the persisted inventory. Losing the inventory file means
    /// external tooling can no longer tell adopted bridges from owned
    /// ones, so a write failure is fatal for the process.
    async fn write_inventory(&self, map: &HashMap<String, Arc<Bridge>>) {
        let rendered = self.render_inventory(map).await;
        let path = self.base.join(BRIDGE_FILE);

        if let Err(e) = tokio::fs::write(&path, rendered).await {
            error!("[bridges] cannot write {}: {}", path.display(), e);
            std::process::exit(1);
        }
        info!("[bridges] inventory updated: {}", path.display());
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn null_shell() -> Arc<Process> {
        let mut p = Process::new();
        for tool in ["ovs", "openflow", "ip", "dhcp"] {
            p.set(tool, "true");
        }
        Arc::new(p)
    }

    fn scratch(tag: &str) -> PathBuf {
        let dir = PathBuf::from(format!("/tmp/megad-registry-test-{}", tag));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn registry(tag: &str) -> (Bridges, PathBuf) {
        let base = scratch(tag);
        let names = TapNames::spawn_at(base.join("net"));
        std::fs::create_dir_all(base.join("net")).unwrap();
        (Bridges::new(null_shell(), names, base.clone()), base)
    }

    #[tokio::test]
    async fn test_get_creates_and_persists() {
        let (bridges, base) = registry("create");

        let b = bridges.get("test_bridge").await.unwrap();
        assert_eq!(b.name(), "test_bridge");
        assert!(!b.pre_exist());

        let inventory = std::fs::read_to_string(base.join(BRIDGE_FILE)).unwrap();
        assert!(inventory.contains("test_bridge"));
        assert!(inventory.contains("false"));

        // Second get returns the same handle, no re-creation.
        let again = bridges.get("test_bridge").await.unwrap();
        assert!(Arc::ptr_eq(&b, &again));

        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn test_empty_name_is_default_bridge() {
        let (bridges, base) = registry("default");

        let b = bridges.get("").await.unwrap();
        assert_eq!(b.name(), DEFAULT_BRIDGE);
        assert_eq!(bridges.enumerate().await, vec![DEFAULT_BRIDGE.to_string()]);

        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn test_from_tap_scans_all_bridges() {
        let (bridges, base) = registry("fromtap");

        let a = bridges.get("br_a").await.unwrap();
        let b = bridges.get("br_b").await.unwrap();
        a.tap_add("mega_tap50", 1, false).await.unwrap();
        b.tap_add("mega_tap51", 2, false).await.unwrap();

        let found = bridges.from_tap("mega_tap51").await.unwrap();
        assert_eq!(found.name(), "br_b");

        assert!(matches!(
            bridges.from_tap("mega_tap99").await.unwrap_err(),
            BridgeError::TapNotFound(_)
        ));

        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn test_destroy_all_removes_inventory() {
        let (bridges, base) = registry("destroyall");

        let b = bridges.get("test_bridge").await.unwrap();
        b.tap_create(None, 3, false).await.unwrap();

        bridges.destroy_all().await.unwrap();
        assert!(bridges.enumerate().await.is_empty());
        assert!(!base.join(BRIDGE_FILE).exists());

        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn test_netflow_from_requires_collector() {
        let (bridges, base) = registry("nf");

        bridges.get("test_bridge").await.unwrap();
        assert!(matches!(
            bridges.netflow_from("test_bridge").await.unwrap_err(),
            BridgeError::NoNetflow(_)
        ));
        assert!(matches!(
            bridges.netflow_from("missing").await.unwrap_err(),
            BridgeError::NotFound(_)
        ));

        let b = bridges.get("test_bridge").await.unwrap();
        b.netflow_add(10).await.unwrap();
        assert!(bridges.netflow_from("test_bridge").await.is_ok());

        let _ = std::fs::remove_dir_all(&base);
    }
}
