//! Process-wide VM registry and operator surface.
//!
//! Owns the VM map, id assignment, the shared kill-ack fan-in, and the
//! global QEMU override table. Supervisor tasks are spawned from here and
//! reach back through an `Arc<VmRegistry>` for bridges, tool paths and
//! tuning.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use pkg_bridge::{BandwidthStats, Bridges};
use pkg_shell::Process;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::config::KvmConfig;
use crate::error::VmError;
use crate::info as vm_info;
use crate::kvm::{self, KvmVm};
use crate::overrides::QemuOverrides;
use crate::state::VmState;

/// Process-wide set of UUIDs with an active command-and-control client.
/// The agent feeding it is external; the `cc_active` info mask reads it.
#[derive(Debug, Clone, Default)]
pub struct CcClients {
    inner: Arc<DashMap<String, bool>>,
}

impl CcClients {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_active(&self, uuid: &str, active: bool) {
        self.inner.insert(uuid.to_string(), active);
    }

    pub fn is_active(&self, uuid: &str) -> bool {
        self.inner.get(uuid).map(|v| *v).unwrap_or(false)
    }
}

pub struct VmRegistry {
    pub(crate) bridges: Arc<Bridges>,
    pub(crate) shell: Arc<Process>,
    pub(crate) base: PathBuf,

    pub(crate) vms: Mutex<HashMap<usize, Arc<KvmVm>>>,
    next_id: AtomicUsize,
    next_hotplug: AtomicUsize,

    pub(crate) kill_ack_tx: mpsc::UnboundedSender<usize>,
    kill_ack_rx: Mutex<mpsc::UnboundedReceiver<usize>>,

    /// Hugepages mount path handed to every QEMU.
    pub(crate) hugepages: Option<String>,
    /// CPU set for `taskset` pinning of fresh QEMU processes.
    pub(crate) affinity: Option<String>,

    pub(crate) overrides: QemuOverrides,
    bandwidth: BandwidthStats,
    cc: CcClients,
}

impl VmRegistry {
    pub fn new(
        bridges: Arc<Bridges>,
        shell: Arc<Process>,
        base: PathBuf,
        hugepages: Option<String>,
        affinity: Option<String>,
    ) -> Arc<Self> {
        let (kill_ack_tx, kill_ack_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            bridges,
            shell,
            base,
            vms: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(0),
            next_hotplug: AtomicUsize::new(0),
            kill_ack_tx,
            kill_ack_rx: Mutex::new(kill_ack_rx),
            hugepages,
            affinity,
            overrides: QemuOverrides::new(),
            bandwidth: BandwidthStats::new(),
            cc: CcClients::new(),
        })
    }

    pub fn overrides(&self) -> &QemuOverrides {
        &self.overrides
    }

    pub fn bandwidth(&self) -> &BandwidthStats {
        &self.bandwidth
    }

    pub fn cc_clients(&self) -> &CcClients {
        &self.cc
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    // ─── Launch ──────────────────────────────────────────────────────────────

    /// Register a new VM with a deep copy of the given config and spawn
    /// its supervisor. The VM id lands on `ack` exactly once when the
    /// launch settles (running or failed).
    pub async fn launch(
        self: &Arc<Self>,
        name: &str,
        config: KvmConfig,
        ack: mpsc::UnboundedSender<usize>,
    ) -> Result<usize, VmError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let name = if name.is_empty() {
            format!("vm{}", id)
        } else {
            name.to_string()
        };

        let mut vms = self.vms.lock().await;
        if vms.values().any(|vm| vm.name() == name) {
            return Err(VmError::NameInUse(name));
        }

        let vm = Arc::new(KvmVm::new(id, &name, config, &self.base));
        vms.insert(id, vm.clone());
        drop(vms);

        tokio::spawn(kvm::launch(self.clone(), vm, ack));
        Ok(id)
    }

    // ─── Lookup ──────────────────────────────────────────────────────────────

    /// Resolve a VM by id or name.
    pub async fn lookup(&self, target: &str) -> Result<Arc<KvmVm>, VmError> {
        let vms = self.vms.lock().await;

        if let Ok(id) = target.parse::<usize>() {
            if let Some(vm) = vms.get(&id) {
                return Ok(vm.clone());
            }
        }
        vms.values()
            .find(|vm| vm.name() == target)
            .cloned()
            .ok_or_else(|| VmError::NotFound(target.to_string()))
    }

    /// All VMs, ordered by id.
    pub async fn list(&self) -> Vec<Arc<KvmVm>> {
        let vms = self.vms.lock().await;
        let mut list: Vec<_> = vms.values().cloned().collect();
        list.sort_by_key(|vm| vm.id());
        list
    }

    /// Drop QUIT/ERROR VMs from the registry. Their instance directories
    /// stay on disk for post-mortem inspection.
    pub async fn flush(&self) -> usize {
        let mut vms = self.vms.lock().await;
        let before = vms.len();
        vms.retain(|_, vm| {
            !matches!(vm.state(), VmState::Quit | VmState::Error)
        });
        before - vms.len()
    }

    // ─── Lifecycle ───────────────────────────────────────────────────────────

    /// Resume a paused/building VM, or relaunch one out of QUIT. A VM in
    /// any other state is left alone.
    pub async fn start(self: &Arc<Self>, target: &str) -> Result<(), VmError> {
        let vm = self.lookup(target).await?;

        let s = vm.state();
        if !s.can_start() {
            return Ok(());
        }

        if s == VmState::Quit {
            info!("[kvm] restarting vm: {}", vm.id());
            let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
            tokio::spawn(kvm::launch(self.clone(), vm.clone(), ack_tx));
            let acked = ack_rx.recv().await;
            debug!("[kvm] ack restarted vm {:?}", acked);
        }

        info!("[kvm] starting vm: {}", vm.id());
        let conn = vm.qmp().await.ok_or(VmError::QmpUnavailable(vm.id()))?;
        match conn.start().await {
            Ok(()) => {
                vm.set_state(VmState::Running);
                Ok(())
            }
            Err(e) => {
                vm.set_state(VmState::Error);
                Err(e.into())
            }
        }
    }

    /// Pause a running VM.
    pub async fn stop(&self, target: &str) -> Result<(), VmError> {
        let vm = self.lookup(target).await?;

        if vm.state() != VmState::Running {
            return Err(VmError::NotRunning(vm.id()));
        }

        info!("[kvm] stopping vm: {}", vm.id());
        let conn = vm.qmp().await.ok_or(VmError::QmpUnavailable(vm.id()))?;
        conn.stop().await?;
        vm.set_state(VmState::Paused);
        Ok(())
    }

    /// Signal a VM's supervisor to kill it. Completion is observed on
    /// [`VmRegistry::recv_kill_ack`].
    pub async fn kill(&self, target: &str) -> Result<usize, VmError> {
        let vm = self.lookup(target).await?;
        vm.kill()?;
        Ok(vm.id())
    }

    /// Next id off the shared kill-ack fan-in. Emitted once per kill,
    /// after the VM's network cleanup finished.
    pub async fn recv_kill_ack(&self) -> Option<usize> {
        let mut rx = self.kill_ack_rx.lock().await;
        rx.recv().await
    }

    // ─── Migration ───────────────────────────────────────────────────────────

    /// Stream guest state to a file under the base directory.
    pub async fn migrate(&self, target: &str, filename: &str) -> Result<(), VmError> {
        let vm = self.lookup(target).await?;
        let conn = vm.qmp().await.ok_or(VmError::QmpUnavailable(vm.id()))?;

        let path = if Path::new(filename).is_absolute() {
            PathBuf::from(filename)
        } else {
            self.base.join(filename)
        };
        conn.migrate_disk(&path.to_string_lossy()).await?;
        Ok(())
    }

    /// Migration progress: (status, completion in [0, 1]).
    pub async fn query_migrate(&self, target: &str) -> Result<(String, f64), VmError> {
        let vm = self.lookup(target).await?;
        let conn = vm.qmp().await.ok_or(VmError::QmpUnavailable(vm.id()))?;

        let r = conn.query_migrate().await?;
        parse_query_migrate(&r)
    }

    // ─── Hotplug ─────────────────────────────────────────────────────────────

    /// Attach a host file as a USB storage device. Returns the hotplug id.
    pub async fn hotplug_add(&self, target: &str, file: &str) -> Result<usize, VmError> {
        let vm = self.lookup(target).await?;
        let conn = vm.qmp().await.ok_or(VmError::QmpUnavailable(vm.id()))?;

        let hid = self.next_hotplug.fetch_add(1, Ordering::SeqCst);
        let name = format!("hotplug{}", hid);

        conn.drive_add(&name, file).await?;
        conn.usb_device_add(&name).await?;

        vm.inner.lock().unwrap().hotplug.insert(hid, file.to_string());
        Ok(hid)
    }

    pub async fn hotplug_remove(&self, target: &str, hid: usize) -> Result<(), VmError> {
        let vm = self.lookup(target).await?;

        if !vm.inner.lock().unwrap().hotplug.contains_key(&hid) {
            return Err(VmError::NoHotplug);
        }

        let conn = vm.qmp().await.ok_or(VmError::QmpUnavailable(vm.id()))?;
        let name = format!("hotplug{}", hid);

        let resp = conn.usb_device_del(&name).await?;
        debug!("[kvm] hotplug usb device del response: {}", resp);
        let resp = conn.drive_del(&name).await?;
        debug!("[kvm] hotplug drive del response: {}", resp);

        vm.inner.lock().unwrap().hotplug.remove(&hid);
        Ok(())
    }

    pub async fn hotplug_list(&self, target: &str) -> Result<Vec<(usize, String)>, VmError> {
        let vm = self.lookup(target).await?;
        let inner = vm.inner.lock().unwrap();
        Ok(inner.hotplug.iter().map(|(k, v)| (*k, v.clone())).collect())
    }

    // ─── Passthrough ─────────────────────────────────────────────────────────

    /// Raw QMP line straight to the guest's monitor socket.
    pub async fn qmp_raw(&self, target: &str, input: &str) -> Result<String, VmError> {
        let vm = self.lookup(target).await?;
        let conn = vm.qmp().await.ok_or(VmError::QmpUnavailable(vm.id()))?;
        Ok(conn.raw(input).await?)
    }

    // ─── Info ────────────────────────────────────────────────────────────────

    /// Tabular info over every VM, one column per mask.
    pub async fn info(&self, masks: &[String]) -> Result<String, VmError> {
        for mask in masks {
            if !vm_info::MASKS.contains(&mask.as_str()) {
                return Err(VmError::InvalidMask(mask.clone()));
            }
        }

        let mut rows: Vec<Vec<String>> = Vec::new();
        for vm in self.list().await {
            rows.push(vm_info::vm_info(&vm, masks, &self.bridges, &self.bandwidth, &self.cc).await?);
        }

        let header: Vec<String> = masks.to_vec();
        Ok(render_table(&header, &rows))
    }
}

/// Interpret a raw `query-migrate` response.
fn parse_query_migrate(r: &Value) -> Result<(String, f64), VmError> {
    let status = r
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| VmError::Migrate(format!("could not decode status: {}", r)))?
        .to_string();

    match status.as_str() {
        "completed" => Ok((status, 1.0)),
        "failed" => Ok((status, 0.0)),
        "active" => {
            let ram = r
                .get("ram")
                .and_then(Value::as_object)
                .ok_or_else(|| VmError::Migrate(format!("could not decode ram segment: {}", r)))?;
            let total = ram
                .get("total")
                .and_then(Value::as_f64)
                .ok_or_else(|| VmError::Migrate("ram segment missing total".to_string()))?;
            let transferred = ram
                .get("transferred")
                .and_then(Value::as_f64)
                .ok_or_else(|| VmError::Migrate("ram segment missing transferred".to_string()))?;

            if total == 0.0 {
                return Err(VmError::Migrate("zero total ram".to_string()));
            }
            Ok((status, transferred / total))
        }
        _ => Ok((status, 0.0)),
    }
}

/// Left-aligned columns sized to their widest cell.
fn render_table(header: &[String], rows: &[Vec<String>]) -> String {
    let mut widths: Vec<usize> = header.iter().map(String::len).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate() {
            if cell.len() > widths[i] {
                widths[i] = cell.len();
            }
        }
    }

    let render_row = |cells: &[String]| {
        cells
            .iter()
            .enumerate()
            .map(|(i, c)| format!("{:<width$}", c, width = widths[i]))
            .collect::<Vec<_>>()
            .join("  ")
            .trim_end()
            .to_string()
    };

    let mut out = render_row(header);
    out.push('\n');
    for row in rows {
        out.push_str(&render_row(row));
        out.push('\n');
    }
    out
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_migrate_completed_ignores_ram() {
        let r = json!({"status": "completed"});
        assert_eq!(parse_query_migrate(&r).unwrap(), ("completed".to_string(), 1.0));
    }

    #[test]
    fn test_query_migrate_failed_is_zero() {
        let r = json!({"status": "failed", "ram": {"total": 10.0, "transferred": 5.0}});
        assert_eq!(parse_query_migrate(&r).unwrap(), ("failed".to_string(), 0.0));
    }

    #[test]
    fn test_query_migrate_active_ratio() {
        let r = json!({"status": "active", "ram": {"total": 200.0, "transferred": 50.0}});
        let (status, completion) = parse_query_migrate(&r).unwrap();
        assert_eq!(status, "active");
        assert!((completion - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_query_migrate_active_needs_ram() {
        let r = json!({"status": "active"});
        assert!(matches!(
            parse_query_migrate(&r).unwrap_err(),
            VmError::Migrate(_)
        ));
    }

    #[test]
    fn test_query_migrate_zero_total_is_error() {
        let r = json!({"status": "active", "ram": {"total": 0.0, "transferred": 0.0}});
        assert!(matches!(
            parse_query_migrate(&r).unwrap_err(),
            VmError::Migrate(_)
        ));
    }

    #[test]
    fn test_render_table_alignment() {
        let header = vec!["id".to_string(), "name".to_string()];
        let rows = vec![
            vec!["0".to_string(), "vm0".to_string()],
            vec!["1".to_string(), "a-much-longer-name".to_string()],
        ];
        let table = render_table(&header, &rows);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("id"));
        assert!(lines[2].contains("a-much-longer-name"));
    }

    #[test]
    fn test_cc_clients_default_inactive() {
        let cc = CcClients::new();
        assert!(!cc.is_active("some-uuid"));
        cc.set_active("some-uuid", true);
        assert!(cc.is_active("some-uuid"));
    }

    // ─── Supervisor end-to-end (no real qemu/ovs) ───────────────────────────

    use crate::config::{is_valid_mac, NetConfig};
    use pkg_bridge::TapNames;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::UnixListener;

    /// Stand-in for QEMU: a process that lives until killed. `exec` so
    /// the script's pid IS the sleeping pid the supervisor kills.
    fn fake_qemu_script(dir: &Path) -> String {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join("fake-qemu.sh");
        std::fs::write(&path, "#!/bin/sh\nexec sleep 30\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().to_string()
    }

    /// Minimal QMP endpoint at the instance's socket path: greeting, then
    /// `{"return": {}}` to everything.
    fn fake_qmp(path: PathBuf) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let listener = UnixListener::bind(&path).unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let (read_half, mut w) = stream.into_split();
                    if w.write_all(b"{\"QMP\": {}}\n").await.is_err() {
                        return;
                    }
                    let mut lines = BufReader::new(read_half).lines();
                    while let Ok(Some(_)) = lines.next_line().await {
                        if w.write_all(b"{\"return\": {}}\n").await.is_err() {
                            return;
                        }
                    }
                });
            }
        });
    }

    fn scratch_registry(tag: &str) -> (Arc<VmRegistry>, PathBuf) {
        let base = PathBuf::from(format!("/tmp/megad-vmreg-test-{}", tag));
        let _ = std::fs::remove_dir_all(&base);
        std::fs::create_dir_all(base.join("net")).unwrap();

        let mut p = Process::new();
        for tool in ["ovs", "openflow", "ip", "dhcp"] {
            p.set(tool, "true");
        }
        p.set("qemu", &fake_qemu_script(&base));
        let shell = Arc::new(p);

        let names = TapNames::spawn_at(base.join("net"));
        let bridges = Arc::new(Bridges::new(shell.clone(), names, base.clone()));
        let reg = VmRegistry::new(bridges, shell, base.clone(), None, None);
        (reg, base)
    }

    fn one_nic_config(spec_mac: &str) -> KvmConfig {
        KvmConfig {
            networks: vec![NetConfig {
                bridge: String::new(),
                vlan: 1,
                mac: spec_mac.to_string(),
                driver: "e1000".to_string(),
                tap: String::new(),
            }],
            ..KvmConfig::default()
        }
    }

    #[tokio::test]
    async fn test_launch_then_kill_cleans_up() {
        let (reg, base) = scratch_registry("launchkill");
        // The first VM in a fresh registry gets id 0.
        fake_qmp(base.join("0").join("qmp"));

        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        let id = reg.launch("vm0", one_nic_config(""), ack_tx).await.unwrap();
        assert_eq!(id, 0);
        assert_eq!(ack_rx.recv().await, Some(0));

        let vm = reg.lookup("vm0").await.unwrap();
        assert_eq!(vm.state(), VmState::Building);

        // Preamble drew a locally-administered MAC and launch realized a
        // tap on the default bridge.
        let config = vm.config_snapshot();
        let mac = &config.networks[0].mac;
        assert!(is_valid_mac(mac), "bad mac: {}", mac);
        assert!(mac.starts_with("52:54:00:"));

        let tap = config.networks[0].tap.clone();
        assert!(tap.starts_with("mega_tap"), "bad tap: {}", tap);
        let bridge = reg.bridges.get("").await.unwrap();
        assert!(bridge.has_tap(&tap).await);

        // The durable state file tracks the state machine.
        let state_file = base.join("0").join("state");
        assert_eq!(std::fs::read_to_string(&state_file).unwrap(), "BUILDING");

        // Kill: exactly one ack on the shared channel, after cleanup.
        reg.kill("vm0").await.unwrap();
        assert_eq!(reg.recv_kill_ack().await, Some(0));
        assert_eq!(vm.state(), VmState::Quit);
        assert!(!bridge.has_tap(&tap).await);
        assert_eq!(std::fs::read_to_string(&state_file).unwrap(), "QUIT");

        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn test_duplicate_mac_within_vm_fails_preamble() {
        let (reg, base) = scratch_registry("dupmac");

        let config = KvmConfig {
            networks: vec![
                one_nic_config("13:37:13:37:00:00").networks.remove(0),
                one_nic_config("13:37:13:37:00:00").networks.remove(0),
            ],
            ..KvmConfig::default()
        };

        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        let id = reg.launch("vm0", config, ack_tx).await.unwrap();
        assert_eq!(ack_rx.recv().await, Some(id));

        let vm = reg.lookup("vm0").await.unwrap();
        assert_eq!(vm.state(), VmState::Error);
        // Rejected before any tap was realized.
        assert!(vm.config_snapshot().networks.iter().all(|n| n.tap.is_empty()));

        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn test_mac_conflict_across_vms_fails_preamble() {
        let (reg, base) = scratch_registry("macclash");
        fake_qmp(base.join("0").join("qmp"));

        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        reg.launch("vm1", one_nic_config("13:37:13:37:00:00"), ack_tx)
            .await
            .unwrap();
        assert_eq!(ack_rx.recv().await, Some(0));
        assert_eq!(reg.lookup("vm1").await.unwrap().state(), VmState::Building);

        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        reg.launch("vm2", one_nic_config("13:37:13:37:00:00"), ack_tx)
            .await
            .unwrap();
        assert_eq!(ack_rx.recv().await, Some(1));

        let vm2 = reg.lookup("vm2").await.unwrap();
        assert_eq!(vm2.state(), VmState::Error);
        assert!(vm2.config_snapshot().networks[0].tap.is_empty());

        reg.kill("vm1").await.unwrap();
        assert_eq!(reg.recv_kill_ack().await, Some(0));

        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn test_disk_conflict_fails_preamble() {
        let (reg, base) = scratch_registry("diskclash");
        fake_qmp(base.join("0").join("qmp"));

        let disk = base.join("disk.qcow2").to_string_lossy().to_string();
        let config_a = KvmConfig {
            disk_paths: vec![disk.clone()],
            ..KvmConfig::default()
        };

        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        reg.launch("vm-a", config_a, ack_tx).await.unwrap();
        assert_eq!(ack_rx.recv().await, Some(0));
        assert_eq!(reg.lookup("vm-a").await.unwrap().state(), VmState::Building);

        // Same persistent disk, any snapshot setting: rejected before
        // QEMU would spawn.
        for snapshot in [false, true] {
            let config_b = KvmConfig {
                disk_paths: vec![disk.clone()],
                snapshot,
                ..KvmConfig::default()
            };
            let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
            let id = reg
                .launch(&format!("vm-b-{}", snapshot), config_b, ack_tx)
                .await
                .unwrap();
            assert_eq!(ack_rx.recv().await, Some(id));
            let vm = reg.lookup(&id.to_string()).await.unwrap();
            assert_eq!(vm.state(), VmState::Error);
            assert!(vm.pid().is_none());
        }

        reg.kill("vm-a").await.unwrap();
        assert_eq!(reg.recv_kill_ack().await, Some(0));

        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn test_duplicate_name_is_rejected() {
        let (reg, base) = scratch_registry("dupname");
        fake_qmp(base.join("0").join("qmp"));

        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        reg.launch("vm0", KvmConfig::default(), ack_tx).await.unwrap();
        assert_eq!(ack_rx.recv().await, Some(0));

        let (ack_tx, _ack_rx) = mpsc::unbounded_channel();
        let err = reg.launch("vm0", KvmConfig::default(), ack_tx).await;
        assert!(matches!(err, Err(VmError::NameInUse(_))));

        reg.kill("0").await.unwrap();
        assert_eq!(reg.recv_kill_ack().await, Some(0));

        let _ = std::fs::remove_dir_all(&base);
    }

    #[tokio::test]
    async fn test_flush_drops_settled_vms() {
        let (reg, base) = scratch_registry("flush");

        // Launch with a duplicate-MAC config so the VM settles to ERROR
        // without ever touching qemu.
        let config = KvmConfig {
            networks: vec![
                one_nic_config("aa:aa:aa:aa:aa:01").networks.remove(0),
                one_nic_config("aa:aa:aa:aa:aa:01").networks.remove(0),
            ],
            ..KvmConfig::default()
        };
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
        reg.launch("vm0", config, ack_tx).await.unwrap();
        ack_rx.recv().await;

        assert_eq!(reg.list().await.len(), 1);
        assert_eq!(reg.flush().await, 1);
        assert!(reg.list().await.is_empty());
        assert!(matches!(
            reg.lookup("vm0").await.unwrap_err(),
            VmError::NotFound(_)
        ));

        let _ = std::fs::remove_dir_all(&base);
    }
}
