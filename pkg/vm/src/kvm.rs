//! Per-VM KVM supervisor.
//!
//! [`KvmVm`] is the passive record: identity, deep-copied config, runtime
//! state, the QMP handle and the kill rendezvous. The active part is
//! [`launch`], one task per launch attempt that validates the VM against
//! the fleet, realizes its taps, spawns QEMU, dials QMP and then parks on
//! wait-vs-kill. Whatever path the launch takes, network cleanup runs
//! before the task exits — a VM that reached QUIT or ERROR never leaves a
//! tap behind.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use pkg_constants::vm::{QMP_CONNECT_DELAY, QMP_CONNECT_RETRY};
use pkg_qmp::Conn;
use pkg_shell::Process;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{random_mac, KvmConfig};
use crate::error::VmError;
use crate::qemu;
use crate::registry::VmRegistry;
use crate::state::VmState;

const SIGKILL: i32 = 9;

pub(crate) struct VmInner {
    pub state: VmState,
    pub config: KvmConfig,
    pub pid: Option<u32>,
    pub hotplug: BTreeMap<usize, String>,
    pub tags: BTreeMap<String, String>,
}

/// One KVM instance.
pub struct KvmVm {
    id: usize,
    name: String,
    instance_path: PathBuf,
    pub(crate) inner: StdMutex<VmInner>,
    qmp: Mutex<Option<Arc<Conn>>>,
    kill_tx: mpsc::Sender<()>,
    pub(crate) kill_rx: Mutex<mpsc::Receiver<()>>,
}

impl KvmVm {
    pub(crate) fn new(id: usize, name: &str, config: KvmConfig, base: &Path) -> Self {
        // Rendezvous kill channel: a second kill while one is pending is
        // a caller error, surfaced as KillPending instead of a deadlock.
        let (kill_tx, kill_rx) = mpsc::channel(1);

        Self {
            id,
            name: name.to_string(),
            instance_path: base.join(id.to_string()),
            inner: StdMutex::new(VmInner {
                state: VmState::Building,
                config,
                pid: None,
                hotplug: BTreeMap::new(),
                tags: BTreeMap::new(),
            }),
            qmp: Mutex::new(None),
            kill_tx,
            kill_rx: Mutex::new(kill_rx),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instance_path(&self) -> &Path {
        &self.instance_path
    }

    pub fn qmp_path(&self) -> PathBuf {
        self.instance_path.join("qmp")
    }

    pub fn state(&self) -> VmState {
        self.inner.lock().unwrap().state
    }

    /// Update the state and mirror its string form into the `state` file,
    /// the durable record external tools watch.
    pub fn set_state(&self, s: VmState) {
        let mut inner = self.inner.lock().unwrap();
        inner.state = s;

        let path = self.instance_path.join("state");
        if let Err(e) = std::fs::write(&path, s.to_string()) {
            error!("[kvm] write instance state file: {}", e);
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().unwrap().pid
    }

    pub(crate) fn set_pid(&self, pid: Option<u32>) {
        self.inner.lock().unwrap().pid = pid;
    }

    pub fn config_snapshot(&self) -> KvmConfig {
        self.inner.lock().unwrap().config.clone()
    }

    pub(crate) fn with_config_mut<R>(&self, f: impl FnOnce(&mut KvmConfig) -> R) -> R {
        let mut inner = self.inner.lock().unwrap();
        f(&mut inner.config)
    }

    pub fn set_tag(&self, key: &str, value: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.tags.insert(key.to_string(), value.to_string());
    }

    pub fn tags(&self) -> BTreeMap<String, String> {
        self.inner.lock().unwrap().tags.clone()
    }

    pub async fn qmp(&self) -> Option<Arc<Conn>> {
        self.qmp.lock().await.clone()
    }

    pub(crate) async fn set_qmp(&self, conn: Option<Arc<Conn>>) {
        *self.qmp.lock().await = conn;
    }

    /// Signal the supervisor to kill this VM. Returns immediately; the
    /// caller observes completion on the registry's kill-ack channel.
    pub fn kill(&self) -> Result<(), VmError> {
        self.kill_tx
            .try_send(())
            .map_err(|_| VmError::KillPending(self.id))
    }
}

impl std::fmt::Debug for KvmVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvmVm")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

/// Full launch flow for one VM. Emits the VM id on `ack` exactly once.
pub(crate) async fn launch(
    reg: Arc<VmRegistry>,
    vm: Arc<KvmVm>,
    ack: mpsc::UnboundedSender<usize>,
) {
    info!("[kvm] launching vm: {}", vm.id());

    // A relaunch out of QUIT skips the preamble; its resources are still
    // accounted to this VM.
    if vm.state() != VmState::Quit && !launch_preamble(&reg, &vm, &ack).await {
        return;
    }

    vm.set_state(VmState::Building);

    // Instance metadata for post-mortem inspection.
    let config_text = vm.config_snapshot().to_table();
    if let Err(e) = tokio::fs::write(vm.instance_path().join("config"), config_text).await {
        error!("[kvm] write instance config file: {}", e);
        return abort_launch(&reg, &vm, &ack).await;
    }
    if let Err(e) = tokio::fs::write(vm.instance_path().join("name"), vm.name()).await {
        error!("[kvm] write instance name file: {}", e);
        return abort_launch(&reg, &vm, &ack).await;
    }

    // Clear stale tap names; we may have come out of QUIT.
    vm.with_config_mut(|c| {
        for net in &mut c.networks {
            net.tap.clear();
        }
    });

    // Realize every interface as a fresh tap on its bridge.
    let networks = vm.config_snapshot().networks;
    for (i, net) in networks.iter().enumerate() {
        let bridge = match reg.bridges.get(&net.bridge).await {
            Ok(b) => b,
            Err(e) => {
                error!("[kvm] get bridge: {}", e);
                return abort_launch(&reg, &vm, &ack).await;
            }
        };

        match bridge.tap_create(None, net.vlan, false).await {
            Ok(tap) => vm.with_config_mut(|c| c.networks[i].tap = tap),
            Err(e) => {
                error!("[kvm] create tap: {}", e);
                return abort_launch(&reg, &vm, &ack).await;
            }
        }
    }

    let config = vm.config_snapshot();

    if !config.networks.is_empty() {
        let taps: Vec<&str> = config.networks.iter().map(|n| n.tap.as_str()).collect();
        if let Err(e) =
            tokio::fs::write(vm.instance_path().join("taps"), taps.join("\n")).await
        {
            error!("[kvm] write instance taps file: {}", e);
            return abort_launch(&reg, &vm, &ack).await;
        }
    }

    let mut args = qemu::build_args(
        vm.id(),
        &config,
        vm.instance_path(),
        reg.hugepages.as_deref(),
    );
    args = reg.overrides.apply(&args);
    debug!("[kvm] final qemu args: {:?}", args);

    // This is a real launch, not a preview: register every MAC with its
    // bridge's IP learner.
    for net in &config.networks {
        match reg.bridges.get(&net.bridge).await {
            Ok(b) => {
                if let Some(iml) = b.learner() {
                    iml.add_mac(&net.mac);
                }
            }
            Err(e) => error!("[kvm] get bridge: {}", e),
        }
    }

    let mut child = match spawn_qemu(&reg.shell, &args, vm.instance_path()) {
        Ok(child) => child,
        Err(e) => {
            error!("[kvm] start qemu: {}", e);
            return abort_launch(&reg, &vm, &ack).await;
        }
    };

    let pid = child.id();
    vm.set_pid(pid);
    debug!("[kvm] vm {} has pid {:?}", vm.id(), pid);

    check_affinity(&reg, pid).await;

    // Reaper: QUIT on any exit, upgraded to ERROR unless we SIGKILLed it.
    let (wait_tx, mut wait_rx) = mpsc::channel::<usize>(1);
    let reaper_vm = vm.clone();
    tokio::spawn(async move {
        let status = child.wait().await;
        reaper_vm.set_state(VmState::Quit);
        match status {
            Ok(status) => {
                use std::os::unix::process::ExitStatusExt;
                if !status.success() && status.signal() != Some(SIGKILL) {
                    error!("[kvm] qemu for vm {} exited: {}", reaper_vm.id(), status);
                    reaper_vm.set_state(VmState::Error);
                }
            }
            Err(e) => {
                error!("[kvm] reap qemu for vm {}: {}", reaper_vm.id(), e);
                reaper_vm.set_state(VmState::Error);
            }
        }
        let _ = wait_tx.send(reaper_vm.id()).await;
    });

    // Once QEMU is running we must reap it before leaving, whatever else
    // fails; only then does cleanup run.
    let mut send_kill_ack = false;

    let qmp_path = vm.qmp_path();
    match Conn::dial_retry(
        &qmp_path,
        QMP_CONNECT_RETRY,
        Duration::from_millis(QMP_CONNECT_DELAY),
    )
    .await
    {
        Err(e) => {
            error!("[kvm] vm {} failed to connect to qmp: {}", vm.id(), e);
            vm.set_state(VmState::Error);
            kill_pid(&reg.shell, pid).await;
            let _ = wait_rx.recv().await;
            let _ = ack.send(vm.id());
        }
        Ok(conn) => {
            let conn = Arc::new(conn);
            vm.set_qmp(Some(conn.clone())).await;

            // Drain async QMP events (VNC connects, shutdown notices, ...)
            // into the log for the lifetime of the connection.
            let event_vm_id = vm.id();
            let event_conn = conn.clone();
            tokio::spawn(async move {
                while let Some(event) = event_conn.event().await {
                    info!(
                        "[kvm] vm {} received asynchronous message: {}",
                        event_vm_id, event
                    );
                }
            });

            let _ = ack.send(vm.id());

            let mut kill_rx = vm.kill_rx.lock().await;
            tokio::select! {
                _ = wait_rx.recv() => {
                    info!("[kvm] vm {} exited", vm.id());
                }
                _ = kill_rx.recv() => {
                    info!("[kvm] killing vm {}", vm.id());
                    kill_pid(&reg.shell, pid).await;
                    let _ = wait_rx.recv().await;
                    // Ack the kill only after cleanup below.
                    send_kill_ack = true;
                }
            }
            drop(kill_rx);

            vm.set_qmp(None).await;
        }
    }

    cleanup_taps(&reg, &vm).await;

    if send_kill_ack {
        let _ = reg.kill_ack_tx.send(vm.id());
    }
}

/// Fleet-wide conflict validation, run under the registry lock. On
/// rejection the VM is set to ERROR and acked; the launch does not
/// proceed.
async fn launch_preamble(
    reg: &VmRegistry,
    vm: &KvmVm,
    ack: &mpsc::UnboundedSender<usize>,
) -> bool {
    let vms = reg.vms.lock().await;

    if let Err(e) = tokio::fs::create_dir_all(vm.instance_path()).await {
        error!(
            "[kvm] cannot create instance path {}: {}",
            vm.instance_path().display(),
            e
        );
        drop(vms);
        vm.set_state(VmState::Error);
        let _ = ack.send(vm.id());
        return false;
    }

    // Fleet views over every other BUILDING/RUNNING/PAUSED VM.
    let mut macs_other: HashSet<String> = HashSet::new();
    let mut disks_snapshot: HashSet<String> = HashSet::new();
    let mut disks_persistent: HashSet<String> = HashSet::new();

    for (other_id, other) in vms.iter() {
        if *other_id == vm.id() {
            continue;
        }
        let inner = other.inner.lock().unwrap();
        if !inner.state.is_active() {
            continue;
        }
        for net in &inner.config.networks {
            macs_other.insert(net.mac.clone());
        }
        for disk in &inner.config.disk_paths {
            if inner.config.snapshot {
                disks_snapshot.insert(disk.clone());
            } else {
                disks_persistent.insert(disk.clone());
            }
        }
    }

    // Validate and complete our own config.
    let failure: Option<String> = {
        let mut inner = vm.inner.lock().unwrap();

        if inner.config.uuid.is_empty() {
            inner.config.uuid = Uuid::new_v4().to_string();
        }

        let mut macs_self: HashSet<String> = HashSet::new();
        let mut failure = None;

        for net in &inner.config.networks {
            if net.mac.is_empty() {
                continue;
            }
            if !macs_self.insert(net.mac.clone()) {
                failure = Some(
                    "cannot specify the same mac address for two interfaces".to_string(),
                );
                break;
            }
            if macs_other.contains(&net.mac) {
                failure = Some(format!(
                    "mac address {} is already in use by another vm",
                    net.mac
                ));
                break;
            }
        }

        if failure.is_none() {
            // Draw random locally-administered MACs for the rest, re-drawing
            // on any collision with the fleet or ourselves.
            for net in &mut inner.config.networks {
                if !net.mac.is_empty() {
                    continue;
                }
                let mut mac = random_mac();
                while macs_other.contains(&mac) || macs_self.contains(&mac) {
                    mac = random_mac();
                }
                macs_self.insert(mac.clone());
                net.mac = mac;
            }

            for disk in &inner.config.disk_paths {
                let persistent_clash = disks_persistent.contains(disk);
                let snapshot_clash = !inner.config.snapshot && disks_snapshot.contains(disk);
                if persistent_clash || snapshot_clash {
                    failure =
                        Some(format!("disk path {} is already in use by another vm", disk));
                    break;
                }
            }
        }

        failure
    };

    if let Some(reason) = failure {
        error!("[kvm] vm {}: {}", vm.id(), reason);
        drop(vms);
        vm.set_state(VmState::Error);
        let _ = ack.send(vm.id());
        return false;
    }

    true
}

/// Launch failed before the event loop: flag the error, tear down any
/// taps already realized, ack.
async fn abort_launch(reg: &VmRegistry, vm: &KvmVm, ack: &mpsc::UnboundedSender<usize>) {
    vm.set_state(VmState::Error);
    cleanup_taps(reg, vm).await;
    let _ = ack.send(vm.id());
}

/// Destroy every tap this VM realized, best-effort across all of them.
async fn cleanup_taps(reg: &VmRegistry, vm: &KvmVm) {
    let networks = vm.config_snapshot().networks;
    for net in &networks {
        if net.tap.is_empty() {
            continue;
        }
        match reg.bridges.get(&net.bridge).await {
            Err(e) => error!("[kvm] get bridge: {}", e),
            Ok(b) => {
                if let Err(e) = b.tap_destroy(&net.tap).await {
                    info!("[kvm] cleanup: could not destroy tap {}: {}", net.tap, e);
                }
            }
        }
    }
}

fn spawn_qemu(
    shell: &Process,
    args: &[String],
    instance_path: &Path,
) -> std::io::Result<tokio::process::Child> {
    let log = std::fs::File::create(instance_path.join("qemu.log"))?;
    let log_err = log.try_clone()?;

    tokio::process::Command::new(shell.resolve("qemu"))
        .args(args)
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err))
        .kill_on_drop(true)
        .spawn()
}

/// SIGKILL the QEMU process; the reaper sees `signal: killed` and leaves
/// the state at QUIT.
async fn kill_pid(shell: &Process, pid: Option<u32>) {
    let Some(pid) = pid else { return };
    if let Err(e) = pkg_shell::run(&shell.resolve("kill"), &["-9", &pid.to_string()]).await {
        warn!("[kvm] kill {}: {}", pid, e);
    }
}

/// Pin a fresh QEMU process to the configured CPU set. Failure is logged,
/// never fatal for the launch.
async fn check_affinity(reg: &VmRegistry, pid: Option<u32>) {
    let (Some(cpus), Some(pid)) = (reg.affinity.as_deref(), pid) else {
        return;
    };
    if let Err(e) = pkg_shell::run(
        &reg.shell.resolve("taskset"),
        &["-cp", cpus, &pid.to_string()],
    )
    .await
    {
        warn!("[kvm] taskset {}: {}", pid, e);
    }
}
