//! Serialized Open vSwitch CLI surface.
//!
//! OVS tolerates concurrent callers, but inventory-style edits
//! (`--id=@x create ...`) must not interleave, so every `ovs-vsctl` and
//! `ovs-ofctl` invocation in the process goes through one [`Ovs`] handle
//! holding a single command lock. Each invocation is bounded by
//! [`OVS_TIMEOUT`].

use std::sync::Arc;

use pkg_constants::network::{OVS_TIMEOUT, TRUNK_VLAN};
use pkg_shell::{run_timeout, Output, Process, ShellError};
use tokio::sync::Mutex;

pub struct Ovs {
    shell: Arc<Process>,
    lock: Mutex<()>,
}

impl Ovs {
    pub fn new(shell: Arc<Process>) -> Self {
        Self {
            shell,
            lock: Mutex::new(()),
        }
    }

    async fn vsctl(&self, args: &[&str]) -> Result<Output, ShellError> {
        let _guard = self.lock.lock().await;
        run_timeout(&self.shell.resolve("ovs"), args, OVS_TIMEOUT).await
    }

    /// Create a bridge. Returns `true` if OVS did not know it yet; an
    /// existing bridge is not an error, only `false`.
    pub async fn add_bridge(&self, bridge: &str) -> Result<bool, ShellError> {
        match self.vsctl(&["add-br", bridge]).await {
            Ok(_) => Ok(true),
            Err(ShellError::AlreadyExists) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn del_bridge(&self, bridge: &str) -> Result<(), ShellError> {
        self.vsctl(&["del-br", bridge]).await.map(|_| ())
    }

    /// Attach a port. Non-sentinel VLANs become an OVS `tag=`; the trunk
    /// sentinel attaches untagged. Host taps are realized as OVS internal
    /// ports so the kernel materializes the interface for us.
    pub async fn add_port(
        &self,
        bridge: &str,
        port: &str,
        vlan: i32,
        host: bool,
    ) -> Result<(), ShellError> {
        let tag = format!("tag={}", vlan);
        let mut args = vec!["add-port", bridge, port];
        if vlan != TRUNK_VLAN {
            args.push(&tag);
        }
        if host {
            args.extend_from_slice(&["--", "set", "Interface", port, "type=internal"]);
        }
        self.vsctl(&args).await.map(|_| ())
    }

    pub async fn del_port(&self, bridge: &str, port: &str) -> Result<(), ShellError> {
        self.vsctl(&["del-port", bridge, port]).await.map(|_| ())
    }

    /// Attach a VXLAN/GRE tunnel interface in one transaction.
    pub async fn add_tunnel_port(
        &self,
        bridge: &str,
        port: &str,
        kind: &str,
        remote_ip: &str,
    ) -> Result<(), ShellError> {
        let ty = format!("type={}", kind);
        let remote = format!("options:remote_ip={}", remote_ip);
        self.vsctl(&[
            "add-port", bridge, port, "--", "set", "interface", port, &ty, &remote,
        ])
        .await
        .map(|_| ())
    }

    /// Create a select-all mirror on the bridge, sinking into `port`.
    pub async fn create_mirror(&self, bridge: &str, port: &str) -> Result<(), ShellError> {
        self.vsctl(&[
            "--",
            "--id=@p",
            "get",
            "port",
            port,
            "--",
            "--id=@m",
            "create",
            "mirror",
            "name=m0",
            "select-all=true",
            "output-port=@p",
            "--",
            "set",
            "bridge",
            bridge,
            "mirrors=@m",
        ])
        .await
        .map(|_| ())
    }

    pub async fn clear_mirrors(&self, bridge: &str) -> Result<(), ShellError> {
        self.vsctl(&["clear", "bridge", bridge, "mirrors"])
            .await
            .map(|_| ())
    }

    /// Point the bridge's NetFlow export at a local collector port.
    pub async fn set_netflow(
        &self,
        bridge: &str,
        port: u16,
        active_timeout: u32,
    ) -> Result<(), ShellError> {
        let targets = format!("targets=\"127.0.0.1:{}\"", port);
        let timeout = format!("active-timeout={}", active_timeout);
        self.vsctl(&[
            "--", "set", "Bridge", bridge, "netflow=@nf", "--", "--id=@nf", "create", "NetFlow",
            &targets, &timeout,
        ])
        .await
        .map(|_| ())
    }

    pub async fn clear_netflow(&self, bridge: &str) -> Result<(), ShellError> {
        self.vsctl(&["clear", "Bridge", bridge, "netflow"])
            .await
            .map(|_| ())
    }

    pub async fn set_netflow_timeout(
        &self,
        bridge: &str,
        active_timeout: u32,
    ) -> Result<(), ShellError> {
        let timeout = format!("active_timeout={}", active_timeout);
        self.vsctl(&["set", "NetFlow", bridge, &timeout])
            .await
            .map(|_| ())
    }

    /// Install an OpenFlow rule via `ovs-ofctl`. Shares the command lock
    /// with `ovs-vsctl` on purpose.
    pub async fn add_flow(&self, bridge: &str, filter: &str) -> Result<(), ShellError> {
        let _guard = self.lock.lock().await;
        run_timeout(
            &self.shell.resolve("openflow"),
            &["add-flow", bridge, filter],
            OVS_TIMEOUT,
        )
        .await
        .map(|_| ())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
