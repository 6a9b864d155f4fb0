//! External-tool invocation.
//!
//! megad drives the host through child processes: `ip`, `ovs-vsctl`,
//! `ovs-ofctl`, `qemu`, `dhclient`. This crate owns path resolution for
//! those tools and a wrapper that runs one with captured stdout/stderr,
//! translating the stderr surfaces callers are allowed to recover from
//! into a typed error.

use std::collections::HashMap;
use std::time::Duration;

use tokio::process::Command;
use tracing::debug;

/// stderr fragments that mean the device, port, or bridge is already
/// present on the host. `ip tuntap add` reports an existing tap as
/// "Device or resource busy"; `ovs-vsctl` spells it out.
const ALREADY_EXISTS_MARKERS: &[&str] = &["Device or resource busy", "already exists"];

/// Error surface of a single tool invocation.
#[derive(Debug, thiserror::Error)]
pub enum ShellError {
    /// The interface or bridge the tool was asked to create already
    /// exists. Callers may recover (tap re-bind, caller-named creation).
    #[error("already exists")]
    AlreadyExists,

    /// The binary could not be spawned at all.
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    /// The tool ran and exited non-zero.
    #[error("{tool}: {status}: {stderr}")]
    Failed {
        tool: String,
        status: String,
        stderr: String,
    },

    /// The tool exceeded its deadline.
    #[error("{tool}: timed out after {timeout:?}")]
    TimedOut { tool: String, timeout: Duration },
}

/// Captured output of a successful invocation.
#[derive(Debug, Clone, Default)]
pub struct Output {
    pub stdout: String,
    pub stderr: String,
}

/// Resolves logical tool names (`ip`, `ovs`, `qemu`, ...) to executable
/// paths. Every shell-out in megad goes through one of these so a single
/// command-line flag can redirect a tool fleet-wide.
#[derive(Debug, Clone, Default)]
pub struct Process {
    overrides: HashMap<String, String>,
}

impl Process {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the path used for a logical tool name.
    pub fn set(&mut self, name: &str, path: &str) {
        self.overrides.insert(name.to_string(), path.to_string());
    }

    /// Resolve a logical name to the path handed to the OS.
    pub fn resolve(&self, name: &str) -> String {
        if let Some(path) = self.overrides.get(name) {
            return path.clone();
        }
        match name {
            "ovs" => "ovs-vsctl".to_string(),
            "openflow" => "ovs-ofctl".to_string(),
            "qemu" => "qemu-system-x86_64".to_string(),
            "dhcp" => "dhclient".to_string(),
            // ip, kill, taskset, ... run under their own names
            other => other.to_string(),
        }
    }
}

/// Run a tool with captured stdout/stderr.
///
/// Known stderr surfaces are mapped to [`ShellError::AlreadyExists`]; any
/// other non-zero exit becomes [`ShellError::Failed`] wrapping the stderr
/// text.
pub async fn run(path: &str, args: &[&str]) -> Result<Output, ShellError> {
    debug!("[shell] {} {}", path, args.join(" "));

    let out = Command::new(path)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ShellError::Spawn {
            tool: path.to_string(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&out.stdout).to_string();
    let stderr = String::from_utf8_lossy(&out.stderr).to_string();

    if ALREADY_EXISTS_MARKERS.iter().any(|m| stderr.contains(m)) {
        return Err(ShellError::AlreadyExists);
    }
    if !out.status.success() {
        return Err(ShellError::Failed {
            tool: path.to_string(),
            status: out.status.to_string(),
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(Output { stdout, stderr })
}

/// Like [`run`], but bounded by a deadline. The child is killed if the
/// deadline passes.
pub async fn run_timeout(
    path: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<Output, ShellError> {
    match tokio::time::timeout(timeout, run(path, args)).await {
        Ok(res) => res,
        Err(_) => Err(ShellError::TimedOut {
            tool: path.to_string(),
            timeout,
        }),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
