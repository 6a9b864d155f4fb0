//! Filesystem path constants.
//!
//! Everything megad persists lives under one base directory (overridable on
//! the command line). Per-instance files are derived at the usage site:
//!
//! - `<base>/bridges`       — human-readable bridge inventory
//! - `<base>/<id>/config`   — rendered VM configuration
//! - `<base>/<id>/state`    — durable VM state string
//! - `<base>/<id>/qmp`      — QMP UNIX socket

/// Default base directory for inventory and per-instance state.
pub const DEFAULT_BASE: &str = "/tmp/megad";

/// Where the kernel exposes host network interfaces.
pub const SYS_CLASS_NET: &str = "/sys/class/net";

/// File name of the persisted bridge inventory under the base directory.
pub const BRIDGE_FILE: &str = "bridges";
