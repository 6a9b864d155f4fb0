use pkg_shell::ShellError;

/// Error surface of the bridge/tap core.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("no such bridge {0}")]
    NotFound(String),

    #[error("tap {0} not found")]
    TapNotFound(String),

    #[error("tap is already connected to bridge: {bridge} {tap}")]
    TapInUse { bridge: String, tap: String },

    #[error("not a host tap")]
    NotHostTap,

    #[error("no trunk port {iface} on bridge {bridge}")]
    NoTrunkPort { bridge: String, iface: String },

    #[error("no tunnel port {iface} on bridge {bridge}")]
    NoTunnelPort { bridge: String, iface: String },

    #[error("invalid tunnel type: {0}")]
    InvalidTunnelType(String),

    #[error("bridge {0} already has a netflow collector")]
    NetflowExists(String),

    #[error("bridge {0} has no netflow collector")]
    NoNetflow(String),

    #[error("netflow collector: {0}")]
    Collector(#[source] std::io::Error),

    /// One or more per-entry failures during a sweeping teardown.
    #[error("{0}")]
    Cleanup(String),

    #[error(transparent)]
    Shell(#[from] ShellError),
}
