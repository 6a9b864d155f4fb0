use pkg_bridge::BridgeError;
use pkg_qmp::QmpError;

/// Error surface of the VM core.
#[derive(Debug, thiserror::Error)]
pub enum VmError {
    #[error("vm {0} not found")]
    NotFound(String),

    #[error("VM {0} not running")]
    NotRunning(usize),

    #[error("vm name {0} is already in use")]
    NameInUse(String),

    #[error("no such hotplug device id")]
    NoHotplug,

    #[error("kill already pending for vm {0}")]
    KillPending(usize),

    #[error("invalid mask: {0}")]
    InvalidMask(String),

    #[error("invalid network spec: {0}")]
    InvalidNetSpec(String),

    #[error("invalid id {0}")]
    InvalidId(String),

    /// `query-migrate` returned something we cannot interpret.
    #[error("could not decode migration status: {0}")]
    Migrate(String),

    /// The VM has no live QMP connection to drive.
    #[error("vm {0} has no qmp connection")]
    QmpUnavailable(usize),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Qmp(#[from] QmpError),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}
