//! KVM instance supervision.
//!
//! Each VM is a QEMU/KVM process driven over its QMP socket by a
//! supervisor task:
//!
//! - **config**: deep-copied launch configuration and net-spec parsing
//! - **state**: the BUILDING → RUNNING ⇄ PAUSED / QUIT / ERROR machine,
//!   durably mirrored into the instance's `state` file
//! - **registry**: process-wide VM map, id assignment, the shared
//!   kill-ack channel, and the operator surface (start/stop/kill,
//!   migrate, hotplug, info)
//! - **kvm**: the per-VM supervisor — preamble validation, tap creation,
//!   QEMU spawn, QMP connect with retry, the wait-vs-kill event loop, and
//!   unconditional network cleanup
//! - **qemu**: pure argv assembly
//! - **overrides**: process-global post-assembly argv edits

pub mod config;
pub mod error;
pub mod info;
pub mod kvm;
pub mod overrides;
pub mod qemu;
pub mod registry;
pub mod state;

pub use config::{KvmConfig, NetConfig};
pub use error::VmError;
pub use kvm::KvmVm;
pub use overrides::QemuOverrides;
pub use registry::{CcClients, VmRegistry};
pub use state::VmState;
