//! Bridge and tap management on top of Open vSwitch.
//!
//! This crate owns the host's L2 plumbing for megad:
//!
//! - **names**: single producer of unused `mega_tapN` interface names
//! - **ovs / link**: serialized `ovs-vsctl` / `ovs-ofctl` / `ip` invocations
//! - **bridge**: one OVS bridge and the taps, trunks, tunnels, mirror and
//!   NetFlow exporter attached to it
//! - **registry**: process-wide bridge map with a persisted inventory file
//! - **learner**: learned {MAC, IPv4, IPv6} table fed by the ARP/NDP sidecar
//! - **hosttap**: host-side taps (OVS internal ports) with optional IP
//!
//! Every mutation follows the same shape: acquire the per-bridge lock,
//! drive the external tool, and only then update the in-memory model, so a
//! failed invocation never leaves a phantom entry behind.

pub mod bridge;
pub mod error;
pub mod hosttap;
pub mod learner;
pub mod link;
pub mod names;
pub mod netflow;
pub mod ovs;
pub mod registry;

pub use bridge::{Bridge, Tap, TunnelKind};
pub use error::BridgeError;
pub use learner::{BandwidthStats, IpEntry, IpLearner};
pub use names::TapNames;
pub use netflow::Netflow;
pub use ovs::Ovs;
pub use registry::Bridges;
