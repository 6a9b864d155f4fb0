//! Bridge and tap naming, VLAN sentinels, OVS timing.

use std::time::Duration;

/// Bridge used when a VM interface does not name one.
pub const DEFAULT_BRIDGE: &str = "mega_bridge";

/// Prefix for host-allocated tap names (`mega_tap0`, `mega_tap1`, ...).
pub const TAP_PREFIX: &str = "mega_tap";

/// Sentinel VLAN: interface is attached but logically isolated.
pub const DISCONNECTED_VLAN: i32 = -1;

/// Sentinel VLAN: port carries all VLAN tags (no `tag=` on the OVS port).
pub const TRUNK_VLAN: i32 = -2;

/// Upper bound on any single OVS CLI invocation.
pub const OVS_TIMEOUT: Duration = Duration::from_secs(5);

/// How many tap names the allocator keeps ready ahead of consumers.
pub const TAP_NAME_BACKLOG: usize = 16;
