//! Virtual machine / QEMU constants.

/// Attempts to dial the QMP socket after spawning QEMU.
pub const QMP_CONNECT_RETRY: u32 = 50;

/// Delay between QMP dial attempts, in milliseconds.
pub const QMP_CONNECT_DELAY: u64 = 100;

/// Network driver used when a VM interface does not name one.
pub const DEFAULT_NET_DRIVER: &str = "e1000";

/// Default guest memory in megabytes.
pub const DEFAULT_MEMORY_MB: u64 = 2048;

/// Default guest vCPU count.
pub const DEFAULT_VCPUS: u32 = 1;

/// PCI slots 1..=31 are usable on each emulated pci-bridge; slot 32 wraps
/// onto a fresh bridge.
pub const PCI_SLOTS_PER_BRIDGE: u32 = 31;
