//! Learned {MAC, IPv4, IPv6} table and shared bandwidth stats.
//!
//! The packet capture itself lives in an external sidecar snooping ARP and
//! IPv6 neighbor solicitation on the bridge's local port (the OpenFlow
//! rules that steer that traffic are installed by the bridge). This module
//! owns the table the sidecar feeds and the lookup surface the VM info
//! masks read.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Learned addresses for one MAC.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpEntry {
    pub v4: Option<String>,
    pub v6: Option<String>,
}

/// Per-bridge IP/MAC learner handle.
#[derive(Debug, Clone)]
pub struct IpLearner {
    bridge: String,
    table: Arc<Mutex<HashMap<String, IpEntry>>>,
}

impl IpLearner {
    pub fn new(bridge: &str) -> Self {
        Self {
            bridge: bridge.to_string(),
            table: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn bridge(&self) -> &str {
        &self.bridge
    }

    /// Register a MAC so the sidecar's observations for it are retained.
    pub fn add_mac(&self, mac: &str) {
        let mut table = self.table.lock().unwrap();
        table.entry(mac.to_string()).or_default();
    }

    /// Record an IPv4 observation. Unregistered MACs are ignored.
    pub fn observe_v4(&self, mac: &str, ip: &str) {
        let mut table = self.table.lock().unwrap();
        if let Some(entry) = table.get_mut(mac) {
            entry.v4 = Some(ip.to_string());
        }
    }

    /// Record an IPv6 observation. Unregistered MACs are ignored.
    pub fn observe_v6(&self, mac: &str, ip: &str) {
        let mut table = self.table.lock().unwrap();
        if let Some(entry) = table.get_mut(mac) {
            entry.v6 = Some(ip.to_string());
        }
    }

    /// Look up the learned addresses for a MAC.
    pub fn ip_from_mac(&self, mac: &str) -> Option<IpEntry> {
        let table = self.table.lock().unwrap();
        table.get(mac).cloned()
    }
}

/// Process-wide tap bandwidth stats, written by the learner sidecar's
/// owner and read by the `bandwidth` info mask. Values are (rx, tx) in
/// MB/s.
#[derive(Debug, Clone, Default)]
pub struct BandwidthStats {
    inner: Arc<Mutex<HashMap<String, (f64, f64)>>>,
}

impl BandwidthStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, tap: &str, rx: f64, tx: f64) {
        let mut inner = self.inner.lock().unwrap();
        inner.insert(tap.to_string(), (rx, tx));
    }

    pub fn get(&self, tap: &str) -> Option<(f64, f64)> {
        let inner = self.inner.lock().unwrap();
        inner.get(tap).copied()
    }

    pub fn remove(&self, tap: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.remove(tap);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observations_require_registration() {
        let iml = IpLearner::new("mega_bridge");
        iml.observe_v4("00:11:22:33:44:55", "10.0.0.9");
        assert!(iml.ip_from_mac("00:11:22:33:44:55").is_none());

        iml.add_mac("00:11:22:33:44:55");
        iml.observe_v4("00:11:22:33:44:55", "10.0.0.9");
        iml.observe_v6("00:11:22:33:44:55", "fe80::1");

        let entry = iml.ip_from_mac("00:11:22:33:44:55").unwrap();
        assert_eq!(entry.v4.as_deref(), Some("10.0.0.9"));
        assert_eq!(entry.v6.as_deref(), Some("fe80::1"));
    }

    #[test]
    fn test_bandwidth_roundtrip() {
        let bw = BandwidthStats::new();
        assert!(bw.get("mega_tap0").is_none());
        bw.set("mega_tap0", 1.5, 0.25);
        assert_eq!(bw.get("mega_tap0"), Some((1.5, 0.25)));
        bw.remove("mega_tap0");
        assert!(bw.get("mega_tap0").is_none());
    }
}
