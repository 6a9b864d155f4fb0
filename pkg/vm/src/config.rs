//! VM launch configuration.
//!
//! The CLI maintains one working [`KvmConfig`]; every launch deep-copies
//! it so later edits cannot reach into a running VM.

use serde::{Deserialize, Serialize};

use pkg_constants::vm::{DEFAULT_MEMORY_MB, DEFAULT_NET_DRIVER, DEFAULT_VCPUS};

use crate::error::VmError;

/// One guest network interface and the host resources realizing it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetConfig {
    /// Bridge name; empty means the default bridge.
    pub bridge: String,
    pub vlan: i32,
    /// Empty until the preamble draws one.
    pub mac: String,
    pub driver: String,
    /// Resolved host tap name; empty until launch creates it.
    pub tap: String,
}

/// Everything a KVM launch needs, deep-copied from the CLI's working
/// config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KvmConfig {
    pub memory_mb: u64,
    pub vcpus: u32,

    pub snapshot: bool,
    pub disk_paths: Vec<String>,
    pub cdrom_path: Option<String>,
    pub kernel_path: Option<String>,
    pub initrd_path: Option<String>,
    pub migrate_path: Option<String>,
    pub append: String,

    /// Extra arguments appended to the QEMU command line.
    pub qemu_append: Vec<String>,

    /// Generated at preamble time when empty.
    pub uuid: String,

    pub networks: Vec<NetConfig>,
}

impl Default for KvmConfig {
    fn default() -> Self {
        Self {
            memory_mb: DEFAULT_MEMORY_MB,
            vcpus: DEFAULT_VCPUS,
            snapshot: false,
            disk_paths: Vec::new(),
            cdrom_path: None,
            kernel_path: None,
            initrd_path: None,
            migrate_path: None,
            append: String::new(),
            qemu_append: Vec::new(),
            uuid: String::new(),
            networks: Vec::new(),
        }
    }
}

impl KvmConfig {
    /// Human-readable rendering written to the instance's `config` file.
    pub fn to_table(&self) -> String {
        let mut out = String::from("Current VM configuration:\n");
        let row = |k: &str, v: String| format!("{:<16} {}\n", format!("{}:", k), v);

        out.push_str(&row("Memory", format!("{}", self.memory_mb)));
        out.push_str(&row("VCPUs", format!("{}", self.vcpus)));
        out.push_str(&row("Migrate Path", opt(&self.migrate_path)));
        out.push_str(&row("Disk Paths", format!("{:?}", self.disk_paths)));
        out.push_str(&row("CDROM Path", opt(&self.cdrom_path)));
        out.push_str(&row("Kernel Path", opt(&self.kernel_path)));
        out.push_str(&row("Initrd Path", opt(&self.initrd_path)));
        out.push_str(&row("Kernel Append", self.append.clone()));
        out.push_str(&row("QEMU Append", format!("{:?}", self.qemu_append)));
        out.push_str(&row("Snapshot", format!("{}", self.snapshot)));
        out.push_str(&row("Networks", self.networks_string()));
        out.push_str(&row("UUID", self.uuid.clone()));
        out
    }

    pub fn networks_string(&self) -> String {
        let specs: Vec<String> = self
            .networks
            .iter()
            .map(|n| {
                let bridge = if n.bridge.is_empty() {
                    pkg_constants::network::DEFAULT_BRIDGE
                } else {
                    &n.bridge
                };
                format!("{},{},{},{}", bridge, n.vlan, n.mac, n.driver)
            })
            .collect();
        format!("[{}]", specs.join(" "))
    }
}

/// Parse one comma-separated interface spec. Accepted forms:
/// `<vlan>`, `<vlan>,<mac>`, `<bridge>,<vlan>`, `<bridge>,<vlan>,<mac>`,
/// `<vlan>,<driver>`, `<bridge>,<vlan>,<mac>,<driver>`.
pub fn parse_net_spec(spec: &str) -> Result<NetConfig, VmError> {
    let fields: Vec<&str> = spec.split(',').collect();
    let bad = || VmError::InvalidNetSpec(spec.to_string());

    let (bridge, vlan, mac, driver) = match fields.as_slice() {
        [vlan] => {
            let vlan = vlan.parse::<i32>().map_err(|_| bad())?;
            ("", vlan, "", "")
        }
        [a, b] => {
            if let Ok(vlan) = a.parse::<i32>() {
                if is_valid_mac(b) {
                    ("", vlan, *b, "")
                } else {
                    // <vlan>,<driver>
                    ("", vlan, "", *b)
                }
            } else {
                let vlan = b.parse::<i32>().map_err(|_| bad())?;
                (*a, vlan, "", "")
            }
        }
        [bridge, vlan, mac] => {
            let vlan = vlan.parse::<i32>().map_err(|_| bad())?;
            if !is_valid_mac(mac) {
                return Err(bad());
            }
            (*bridge, vlan, *mac, "")
        }
        [bridge, vlan, mac, driver] => {
            let vlan = vlan.parse::<i32>().map_err(|_| bad())?;
            if !is_valid_mac(mac) {
                return Err(bad());
            }
            (*bridge, vlan, *mac, *driver)
        }
        _ => return Err(bad()),
    };

    Ok(NetConfig {
        bridge: bridge.to_string(),
        vlan,
        mac: mac.to_lowercase(),
        driver: if driver.is_empty() {
            DEFAULT_NET_DRIVER.to_string()
        } else {
            driver.to_string()
        },
        tap: String::new(),
    })
}

/// Six colon-separated hex octets.
pub fn is_valid_mac(s: &str) -> bool {
    let parts: Vec<&str> = s.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

/// Draw a random locally-administered unicast MAC (QEMU's 52:54:00
/// prefix).
pub fn random_mac() -> String {
    let mut rng = rand::rng();
    let bytes: [u8; 3] = rand::Rng::random(&mut rng);
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        bytes[0], bytes[1], bytes[2]
    )
}

fn opt(v: &Option<String>) -> String {
    v.clone().unwrap_or_default()
}

// ─── Tests ───────────────────────────────────────────────────────────────────
