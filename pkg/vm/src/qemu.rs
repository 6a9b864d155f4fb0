//! QEMU argument assembly.
//!
//! Deterministic, side-effect free: the same config always produces the
//! same argv (the binary path itself is resolved by the caller). Guest
//! NICs are spread over emulated pci-bridges, 31 slots apiece.

use std::path::Path;

use pkg_constants::vm::PCI_SLOTS_PER_BRIDGE;

use crate::config::KvmConfig;

/// Assemble the full QEMU argument list for one VM.
pub fn build_args(
    id: usize,
    config: &KvmConfig,
    instance_path: &Path,
    hugepages_mount: Option<&str>,
) -> Vec<String> {
    let mut args: Vec<String> = Vec::new();
    let instance = instance_path.to_string_lossy();

    let mut push = |parts: &[&str]| {
        for p in parts {
            args.push(p.to_string());
        }
    };

    push(&["-enable-kvm"]);
    push(&["-name", &id.to_string()]);
    push(&["-m", &config.memory_mb.to_string()]);
    push(&["-nographic"]);
    push(&["-balloon", "none"]);
    // One VNC display per VM id; thousands of sessions would collide
    // with real listening ports long before this scheme breaks.
    push(&["-vnc", &format!("0.0.0.0:{}", id)]);
    // Absolute pointer positioning over VNC.
    push(&["-usbdevice", "tablet"]);
    push(&["-smp", &config.vcpus.to_string()]);
    push(&["-qmp", &format!("unix:{}/qmp,server", instance)]);
    push(&["-vga", "cirrus"]);
    push(&["-rtc", "clock=vm,base=utc"]);
    push(&["-device", "virtio-serial"]);
    push(&[
        "-chardev",
        &format!(
            "socket,id=charserial0,path={}/serial,server,nowait",
            instance
        ),
    ]);
    push(&[
        "-device",
        "virtserialport,chardev=charserial0,id=serial0,name=serial0",
    ]);
    push(&["-pidfile", &format!("{}/qemu.pid", instance)]);
    push(&["-k", "en-us"]);
    push(&["-cpu", "host"]);
    push(&["-net", "none"]);
    // Start paused; an explicit `cont` resumes the guest.
    push(&["-S"]);

    if let Some(migrate) = &config.migrate_path {
        push(&["-incoming", &format!("exec:cat {}", migrate)]);
    }

    for disk in &config.disk_paths {
        push(&["-drive", &format!("file={},media=disk", disk)]);
    }

    if config.snapshot {
        push(&["-snapshot"]);
    }

    if let Some(kernel) = &config.kernel_path {
        push(&["-kernel", kernel]);
    }
    if let Some(initrd) = &config.initrd_path {
        push(&["-initrd", initrd]);
    }
    if !config.append.is_empty() {
        push(&["-append", &config.append]);
    }

    if let Some(cdrom) = &config.cdrom_path {
        push(&["-drive", &format!("file={},if=ide,index=1,media=cdrom", cdrom)]);
        push(&["-boot", "once=d"]);
    }

    let mut bus = 1u32;
    let mut addr = 1u32;
    push(&["-device", &format!("pci-bridge,id=pci.{},chassis_nr={}", bus, bus)]);
    for net in &config.networks {
        push(&[
            "-netdev",
            &format!("tap,id={},script=no,ifname={}", net.tap, net.tap),
        ]);
        push(&[
            "-device",
            &format!(
                "driver={},netdev={},mac={},bus=pci.{},addr=0x{:x}",
                net.driver, net.tap, net.mac, bus, addr
            ),
        ]);
        addr += 1;
        if addr == PCI_SLOTS_PER_BRIDGE + 1 {
            addr = 1;
            bus += 1;
            push(&["-device", &format!("pci-bridge,id=pci.{},chassis_nr={}", bus, bus)]);
        }
    }

    if let Some(mount) = hugepages_mount {
        push(&["-mem-info", mount]);
    }

    for extra in &config.qemu_append {
        args.push(extra.clone());
    }

    args.push("-uuid".to_string());
    args.push(config.uuid.clone());

    args
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;
    use std::path::PathBuf;

    fn base_config() -> KvmConfig {
        KvmConfig {
            uuid: "f81d4fae-7dec-11d0-a765-00a0c91e6bf6".to_string(),
            ..KvmConfig::default()
        }
    }

    fn args_for(config: &KvmConfig) -> Vec<String> {
        build_args(7, config, &PathBuf::from("/tmp/megad/7"), None)
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(|s| s.as_str())
    }

    #[test]
    fn test_baseline_args() {
        let args = args_for(&base_config());

        assert_eq!(args[0], "-enable-kvm");
        assert_eq!(value_after(&args, "-name"), Some("7"));
        assert_eq!(value_after(&args, "-m"), Some("2048"));
        assert_eq!(value_after(&args, "-vnc"), Some("0.0.0.0:7"));
        assert_eq!(value_after(&args, "-qmp"), Some("unix:/tmp/megad/7/qmp,server"));
        assert_eq!(value_after(&args, "-vga"), Some("cirrus"));
        assert!(args.contains(&"-S".to_string()));
        // UUID rides at the very end.
        assert_eq!(args[args.len() - 2], "-uuid");
        assert_eq!(args[args.len() - 1], "f81d4fae-7dec-11d0-a765-00a0c91e6bf6");
    }

    #[test]
    fn test_determinism() {
        let config = base_config();
        assert_eq!(args_for(&config), args_for(&config));
    }

    #[test]
    fn test_disks_snapshot_and_cdrom() {
        let mut config = base_config();
        config.disk_paths = vec!["/images/a.qcow2".to_string()];
        config.snapshot = true;
        config.cdrom_path = Some("/images/install.iso".to_string());

        let args = args_for(&config);
        assert!(args.contains(&"file=/images/a.qcow2,media=disk".to_string()));
        assert!(args.contains(&"-snapshot".to_string()));
        assert!(args.contains(&"file=/images/install.iso,if=ide,index=1,media=cdrom".to_string()));
        assert_eq!(value_after(&args, "-boot"), Some("once=d"));
    }

    #[test]
    fn test_migrate_path_adds_incoming() {
        let mut config = base_config();
        config.migrate_path = Some("/tmp/ckpt".to_string());
        let args = args_for(&config);
        assert_eq!(value_after(&args, "-incoming"), Some("exec:cat /tmp/ckpt"));
    }

    #[test]
    fn test_nic_device_line() {
        let mut config = base_config();
        config.networks = vec![NetConfig {
            bridge: String::new(),
            vlan: 1,
            mac: "13:37:13:37:00:00".to_string(),
            driver: "e1000".to_string(),
            tap: "mega_tap0".to_string(),
        }];

        let args = args_for(&config);
        assert!(args.contains(&"tap,id=mega_tap0,script=no,ifname=mega_tap0".to_string()));
        assert!(args.contains(
            &"driver=e1000,netdev=mega_tap0,mac=13:37:13:37:00:00,bus=pci.1,addr=0x1".to_string()
        ));
    }

    #[test]
    fn test_pci_addressing_wraps_to_second_bridge() {
        let mut config = base_config();
        for i in 0..33 {
            config.networks.push(NetConfig {
                bridge: String::new(),
                vlan: 1,
                mac: format!("52:54:00:00:00:{:02x}", i),
                driver: "e1000".to_string(),
                tap: format!("mega_tap{}", i),
            });
        }

        let args = args_for(&config);
        // Interface 31 (index 30) takes the last slot on bus 1.
        assert!(args.iter().any(|a| a.contains("bus=pci.1,addr=0x1f")));
        // Interface 32 (index 31) wraps to (bus 2, addr 1).
        assert!(args.iter().any(|a| a.contains("bus=pci.2,addr=0x1")));
        assert!(args.contains(&"pci-bridge,id=pci.2,chassis_nr=2".to_string()));
    }

    #[test]
    fn test_hugepages_and_append_trailer() {
        let mut config = base_config();
        config.qemu_append = vec!["-no-reboot".to_string()];
        let args = build_args(1, &config, &PathBuf::from("/tmp/megad/1"), Some("/dev/hugepages"));

        assert_eq!(value_after(&args, "-mem-info"), Some("/dev/hugepages"));
        let reboot = args.iter().position(|a| a == "-no-reboot").unwrap();
        let uuid = args.iter().position(|a| a == "-uuid").unwrap();
        assert!(reboot < uuid);
    }
}
