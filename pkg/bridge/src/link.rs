//! `ip`-level interface operations.
//!
//! Thin wrappers over the `ip` tool (plus `dhclient` for host-tap DHCP).
//! These are free functions so both the bridge core and the host-tap
//! surface can share them; all of them resolve the binary through the
//! caller's [`Process`] table.

use pkg_shell::{run, Process, ShellError};

/// Bring an interface up, optionally in promiscuous mode. Host taps are
/// always brought up promiscuous.
pub async fn up(shell: &Process, name: &str, promisc: bool) -> Result<(), ShellError> {
    let ip = shell.resolve("ip");
    let mut args = vec!["link", "set", name, "up"];
    if promisc {
        args.extend_from_slice(&["promisc", "on"]);
    }
    run(&ip, &args).await.map(|_| ())
}

/// Take an interface down.
pub async fn down(shell: &Process, name: &str) -> Result<(), ShellError> {
    let ip = shell.resolve("ip");
    run(&ip, &["link", "set", name, "down"]).await.map(|_| ())
}

/// Create a tuntap device. An existing device surfaces as
/// [`ShellError::AlreadyExists`]; callers decide whether that is fatal.
pub async fn tap_add(shell: &Process, name: &str) -> Result<(), ShellError> {
    let ip = shell.resolve("ip");
    run(&ip, &["tuntap", "add", "mode", "tap", name])
        .await
        .map(|_| ())
}

/// Delete a tuntap device.
pub async fn tap_del(shell: &Process, name: &str) -> Result<(), ShellError> {
    let ip = shell.resolve("ip");
    run(&ip, &["tuntap", "del", "mode", "tap", name])
        .await
        .map(|_| ())
}

/// Create a veth pair whose peer lands inside the named network namespace.
pub async fn veth_add(
    shell: &Process,
    name: &str,
    peer: &str,
    ns: &str,
) -> Result<(), ShellError> {
    let ip = shell.resolve("ip");
    run(
        &ip,
        &["link", "add", name, "type", "veth", "peer", peer, "netns", ns],
    )
    .await
    .map(|_| ())
}

/// Delete a link (our side of a veth pair; the peer dies with it).
pub async fn link_del(shell: &Process, name: &str) -> Result<(), ShellError> {
    let ip = shell.resolve("ip");
    run(&ip, &["link", "del", name]).await.map(|_| ())
}

/// Set the MAC of `veth<index>` inside a network namespace.
pub async fn set_ns_mac(
    shell: &Process,
    ns: &str,
    index: u32,
    mac: &str,
) -> Result<(), ShellError> {
    let ip = shell.resolve("ip");
    let dev = format!("veth{}", index);
    run(
        &ip,
        &[
            "netns", "exec", ns, "ip", "link", "set", "dev", &dev, "address", mac,
        ],
    )
    .await
    .map(|_| ())
}

/// Assign a static address to an interface.
pub async fn addr_add(shell: &Process, name: &str, cidr: &str) -> Result<(), ShellError> {
    let ip = shell.resolve("ip");
    run(&ip, &["addr", "add", "dev", name, cidr])
        .await
        .map(|_| ())
}

/// Acquire a DHCP lease on an interface.
pub async fn dhcp(shell: &Process, name: &str) -> Result<(), ShellError> {
    let tool = shell.resolve("dhcp");
    run(&tool, &[name]).await.map(|_| ())
}
