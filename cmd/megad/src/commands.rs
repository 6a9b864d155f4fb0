//! Line-oriented command dispatch.
//!
//! One command per line; every command resolves to a tabular response or
//! a single error string. The richer shell (history, nesting, command
//! files) lives in the cluster front end, not here.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use pkg_bridge::{hosttap, Bridges, TunnelKind};
use pkg_vm::config::parse_net_spec;
use pkg_vm::{KvmConfig, VmRegistry};
use tokio::sync::{mpsc, Mutex};

pub enum Dispatch {
    Output(String),
    Error(String),
    Quit,
}

pub struct App {
    bridges: Arc<Bridges>,
    vms: Arc<VmRegistry>,
    /// Working VM config; deep-copied into every launch.
    config: Mutex<KvmConfig>,
}

impl App {
    pub fn new(bridges: Arc<Bridges>, vms: Arc<VmRegistry>) -> Self {
        Self {
            bridges,
            vms,
            config: Mutex::new(KvmConfig::default()),
        }
    }

    pub async fn dispatch(&self, line: &str) -> Dispatch {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if matches!(tokens.as_slice(), ["quit"] | ["exit"]) {
            return Dispatch::Quit;
        }

        match self.run(&tokens).await {
            Ok(out) => Dispatch::Output(out),
            Err(e) => Dispatch::Error(e.to_string()),
        }
    }

    async fn run(&self, tokens: &[&str]) -> Result<String> {
        match tokens {
            ["vm", rest @ ..] => self.vm_command(rest).await,
            ["bridge"] | ["bridge", "info"] => Ok(self.bridges.inventory().await),
            ["bridge", "destroy", name] => {
                self.bridges.destroy(name).await?;
                Ok(String::new())
            }
            ["tap"] => {
                let rows = hosttap::list(&self.bridges).await;
                let mut out = format!("{:<20} {:<16} {}\n", "bridge", "tap", "vlan");
                for (bridge, tap, vlan) in rows {
                    out.push_str(&format!("{:<20} {:<16} {}\n", bridge, tap, vlan));
                }
                Ok(out)
            }
            ["tap", "create", bridge, vlan, ip] => {
                let vlan = parse_vlan(vlan)?;
                let tap = hosttap::create(&self.bridges, bridge, ip, None, vlan).await?;
                Ok(tap)
            }
            ["tap", "create", bridge, vlan, ip, name] => {
                let vlan = parse_vlan(vlan)?;
                let tap = hosttap::create(&self.bridges, bridge, ip, Some(name), vlan).await?;
                Ok(tap)
            }
            ["tap", "delete", tap] => {
                hosttap::delete(&self.bridges, tap).await?;
                Ok(String::new())
            }
            ["trunk", "add", bridge, iface] => {
                self.bridges.get(bridge).await?.trunk_add(iface).await?;
                Ok(String::new())
            }
            ["trunk", "remove", bridge, iface] => {
                self.bridges.get(bridge).await?.trunk_remove(iface).await?;
                Ok(String::new())
            }
            ["tunnel", "add", bridge, kind, remote_ip] => {
                let kind = TunnelKind::from_str(kind)?;
                let tap = self
                    .bridges
                    .get(bridge)
                    .await?
                    .tunnel_add(kind, remote_ip)
                    .await?;
                Ok(tap)
            }
            ["tunnel", "remove", bridge, iface] => {
                self.bridges.get(bridge).await?.tunnel_remove(iface).await?;
                Ok(String::new())
            }
            ["mirror", "add", bridge] => {
                let tap = self.bridges.get(bridge).await?.mirror_add().await?;
                Ok(tap)
            }
            ["mirror", "remove", bridge, tap] => {
                self.bridges.get(bridge).await?.mirror_remove(tap).await?;
                Ok(String::new())
            }
            ["netflow", "add", bridge, timeout] => {
                let timeout: u32 = timeout.parse().map_err(|_| anyhow!("invalid timeout"))?;
                let nf = self
                    .bridges
                    .get(bridge)
                    .await?
                    .netflow_add(timeout)
                    .await?;
                Ok(format!("collecting on 127.0.0.1:{}", nf.port()))
            }
            ["netflow", "remove", bridge] => {
                self.bridges.get(bridge).await?.netflow_destroy().await?;
                Ok(String::new())
            }
            ["netflow", "timeout", bridge, timeout] => {
                let timeout: u32 = timeout.parse().map_err(|_| anyhow!("invalid timeout"))?;
                self.bridges
                    .get(bridge)
                    .await?
                    .netflow_timeout_update(timeout)
                    .await?;
                Ok(String::new())
            }
            _ => bail!("invalid command"),
        }
    }

    async fn vm_command(&self, tokens: &[&str]) -> Result<String> {
        match tokens {
            ["config"] => Ok(self.config.lock().await.to_table()),
            ["config", "net", specs @ ..] if !specs.is_empty() => {
                let mut networks = Vec::with_capacity(specs.len());
                for spec in specs {
                    networks.push(parse_net_spec(spec)?);
                }
                self.config.lock().await.networks = networks;
                Ok(String::new())
            }
            ["config", "memory", mb] => {
                self.config.lock().await.memory_mb =
                    mb.parse().map_err(|_| anyhow!("invalid memory: {}", mb))?;
                Ok(String::new())
            }
            ["config", "vcpus", n] => {
                self.config.lock().await.vcpus =
                    n.parse().map_err(|_| anyhow!("invalid vcpus: {}", n))?;
                Ok(String::new())
            }
            ["config", "snapshot", v] => {
                self.config.lock().await.snapshot =
                    v.parse().map_err(|_| anyhow!("invalid bool: {}", v))?;
                Ok(String::new())
            }
            ["config", "disk", paths @ ..] => {
                self.config.lock().await.disk_paths =
                    paths.iter().map(|s| s.to_string()).collect();
                Ok(String::new())
            }
            ["config", "cdrom", path] => {
                self.config.lock().await.cdrom_path = Some(path.to_string());
                Ok(String::new())
            }
            ["config", "kernel", path] => {
                self.config.lock().await.kernel_path = Some(path.to_string());
                Ok(String::new())
            }
            ["config", "initrd", path] => {
                self.config.lock().await.initrd_path = Some(path.to_string());
                Ok(String::new())
            }
            ["config", "migrate", path] => {
                self.config.lock().await.migrate_path = Some(path.to_string());
                Ok(String::new())
            }
            ["config", "append", rest @ ..] => {
                self.config.lock().await.append = rest.join(" ");
                Ok(String::new())
            }
            ["config", "qemu-append", rest @ ..] => {
                self.config.lock().await.qemu_append =
                    rest.iter().map(|s| s.to_string()).collect();
                Ok(String::new())
            }
            ["config", "uuid", uuid] => {
                self.config.lock().await.uuid = uuid.to_string();
                Ok(String::new())
            }
            ["config", "qemu-override"] => {
                let config = self.config.lock().await.clone();
                let args = pkg_vm::qemu::build_args(
                    0,
                    &config,
                    &self.vms.base().join("0"),
                    None,
                );
                Ok(self.vms.overrides().preview(&args))
            }
            ["config", "qemu-override", "add", find, repl] => {
                let id = self.vms.overrides().add(find, repl);
                Ok(id.to_string())
            }
            ["config", "qemu-override", "delete", spec] => {
                self.vms.overrides().delete(spec)?;
                Ok(String::new())
            }
            ["launch", "kvm", name] => {
                let config = self.config.lock().await.clone();
                let (ack_tx, mut ack_rx) = mpsc::unbounded_channel();
                let id = self.vms.launch(name, config, ack_tx).await?;
                // The supervisor acks once the launch settles either way.
                ack_rx.recv().await;
                let vm = self.vms.lookup(&id.to_string()).await?;
                Ok(format!("vm {} launched: {}", id, vm.state()))
            }
            ["start", target] => {
                self.vms.start(target).await?;
                Ok(String::new())
            }
            ["stop", target] => {
                self.vms.stop(target).await?;
                Ok(String::new())
            }
            ["kill", "*"] => {
                let mut killed = 0;
                for vm in self.vms.list().await {
                    if vm.state().is_active() && vm.kill().is_ok() {
                        killed += 1;
                    }
                }
                for _ in 0..killed {
                    self.vms.recv_kill_ack().await;
                }
                Ok(format!("killed {} vms", killed))
            }
            ["kill", target] => {
                let id = self.vms.kill(target).await?;
                self.vms.recv_kill_ack().await;
                Ok(format!("vm {} killed", id))
            }
            ["flush"] => {
                let n = self.vms.flush().await;
                Ok(format!("flushed {} vms", n))
            }
            ["info"] => self.info(&default_masks()).await,
            ["info", masks] => {
                let masks: Vec<String> = masks.split(',').map(|s| s.to_string()).collect();
                self.info(&masks).await
            }
            ["migrate", target] => {
                let (status, completion) = self.vms.query_migrate(target).await?;
                Ok(format!("{} {:.2}", status, completion))
            }
            ["migrate", target, file] => {
                self.vms.migrate(target, file).await?;
                Ok(String::new())
            }
            ["hotplug", "add", target, file] => {
                let hid = self.vms.hotplug_add(target, file).await?;
                Ok(hid.to_string())
            }
            ["hotplug", "remove", target, hid] => {
                let hid: usize = hid.parse().map_err(|_| anyhow!("invalid id {}", hid))?;
                self.vms.hotplug_remove(target, hid).await?;
                Ok(String::new())
            }
            ["hotplug", "list", target] => {
                let devices = self.vms.hotplug_list(target).await?;
                let mut out = format!("{:<6} {}\n", "id", "file");
                for (hid, file) in devices {
                    out.push_str(&format!("{:<6} {}\n", hid, file));
                }
                Ok(out)
            }
            ["qmp", target, rest @ ..] if !rest.is_empty() => {
                Ok(self.vms.qmp_raw(target, &rest.join(" ")).await?)
            }
            ["tag", target, key, value] => {
                let vm = self.vms.lookup(target).await?;
                vm.set_tag(key, value);
                Ok(String::new())
            }
            _ => bail!("invalid command"),
        }
    }

    async fn info(&self, masks: &[String]) -> Result<String> {
        Ok(self.vms.info(masks).await?)
    }
}

fn default_masks() -> Vec<String> {
    ["id", "name", "state", "memory", "vcpus", "uuid", "type"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn parse_vlan(s: &str) -> Result<i32> {
    s.parse().map_err(|_| anyhow!("invalid vlan: {}", s))
}
