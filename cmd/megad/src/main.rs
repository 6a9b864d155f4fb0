//! megad: host-side VM and bridge launcher daemon.
//!
//! Builds the process singletons (tool resolver, tap-name allocator,
//! bridge registry, VM registry), then reads one command per line from
//! stdin until EOF or `quit`. Every command prints either a tabular
//! response or a single error line.

mod commands;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use pkg_bridge::{Bridges, TapNames};
use pkg_shell::Process;
use pkg_vm::VmRegistry;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

use commands::{App, Dispatch};

#[derive(Parser, Debug)]
#[command(name = "megad", about = "Cluster VM/bridge launcher, host side")]
struct Cli {
    /// Base directory for the bridge inventory and per-VM instance state
    #[arg(long, default_value = pkg_constants::paths::DEFAULT_BASE)]
    base: PathBuf,

    /// Path override for the qemu binary
    #[arg(long)]
    qemu: Option<String>,

    /// Path override for ovs-vsctl
    #[arg(long)]
    ovs: Option<String>,

    /// Path override for the ip tool
    #[arg(long)]
    ip: Option<String>,

    /// Hugepages mount path handed to every qemu
    #[arg(long)]
    hugepages: Option<String>,

    /// CPU list (taskset format) for pinning fresh qemu processes
    #[arg(long)]
    affinity: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    std::fs::create_dir_all(&cli.base)
        .with_context(|| format!("create base directory {}", cli.base.display()))?;

    let mut process = Process::new();
    for (name, path) in [("qemu", &cli.qemu), ("ovs", &cli.ovs), ("ip", &cli.ip)] {
        if let Some(path) = path {
            process.set(name, path);
        }
    }
    let shell = Arc::new(process);

    let names = TapNames::spawn();
    let bridges = Arc::new(Bridges::new(shell.clone(), names, cli.base.clone()));
    let vms = VmRegistry::new(
        bridges.clone(),
        shell,
        cli.base.clone(),
        cli.hugepages,
        cli.affinity,
    );

    let app = App::new(bridges.clone(), vms);
    info!("megad ready (base: {})", cli.base.display());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match app.dispatch(line).await {
            Dispatch::Output(out) => {
                if !out.is_empty() {
                    println!("{}", out);
                }
            }
            Dispatch::Error(err) => println!("E: {}", err),
            Dispatch::Quit => break,
        }
    }

    // Leave no taps or owned bridges behind.
    if let Err(e) = bridges.destroy_all().await {
        error!("teardown: {}", e);
    }

    Ok(())
}
