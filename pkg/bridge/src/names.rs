//! Tap-name allocation.
//!
//! A single feeder task walks `mega_tap0, mega_tap1, ...`, skipping names
//! that already exist under `/sys/class/net`, and keeps a small backlog of
//! vetted names in a channel. Consumers pull with [`TapNames::take`] and
//! by construction never race each other for a name.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;

use pkg_constants::network::{TAP_NAME_BACKLOG, TAP_PREFIX};
use pkg_constants::paths::SYS_CLASS_NET;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error};

/// Shared handle to the tap-name feeder.
#[derive(Debug, Clone)]
pub struct TapNames {
    rx: Arc<Mutex<mpsc::Receiver<String>>>,
}

impl TapNames {
    /// Start the feeder against the real `/sys/class/net`.
    pub fn spawn() -> Self {
        Self::spawn_at(PathBuf::from(SYS_CLASS_NET))
    }

    /// Start the feeder against an alternate interface directory.
    pub fn spawn_at(sys_class_net: PathBuf) -> Self {
        let (tx, rx) = mpsc::channel(TAP_NAME_BACKLOG);

        tokio::spawn(async move {
            for count in 0u64.. {
                let name = format!("{}{}", TAP_PREFIX, count);
                let path = sys_class_net.join(&name);

                match tokio::fs::metadata(&path).await {
                    // Name is taken on the host, skip it.
                    Ok(_) => continue,
                    Err(e) if e.kind() == ErrorKind::NotFound => {
                        debug!("[names] tap count: {}", count);
                        if tx.send(name).await.is_err() {
                            // All handles dropped, nothing left to feed.
                            return;
                        }
                    }
                    Err(e) => {
                        error!("[names] unable to stat {}: {}", path.display(), e);
                        std::process::exit(1);
                    }
                }
            }
        });

        Self {
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    /// Pull the next unused tap name. The feeder runs ahead of consumers,
    /// so this does not wait on the filesystem.
    pub async fn take(&self) -> String {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(name) => name,
            None => {
                error!("[names] tap name feeder is gone");
                std::process::exit(1);
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
