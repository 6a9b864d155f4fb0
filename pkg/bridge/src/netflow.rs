//! Per-bridge NetFlow collector endpoint.
//!
//! OVS exports flow records to `127.0.0.1:<port>`; we allocate the port by
//! binding an ephemeral UDP socket and keep a drain task counting what
//! arrives. Decoding the NetFlow v5 wire format belongs to the external
//! collector pipeline, not this crate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct Netflow {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    port: u16,
    datagrams: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Netflow {
    /// Bind a local collector socket and start draining it.
    pub async fn start() -> std::io::Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0").await?;
        let port = socket.local_addr()?.port();

        let inner = Arc::new(Inner {
            port,
            datagrams: AtomicU64::new(0),
            task: Mutex::new(None),
        });

        let drain = inner.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; 9000];
            loop {
                match socket.recv_from(&mut buf).await {
                    Ok((n, from)) => {
                        debug!("[netflow] {} bytes from {}", n, from);
                        drain.datagrams.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => return,
                }
            }
        });
        *inner.task.lock().unwrap() = Some(task);

        Ok(Self { inner })
    }

    /// UDP port OVS should export to.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    /// Datagrams drained so far.
    pub fn datagrams(&self) -> u64 {
        self.inner.datagrams.load(Ordering::Relaxed)
    }

    /// Stop the drain task. Idempotent.
    pub fn stop(&self) {
        if let Some(task) = self.inner.task.lock().unwrap().take() {
            task.abort();
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
