//! QMP client for a single QEMU instance.
//!
//! QEMU exposes a JSON command socket (`-qmp unix:<path>,server`). The
//! protocol is line-oriented: a greeting, a `qmp_capabilities` handshake,
//! then command/response pairs interleaved with asynchronous events. A
//! background task splits the read side so events never block a pending
//! command response.
//!
//! Only the commands the VM supervisor drives are surfaced here: `cont`,
//! `stop`, `migrate`, `query-migrate`, hotplug add/remove, and a raw
//! passthrough for the operator.

use std::path::Path;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

/// Async events buffered before the consumer starts draining.
const EVENT_BACKLOG: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum QmpError {
    #[error("connect: {0}")]
    Connect(#[source] std::io::Error),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol: {0}")]
    Protocol(String),

    /// QEMU rejected the command.
    #[error("{command}: {class}: {desc}")]
    Command {
        command: String,
        class: String,
        desc: String,
    },

    #[error("connection closed")]
    Closed,
}

#[derive(Debug)]
struct Io {
    writer: OwnedWriteHalf,
    resp_rx: mpsc::Receiver<Value>,
}

/// Live QMP connection.
#[derive(Debug)]
pub struct Conn {
    io: Mutex<Io>,
    events: Mutex<mpsc::Receiver<Value>>,
}

impl Conn {
    /// Dial the socket once: connect, consume the greeting, negotiate
    /// capabilities.
    pub async fn dial(path: &Path) -> Result<Self, QmpError> {
        let stream = UnixStream::connect(path).await.map_err(QmpError::Connect)?;
        let (read_half, mut writer) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        let greeting = read_json(&mut lines).await?;
        if greeting.get("QMP").is_none() {
            return Err(QmpError::Protocol(format!(
                "unexpected greeting: {}",
                greeting
            )));
        }

        write_json(&mut writer, &json!({ "execute": "qmp_capabilities" })).await?;
        // Events may arrive before the handshake response; skip them.
        loop {
            let v = read_json(&mut lines).await?;
            if v.get("return").is_some() {
                break;
            }
            if let Some(err) = v.get("error") {
                return Err(command_error("qmp_capabilities", err));
            }
        }

        let (resp_tx, resp_rx) = mpsc::channel(16);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BACKLOG);

        tokio::spawn(route(lines, resp_tx, event_tx));

        Ok(Self {
            io: Mutex::new(Io { writer, resp_rx }),
            events: Mutex::new(event_rx),
        })
    }

    /// Dial with retry; QEMU takes a moment to create the socket after
    /// spawn.
    pub async fn dial_retry(path: &Path, retries: u32, delay: Duration) -> Result<Self, QmpError> {
        let mut last = QmpError::Closed;
        for _ in 0..retries {
            match Self::dial(path).await {
                Ok(conn) => return Ok(conn),
                Err(e) => last = e,
            }
            tokio::time::sleep(delay).await;
        }
        Err(last)
    }

    /// Send one command and wait for its response.
    async fn execute(&self, command: &str, arguments: Option<Value>) -> Result<Value, QmpError> {
        let mut msg = json!({ "execute": command });
        if let Some(args) = arguments {
            msg["arguments"] = args;
        }

        let mut io = self.io.lock().await;
        write_json(&mut io.writer, &msg).await?;

        match io.resp_rx.recv().await {
            None => Err(QmpError::Closed),
            Some(v) => {
                if let Some(err) = v.get("error") {
                    return Err(command_error(command, err));
                }
                Ok(v.get("return").cloned().unwrap_or(Value::Null))
            }
        }
    }

    /// Resume the guest (`cont`).
    pub async fn start(&self) -> Result<(), QmpError> {
        self.execute("cont", None).await.map(|_| ())
    }

    /// Pause the guest (`stop`).
    pub async fn stop(&self) -> Result<(), QmpError> {
        self.execute("stop", None).await.map(|_| ())
    }

    /// Stream guest state out through `cat`.
    pub async fn migrate_disk(&self, path: &str) -> Result<(), QmpError> {
        let uri = format!("exec:cat > {}", path);
        self.execute("migrate", Some(json!({ "uri": uri })))
            .await
            .map(|_| ())
    }

    /// Raw `query-migrate` result object.
    pub async fn query_migrate(&self) -> Result<Value, QmpError> {
        self.execute("query-migrate", None).await
    }

    /// Hotplug: back a new drive with a host file.
    pub async fn drive_add(&self, id: &str, file: &str) -> Result<Value, QmpError> {
        let cmdline = format!("drive_add 0 id={},if=none,file={}", id, file);
        self.human_monitor(&cmdline).await
    }

    /// Hotplug: attach a USB storage device to a drive.
    pub async fn usb_device_add(&self, id: &str) -> Result<Value, QmpError> {
        self.execute(
            "device_add",
            Some(json!({ "driver": "usb-storage", "id": id, "drive": id })),
        )
        .await
    }

    pub async fn usb_device_del(&self, id: &str) -> Result<Value, QmpError> {
        self.execute("device_del", Some(json!({ "id": id }))).await
    }

    pub async fn drive_del(&self, id: &str) -> Result<Value, QmpError> {
        let cmdline = format!("drive_del {}", id);
        self.human_monitor(&cmdline).await
    }

    /// Escape hatch into the human monitor.
    pub async fn human_monitor(&self, command_line: &str) -> Result<Value, QmpError> {
        self.execute(
            "human-monitor-command",
            Some(json!({ "command-line": command_line })),
        )
        .await
    }

    /// Write a caller-supplied JSON line verbatim and return the next
    /// response.
    pub async fn raw(&self, input: &str) -> Result<String, QmpError> {
        let mut io = self.io.lock().await;
        io.writer.write_all(input.as_bytes()).await?;
        io.writer.write_all(b"\n").await?;
        io.writer.flush().await?;

        match io.resp_rx.recv().await {
            None => Err(QmpError::Closed),
            Some(v) => Ok(v.to_string()),
        }
    }

    /// Next asynchronous event, or `None` once the connection closes.
    pub async fn event(&self) -> Option<Value> {
        let mut events = self.events.lock().await;
        events.recv().await
    }
}

/// Split the read side: events to one channel, responses to the other.
async fn route(
    mut lines: tokio::io::Lines<BufReader<OwnedReadHalf>>,
    resp_tx: mpsc::Sender<Value>,
    event_tx: mpsc::Sender<Value>,
) {
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) | Err(_) => return,
        };
        let v: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                warn!("[qmp] unparseable line from qemu: {}", e);
                continue;
            }
        };

        if v.get("event").is_some() {
            // A slow (or absent) event consumer must not wedge command
            // responses; drop the oldest behavior is fine here.
            if event_tx.try_send(v).is_err() {
                debug!("[qmp] event buffer full, dropping event");
            }
        } else if resp_tx.send(v).await.is_err() {
            return;
        }
    }
}

async fn read_json(
    lines: &mut tokio::io::Lines<BufReader<OwnedReadHalf>>,
) -> Result<Value, QmpError> {
    match lines.next_line().await? {
        None => Err(QmpError::Closed),
        Some(line) => {
            serde_json::from_str(&line).map_err(|e| QmpError::Protocol(e.to_string()))
        }
    }
}

async fn write_json(writer: &mut OwnedWriteHalf, msg: &Value) -> Result<(), QmpError> {
    let mut buf = msg.to_string().into_bytes();
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

fn command_error(command: &str, err: &Value) -> QmpError {
    QmpError::Command {
        command: command.to_string(),
        class: err
            .get("class")
            .and_then(Value::as_str)
            .unwrap_or("GenericError")
            .to_string(),
        desc: err
            .get("desc")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::net::UnixListener;

    /// Minimal QMP endpoint: greeting, handshake, canned replies.
    async fn fake_qemu(path: PathBuf) {
        let listener = UnixListener::bind(&path).unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, mut w) = stream.into_split();

        w.write_all(b"{\"QMP\": {\"version\": {}, \"capabilities\": []}}\n")
            .await
            .unwrap();

        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let v: Value = serde_json::from_str(&line).unwrap();
            let reply = match v["execute"].as_str() {
                Some("qmp_capabilities") => "{\"return\": {}}\n".to_string(),
                Some("cont") => {
                    // Event delivered before the response must not be
                    // mistaken for it.
                    w.write_all(
                        b"{\"event\": \"RESUME\", \"timestamp\": {\"seconds\": 1, \"microseconds\": 0}}\n",
                    )
                    .await
                    .unwrap();
                    "{\"return\": {}}\n".to_string()
                }
                Some("query-migrate") => {
                    "{\"return\": {\"status\": \"active\", \"ram\": {\"total\": 100.0, \"transferred\": 25.0}}}\n"
                        .to_string()
                }
                Some("device_del") => {
                    "{\"error\": {\"class\": \"DeviceNotFound\", \"desc\": \"no device hotplug0\"}}\n"
                        .to_string()
                }
                _ => "{\"return\": {}}\n".to_string(),
            };
            w.write_all(reply.as_bytes()).await.unwrap();
        }
    }

    fn socket_path(tag: &str) -> PathBuf {
        let path = PathBuf::from(format!("/tmp/megad-qmp-test-{}.sock", tag));
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn test_handshake_and_commands() {
        let path = socket_path("basic");
        tokio::spawn(fake_qemu(path.clone()));

        let conn = Conn::dial_retry(&path, 50, Duration::from_millis(10))
            .await
            .unwrap();

        conn.start().await.unwrap();
        conn.stop().await.unwrap();

        let migrate = conn.query_migrate().await.unwrap();
        assert_eq!(migrate["status"], "active");
        assert_eq!(migrate["ram"]["total"], 100.0);

        // The RESUME event sent ahead of the cont response lands on the
        // event channel.
        let event = conn.event().await.unwrap();
        assert_eq!(event["event"], "RESUME");

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_command_error_is_typed() {
        let path = socket_path("error");
        tokio::spawn(fake_qemu(path.clone()));

        let conn = Conn::dial_retry(&path, 50, Duration::from_millis(10))
            .await
            .unwrap();

        let err = conn.usb_device_del("hotplug0").await.unwrap_err();
        match err {
            QmpError::Command { class, .. } => assert_eq!(class, "DeviceNotFound"),
            other => panic!("expected Command, got {:?}", other),
        }

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_dial_retry_gives_up() {
        let path = PathBuf::from("/tmp/megad-qmp-test-nobody-home.sock");
        let _ = std::fs::remove_file(&path);
        let err = Conn::dial_retry(&path, 3, Duration::from_millis(5))
            .await
            .unwrap_err();
        assert!(matches!(err, QmpError::Connect(_)));
    }
}
