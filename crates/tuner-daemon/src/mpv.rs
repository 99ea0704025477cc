//! mpv IPC driver with separated reader/writer tasks.
//!
//! ```text
//!   MpvProcess::spawn()
//!         │
//!         ├── writer_task   ← receives PendingRequest via mpsc, serialises → socket
//!         └── reader_task   ← reads JSON lines from socket
//!                                ├── response (has request_id) → matched oneshot::Sender
//!                                └── event / property-change   → event_tx channel
//! ```
//!
//! Every mpv the daemon runs (the station stream, the tuning static) is one
//! `MpvProcess` on its own socket.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use tuner_proto::error::RadioError;

static NEXT_REQ_ID: AtomicU64 = AtomicU64::new(1);

/// Fixed observe_property IDs, matched in property-change events.
pub const OBS_CORE_IDLE: u64 = 1;
pub const OBS_PAUSED_FOR_CACHE: u64 = 2;
pub const OBS_EOF_REACHED: u64 = 3;

const IPC_REPLY_TIMEOUT: Duration = Duration::from_secs(5);
const SOCKET_WAIT_STEPS: u32 = 50;
const SOCKET_WAIT_STEP: Duration = Duration::from_millis(100);

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<anyhow::Result<Value>>>>>;

struct PendingRequest {
    req_id: u64,
    payload: String,
    reply: oneshot::Sender<anyhow::Result<Value>>,
}

/// An mpv event / property-change that arrived unsolicited (no request_id).
#[derive(Debug, Clone)]
pub struct MpvEvent {
    pub raw: Value,
}

impl MpvEvent {
    /// Returns `Some((obs_id, data))` if this is a property-change event.
    pub fn as_property_change(&self) -> Option<(u64, &Value)> {
        if self.raw.get("event")?.as_str()? == "property-change" {
            let id = self.raw.get("id")?.as_u64()?;
            let data = self.raw.get("data").unwrap_or(&Value::Null);
            Some((id, data))
        } else {
            None
        }
    }

    /// Returns the event name, e.g. "end-file", "start-file", "file-loaded".
    pub fn event_name(&self) -> Option<&str> {
        self.raw.get("event")?.as_str()
    }

    /// `end-file` with reason `error` (unreachable URL, bad codec, ...).
    pub fn is_end_file_error(&self) -> bool {
        self.event_name() == Some("end-file")
            && self.raw.get("reason").and_then(|r| r.as_str()) == Some("error")
    }
}

/// Cloneable handle to the mpv writer task.
#[derive(Clone)]
pub struct MpvHandle {
    tx: mpsc::Sender<PendingRequest>,
}

impl MpvHandle {
    pub async fn send(&self, command: Value) -> anyhow::Result<Value> {
        let req_id = NEXT_REQ_ID.fetch_add(1, Ordering::Relaxed);
        let msg = json!({ "command": command, "request_id": req_id });
        let mut raw = serde_json::to_string(&msg)?;
        raw.push('\n');

        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(PendingRequest {
                req_id,
                payload: raw,
                reply: reply_tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("mpv writer task gone"))?;

        tokio::time::timeout(IPC_REPLY_TIMEOUT, reply_rx)
            .await
            .map_err(|_| anyhow::anyhow!("mpv IPC timeout for req={}", req_id))?
            .map_err(|_| anyhow::anyhow!("mpv reply channel dropped req={}", req_id))?
    }

    pub async fn set_volume(&self, level: u8) -> anyhow::Result<()> {
        self.send(json!(["set_property", "volume", level.min(100)]))
            .await?;
        Ok(())
    }

    pub async fn quit(&self) {
        let _ = self.send(json!(["quit"])).await;
    }

    /// Register the properties the stream monitor derives health from.
    pub async fn observe_playback(&self) {
        let props = [
            (OBS_CORE_IDLE, "core-idle"),
            (OBS_PAUSED_FOR_CACHE, "paused-for-cache"),
            (OBS_EOF_REACHED, "eof-reached"),
        ];
        for (id, name) in &props {
            match self.send(json!(["observe_property", id, name])).await {
                Ok(_) => debug!("mpv: observe_property id={} name={}", id, name),
                Err(e) => warn!("mpv: observe_property {} failed: {}", name, e),
            }
        }
    }
}

/// A running mpv child together with its IPC connection.
pub struct MpvProcess {
    pub child: Child,
    pub handle: MpvHandle,
    pub events: mpsc::Receiver<MpvEvent>,
    pub socket_path: PathBuf,
}

impl MpvProcess {
    /// Spawn `binary` with `args` plus an IPC server on `socket_path`, then
    /// connect to it.  The child is killed if it is dropped.
    pub async fn spawn(
        binary: &Path,
        socket_path: PathBuf,
        args: &[String],
    ) -> Result<Self, RadioError> {
        let _ = tokio::fs::remove_file(&socket_path).await;

        let mut child = tokio::process::Command::new(binary)
            .arg(format!("--input-ipc-server={}", socket_path.display()))
            .args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| RadioError::Launch(format!("spawn {}: {}", binary.display(), e)))?;

        let stream = match connect_when_ready(&socket_path, &mut child).await {
            Ok(s) => s,
            Err(e) => {
                let _ = child.kill().await;
                return Err(e);
            }
        };
        info!("mpv: connected to {}", socket_path.display());

        let (event_tx, events) = mpsc::channel(64);
        let handle = start_io_tasks(stream, event_tx);
        Ok(Self {
            child,
            handle,
            events,
            socket_path,
        })
    }

    /// Ask mpv to quit, give it `grace` to exit, then kill and reap it.  The
    /// quit request shares the grace period, so a wedged IPC connection cannot
    /// hold the process alive.  Always removes the socket file.
    pub async fn shutdown(mut self, grace: Duration) {
        let handle = self.handle.clone();
        let child = &mut self.child;
        let quit = async {
            handle.quit().await;
            child.wait().await
        };
        if tokio::time::timeout(grace, quit).await.is_err() {
            debug!("mpv: quit timed out, killing");
            if let Err(e) = self.child.kill().await {
                warn!("mpv: kill failed: {}", e);
            }
        }
        let _ = tokio::fs::remove_file(&self.socket_path).await;
    }
}

async fn connect_when_ready(socket_path: &Path, child: &mut Child) -> Result<UnixStream, RadioError> {
    for _ in 0..SOCKET_WAIT_STEPS {
        if let Ok(Some(status)) = child.try_wait() {
            return Err(RadioError::Launch(format!(
                "mpv exited during startup ({})",
                status
            )));
        }
        if socket_path.exists() {
            match UnixStream::connect(socket_path).await {
                Ok(stream) => return Ok(stream),
                Err(e) => debug!("mpv: socket not accepting yet: {}", e),
            }
        }
        tokio::time::sleep(SOCKET_WAIT_STEP).await;
    }
    Err(RadioError::Launch(format!(
        "mpv IPC socket {} did not appear",
        socket_path.display()
    )))
}

/// Quit and remove every mpv socket left behind by an earlier daemon run.
pub async fn cleanup_orphans(sockets: Vec<PathBuf>) {
    for sock in sockets {
        info!("mpv: cleaning up orphaned socket {}", sock.display());
        if let Ok(Ok(mut stream)) =
            tokio::time::timeout(Duration::from_secs(1), UnixStream::connect(&sock)).await
        {
            let _ = stream.write_all(b"{\"command\": [\"quit\"]}\n").await;
        }
        let _ = tokio::fs::remove_file(&sock).await;
    }
}

pub(crate) fn start_io_tasks(stream: UnixStream, event_tx: mpsc::Sender<MpvEvent>) -> MpvHandle {
    let (read_half, write_half) = stream.into_split();
    let reader = BufReader::new(read_half);

    let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
    let (cmd_tx, cmd_rx) = mpsc::channel::<PendingRequest>(64);

    tokio::spawn(writer_task(write_half, cmd_rx, pending.clone()));
    tokio::spawn(reader_task(reader, pending, event_tx));

    MpvHandle { tx: cmd_tx }
}

async fn fail_all(pending: &PendingMap, reason: &str) {
    let mut map = pending.lock().await;
    for (_, tx) in map.drain() {
        let _ = tx.send(Err(anyhow::anyhow!("{}", reason)));
    }
}

async fn reader_task<R>(mut reader: BufReader<R>, pending: PendingMap, event_tx: mpsc::Sender<MpvEvent>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("mpv reader: connection closed");
                fail_all(&pending, "mpv IPC connection closed").await;
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let val: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(e) => {
                        debug!("mpv reader: invalid json '{}': {}", trimmed, e);
                        continue;
                    }
                };

                if let Some(req_id) = val.get("request_id").and_then(|v| v.as_u64()) {
                    let mut map = pending.lock().await;
                    if let Some(tx) = map.remove(&req_id) {
                        let _ = tx.send(parse_reply(val));
                    } else {
                        debug!("mpv reader: response for unknown req={}", req_id);
                    }
                } else {
                    debug!("mpv reader: event {}", trimmed);
                    // Receiver gone means nobody monitors this process any more.
                    if event_tx.send(MpvEvent { raw: val }).await.is_err() {
                        debug!("mpv reader: event receiver dropped");
                    }
                }
            }
            Err(e) => {
                warn!("mpv reader: read error: {}", e);
                fail_all(&pending, &format!("mpv IPC read error: {}", e)).await;
                break;
            }
        }
    }
}

fn parse_reply(val: Value) -> anyhow::Result<Value> {
    if val["error"].as_str() == Some("success") {
        Ok(val)
    } else {
        let err = val["error"].as_str().unwrap_or("unknown error").to_string();
        Err(anyhow::anyhow!("mpv error: {}", err))
    }
}

async fn writer_task<W>(mut writer: W, mut rx: mpsc::Receiver<PendingRequest>, pending: PendingMap)
where
    W: tokio::io::AsyncWrite + Unpin,
{
    while let Some(req) = rx.recv().await {
        // Register before writing so the reader can always match the reply.
        pending.lock().await.insert(req.req_id, req.reply);
        debug!("mpv writer: send req={} payload={}", req.req_id, req.payload.trim());
        if let Err(e) = writer.write_all(req.payload.as_bytes()).await {
            warn!("mpv writer: write error: {}", e);
            if let Some(tx) = pending.lock().await.remove(&req.req_id) {
                let _ = tx.send(Err(anyhow::anyhow!("mpv write error: {}", e)));
            }
            break;
        }
    }
    debug!("mpv writer: task exiting");
}
