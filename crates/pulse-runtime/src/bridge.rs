//! JSON-lines bridge to an external instrumentation helper.
//!
//! The helper executable is launched on first use and relaunched if it
//! exits. Requests are written to its stdin as one JSON object per line:
//!
//! ```text
//! → {"id": 7, "op": "attach", "pid": 1234, "session": "…", "attachment": "att-3"}
//! ← {"id": 7, "ok": true, "result": null}
//! ← {"attachment": "att-3", "message": {"type": "send", "payload": {…}}}
//! ← {"attachment": "att-3", "detached": true}
//! ```
//!
//! Attachment ids are chosen by this side so the message channel exists
//! before the helper can emit anything for it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use pulse_core::models::ProcessDescriptor;
use pulse_core::{PulseError, Result};

use crate::engine::{Attachment, InstrumentationEngine};

/// Buffered observer messages per attachment. When a consumer falls this
/// far behind, further messages for it are dropped so the single reader
/// keeps serving responses and other attachments.
const ATTACHMENT_BUFFER: usize = 256;

type Pending = Arc<StdMutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;
type Attachments = Arc<StdMutex<HashMap<String, mpsc::Sender<Value>>>>;

/// How to launch the helper.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Observer script path passed along with every attach request.
    pub agent_script: Option<PathBuf>,
    /// Upper bound for one request/response round trip.
    pub request_timeout: Duration,
}

/// [`InstrumentationEngine`] backed by a helper process.
pub struct BridgeEngine {
    config: BridgeConfig,
    conn: Mutex<Option<Arc<BridgeConnection>>>,
    next_attachment: AtomicU64,
}

struct BridgeConnection {
    stdin: Mutex<ChildStdin>,
    pending: Pending,
    attachments: Attachments,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    dropped: Arc<AtomicU64>,
    // Held so the helper is killed when the connection is dropped.
    _child: Child,
}

impl BridgeEngine {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            conn: Mutex::new(None),
            next_attachment: AtomicU64::new(1),
        }
    }

    /// The live connection, launching the helper if it is not running.
    async fn connection(&self) -> Result<Arc<BridgeConnection>> {
        let mut guard = self.conn.lock().await;
        if let Some(conn) = guard.as_ref() {
            if conn.alive.load(Ordering::SeqCst) {
                return Ok(Arc::clone(conn));
            }
            warn!("instrumentation bridge exited, relaunching");
        }
        let conn = Arc::new(self.launch()?);
        *guard = Some(Arc::clone(&conn));
        Ok(conn)
    }

    fn launch(&self) -> Result<BridgeConnection> {
        let mut child = Command::new(&self.config.command)
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PulseError::UpstreamUnavailable(format!(
                    "failed to launch instrumentation bridge {:?}: {e}",
                    self.config.command
                ))
            })?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(PulseError::UpstreamUnavailable(
                "instrumentation bridge has no stdio pipes".to_string(),
            ));
        };
        info!(command = %self.config.command, pid = child.id(), "instrumentation bridge launched");

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "pulse_runtime::bridge::stderr", "{line}");
                }
            });
        }

        let pending: Pending = Arc::default();
        let attachments: Attachments = Arc::default();
        let alive = Arc::new(AtomicBool::new(true));
        let dropped = Arc::new(AtomicU64::new(0));

        {
            let pending = Arc::clone(&pending);
            let attachments = Arc::clone(&attachments);
            let alive = Arc::clone(&alive);
            let dropped = Arc::clone(&dropped);
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => route_line(&line, &pending, &attachments, &dropped),
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "failed reading from instrumentation bridge");
                            break;
                        }
                    }
                }
                alive.store(false, Ordering::SeqCst);
                shutdown(&pending, &attachments);
            });
        }

        Ok(BridgeConnection {
            stdin: Mutex::new(stdin),
            pending,
            attachments,
            next_id: AtomicU64::new(1),
            alive,
            dropped,
            _child: child,
        })
    }

    /// Send one request and wait for its response.
    async fn request(&self, op: &str, params: Map<String, Value>) -> Result<Value> {
        let conn = self.connection().await?;
        conn.request(op, params, self.config.request_timeout).await
    }

    /// Observer messages dropped on the current connection because their
    /// attachment's buffer was full.
    pub async fn dropped_messages(&self) -> u64 {
        self.conn
            .lock()
            .await
            .as_ref()
            .map_or(0, |c| c.dropped.load(Ordering::Relaxed))
    }
}

impl BridgeConnection {
    async fn request(
        &self,
        op: &str,
        mut params: Map<String, Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending)?.insert(id, tx);

        params.insert("id".to_string(), json!(id));
        params.insert("op".to_string(), json!(op));
        let mut line = serde_json::to_string(&Value::Object(params))?;
        line.push('\n');

        let written = {
            let mut stdin = self.stdin.lock().await;
            match stdin.write_all(line.as_bytes()).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            lock(&self.pending)?.remove(&id);
            return Err(PulseError::UpstreamUnavailable(format!(
                "failed to write {op} request to bridge: {e}"
            )));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PulseError::UpstreamUnavailable(format!(
                "bridge closed before answering {op}"
            ))),
            Err(_) => {
                lock(&self.pending)?.remove(&id);
                Err(PulseError::UpstreamUnavailable(format!(
                    "{op} timed out after {}s",
                    timeout.as_secs_f64()
                )))
            }
        }
    }
}

impl InstrumentationEngine for BridgeEngine {
    async fn enumerate_processes(&self) -> Result<Vec<ProcessDescriptor>> {
        let result = self.request("enumerate", Map::new()).await?;
        Ok(serde_json::from_value(result)?)
    }

    async fn spawn(&self, program: &Path) -> Result<u32> {
        let mut params = Map::new();
        params.insert("program".to_string(), json!(program.display().to_string()));
        let result = self.request("spawn", params).await?;
        result
            .get("pid")
            .and_then(Value::as_u64)
            .and_then(|p| u32::try_from(p).ok())
            .ok_or_else(|| {
                PulseError::UpstreamUnavailable(format!("spawn returned no pid: {result}"))
            })
    }

    async fn attach(&self, pid: u32, session_id: &str) -> Result<Attachment> {
        let conn = self.connection().await?;
        let id = format!(
            "att-{}",
            self.next_attachment.fetch_add(1, Ordering::SeqCst)
        );

        let (tx, rx) = mpsc::channel(ATTACHMENT_BUFFER);
        lock(&conn.attachments)?.insert(id.clone(), tx);

        let mut params = Map::new();
        params.insert("pid".to_string(), json!(pid));
        params.insert("session".to_string(), json!(session_id));
        params.insert("attachment".to_string(), json!(id));
        if let Some(script) = &self.config.agent_script {
            params.insert("script".to_string(), json!(script.display().to_string()));
        }

        if let Err(e) = conn
            .request("attach", params, self.config.request_timeout)
            .await
        {
            lock(&conn.attachments)?.remove(&id);
            return Err(e);
        }

        debug!(pid, attachment = %id, "attached");
        Ok(Attachment {
            id,
            pid,
            messages: rx,
        })
    }

    async fn resume(&self, pid: u32) -> Result<()> {
        let mut params = Map::new();
        params.insert("pid".to_string(), json!(pid));
        self.request("resume", params).await.map(|_| ())
    }

    async fn detach(&self, attachment_id: &str) -> Result<()> {
        let conn = self.connection().await?;
        let mut params = Map::new();
        params.insert("attachment".to_string(), json!(attachment_id));
        let result = conn
            .request("detach", params, self.config.request_timeout)
            .await;
        // The channel closes either way; nothing more will be routed to it.
        lock(&conn.attachments)?.remove(attachment_id);
        result.map(|_| ())
    }

    async fn kill(&self, pid: u32) -> Result<()> {
        let mut params = Map::new();
        params.insert("pid".to_string(), json!(pid));
        self.request("kill", params).await.map(|_| ())
    }
}

// ── Line routing ──────────────────────────────────────────────────────────────

/// Dispatch one line from the helper: a response completes its pending
/// request, an attachment message goes to that attachment's channel.
///
/// Never waits on a consumer; a message for a full channel is counted in
/// `dropped` and discarded.
fn route_line(line: &str, pending: &Pending, attachments: &Attachments, dropped: &AtomicU64) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "unparseable line from instrumentation bridge");
            return;
        }
    };

    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        let waiter = match lock(pending) {
            Ok(mut p) => p.remove(&id),
            Err(_) => None,
        };
        let Some(waiter) = waiter else {
            debug!(id, "response for unknown or expired request");
            return;
        };
        let ok = value.get("ok").and_then(Value::as_bool).unwrap_or(false);
        let outcome = if ok {
            Ok(value.get("result").cloned().unwrap_or(Value::Null))
        } else {
            let reason = value
                .get("error")
                .map(|e| e.as_str().map_or_else(|| e.to_string(), str::to_string))
                .unwrap_or_else(|| "request failed".to_string());
            Err(PulseError::UpstreamUnavailable(reason))
        };
        let _ = waiter.send(outcome);
        return;
    }

    let Some(attachment) = value.get("attachment").and_then(Value::as_str) else {
        warn!(line, "unrecognised line from instrumentation bridge");
        return;
    };

    if value.get("detached").and_then(Value::as_bool) == Some(true) {
        if let Ok(mut a) = lock(attachments) {
            a.remove(attachment);
        }
        debug!(attachment, "attachment detached by bridge");
        return;
    }

    let Some(message) = value.get("message") else {
        warn!(attachment, "attachment line without message");
        return;
    };
    let sender = lock(attachments).ok().and_then(|a| a.get(attachment).cloned());
    let Some(tx) = sender else {
        debug!(attachment, "message for unknown attachment dropped");
        return;
    };
    match tx.try_send(message.clone()) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            let total = dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if total == 1 || total % 1000 == 0 {
                warn!(attachment, dropped = total, "attachment buffer full, dropping messages");
            }
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(attachment, "attachment receiver dropped");
        }
    }
}

/// Fail every waiting request and close every attachment channel.
fn shutdown(pending: &Pending, attachments: &Attachments) {
    if let Ok(mut p) = lock(pending) {
        for (_, waiter) in p.drain() {
            let _ = waiter.send(Err(PulseError::UpstreamUnavailable(
                "instrumentation bridge exited".to_string(),
            )));
        }
    }
    if let Ok(mut a) = lock(attachments) {
        a.clear();
    }
}

fn lock<T>(m: &StdMutex<T>) -> Result<std::sync::MutexGuard<'_, T>> {
    m.lock()
        .map_err(|_| PulseError::Other(anyhow::anyhow!("bridge state lock poisoned")))
}
