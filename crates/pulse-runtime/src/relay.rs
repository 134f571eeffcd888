//! Monitoring Control Relay.
//!
//! Turns start/stop commands into instrumentation directives and keeps one
//! [`InstrumentationHandle`] per monitored session so stop knows what to
//! tear down.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use pulse_core::models::{EnabledModes, MonitorMode};
use pulse_core::settings::TerminatePolicy;
use pulse_core::{PulseError, Result};
use pulse_store::{ArtifactStore, SessionRegistry};

use crate::engine::{Attachment, InstrumentationEngine};
use crate::router::{EventRouter, RouterStats};

// ── Public types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub enabled_modes: EnabledModes,
    /// Bound on every single engine directive.
    pub directive_timeout: Duration,
    pub terminate: TerminatePolicy,
    /// How long stop waits for a subscription to drain before aborting it.
    pub teardown_grace: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            enabled_modes: EnabledModes::default(),
            directive_timeout: Duration::from_secs(30),
            terminate: TerminatePolicy::default(),
            teardown_grace: Duration::from_secs(2),
        }
    }
}

/// A start command.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub session_id: String,
    pub mode: MonitorMode,
    /// Target PIDs for attach-specific.
    pub processes: Vec<u32>,
    /// Case-insensitive name substring for attach-all.
    pub filter: Option<String>,
    /// Artifact to spawn; defaults to the session's own upload.
    pub file_name: Option<String>,
}

impl StartRequest {
    pub fn new(session_id: impl Into<String>, mode: MonitorMode) -> Self {
        Self {
            session_id: session_id.into(),
            mode,
            processes: Vec::new(),
            filter: None,
            file_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOutcome {
    /// The spawned PID, or the first attached one.
    pub monitoring_pid: u32,
    pub attached: Vec<u32>,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StopOutcome {
    /// Whether a tracked handle existed for the session.
    pub had_handle: bool,
    /// Teardown problems; logged and otherwise ignored.
    pub warnings: Vec<String>,
}

// ── Handle bookkeeping ────────────────────────────────────────────────────────

#[derive(Debug)]
struct Target {
    pid: u32,
    attachment_id: String,
}

/// Everything stop needs to undo a start. Built up while the directive
/// runs, so a failed directive can be undone the same way.
struct InstrumentationHandle {
    mode: MonitorMode,
    targets: Vec<Target>,
    subscriptions: Vec<JoinHandle<RouterStats>>,
    spawned: Option<u32>,
}

impl InstrumentationHandle {
    fn new(mode: MonitorMode) -> Self {
        Self {
            mode,
            targets: Vec::new(),
            subscriptions: Vec::new(),
            spawned: None,
        }
    }

    fn pids(&self) -> Vec<u32> {
        self.targets.iter().map(|t| t.pid).collect()
    }
}

/// A session's entry in the handle map. `Starting` reserves the session
/// while directives run without the map locked.
enum Slot {
    Starting { stop_requested: bool },
    Running(InstrumentationHandle),
}

// ── MonitoringControlRelay ────────────────────────────────────────────────────

pub struct MonitoringControlRelay<E: InstrumentationEngine> {
    engine: Arc<E>,
    registry: SessionRegistry,
    artifacts: ArtifactStore,
    router: EventRouter,
    config: RelayConfig,
    slots: Mutex<HashMap<String, Slot>>,
}

impl<E: InstrumentationEngine> MonitoringControlRelay<E> {
    pub fn new(
        engine: Arc<E>,
        registry: SessionRegistry,
        artifacts: ArtifactStore,
        router: EventRouter,
        config: RelayConfig,
    ) -> Self {
        Self {
            engine,
            registry,
            artifacts,
            router,
            config,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn enabled_modes(&self) -> &EnabledModes {
        &self.config.enabled_modes
    }

    /// Begin monitoring a session.
    ///
    /// Validation happens before any directive is issued. The session is
    /// reserved for the duration of the directive, so a concurrent start
    /// for it sees `AlreadyMonitoring` while other sessions are unaffected.
    /// A stop that lands mid-start undoes the start once its directive
    /// returns and the start fails with `StartCancelled`.
    pub async fn start(&self, request: StartRequest) -> Result<StartOutcome> {
        let session = self.registry.get_session(&request.session_id)?;

        if !self.config.enabled_modes.contains(request.mode) {
            return Err(PulseError::InvalidMode(format!(
                "{} is not enabled",
                request.mode
            )));
        }

        let program = match request.mode {
            MonitorMode::AttachSpecific if request.processes.is_empty() => {
                return Err(PulseError::MissingParameter(
                    "processes (attach-specific needs at least one PID)".to_string(),
                ));
            }
            MonitorMode::SpawnUploaded => {
                let name = request.file_name.as_deref().unwrap_or(&session.file_name);
                let path = self.artifacts.resolve(name).map_err(|_| {
                    PulseError::MissingParameter(format!("no stored artifact named {name:?}"))
                })?;
                Some(path)
            }
            _ => None,
        };

        {
            let mut slots = self.slots.lock().await;
            if slots.contains_key(&session.id) {
                return Err(PulseError::AlreadyMonitoring(session.id));
            }
            slots.insert(
                session.id.clone(),
                Slot::Starting {
                    stop_requested: false,
                },
            );
        }

        let started_at = Utc::now();
        let launched = self
            .launch(&session.id, &request, program, started_at)
            .await;
        let handle = match launched {
            Ok(handle) => handle,
            Err(e) => {
                self.slots.lock().await.remove(&session.id);
                return Err(e);
            }
        };

        let monitoring_pid = handle
            .spawned
            .or_else(|| handle.targets.first().map(|t| t.pid))
            .unwrap_or_else(std::process::id);
        let attached = handle.pids();

        let mut slots = self.slots.lock().await;
        let cancelled = matches!(
            slots.get(&session.id),
            Some(Slot::Starting {
                stop_requested: true
            })
        );
        if cancelled {
            slots.remove(&session.id);
            drop(slots);
            info!(session_id = %session.id, "stop arrived during start, undoing");
            self.teardown(&session.id, handle, self.config.terminate)
                .await;
            self.registry.mark_monitoring_ended(&session.id, Utc::now())?;
            return Err(PulseError::StartCancelled(session.id));
        }

        info!(
            session_id = %session.id,
            mode = %request.mode,
            monitoring_pid,
            targets = attached.len(),
            "monitoring started"
        );
        slots.insert(session.id, Slot::Running(handle));

        Ok(StartOutcome {
            monitoring_pid,
            attached,
            started_at,
        })
    }

    /// Stop monitoring a session.
    ///
    /// Teardown is best-effort; the session is marked ended regardless.
    pub async fn stop(&self, session_id: &str) -> Result<StopOutcome> {
        self.registry.get_session(session_id)?;

        let handle = {
            let mut slots = self.slots.lock().await;
            match slots.remove(session_id) {
                Some(Slot::Running(handle)) => Some(handle),
                Some(Slot::Starting { .. }) => {
                    slots.insert(
                        session_id.to_string(),
                        Slot::Starting {
                            stop_requested: true,
                        },
                    );
                    debug!(session_id, "stop during start, start will be undone");
                    None
                }
                None => None,
            }
        };

        let had_handle = handle.is_some();
        let warnings = match handle {
            Some(handle) => {
                self.teardown(session_id, handle, self.config.terminate)
                    .await
            }
            None => {
                debug!(session_id, "stop without a tracked handle");
                Vec::new()
            }
        };

        self.registry.mark_monitoring_ended(session_id, Utc::now())?;
        info!(session_id, warnings = warnings.len(), "monitoring stopped");

        Ok(StopOutcome {
            had_handle,
            warnings,
        })
    }

    /// Stop every tracked session, including ones still starting, for
    /// shutdown.
    pub async fn stop_all(&self) {
        let mut ids: Vec<String> = self.slots.lock().await.keys().cloned().collect();
        ids.sort();
        for session_id in ids {
            if let Err(e) = self.stop(&session_id).await {
                warn!(session_id, error = %e, "failed to stop session during shutdown");
            }
        }
    }

    /// Sessions with a running handle, sorted.
    pub async fn active_sessions(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .slots
            .lock()
            .await
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Running(_)))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub async fn is_monitoring(&self, session_id: &str) -> bool {
        matches!(
            self.slots.lock().await.get(session_id),
            Some(Slot::Running(_))
        )
    }

    // ── Directives ────────────────────────────────────────────────────────

    /// Issue the mode's directive and open the session window.
    async fn launch(
        &self,
        session_id: &str,
        request: &StartRequest,
        program: Option<PathBuf>,
        started_at: DateTime<Utc>,
    ) -> Result<InstrumentationHandle> {
        let handle = match (request.mode, program) {
            (MonitorMode::AttachAll, _) => {
                self.attach_all(session_id, request.filter.as_deref()).await?
            }
            (MonitorMode::AttachSpecific, _) => {
                self.attach_specific(session_id, &request.processes).await?
            }
            (MonitorMode::SpawnUploaded, Some(program)) => {
                // Spawn marks the window itself, before the target runs.
                return self.spawn_uploaded(session_id, program, started_at).await;
            }
            (MonitorMode::SpawnUploaded, None) => {
                return Err(PulseError::MissingParameter("fileName".to_string()));
            }
        };

        if let Err(e) = self.registry.mark_monitoring_started(session_id, started_at) {
            self.rollback(session_id, handle).await;
            return Err(e);
        }
        Ok(handle)
    }

    /// Bound one engine call by the directive timeout.
    async fn directive<T>(&self, what: &str, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.directive_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(PulseError::UpstreamUnavailable(format!(
                "{what} timed out after {}s",
                self.config.directive_timeout.as_secs_f64()
            ))),
        }
    }

    /// Record a fresh attachment and start routing its messages at once,
    /// so its buffer drains while further directives run.
    fn track(&self, session_id: &str, handle: &mut InstrumentationHandle, attachment: Attachment) {
        handle.subscriptions.push(self.router.subscribe(
            session_id.to_string(),
            attachment.pid,
            attachment.messages,
        ));
        handle.targets.push(Target {
            pid: attachment.pid,
            attachment_id: attachment.id,
        });
    }

    /// Attach to every visible process whose name contains `filter`.
    /// Individual failures are skipped; only a total failure is an error.
    async fn attach_all(
        &self,
        session_id: &str,
        filter: Option<&str>,
    ) -> Result<InstrumentationHandle> {
        let me = std::process::id();
        let needle = filter.map(str::to_lowercase).filter(|f| !f.is_empty());

        let candidates: Vec<_> = self
            .directive("enumerate", self.engine.enumerate_processes())
            .await?
            .into_iter()
            .filter(|p| p.pid != me)
            .filter(|p| {
                needle
                    .as_deref()
                    .map_or(true, |n| p.name.to_lowercase().contains(n))
            })
            .collect();

        if candidates.is_empty() {
            return Err(PulseError::InvalidRequest(match filter {
                Some(f) => format!("no process name contains {f:?}"),
                None => "no processes to attach to".to_string(),
            }));
        }

        let mut handle = InstrumentationHandle::new(MonitorMode::AttachAll);
        for process in &candidates {
            match self
                .directive("attach", self.engine.attach(process.pid, session_id))
                .await
            {
                Ok(a) => self.track(session_id, &mut handle, a),
                Err(e) => {
                    debug!(pid = process.pid, name = %process.name, error = %e, "attach skipped");
                }
            }
        }

        if handle.targets.is_empty() {
            return Err(PulseError::UpstreamUnavailable(format!(
                "could not attach to any of {} matching processes",
                candidates.len()
            )));
        }
        if handle.targets.len() < candidates.len() {
            warn!(
                session_id,
                attached = handle.targets.len(),
                candidates = candidates.len(),
                "attached to a subset of matching processes"
            );
        }

        Ok(handle)
    }

    /// Attach to every PID or to none.
    async fn attach_specific(&self, session_id: &str, pids: &[u32]) -> Result<InstrumentationHandle> {
        let mut handle = InstrumentationHandle::new(MonitorMode::AttachSpecific);
        for &pid in pids {
            match self
                .directive("attach", self.engine.attach(pid, session_id))
                .await
            {
                Ok(a) => self.track(session_id, &mut handle, a),
                Err(e) => {
                    warn!(session_id, pid, error = %e, "attach failed, rolling back");
                    self.rollback(session_id, handle).await;
                    return Err(e);
                }
            }
        }
        Ok(handle)
    }

    /// Spawn suspended, attach, open the session window, then resume.
    async fn spawn_uploaded(
        &self,
        session_id: &str,
        program: PathBuf,
        started_at: DateTime<Utc>,
    ) -> Result<InstrumentationHandle> {
        let pid = self.directive("spawn", self.engine.spawn(&program)).await?;
        debug!(session_id, pid, program = %program.display(), "spawned suspended");

        let mut handle = InstrumentationHandle::new(MonitorMode::SpawnUploaded);
        handle.spawned = Some(pid);

        match self
            .directive("attach", self.engine.attach(pid, session_id))
            .await
        {
            Ok(a) => self.track(session_id, &mut handle, a),
            Err(e) => {
                self.rollback(session_id, handle).await;
                return Err(e);
            }
        }

        if let Err(e) = self.registry.mark_monitoring_started(session_id, started_at) {
            self.rollback(session_id, handle).await;
            return Err(e);
        }

        if let Err(e) = self.directive("resume", self.engine.resume(pid)).await {
            self.rollback(session_id, handle).await;
            if let Err(end) = self.registry.mark_monitoring_ended(session_id, Utc::now()) {
                warn!(session_id, error = %end, "failed to close window after resume failure");
            }
            return Err(e);
        }

        Ok(handle)
    }

    /// Undo a partially completed directive: detach everything, kill what
    /// was spawned.
    async fn rollback(&self, session_id: &str, handle: InstrumentationHandle) {
        let warnings = self
            .teardown(session_id, handle, TerminatePolicy::SpawnedOnly)
            .await;
        if !warnings.is_empty() {
            warn!(session_id, problems = warnings.len(), "rollback incomplete");
        }
    }

    async fn teardown(
        &self,
        session_id: &str,
        handle: InstrumentationHandle,
        terminate: TerminatePolicy,
    ) -> Vec<String> {
        let mut warnings = Vec::new();

        for target in &handle.targets {
            if let Err(e) = self
                .directive("detach", self.engine.detach(&target.attachment_id))
                .await
            {
                warn!(session_id, pid = target.pid, error = %e, "detach failed");
                warnings.push(format!("detach {}: {e}", target.pid));
            }
        }

        let doomed = match terminate {
            TerminatePolicy::SpawnedOnly => handle.spawned.into_iter().collect(),
            TerminatePolicy::All => {
                let mut pids = handle.pids();
                if let Some(pid) = handle.spawned.filter(|p| !pids.contains(p)) {
                    pids.push(pid);
                }
                pids
            }
            TerminatePolicy::Never => Vec::new(),
        };
        for pid in doomed {
            if let Err(e) = self.directive("kill", self.engine.kill(pid)).await {
                warn!(session_id, pid, error = %e, "terminate failed");
                warnings.push(format!("kill {pid}: {e}"));
            }
        }

        for mut subscription in handle.subscriptions {
            match tokio::time::timeout(self.config.teardown_grace, &mut subscription).await {
                Ok(Ok(stats)) => debug!(
                    session_id,
                    received = stats.received,
                    forwarded = stats.forwarded,
                    "subscription drained"
                ),
                Ok(Err(e)) => warn!(session_id, error = %e, "subscription task failed"),
                Err(_) => {
                    subscription.abort();
                    debug!(session_id, "subscription aborted after grace period");
                }
            }
        }

        debug!(session_id, mode = %handle.mode, "teardown complete");
        warnings
    }
}
