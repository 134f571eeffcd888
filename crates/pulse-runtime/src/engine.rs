//! Interface to the external dynamic-instrumentation engine.

use std::future::Future;
use std::path::Path;

use serde_json::Value;
use tokio::sync::mpsc;

use pulse_core::models::ProcessDescriptor;
use pulse_core::Result;

/// A live observer attachment on one process.
///
/// `messages` yields every message the injected observer emits, in order,
/// and closes when the attachment is detached or the target exits.
#[derive(Debug)]
pub struct Attachment {
    /// Engine-assigned identifier used for [`InstrumentationEngine::detach`].
    pub id: String,
    pub pid: u32,
    pub messages: mpsc::Receiver<Value>,
}

/// Primitives the engine offers. Each call resolves once the engine has
/// confirmed the directive; callers bound it with their own timeout.
pub trait InstrumentationEngine: Send + Sync + 'static {
    /// Processes visible to the engine.
    fn enumerate_processes(&self) -> impl Future<Output = Result<Vec<ProcessDescriptor>>> + Send;

    /// Start `program` suspended at its entry point and return its PID.
    fn spawn(&self, program: &Path) -> impl Future<Output = Result<u32>> + Send;

    /// Inject the observer into `pid`. `session_id` is handed to the observer
    /// so it can tag its messages.
    fn attach(&self, pid: u32, session_id: &str) -> impl Future<Output = Result<Attachment>> + Send;

    /// Let a spawned process run past its entry point.
    fn resume(&self, pid: u32) -> impl Future<Output = Result<()>> + Send;

    /// Unload the observer and close the attachment's message channel.
    fn detach(&self, attachment_id: &str) -> impl Future<Output = Result<()>> + Send;

    fn kill(&self, pid: u32) -> impl Future<Output = Result<()>> + Send;
}
