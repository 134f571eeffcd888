//! Host process listing for the `list-processes` endpoint.

use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};

use pulse_core::models::ProcessDescriptor;
use pulse_core::{PulseError, Result};

/// Every process visible on this host, sorted by name (case-insensitive)
/// then PID.
pub fn snapshot() -> Vec<ProcessDescriptor> {
    let mut system = System::new();
    system.refresh_processes_specifics(ProcessesToUpdate::All, true, ProcessRefreshKind::nothing());

    let mut processes: Vec<ProcessDescriptor> = system
        .processes()
        .iter()
        .map(|(pid, process)| ProcessDescriptor {
            pid: pid.as_u32(),
            name: process.name().to_string_lossy().into_owned(),
        })
        .collect();
    sort_by_name(&mut processes);
    processes
}

/// [`snapshot`] off the async runtime.
pub async fn list_processes() -> Result<Vec<ProcessDescriptor>> {
    tokio::task::spawn_blocking(snapshot)
        .await
        .map_err(|e| PulseError::Other(anyhow::anyhow!("process listing task failed: {e}")))
}

fn sort_by_name(processes: &mut [ProcessDescriptor]) {
    processes.sort_by(|a, b| {
        a.name
            .to_lowercase()
            .cmp(&b.name.to_lowercase())
            .then(a.pid.cmp(&b.pid))
    });
}
