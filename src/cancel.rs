//! Cancellation controller: revoke everything queued or running.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Serialize;

use crate::error::BrokerError;
use crate::logstream::LogChannel;
use crate::queue::{QueueClient, TaskHandle, TaskState};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct KillReport {
    /// Tasks that were running (PROGRESS).
    pub active: usize,
    /// Tasks still queued (PENDING).
    pub scheduled: usize,
    /// Rows actually moved to REVOKED.
    pub revoked: usize,
    /// Live log channels removed.
    pub cleared_logs: usize,
    /// Running tasks per worker id.
    pub per_worker: BTreeMap<String, usize>,
}

/// Revoke every active and scheduled task and clear all live log channels.
///
/// Workers notice the revocation on their next poll and kill the tool's
/// process group. Running it again with nothing left reports zeros.
pub async fn kill_all(client: &QueueClient) -> Result<KillReport, BrokerError> {
    let broker = client.broker();
    let active = broker.list_in_state(TaskState::Progress).await?;
    let scheduled = broker.list_in_state(TaskState::Pending).await?;

    let mut per_worker: BTreeMap<String, usize> = BTreeMap::new();
    for (worker, handle) in &active {
        let worker = worker.clone().unwrap_or_else(|| "unknown".to_string());
        tracing::info!(task = %handle, worker = %worker, "Revoking active task");
        *per_worker.entry(worker).or_default() += 1;
    }

    let handles: Vec<TaskHandle> = active
        .iter()
        .chain(scheduled.iter())
        .map(|(_, handle)| handle.clone())
        .collect();
    let revoked = if handles.is_empty() {
        0
    } else {
        broker.revoke(&handles).await?
    };

    let cleared_logs = match client.logs() {
        Some(logs) => logs.clear_matching("*").await?,
        None => 0,
    };

    Ok(KillReport {
        active: active.len(),
        scheduled: scheduled.len(),
        revoked,
        cleared_logs,
        per_worker,
    })
}

/// Housekeeping before a run: delete old `*.log` files directly inside
/// `logs_folder` and clear every live log channel.
///
/// Returns `(files_removed, channels_cleared)`. Files that cannot be removed
/// are skipped with a warning.
pub async fn clean_previous_run(
    logs_folder: &Path,
    logs: Option<&LogChannel>,
) -> Result<(usize, usize), BrokerError> {
    let mut removed = 0;
    match std::fs::read_dir(logs_folder) {
        Ok(dir) => {
            for entry in dir.flatten() {
                let path = entry.path();
                if path.is_file() && path.extension().is_some_and(|ext| ext == "log") {
                    match std::fs::remove_file(&path) {
                        Ok(()) => removed += 1,
                        Err(e) => {
                            tracing::warn!(path = %path.display(), error = %e, "Could not delete old log")
                        }
                    }
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %logs_folder.display(), error = %e, "Could not scan logs folder"),
    }

    let cleared = match logs {
        Some(logs) => logs.clear_matching("*").await?,
        None => 0,
    };
    tracing::debug!(removed, cleared, "Cleaned up previous run");
    Ok((removed, cleared))
}
