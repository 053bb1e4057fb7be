//! SQLite-backed task broker.
//!
//! Drivers enqueue [`SubmittedTask`] messages; any worker process claims the
//! oldest pending one with a single `UPDATE ... RETURNING` statement, so two
//! workers never run the same task. Terminal writes only apply to rows that
//! are still in flight, which keeps a revocation from being overwritten by a
//! late result.

use std::path::Path;

use chrono::Utc;
use rusqlite::{OptionalExtension, params};

use super::types::{Progress, SubmittedTask, TaskHandle, TaskRecord, TaskState};
use crate::error::BrokerError;
use crate::invoker::ExecutionResult;
use crate::store::SqliteStore;

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS tasks (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    state TEXT NOT NULL DEFAULT 'PENDING',
    payload TEXT NOT NULL,
    worker TEXT,
    progress TEXT,
    result TEXT,
    error TEXT,
    submitted_at TEXT NOT NULL,
    started_at TEXT,
    finished_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_state ON tasks(state, seq);
CREATE INDEX IF NOT EXISTS idx_tasks_worker ON tasks(worker, state);
"#;

fn now_string() -> String {
    Utc::now().to_rfc3339()
}

/// A task a worker has claimed, with everything needed to run it.
#[derive(Clone, Debug)]
pub struct ClaimedTask {
    pub handle: TaskHandle,
    pub task: SubmittedTask,
}

#[derive(Clone)]
pub struct Broker {
    store: SqliteStore,
}

impl Broker {
    pub async fn open(path: &Path) -> Result<Self, BrokerError> {
        Ok(Self {
            store: SqliteStore::open(path, SCHEMA).await?,
        })
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// Queue a task and return its new handle.
    pub async fn enqueue(&self, task: &SubmittedTask) -> Result<TaskHandle, BrokerError> {
        let handle = TaskHandle::generate();
        let payload = serde_json::to_string(task)?;
        let id = handle.to_string();
        self.store
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO tasks (id, state, payload, submitted_at) VALUES (?1, 'PENDING', ?2, ?3)",
                    params![id, payload, now_string()],
                )?;
                Ok(())
            })
            .await?;
        Ok(handle)
    }

    /// Atomically move the oldest pending task to PROGRESS for `worker`.
    pub async fn claim(&self, worker: &str) -> Result<Option<ClaimedTask>, BrokerError> {
        let worker = worker.to_string();
        let row = self
            .store
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "UPDATE tasks SET state = 'PROGRESS', worker = ?1, started_at = ?2
                         WHERE seq = (SELECT seq FROM tasks WHERE state = 'PENDING' ORDER BY seq LIMIT 1)
                         RETURNING id, payload",
                        params![worker, now_string()],
                        |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;

        let Some((id, payload)) = row else {
            return Ok(None);
        };
        let handle = TaskHandle::from(id);
        match serde_json::from_str::<SubmittedTask>(&payload) {
            Ok(task) => Ok(Some(ClaimedTask { handle, task })),
            Err(e) => {
                // An undecodable message can never run; settle it instead of
                // leaving it stuck in PROGRESS.
                self.fail(&handle, &format!("Undecodable task payload: {e}"), None)
                    .await?;
                Err(e.into())
            }
        }
    }

    /// Publish progress for a running task.
    pub async fn set_progress(
        &self,
        handle: &TaskHandle,
        progress: &Progress,
    ) -> Result<(), BrokerError> {
        let id = handle.to_string();
        let progress = serde_json::to_string(progress)?;
        self.store
            .call(move |conn| {
                conn.execute(
                    "UPDATE tasks SET progress = ?1 WHERE id = ?2 AND state = 'PROGRESS'",
                    params![progress, id],
                )?;
                Ok(())
            })
            .await
    }

    /// Record a successful execution. Returns false if the task was no longer
    /// in flight (for instance revoked meanwhile).
    pub async fn complete(
        &self,
        handle: &TaskHandle,
        result: &ExecutionResult,
    ) -> Result<bool, BrokerError> {
        let result = serde_json::to_string(result)?;
        self.finish(handle, TaskState::Success, Some(result), None)
            .await
    }

    /// Record a failed execution.
    pub async fn fail(
        &self,
        handle: &TaskHandle,
        error: &str,
        result: Option<&ExecutionResult>,
    ) -> Result<bool, BrokerError> {
        let result = result.map(serde_json::to_string).transpose()?;
        self.finish(handle, TaskState::Failure, result, Some(error.to_string()))
            .await
    }

    async fn finish(
        &self,
        handle: &TaskHandle,
        state: TaskState,
        result: Option<String>,
        error: Option<String>,
    ) -> Result<bool, BrokerError> {
        let id = handle.to_string();
        self.store
            .call(move |conn| {
                let updated = conn.execute(
                    "UPDATE tasks SET state = ?1, result = ?2, error = ?3, finished_at = ?4
                     WHERE id = ?5 AND state IN ('PENDING', 'PROGRESS')",
                    params![state.as_str(), result, error, now_string(), id],
                )?;
                Ok(updated > 0)
            })
            .await
    }

    /// Fetch the current row for `handle`.
    pub async fn get(&self, handle: &TaskHandle) -> Result<Option<TaskRecord>, BrokerError> {
        let id = handle.to_string();
        let row = self
            .store
            .call(move |conn| {
                let row = conn
                    .query_row(
                        "SELECT state, worker, progress, result, error FROM tasks WHERE id = ?1",
                        params![id],
                        |row| {
                            Ok((
                                row.get::<_, String>(0)?,
                                row.get::<_, Option<String>>(1)?,
                                row.get::<_, Option<String>>(2)?,
                                row.get::<_, Option<String>>(3)?,
                                row.get::<_, Option<String>>(4)?,
                            ))
                        },
                    )
                    .optional()?;
                Ok(row)
            })
            .await?;

        let Some((state, worker, progress, result, error)) = row else {
            return Ok(None);
        };
        Ok(Some(TaskRecord {
            handle: handle.clone(),
            state: TaskState::parse(&state),
            worker,
            progress: progress.map(|p| serde_json::from_str(&p)).transpose()?,
            result: result.map(|r| serde_json::from_str(&r)).transpose()?,
            error,
        }))
    }

    /// Handles in `state`, paired with the worker that claimed them (if any).
    pub async fn list_in_state(
        &self,
        state: TaskState,
    ) -> Result<Vec<(Option<String>, TaskHandle)>, BrokerError> {
        self.store
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT worker, id FROM tasks WHERE state = ?1 ORDER BY seq")?;
                let rows = stmt
                    .query_map(params![state.as_str()], |row| {
                        Ok((
                            row.get::<_, Option<String>>(0)?,
                            TaskHandle::from(row.get::<_, String>(1)?),
                        ))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }

    /// Mark every listed task that is still pending or running as REVOKED.
    /// Returns how many rows changed.
    pub async fn revoke(&self, handles: &[TaskHandle]) -> Result<usize, BrokerError> {
        let ids: Vec<String> = handles.iter().map(ToString::to_string).collect();
        self.store
            .call(move |conn| {
                let now = now_string();
                let mut stmt = conn.prepare(
                    "UPDATE tasks SET state = 'REVOKED', error = 'revoked', finished_at = ?1
                     WHERE id = ?2 AND state IN ('PENDING', 'PROGRESS')",
                )?;
                let mut revoked = 0;
                for id in &ids {
                    revoked += stmt.execute(params![now, id])?;
                }
                Ok(revoked)
            })
            .await
    }

    /// Fail every task `worker` still holds in PROGRESS. Used once that
    /// worker is known to be gone. Returns how many rows changed.
    pub async fn fail_abandoned(&self, worker: &str, error: &str) -> Result<usize, BrokerError> {
        let worker = worker.to_string();
        let error = error.to_string();
        self.store
            .call(move |conn| {
                let failed = conn.execute(
                    "UPDATE tasks SET state = 'FAILURE', error = ?1, finished_at = ?2
                     WHERE worker = ?3 AND state = 'PROGRESS'",
                    params![error, now_string(), worker],
                )?;
                Ok(failed)
            })
            .await
    }

    /// Revoked tasks that `worker` had claimed.
    pub async fn revoked_for_worker(&self, worker: &str) -> Result<Vec<TaskHandle>, BrokerError> {
        let worker = worker.to_string();
        self.store
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT id FROM tasks WHERE worker = ?1 AND state = 'REVOKED'")?;
                let rows = stmt
                    .query_map(params![worker], |row| {
                        Ok(TaskHandle::from(row.get::<_, String>(0)?))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::TaskDescriptor;
    use crate::invoker::{ExecutionResult, ExecutionStatus, OutputKind};
    use serde_json::Map;
    use tempfile::TempDir;

    fn task(kind: &str) -> SubmittedTask {
        SubmittedTask {
            descriptor: TaskDescriptor {
                task_type: kind.to_string(),
                task_data: Map::new(),
                instructions: "do {name}".to_string(),
                rules: None,
                rules_file: None,
                task_identifier: None,
                log_folder_key: None,
            },
            database_name: "db".to_string(),
            shared_rules_path: None,
        }
    }

    fn result() -> ExecutionResult {
        ExecutionResult {
            status: ExecutionStatus::Success,
            task_type: "t".into(),
            task_data: Map::new(),
            log_file: "x.log".into(),
            error: None,
            output: OutputKind::Files,
            written_files: vec![],
            logs: vec![],
        }
    }

    async fn broker(tmp: &TempDir) -> Broker {
        Broker::open(&tmp.path().join("broker.db")).await.unwrap()
    }

    #[tokio::test]
    async fn claims_in_submission_order_and_only_once() {
        let tmp = TempDir::new().unwrap();
        let broker = broker(&tmp).await;

        let first = broker.enqueue(&task("a")).await.unwrap();
        let second = broker.enqueue(&task("b")).await.unwrap();

        let claimed = broker.claim("w1").await.unwrap().unwrap();
        assert_eq!(claimed.handle, first);
        assert_eq!(claimed.task.descriptor.task_type, "a");

        let claimed = broker.claim("w2").await.unwrap().unwrap();
        assert_eq!(claimed.handle, second);

        assert!(broker.claim("w1").await.unwrap().is_none());

        let record = broker.get(&first).await.unwrap().unwrap();
        assert_eq!(record.state, TaskState::Progress);
        assert_eq!(record.worker.as_deref(), Some("w1"));
    }

    #[tokio::test]
    async fn completion_and_failure_are_recorded() {
        let tmp = TempDir::new().unwrap();
        let broker = broker(&tmp).await;
        let ok = broker.enqueue(&task("a")).await.unwrap();
        let bad = broker.enqueue(&task("b")).await.unwrap();
        broker.claim("w").await.unwrap();
        broker.claim("w").await.unwrap();

        assert!(broker.complete(&ok, &result()).await.unwrap());
        assert!(broker.fail(&bad, "boom", None).await.unwrap());

        let ok = broker.get(&ok).await.unwrap().unwrap();
        assert_eq!(ok.state, TaskState::Success);
        assert_eq!(ok.result.unwrap().log_file, "x.log");

        let bad = broker.get(&bad).await.unwrap().unwrap();
        assert_eq!(bad.state, TaskState::Failure);
        assert_eq!(bad.error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn revoked_tasks_are_not_overwritten() {
        let tmp = TempDir::new().unwrap();
        let broker = broker(&tmp).await;
        let running = broker.enqueue(&task("a")).await.unwrap();
        let queued = broker.enqueue(&task("b")).await.unwrap();
        broker.claim("w9").await.unwrap();

        let revoked = broker
            .revoke(&[running.clone(), queued.clone()])
            .await
            .unwrap();
        assert_eq!(revoked, 2);
        assert_eq!(broker.revoke(&[running.clone()]).await.unwrap(), 0);

        assert!(!broker.complete(&running, &result()).await.unwrap());
        assert_eq!(
            broker.get(&running).await.unwrap().unwrap().state,
            TaskState::Revoked
        );
        assert_eq!(broker.revoked_for_worker("w9").await.unwrap(), vec![running]);
        assert!(broker.claim("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn progress_is_visible_while_running() {
        let tmp = TempDir::new().unwrap();
        let broker = broker(&tmp).await;
        let handle = broker.enqueue(&task("a")).await.unwrap();
        broker.claim("w").await.unwrap();

        let progress = Progress {
            status: "Running tool".into(),
            log_count: 3,
            logs: vec![],
        };
        broker.set_progress(&handle, &progress).await.unwrap();

        let record = broker.get(&handle).await.unwrap().unwrap();
        assert_eq!(record.progress, Some(progress));
        assert_eq!(
            broker.list_in_state(TaskState::Progress).await.unwrap(),
            vec![(Some("w".to_string()), handle)]
        );
    }

    #[tokio::test]
    async fn abandoned_tasks_fail_only_for_that_worker() {
        let tmp = TempDir::new().unwrap();
        let broker = broker(&tmp).await;
        let lost = broker.enqueue(&task("a")).await.unwrap();
        let kept = broker.enqueue(&task("b")).await.unwrap();
        let done = broker.enqueue(&task("c")).await.unwrap();
        broker.claim("gone").await.unwrap();
        broker.claim("alive").await.unwrap();
        broker.claim("gone").await.unwrap();
        broker.complete(&done, &result()).await.unwrap();

        assert_eq!(broker.fail_abandoned("gone", "worker exited").await.unwrap(), 1);

        let lost = broker.get(&lost).await.unwrap().unwrap();
        assert_eq!(lost.state, TaskState::Failure);
        assert_eq!(lost.error.as_deref(), Some("worker exited"));
        assert_eq!(
            broker.get(&kept).await.unwrap().unwrap().state,
            TaskState::Progress
        );
        assert_eq!(
            broker.get(&done).await.unwrap().unwrap().state,
            TaskState::Success
        );
    }
}
