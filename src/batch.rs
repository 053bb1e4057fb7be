//! Batch coordinator: submit many descriptors, then poll until all settle.

use std::path::Path;
use std::time::Duration;

use serde::Serialize;

use crate::bundle::TaskDescriptor;
use crate::error::BrokerError;
use crate::invoker::{ExecutionResult, ExecutionStatus};
use crate::queue::{QueueClient, TaskHandle, TaskRecord, TaskState};

#[derive(Clone, Debug, Serialize)]
pub struct BatchSuccess {
    pub task_id: TaskHandle,
    pub task_type: String,
    pub result: ExecutionResult,
}

#[derive(Clone, Debug, Serialize)]
pub struct BatchFailure {
    pub task_id: TaskHandle,
    pub task_type: String,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ExecutionResult>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct BatchResult {
    pub successful: Vec<BatchSuccess>,
    pub failed: Vec<BatchFailure>,
}

impl BatchResult {
    pub fn total(&self) -> usize {
        self.successful.len() + self.failed.len()
    }

    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// One settled handle, classified.
enum Settled {
    Success(BatchSuccess),
    Failure(BatchFailure),
}

fn classify(handle: &TaskHandle, task_type: &str, record: TaskRecord) -> Settled {
    let failure = |error: String, result: Option<ExecutionResult>| {
        Settled::Failure(BatchFailure {
            task_id: handle.clone(),
            task_type: task_type.to_string(),
            error,
            result,
        })
    };

    match (record.state, record.result) {
        (TaskState::Success, Some(result)) if result.status == ExecutionStatus::Success => {
            Settled::Success(BatchSuccess {
                task_id: handle.clone(),
                task_type: task_type.to_string(),
                result,
            })
        }
        (TaskState::Success, Some(result)) => {
            let error = result
                .error
                .clone()
                .unwrap_or_else(|| "Task reported failure".to_string());
            failure(error, Some(result))
        }
        (TaskState::Success, None) => failure("Task finished without a result".to_string(), None),
        (_, result) => {
            let error = record
                .error
                .or_else(|| result.as_ref().and_then(|r| r.error.clone()))
                .unwrap_or_else(|| "Unknown error".to_string());
            failure(error, result)
        }
    }
}

pub struct BatchCoordinator<'a> {
    client: &'a QueueClient,
    result_timeout: Duration,
}

impl<'a> BatchCoordinator<'a> {
    pub fn new(client: &'a QueueClient, result_timeout: Duration) -> Self {
        Self {
            client,
            result_timeout,
        }
    }

    /// Submit every descriptor, then poll the outstanding handles every
    /// poll interval until each has been classified exactly once.
    pub async fn submit_batch(
        &self,
        descriptors: &[TaskDescriptor],
        database_name: &str,
        shared_rules: Option<&Path>,
    ) -> Result<BatchResult, BrokerError> {
        let mut outstanding: Vec<(TaskHandle, String)> = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let handle = self
                .client
                .submit(descriptor, database_name, shared_rules)
                .await?;
            println!("   Submitted {} task: {handle}", descriptor.task_type);
            outstanding.push((handle, descriptor.task_type.clone()));
        }

        let total = outstanding.len();
        println!("Waiting for {total} tasks to complete...");

        let mut result = BatchResult::default();
        let mut ticker = tokio::time::interval(self.client.poll_interval());

        while !outstanding.is_empty() {
            ticker.tick().await;

            let mut still_running = Vec::with_capacity(outstanding.len());
            for (handle, task_type) in outstanding {
                let fetched =
                    tokio::time::timeout(self.result_timeout, self.client.ready_record(&handle))
                        .await;
                let settled = match fetched {
                    Ok(Ok(Some(record))) => classify(&handle, &task_type, record),
                    Ok(Ok(None)) => {
                        still_running.push((handle, task_type));
                        continue;
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(task = %handle, error = %e, "Status check failed");
                        still_running.push((handle, task_type));
                        continue;
                    }
                    Err(_) => Settled::Failure(BatchFailure {
                        task_id: handle.clone(),
                        task_type: task_type.clone(),
                        error: format!(
                            "Timed out after {}s fetching result",
                            self.result_timeout.as_secs()
                        ),
                        result: None,
                    }),
                };

                match settled {
                    Settled::Success(success) => {
                        println!(
                            "   Completed {} ({}/{total})",
                            success.task_type,
                            result.total() + 1
                        );
                        result.successful.push(success);
                    }
                    Settled::Failure(failure) => {
                        println!(
                            "   Failed {}: {} ({}/{total})",
                            failure.task_type,
                            failure.error,
                            result.total() + 1
                        );
                        result.failed.push(failure);
                    }
                }
            }
            outstanding = still_running;
        }

        Ok(result)
    }
}
