use genqueue::batch::BatchCoordinator;
use genqueue::bundle::TaskDescriptor;
use genqueue::cancel::kill_all;
use genqueue::config::{AppConfig, PartialConfig};
use genqueue::invoker::{ExecutionStatus, OutputKind};
use genqueue::logstream::LogChannel;
use genqueue::queue::{Broker, QueueClient, TaskHandle, TaskState, WaitOptions};
use genqueue::worker::{SHUTDOWN_ERROR, WorkerPool};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const POLL: Duration = Duration::from_millis(50);

struct Harness {
    _tmp: TempDir,
    target: PathBuf,
    config: AppConfig,
    client: QueueClient,
}

/// Broker, log store and settings in a temp dir; the tool is `sh -c <script>`.
async fn harness(script: &str, concurrency: usize) -> Harness {
    let tmp = tempfile::tempdir().expect("failed to create temp dir");
    let target = tmp.path().join("target");
    std::fs::create_dir(&target).unwrap();

    let mut folders = BTreeMap::new();
    folders.insert("target_folder".to_string(), target.clone());
    let config = PartialConfig {
        state_dir: Some(tmp.path().join("state")),
        worker_concurrency: Some(concurrency),
        tool_command: Some("sh".into()),
        tool_args: Some(vec!["-c".into(), script.into()]),
        folders,
        ..Default::default()
    }
    .finalize();

    let broker = Broker::open(&config.broker_path).await.unwrap();
    let logs = LogChannel::connect(&config.log_store_path).await;
    let client = QueueClient::new(broker, logs, POLL);

    Harness {
        _tmp: tmp,
        target,
        config,
        client,
    }
}

fn start_pool(h: &Harness) -> (CancellationToken, JoinHandle<()>) {
    let pool = WorkerPool::new(
        h.config.clone(),
        h.client.broker().clone(),
        h.client.logs().cloned(),
    )
    .with_poll_interval(POLL);
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let join = tokio::spawn(async move { pool.run_until(token).await });
    (shutdown, join)
}

fn descriptor(identifier: &str) -> TaskDescriptor {
    TaskDescriptor {
        task_type: "crud".into(),
        task_data: json!({"identifier": identifier, "name": identifier})
            .as_object()
            .cloned()
            .unwrap(),
        instructions: "Generate {name}".into(),
        rules: None,
        rules_file: None,
        task_identifier: None,
        log_folder_key: None,
    }
}

async fn wait_for_state(client: &QueueClient, handle: &TaskHandle, state: TaskState) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if client.get_status(handle).await.unwrap().state == state {
            return;
        }
        assert!(Instant::now() < deadline, "task never reached {state}");
        tokio::time::sleep(POLL).await;
    }
}

// ============================================================
// Single task end to end
// ============================================================

#[tokio::test]
async fn test_submitted_task_runs_to_success() {
    let h = harness(
        r#"cat > /dev/null; printf '{"foo/bar.txt": "hello"}'"#,
        2,
    )
    .await;
    let (shutdown, pool) = start_pool(&h);

    let handle = h
        .client
        .submit(&descriptor("users"), "targetdbname", None)
        .await
        .unwrap();
    let options = WaitOptions {
        description: "crud task".into(),
        show_logs: true,
        stream: true,
    };
    let outcome = h.client.wait(&handle, &options).await.unwrap();

    shutdown.cancel();
    pool.await.unwrap();

    assert!(outcome.is_success());
    let result = outcome.result.unwrap();
    assert_eq!(result.output, OutputKind::Files);
    assert!(!result.logs.is_empty());
    assert_eq!(
        std::fs::read_to_string(h.target.join("foo/bar.txt")).unwrap(),
        "hello"
    );

    let live = h.client.fetch_logs(&handle).await.unwrap();
    assert!(live.iter().any(|e| e.message == "Successfully completed task"));
}

#[tokio::test]
async fn test_failed_tool_marks_task_failure() {
    let h = harness("cat > /dev/null; exit 4", 1).await;
    let (shutdown, pool) = start_pool(&h);

    let handle = h
        .client
        .submit(&descriptor("users"), "targetdbname", None)
        .await
        .unwrap();
    wait_for_state(&h.client, &handle, TaskState::Failure).await;
    shutdown.cancel();
    pool.await.unwrap();

    let status = h.client.get_status(&handle).await.unwrap();
    assert!(status.ready);
    assert!(status.error.unwrap().contains("status 4"));

    // The failed run still leaves its logs behind.
    let logs = h.client.fetch_logs(&handle).await.unwrap();
    assert!(logs.iter().any(|e| e.message.starts_with("Error processing task")));
}

// ============================================================
// Batch
// ============================================================

#[tokio::test]
async fn test_batch_classifies_every_task_once() {
    // Task "bad" exits non-zero; the others emit one file each.
    let script = r#"
        prompt=$(cat)
        case "$prompt" in
            *'"bad"'*) exit 1 ;;
        esac
        printf '{"out.txt": "ok"}'
    "#;
    let h = harness(script, 3).await;
    let (shutdown, pool) = start_pool(&h);

    let descriptors: Vec<_> = ["a", "bad", "c", "d"].iter().map(|id| descriptor(id)).collect();
    let coordinator = BatchCoordinator::new(&h.client, Duration::from_secs(5));
    let result = coordinator
        .submit_batch(&descriptors, "targetdbname", None)
        .await
        .unwrap();

    shutdown.cancel();
    pool.await.unwrap();

    assert_eq!(result.total(), 4);
    assert_eq!(result.successful.len(), 3);
    assert_eq!(result.failed.len(), 1);
    assert!(!result.all_succeeded());
    assert!(
        result
            .successful
            .iter()
            .all(|s| s.result.status == ExecutionStatus::Success)
    );

    let mut ids: Vec<_> = result
        .successful
        .iter()
        .map(|s| s.task_id.clone())
        .chain(result.failed.iter().map(|f| f.task_id.clone()))
        .collect();
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 4);
}

// ============================================================
// Cancellation
// ============================================================

#[tokio::test]
async fn test_kill_all_with_nothing_queued_reports_zero() {
    let h = harness("cat", 1).await;

    let report = kill_all(&h.client).await.unwrap();
    assert_eq!(report.active, 0);
    assert_eq!(report.scheduled, 0);
    assert_eq!(report.revoked, 0);
}

#[tokio::test]
async fn test_kill_all_revokes_scheduled_tasks_once() {
    let h = harness("cat", 1).await;
    let first = h
        .client
        .submit(&descriptor("a"), "targetdbname", None)
        .await
        .unwrap();
    h.client
        .submit(&descriptor("b"), "targetdbname", None)
        .await
        .unwrap();

    let report = kill_all(&h.client).await.unwrap();
    assert_eq!(report.scheduled, 2);
    assert_eq!(report.revoked, 2);
    assert_eq!(
        h.client.get_status(&first).await.unwrap().state,
        TaskState::Revoked
    );

    let again = kill_all(&h.client).await.unwrap();
    assert_eq!(again.revoked, 0);
}

#[tokio::test]
async fn test_kill_all_stops_running_tool() {
    let h = harness("sleep 30", 1).await;
    let (shutdown, pool) = start_pool(&h);

    let handle = h
        .client
        .submit(&descriptor("slow"), "targetdbname", None)
        .await
        .unwrap();
    wait_for_state(&h.client, &handle, TaskState::Progress).await;

    let start = Instant::now();
    let report = kill_all(&h.client).await.unwrap();
    assert_eq!(report.active, 1);
    assert_eq!(report.per_worker.values().sum::<usize>(), 1);

    // With one slot, the next task only starts once the revoked tool is gone.
    let next = h
        .client
        .submit(&descriptor("next"), "targetdbname", None)
        .await
        .unwrap();
    wait_for_state(&h.client, &next, TaskState::Progress).await;
    assert!(start.elapsed() < Duration::from_secs(10));

    shutdown.cancel();
    pool.await.unwrap();
    assert_eq!(
        h.client.get_status(&handle).await.unwrap().state,
        TaskState::Revoked
    );
    let next = h.client.get_status(&next).await.unwrap();
    assert_eq!(next.state, TaskState::Failure);
    assert_eq!(next.error.as_deref(), Some(SHUTDOWN_ERROR));
}

// ============================================================
// Shutdown and abandoned tasks
// ============================================================

#[tokio::test]
async fn test_shutdown_mid_task_settles_the_handle() {
    let h = harness("sleep 30", 1).await;
    let (shutdown, pool) = start_pool(&h);

    let handle = h
        .client
        .submit(&descriptor("slow"), "targetdbname", None)
        .await
        .unwrap();
    wait_for_state(&h.client, &handle, TaskState::Progress).await;

    shutdown.cancel();
    pool.await.unwrap();

    let status = h.client.get_status(&handle).await.unwrap();
    assert_eq!(status.state, TaskState::Failure);
    assert_eq!(status.error.as_deref(), Some(SHUTDOWN_ERROR));

    let options = WaitOptions {
        description: "crud task".into(),
        show_logs: true,
        stream: false,
    };
    let outcome = tokio::time::timeout(Duration::from_secs(5), h.client.wait(&handle, &options))
        .await
        .expect("wait should return for a settled task")
        .unwrap();
    assert_eq!(outcome.state, TaskState::Failure);
    let result = outcome.result.unwrap();
    assert!(result.logs.iter().any(|e| e.message.starts_with("Worker ")));
}

#[tokio::test]
async fn test_new_pool_fails_tasks_of_a_dead_worker() {
    let h = harness(r#"cat > /dev/null; printf '{"out.txt": "ok"}'"#, 1).await;
    let orphan = h
        .client
        .submit(&descriptor("orphan"), "targetdbname", None)
        .await
        .unwrap();
    // Claimed by a worker whose process no longer exists.
    h.client
        .broker()
        .claim("genqueue-999999999-deadbeef")
        .await
        .unwrap()
        .unwrap();
    let fresh = h
        .client
        .submit(&descriptor("fresh"), "targetdbname", None)
        .await
        .unwrap();

    let (shutdown, pool) = start_pool(&h);
    wait_for_state(&h.client, &orphan, TaskState::Failure).await;
    wait_for_state(&h.client, &fresh, TaskState::Success).await;
    shutdown.cancel();
    pool.await.unwrap();

    let status = h.client.get_status(&orphan).await.unwrap();
    assert!(status.error.unwrap().contains("genqueue-999999999-deadbeef"));
}

// ============================================================
// Rules paths
// ============================================================

#[tokio::test]
async fn test_relative_rules_paths_reach_the_worker() {
    let h = harness("cat", 1).await;
    let cwd = std::env::current_dir().unwrap();
    let rules_dir = tempfile::Builder::new()
        .prefix("rules-")
        .tempdir_in(&cwd)
        .unwrap();
    std::fs::write(rules_dir.path().join("shared.md"), "SHARED RULES").unwrap();
    std::fs::write(rules_dir.path().join("own.md"), "OWN RULES").unwrap();
    let relative = rules_dir.path().strip_prefix(&cwd).unwrap();

    let mut shared_run = descriptor("a");
    shared_run.rules_file = Some(relative.join("own.md"));
    let mut own_run = descriptor("b");
    own_run.rules_file = Some(relative.join("own.md"));

    let shared = relative.join("shared.md");
    let with_shared = h
        .client
        .submit(&shared_run, "targetdbname", Some(shared.as_path()))
        .await
        .unwrap();
    let without_shared = h
        .client
        .submit(&own_run, "targetdbname", None)
        .await
        .unwrap();

    let (shutdown, pool) = start_pool(&h);
    let options = WaitOptions {
        description: "crud task".into(),
        show_logs: false,
        stream: false,
    };
    let first = h.client.wait(&with_shared, &options).await.unwrap();
    let second = h.client.wait(&without_shared, &options).await.unwrap();
    shutdown.cancel();
    pool.await.unwrap();

    let log = std::fs::read_to_string(first.result.unwrap().log_file).unwrap();
    assert!(log.contains("## Rules\nSHARED RULES"));
    assert!(!log.contains("OWN RULES"));

    let log = std::fs::read_to_string(second.result.unwrap().log_file).unwrap();
    assert!(log.contains("## Rules\nOWN RULES"));
}
