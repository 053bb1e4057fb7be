use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use genqueue::batch::BatchCoordinator;
use genqueue::bundle::{self, Bundle};
use genqueue::cancel;
use genqueue::cli::{Cli, Commands};
use genqueue::config::{self, AppConfig};
use genqueue::logstream::{TAIL_INTERVAL, format_entry};
use genqueue::queue::{QueueClient, TaskHandle, WaitOptions};
use genqueue::worker::{self, EnsureOutcome, ProcessSpawner, WorkerLifecycle};

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = config::load_config(&cli)?;
    tracing::debug!(state_dir = %config.state_dir.display(), "Config loaded");

    match cli.command {
        Commands::Run {
            bundle: bundle_path,
            task_name,
            folder,
            shared_rules,
            no_logs,
            no_stream,
        } => {
            let bundle = match (bundle_path, task_name) {
                (Some(path), _) => bundle::load_bundle(&path)?,
                (None, Some(name)) => {
                    let base = folder.unwrap_or_else(|| PathBuf::from("."));
                    bundle::load_convention(&name, &base)?
                }
                (None, None) => anyhow::bail!("either --bundle or --task-name is required"),
            };
            let options = RunOptions {
                shared_rules,
                show_logs: !no_logs,
                stream: !no_stream,
            };
            run_bundle(&config, cli.config.as_deref(), bundle, options).await
        }
        Commands::Status { id } => {
            let client = QueueClient::connect(&config).await?;
            let status = client.get_status(&TaskHandle::from(id)).await?;
            println!("Task ID: {}", status.task_id);
            println!("State: {}", status.state);
            println!("Status: {}", status.status);
            if let Some(progress) = &status.progress {
                println!("Progress: {} ({} log entries)", progress.status, progress.log_count);
            }
            if let Some(error) = &status.error {
                println!("Error: {error}");
            }
            if let Some(result) = &status.result {
                println!("Result:\n{}", serde_json::to_string_pretty(result)?);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Logs { id } => {
            let client = QueueClient::connect(&config).await?;
            let handle = TaskHandle::from(id);
            let entries = client.fetch_logs(&handle).await?;
            if entries.is_empty() {
                println!("No logs found for task {handle}");
            } else {
                println!("Logs for task {handle}:");
                for entry in &entries {
                    println!("{}", format_entry(entry));
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Stream { id } => {
            let client = QueueClient::connect(&config).await?;
            let logs = client
                .logs()
                .context("Log store unavailable; live streaming is not possible")?;
            let handle = TaskHandle::from(id);
            println!("Streaming logs for task {handle} (Ctrl-C to stop)...");

            let token = CancellationToken::new();
            let stop = token.clone();
            tokio::spawn(async move {
                let _ = tokio::signal::ctrl_c().await;
                stop.cancel();
            });
            logs.tail(&handle, TAIL_INTERVAL, token, |entry| {
                println!("{}", format_entry(entry))
            })
            .await;
            println!("\nStopped streaming logs");
            Ok(ExitCode::SUCCESS)
        }
        Commands::KillAll => {
            let client = QueueClient::connect(&config).await?;
            let report = cancel::kill_all(&client).await?;
            for (worker, count) in &report.per_worker {
                println!("   {worker}: {count} active task(s)");
            }
            println!(
                "Revoked {} task(s) ({} active, {} scheduled); cleared {} log channel(s)",
                report.revoked, report.active, report.scheduled, report.cleared_logs
            );
            Ok(ExitCode::SUCCESS)
        }
        Commands::Worker { .. } => {
            worker::run(config).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

struct RunOptions {
    shared_rules: Option<PathBuf>,
    show_logs: bool,
    stream: bool,
}

async fn run_bundle(
    config: &AppConfig,
    config_file: Option<&Path>,
    bundle: Bundle,
    options: RunOptions,
) -> anyhow::Result<ExitCode> {
    if let Some(path) = options.shared_rules.as_deref().filter(|p| !p.is_file()) {
        anyhow::bail!("Shared rules file not found: {}", path.display());
    }
    println!(
        "Loaded {} task(s) for database {}",
        bundle.tasks.len(),
        bundle.database_name
    );

    let client = QueueClient::connect(config)
        .await
        .context("Failed to open the task broker")?;

    let logs_folder = config.resolve_folder(&bundle.database_name, "logs_folder")?;
    let (removed, cleared) = cancel::clean_previous_run(&logs_folder, client.logs()).await?;
    tracing::info!(removed, cleared, "Cleaned up previous logs");

    let lifecycle = WorkerLifecycle::new(
        config.pid_file.clone(),
        ProcessSpawner::new(config, config_file),
    );
    match lifecycle.ensure_running_blocking().await {
        Ok(EnsureOutcome::AlreadyRunning(pid)) => println!("Worker is running (PID {pid})"),
        Ok(EnsureOutcome::Started(pid)) => println!("Started worker (PID {pid})"),
        Err(e) => {
            eprintln!("Failed to initialize worker: {e}");
            return Ok(ExitCode::FAILURE);
        }
    }

    let shared_rules = options.shared_rules.as_deref();

    if let [descriptor] = bundle.tasks.as_slice() {
        let handle = client
            .submit(descriptor, &bundle.database_name, shared_rules)
            .await?;
        let wait_options = WaitOptions {
            description: format!("{} task", descriptor.task_type),
            show_logs: options.show_logs,
            stream: options.stream,
        };

        let outcome = tokio::select! {
            outcome = client.wait(&handle, &wait_options) => outcome?,
            _ = tokio::signal::ctrl_c() => {
                println!("\nStopped waiting; task {handle} keeps running in the background");
                return Ok(ExitCode::SUCCESS);
            }
        };
        return Ok(if outcome.is_success() {
            ExitCode::SUCCESS
        } else {
            ExitCode::FAILURE
        });
    }

    let coordinator = BatchCoordinator::new(
        &client,
        Duration::from_secs(config.result_timeout_secs.max(1)),
    );
    let result = coordinator
        .submit_batch(&bundle.tasks, &bundle.database_name, shared_rules)
        .await?;

    println!("\nBatch processing completed:");
    println!("   Successful: {}", result.successful.len());
    println!("   Failed: {}", result.failed.len());
    if !result.failed.is_empty() {
        println!("\nFailed tasks:");
        for failure in &result.failed {
            println!("   {} ({}): {}", failure.task_type, failure.task_id, failure.error);
        }
    }

    Ok(if result.all_succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
