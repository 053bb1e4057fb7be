use clap::{ArgGroup, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "genqueue",
    version,
    about = "Dispatch code-generation tasks to a worker pool and stream their logs"
)]
pub struct Cli {
    /// Path to settings file (overrides ./genqueue.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the broker, log store and worker PID file
    #[arg(long, global = true)]
    pub state_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit the tasks of a bundle and wait for them to finish
    #[command(group(ArgGroup::new("source").required(true).args(["bundle", "task_name"])))]
    Run {
        /// JSON bundle file with a "tasks" array
        #[arg(short, long)]
        bundle: Option<PathBuf>,

        /// Convention-based task name; loads {name}_array.json, {name}_instructions.json
        /// and the optional {name}_rules.md
        #[arg(short, long)]
        task_name: Option<String>,

        /// Base folder for the convention files (defaults to the current directory)
        #[arg(short, long, requires = "task_name")]
        folder: Option<PathBuf>,

        /// Rules file applied to every task, overriding per-task rules
        #[arg(long)]
        shared_rules: Option<PathBuf>,

        /// Do not print task logs while waiting
        #[arg(long)]
        no_logs: bool,

        /// Do not tail the live log store; print logs from progress updates instead
        #[arg(long)]
        no_stream: bool,
    },
    /// Show the state of a task
    Status {
        /// Task handle id
        id: String,
    },
    /// Print the full log of a task
    Logs {
        /// Task handle id
        id: String,
    },
    /// Follow the live log of a task until Ctrl-C
    Stream {
        /// Task handle id
        id: String,
    },
    /// Revoke every active and scheduled task and clear the log store
    KillAll,
    /// Run the worker pool in the foreground
    #[command(hide = true)]
    Worker {
        /// Maximum number of tasks executed in parallel
        #[arg(long)]
        concurrency: Option<usize>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bundle_and_task_name_are_mutually_exclusive() {
        let parsed = Cli::try_parse_from([
            "genqueue",
            "run",
            "--bundle",
            "tasks.json",
            "--task-name",
            "model",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn run_requires_a_source() {
        assert!(Cli::try_parse_from(["genqueue", "run"]).is_err());
    }

    #[test]
    fn convention_run_parses_folder_and_rules() {
        let cli = Cli::try_parse_from([
            "genqueue",
            "run",
            "--task-name",
            "model",
            "--folder",
            "specs",
            "--shared-rules",
            "rules.md",
            "--no-logs",
        ])
        .unwrap();
        match cli.command {
            Commands::Run {
                task_name,
                folder,
                shared_rules,
                no_logs,
                ..
            } => {
                assert_eq!(task_name.as_deref(), Some("model"));
                assert_eq!(folder, Some(PathBuf::from("specs")));
                assert_eq!(shared_rules, Some(PathBuf::from("rules.md")));
                assert!(no_logs);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
