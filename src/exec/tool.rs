//! Direct spawn of the code-generation tool.
//!
//! No shell is involved: stdin is bound to the prompt file, stdout to the
//! durable log file, and stderr is captured through a pipe. The child runs in
//! its own process group (`process_group(0)`) so a cancellation can SIGKILL
//! the tool together with anything it spawned.

use std::fs::File;
use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::ToolInvocationError;

/// Program and arguments of the external tool.
#[derive(Clone, Debug)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<String>,
}

impl ToolCommand {
    /// Human-readable command line for logs.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of one tool run. Stdout is not here: it went to the bound file.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ExecResult {
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub cancelled: bool,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        !self.cancelled && self.exit_code == Some(0)
    }
}

/// Run `command` in `cwd`, feeding it `stdin_path` and writing its stdout to
/// `stdout`. Blocks (asynchronously) until the tool exits or `cancel` fires.
pub async fn run_tool(
    command: &ToolCommand,
    cwd: &Path,
    stdin_path: &Path,
    stdout: File,
    cancel: &CancellationToken,
) -> Result<ExecResult, ToolInvocationError> {
    let stdin = File::open(stdin_path)?;

    // process_group(0) requires the CommandExt trait on Unix.
    #[allow(unused_imports)]
    use std::os::unix::process::CommandExt;

    let mut child = Command::new(&command.program)
        .args(&command.args)
        .current_dir(cwd)
        .process_group(0)
        .stdin(Stdio::from(stdin))
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ToolInvocationError::SpawnFailed {
            command: command.display(),
            source,
        })?;

    let stderr_task = child.stderr.take().map(|mut pipe| {
        tokio::spawn(async move {
            let mut buf = String::new();
            let _ = pipe.read_to_string(&mut buf).await;
            buf
        })
    });

    let exit = tokio::select! {
        status = child.wait() => Some(status?),
        _ = cancel.cancelled() => {
            // Kill the entire process group via SIGKILL.
            if let Some(pid) = child.id() {
                let pgid = nix::unistd::Pid::from_raw(pid as i32);
                let _ = nix::sys::signal::killpg(pgid, nix::sys::signal::Signal::SIGKILL);
            }
            // Reap the child to prevent zombies.
            let _ = child.wait().await;
            None
        }
    };

    let stderr = match stderr_task {
        Some(task) => task.await.unwrap_or_default(),
        None => String::new(),
    };

    Ok(ExecResult {
        stderr,
        exit_code: exit.and_then(|status| status.code()),
        cancelled: exit.is_none(),
    })
}
