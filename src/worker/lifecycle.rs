//! Keeps exactly one worker pool process alive.
//!
//! The PID file is the only record of the pool. A PID whose process answers
//! the zero signal is trusted; anything else (dead, unparsable) is removed
//! and a fresh pool is spawned.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::config::AppConfig;
use crate::error::WorkerError;

/// How long a freshly spawned worker must survive before it counts as started.
const STARTUP_GRACE: Duration = Duration::from_millis(200);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EnsureOutcome {
    AlreadyRunning(u32),
    Started(u32),
}

impl EnsureOutcome {
    pub fn pid(self) -> u32 {
        match self {
            EnsureOutcome::AlreadyRunning(pid) | EnsureOutcome::Started(pid) => pid,
        }
    }
}

/// Starts a worker pool process and returns its PID.
pub trait WorkerSpawner {
    fn spawn(&self) -> Result<u32, WorkerError>;
}

/// Re-executes the current binary as `genqueue worker` in its own process
/// group, with stdout and stderr appended to the worker log.
pub struct ProcessSpawner {
    config_file: Option<PathBuf>,
    state_dir: PathBuf,
    concurrency: usize,
    log_file: PathBuf,
}

impl ProcessSpawner {
    pub fn new(config: &AppConfig, config_file: Option<&Path>) -> Self {
        Self {
            config_file: config_file.map(Path::to_path_buf),
            state_dir: config.state_dir.clone(),
            concurrency: config.worker_concurrency,
            log_file: config.worker_log.clone(),
        }
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self) -> Result<u32, WorkerError> {
        let exe = std::env::current_exe().map_err(WorkerError::Spawn)?;

        if let Some(parent) = self.log_file.parent() {
            fs::create_dir_all(parent).map_err(WorkerError::Spawn)?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file)
            .map_err(WorkerError::Spawn)?;
        let log_err = log.try_clone().map_err(WorkerError::Spawn)?;

        let mut command = Command::new(exe);
        if let Some(path) = &self.config_file {
            command.arg("--config").arg(path);
        }
        command
            .arg("--state-dir")
            .arg(&self.state_dir)
            .arg("worker")
            .arg("--concurrency")
            .arg(self.concurrency.to_string());

        // Detach from the driver's process group so Ctrl-C in the driver
        // does not reach the pool.
        use std::os::unix::process::CommandExt;
        let mut child = command
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(WorkerError::Spawn)?;

        let pid = child.id();
        std::thread::sleep(STARTUP_GRACE);
        match child.try_wait() {
            Ok(None) => Ok(pid),
            Ok(Some(_)) => Err(WorkerError::ExitedImmediately(pid)),
            Err(e) => Err(WorkerError::Spawn(e)),
        }
    }
}

/// Zero-signal liveness check. A process we may not signal still exists.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

pub struct WorkerLifecycle<S: WorkerSpawner> {
    pid_file: PathBuf,
    spawner: S,
}

impl<S: WorkerSpawner> WorkerLifecycle<S> {
    pub fn new(pid_file: PathBuf, spawner: S) -> Self {
        Self { pid_file, spawner }
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    /// PID recorded in the PID file, if the file exists and parses.
    pub fn recorded_pid(&self) -> Result<Option<u32>, WorkerError> {
        match fs::read_to_string(&self.pid_file) {
            Ok(contents) => Ok(contents.trim().parse().ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(WorkerError::PidFile {
                path: self.pid_file.clone(),
                source,
            }),
        }
    }

    /// Make sure a worker pool is running, starting one if needed.
    pub fn ensure_running(&self) -> Result<EnsureOutcome, WorkerError> {
        if self.pid_file.exists() {
            match self.recorded_pid()? {
                Some(pid) if is_process_alive(pid) => {
                    tracing::debug!(pid, "Worker already running");
                    return Ok(EnsureOutcome::AlreadyRunning(pid));
                }
                Some(pid) => tracing::info!(pid, "Worker PID is stale, restarting"),
                None => tracing::warn!(path = %self.pid_file.display(), "Unreadable PID file, restarting worker"),
            }
            self.remove_pid_file()?;
        }

        let pid = self.spawner.spawn()?;
        self.write_pid(pid)?;
        tracing::info!(pid, "Worker started");
        Ok(EnsureOutcome::Started(pid))
    }

    fn write_pid(&self, pid: u32) -> Result<(), WorkerError> {
        let to_err = |source| WorkerError::PidFile {
            path: self.pid_file.clone(),
            source,
        };
        if let Some(parent) = self.pid_file.parent() {
            fs::create_dir_all(parent).map_err(to_err)?;
        }
        fs::write(&self.pid_file, pid.to_string()).map_err(to_err)
    }

    fn remove_pid_file(&self) -> Result<(), WorkerError> {
        match fs::remove_file(&self.pid_file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(WorkerError::PidFile {
                path: self.pid_file.clone(),
                source,
            }),
        }
    }
}

impl<S: WorkerSpawner + Send + 'static> WorkerLifecycle<S> {
    /// Spawning sleeps through the startup grace period, so async callers
    /// run [`ensure_running`](Self::ensure_running) on the blocking pool.
    pub async fn ensure_running_blocking(self) -> Result<EnsureOutcome, WorkerError> {
        tokio::task::spawn_blocking(move || self.ensure_running())
            .await
            .map_err(|e| WorkerError::Spawn(std::io::Error::other(e)))?
    }
}
