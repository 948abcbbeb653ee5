//! signal-cli daemon process supervision
//!
//! Spawns the daemon in its own process group, forwards its output to the
//! log, detects early exit, and tears down the whole process tree on stop.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{Error, Result};

/// Default wait after spawn before checking the daemon is still alive
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Default wait for a graceful exit before force-killing
pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Extra wait after a forced kill
const KILL_WAIT: Duration = Duration::from_secs(5);

/// How long `stop` waits for the output forwarders to drain
const FORWARDER_DRAIN: Duration = Duration::from_secs(2);

/// How to launch the daemon
#[derive(Debug, Clone)]
pub struct DaemonSpec {
    /// Executable to run
    pub program: PathBuf,
    /// Command-line arguments
    pub args: Vec<String>,
    /// Wait after spawn before the liveness check
    pub grace_period: Duration,
    /// Wait for graceful exit before escalating
    pub stop_timeout: Duration,
}

impl DaemonSpec {
    /// Arbitrary command with default timings
    #[must_use]
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            grace_period: DEFAULT_GRACE_PERIOD,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
        }
    }

    /// `signal-cli -u <account> daemon --tcp <bind_address>`
    #[must_use]
    pub fn signal_cli(executable: impl Into<PathBuf>, account: &str, bind_address: &str) -> Self {
        Self::new(
            executable,
            vec![
                "-u".to_string(),
                account.to_string(),
                "daemon".to_string(),
                "--tcp".to_string(),
                bind_address.to_string(),
            ],
        )
    }

    /// Override the startup grace period
    #[must_use]
    pub const fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Override the graceful stop timeout
    #[must_use]
    pub const fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }
}

/// Lifecycle of the supervised daemon
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    /// Never started
    NotStarted,
    /// Spawned and passed the liveness check
    Running,
    /// Exited or terminated
    Stopped,
}

impl std::fmt::Display for DaemonState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not started"),
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// How a process tree is brought down on this platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KillStrategy {
    /// Signal the child's process group (unix)
    ProcessGroup,
    /// `taskkill /T` over the child's tree (windows)
    TaskKillTree,
    /// Kill only the direct child
    DirectChild,
}

impl KillStrategy {
    const fn for_platform() -> Self {
        if cfg!(unix) {
            Self::ProcessGroup
        } else if cfg!(windows) {
            Self::TaskKillTree
        } else {
            Self::DirectChild
        }
    }
}

/// Owned handle to a spawned process tree
pub struct ProcessHandle {
    child: Child,
    pid: Option<u32>,
    strategy: KillStrategy,
}

impl ProcessHandle {
    /// Put the command in its own process group so the tree can be signalled
    fn isolate(command: &mut Command) {
        #[cfg(unix)]
        command.process_group(0);

        #[cfg(windows)]
        {
            const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;
            command.creation_flags(CREATE_NEW_PROCESS_GROUP);
        }
    }

    fn new(child: Child) -> Self {
        let pid = child.id();
        Self {
            child,
            pid,
            strategy: KillStrategy::for_platform(),
        }
    }

    /// OS process id, while known
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the direct child is still alive
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Terminate the process tree
    ///
    /// Requests a graceful exit, waits up to `timeout`, then force-kills.
    ///
    /// # Errors
    ///
    /// Returns error if the process could not be reaped
    pub async fn terminate(&mut self, timeout: Duration) -> Result<()> {
        if self.is_running() {
            if let Err(e) = self.signal_tree(false) {
                tracing::warn!(pid = ?self.pid, error = %e, "graceful terminate failed");
            }

            match tokio::time::timeout(timeout, self.child.wait()).await {
                Ok(Ok(status)) => tracing::info!(pid = ?self.pid, %status, "daemon exited"),
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    tracing::warn!(pid = ?self.pid, "daemon did not exit in time, killing");
                    if let Err(e) = self.signal_tree(true) {
                        tracing::warn!(pid = ?self.pid, error = %e, "forced kill failed");
                    }
                    if tokio::time::timeout(KILL_WAIT, self.child.wait()).await.is_err() {
                        self.child.kill().await?;
                    }
                }
            }
        }

        // Helpers may outlive the leader
        if self.strategy == KillStrategy::ProcessGroup {
            let _ = self.signal_tree(true);
        }
        Ok(())
    }

    fn signal_tree(&mut self, force: bool) -> std::io::Result<()> {
        let Some(pid) = self.pid else {
            return Ok(());
        };
        match self.strategy {
            KillStrategy::ProcessGroup => signal_process_group(pid, force),
            KillStrategy::TaskKillTree => taskkill_tree(pid, force),
            KillStrategy::DirectChild => self.child.start_kill(),
        }
    }
}

#[cfg(unix)]
fn signal_process_group(pid: u32, force: bool) -> std::io::Result<()> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "pid out of range"))?;
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(not(unix))]
fn signal_process_group(_pid: u32, _force: bool) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "process groups are unix-only",
    ))
}

#[cfg(windows)]
fn taskkill_tree(pid: u32, force: bool) -> std::io::Result<()> {
    let pid = pid.to_string();
    let mut command = std::process::Command::new("taskkill");
    if force {
        command.arg("/F");
    }
    let status = command.args(["/T", "/PID", &pid]).status()?;
    if !status.success() {
        tracing::debug!(pid = %pid, %status, "taskkill reported failure");
    }
    Ok(())
}

#[cfg(not(windows))]
fn taskkill_tree(_pid: u32, _force: bool) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "taskkill is windows-only",
    ))
}

/// Owns the daemon process and its output forwarders
pub struct DaemonSupervisor {
    state: DaemonState,
    process: Option<ProcessHandle>,
    stop_timeout: Duration,
    log_stop: CancellationToken,
    forwarders: Vec<JoinHandle<()>>,
}

impl Default for DaemonSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl DaemonSupervisor {
    /// Create an idle supervisor
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: DaemonState::NotStarted,
            process: None,
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            log_stop: CancellationToken::new(),
            forwarders: Vec::new(),
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub const fn state(&self) -> DaemonState {
        self.state
    }

    /// OS process id of the running daemon
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().and_then(ProcessHandle::pid)
    }

    /// Spawn the daemon and wait out the grace period
    ///
    /// # Errors
    ///
    /// Returns `Error::Startup` if the executable is missing, the spawn fails,
    /// or the daemon exits before the grace period ends
    pub async fn start(&mut self, spec: &DaemonSpec) -> Result<()> {
        if self.state == DaemonState::Running {
            return Err(Error::Startup("daemon already running".to_string()));
        }

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        ProcessHandle::isolate(&mut command);

        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::Startup(format!(
                    "daemon executable not found: {}",
                    spec.program.display()
                ))
            } else {
                Error::Startup(format!(
                    "failed to spawn {}: {e}",
                    spec.program.display()
                ))
            }
        })?;

        self.log_stop = CancellationToken::new();
        if let Some(stdout) = child.stdout.take() {
            self.forwarders
                .push(spawn_forwarder(stdout, OutputStream::Stdout, self.log_stop.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            self.forwarders
                .push(spawn_forwarder(stderr, OutputStream::Stderr, self.log_stop.clone()));
        }

        let mut process = ProcessHandle::new(child);
        tracing::info!(
            pid = ?process.pid(),
            program = %spec.program.display(),
            grace_secs = spec.grace_period.as_secs_f32(),
            "daemon spawned, waiting for startup"
        );

        tokio::time::sleep(spec.grace_period).await;

        match process.child.try_wait() {
            Ok(None) => {}
            Ok(Some(status)) => {
                // The leader is gone but helpers in its group may not be
                if let Err(e) = process.terminate(spec.stop_timeout).await {
                    tracing::warn!(pid = ?process.pid(), error = %e, "failed to reap daemon helpers");
                }
                self.log_stop.cancel();
                self.state = DaemonState::Stopped;
                return Err(Error::Startup(format!(
                    "daemon exited during startup ({status})"
                )));
            }
            Err(e) => {
                let _ = process.terminate(spec.stop_timeout).await;
                self.log_stop.cancel();
                self.state = DaemonState::Stopped;
                return Err(Error::Startup(format!("failed to poll daemon: {e}")));
            }
        }

        self.stop_timeout = spec.stop_timeout;
        self.process = Some(process);
        self.state = DaemonState::Running;
        tracing::info!(pid = ?self.pid(), "daemon running");
        Ok(())
    }

    /// Terminate the daemon's process tree
    ///
    /// No-op when nothing is running.
    pub async fn stop(&mut self) {
        let Some(mut process) = self.process.take() else {
            return;
        };

        tracing::info!(pid = ?process.pid(), "stopping daemon");
        if let Err(e) = process.terminate(self.stop_timeout).await {
            tracing::error!(pid = ?process.pid(), error = %e, "failed to terminate daemon");
        }
        self.state = DaemonState::Stopped;

        self.log_stop.cancel();
        for forwarder in self.forwarders.drain(..) {
            if tokio::time::timeout(FORWARDER_DRAIN, forwarder).await.is_err() {
                tracing::debug!("daemon output forwarder did not finish");
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// Forward a child stream to the log line by line
fn spawn_forwarder<R>(stream: R, kind: OutputStream, stop: CancellationToken) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut line = Vec::new();

        loop {
            line.clear();
            let read = tokio::select! {
                () = stop.cancelled() => break,
                read = reader.read_until(b'\n', &mut line) => read,
            };

            match read {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    let text = text.trim_end();
                    if text.is_empty() {
                        continue;
                    }
                    match kind {
                        OutputStream::Stdout => tracing::info!(target: "signal_cli", "{text}"),
                        OutputStream::Stderr => tracing::warn!(target: "signal_cli", "{text}"),
                    }
                }
                Err(e) => {
                    tracing::warn!(stream = ?kind, error = %e, "error reading daemon output");
                    break;
                }
            }
        }
    })
}
