//! Process layer - lifecycle of the external language server process
//!
//! Spawns the server with piped stdio, hands its pipes to the transport
//! layer, drains stderr into the log, and watches for process exit so the
//! session can observe a server that dies underneath it.

use crate::io::transport::{StdioTransport, Transport};
use async_trait::async_trait;
use std::io;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// How long a gracefully stopped server may take to exit before SIGKILL.
const GRACEFUL_EXIT_TIMEOUT_SECS: u64 = 5;

// ============================================================================
// Process State
// ============================================================================

/// How to stop the server process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// SIGTERM first, SIGKILL if the process lingers
    Graceful,
    /// SIGKILL immediately
    Force,
}

/// Process lifecycle states
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    /// Never spawned (or respawnable after a stop)
    NotStarted,
    /// Currently running
    Running { pid: u32 },
    /// Exited, either on request or on its own
    Stopped,
}

impl ProcessState {
    /// Process ID, if running.
    pub fn pid(&self) -> Option<u32> {
        match self {
            ProcessState::Running { pid } => Some(*pid),
            _ => None,
        }
    }

    /// Whether the process is currently running.
    pub fn is_running(&self) -> bool {
        matches!(self, ProcessState::Running { .. })
    }
}

// ============================================================================
// Exit Events
// ============================================================================

/// Event fired when the server process exits.
#[derive(Debug, Clone)]
pub struct ProcessExitEvent {
    /// Exit code reported by the OS, if any.
    pub code: Option<i32>,
}

/// Observer for server process exit.
///
/// Fired from the wait task for every exit, requested or not; the installer
/// decides whether the exit was expected.
#[async_trait]
pub trait ProcessExitHandler: Send + Sync {
    async fn on_process_exit(&self, event: ProcessExitEvent);
}

// ============================================================================
// Process Manager
// ============================================================================

/// Error types for process management
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("process not started")]
    NotStarted,

    #[error("process already started")]
    AlreadyStarted,

    #[error("process stdio pipes not available")]
    StdioNotAvailable,
}

/// Trait for managing the external server process lifecycle.
///
/// The associated transport type lets the session run against the real stdio
/// transport in production and a mock transport in tests.
#[async_trait]
pub trait ProcessManager: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;
    type Transport: Transport + 'static;

    /// Spawn the process and wire up its stdio.
    async fn start(&mut self) -> Result<(), Self::Error>;

    /// Stop the process.
    async fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error>;

    /// Whether the process is currently running.
    fn is_running(&self) -> bool;

    /// Take the transport connected to the process.
    ///
    /// Consumes the stdio pipes; may be called once per `start`.
    fn take_transport(&mut self) -> Result<Self::Transport, Self::Error>;

    /// Install an exit observer. Must be installed before `start` to be
    /// guaranteed delivery of the exit event.
    fn on_exit(&mut self, handler: Arc<dyn ProcessExitHandler>);

    /// Synchronous force kill for `Drop` implementations.
    fn kill_sync(&mut self);
}

/// Manages the language server child process spawned via [`Command`].
pub struct ServerProcess {
    /// Executable path or name
    command: String,

    /// Command-line arguments
    args: Vec<String>,

    /// Thread-safe process state, shared with the wait task
    state: Arc<Mutex<ProcessState>>,

    /// Transport created at spawn time, taken by the session
    transport: Option<StdioTransport>,

    /// Stderr draining task
    stderr_task: Option<JoinHandle<()>>,

    /// Task waiting for process exit
    wait_task: Option<JoinHandle<()>>,

    /// Exit observer
    exit_handler: Option<Arc<dyn ProcessExitHandler>>,
}

impl ServerProcess {
    /// Create a manager for the given command line. Nothing is spawned yet.
    pub fn new(command: String, args: Vec<String>) -> Self {
        Self {
            command,
            args,
            state: Arc::new(Mutex::new(ProcessState::NotStarted)),
            transport: None,
            stderr_task: None,
            wait_task: None,
            exit_handler: None,
        }
    }

    /// Current process state.
    pub fn state(&self) -> ProcessState {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_state(&self, next: ProcessState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    /// Drain stderr into the log so the child never blocks on a full pipe.
    fn spawn_stderr_task(&mut self, stderr: tokio::process::ChildStderr, pid: u32) {
        let task = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr);
            let mut line = String::new();
            loop {
                line.clear();
                match reader.read_line(&mut line).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let content = line.trim();
                        if !content.is_empty() {
                            debug!(target: "htmx_lsp_client::server_stderr", pid, "{}", content);
                        }
                    }
                    Err(e) => {
                        error!("failed to read server stderr: {}", e);
                        break;
                    }
                }
            }
            trace!("stderr task finished for pid {}", pid);
        });
        self.stderr_task = Some(task);
    }

    /// Wait for the child to exit, record the state change, and fire the
    /// exit observer.
    fn spawn_wait_task(&mut self, mut child: Child, pid: u32) {
        let state = Arc::clone(&self.state);
        let exit_handler = self.exit_handler.clone();

        let task = tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => {
                    info!("server process {} exited with status {}", pid, status);
                    status.code()
                }
                Err(e) => {
                    error!("error waiting for server process {}: {}", pid, e);
                    None
                }
            };

            *state.lock().unwrap_or_else(|e| e.into_inner()) = ProcessState::Stopped;

            if let Some(handler) = exit_handler {
                handler.on_process_exit(ProcessExitEvent { code }).await;
            }
        });
        self.wait_task = Some(task);
    }

    fn signal(pid: u32, signal: libc::c_int) {
        // The wait task reaps the child, so a stale pid is only signalled
        // between exit and reaping; worst case the signal is reported as
        // undeliverable and ignored.
        unsafe {
            libc::kill(pid as libc::pid_t, signal);
        }
    }
}

#[async_trait]
impl ProcessManager for ServerProcess {
    type Error = ProcessError;
    type Transport = StdioTransport;

    async fn start(&mut self) -> Result<(), Self::Error> {
        if self.state().is_running() {
            return Err(ProcessError::AlreadyStarted);
        }

        info!("starting language server: {} {:?}", self.command, self.args);

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let pid = child
            .id()
            .ok_or_else(|| ProcessError::Io(io::Error::other("spawned process has no pid")))?;
        info!("language server started with pid {}", pid);
        self.set_state(ProcessState::Running { pid });

        let stdin = child.stdin.take().ok_or(ProcessError::StdioNotAvailable)?;
        let stdout = child.stdout.take().ok_or(ProcessError::StdioNotAvailable)?;
        let stderr = child.stderr.take().ok_or(ProcessError::StdioNotAvailable)?;

        self.transport = Some(StdioTransport::new(stdin, stdout));
        self.spawn_stderr_task(stderr, pid);
        self.spawn_wait_task(child, pid);

        Ok(())
    }

    async fn stop(&mut self, mode: StopMode) -> Result<(), Self::Error> {
        let pid = self.state().pid().ok_or(ProcessError::NotStarted)?;

        match mode {
            StopMode::Graceful => info!("stopping language server pid {}", pid),
            StopMode::Force => info!("force killing language server pid {}", pid),
        }

        if let Some(mut transport) = self.transport.take() {
            let _ = transport.close().await;
        }

        match mode {
            StopMode::Graceful => Self::signal(pid, libc::SIGTERM),
            StopMode::Force => Self::signal(pid, libc::SIGKILL),
        }

        // The wait task owns the child and observes the actual exit; wait on
        // it so callers see the process gone when stop() returns.
        if let Some(task) = self.wait_task.take() {
            let grace = Duration::from_secs(GRACEFUL_EXIT_TIMEOUT_SECS);
            match tokio::time::timeout(grace, task).await {
                Ok(_) => {}
                Err(_) => {
                    warn!("server pid {} did not exit in time, sending SIGKILL", pid);
                    Self::signal(pid, libc::SIGKILL);
                    // Exit is now inevitable; the detached wait task will
                    // still record it.
                }
            }
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }

        self.set_state(ProcessState::Stopped);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.state().is_running()
    }

    fn take_transport(&mut self) -> Result<StdioTransport, Self::Error> {
        self.transport.take().ok_or(ProcessError::NotStarted)
    }

    fn on_exit(&mut self, handler: Arc<dyn ProcessExitHandler>) {
        self.exit_handler = Some(handler);
    }

    fn kill_sync(&mut self) {
        if let Some(pid) = self.state().pid() {
            warn!("killing leftover language server pid {}", pid);
            Self::signal(pid, libc::SIGKILL);
            self.set_state(ProcessState::Stopped);
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
        self.transport.take();
    }
}

impl Drop for ServerProcess {
    fn drop(&mut self) {
        self.kill_sync();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct ExitFlag(AtomicBool);

    #[async_trait]
    impl ProcessExitHandler for ExitFlag {
        async fn on_process_exit(&self, _event: ProcessExitEvent) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_server_process_lifecycle() {
        let mut process = ServerProcess::new("sleep".to_string(), vec!["30".to_string()]);
        assert!(!process.is_running());

        process.start().await.unwrap();
        assert!(process.is_running());
        assert!(process.state().pid().is_some());
        assert!(process.take_transport().is_ok());

        process.stop(StopMode::Graceful).await.unwrap();
        assert!(!process.is_running());
        assert_eq!(process.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_spawn_failure_for_missing_executable() {
        let mut process =
            ServerProcess::new("/nonexistent/path/to/trunkls".to_string(), Vec::new());
        let result = process.start().await;
        assert!(matches!(result, Err(ProcessError::Io(_))));
        assert!(!process.is_running());
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let mut process = ServerProcess::new("sleep".to_string(), vec!["30".to_string()]);
        process.start().await.unwrap();
        assert!(matches!(
            process.start().await,
            Err(ProcessError::AlreadyStarted)
        ));
        process.stop(StopMode::Force).await.unwrap();
    }

    #[tokio::test]
    async fn test_exit_handler_fires_on_unrequested_exit() {
        let flag = Arc::new(ExitFlag(AtomicBool::new(false)));
        let mut process = ServerProcess::new("true".to_string(), Vec::new());
        process.on_exit(flag.clone());

        process.start().await.unwrap();

        // `true` exits immediately; poll until the wait task observed it.
        for _ in 0..100 {
            if flag.0.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(flag.0.load(Ordering::SeqCst));
        assert_eq!(process.state(), ProcessState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_without_start_errors() {
        let mut process = ServerProcess::new("sleep".to_string(), Vec::new());
        assert!(matches!(
            process.stop(StopMode::Graceful).await,
            Err(ProcessError::NotStarted)
        ));
    }
}
