//! Client session lifecycle
//!
//! [`ClientSession`] is the one object the hosting environment sees: it binds
//! an identity, a launch configuration pair, and a document selector to a
//! running server process and its message channel, and owns both exclusively.
//!
//! State machine:
//!
//! `Stopped -> (start) -> Starting -> (handshake ok) -> Running -> (stop) -> Stopped`
//!
//! with `Starting -> Stopped` on spawn or handshake failure. Duplicate
//! `start` and `stop` calls are no-ops; the host may deliver activation
//! signals more than once.

use crate::io::process::{
    ProcessExitEvent, ProcessExitHandler, ProcessManager, ServerProcess, StopMode,
};
use crate::launch::{LaunchMode, LaunchOptions};
use crate::lsp::client::{LspClient, LspError};
use crate::selector::{DocumentSelector, TextDocument};
use async_trait::async_trait;
use lsp_types::ClientInfo;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

// ============================================================================
// Configuration
// ============================================================================

/// Default timeout for the LSP initialize handshake.
pub const DEFAULT_INITIALIZATION_TIMEOUT_SECS: u64 = 30;

/// Default timeout for the shutdown request during teardown.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Stable identifier and display label for the client.
///
/// The id scopes persisted settings; the display name shows up in the host's
/// UI and in the server's logs via `clientInfo`.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub id: String,
    pub display_name: String,
}

impl ClientIdentity {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Session tuning knobs, threaded in explicitly rather than read from
/// ambient global state.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Bound on the initialize handshake
    pub initialization_timeout: Duration,
    /// Bound on the shutdown request during stop
    pub shutdown_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initialization_timeout: Duration::from_secs(DEFAULT_INITIALIZATION_TIMEOUT_SECS),
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        }
    }
}

// ============================================================================
// State and Errors
// ============================================================================

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Stopped,
    Starting,
    Running,
}

/// Errors surfaced at the session boundary.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Malformed construction input; no process is ever spawned.
    #[error("invalid client configuration: {0}")]
    Configuration(String),

    /// The server executable could not be spawned.
    #[error("failed to launch language server `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The process started but LSP initialization did not complete.
    #[error("language server handshake failed: {0}")]
    Handshake(#[source] LspError),

    /// The channel broke while the session was running.
    #[error("language server channel lost: {0}")]
    Channel(String),
}

/// Exit observer shared with the process wait task.
///
/// Flips the session to `Stopped` when the server dies underneath it, so
/// later document events are dropped instead of queued against a dead
/// channel.
struct ExitWatch {
    state: Arc<Mutex<SessionState>>,
    client_id: String,
}

#[async_trait]
impl ProcessExitHandler for ExitWatch {
    async fn on_process_exit(&self, event: ProcessExitEvent) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match *state {
            SessionState::Stopped => {
                debug!(
                    client = %self.client_id,
                    code = ?event.code,
                    "server exited after stop"
                );
            }
            SessionState::Starting | SessionState::Running => {
                error!(
                    client = %self.client_id,
                    code = ?event.code,
                    "language server exited unexpectedly"
                );
                *state = SessionState::Stopped;
            }
        }
    }
}

/// Resets a session left in `Starting` when an in-flight `start` future is
/// dropped before completing. Success and failure paths have moved the state
/// on by the time this drops, so only a cancellation trips it.
struct StartGuard {
    state: Arc<Mutex<SessionState>>,
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == SessionState::Starting {
            *state = SessionState::Stopped;
        }
    }
}

// ============================================================================
// Client Session
// ============================================================================

/// The live binding of one language server process to one message channel.
///
/// At most one session exists per activation; re-activation after teardown
/// requires a new session. Construction performs no I/O.
pub struct ClientSession<P: ProcessManager = ServerProcess> {
    identity: ClientIdentity,
    launch: LaunchOptions,
    mode: LaunchMode,
    selector: DocumentSelector,
    config: SessionConfig,

    /// Shared with the exit watch installed on the process
    state: Arc<Mutex<SessionState>>,

    process: P,
    lsp: Option<LspClient<P::Transport>>,

    /// LSP document versions for currently open documents, keyed by URI
    open_documents: HashMap<String, i32>,
    next_version: i32,
}

impl ClientSession<ServerProcess> {
    /// Construct a session spawning the real server process.
    pub fn new(
        identity: ClientIdentity,
        launch: LaunchOptions,
        mode: LaunchMode,
        selector: DocumentSelector,
        config: SessionConfig,
    ) -> Result<Self, ClientError> {
        Self::validate(&launch, &selector, &config)?;
        let active = launch.for_mode(mode);
        let process = ServerProcess::new(active.command.clone(), active.args.clone());
        Ok(Self::assemble(
            identity, launch, mode, selector, config, process,
        ))
    }
}

impl<P: ProcessManager> ClientSession<P> {
    /// Construct a session over a caller-supplied process manager.
    ///
    /// The production constructor goes through [`ClientSession::new`]; this
    /// entry point exists for tests that substitute a mock server.
    pub fn with_process(
        identity: ClientIdentity,
        launch: LaunchOptions,
        mode: LaunchMode,
        selector: DocumentSelector,
        config: SessionConfig,
        process: P,
    ) -> Result<Self, ClientError> {
        Self::validate(&launch, &selector, &config)?;
        Ok(Self::assemble(
            identity, launch, mode, selector, config, process,
        ))
    }

    fn validate(
        launch: &LaunchOptions,
        selector: &DocumentSelector,
        config: &SessionConfig,
    ) -> Result<(), ClientError> {
        if selector.is_empty() {
            return Err(ClientError::Configuration(
                "document selector must not be empty".to_string(),
            ));
        }
        for variant in [&launch.run, &launch.debug] {
            if variant.command.is_empty() {
                return Err(ClientError::Configuration(format!(
                    "missing server command for {:?} mode",
                    variant.mode
                )));
            }
        }
        if config.initialization_timeout.is_zero() || config.shutdown_timeout.is_zero() {
            return Err(ClientError::Configuration(
                "session timeouts must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    fn assemble(
        identity: ClientIdentity,
        launch: LaunchOptions,
        mode: LaunchMode,
        selector: DocumentSelector,
        config: SessionConfig,
        mut process: P,
    ) -> Self {
        let state = Arc::new(Mutex::new(SessionState::Stopped));
        process.on_exit(Arc::new(ExitWatch {
            state: Arc::clone(&state),
            client_id: identity.id.clone(),
        }));
        Self {
            identity,
            launch,
            mode,
            selector,
            config,
            state,
            process,
            lsp: None,
            open_documents: HashMap::new(),
            next_version: 1,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: SessionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = next;
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    pub fn mode(&self) -> LaunchMode {
        self.mode
    }

    pub fn selector(&self) -> &DocumentSelector {
        &self.selector
    }

    /// Capabilities reported by the server, once `Running`.
    pub fn server_capabilities(&self) -> Option<&lsp_types::ServerCapabilities> {
        self.lsp.as_ref().and_then(|lsp| lsp.server_capabilities())
    }

    fn active_command(&self) -> &str {
        &self.launch.for_mode(self.mode).command
    }

    /// Spawn the server and perform the LSP handshake.
    ///
    /// Idempotent: a second `start` while `Starting` or `Running` is a no-op,
    /// tolerating duplicate activation signals. On failure the session is
    /// back in `Stopped` with the process gone, and the caller decides
    /// whether to retry.
    pub async fn start(&mut self) -> Result<(), ClientError> {
        match self.state() {
            SessionState::Starting | SessionState::Running => {
                debug!(client = %self.identity.id, "start ignored, session already active");
                return Ok(());
            }
            SessionState::Stopped => {}
        }

        // A start cancelled mid-spawn leaves its process behind; clear it
        // before spawning again.
        if self.process.is_running() {
            debug!(client = %self.identity.id, "killing leftover server from a cancelled start");
            self.process.kill_sync();
        }

        info!(
            client = %self.identity.id,
            mode = ?self.mode,
            command = %self.active_command(),
            "starting language client session"
        );
        self.set_state(SessionState::Starting);
        let _guard = StartGuard {
            state: Arc::clone(&self.state),
        };

        if let Err(e) = self.process.start().await {
            self.set_state(SessionState::Stopped);
            return Err(ClientError::Spawn {
                command: self.active_command().to_string(),
                source: Box::new(e),
            });
        }

        let transport = match self.process.take_transport() {
            Ok(transport) => transport,
            Err(e) => {
                self.process.kill_sync();
                self.set_state(SessionState::Stopped);
                return Err(ClientError::Spawn {
                    command: self.active_command().to_string(),
                    source: Box::new(e),
                });
            }
        };

        let mut lsp = LspClient::new(transport);
        let client_info = ClientInfo {
            name: self.identity.display_name.clone(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        };

        if let Err(e) = lsp
            .initialize(Some(client_info), self.config.initialization_timeout)
            .await
        {
            warn!(client = %self.identity.id, "handshake failed: {}", e);
            if let Err(stop_err) = self.process.stop(StopMode::Force).await {
                debug!("process already gone during handshake cleanup: {}", stop_err);
            }
            self.set_state(SessionState::Stopped);
            return Err(ClientError::Handshake(e));
        }

        self.lsp = Some(lsp);
        self.set_state(SessionState::Running);

        // The server may have died between the handshake reply and now; never
        // report Running with no process behind it.
        if !self.process.is_running() {
            self.lsp = None;
            self.set_state(SessionState::Stopped);
            return Err(ClientError::Channel(
                "server exited during startup".to_string(),
            ));
        }

        info!(client = %self.identity.id, "language client session running");
        Ok(())
    }

    /// Tear the session down.
    ///
    /// Idempotent and safe to call at any point of the lifecycle, including
    /// after a failed or never-attempted `start`. Sends the LSP
    /// shutdown/exit sequence while the channel is live, then terminates the
    /// process.
    pub async fn stop(&mut self) -> Result<(), ClientError> {
        let lsp = self.lsp.take();
        if lsp.is_none() && !self.process.is_running() {
            debug!(client = %self.identity.id, "stop ignored, session already stopped");
            self.set_state(SessionState::Stopped);
            return Ok(());
        }

        info!(client = %self.identity.id, "stopping language client session");
        // Mark stopped first so the exit watch treats the coming process
        // exit as requested and document events are dropped immediately.
        self.set_state(SessionState::Stopped);
        self.open_documents.clear();

        if let Some(mut lsp) = lsp {
            if self.process.is_running() && lsp.is_connected() {
                if let Err(e) = lsp.shutdown(self.config.shutdown_timeout).await {
                    warn!(client = %self.identity.id, "graceful shutdown failed: {}", e);
                }
            }
            lsp.close().await;
        }

        if self.process.is_running() {
            if let Err(e) = self.process.stop(StopMode::Graceful).await {
                warn!(client = %self.identity.id, "process stop failed: {}", e);
            }
        }

        info!(client = %self.identity.id, "language client session stopped");
        Ok(())
    }

    /// Consume the session, tearing it down.
    pub async fn dispose(mut self) -> Result<(), ClientError> {
        self.stop().await
    }

    /// Route a document-open event.
    ///
    /// Returns whether a notification was forwarded; non-matching documents
    /// and events outside `Running` are dropped, never queued.
    pub fn notify_did_open(&mut self, document: &TextDocument) -> Result<bool, ClientError> {
        if !self.routable(document) {
            return Ok(false);
        }
        if self.open_documents.contains_key(&document.uri) {
            debug!(uri = %document.uri, "ignoring duplicate didOpen");
            return Ok(false);
        }

        let version = self.next_version;
        let Some(lsp) = self.lsp.as_ref() else {
            return Ok(false);
        };
        match lsp.did_open(
            &document.uri,
            &document.language_id,
            version,
            document.text.clone(),
        ) {
            Ok(()) => {
                self.next_version += 1;
                self.open_documents.insert(document.uri.clone(), version);
                Ok(true)
            }
            Err(e) => Err(self.channel_lost(e)),
        }
    }

    /// Route a document-change event (full-text sync).
    pub fn notify_did_change(&mut self, document: &TextDocument) -> Result<bool, ClientError> {
        if !self.routable(document) {
            return Ok(false);
        }
        if !self.open_documents.contains_key(&document.uri) {
            debug!(uri = %document.uri, "ignoring didChange for unopened document");
            return Ok(false);
        }

        let version = self.next_version;
        let Some(lsp) = self.lsp.as_ref() else {
            return Ok(false);
        };
        match lsp.did_change(&document.uri, version, document.text.clone()) {
            Ok(()) => {
                self.next_version += 1;
                self.open_documents.insert(document.uri.clone(), version);
                Ok(true)
            }
            Err(e) => Err(self.channel_lost(e)),
        }
    }

    /// Route a document-close event.
    pub fn notify_did_close(&mut self, document: &TextDocument) -> Result<bool, ClientError> {
        if !self.routable(document) {
            return Ok(false);
        }
        if self.open_documents.remove(&document.uri).is_none() {
            return Ok(false);
        }

        let Some(lsp) = self.lsp.as_ref() else {
            return Ok(false);
        };
        match lsp.did_close(&document.uri) {
            Ok(()) => Ok(true),
            Err(e) => Err(self.channel_lost(e)),
        }
    }

    fn routable(&self, document: &TextDocument) -> bool {
        if !self.selector.matches_document(document) {
            return false;
        }
        if self.state() != SessionState::Running {
            debug!(
                uri = %document.uri,
                "dropping document event, session not running"
            );
            return false;
        }
        true
    }

    /// The channel broke mid-session: kill whatever is left of the process
    /// so the state never claims `Stopped` with a live server behind it.
    fn channel_lost(&mut self, cause: LspError) -> ClientError {
        error!(client = %self.identity.id, "channel lost: {}", cause);
        self.lsp = None;
        self.open_documents.clear();
        self.process.kill_sync();
        self.set_state(SessionState::Stopped);
        ClientError::Channel(cause.to_string())
    }
}

// The process manager and LSP client carry no useful Debug surface; the
// identity and lifecycle state are what diagnostics need.
impl<P: ProcessManager> std::fmt::Debug for ClientSession<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("id", &self.identity.id)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<P: ProcessManager> Drop for ClientSession<P> {
    fn drop(&mut self) {
        // Covers host teardown mid-start: a partially spawned server is
        // killed rather than leaked.
        if self.process.is_running() {
            warn!(
                client = %self.identity.id,
                "session dropped while server running, killing process"
            );
            self.process.kill_sync();
        }
        self.set_state(SessionState::Stopped);
    }
}

// ============================================================================
// Tests
// ============================================================================
