//! Test support
//!
//! An in-memory [`ProcessManager`] that stands in for the real server
//! process, plus small helpers for scripting LSP traffic. Session tests drive
//! the full client stack (framing, JSON-RPC, typed client) against these
//! mocks without spawning anything.

use crate::io::process::{ProcessError, ProcessExitEvent, ProcessExitHandler, ProcessManager, StopMode};
use crate::io::transport::{MockTransport, MockTransportHandle};
use async_trait::async_trait;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Frame a JSON payload the way the wire protocol expects.
pub fn frame(payload: &str) -> String {
    format!("Content-Length: {}\r\n\r\n{}", payload.len(), payload)
}

// ============================================================================
// Mock Process Manager
// ============================================================================

struct MockServerShared {
    running: bool,
    start_calls: usize,
    fail_next_start: bool,
    /// Framed messages delivered as soon as the next start creates a transport
    scripted: Vec<String>,
    /// Handle onto the transport created by the most recent start
    transport_handle: Option<MockTransportHandle>,
    transport: Option<MockTransport>,
    exit_handler: Option<Arc<dyn ProcessExitHandler>>,
}

/// Process manager whose "server" is a scriptable in-memory transport.
pub struct MockProcessManager {
    shared: Arc<Mutex<MockServerShared>>,
}

/// Test-side view on a [`MockProcessManager`], kept after the manager has
/// been moved into a session.
#[derive(Clone)]
pub struct MockServerController {
    shared: Arc<Mutex<MockServerShared>>,
}

impl MockProcessManager {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Mutex::new(MockServerShared {
                running: false,
                start_calls: 0,
                fail_next_start: false,
                scripted: Vec::new(),
                transport_handle: None,
                transport: None,
                exit_handler: None,
            })),
        }
    }

    pub fn controller(&self) -> MockServerController {
        MockServerController {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl Default for MockProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

impl MockServerController {
    fn lock(&self) -> std::sync::MutexGuard<'_, MockServerShared> {
        self.shared.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Make the next `start` fail as if the executable did not exist.
    pub fn fail_next_start(&self) {
        self.lock().fail_next_start = true;
    }

    /// Script a response delivered right after the next start. The payload is
    /// framed here; pass raw JSON.
    pub fn script_response(&self, payload: &str) {
        let framed = frame(payload);
        self.lock().scripted.push(framed);
    }

    /// Push a response to the currently running server's transport.
    pub fn respond(&self, payload: &str) {
        let framed = frame(payload);
        if let Some(handle) = self.lock().transport_handle.as_ref() {
            handle.push_inbound(framed);
        }
    }

    /// Number of `start` calls observed, including failed ones.
    pub fn start_calls(&self) -> usize {
        self.lock().start_calls
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    /// Everything the client wrote to the server, framed.
    pub fn sent_messages(&self) -> Vec<String> {
        self.lock()
            .transport_handle
            .as_ref()
            .map(|h| h.sent_messages())
            .unwrap_or_default()
    }

    /// Simulate the server dying on its own.
    pub async fn trigger_exit(&self, code: Option<i32>) {
        let handler = {
            let mut shared = self.lock();
            shared.running = false;
            shared.exit_handler.clone()
        };
        if let Some(handler) = handler {
            handler.on_process_exit(ProcessExitEvent { code }).await;
        }
    }

    /// Poll until some sent message contains `needle`, or give up after
    /// `timeout`. Outbound traffic goes through a background writer, so sent
    /// messages land asynchronously.
    pub async fn wait_for_message(&self, needle: &str, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.sent_messages().iter().any(|m| m.contains(needle)) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

#[async_trait]
impl ProcessManager for MockProcessManager {
    type Error = ProcessError;
    type Transport = MockTransport;

    async fn start(&mut self) -> Result<(), Self::Error> {
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        shared.start_calls += 1;

        if shared.running {
            return Err(ProcessError::AlreadyStarted);
        }
        if shared.fail_next_start {
            shared.fail_next_start = false;
            return Err(ProcessError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "mock spawn failure",
            )));
        }

        let transport = MockTransport::new();
        let handle = transport.handle();
        for message in shared.scripted.drain(..) {
            handle.push_inbound(message);
        }
        shared.transport_handle = Some(handle);
        shared.transport = Some(transport);
        shared.running = true;
        Ok(())
    }

    async fn stop(&mut self, _mode: StopMode) -> Result<(), Self::Error> {
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        shared.running = false;
        shared.transport = None;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.shared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .running
    }

    fn take_transport(&mut self) -> Result<Self::Transport, Self::Error> {
        self.shared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .transport
            .take()
            .ok_or(ProcessError::NotStarted)
    }

    fn on_exit(&mut self, handler: Arc<dyn ProcessExitHandler>) {
        self.shared
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .exit_handler = Some(handler);
    }

    fn kill_sync(&mut self) {
        let mut shared = self.shared.lock().unwrap_or_else(|e| e.into_inner());
        shared.running = false;
        shared.transport = None;
    }
}

// ============================================================================
// Tests
// ============================================================================
