//! Transport layer - bidirectional message exchange with the server process
//!
//! A [`Transport`] moves opaque message strings in both directions without
//! knowing anything about framing or the protocol spoken over it. The session
//! owns exactly one transport per running server; nothing else writes to it.

use async_trait::async_trait;
use std::io;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tracing::{error, trace};

/// Core transport trait for ordered, bidirectional message exchange
#[async_trait]
pub trait Transport: Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Send a raw message. Messages are delivered in submission order.
    async fn send(&mut self, message: &str) -> Result<(), Self::Error>;

    /// Receive the next raw chunk of inbound data.
    async fn receive(&mut self) -> Result<String, Self::Error>;

    /// Close the transport and release both directions.
    async fn close(&mut self) -> Result<(), Self::Error>;

    /// Check whether the transport is still usable.
    fn is_connected(&self) -> bool;
}

// ============================================================================
// Stdio Transport
// ============================================================================

/// Error types for the stdio transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("transport is disconnected")]
    Disconnected,
}

/// Transport over a child process's stdin/stdout pipes.
///
/// A writer task and a reader task decouple pipe I/O from callers; each
/// direction is a single ordered queue, so messages are never reordered
/// relative to each other (LSP correlates responses by id and relies on
/// notification order per document).
pub struct StdioTransport {
    outbound: Option<mpsc::UnboundedSender<String>>,
    inbound: Option<mpsc::UnboundedReceiver<String>>,
    connected: bool,
}

impl StdioTransport {
    /// Wire a transport onto the stdio pipes taken from a spawned child.
    pub fn new(stdin: ChildStdin, stdout: ChildStdout) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        tokio::spawn(Self::writer_task(stdin, outbound_rx));
        tokio::spawn(Self::reader_task(stdout, inbound_tx));

        Self {
            outbound: Some(outbound),
            inbound: Some(inbound),
            connected: true,
        }
    }

    /// Drains the outbound queue into the child's stdin.
    async fn writer_task(mut stdin: ChildStdin, mut queue: mpsc::UnboundedReceiver<String>) {
        while let Some(message) = queue.recv().await {
            trace!("stdio transport: writing {} bytes", message.len());
            if let Err(e) = stdin.write_all(message.as_bytes()).await {
                error!("stdio transport: write to server stdin failed: {}", e);
                break;
            }
            if let Err(e) = stdin.flush().await {
                error!("stdio transport: flush of server stdin failed: {}", e);
                break;
            }
        }
        trace!("stdio transport: writer task finished");
    }

    /// Forwards raw stdout chunks to the inbound queue until EOF.
    async fn reader_task(mut stdout: ChildStdout, queue: mpsc::UnboundedSender<String>) {
        let mut buf = vec![0u8; 8 * 1024];
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) => {
                    trace!("stdio transport: server stdout reached EOF");
                    break;
                }
                Ok(n) => {
                    let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                    trace!("stdio transport: read {} bytes", n);
                    if queue.send(chunk).is_err() {
                        trace!("stdio transport: inbound receiver dropped, stopping reader");
                        break;
                    }
                }
                Err(e) => {
                    error!("stdio transport: read from server stdout failed: {}", e);
                    break;
                }
            }
        }
        trace!("stdio transport: reader task finished");
    }
}

#[async_trait]
impl Transport for StdioTransport {
    type Error = TransportError;

    async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
        let outbound = self
            .outbound
            .as_ref()
            .filter(|_| self.connected)
            .ok_or(TransportError::Disconnected)?;

        outbound
            .send(message.to_string())
            .map_err(|_| TransportError::Disconnected)
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        if !self.connected {
            return Err(TransportError::Disconnected);
        }

        let inbound = self.inbound.as_mut().ok_or(TransportError::Disconnected)?;

        inbound.recv().await.ok_or(TransportError::Disconnected)
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        self.outbound.take();
        self.inbound.take();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ============================================================================
// Mock Transport
// ============================================================================

/// Error type for the mock transport
#[derive(Debug, thiserror::Error)]
pub enum MockTransportError {
    #[error("transport is disconnected")]
    Disconnected,
}

/// In-memory transport for tests.
///
/// Sent messages are recorded and observable through a [`MockTransportHandle`]
/// even after the transport has been moved into a client. `receive` waits for
/// responses injected through the handle instead of failing when the queue is
/// empty, so a client's background read loop stays alive for the whole test.
pub struct MockTransport {
    sent: Arc<Mutex<Vec<String>>>,
    responses: mpsc::UnboundedReceiver<String>,
    response_tx: mpsc::UnboundedSender<String>,
    connected: bool,
}

/// Shared view on a [`MockTransport`] retained by the test.
#[derive(Clone)]
pub struct MockTransportHandle {
    sent: Arc<Mutex<Vec<String>>>,
    response_tx: mpsc::UnboundedSender<String>,
}

impl MockTransport {
    pub fn new() -> Self {
        let (response_tx, responses) = mpsc::unbounded_channel();
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            responses,
            response_tx,
            connected: true,
        }
    }

    /// Obtain a handle for injecting responses and inspecting sent traffic.
    pub fn handle(&self) -> MockTransportHandle {
        MockTransportHandle {
            sent: Arc::clone(&self.sent),
            response_tx: self.response_tx.clone(),
        }
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransportHandle {
    /// Queue a raw message to be returned by the transport's `receive`.
    pub fn push_inbound(&self, message: impl Into<String>) {
        let _ = self.response_tx.send(message.into());
    }

    /// Snapshot of everything sent through the transport so far.
    pub fn sent_messages(&self) -> Vec<String> {
        self.sent.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl Transport for MockTransport {
    type Error = MockTransportError;

    async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
        if !self.connected {
            return Err(MockTransportError::Disconnected);
        }
        self.sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.to_string());
        Ok(())
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        if !self.connected {
            return Err(MockTransportError::Disconnected);
        }
        self.responses
            .recv()
            .await
            .ok_or(MockTransportError::Disconnected)
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    #[tokio::test]
    async fn test_stdio_transport_round_trip_through_cat() {
        let mut child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("failed to spawn cat");

        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let mut transport = StdioTransport::new(stdin, stdout);

        transport.send("hello server\n").await.unwrap();

        let echoed = transport.receive().await.unwrap();
        assert_eq!(echoed, "hello server\n");

        transport.close().await.unwrap();
        assert!(!transport.is_connected());
        let _ = child.kill().await;
    }

    #[tokio::test]
    async fn test_stdio_transport_preserves_send_order() {
        let mut child = Command::new("cat")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("failed to spawn cat");

        let stdin = child.stdin.take().unwrap();
        let stdout = child.stdout.take().unwrap();
        let mut transport = StdioTransport::new(stdin, stdout);

        for i in 0..10 {
            transport.send(&format!("message-{i}\n")).await.unwrap();
        }

        let mut received = String::new();
        while received.matches('\n').count() < 10 {
            received.push_str(&transport.receive().await.unwrap());
        }
        let lines: Vec<&str> = received.lines().collect();
        for (i, line) in lines.iter().enumerate() {
            assert_eq!(*line, format!("message-{i}"));
        }

        transport.close().await.unwrap();
        let _ = child.kill().await;
    }

    #[tokio::test]
    async fn test_mock_transport_records_and_replays() {
        let mut transport = MockTransport::new();
        let handle = transport.handle();

        handle.push_inbound("first");
        handle.push_inbound("second");

        transport.send("outgoing").await.unwrap();
        assert_eq!(transport.receive().await.unwrap(), "first");
        assert_eq!(transport.receive().await.unwrap(), "second");
        assert_eq!(handle.sent_messages(), vec!["outgoing"]);
    }

    #[tokio::test]
    async fn test_mock_transport_rejects_use_after_close() {
        let mut transport = MockTransport::new();
        transport.close().await.unwrap();

        assert!(!transport.is_connected());
        assert!(transport.send("late").await.is_err());
        assert!(transport.receive().await.is_err());
    }
}
