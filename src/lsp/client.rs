//! Typed LSP client
//!
//! Thin typed surface over the JSON-RPC layer using the `lsp-types` crate:
//! the `initialize`/`initialized` handshake, the `shutdown`/`exit` sequence,
//! and the `textDocument/did*` notifications the session routes documents
//! through.

use crate::io::transport::Transport;
use crate::lsp::protocol::{JsonRpcClient, JsonRpcError};
use lsp_types::{
    ClientCapabilities, ClientInfo, DidChangeTextDocumentParams, DidCloseTextDocumentParams,
    DidOpenTextDocumentParams, InitializeParams, InitializeResult, InitializedParams,
    ServerCapabilities, TextDocumentContentChangeEvent, TextDocumentIdentifier, TextDocumentItem,
    Uri, VersionedTextDocumentIdentifier,
};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

// ============================================================================
// Errors
// ============================================================================

/// LSP client errors
#[derive(Debug, thiserror::Error)]
pub enum LspError {
    #[error("JSON-RPC error: {0}")]
    JsonRpc(#[from] JsonRpcError),

    #[error("client already initialized")]
    AlreadyInitialized,

    #[error("client not initialized")]
    NotInitialized,

    #[error("invalid document URI: {0}")]
    InvalidUri(String),
}

// ============================================================================
// Client
// ============================================================================

/// Typed LSP client over any transport.
pub struct LspClient<T: Transport> {
    rpc: JsonRpcClient<T>,
    initialized: bool,
    server_capabilities: Option<ServerCapabilities>,
}

impl<T: Transport + 'static> LspClient<T> {
    pub fn new(transport: T) -> Self {
        Self {
            rpc: JsonRpcClient::new(transport),
            initialized: false,
            server_capabilities: None,
        }
    }

    /// Perform the `initialize`/`initialized` handshake.
    ///
    /// Capabilities are left at their defaults; the server is told who we are
    /// through `client_info` so its logs can attribute the connection.
    pub async fn initialize(
        &mut self,
        client_info: Option<ClientInfo>,
        timeout: Duration,
    ) -> Result<InitializeResult, LspError> {
        if self.initialized {
            return Err(LspError::AlreadyInitialized);
        }

        info!("initializing LSP connection");

        #[allow(deprecated)]
        let params = InitializeParams {
            process_id: Some(std::process::id()),
            capabilities: ClientCapabilities::default(),
            client_info,
            ..Default::default()
        };

        let result: InitializeResult = self
            .rpc
            .request_with_timeout("initialize", Some(params), timeout)
            .await?;

        debug!("server capabilities: {:?}", result.capabilities);
        self.server_capabilities = Some(result.capabilities.clone());

        self.rpc.notify("initialized", Some(InitializedParams {}))?;
        self.initialized = true;
        info!("LSP connection initialized");

        Ok(result)
    }

    /// Run the `shutdown`/`exit` sequence.
    ///
    /// `exit` is sent even when the `shutdown` response does not arrive in
    /// time; the process layer terminates a server that ignores it.
    pub async fn shutdown(&mut self, timeout: Duration) -> Result<(), LspError> {
        if !self.initialized {
            return Ok(());
        }

        info!("shutting down LSP connection");

        let shutdown_result: Result<Value, JsonRpcError> = self
            .rpc
            .request_with_timeout("shutdown", None::<Value>, timeout)
            .await;
        if let Err(e) = &shutdown_result {
            warn!("shutdown request failed: {}", e);
        }

        if let Err(e) = self.rpc.notify("exit", None::<Value>) {
            warn!("exit notification failed: {}", e);
        }

        self.initialized = false;
        shutdown_result.map(|_| ()).map_err(LspError::JsonRpc)
    }

    /// Forward a `textDocument/didOpen` notification.
    pub fn did_open(
        &self,
        uri: &str,
        language_id: &str,
        version: i32,
        text: String,
    ) -> Result<(), LspError> {
        self.ensure_initialized()?;
        let params = DidOpenTextDocumentParams {
            text_document: TextDocumentItem::new(
                Self::parse_uri(uri)?,
                language_id.to_string(),
                version,
                text,
            ),
        };
        self.rpc.notify("textDocument/didOpen", Some(params))?;
        Ok(())
    }

    /// Forward a `textDocument/didChange` notification with full-text sync.
    pub fn did_change(&self, uri: &str, version: i32, text: String) -> Result<(), LspError> {
        self.ensure_initialized()?;
        let params = DidChangeTextDocumentParams {
            text_document: VersionedTextDocumentIdentifier {
                uri: Self::parse_uri(uri)?,
                version,
            },
            content_changes: vec![TextDocumentContentChangeEvent {
                range: None,
                range_length: None,
                text,
            }],
        };
        self.rpc.notify("textDocument/didChange", Some(params))?;
        Ok(())
    }

    /// Forward a `textDocument/didClose` notification.
    pub fn did_close(&self, uri: &str) -> Result<(), LspError> {
        self.ensure_initialized()?;
        let params = DidCloseTextDocumentParams {
            text_document: TextDocumentIdentifier {
                uri: Self::parse_uri(uri)?,
            },
        };
        self.rpc.notify("textDocument/didClose", Some(params))?;
        Ok(())
    }

    /// Install a handler for server-initiated notifications.
    pub async fn on_notification<F>(&self, handler: F)
    where
        F: Fn(crate::lsp::protocol::JsonRpcNotification) + Send + Sync + 'static,
    {
        self.rpc.on_notification(handler).await;
    }

    /// Whether the handshake has completed.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Capabilities the server reported during the handshake.
    pub fn server_capabilities(&self) -> Option<&ServerCapabilities> {
        self.server_capabilities.as_ref()
    }

    /// Whether the underlying channel still accepts traffic.
    pub fn is_connected(&self) -> bool {
        self.rpc.is_connected()
    }

    /// Release the channel without the shutdown sequence.
    pub async fn close(&mut self) {
        self.initialized = false;
        self.rpc.close().await;
    }

    fn ensure_initialized(&self) -> Result<(), LspError> {
        if self.initialized {
            Ok(())
        } else {
            Err(LspError::NotInitialized)
        }
    }

    fn parse_uri(uri: &str) -> Result<Uri, LspError> {
        uri.parse()
            .map_err(|_| LspError::InvalidUri(uri.to_string()))
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::transport::{MockTransport, MockTransportHandle};

    fn frame(payload: &str) -> String {
        format!("Content-Length: {}\r\n\r\n{}", payload.len(), payload)
    }

    fn empty_initialize_response(id: u64) -> String {
        frame(&format!(
            r#"{{"jsonrpc":"2.0","id":{id},"result":{{"capabilities":{{}}}}}}"#
        ))
    }

    async fn wait_for_sent(handle: &MockTransportHandle, count: usize) -> Vec<String> {
        for _ in 0..200 {
            let sent = handle.sent_messages();
            if sent.len() >= count {
                return sent;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        handle.sent_messages()
    }

    #[tokio::test]
    async fn test_initialize_handshake() {
        let transport = MockTransport::new();
        let handle = transport.handle();
        let mut client = LspClient::new(transport);

        handle.push_inbound(empty_initialize_response(1));

        let info = ClientInfo {
            name: "htmx-lsp".to_string(),
            version: Some("0.1.0".to_string()),
        };
        client
            .initialize(Some(info), Duration::from_secs(5))
            .await
            .unwrap();

        assert!(client.is_initialized());
        assert!(client.server_capabilities().is_some());

        let sent = wait_for_sent(&handle, 2).await;
        assert!(sent[0].contains(r#""method":"initialize""#));
        assert!(sent[0].contains(r#""name":"htmx-lsp""#));
        assert!(sent[1].contains(r#""method":"initialized""#));
    }

    #[tokio::test]
    async fn test_double_initialize_is_rejected() {
        let transport = MockTransport::new();
        let handle = transport.handle();
        let mut client = LspClient::new(transport);

        handle.push_inbound(empty_initialize_response(1));
        client
            .initialize(None, Duration::from_secs(5))
            .await
            .unwrap();

        assert!(matches!(
            client.initialize(None, Duration::from_secs(5)).await,
            Err(LspError::AlreadyInitialized)
        ));
    }

    #[tokio::test]
    async fn test_document_notifications_require_initialization() {
        let transport = MockTransport::new();
        let client: LspClient<MockTransport> = LspClient::new(transport);

        let result = client.did_open("file:///index.html", "html", 1, String::new());
        assert!(matches!(result, Err(LspError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_did_open_payload_shape() {
        let transport = MockTransport::new();
        let handle = transport.handle();
        let mut client = LspClient::new(transport);

        handle.push_inbound(empty_initialize_response(1));
        client
            .initialize(None, Duration::from_secs(5))
            .await
            .unwrap();

        client
            .did_open(
                "file:///srv/index.html",
                "html",
                1,
                "<div hx-get=\"/\"></div>".to_string(),
            )
            .unwrap();

        let sent = wait_for_sent(&handle, 3).await;
        let open = &sent[2];
        assert!(open.contains(r#""method":"textDocument/didOpen""#));
        assert!(open.contains(r#""languageId":"html""#));
        assert!(open.contains("file:///srv/index.html"));
    }

    #[tokio::test]
    async fn test_shutdown_sends_exit_even_on_timeout() {
        let transport = MockTransport::new();
        let handle = transport.handle();
        let mut client = LspClient::new(transport);

        handle.push_inbound(empty_initialize_response(1));
        client
            .initialize(None, Duration::from_secs(5))
            .await
            .unwrap();

        // No shutdown response queued; the request times out but exit still
        // goes on the wire.
        let result = client.shutdown(Duration::from_millis(50)).await;
        assert!(result.is_err());
        assert!(!client.is_initialized());

        let sent = wait_for_sent(&handle, 4).await;
        assert!(sent.iter().any(|m| m.contains(r#""method":"shutdown""#)));
        assert!(sent.iter().any(|m| m.contains(r#""method":"exit""#)));
    }
}
