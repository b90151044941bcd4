//! JSON-RPC 2.0 protocol layer
//!
//! Correlates requests with responses by id, dispatches server notifications
//! to an installed handler, and keeps the outbound side a single ordered
//! queue so notifications are never reordered.

use crate::io::transport::Transport;
use crate::lsp::framing::FramedTransport;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, oneshot};
use tracing::{debug, error, trace};

/// Default timeout for requests that do not specify one.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// Wire Types
// ============================================================================

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Value,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcErrorObject>,
}

/// JSON-RPC 2.0 notification (no response expected)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// JSON-RPC error object
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

const METHOD_NOT_FOUND: i32 = -32601;

// ============================================================================
// Errors
// ============================================================================

/// JSON-RPC client errors
#[derive(Debug, thiserror::Error)]
pub enum JsonRpcError {
    #[error("server error ({code}): {message}")]
    Server { code: i32, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(#[source] serde_json::Error),

    #[error("deserialization error: {0}")]
    Deserialization(#[source] serde_json::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request was cancelled")]
    Cancelled,

    #[error("missing result in response")]
    MissingResult,
}

// ============================================================================
// Client
// ============================================================================

type NotificationHandler = Arc<dyn Fn(JsonRpcNotification) + Send + Sync>;
type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

/// JSON-RPC client over a framed transport.
///
/// A single background task owns the transport and multiplexes the ordered
/// outbound queue against inbound traffic; responses are routed back to the
/// awaiting request by id.
pub struct JsonRpcClient<T: Transport> {
    outbound: mpsc::UnboundedSender<String>,
    next_id: AtomicU64,
    pending: PendingMap,
    notification_handler: Arc<Mutex<Option<NotificationHandler>>>,
    _marker: std::marker::PhantomData<T>,
}

impl<T: Transport + 'static> JsonRpcClient<T> {
    /// Wrap a transport in framing and start the multiplexing task.
    pub fn new(transport: T) -> Self {
        let framed = Arc::new(Mutex::new(FramedTransport::new(transport)));
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let notification_handler = Arc::new(Mutex::new(None::<NotificationHandler>));

        let task_transport = Arc::clone(&framed);
        let task_pending = Arc::clone(&pending);
        let task_handler = Arc::clone(&notification_handler);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outgoing = outbound_rx.recv() => {
                        let Some(message) = outgoing else { break };
                        let mut transport = task_transport.lock().await;
                        if let Err(e) = transport.send(&message).await {
                            error!("json-rpc: send failed: {}", e);
                            break;
                        }
                    }
                    incoming = async {
                        let mut transport = task_transport.lock().await;
                        transport.receive().await
                    } => {
                        match incoming {
                            Ok(message) => {
                                let handler = task_handler.lock().await.clone();
                                if let Some(reply) =
                                    Self::dispatch_inbound(message, &task_pending, handler.as_ref())
                                        .await
                                {
                                    let mut transport = task_transport.lock().await;
                                    if let Err(e) = transport.send(&reply).await {
                                        error!("json-rpc: reply failed: {}", e);
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                debug!("json-rpc: receive failed, channel closed: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
            // Wake every awaiting request with a cancellation.
            task_pending.lock().await.clear();
            trace!("json-rpc: transport task finished");
        });

        Self {
            outbound,
            next_id: AtomicU64::new(1),
            pending,
            notification_handler,
            _marker: std::marker::PhantomData,
        }
    }

    /// Install a handler for server-initiated notifications.
    pub async fn on_notification<F>(&self, handler: F)
    where
        F: Fn(JsonRpcNotification) + Send + Sync + 'static,
    {
        *self.notification_handler.lock().await = Some(Arc::new(handler));
    }

    /// Classify one inbound payload; returns an outbound reply for
    /// server-initiated requests.
    async fn dispatch_inbound(
        message: String,
        pending: &PendingMap,
        handler: Option<&NotificationHandler>,
    ) -> Option<String> {
        trace!("json-rpc: inbound: {}", message);

        let Ok(value) = serde_json::from_str::<Value>(&message) else {
            debug!("json-rpc: discarding unparseable message: {}", message);
            return None;
        };

        let has_id = value.get("id").is_some();
        let has_method = value.get("method").is_some();

        if has_id && !has_method {
            if let Ok(response) = serde_json::from_value::<JsonRpcResponse>(value) {
                if let Some(id) = response.id.as_u64() {
                    if let Some(waiter) = pending.lock().await.remove(&id) {
                        if waiter.send(response).is_err() {
                            debug!("json-rpc: waiter for request {} is gone", id);
                        }
                    } else {
                        debug!("json-rpc: response for unknown request {}", id);
                    }
                }
            }
            return None;
        }

        if has_id && has_method {
            // Server-initiated request. Nothing is advertised in our
            // capabilities, so answer with method-not-found rather than
            // leaving the server waiting.
            let request: JsonRpcRequest = serde_json::from_value(value).ok()?;
            debug!("json-rpc: rejecting server request {}", request.method);
            let reply = JsonRpcResponse {
                jsonrpc: "2.0".to_string(),
                id: request.id,
                result: None,
                error: Some(JsonRpcErrorObject {
                    code: METHOD_NOT_FOUND,
                    message: format!("method not found: {}", request.method),
                    data: None,
                }),
            };
            return serde_json::to_string(&reply).ok();
        }

        if let Ok(notification) = serde_json::from_value::<JsonRpcNotification>(value) {
            trace!("json-rpc: notification {}", notification.method);
            if let Some(handler) = handler {
                handler(notification);
            }
        }
        None
    }

    /// Send a request and await its response with the default timeout.
    pub async fn request<P, R>(&self, method: &str, params: Option<P>) -> Result<R, JsonRpcError>
    where
        P: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        self.request_with_timeout(
            method,
            params,
            Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
        )
        .await
    }

    /// Send a request and await its response, bounded by `timeout`.
    pub async fn request_with_timeout<P, R>(
        &self,
        method: &str,
        params: Option<P>,
        timeout: Duration,
    ) -> Result<R, JsonRpcError>
    where
        P: Serialize,
        R: for<'de> Deserialize<'de>,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let request = JsonRpcRequest {
            jsonrpc: "2.0".to_string(),
            id: Value::from(id),
            method: method.to_string(),
            params: params
                .map(|p| serde_json::to_value(p).map_err(JsonRpcError::Serialization))
                .transpose()?,
        };
        let payload = serde_json::to_string(&request).map_err(JsonRpcError::Serialization)?;
        debug!("json-rpc: request {} -> {}", id, method);

        if self.outbound.send(payload).is_err() {
            self.pending.lock().await.remove(&id);
            return Err(JsonRpcError::Transport(
                "outbound channel closed".to_string(),
            ));
        }

        let response = match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return Err(JsonRpcError::Cancelled),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                return Err(JsonRpcError::Timeout(timeout));
            }
        };

        if let Some(error) = response.error {
            return Err(JsonRpcError::Server {
                code: error.code,
                message: error.message,
            });
        }

        match response.result {
            Some(result) => serde_json::from_value(result).map_err(JsonRpcError::Deserialization),
            None => Err(JsonRpcError::MissingResult),
        }
    }

    /// Send a fire-and-forget notification.
    ///
    /// Notifications share the ordered outbound queue with requests, so they
    /// reach the wire in exactly the order they were submitted.
    pub fn notify<P>(&self, method: &str, params: Option<P>) -> Result<(), JsonRpcError>
    where
        P: Serialize,
    {
        let notification = JsonRpcNotification {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params: params
                .map(|p| serde_json::to_value(p).map_err(JsonRpcError::Serialization))
                .transpose()?,
        };
        let payload = serde_json::to_string(&notification).map_err(JsonRpcError::Serialization)?;
        debug!("json-rpc: notify {}", method);

        self.outbound
            .send(payload)
            .map_err(|_| JsonRpcError::Transport("outbound channel closed".to_string()))
    }

    /// Whether the multiplexing task is still accepting traffic.
    pub fn is_connected(&self) -> bool {
        !self.outbound.is_closed()
    }

    /// Drop every pending request; their waiters observe a cancellation.
    pub async fn close(&self) {
        self.pending.lock().await.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::transport::MockTransport;
    use std::sync::Mutex as StdMutex;

    fn frame(payload: &str) -> String {
        format!("Content-Length: {}\r\n\r\n{}", payload.len(), payload)
    }

    #[tokio::test]
    async fn test_request_response_correlation() {
        let transport = MockTransport::new();
        let handle = transport.handle();
        let client = JsonRpcClient::new(transport);

        handle.push_inbound(frame(r#"{"jsonrpc":"2.0","id":1,"result":{"ok":true}}"#));

        let result: Value = client.request("test/echo", Some(Value::Null)).await.unwrap();
        assert_eq!(result, serde_json::json!({"ok": true}));

        let sent = handle.sent_messages();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains(r#""method":"test/echo""#));
    }

    #[tokio::test]
    async fn test_server_error_is_surfaced() {
        let transport = MockTransport::new();
        let handle = transport.handle();
        let client = JsonRpcClient::new(transport);

        handle.push_inbound(frame(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32600,"message":"bad"}}"#,
        ));

        let result: Result<Value, _> = client.request("test/fail", None::<Value>).await;
        assert!(matches!(
            result,
            Err(JsonRpcError::Server { code: -32600, .. })
        ));
    }

    #[tokio::test]
    async fn test_request_timeout() {
        let transport = MockTransport::new();
        let client = JsonRpcClient::new(transport);

        let result: Result<Value, _> = client
            .request_with_timeout("test/slow", None::<Value>, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(JsonRpcError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_notifications_keep_submission_order() {
        let transport = MockTransport::new();
        let handle = transport.handle();
        let client = JsonRpcClient::new(transport);

        for i in 0..5 {
            client
                .notify(&format!("test/n{i}"), None::<Value>)
                .unwrap();
        }

        // The background task needs a moment to drain the queue.
        for _ in 0..100 {
            if handle.sent_messages().len() == 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let sent = handle.sent_messages();
        assert_eq!(sent.len(), 5);
        for (i, message) in sent.iter().enumerate() {
            assert!(message.contains(&format!("test/n{i}")));
        }
    }

    #[tokio::test]
    async fn test_server_notification_reaches_handler() {
        let transport = MockTransport::new();
        let handle = transport.handle();
        let client = JsonRpcClient::new(transport);

        let seen = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        client
            .on_notification(move |n| {
                seen_clone.lock().unwrap().push(n.method);
            })
            .await;

        handle.push_inbound(frame(
            r#"{"jsonrpc":"2.0","method":"window/logMessage","params":{"type":3,"message":"hi"}}"#,
        ));

        for _ in 0..100 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*seen.lock().unwrap(), vec!["window/logMessage"]);
    }

    #[tokio::test]
    async fn test_server_request_gets_method_not_found() {
        let transport = MockTransport::new();
        let handle = transport.handle();
        let _client = JsonRpcClient::new(transport);

        handle.push_inbound(frame(
            r#"{"jsonrpc":"2.0","id":7,"method":"workspace/configuration","params":{}}"#,
        ));

        for _ in 0..100 {
            if !handle.sent_messages().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let sent = handle.sent_messages();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("-32601"));
        assert!(sent[0].contains(r#""id":7"#));
    }
}
