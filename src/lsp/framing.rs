//! LSP message framing
//!
//! Wraps a raw [`Transport`] with the `Content-Length` header framing the
//! Language Server Protocol mandates:
//!
//! `Content-Length: <bytes>\r\n\r\n<payload>`

use crate::io::transport::Transport;
use async_trait::async_trait;

/// Upper bound on a single framed message, to catch a corrupt header before
/// it turns into an unbounded allocation.
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Error types for LSP framing
#[derive(Debug, thiserror::Error)]
pub enum FramingError<T: std::error::Error + Send + Sync + 'static> {
    #[error("transport error: {0}")]
    Transport(#[source] T),

    #[error("malformed LSP header: {0}")]
    InvalidHeader(String),

    #[error("message of {size} bytes exceeds limit of {max}")]
    MessageTooLarge { size: usize, max: usize },
}

/// Content-Length framing over any transport.
///
/// Outbound messages are wrapped in a header; inbound bytes are buffered
/// until a complete payload is available, so messages split or coalesced by
/// the pipe are reassembled correctly.
pub struct FramedTransport<T: Transport> {
    transport: T,
    buffer: Vec<u8>,
}

impl<T: Transport> FramedTransport<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            buffer: Vec::new(),
        }
    }

    /// Frame a payload for the wire.
    fn encode(payload: &str) -> String {
        format!("Content-Length: {}\r\n\r\n{}", payload.len(), payload)
    }

    /// Try to pull one complete payload out of the buffer.
    fn try_extract(&mut self) -> Result<Option<String>, FramingError<T::Error>> {
        let Some(header_end) = self
            .buffer
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
        else {
            return Ok(None);
        };

        let header = String::from_utf8_lossy(&self.buffer[..header_end]).into_owned();
        let content_length = Self::parse_content_length(&header)?;
        if content_length > MAX_MESSAGE_SIZE {
            return Err(FramingError::MessageTooLarge {
                size: content_length,
                max: MAX_MESSAGE_SIZE,
            });
        }

        let content_start = header_end + 4;
        if self.buffer.len() < content_start + content_length {
            return Ok(None);
        }

        let payload =
            String::from_utf8_lossy(&self.buffer[content_start..content_start + content_length])
                .into_owned();
        self.buffer.drain(..content_start + content_length);
        Ok(Some(payload))
    }

    fn parse_content_length(header: &str) -> Result<usize, FramingError<T::Error>> {
        for line in header.lines() {
            if let Some((name, value)) = line.split_once(':') {
                if name.trim().eq_ignore_ascii_case("content-length") {
                    return value.trim().parse().map_err(|_| {
                        FramingError::InvalidHeader(format!(
                            "unparseable Content-Length value: {}",
                            value.trim()
                        ))
                    });
                }
            }
        }
        Err(FramingError::InvalidHeader(format!(
            "no Content-Length header in: {header:?}"
        )))
    }
}

#[async_trait]
impl<T: Transport> Transport for FramedTransport<T> {
    type Error = FramingError<T::Error>;

    async fn send(&mut self, message: &str) -> Result<(), Self::Error> {
        self.transport
            .send(&Self::encode(message))
            .await
            .map_err(FramingError::Transport)
    }

    async fn receive(&mut self) -> Result<String, Self::Error> {
        loop {
            if let Some(payload) = self.try_extract()? {
                return Ok(payload);
            }
            let chunk = self
                .transport
                .receive()
                .await
                .map_err(FramingError::Transport)?;
            self.buffer.extend_from_slice(chunk.as_bytes());
        }
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.transport.close().await.map_err(FramingError::Transport)
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::transport::MockTransport;

    fn framed(payload: &str) -> String {
        format!("Content-Length: {}\r\n\r\n{}", payload.len(), payload)
    }

    #[tokio::test]
    async fn test_send_adds_content_length_header() {
        let transport = MockTransport::new();
        let handle = transport.handle();
        let mut framing = FramedTransport::new(transport);

        framing.send(r#"{"id":1}"#).await.unwrap();

        let sent = handle.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], "Content-Length: 8\r\n\r\n{\"id\":1}");
    }

    #[tokio::test]
    async fn test_receive_reassembles_split_message() {
        let transport = MockTransport::new();
        let handle = transport.handle();
        let mut framing = FramedTransport::new(transport);

        let wire = framed(r#"{"method":"initialized"}"#);
        let (head, tail) = wire.split_at(10);
        handle.push_inbound(head);
        handle.push_inbound(tail);

        let payload = framing.receive().await.unwrap();
        assert_eq!(payload, r#"{"method":"initialized"}"#);
    }

    #[tokio::test]
    async fn test_receive_splits_coalesced_messages() {
        let transport = MockTransport::new();
        let handle = transport.handle();
        let mut framing = FramedTransport::new(transport);

        handle.push_inbound(format!("{}{}", framed("first"), framed("second")));

        assert_eq!(framing.receive().await.unwrap(), "first");
        assert_eq!(framing.receive().await.unwrap(), "second");
    }

    #[tokio::test]
    async fn test_receive_rejects_missing_header() {
        let transport = MockTransport::new();
        let handle = transport.handle();
        let mut framing = FramedTransport::new(transport);

        handle.push_inbound("Content-Type: text/plain\r\n\r\noops");

        assert!(matches!(
            framing.receive().await,
            Err(FramingError::InvalidHeader(_))
        ));
    }
}
