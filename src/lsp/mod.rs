//! LSP layer - layered Language Server Protocol client
//!
//! - **Framing**: `Content-Length` message framing over any transport
//! - **Protocol**: JSON-RPC 2.0 with id-correlated requests
//! - **Client**: typed API over `lsp-types`

pub mod client;
pub mod framing;
pub mod protocol;

pub use client::{LspClient, LspError};
pub use framing::{FramedTransport, FramingError};
pub use protocol::{JsonRpcClient, JsonRpcError, JsonRpcNotification};
