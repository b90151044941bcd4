//! htmx-lsp-client - editor-side client for the `trunkls` htmx language server
//!
//! A hosting environment (editor or plugin shim) embeds this crate to run the
//! htmx/HTML language server as a child process and keep it fed with document
//! events:
//!
//! - [`launch`] resolves how the server binary is spawned per activation mode
//! - [`selector`] decides which documents the server is responsible for
//! - [`session`] owns the process and channel and enforces the lifecycle
//! - [`bootstrap`] assembles and starts a session on activation
//!
//! Underneath, [`io`] handles the child process and its stdio pipes, and
//! [`lsp`] layers `Content-Length` framing, JSON-RPC 2.0, and a typed
//! `lsp-types` client on top.
//!
//! Typical activation:
//!
//! ```no_run
//! use htmx_lsp_client::bootstrap::{ActivationContext, activate};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let mut session = activate(ActivationContext::default()).await?;
//! // ... route document events through the session ...
//! session.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod io;
pub mod launch;
pub mod logging;
pub mod lsp;
pub mod selector;
pub mod session;
pub mod testing;

pub use bootstrap::{ActivationContext, CLIENT_DISPLAY_NAME, CLIENT_ID, activate};
pub use launch::{LaunchConfig, LaunchMode, LaunchOptions, ServerLocation};
pub use selector::{DocumentFilter, DocumentSelector, TextDocument};
pub use session::{
    ClientError, ClientIdentity, ClientSession, SessionConfig, SessionState,
};
