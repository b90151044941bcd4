//! Activation bootstrap
//!
//! The glue a hosting environment calls on activation: assemble the client's
//! identity, launch options, and document selector, build a session, and
//! start it eagerly so the server is up before the first document event.

use crate::launch::{LaunchMode, ServerLocation};
use crate::selector::DocumentSelector;
use crate::session::{ClientError, ClientIdentity, ClientSession, SessionConfig};
use tracing::info;

/// Settings-scope identifier for the client.
pub const CLIENT_ID: &str = "htmx-lsp";

/// Human-readable client name, reported to the server and shown in host UI.
pub const CLIENT_DISPLAY_NAME: &str = "Htmx Language Server";

/// Everything activation needs to build a session.
///
/// Defaults reproduce the stock setup: run the installed `trunkls` over HTML
/// files on disk. Hosts override fields for custom install locations or
/// debugging.
#[derive(Debug, Clone)]
pub struct ActivationContext {
    pub mode: LaunchMode,
    pub location: ServerLocation,
    pub identity: ClientIdentity,
    pub selector: DocumentSelector,
    pub session: SessionConfig,
}

impl Default for ActivationContext {
    fn default() -> Self {
        Self {
            mode: LaunchMode::Run,
            location: ServerLocation::default(),
            identity: ClientIdentity::new(CLIENT_ID, CLIENT_DISPLAY_NAME),
            selector: DocumentSelector::single("file", "html"),
            session: SessionConfig::default(),
        }
    }
}

impl ActivationContext {
    /// Stock context for the given launch mode.
    pub fn for_mode(mode: LaunchMode) -> Self {
        Self {
            mode,
            ..Self::default()
        }
    }
}

/// Activate the client: build a session and start the language server.
///
/// Returns the running session; the caller keeps it alive for the rest of the
/// host's lifetime and calls [`ClientSession::stop`] (or drops it) on
/// deactivation. Errors leave no process behind.
pub async fn activate(context: ActivationContext) -> Result<ClientSession, ClientError> {
    info!(
        client = %context.identity.id,
        mode = ?context.mode,
        "activating htmx language client"
    );

    let mut session = ClientSession::new(
        context.identity,
        context.location.launch_options(),
        context.mode,
        context.selector,
        context.session,
    )?;
    session.start().await?;
    Ok(session)
}

// ============================================================================
// Tests
// ============================================================================
