//! Document selection
//!
//! Declarative filters deciding which open documents the language server is
//! responsible for. The host editor reports every document event; only events
//! whose `(scheme, languageId)` pair matches a filter are forwarded.

/// One `(scheme, languageId)` filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentFilter {
    /// URI scheme, e.g. `file`
    pub scheme: String,
    /// Language identifier, e.g. `html`
    pub language_id: String,
}

impl DocumentFilter {
    pub fn new(scheme: impl Into<String>, language_id: impl Into<String>) -> Self {
        Self {
            scheme: scheme.into(),
            language_id: language_id.into(),
        }
    }
}

/// Immutable set of document filters.
///
/// Emptiness is legal to represent but rejected when a session is
/// constructed; a server with no routable documents is a configuration error.
#[derive(Debug, Clone)]
pub struct DocumentSelector {
    filters: Vec<DocumentFilter>,
}

impl DocumentSelector {
    pub fn new(filters: Vec<DocumentFilter>) -> Self {
        Self { filters }
    }

    /// Selector with a single filter.
    pub fn single(scheme: impl Into<String>, language_id: impl Into<String>) -> Self {
        Self::new(vec![DocumentFilter::new(scheme, language_id)])
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn filters(&self) -> &[DocumentFilter] {
        &self.filters
    }

    /// Whether any filter matches the given pair.
    pub fn matches(&self, scheme: &str, language_id: &str) -> bool {
        self.filters
            .iter()
            .any(|f| f.scheme == scheme && f.language_id == language_id)
    }

    /// Whether a document event should be routed to the server.
    pub fn matches_document(&self, document: &TextDocument) -> bool {
        self.matches(document.scheme(), &document.language_id)
    }
}

/// A document event payload as delivered by the host editor.
#[derive(Debug, Clone)]
pub struct TextDocument {
    /// Full document URI, e.g. `file:///srv/index.html`
    pub uri: String,
    /// Host-assigned language identifier
    pub language_id: String,
    /// Current full text (empty for close events)
    pub text: String,
}

impl TextDocument {
    pub fn new(
        uri: impl Into<String>,
        language_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            uri: uri.into(),
            language_id: language_id.into(),
            text: text.into(),
        }
    }

    /// URI scheme, the part before the first `:`; empty when the URI has no
    /// scheme at all.
    pub fn scheme(&self) -> &str {
        self.uri.split_once(':').map(|(s, _)| s).unwrap_or("")
    }
}

// ============================================================================
// Tests
// ============================================================================
