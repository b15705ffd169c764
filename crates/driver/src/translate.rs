//! Format translation seam
//!
//! The gateway never interprets payload semantics itself. Whole-body and
//! incremental translation between the three inbound dialects and the
//! native backend form is delegated through this trait. Translators are
//! stateless per call; incremental translation threads an explicit
//! per-response state object across successive chunk calls.

use serde_json::Value;

/// The three inbound API families.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Native,
    OpenAi,
    Claude,
}

impl Dialect {
    /// Label for logging and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Dialect::Native => "native",
            Dialect::OpenAi => "openai",
            Dialect::Claude => "claude",
        }
    }
}

/// Per-response translation state, created at stream start and threaded
/// across successive `chunk_from_native` calls.
#[derive(Debug, Default)]
pub struct TranslateState {
    /// Chunks translated so far in this response.
    pub chunks_seen: u64,
    /// Translator-private scratch space.
    pub scratch: Value,
}

/// Errors from translation.
#[derive(Debug, thiserror::Error)]
pub enum TranslateError {
    #[error("untranslatable request body: {0}")]
    Request(String),

    #[error("untranslatable response body: {0}")]
    Response(String),
}

/// Result alias for translation operations.
pub type TranslateResult<T> = std::result::Result<T, TranslateError>;

/// Translation between dialect bodies and the native backend form.
pub trait FormatTranslator: Send + Sync {
    /// Identifier for logging (e.g. "passthrough")
    fn id(&self) -> &str;

    /// Translate a whole inbound `dialect` body into the native request form.
    fn request_to_native(&self, dialect: Dialect, body: &Value) -> TranslateResult<Value>;

    /// Translate a whole buffered native response into `dialect`'s
    /// response form.
    fn response_from_native(&self, dialect: Dialect, body: &Value) -> TranslateResult<Value>;

    /// Translate one native chunk into zero or more `dialect` stream
    /// frames (serialized JSON, one per SSE data line).
    fn chunk_from_native(
        &self,
        dialect: Dialect,
        state: &mut TranslateState,
        chunk: &str,
    ) -> TranslateResult<Vec<String>>;

    /// Split a buffered native response into pseudo-stream segments: an
    /// optional thought/reasoning frame followed by the content frame,
    /// in that order.
    fn pseudo_stream_segments(&self, dialect: Dialect, body: &Value)
    -> TranslateResult<Vec<String>>;
}
