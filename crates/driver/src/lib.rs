//! Collaborator contracts for the session-channel gateway
//!
//! Defines the `SessionDriver` trait that decouples the gateway from the
//! mechanism producing session channels (browser automation lives behind
//! it), the `FormatTranslator` trait for wire-format translation, the
//! channel wire envelope, and the failure taxonomy that drives retry and
//! rotation decisions.

pub mod event;
mod passthrough;
mod translate;

pub use event::{ChannelEvent, ControlEvent};
pub use passthrough::PassthroughTranslator;
pub use translate::{Dialect, FormatTranslator, TranslateError, TranslateResult, TranslateState};

use common::Secret;
use std::future::Future;
use std::pin::Pin;

/// Classification of a terminal request failure.
///
/// The taxonomy is a typed discriminant: the conditions that bypass
/// failure accounting and rotation are enumerated here, never inferred
/// from error-message text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Channel lost or closed mid-request. Maps to 503; never counts
    /// toward failure statistics, never triggers rotation.
    Transport,
    /// The remote call returned an error payload.
    Backend { status: u16 },
    /// No message arrived within the wait window.
    Timeout,
    /// The client closed its connection before completion. Excluded from
    /// failure statistics.
    Cancelled,
}

impl FailureKind {
    /// Whether this failure counts toward the rotation failure threshold.
    pub fn counts_toward_failures(&self) -> bool {
        matches!(self, FailureKind::Backend { .. } | FailureKind::Timeout)
    }
}

/// Credentials for one account, as handed out by the Session Driver.
/// The token is redacted in logs and wiped on drop.
pub struct Credentials {
    pub account_id: String,
    pub token: Secret<String>,
}

/// Errors from Session Driver operations.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("session activation failed: {0}")]
    Activation(String),

    #[error("no session channel for account index {0}")]
    NoChannel(usize),

    #[error("internal driver error: {0}")]
    Internal(String),
}

/// Result alias for driver operations.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Abstraction over the mechanism that brings backend sessions online.
///
/// The gateway delegates all session lifecycle concerns to the driver:
/// - `launch_or_switch_context` activates the session for an account index
/// - `save_context_state` persists an outgoing session before rotation
/// - `rotation_candidates` enumerates the currently valid account indices
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn SessionDriver>`).
pub trait SessionDriver: Send + Sync {
    /// Identifier for logging and health reporting (e.g. "channel")
    fn id(&self) -> &str;

    /// Activate the session for `index`, switching away from whatever
    /// session is currently live. The caller is responsible for waiting
    /// until the session's channel reaches the open state.
    fn launch_or_switch_context(
        &self,
        index: usize,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Tear down the session for `index`.
    fn close_context(&self, index: usize) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Persist the state of an outgoing session before a switch. Best
    /// effort: rotation proceeds even if this fails.
    fn save_context_state(
        &self,
        index: usize,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Credentials for `index`, or None if the account has none configured.
    fn get_auth(
        &self,
        index: usize,
    ) -> Pin<Box<dyn Future<Output = Option<Credentials>> + Send + '_>>;

    /// Account indices currently valid as rotation targets, in rotation
    /// order. Indices marked invalid by the driver are absent.
    fn rotation_candidates(&self) -> Vec<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_and_cancelled_are_excluded_from_failure_accounting() {
        assert!(!FailureKind::Transport.counts_toward_failures());
        assert!(!FailureKind::Cancelled.counts_toward_failures());
    }

    #[test]
    fn backend_and_timeout_count_toward_failures() {
        assert!(FailureKind::Backend { status: 500 }.counts_toward_failures());
        assert!(FailureKind::Timeout.counts_toward_failures());
    }

    #[test]
    fn driver_error_display_is_descriptive() {
        assert!(
            DriverError::NoChannel(3)
                .to_string()
                .contains("account index 3")
        );
        assert!(
            DriverError::Activation("page crashed".into())
                .to_string()
                .contains("page crashed")
        );
    }

    #[test]
    fn credentials_token_is_redacted() {
        let creds = Credentials {
            account_id: "acct-1".into(),
            token: Secret::new("cookie-value".into()),
        };
        assert_eq!(format!("{:?}", creds.token), "[REDACTED]");
        assert_eq!(creds.account_id, "acct-1");
    }
}
