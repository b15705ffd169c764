//! Gateway request error taxonomy
//!
//! Every terminal request failure is one of these variants. The variant
//! decides both the HTTP status returned to the client and whether the
//! failure counts toward account rotation.

use driver::FailureKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    /// The channel to the session dropped or was unusable. Not the
    /// account's fault.
    #[error("session channel unavailable")]
    Transport,

    /// The backend reported an error frame for this request.
    #[error("backend error {status}: {message}")]
    Backend { status: u16, message: String },

    /// No response arrived within the configured window.
    #[error("timed out waiting for backend response")]
    Timeout,

    /// The client went away before the response completed.
    #[error("request cancelled by client")]
    Cancelled,

    /// Readiness and recovery were exhausted without a usable session.
    #[error("no usable session: {0}")]
    RecoveryExhausted(String),

    /// The client request could not be translated or was malformed.
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl GatewayError {
    /// HTTP status returned to the client.
    pub fn status(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::Transport | Self::RecoveryExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Backend { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Self::Timeout => StatusCode::GATEWAY_TIMEOUT,
            // 499: client closed request. Not in the StatusCode
            // constants, so built from the raw code.
            Self::Cancelled => {
                StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
            }
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// How this failure counts for rotation statistics.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Transport | Self::RecoveryExhausted(_) => FailureKind::Transport,
            Self::Backend { status, .. } => FailureKind::Backend { status: *status },
            Self::Timeout => FailureKind::Timeout,
            Self::Cancelled => FailureKind::Cancelled,
            // A request rejected before dispatch never reached the
            // account.
            Self::BadRequest(_) => FailureKind::Cancelled,
        }
    }

    /// Human message for the client-facing error body.
    pub fn public_message(&self) -> String {
        match self {
            Self::Backend { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}
