//! Per-dialect response formatting
//!
//! One formatter per API dialect, behind a shared trait. The formatter
//! decides the error envelope shape and the SSE event vocabulary; the
//! payload text itself comes from the translator.

use axum::response::sse::Event;
use driver::Dialect;
use serde_json::{Value, json};

pub trait ResponseFormat: Send + Sync {
    /// The JSON error body for a failed request.
    fn error_body(&self, status: u16, message: &str, request_id: &str) -> Value;

    /// An SSE event carrying one payload frame.
    fn data_event(&self, payload: &str) -> Event {
        Event::default().data(payload)
    }

    /// An SSE event reporting an in-stream error.
    fn error_event(&self, status: u16, message: &str, request_id: &str) -> Event {
        let body = self.error_body(status, message, request_id);
        Event::default().data(body.to_string())
    }

    /// A keepalive event for the fake-stream mode.
    fn ping_event(&self) -> Event {
        Event::default().comment("ping")
    }

    /// Events that close a stream in this dialect, in order.
    fn terminal_events(&self) -> Vec<Event> {
        Vec::new()
    }
}

pub fn formatter(dialect: Dialect) -> &'static dyn ResponseFormat {
    match dialect {
        Dialect::Native => &NativeFormat,
        Dialect::OpenAi => &OpenAiFormat,
        Dialect::Claude => &ClaudeFormat,
    }
}

struct NativeFormat;

impl ResponseFormat for NativeFormat {
    fn error_body(&self, status: u16, message: &str, request_id: &str) -> Value {
        json!({
            "error": {
                "code": status,
                "message": message,
                "request_id": request_id,
            }
        })
    }
}

struct OpenAiFormat;

impl ResponseFormat for OpenAiFormat {
    fn error_body(&self, status: u16, message: &str, _request_id: &str) -> Value {
        json!({
            "error": {
                "message": message,
                "type": openai_error_type(status),
                "code": status,
            }
        })
    }

    fn terminal_events(&self) -> Vec<Event> {
        vec![Event::default().data("[DONE]")]
    }
}

struct ClaudeFormat;

impl ResponseFormat for ClaudeFormat {
    fn error_body(&self, status: u16, message: &str, _request_id: &str) -> Value {
        json!({
            "type": "error",
            "error": {
                "type": claude_error_type(status),
                "message": message,
            }
        })
    }

    fn ping_event(&self) -> Event {
        Event::default().data(json!({"type": "ping"}).to_string())
    }

    fn terminal_events(&self) -> Vec<Event> {
        vec![Event::default().data(json!({"type": "message_stop"}).to_string())]
    }
}

fn openai_error_type(status: u16) -> &'static str {
    match status {
        400 => "invalid_request_error",
        401 | 403 => "authentication_error",
        429 => "rate_limit_error",
        _ => "api_error",
    }
}

fn claude_error_type(status: u16) -> &'static str {
    match status {
        400 => "invalid_request_error",
        401 => "authentication_error",
        403 => "permission_error",
        429 => "rate_limit_error",
        500..=599 => "api_error",
        _ => "api_error",
    }
}
