//! Channel wire envelope
//!
//! One JSON text frame per send in both directions. Outbound control
//! events are tagged by `event_type`. Inbound frames use the same tag,
//! with one exception: the end-of-response sentinel arrives from legacy
//! peers as `{"type":"STREAM_END"}`, so parsing checks both keys.

use serde::Serialize;
use serde_json::Value;

/// Outbound control event sent to the Session Driver's channel.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ControlEvent {
    /// Dispatch one normalized request to the backend session.
    ProxyRequest {
        request_id: String,
        method: String,
        path: String,
        headers: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        query: Option<String>,
        body: Value,
        is_generative: bool,
        streaming: bool,
    },
    /// Best-effort notification that the client abandoned a request.
    CancelRequest { request_id: String },
    /// Out-of-band verbosity change, broadcast to every open channel.
    SetLogLevel { level: String },
    /// Activation signal: the automation peer should bring the session
    /// for this account index online.
    SwitchAccount { index: usize },
    /// Tear-down signal for the session of this account index.
    CloseContext { index: usize },
}

/// Inbound frame from a session channel, demultiplexed by request id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Chunk { request_id: String, data: String },
    Error {
        request_id: String,
        status: u16,
        message: String,
    },
    Timeout { request_id: String },
    StreamEnd { request_id: String },
}

impl ChannelEvent {
    /// Parse one inbound text frame. Returns None for frames this layer
    /// does not understand; the channel listener logs and drops those.
    pub fn parse(text: &str) -> Option<Self> {
        let v: Value = serde_json::from_str(text).ok()?;

        // Legacy end sentinel uses "type" instead of "event_type".
        if v.get("type").and_then(Value::as_str) == Some("STREAM_END") {
            return Some(ChannelEvent::StreamEnd {
                request_id: v.get("request_id")?.as_str()?.to_string(),
            });
        }

        let request_id = v.get("request_id")?.as_str()?.to_string();
        match v.get("event_type")?.as_str()? {
            "chunk" => Some(ChannelEvent::Chunk {
                request_id,
                data: match v.get("data") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                },
            }),
            "error" => Some(ChannelEvent::Error {
                request_id,
                status: v
                    .get("status")
                    .and_then(Value::as_u64)
                    .and_then(|s| u16::try_from(s).ok())
                    .unwrap_or(500),
                message: v
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("backend error")
                    .to_string(),
            }),
            "timeout" => Some(ChannelEvent::Timeout { request_id }),
            _ => None,
        }
    }

    /// The request id this frame belongs to.
    pub fn request_id(&self) -> &str {
        match self {
            ChannelEvent::Chunk { request_id, .. }
            | ChannelEvent::Error { request_id, .. }
            | ChannelEvent::Timeout { request_id }
            | ChannelEvent::StreamEnd { request_id } => request_id,
        }
    }
}
