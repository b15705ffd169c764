//! Passthrough translator — structural, no payload interpretation.
//!
//! Ships as the default `FormatTranslator`: bodies cross the seam intact
//! apart from the structural minimum the gateway needs (stripping the
//! `stream` delivery flag on the way in, wrapping non-JSON chunk text,
//! and splitting thought/content segments for pseudo-streaming). Real
//! dialect translation plugs in behind the same trait.

use crate::{Dialect, FormatTranslator, TranslateResult, TranslateState};
use serde_json::{Value, json};

/// Keys that may carry a reasoning segment in a buffered native response.
const THOUGHT_KEYS: &[&str] = &["thought", "reasoning"];

/// Structural passthrough translator.
#[derive(Debug, Default)]
pub struct PassthroughTranslator;

impl PassthroughTranslator {
    pub fn new() -> Self {
        Self
    }
}

impl FormatTranslator for PassthroughTranslator {
    fn id(&self) -> &str {
        "passthrough"
    }

    fn request_to_native(&self, _dialect: Dialect, body: &Value) -> TranslateResult<Value> {
        // The stream flag selects the delivery mode at the HTTP layer; it
        // is not part of the backend request.
        let mut native = body.clone();
        if let Some(obj) = native.as_object_mut() {
            obj.remove("stream");
        }
        Ok(native)
    }

    fn response_from_native(&self, _dialect: Dialect, body: &Value) -> TranslateResult<Value> {
        Ok(body.clone())
    }

    fn chunk_from_native(
        &self,
        _dialect: Dialect,
        state: &mut TranslateState,
        chunk: &str,
    ) -> TranslateResult<Vec<String>> {
        state.chunks_seen += 1;
        // Forward valid JSON verbatim; wrap bare text so every frame on
        // the wire is a JSON document.
        let frame = match serde_json::from_str::<Value>(chunk) {
            Ok(_) => chunk.to_string(),
            Err(_) => json!({ "content": chunk }).to_string(),
        };
        Ok(vec![frame])
    }

    fn pseudo_stream_segments(
        &self,
        _dialect: Dialect,
        body: &Value,
    ) -> TranslateResult<Vec<String>> {
        let Some(obj) = body.as_object() else {
            return Ok(vec![body.to_string()]);
        };

        let thought = THOUGHT_KEYS
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_str).map(|s| (*k, s)))
            .filter(|(_, s)| !s.is_empty());

        match thought {
            Some((key, text)) => {
                let mut content = obj.clone();
                content.remove(key);
                Ok(vec![
                    json!({ "thought": text }).to_string(),
                    Value::Object(content).to_string(),
                ])
            }
            None => Ok(vec![body.to_string()]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_strips_stream_flag() {
        let t = PassthroughTranslator::new();
        let body = json!({"prompt": "hi", "stream": true});
        let native = t.request_to_native(Dialect::OpenAi, &body).unwrap();
        assert!(native.get("stream").is_none());
        assert_eq!(native["prompt"], "hi");
    }

    #[test]
    fn response_passes_through() {
        let t = PassthroughTranslator::new();
        let body = json!({"content": "done"});
        assert_eq!(
            t.response_from_native(Dialect::Claude, &body).unwrap(),
            body
        );
    }

    #[test]
    fn chunk_counts_state_and_passes_json_verbatim() {
        let t = PassthroughTranslator::new();
        let mut state = TranslateState::default();
        let frames = t
            .chunk_from_native(Dialect::Native, &mut state, r#"{"delta":"a"}"#)
            .unwrap();
        assert_eq!(frames, vec![r#"{"delta":"a"}"#.to_string()]);
        assert_eq!(state.chunks_seen, 1);
    }

    #[test]
    fn chunk_wraps_bare_text_as_json() {
        let t = PassthroughTranslator::new();
        let mut state = TranslateState::default();
        let frames = t
            .chunk_from_native(Dialect::Native, &mut state, "plain words")
            .unwrap();
        assert_eq!(frames.len(), 1);
        let v: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(v["content"], "plain words");
    }

    #[test]
    fn pseudo_stream_emits_thought_before_content() {
        let t = PassthroughTranslator::new();
        let body = json!({"thought": "let me think", "content": "answer"});
        let frames = t.pseudo_stream_segments(Dialect::OpenAi, &body).unwrap();
        assert_eq!(frames.len(), 2);
        let first: Value = serde_json::from_str(&frames[0]).unwrap();
        let second: Value = serde_json::from_str(&frames[1]).unwrap();
        assert_eq!(first["thought"], "let me think");
        assert_eq!(second["content"], "answer");
        assert!(second.get("thought").is_none());
    }

    #[test]
    fn pseudo_stream_single_frame_without_thought() {
        let t = PassthroughTranslator::new();
        let body = json!({"content": "answer"});
        let frames = t.pseudo_stream_segments(Dialect::Native, &body).unwrap();
        assert_eq!(frames, vec![body.to_string()]);
    }

    #[test]
    fn pseudo_stream_empty_thought_is_ignored() {
        let t = PassthroughTranslator::new();
        let body = json!({"reasoning": "", "content": "answer"});
        let frames = t.pseudo_stream_segments(Dialect::Native, &body).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn pseudo_stream_non_object_passes_through() {
        let t = PassthroughTranslator::new();
        let body = json!("just a string");
        let frames = t.pseudo_stream_segments(Dialect::Native, &body).unwrap();
        assert_eq!(frames, vec![r#""just a string""#.to_string()]);
    }
}
