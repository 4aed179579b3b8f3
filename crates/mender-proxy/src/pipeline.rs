//! The per-request repair pipeline.
//!
//! Raw body -> sanitize -> normalize tool calls -> filter history -> encoded
//! body ready to forward. Every stage runs exactly once, in order.

use crate::config::Policy;
use crate::error::PipelineError;
use crate::history::{self, FilterReport};
use crate::sanitize;
use crate::translation;
use crate::types::ChatRequest;
use bytes::Bytes;
use serde_json::Value;
use std::fmt;
use tracing::{debug, warn};

/// Longest prefix of the inbound payload written to debug logs.
const DEBUG_PAYLOAD_PREVIEW: usize = 2000;

/// Lifecycle of one proxied request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Received,
    Sanitized,
    Normalized,
    Filtered,
    Forwarded,
    Streaming,
    Complete,
    Relayed,
    Errored,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Received => "received",
            Stage::Sanitized => "sanitized",
            Stage::Normalized => "normalized",
            Stage::Filtered => "filtered",
            Stage::Forwarded => "forwarded",
            Stage::Streaming => "streaming",
            Stage::Complete => "complete",
            Stage::Relayed => "relayed",
            Stage::Errored => "errored",
        };
        f.write_str(name)
    }
}

/// Tracks a request through [`Stage`]s and logs each transition.
#[derive(Debug)]
pub struct RequestTrace {
    request_id: String,
    stage: Stage,
}

impl RequestTrace {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            stage: Stage::Received,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Move forward. Backward moves and moves out of a terminal stage are
    /// ignored.
    pub fn advance(&mut self, next: Stage) {
        if self.is_terminal() || next <= self.stage {
            warn!(request_id = %self.request_id, from = %self.stage, to = %next, "ignored stage transition");
            return;
        }
        debug!(request_id = %self.request_id, from = %self.stage, to = %next, "stage");
        self.stage = next;
    }

    pub fn fail(&mut self, error: &dyn fmt::Display) {
        warn!(request_id = %self.request_id, stage = %self.stage, error = %error, "request failed");
        self.stage = Stage::Errored;
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.stage, Stage::Relayed | Stage::Errored)
    }
}

/// A repaired request ready to forward.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub body: Bytes,
    pub model: String,
    pub stream: bool,
    pub report: PipelineReport,
}

/// Counts of everything the pipeline repaired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub fields_stripped: usize,
    pub blocks_dropped: usize,
    pub messages_dropped: usize,
    pub filter: FilterReport,
}

/// Run the full pipeline on a raw request body.
pub fn prepare(
    body: &[u8],
    policy: &Policy,
    trace: &mut RequestTrace,
) -> Result<PreparedRequest, PipelineError> {
    sanitize::check_nesting(body, policy.max_depth)?;
    let mut raw: Value = serde_json::from_slice(body).map_err(PipelineError::MalformedJson)?;
    log_payload(&raw, trace);

    let fields_stripped = sanitize::sanitize(&mut raw, policy)?;
    trace.advance(Stage::Sanitized);

    let mut request = parse_envelope(raw)?;
    let original_count = request.messages.len();
    let normalized = translation::normalize_messages(std::mem::take(&mut request.messages));
    request.messages = normalized.messages;
    trace.advance(Stage::Normalized);

    let filter = history::filter_request(&mut request, &normalized.registry, policy);
    trace.advance(Stage::Filtered);

    if request.messages.len() != original_count {
        tracing::info!(
            request_id = %trace.request_id(),
            before = original_count,
            after = request.messages.len(),
            "cleaned messages"
        );
    }

    let encoded = serde_json::to_vec(&request).map_err(PipelineError::Encode)?;
    Ok(PreparedRequest {
        body: Bytes::from(encoded),
        stream: request.is_streaming(),
        model: request.model,
        report: PipelineReport {
            fields_stripped,
            blocks_dropped: normalized.dropped_blocks,
            messages_dropped: normalized.dropped_messages,
            filter,
        },
    })
}

/// Repair a body sent to a path other than chat completions.
///
/// JSON objects lose stripped fields at every depth and blocked top-level
/// parameters; messages are not reshaped, since the path may expect another
/// dialect. Empty or non-object bodies are left alone (`Ok(None)`).
pub fn prepare_other(
    body: &[u8],
    policy: &Policy,
    trace: &mut RequestTrace,
) -> Result<Option<Bytes>, PipelineError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    sanitize::check_nesting(body, policy.max_depth)?;
    let mut raw: Value = match serde_json::from_slice(body) {
        Ok(raw @ Value::Object(_)) => raw,
        _ => return Ok(None),
    };
    log_payload(&raw, trace);

    sanitize::sanitize(&mut raw, policy)?;
    trace.advance(Stage::Sanitized);
    if let Value::Object(params) = &mut raw {
        history::strip_blocked_params(params, policy);
    }
    trace.advance(Stage::Filtered);

    let encoded = serde_json::to_vec(&raw).map_err(PipelineError::Encode)?;
    Ok(Some(Bytes::from(encoded)))
}

fn log_payload(raw: &Value, trace: &RequestTrace) {
    if tracing::enabled!(tracing::Level::DEBUG) {
        let text = raw.to_string();
        let preview: String = text.chars().take(DEBUG_PAYLOAD_PREVIEW).collect();
        debug!(request_id = %trace.request_id(), payload = %preview, "incoming request");
    }
}

fn parse_envelope(raw: Value) -> Result<ChatRequest, PipelineError> {
    let Some(obj) = raw.as_object() else {
        return Err(PipelineError::NotAnObject);
    };
    if !obj.contains_key("model") {
        return Err(PipelineError::MissingField("model"));
    }
    if !obj.contains_key("messages") {
        return Err(PipelineError::MissingField("messages"));
    }
    serde_json::from_value(raw).map_err(PipelineError::InvalidEnvelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(body: &Value) -> Result<PreparedRequest, PipelineError> {
        let mut trace = RequestTrace::new("test");
        prepare(body.to_string().as_bytes(), &Policy::default(), &mut trace)
    }

    fn output(body: &Value) -> Value {
        serde_json::from_slice(&run(body).unwrap().body).unwrap()
    }

    fn cursor_request() -> Value {
        json!({
            "model": "claude-sonnet",
            "stream": true,
            "stream_options": {"include_usage": true},
            "tool_choice": {"tool": {}},
            "metadata": {"session": "abc"},
            "tools": [{"type": "function", "function": {"name": "read_file", "parameters": {}}}],
            "messages": [
                {"role": "system", "content": [
                    {"type": "text", "text": "You are helpful", "cache_control": {"type": "ephemeral"}}
                ]},
                {"role": "user", "content": "open main"},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "Opening."},
                    {"type": "tool_use", "id": "toolu_1", "name": "read_file", "input": {"path": "main.rs"}},
                    {"type": "tool_use", "id": "toolu_bad", "input": {}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "fn main() {}",
                     "cache_control": {"type": "ephemeral"}},
                    {"type": "tool_result", "tool_use_id": "toolu_9", "content": "stale"},
                    {"type": "text", "text": "thanks"}
                ]}
            ]
        })
    }

    #[test]
    fn full_pipeline_repairs_cursor_request() {
        let prepared = run(&cursor_request()).unwrap();
        assert!(prepared.stream);
        assert_eq!(prepared.model, "claude-sonnet");
        assert_eq!(prepared.report.fields_stripped, 2);
        assert_eq!(prepared.report.blocks_dropped, 1);
        assert_eq!(prepared.report.filter.orphans_dropped, vec!["toolu_9".to_string()]);

        let out: Value = serde_json::from_slice(&prepared.body).unwrap();
        assert!(out.get("tool_choice").is_none());
        assert!(out.get("stream_options").is_none());
        assert!(out.get("metadata").is_none());
        assert_eq!(out["tools"][0]["function"]["name"], "read_file");

        let roles: Vec<&str> = out["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["role"].as_str().unwrap())
            .collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "tool", "user"]);
        assert_eq!(out["messages"][2]["tool_calls"][0]["id"], "toolu_1");
        assert_eq!(out["messages"][3]["tool_call_id"], "toolu_1");
        assert_eq!(out["messages"][3]["content"], "fn main() {}");
        assert_eq!(out["messages"][4]["content"][0]["text"], "thanks");
    }

    #[test]
    fn pipeline_is_idempotent() {
        let first = run(&cursor_request()).unwrap().body;
        let reparsed: Value = serde_json::from_slice(&first).unwrap();
        let second = run(&reparsed).unwrap();
        assert_eq!(first, second.body);
        assert_eq!(second.report, PipelineReport::default());
    }

    #[test]
    fn every_forwarded_tool_response_has_an_earlier_call() {
        let out = output(&json!({
            "model": "m",
            "messages": [
                {"role": "tool", "tool_call_id": "a", "content": "early"},
                {"role": "assistant", "content": [{"type": "tool_use", "id": "a", "name": "f", "input": {}}]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "a", "content": "1"},
                    {"type": "tool_result", "tool_use_id": "b", "content": "2"}
                ]},
                {"role": "assistant", "content": [{"type": "tool_use", "id": "b", "name": "g", "input": {}}]}
            ]
        }));

        let mut seen = std::collections::HashSet::new();
        for msg in out["messages"].as_array().unwrap() {
            if let Some(calls) = msg["tool_calls"].as_array() {
                for call in calls {
                    seen.insert(call["id"].as_str().unwrap().to_string());
                }
            }
            if msg["role"] == "tool" {
                assert!(seen.contains(msg["tool_call_id"].as_str().unwrap()));
            }
        }
        assert_eq!(out["messages"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn malformed_json_is_rejected() {
        let mut trace = RequestTrace::new("t");
        let err = prepare(b"{not json", &Policy::default(), &mut trace).unwrap_err();
        assert_eq!(err.code(), "malformed_json");
    }

    #[test]
    fn missing_fields_are_rejected() {
        let err = run(&json!({"messages": []})).unwrap_err();
        assert!(matches!(err, PipelineError::MissingField("model")));

        let err = run(&json!({"model": "m"})).unwrap_err();
        assert!(matches!(err, PipelineError::MissingField("messages")));

        let err = run(&json!([1, 2])).unwrap_err();
        assert!(matches!(err, PipelineError::NotAnObject));

        let err = run(&json!({"model": "m", "messages": [{"content": "no role"}]})).unwrap_err();
        assert_eq!(err.code(), "invalid_request");
    }

    #[test]
    fn function_role_messages_are_forwarded() {
        let out = output(&json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "weather?"},
                {"role": "function", "name": "f", "content": "x"},
                {"role": "critic", "content": "fine"}
            ]
        }));
        assert_eq!(out["messages"][1], json!({"role": "function", "content": "x", "name": "f"}));
        assert_eq!(out["messages"][2]["role"], "critic");
    }

    #[test]
    fn nesting_beyond_parser_limit_is_too_deep() {
        let body = format!(
            "{{\"model\": \"m\", \"messages\": {}{}}}",
            "[".repeat(200),
            "]".repeat(200)
        );
        let mut trace = RequestTrace::new("t");
        let err = prepare(body.as_bytes(), &Policy::default(), &mut trace).unwrap_err();
        assert_eq!(err.code(), "payload_too_deep");
    }

    #[test]
    fn other_bodies_lose_annotations_and_blocked_params() {
        let body = json!({
            "model": "m",
            "tool_choice": {"tool": {}},
            "thinking": {"type": "enabled"},
            "messages": [{"role": "user", "content": [
                {"type": "text", "text": "hi", "cache_control": {"type": "ephemeral"}}
            ]}]
        });
        let mut trace = RequestTrace::new("t");
        let out = prepare_other(body.to_string().as_bytes(), &Policy::default(), &mut trace)
            .unwrap()
            .unwrap();
        let out: Value = serde_json::from_slice(&out).unwrap();

        assert!(out.get("tool_choice").is_none());
        assert!(out.get("thinking").is_none());
        assert_eq!(
            out["messages"][0]["content"][0],
            json!({"type": "text", "text": "hi"})
        );
    }

    #[test]
    fn other_bodies_that_are_not_objects_are_untouched() {
        let mut trace = RequestTrace::new("t");
        let policy = Policy::default();
        assert!(prepare_other(b"", &policy, &mut trace).unwrap().is_none());
        assert!(prepare_other(b"not json", &policy, &mut trace).unwrap().is_none());
        assert!(prepare_other(b"[1, 2]", &policy, &mut trace).unwrap().is_none());
    }

    #[test]
    fn deep_payload_is_rejected_before_parsing() {
        let mut nested = json!("leaf");
        for _ in 0..80 {
            nested = json!({ "n": nested });
        }
        let err = run(&json!({"model": "m", "messages": [], "extra": nested})).unwrap_err();
        assert!(matches!(err, PipelineError::DepthExceeded { limit: 64 }));
    }

    #[test]
    fn trace_only_moves_forward() {
        let mut trace = RequestTrace::new("t");
        trace.advance(Stage::Sanitized);
        trace.advance(Stage::Received);
        assert_eq!(trace.stage(), Stage::Sanitized);
        trace.advance(Stage::Relayed);
        assert!(trace.is_terminal());
        trace.advance(Stage::Errored);
        assert_eq!(trace.stage(), Stage::Relayed);
    }
}
