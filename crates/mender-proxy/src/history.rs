//! History consistency filter.
//!
//! The relay rejects a `role: "tool"` message unless an earlier assistant
//! message in the same request declared its call-id. Clients replaying long
//! histories routinely violate this (truncated context, dropped invocations),
//! so orphans are removed instead of failing the request.

use crate::config::Policy;
use crate::types::{CallRegistry, ChatRequest, Message, Role};
use serde_json::{Map, Value};
use tracing::debug;

/// What the filter removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterReport {
    pub orphans_dropped: Vec<String>,
    pub params_removed: Vec<String>,
}

/// Drop tool responses whose call-id was not declared by an earlier message.
/// Surviving messages keep their relative order.
pub fn drop_orphaned_tool_results(
    messages: Vec<Message>,
    registry: &CallRegistry,
) -> (Vec<Message>, Vec<String>) {
    let mut orphans = Vec::new();
    let kept = messages
        .into_iter()
        .enumerate()
        .filter_map(|(position, msg)| {
            if msg.role != Role::Tool {
                return Some(msg);
            }
            match msg.tool_call_id.as_deref() {
                Some(id) if registry.declared_before(id, position) => Some(msg),
                id => {
                    debug!(call_id = ?id, position, "dropping orphaned tool result");
                    orphans.push(id.unwrap_or_default().to_string());
                    None
                }
            }
        })
        .collect();
    (kept, orphans)
}

/// Remove the policy's blocked top-level parameters, returning their names
/// in the order they were found.
pub fn strip_blocked_params(params: &mut Map<String, Value>, policy: &Policy) -> Vec<String> {
    let removed: Vec<String> = params
        .keys()
        .filter(|k| policy.is_blocked_param(k))
        .cloned()
        .collect();
    params.retain(|k, _| !policy.is_blocked_param(k));
    for param in &removed {
        tracing::info!(param = %param, "removing parameter");
    }
    removed
}

/// Apply both filters to a normalized request.
pub fn filter_request(
    request: &mut ChatRequest,
    registry: &CallRegistry,
    policy: &Policy,
) -> FilterReport {
    let (messages, orphans_dropped) =
        drop_orphaned_tool_results(std::mem::take(&mut request.messages), registry);
    request.messages = messages;
    let params_removed = strip_blocked_params(&mut request.params, policy);
    FilterReport {
        orphans_dropped,
        params_removed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translation::normalize_messages;
    use serde_json::json;

    fn request(v: Value) -> ChatRequest {
        serde_json::from_value(v).unwrap()
    }

    fn normalize_and_filter(v: Value) -> (ChatRequest, FilterReport) {
        let mut req = request(v);
        let normalized = normalize_messages(std::mem::take(&mut req.messages));
        req.messages = normalized.messages;
        let report = filter_request(&mut req, &normalized.registry, &Policy::default());
        (req, report)
    }

    #[test]
    fn matched_result_survives() {
        let (req, report) = normalize_and_filter(json!({
            "model": "m",
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_1", "name": "ls", "input": {}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "a.rs"}
                ]}
            ]
        }));

        assert!(report.orphans_dropped.is_empty());
        assert_eq!(req.messages.len(), 2);
        assert_eq!(req.messages[1].tool_call_id.as_deref(), Some("toolu_1"));
    }

    #[test]
    fn orphan_result_is_removed() {
        let (req, report) = normalize_and_filter(json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "hi"},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_9", "content": "stale"}
                ]},
                {"role": "assistant", "content": "ok"}
            ]
        }));

        assert_eq!(report.orphans_dropped, vec!["toolu_9".to_string()]);
        let roles: Vec<Role> = req.messages.iter().map(|m| m.role.clone()).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant]);
    }

    #[test]
    fn forward_reference_is_an_orphan() {
        let (req, report) = normalize_and_filter(json!({
            "model": "m",
            "messages": [
                {"role": "tool", "tool_call_id": "call_1", "content": "too early"},
                {"role": "assistant", "content": null, "tool_calls": [
                    {"id": "call_1", "type": "function", "function": {"name": "f", "arguments": "{}"}}
                ]}
            ]
        }));

        assert_eq!(report.orphans_dropped, vec!["call_1".to_string()]);
        assert_eq!(req.messages.len(), 1);
        assert_eq!(req.messages[0].role, Role::Assistant);
    }

    #[test]
    fn tool_message_without_id_is_dropped() {
        let (req, _) = normalize_and_filter(json!({
            "model": "m",
            "messages": [{"role": "tool", "content": "who am I"}]
        }));
        assert!(req.messages.is_empty());
    }

    #[test]
    fn blocked_params_are_removed_but_tools_stay() {
        let (req, report) = normalize_and_filter(json!({
            "model": "m",
            "messages": [],
            "tools": [{"type": "function", "function": {"name": "f"}}],
            "tool_choice": {"tool": {}},
            "thinking": {"type": "enabled", "budget_tokens": 1024},
            "stream": true,
            "stream_options": {"include_usage": true},
            "metadata": {"user_id": "u"}
        }));

        assert_eq!(
            report.params_removed,
            vec!["tool_choice", "thinking", "stream_options", "metadata"]
        );
        assert!(req.params.contains_key("tools"));
        assert!(req.params.contains_key("stream"));
        assert!(!req.params.contains_key("tool_choice"));
    }
}
