//! Anthropic tool blocks -> OpenAI tool calls.
//!
//! The client embeds Anthropic content blocks in an otherwise OpenAI-shaped
//! history:
//! - assistant `tool_use` blocks become `tool_calls` records
//! - user `tool_result` blocks become standalone `role: "tool"` messages
//!
//! Every call-id that survives is recorded in a [`CallRegistry`] for the
//! history filter. Malformed blocks are dropped, never rejected.

use crate::types::{CallRegistry, Content, ContentBlock, Message, Role, ToolCall, ToolResult};
use serde_json::Value;
use tracing::debug;

/// Normalized history plus the calls it declares.
#[derive(Debug, Clone, Default)]
pub struct Normalized {
    pub messages: Vec<Message>,
    pub registry: CallRegistry,
    /// Blocks or call records dropped as malformed.
    pub dropped_blocks: usize,
    /// Messages dropped because nothing survived in them.
    pub dropped_messages: usize,
}

/// Rewrite a message sequence into the backend dialect.
///
/// Relative order is preserved; messages are only split or dropped.
pub fn normalize_messages(messages: Vec<Message>) -> Normalized {
    let mut out = Normalized {
        messages: Vec::with_capacity(messages.len()),
        ..Normalized::default()
    };

    for msg in messages {
        match msg.role {
            Role::Assistant => {
                let position = out.messages.len();
                let (normalized, dropped) = normalize_assistant(msg, position, &mut out.registry);
                out.dropped_blocks += dropped;
                match normalized {
                    Some(m) => out.messages.push(m),
                    None => out.dropped_messages += 1,
                }
            }
            Role::User => {
                let (split, dropped) = split_user(msg);
                out.dropped_blocks += dropped;
                if split.is_empty() {
                    out.dropped_messages += 1;
                }
                out.messages.extend(split);
            }
            Role::System
            | Role::Developer
            | Role::Tool
            | Role::Function
            | Role::Other(_) => {
                let (kept, dropped) = drop_blocks(msg, |b| b.is_tool_use() || b.is_tool_result());
                out.dropped_blocks += dropped;
                match kept {
                    Some(m) => out.messages.push(m),
                    None => out.dropped_messages += 1,
                }
            }
        }
    }

    if out.dropped_blocks > 0 || out.dropped_messages > 0 {
        debug!(
            dropped_blocks = out.dropped_blocks,
            dropped_messages = out.dropped_messages,
            "dropped malformed tool blocks"
        );
    }
    out
}

/// Move `tool_use` blocks into `tool_calls`, validate existing call records,
/// and register every surviving call at `position`.
fn normalize_assistant(
    mut msg: Message,
    position: usize,
    registry: &mut CallRegistry,
) -> (Option<Message>, usize) {
    let mut dropped = 0;
    let mut calls: Vec<ToolCall> = Vec::new();

    if let Some(raw) = msg.tool_calls.take() {
        for record in raw {
            match ToolCall::from_value(record) {
                Some(call) => calls.push(call),
                None => dropped += 1,
            }
        }
    }

    msg.content = match msg.content.take() {
        Some(Content::Blocks(blocks)) => {
            let had_tool_use = blocks.iter().any(ContentBlock::is_tool_use);
            let mut kept = Vec::with_capacity(blocks.len());
            for block in blocks {
                match block {
                    ContentBlock::ToolUse(tool_use) => match ToolCall::from_tool_use(tool_use) {
                        Some(call) => calls.push(call),
                        None => dropped += 1,
                    },
                    ContentBlock::ToolResult(_) => dropped += 1,
                    other => kept.push(other),
                }
            }
            if kept.is_empty() && (had_tool_use || dropped > 0) {
                None
            } else {
                Some(Content::Blocks(kept))
            }
        }
        other => other,
    };

    for call in &calls {
        registry.record(&call.id, &call.name, position);
    }
    msg.tool_calls = if calls.is_empty() {
        None
    } else {
        Some(calls.iter().map(ToolCall::to_value).collect())
    };

    if dropped > 0 && msg.is_empty() {
        return (None, dropped);
    }
    (Some(msg), dropped)
}

/// Split a user message around its `tool_result` blocks.
///
/// Runs of ordinary blocks become user messages (carrying the original
/// message's other keys); each result becomes a `role: "tool"` message.
fn split_user(msg: Message) -> (Vec<Message>, usize) {
    let Message {
        role,
        content,
        tool_calls,
        tool_call_id,
        extra,
    } = msg;

    let blocks = match content {
        Some(Content::Blocks(blocks))
            if blocks.iter().any(|b| b.is_tool_result() || b.is_tool_use()) =>
        {
            blocks
        }
        content => {
            return (
                vec![Message {
                    role,
                    content,
                    tool_calls,
                    tool_call_id,
                    extra,
                }],
                0,
            )
        }
    };

    let segment = |blocks: Vec<ContentBlock>| Message {
        role: role.clone(),
        content: Some(Content::Blocks(blocks)),
        tool_calls: tool_calls.clone(),
        tool_call_id: tool_call_id.clone(),
        extra: extra.clone(),
    };

    let mut out = Vec::new();
    let mut pending: Vec<ContentBlock> = Vec::new();
    let mut dropped = 0;

    for block in blocks {
        match block {
            ContentBlock::ToolResult(result) => {
                let Some(call_id) = result.tool_use_id.clone().filter(|id| !id.is_empty()) else {
                    dropped += 1;
                    continue;
                };
                if !pending.is_empty() {
                    out.push(segment(std::mem::take(&mut pending)));
                }
                out.push(Message::tool_response(call_id, tool_result_text(&result)));
            }
            // Only assistants invoke tools.
            ContentBlock::ToolUse(_) => dropped += 1,
            other => pending.push(other),
        }
    }
    if !pending.is_empty() {
        out.push(segment(pending));
    }

    (out, dropped)
}

/// Remove blocks matching `reject` from a message's block content. A message
/// emptied this way is dropped.
fn drop_blocks(
    mut msg: Message,
    reject: impl Fn(&ContentBlock) -> bool,
) -> (Option<Message>, usize) {
    let dropped = match &mut msg.content {
        Some(Content::Blocks(blocks)) => {
            let before = blocks.len();
            blocks.retain(|b| !reject(b));
            before - blocks.len()
        }
        _ => 0,
    };

    if dropped > 0 && msg.is_empty() {
        return (None, dropped);
    }
    (Some(msg), dropped)
}

/// Flatten a tool result payload to the string the backend expects.
///
/// Text blocks are joined with newlines; other blocks are described
/// (`[image]`) or JSON-encoded. Error results are prefixed with `[error] `.
pub fn tool_result_text(result: &ToolResult) -> String {
    let text = match &result.content {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .map(|item| match ContentBlock::from_value(item.clone()) {
                ContentBlock::Text { text, .. } => text,
                ContentBlock::Unknown(Value::String(s)) => s,
                ContentBlock::Unknown(v)
                    if v.get("type").and_then(Value::as_str) == Some("image") =>
                {
                    "[image]".to_string()
                }
                other => other.to_value().to_string(),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    };

    if result.is_error == Some(true) {
        format!("[error] {}", text)
    } else {
        text
    }
}
