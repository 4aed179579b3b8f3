//! Chat-completion wire types.
//!
//! The IDE client speaks OpenAI's `chat/completions` shape but embeds
//! Anthropic-style content blocks (`tool_use`, `tool_result`) and annotations
//! inside it. Both dialects are accepted here; `translation` rewrites the
//! Anthropic parts into their OpenAI equivalents.
//!
//! Notes:
//! - Keys this crate does not interpret are kept in `extra` maps, so a message
//!   that needs no rewriting is forwarded with its fields intact.
//! - Content blocks never fail to parse. Anything unrecognised becomes
//!   [`ContentBlock::Unknown`] and passes through verbatim.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

/// A message role. Roles this crate does not rewrite (legacy `function`,
/// vendor extensions) are carried through as [`Role::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    System,
    Developer,
    User,
    Assistant,
    Tool,
    Function,
    Other(String),
}

impl From<String> for Role {
    fn from(role: String) -> Self {
        match role.as_str() {
            "system" => Role::System,
            "developer" => Role::Developer,
            "user" => Role::User,
            "assistant" => Role::Assistant,
            "tool" => Role::Tool,
            "function" => Role::Function,
            _ => Role::Other(role),
        }
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        match role {
            Role::System => "system".to_string(),
            Role::Developer => "developer".to_string(),
            Role::User => "user".to_string(),
            Role::Assistant => "assistant".to_string(),
            Role::Tool => "tool".to_string(),
            Role::Function => "function".to_string(),
            Role::Other(role) => role,
        }
    }
}

/// Message content: a string shorthand, a block list, or anything else the
/// client sent (carried through untouched).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    String(String),
    Blocks(Vec<ContentBlock>),
    Other(Value),
}

impl Content {
    pub fn is_empty(&self) -> bool {
        match self {
            Content::String(s) => s.is_empty(),
            Content::Blocks(blocks) => blocks.is_empty(),
            Content::Other(v) => v.is_null(),
        }
    }
}

/// A message in `messages[]`.
///
/// `content` is always serialized (as `null` when absent) so the output shape
/// is stable across repeated passes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,

    #[serde(default)]
    pub content: Option<Content>,

    /// Backend-shaped call records. Kept raw until `translation` validates
    /// them, so one malformed record cannot fail the whole request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Message {
    /// A backend `role: "tool"` response message.
    pub fn tool_response(call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(Content::String(text.into())),
            tool_calls: None,
            tool_call_id: Some(call_id.into()),
            extra: Map::new(),
        }
    }

    /// True when the message carries neither content nor call records.
    pub fn is_empty(&self) -> bool {
        let no_content = self.content.as_ref().map_or(true, Content::is_empty);
        let no_calls = self.tool_calls.as_ref().map_or(true, Vec::is_empty);
        no_content && no_calls
    }
}

/// A content block within `messages[].content`.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text {
        text: String,
        extra: Map<String, Value>,
    },
    ToolUse(ToolUse),
    ToolResult(ToolResult),
    /// Any block this crate does not interpret (images, documents, ...).
    Unknown(Value),
}

/// An Anthropic `tool_use` block. `id` and `name` stay optional so a malformed
/// block can be recognised and dropped instead of rejecting the request.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolUse {
    pub id: Option<String>,
    pub name: Option<String>,
    pub input: Value,
    pub extra: Map<String, Value>,
}

/// An Anthropic `tool_result` block.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub tool_use_id: Option<String>,
    pub content: Value,
    pub is_error: Option<bool>,
    pub extra: Map<String, Value>,
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text {
            text: text.into(),
            extra: Map::new(),
        }
    }

    pub fn is_tool_use(&self) -> bool {
        matches!(self, ContentBlock::ToolUse(_))
    }

    pub fn is_tool_result(&self) -> bool {
        matches!(self, ContentBlock::ToolResult(_))
    }

    /// Classify a raw JSON block. Never fails.
    pub fn from_value(value: Value) -> Self {
        let Value::Object(mut obj) = value else {
            return ContentBlock::Unknown(value);
        };

        let kind = obj.get("type").and_then(Value::as_str).map(str::to_owned);
        match kind.as_deref() {
            Some("text") if obj.get("text").is_some_and(Value::is_string) => {
                obj.shift_remove("type");
                let text = match obj.shift_remove("text") {
                    Some(Value::String(s)) => s,
                    _ => String::new(),
                };
                ContentBlock::Text { text, extra: obj }
            }
            Some("tool_use") => {
                obj.shift_remove("type");
                ContentBlock::ToolUse(ToolUse {
                    id: take_string(&mut obj, "id"),
                    name: take_string(&mut obj, "name"),
                    input: obj
                        .shift_remove("input")
                        .unwrap_or_else(|| Value::Object(Map::new())),
                    extra: obj,
                })
            }
            Some("tool_result") => {
                obj.shift_remove("type");
                ContentBlock::ToolResult(ToolResult {
                    tool_use_id: take_string(&mut obj, "tool_use_id"),
                    content: obj.shift_remove("content").unwrap_or(Value::Null),
                    is_error: obj.shift_remove("is_error").and_then(|v| v.as_bool()),
                    extra: obj,
                })
            }
            _ => ContentBlock::Unknown(Value::Object(obj)),
        }
    }

    /// Rebuild the wire JSON for this block.
    pub fn to_value(&self) -> Value {
        match self {
            ContentBlock::Text { text, extra } => {
                let mut obj = Map::new();
                obj.insert("type".into(), json!("text"));
                obj.insert("text".into(), json!(text));
                obj.extend(extra.clone());
                Value::Object(obj)
            }
            ContentBlock::ToolUse(t) => {
                let mut obj = Map::new();
                obj.insert("type".into(), json!("tool_use"));
                if let Some(id) = &t.id {
                    obj.insert("id".into(), json!(id));
                }
                if let Some(name) = &t.name {
                    obj.insert("name".into(), json!(name));
                }
                obj.insert("input".into(), t.input.clone());
                obj.extend(t.extra.clone());
                Value::Object(obj)
            }
            ContentBlock::ToolResult(r) => {
                let mut obj = Map::new();
                obj.insert("type".into(), json!("tool_result"));
                if let Some(id) = &r.tool_use_id {
                    obj.insert("tool_use_id".into(), json!(id));
                }
                obj.insert("content".into(), r.content.clone());
                if let Some(is_error) = r.is_error {
                    obj.insert("is_error".into(), json!(is_error));
                }
                obj.extend(r.extra.clone());
                Value::Object(obj)
            }
            ContentBlock::Unknown(v) => v.clone(),
        }
    }
}

impl Serialize for ContentBlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ContentBlock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Value::deserialize(deserializer).map(ContentBlock::from_value)
    }
}

fn take_string(obj: &mut Map<String, Value>, key: &str) -> Option<String> {
    match obj.shift_remove(key) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

/// A backend (OpenAI) call record:
/// `{"id", "type": "function", "function": {"name", "arguments"}}`.
///
/// `arguments` is always a JSON-encoded string, which is what the relay
/// validates against.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: String,
    /// Other keys of the record (e.g. `index`).
    pub extra: Map<String, Value>,
}

impl ToolCall {
    /// Validate a raw backend call record. Records without an id or a
    /// function name yield `None`.
    pub fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut obj) = value else {
            return None;
        };
        let id = non_empty(take_string(&mut obj, "id"))?;
        let Some(Value::Object(mut function)) = obj.shift_remove("function") else {
            return None;
        };
        let name = non_empty(take_string(&mut function, "name"))?;
        let arguments = encode_arguments(function.shift_remove("arguments"));
        obj.shift_remove("type");
        Some(Self {
            id,
            name,
            arguments,
            extra: obj,
        })
    }

    /// Reshape an Anthropic `tool_use` block. Blocks without an id or a name
    /// yield `None`.
    pub fn from_tool_use(block: ToolUse) -> Option<Self> {
        let id = non_empty(block.id)?;
        let name = non_empty(block.name)?;
        Some(Self {
            id,
            name,
            arguments: encode_arguments(Some(block.input)),
            extra: Map::new(),
        })
    }

    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("id".into(), json!(self.id));
        obj.insert("type".into(), json!("function"));
        obj.insert(
            "function".into(),
            json!({"name": self.name, "arguments": self.arguments}),
        );
        obj.extend(self.extra.clone());
        Value::Object(obj)
    }
}

fn non_empty(s: Option<String>) -> Option<String> {
    s.filter(|s| !s.is_empty())
}

/// String-encode a call's arguments. Strings are taken as already encoded;
/// everything else is serialized compactly, keeping key order.
fn encode_arguments(arguments: Option<Value>) -> String {
    match arguments {
        Some(Value::String(s)) => s,
        None | Some(Value::Null) => "{}".to_string(),
        Some(other) => other.to_string(),
    }
}

/// Request body for `/v1/chat/completions`.
///
/// `model` and `messages` are required; every other generation parameter
/// stays in `params` in its original order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl ChatRequest {
    pub fn is_streaming(&self) -> bool {
        self.params
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// Metadata recorded for a declared call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub name: String,
    /// Index of the first message (in the normalized sequence) that declared
    /// this call-id.
    pub position: usize,
}

/// Request-scoped map from call-id to the call it names.
///
/// Built by `translation::normalize_messages`, read by `history`, dropped with
/// the request. Duplicate ids keep the last name and the earliest position.
#[derive(Debug, Clone, Default)]
pub struct CallRegistry {
    calls: HashMap<String, CallRecord>,
}

impl CallRegistry {
    pub fn record(&mut self, id: &str, name: &str, position: usize) {
        self.calls
            .entry(id.to_string())
            .and_modify(|existing| {
                existing.name = name.to_string();
                existing.position = existing.position.min(position);
            })
            .or_insert_with(|| CallRecord {
                name: name.to_string(),
                position,
            });
    }

    pub fn get(&self, id: &str) -> Option<&CallRecord> {
        self.calls.get(id)
    }

    /// True if `id` was declared by a message strictly before `position`.
    pub fn declared_before(&self, id: &str, position: usize) -> bool {
        self.calls.get(id).is_some_and(|c| c.position < position)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}
