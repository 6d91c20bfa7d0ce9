//! Append-only record of one turn's conversation.

use tracing::{debug, warn};

use crate::{
    error::{Error, Result},
    message::{ChatMessage, ToolCall},
};

/// Roles a caller-supplied history snapshot may carry.
const KNOWN_ROLES: &[&str] = &["system", "user", "assistant", "tool"];

/// The conversation record for a single turn.
///
/// Owned exclusively by one orchestrator turn: created empty or seeded from a
/// validated prior snapshot, grows monotonically, and is handed out as part
/// of the turn result. Not synchronized — at most one turn may mutate it.
#[derive(Debug, Default)]
pub struct HistoryStore {
    messages: Vec<ChatMessage>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with an already-validated history.
    pub fn seeded(messages: Vec<ChatMessage>) -> Self {
        Self { messages }
    }

    pub fn append(&mut self, message: ChatMessage) {
        debug!(role = message.role(), "appending message to history");
        self.messages.push(message);
    }

    /// A defensive copy of the record; the live sequence never escapes.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.messages.clone()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    /// Validate a caller-supplied history snapshot and convert it to typed
    /// messages.
    ///
    /// Every entry must be a JSON object carrying both a `role` and a
    /// `content` key (`content` may be null) and a role from the known set.
    /// Anything else fails the whole snapshot before any side effect occurs.
    pub fn validate(candidate: &[serde_json::Value]) -> Result<Vec<ChatMessage>> {
        let mut messages = Vec::with_capacity(candidate.len());
        for (index, entry) in candidate.iter().enumerate() {
            let obj = entry
                .as_object()
                .ok_or_else(|| Error::validation(index, "entry is not an object"))?;
            let role = obj
                .get("role")
                .ok_or_else(|| Error::validation(index, "missing `role` field"))?
                .as_str()
                .ok_or_else(|| Error::validation(index, "`role` is not a string"))?;
            if !obj.contains_key("content") {
                return Err(Error::validation(index, "missing `content` field"));
            }
            if !KNOWN_ROLES.contains(&role) {
                return Err(Error::validation(index, format!("unknown role `{role}`")));
            }
            messages.push(convert_entry(role, entry));
        }
        Ok(messages)
    }
}

/// Convert one validated snapshot entry to a typed message.
fn convert_entry(role: &str, entry: &serde_json::Value) -> ChatMessage {
    match role {
        "system" => ChatMessage::system(entry["content"].as_str().unwrap_or_default()),
        "user" => ChatMessage::user(entry["content"].as_str().unwrap_or_default()),
        "assistant" => {
            let content = entry["content"].as_str().map(String::from);
            let tool_calls = entry["tool_calls"]
                .as_array()
                .map(|tcs| {
                    tcs.iter()
                        .filter_map(|tc| {
                            let id = tc["id"].as_str()?.to_string();
                            let name = tc["function"]["name"].as_str()?.to_string();
                            let args = &tc["function"]["arguments"];
                            let arguments = match args.as_str() {
                                Some(raw) => serde_json::from_str(raw).unwrap_or_else(|e| {
                                    warn!(error = %e, "unparseable tool call arguments in history");
                                    serde_json::json!({})
                                }),
                                None => args.clone(),
                            };
                            Some(ToolCall {
                                id,
                                name,
                                arguments,
                            })
                        })
                        .collect()
                })
                .unwrap_or_default();
            ChatMessage::assistant_with_tools(content, tool_calls)
        },
        // Validation guarantees the role set; anything left is a tool message.
        _ => {
            let content = match entry["content"].as_str() {
                Some(s) => s.to_string(),
                None => entry["content"].to_string(),
            };
            ChatMessage::tool(entry["tool_call_id"].as_str().unwrap_or_default(), content)
        },
    }
}
