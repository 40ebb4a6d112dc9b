//! Provider-agnostic request/response shapes that flow through the pipeline.
//!
//! These mirror the structural contract in spec.md §6: a request carries a
//! model id and either a flat string prompt or an ordered sequence of chat
//! messages, plus optional tool schemas; a completed call returns text and a
//! token usage breakdown. The crate never constructs these from a specific
//! provider's wire format — that translation is the caller's job.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Role of a message participant in a structured prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::Tool => write!(f, "tool"),
        }
    }
}

/// One part of a message's content. Most prompts are plain text; `text`
/// is `None` for non-text parts (images, etc.) which the core passes
/// through untouched but does not tokenize or transform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub part_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            part_type: "text".to_string(),
            text: Some(text.into()),
        }
    }
}

/// A single message in a structured prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl ChatMessage {
    pub fn new(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentPart::text(text)],
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, text)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, text)
    }

    /// Concatenated text of all text parts, joined by blank lines.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// Replace the message's text content wholesale, keeping non-text parts.
    pub fn with_text(&self, text: impl Into<String>) -> Self {
        let mut msg = self.clone();
        let text = text.into();
        let mut replaced = false;
        for part in msg.content.iter_mut() {
            if part.part_type == "text" {
                part.text = Some(text.clone());
                replaced = true;
                break;
            }
        }
        if !replaced {
            msg.content.insert(0, ContentPart::text(text));
        }
        msg
    }
}

/// The prompt half of a request: either a bare string or a full
/// conversation. `transform`/`wrap` normalize the bare-string form into a
/// single user message internally but preserve the caller's original shape
/// on the way back out where practical.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prompt {
    Text(String),
    Messages(Vec<ChatMessage>),
}

impl Prompt {
    /// Render the prompt as an ordered list of chat messages, synthesizing
    /// a single user message when the prompt is a bare string.
    pub fn as_messages(&self) -> Vec<ChatMessage> {
        match self {
            Prompt::Text(s) => vec![ChatMessage::user(s.clone())],
            Prompt::Messages(msgs) => msgs.clone(),
        }
    }

    /// Concatenation of every message's text, in order, for estimation,
    /// compression, and cache-key purposes.
    pub fn flat_text(&self) -> String {
        match self {
            Prompt::Text(s) => s.clone(),
            Prompt::Messages(msgs) => msgs
                .iter()
                .map(|m| m.text())
                .collect::<Vec<_>>()
                .join("\n\n"),
        }
    }
}

/// A tool schema passed through to the model invoker. The core only cares
/// about its name and an approximate token cost; it never validates or
/// executes tools.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
}

/// Inbound request parameters for one model invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestParams {
    pub model_id: String,
    pub prompt: Prompt,
    #[serde(default)]
    pub tools: Vec<ToolSchema>,
    /// Caller-supplied user identifier used by the user-budget manager.
    /// When absent, `userBudget.getUserId` (if configured) resolves it.
    #[serde(default)]
    pub user_id: Option<String>,
    /// Opaque passthrough fields the caller wants round-tripped; the core
    /// never reads or writes these.
    #[serde(default)]
    pub passthrough: HashMap<String, Value>,
}

impl RequestParams {
    pub fn new(model_id: impl Into<String>, prompt: impl Into<Prompt>) -> Self {
        Self {
            model_id: model_id.into(),
            prompt: prompt.into(),
            tools: Vec::new(),
            user_id: None,
            passthrough: HashMap::new(),
        }
    }
}

impl From<String> for Prompt {
    fn from(s: String) -> Self {
        Prompt::Text(s)
    }
}

impl From<&str> for Prompt {
    fn from(s: &str) -> Self {
        Prompt::Text(s.to_string())
    }
}

impl From<Vec<ChatMessage>> for Prompt {
    fn from(m: Vec<ChatMessage>) -> Self {
        Prompt::Messages(m)
    }
}

/// Token usage reported by the caller's model invoker.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Reason the model stopped generating, as reported by the invoker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    MaxTokens,
    ToolUse,
    Other(String),
}

/// The shape the caller-supplied model invocation function must return.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokerResult {
    pub text: String,
    pub usage: Usage,
    pub finish_reason: FinishReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_flat_text_joins_messages() {
        let prompt = Prompt::Messages(vec![
            ChatMessage::system("be terse"),
            ChatMessage::user("hello"),
        ]);
        assert_eq!(prompt.flat_text(), "be terse\n\nhello");
    }

    #[test]
    fn chat_message_with_text_preserves_role() {
        let msg = ChatMessage::user("old").with_text("new");
        assert_eq!(msg.role, Role::User);
        assert_eq!(msg.text(), "new");
    }

    #[test]
    fn prompt_from_bare_string_becomes_single_user_message() {
        let prompt: Prompt = "hi".into();
        let messages = prompt.as_messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, Role::User);
    }
}
