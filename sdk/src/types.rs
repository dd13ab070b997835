//! Conversation types shared by the engine, connectors and sandboxed agents

use serde::{Deserialize, Serialize};

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    #[default]
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        f.write_str(s)
    }
}

/// Image reference inside a multi-part message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// One part of a multi-part message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

/// Message body: plain text or a list of parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Content {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for Content {
    fn default() -> Self {
        Content::Text(String::new())
    }
}

impl Content {
    /// Concatenated text of the content, ignoring non-text parts
    pub fn text(&self) -> String {
        match self {
            Content::Text(s) => s.clone(),
            Content::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Content::Text(s) => s.is_empty(),
            Content::Parts(parts) => parts.is_empty(),
        }
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Content::Text(s.to_string())
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::Text(s)
    }
}

/// A single conversation message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Message {
    pub role: Role,
    #[serde(default)]
    pub content: Content,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    /// Create a new message with the given role
    pub fn new(role: Role, content: impl Into<Content>) -> Self {
        Self {
            role,
            content: content.into(),
            name: None,
            tool_call_id: None,
        }
    }

    pub fn system(content: impl Into<Content>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<Content>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<Content>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Text of the message
    pub fn text(&self) -> String {
        self.content.text()
    }
}

/// Final result of a model (or sandboxed agent) invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CompletionResponse {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub created: i64,
    #[serde(default = "default_assistant_role")]
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

fn default_assistant_role() -> Role {
    Role::Assistant
}

/// Kind of an intermediate output chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChunkKind {
    #[default]
    Text,
    Thinking,
    ToolCall,
}

/// Intermediate output produced while a completion is streaming
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct StreamChunk {
    #[serde(default)]
    pub kind: ChunkKind,
    pub text: String,
}

impl StreamChunk {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: ChunkKind::Text,
            text: text.into(),
        }
    }
}

/// Per-assistant or per-request selection of auxiliary capabilities
///
/// Each field names the mechanism used for a capability: `"builtin"`,
/// `"disabled"`, an assistant id, or an `mcp:<server>.<tool>` reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Uses {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyword: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_dsl: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rerank: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vision: Option<String>,
}

impl Uses {
    /// Overlay `other` on top of `self`; set fields in `other` win
    pub fn merged_with(&self, other: &Uses) -> Uses {
        Uses {
            search: other.search.clone().or_else(|| self.search.clone()),
            web: other.web.clone().or_else(|| self.web.clone()),
            keyword: other.keyword.clone().or_else(|| self.keyword.clone()),
            query_dsl: other.query_dsl.clone().or_else(|| self.query_dsl.clone()),
            rerank: other.rerank.clone().or_else(|| self.rerank.clone()),
            vision: other.vision.clone().or_else(|| self.vision.clone()),
        }
    }
}

/// Per-call flags that switch off pipeline stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Skip {
    #[serde(default)]
    pub history: bool,
    #[serde(default)]
    pub trace: bool,
    #[serde(default)]
    pub output: bool,
    #[serde(default)]
    pub keyword: bool,
    #[serde(default)]
    pub search: bool,
    #[serde(default)]
    pub content_parsing: bool,
}
