//! Classification model boundary.
//!
//! The agent talks to the model through [`Classifier`]: a system
//! prompt, a transcript of turns, and the declared tool schemas go in;
//! either final text or a single tool call comes out. Providers map
//! these types onto their wire format.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ClassifierError;

/// A tool the model may invoke, described by a JSON schema.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: String,
    pub input_schema: Value,
}

/// One tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Provider-assigned id, echoed back with the result.
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

/// The outcome of a tool invocation, fed back into the transcript.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResultMsg {
    pub call_id: String,
    pub content: String,
    pub is_error: bool,
}

/// One unit of conversation transcript.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatTurn {
    User(String),
    /// What the model said, possibly ending in a tool call.
    Assistant {
        text: Option<String>,
        tool_call: Option<ToolCall>,
    },
    ToolResult(ToolResultMsg),
}

impl ChatTurn {
    pub fn user(text: impl Into<String>) -> Self {
        ChatTurn::User(text.into())
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        ChatTurn::Assistant {
            text: Some(text.into()),
            tool_call: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCompletionRequest {
    pub system: String,
    pub turns: Vec<ChatTurn>,
    pub tools: Vec<ToolDefinition>,
}

/// Why the model stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    Other,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCompletionResponse {
    pub text: Option<String>,
    /// At most one; providers are asked not to parallelize tool use.
    pub tool_call: Option<ToolCall>,
    pub stop: StopReason,
}

impl ToolCompletionResponse {
    /// Final text with surrounding whitespace trimmed, if any.
    pub fn final_text(&self) -> Option<&str> {
        self.text.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }
}

#[async_trait]
pub trait Classifier: Send + Sync {
    fn name(&self) -> &str;

    /// One completion round. No retries here: the agent loop treats any
    /// failure as immediate fallback.
    async fn complete(
        &self,
        request: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, ClassifierError>;
}
