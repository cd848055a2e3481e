//! Classification model: provider trait, the Anthropic implementation,
//! and system prompt assembly.

pub mod anthropic;
pub mod prompt;
pub mod provider;

pub use anthropic::AnthropicClassifier;
pub use prompt::{PromptContext, SKIP_SENTINEL, chat_system_prompt, checkin_system_prompt};
pub use provider::{
    ChatTurn, Classifier, StopReason, ToolCall, ToolCompletionRequest, ToolCompletionResponse,
    ToolDefinition, ToolResultMsg,
};
