//! The model backend interface.
//!
//! The orchestrator treats the backend as opaque beyond this shape: it sends
//! the working message list (plus tool schemas when any tools are
//! registered) and gets back optional text, zero or more tool calls, and
//! usage accounting. Transport, retry, and wire schema live behind the
//! trait, in the caller's implementation.

use {anyhow::Result, async_trait::async_trait};

use converge_history::{ChatMessage, ToolCall};

/// LLM provider trait (Anthropic, OpenAI, local, test stubs, …).
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Model identifier (e.g. "gpt-4o", "claude-sonnet-4-20250514").
    fn id(&self) -> &str;

    /// One completion round trip. `tools` is `None` when the orchestrator's
    /// registry is empty — the parameter is omitted, not sent empty.
    async fn complete(
        &self,
        messages: &[ChatMessage],
        tools: Option<&[serde_json::Value]>,
    ) -> Result<CompletionResponse>;
}

/// Response from one completion call.
#[derive(Debug)]
pub struct CompletionResponse {
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
}

/// Token accounting for one or more completion calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    /// Fold another call's usage into this one.
    pub fn accumulate(&mut self, other: &Usage) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
    }
}
