//! Turn-based agent orchestration: the model backend interface, tool
//! registry and dispatch, cooperative cancellation, and the conversation
//! loop that drives a turn to completion.

pub mod dispatch;
pub mod model;
pub mod runner;
pub mod stop;
pub mod tokens;
pub mod tool_registry;

pub use {
    converge_history::{ChatMessage, HistoryStore, ToolCall},
    dispatch::{DispatchError, ExecutionMode, ToolDispatcher, ToolResult, UnknownToolPolicy},
    model::{CompletionResponse, LlmProvider, Usage},
    runner::{Agent, AgentConfig, AgentError, StopReason, TurnResult},
    stop::StopSignal,
    tokens::{CountMethod, TokenCountError, accurate_token_count, history_token_count, simple_token_count},
    tool_registry::{AgentTool, ToolRegistry},
};
