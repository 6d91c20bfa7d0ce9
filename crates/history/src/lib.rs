//! Conversation history: typed messages, the append-only store, and
//! validation of caller-supplied history snapshots.

pub mod error;
pub mod message;
pub mod store;

pub use {
    error::{Error, Result},
    message::{ChatMessage, ToolCall},
    store::HistoryStore,
};
