//! Shared lifecycle hook types used across converge crates.

pub mod hooks;

pub use hooks::{HookError, HookEvent, HookHandler, HookPayload, HookRegistry};
