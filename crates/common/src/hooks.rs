//! Lifecycle hook events and the registry that dispatches them.
//!
//! The registry is a dependency-injected collaborator: each agent holds its
//! own `Arc<HookRegistry>` rather than consulting process-global state, so
//! concurrent agents stay isolated. Handlers are registered at setup time;
//! once the registry is shared it is never mutated.

use std::{collections::HashMap, fmt, sync::Arc};

use {
    anyhow::Result,
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    serde_json::Value,
    tracing::{debug, info},
};

// ── HookEvent ───────────────────────────────────────────────────────────────

/// Lifecycle events that hooks can subscribe to.
///
/// The set is closed: every point where the orchestrator or tool dispatcher
/// emits an event is listed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HookEvent {
    #[serde(rename = "on_before_request")]
    BeforeRequest,
    #[serde(rename = "on_after_request")]
    AfterRequest,
    #[serde(rename = "on_manual_stop")]
    ManualStop,
    #[serde(rename = "on_error")]
    Error,
    #[serde(rename = "on_function_call_start")]
    FunctionCallStart,
    #[serde(rename = "on_function_call_end")]
    FunctionCallEnd,
    #[serde(rename = "on_function_call_error")]
    FunctionCallError,
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl HookEvent {
    /// All variants, for iteration.
    pub const ALL: &'static [HookEvent] = &[
        Self::BeforeRequest,
        Self::AfterRequest,
        Self::ManualStop,
        Self::Error,
        Self::FunctionCallStart,
        Self::FunctionCallEnd,
        Self::FunctionCallError,
    ];

    /// The event's wire name (`on_before_request`, `on_function_call_end`, …).
    pub fn name(&self) -> &'static str {
        match self {
            Self::BeforeRequest => "on_before_request",
            Self::AfterRequest => "on_after_request",
            Self::ManualStop => "on_manual_stop",
            Self::Error => "on_error",
            Self::FunctionCallStart => "on_function_call_start",
            Self::FunctionCallEnd => "on_function_call_end",
            Self::FunctionCallError => "on_function_call_error",
        }
    }
}

// ── HookPayload ─────────────────────────────────────────────────────────────

/// Typed payload carried with each hook event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum HookPayload {
    BeforeRequest {
        session_key: String,
        model: String,
        message_count: usize,
        round: usize,
    },
    AfterRequest {
        session_key: String,
        model: String,
        text: Option<String>,
        rounds: usize,
        tool_calls_made: usize,
    },
    ManualStop {
        session_key: String,
        round: usize,
    },
    Error {
        session_key: String,
        error: String,
    },
    FunctionCallStart {
        session_key: String,
        tool_name: String,
        arguments: Value,
    },
    FunctionCallEnd {
        session_key: String,
        tool_name: String,
        result: Value,
    },
    FunctionCallError {
        session_key: String,
        tool_name: String,
        error: String,
    },
}

impl HookPayload {
    /// Returns the [`HookEvent`] variant that matches this payload.
    pub fn event(&self) -> HookEvent {
        match self {
            Self::BeforeRequest { .. } => HookEvent::BeforeRequest,
            Self::AfterRequest { .. } => HookEvent::AfterRequest,
            Self::ManualStop { .. } => HookEvent::ManualStop,
            Self::Error { .. } => HookEvent::Error,
            Self::FunctionCallStart { .. } => HookEvent::FunctionCallStart,
            Self::FunctionCallEnd { .. } => HookEvent::FunctionCallEnd,
            Self::FunctionCallError { .. } => HookEvent::FunctionCallError,
        }
    }
}

// ── HookError ───────────────────────────────────────────────────────────────

/// A handler failure, attributed to the handler and event that produced it.
///
/// Handler failures are never swallowed: `dispatch` stops at the first
/// failing handler and returns this error to the triggering call site.
#[derive(Debug, thiserror::Error)]
#[error("hook handler {handler} failed on {event}: {source}")]
pub struct HookError {
    pub handler: String,
    pub event: HookEvent,
    #[source]
    pub source: anyhow::Error,
}

// ── HookHandler trait ───────────────────────────────────────────────────────

/// A named lifecycle callback.
#[async_trait]
pub trait HookHandler: Send + Sync {
    /// A human-readable name for this handler.
    fn name(&self) -> &str;

    /// Which events this handler subscribes to.
    fn events(&self) -> &[HookEvent];

    /// Handle the event. An `Err` propagates to whatever phase triggered the
    /// dispatch and aborts it.
    async fn handle(&self, event: HookEvent, payload: &HookPayload) -> Result<()>;
}

// ── HookRegistry ────────────────────────────────────────────────────────────

/// Manages registered hook handlers and dispatches events to them.
pub struct HookRegistry {
    handlers: HashMap<HookEvent, Vec<Arc<dyn HookHandler>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler for all events it subscribes to.
    ///
    /// Handlers run in registration order within each event.
    pub fn register(&mut self, handler: Arc<dyn HookHandler>) {
        for &event in handler.events() {
            self.handlers
                .entry(event)
                .or_default()
                .push(Arc::clone(&handler));
        }
        info!(handler = handler.name(), "hook handler registered");
    }

    /// Returns true if any handlers are registered for the given event.
    pub fn has_handlers(&self, event: HookEvent) -> bool {
        self.handlers.get(&event).is_some_and(|v| !v.is_empty())
    }

    /// List all registered handler names (deduplicated).
    pub fn handler_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handlers
            .values()
            .flatten()
            .map(|h| h.name().to_string())
            .collect();
        names.sort();
        names.dedup();
        names
    }

    /// Dispatch an event to all registered handlers, in registration order.
    ///
    /// This is a suspend point: the triggering phase must not proceed until
    /// every handler has completed. The first handler failure short-circuits
    /// the remaining handlers and propagates as a [`HookError`].
    pub async fn dispatch(&self, payload: &HookPayload) -> Result<(), HookError> {
        let event = payload.event();
        let handlers = match self.handlers.get(&event) {
            Some(h) if !h.is_empty() => h,
            _ => return Ok(()),
        };

        debug!(event = %event, count = handlers.len(), "dispatching hook event");

        for handler in handlers {
            handler
                .handle(event, payload)
                .await
                .map_err(|source| HookError {
                    handler: handler.name().to_string(),
                    event,
                    source,
                })?;
        }
        Ok(())
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}
