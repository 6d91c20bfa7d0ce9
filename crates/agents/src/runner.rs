//! The conversation orchestrator.
//!
//! One call to [`Agent::run_turn`] drives a full turn: validate any prior
//! history, send the working message list to the model backend, execute the
//! tool calls it requests, feed the results back, and repeat until the model
//! answers with plain text (or the turn is stopped). The loop owns a
//! turn-local [`HistoryStore`] and hands the record out on the result; no
//! other mutable state escapes.

use std::sync::Arc;

use {
    serde::{Deserialize, Serialize},
    serde_json::Value,
    tracing::{debug, info, warn},
};

use {
    converge_common::hooks::{HookError, HookPayload, HookRegistry},
    converge_history::{ChatMessage, HistoryStore},
};

use crate::{
    dispatch::{DispatchError, ExecutionMode, ToolDispatcher, UnknownToolPolicy},
    model::{LlmProvider, Usage},
    stop::StopSignal,
    tool_registry::ToolRegistry,
};

/// Why a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// The model produced a final text answer with no further tool calls.
    Completed,
    /// A cooperative stop was honored at a round boundary.
    ManualStop,
    /// The configured round cap was reached before the model finished.
    MaxRoundsExceeded,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::ManualStop => "manual_stop",
            Self::MaxRoundsExceeded => "max_rounds_exceeded",
        }
    }
}

/// Everything a completed turn hands back to the caller.
#[derive(Debug)]
pub struct TurnResult {
    pub stop_reason: StopReason,
    /// The last assistant reply's text, if any round produced one.
    pub final_output: Option<String>,
    /// Token usage summed across the turn's model calls; `None` when no
    /// model call completed.
    pub usage: Option<Usage>,
    /// The complete turn record, tool plumbing included.
    pub full_history: Vec<ChatMessage>,
    /// User messages and visible assistant replies only.
    pub simplified_history: Vec<ChatMessage>,
}

impl TurnResult {
    /// The full record as JSON values, ready to seed the next turn.
    #[must_use]
    pub fn full_values(&self) -> Vec<Value> {
        self.full_history.iter().map(ChatMessage::to_value).collect()
    }

    /// The simplified record as JSON values.
    #[must_use]
    pub fn simplified_values(&self) -> Vec<Value> {
        self.simplified_history
            .iter()
            .map(ChatMessage::to_value)
            .collect()
    }
}

/// Turn-aborting faults. Tool-level failures are not here; those become
/// error results fed back to the model.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The caller-supplied history snapshot failed validation.
    #[error(transparent)]
    Validation(#[from] converge_history::Error),

    /// The model backend request failed.
    #[error("model backend request failed: {0}")]
    Backend(anyhow::Error),

    /// A lifecycle hook handler failed; the turn is aborted.
    #[error(transparent)]
    Hook(#[from] HookError),

    /// The tool dispatcher raised one or more machinery faults.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Per-agent settings. All fields default, so a config file may set only
/// what it cares about.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Injected as the leading system message unless the prior history
    /// already starts with one.
    pub system_prompt: String,
    /// Run each round's tool calls concurrently (default) or one at a time.
    pub execute_concurrently: bool,
    /// Cap on model-call rounds per turn. `None` leaves the loop unbounded.
    pub max_rounds: Option<usize>,
    pub unknown_tools: UnknownToolPolicy,
    /// Fixed contextual fields merged into every tool call's arguments.
    /// `_session_key`, when present, also labels hook payloads.
    pub tool_context: Option<Value>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: "You are a helpful assistant.".to_string(),
            execute_concurrently: true,
            max_rounds: None,
            unknown_tools: UnknownToolPolicy::default(),
            tool_context: None,
        }
    }
}

/// A turn-based conversational agent.
///
/// Holds the model backend, the tool registry, and the hook registry for its
/// lifetime; each [`run_turn`](Agent::run_turn) call is otherwise
/// self-contained. Callers serialize turns — two concurrent turns on one
/// agent produce two unrelated histories.
pub struct Agent {
    provider: Arc<dyn LlmProvider>,
    tools: ToolRegistry,
    hooks: Arc<HookRegistry>,
    config: AgentConfig,
}

impl Agent {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        tools: ToolRegistry,
        hooks: Arc<HookRegistry>,
        config: AgentConfig,
    ) -> Self {
        Self {
            provider,
            tools,
            hooks,
            config,
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    fn session_key(&self) -> String {
        self.config
            .tool_context
            .as_ref()
            .and_then(|ctx| ctx.get("_session_key"))
            .and_then(Value::as_str)
            .unwrap_or("default")
            .to_string()
    }

    /// Run one turn to completion.
    ///
    /// `prior_history` is a caller-held snapshot of earlier turns in the
    /// JSON message shape; it is validated in full before any model call or
    /// hook side effect. The stop signal is consulted once after each model
    /// call returns and once after each tool-dispatch phase returns.
    ///
    /// Every turn-aborting fault passes through one best-effort `on_error`
    /// emission before propagating; a failing `on_error` handler is logged
    /// and never masks the original fault.
    pub async fn run_turn(
        &self,
        user_message: &str,
        prior_history: Option<&[Value]>,
        stop: &StopSignal,
    ) -> Result<TurnResult, AgentError> {
        match self.turn_inner(user_message, prior_history, stop).await {
            Ok(result) => Ok(result),
            Err(err) => {
                let payload = HookPayload::Error {
                    session_key: self.session_key(),
                    error: err.to_string(),
                };
                if let Err(hook_err) = self.hooks.dispatch(&payload).await {
                    warn!(error = %hook_err, "on_error hook failed");
                }
                Err(err)
            },
        }
    }

    async fn turn_inner(
        &self,
        user_message: &str,
        prior_history: Option<&[Value]>,
        stop: &StopSignal,
    ) -> Result<TurnResult, AgentError> {
        let session_key = self.session_key();
        let prior = match prior_history {
            Some(snapshot) => HistoryStore::validate(snapshot)?,
            None => Vec::new(),
        };

        info!(
            session = %session_key,
            model = self.provider.id(),
            prior_len = prior.len(),
            tools = self.tools.len(),
            "starting turn"
        );

        let mut messages = self.prepare_messages(&prior, user_message);
        // The turn record carries the injected system message too, so a
        // caller reseeding the next turn from `full_history` starts with a
        // leading system message and no re-injection happens.
        let mut store = if matches!(prior.first(), Some(ChatMessage::System { .. })) {
            HistoryStore::seeded(prior)
        } else {
            let mut seeded = Vec::with_capacity(prior.len() + 1);
            seeded.push(ChatMessage::system(self.config.system_prompt.clone()));
            seeded.extend(prior);
            HistoryStore::seeded(seeded)
        };
        store.append(ChatMessage::user(user_message));

        let schemas = if self.tools.is_empty() {
            None
        } else {
            Some(self.tools.list_schemas())
        };
        let mode = if self.config.execute_concurrently {
            ExecutionMode::Concurrent
        } else {
            ExecutionMode::Sequential
        };
        let dispatcher = ToolDispatcher::new(
            &self.tools,
            Arc::clone(&self.hooks),
            session_key.clone(),
            self.config.tool_context.clone(),
            self.config.unknown_tools,
        );

        let mut usage = Usage::default();
        let mut calls_completed = 0usize;
        let mut tool_calls_made = 0usize;
        let mut last_text: Option<String> = None;
        let mut round = 1usize;

        loop {
            if let Some(max) = self.config.max_rounds
                && round > max
            {
                info!(session = %session_key, max, "round cap reached, ending turn");
                return Ok(finish(
                    StopReason::MaxRoundsExceeded,
                    last_text,
                    usage_option(usage, calls_completed),
                    &store,
                ));
            }

            self.hooks
                .dispatch(&HookPayload::BeforeRequest {
                    session_key: session_key.clone(),
                    model: self.provider.id().to_string(),
                    message_count: messages.len(),
                    round,
                })
                .await?;

            debug!(session = %session_key, round, messages = messages.len(), "requesting completion");
            let response = self
                .provider
                .complete(&messages, schemas.as_deref())
                .await
                .map_err(AgentError::Backend)?;

            usage.accumulate(&response.usage);
            calls_completed += 1;
            tool_calls_made += response.tool_calls.len();
            last_text = response.text.clone();

            let assistant =
                ChatMessage::assistant_with_tools(response.text, response.tool_calls.clone());
            store.append(assistant.clone());
            messages.push(assistant);

            if stop.is_requested() {
                info!(session = %session_key, round, "stop honored after model call");
                self.hooks
                    .dispatch(&HookPayload::ManualStop {
                        session_key: session_key.clone(),
                        round,
                    })
                    .await?;
                return Ok(finish(
                    StopReason::ManualStop,
                    last_text,
                    usage_option(usage, calls_completed),
                    &store,
                ));
            }

            if response.tool_calls.is_empty() {
                info!(session = %session_key, rounds = round, tool_calls_made, "turn completed");
                self.hooks
                    .dispatch(&HookPayload::AfterRequest {
                        session_key: session_key.clone(),
                        model: self.provider.id().to_string(),
                        text: last_text.clone(),
                        rounds: round,
                        tool_calls_made,
                    })
                    .await?;
                return Ok(finish(
                    StopReason::Completed,
                    last_text,
                    usage_option(usage, calls_completed),
                    &store,
                ));
            }

            let results = dispatcher.execute(&response.tool_calls, mode).await?;
            for result in &results {
                let message = ChatMessage::tool(result.tool_call_id.clone(), result.content());
                store.append(message.clone());
                messages.push(message);
            }

            if stop.is_requested() {
                info!(session = %session_key, round, "stop honored after tool dispatch");
                self.hooks
                    .dispatch(&HookPayload::ManualStop {
                        session_key: session_key.clone(),
                        round,
                    })
                    .await?;
                return Ok(finish(
                    StopReason::ManualStop,
                    last_text,
                    usage_option(usage, calls_completed),
                    &store,
                ));
            }

            round += 1;
        }
    }

    /// Assemble the outbound message list for the first model call.
    ///
    /// The system prompt leads unless the prior snapshot already starts with
    /// a system message. The user message is appended unless the snapshot's
    /// last entry already carries the same content, whatever its role
    /// (guards against idempotent re-submission by a caller that stored the
    /// message before calling in).
    fn prepare_messages(&self, prior: &[ChatMessage], user_message: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(prior.len() + 2);
        if !matches!(prior.first(), Some(ChatMessage::System { .. })) {
            messages.push(ChatMessage::system(self.config.system_prompt.clone()));
        }
        messages.extend_from_slice(prior);

        let already_last =
            prior.last().and_then(ChatMessage::content_text) == Some(user_message);
        if !already_last {
            messages.push(ChatMessage::user(user_message));
        } else {
            debug!("user message already ends the prior history, not re-adding");
        }
        messages
    }
}

fn usage_option(usage: Usage, calls_completed: usize) -> Option<Usage> {
    (calls_completed > 0).then_some(usage)
}

fn finish(
    stop_reason: StopReason,
    final_output: Option<String>,
    usage: Option<Usage>,
    store: &HistoryStore,
) -> TurnResult {
    let full_history = store.snapshot();
    let simplified_history = simplify_history(&full_history);
    TurnResult {
        stop_reason,
        final_output,
        usage,
        full_history,
        simplified_history,
    }
}

/// Strip a turn record down to what a user-facing transcript shows: user
/// messages and assistant replies with visible text, rebuilt without the
/// tool-call plumbing.
fn simplify_history(full: &[ChatMessage]) -> Vec<ChatMessage> {
    full.iter()
        .filter_map(|message| match message {
            ChatMessage::User { content } => Some(ChatMessage::user(content.clone())),
            ChatMessage::Assistant {
                content: Some(text),
                ..
            } if !text.is_empty() => Some(ChatMessage::assistant(text.clone())),
            _ => None,
        })
        .collect()
}
