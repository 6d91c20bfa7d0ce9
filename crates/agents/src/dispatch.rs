//! Tool dispatch: resolve a batch of model-requested tool calls against the
//! registry and execute them, concurrently or sequentially.
//!
//! Tool-level failures (undecodable arguments, a failing tool) are captured
//! as error [`ToolResult`]s so the model always receives a reply for every
//! call it made. Faults in the surrounding machinery — a lifecycle hook
//! failing mid-invocation — are a different class: they abort the batch, but
//! only after every task has finished, and the completed sibling results are
//! carried on the error instead of being discarded.

use std::{fmt, sync::Arc};

use {
    serde::Deserialize,
    serde_json::Value,
    tracing::{info, warn},
};

use {
    converge_common::hooks::{HookPayload, HookRegistry},
    converge_history::ToolCall,
};

use crate::tool_registry::ToolRegistry;

/// How a batch of tool calls is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Fan-out/fan-in: all invocations run as independent tasks, results are
    /// collected in the original request order.
    Concurrent,
    /// One invocation at a time, in request order.
    Sequential,
}

/// What to do with a tool call naming an unregistered tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownToolPolicy {
    /// Produce an `unknown tool` error result, so the model gets a reply for
    /// every call it issued.
    #[default]
    Report,
    /// Drop the call silently (no result). Matches historic behavior; leaves
    /// the model without a reply for that call on the next round.
    Skip,
}

/// Outcome of one tool invocation. Exactly one per dispatched request.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub tool_name: String,
    /// The tool's return value on success, or `{"error": "..."}` on failure.
    pub value: Value,
    pub success: bool,
}

impl ToolResult {
    fn ok(call: &ToolCall, value: Value) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            value,
            success: true,
        }
    }

    fn error(call: &ToolCall, message: impl Into<String>) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            value: serde_json::json!({ "error": message.into() }),
            success: false,
        }
    }

    /// The stringified value fed back to the model as the `tool` message
    /// content. Bare string values are passed through unquoted.
    #[must_use]
    pub fn content(&self) -> String {
        match &self.value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// One or more dispatcher faults, carrying the work that still completed.
///
/// A fault here is never a tool-level failure (those become error
/// [`ToolResult`]s); it is a failure in the dispatch machinery itself, such
/// as a lifecycle hook erroring mid-invocation. All tasks run to completion
/// before this is raised, and `completed` holds their results in request
/// order so the caller can salvage them.
#[derive(Debug)]
pub struct DispatchError {
    pub completed: Vec<ToolResult>,
    pub faults: Vec<anyhow::Error>,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.faults.first() {
            Some(first) => write!(
                f,
                "tool dispatch raised {} fault(s); first: {first}",
                self.faults.len()
            ),
            None => write!(f, "tool dispatch fault"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Executes batches of tool calls for one agent.
pub struct ToolDispatcher<'a> {
    registry: &'a ToolRegistry,
    hooks: Arc<HookRegistry>,
    session_key: String,
    /// Fixed contextual fields merged into every call's arguments.
    tool_context: Option<Value>,
    unknown_tools: UnknownToolPolicy,
}

impl<'a> ToolDispatcher<'a> {
    pub fn new(
        registry: &'a ToolRegistry,
        hooks: Arc<HookRegistry>,
        session_key: String,
        tool_context: Option<Value>,
        unknown_tools: UnknownToolPolicy,
    ) -> Self {
        Self {
            registry,
            hooks,
            session_key,
            tool_context,
            unknown_tools,
        }
    }

    /// Execute a batch of tool calls, returning one result per resolved call
    /// in the original request order.
    pub async fn execute(
        &self,
        calls: &[ToolCall],
        mode: ExecutionMode,
    ) -> Result<Vec<ToolResult>, DispatchError> {
        let outcomes = match mode {
            ExecutionMode::Concurrent => {
                let tasks: Vec<_> = calls.iter().map(|call| self.invoke(call)).collect();
                futures::future::join_all(tasks).await
            },
            ExecutionMode::Sequential => {
                let mut outcomes = Vec::with_capacity(calls.len());
                for call in calls {
                    outcomes.push(self.invoke(call).await);
                }
                outcomes
            },
        };

        let mut completed = Vec::with_capacity(outcomes.len());
        let mut faults = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(Some(result)) => completed.push(result),
                Ok(None) => {},
                Err(fault) => faults.push(fault),
            }
        }
        if faults.is_empty() {
            Ok(completed)
        } else {
            Err(DispatchError { completed, faults })
        }
    }

    /// Run one tool call through its full lifecycle.
    ///
    /// `Ok(None)` means the call was skipped (unregistered tool under the
    /// `Skip` policy). `Err` is a dispatcher fault from hook dispatch, not a
    /// tool failure.
    async fn invoke(&self, call: &ToolCall) -> anyhow::Result<Option<ToolResult>> {
        let Some(tool) = self.registry.get(&call.name) else {
            warn!(tool = %call.name, id = %call.id, policy = ?self.unknown_tools, "call to unregistered tool");
            return Ok(match self.unknown_tools {
                UnknownToolPolicy::Skip => None,
                UnknownToolPolicy::Report => Some(ToolResult::error(
                    call,
                    format!("unknown tool: {}", call.name),
                )),
            });
        };

        self.hooks
            .dispatch(&HookPayload::FunctionCallStart {
                session_key: self.session_key.clone(),
                tool_name: call.name.clone(),
                arguments: call.arguments.clone(),
            })
            .await?;

        let mut args = match decode_arguments(&call.arguments) {
            Ok(args) => args,
            Err(reason) => {
                warn!(tool = %call.name, id = %call.id, error = %reason, "tool argument decode failed");
                self.hooks
                    .dispatch(&HookPayload::FunctionCallError {
                        session_key: self.session_key.clone(),
                        tool_name: call.name.clone(),
                        error: reason.clone(),
                    })
                    .await?;
                return Ok(Some(ToolResult::error(call, reason)));
            },
        };

        if let Some(ctx) = self.tool_context.as_ref().and_then(Value::as_object)
            && let Some(args_obj) = args.as_object_mut()
        {
            for (k, v) in ctx {
                args_obj.insert(k.clone(), v.clone());
            }
        }

        info!(tool = %call.name, id = %call.id, "executing tool");
        match tool.execute(args).await {
            Ok(value) => {
                self.hooks
                    .dispatch(&HookPayload::FunctionCallEnd {
                        session_key: self.session_key.clone(),
                        tool_name: call.name.clone(),
                        result: value.clone(),
                    })
                    .await?;
                Ok(Some(ToolResult::ok(call, value)))
            },
            Err(e) => {
                let err_str = e.to_string();
                warn!(tool = %call.name, id = %call.id, error = %err_str, "tool execution failed");
                self.hooks
                    .dispatch(&HookPayload::FunctionCallError {
                        session_key: self.session_key.clone(),
                        tool_name: call.name.clone(),
                        error: err_str.clone(),
                    })
                    .await?;
                Ok(Some(ToolResult::error(call, err_str)))
            },
        }
    }
}

/// Decode a tool call's raw arguments into a JSON object.
///
/// Accepts an already-structured object or a string-encoded JSON object;
/// anything else is an argument-decode failure, captured by the caller as an
/// error result.
fn decode_arguments(raw: &Value) -> Result<Value, String> {
    match raw {
        Value::Object(_) => Ok(raw.clone()),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(parsed) if parsed.is_object() => Ok(parsed),
            Ok(_) => Err(format!("tool arguments must decode to an object: {s}")),
            Err(e) => Err(format!("unparseable tool arguments: {e}")),
        },
        other => Err(format!("unsupported tool argument shape: {other}")),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use {anyhow::Result, async_trait::async_trait};

    use {
        converge_common::hooks::{HookEvent, HookHandler},
        converge_history::ToolCall,
    };

    use {super::*, crate::tool_registry::AgentTool};

    struct EchoTool;

    #[async_trait]
    impl AgentTool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            "echoes its arguments"
        }

        fn parameters_schema(&self) -> Value {
            serde_json::json!({"type": "object"})
        }

        async fn execute(&self, params: Value) -> Result<Value> {
            Ok(params)
        }
    }

    /// Sleeps before answering, to shuffle completion order under fan-out.
    struct SlowTool;

    #[async_trait]
    impl AgentTool for SlowTool {
        fn name(&self) -> &str {
            "slow"
        }

        fn description(&self) -> &str {
            "answers after a delay"
        }

        fn parameters_schema(&self) -> Value {
            serde_json::json!({"type": "object"})
        }

        async fn execute(&self, _params: Value) -> Result<Value> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(serde_json::json!("slow done"))
        }
    }

    struct FailingTool;

    #[async_trait]
    impl AgentTool for FailingTool {
        fn name(&self) -> &str {
            "broken"
        }

        fn description(&self) -> &str {
            "always fails"
        }

        fn parameters_schema(&self) -> Value {
            serde_json::json!({"type": "object"})
        }

        async fn execute(&self, _params: Value) -> Result<Value> {
            anyhow::bail!("tool exploded")
        }
    }

    /// Fails hook dispatch for one tool's end event.
    struct FailOnEndHandler {
        target: String,
    }

    #[async_trait]
    impl HookHandler for FailOnEndHandler {
        fn name(&self) -> &str {
            "fail-on-end"
        }

        fn events(&self) -> &[HookEvent] {
            &[HookEvent::FunctionCallEnd]
        }

        async fn handle(&self, _event: HookEvent, payload: &HookPayload) -> Result<()> {
            if let HookPayload::FunctionCallEnd { tool_name, .. } = payload
                && *tool_name == self.target
            {
                anyhow::bail!("hook rejected {tool_name}")
            }
            Ok(())
        }
    }

    /// Records every function-call lifecycle event it sees.
    struct EventLogHandler {
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl HookHandler for EventLogHandler {
        fn name(&self) -> &str {
            "event-log"
        }

        fn events(&self) -> &[HookEvent] {
            &[
                HookEvent::FunctionCallStart,
                HookEvent::FunctionCallEnd,
                HookEvent::FunctionCallError,
            ]
        }

        async fn handle(&self, event: HookEvent, _payload: &HookPayload) -> Result<()> {
            self.log.lock().unwrap().push(event.name().to_string());
            Ok(())
        }
    }

    fn registry() -> ToolRegistry {
        let mut registry = ToolRegistry::new();
        registry.register(Box::new(EchoTool));
        registry.register(Box::new(SlowTool));
        registry.register(Box::new(FailingTool));
        registry
    }

    fn dispatcher<'a>(
        registry: &'a ToolRegistry,
        hooks: Arc<HookRegistry>,
        policy: UnknownToolPolicy,
    ) -> ToolDispatcher<'a> {
        ToolDispatcher::new(registry, hooks, "test".into(), None, policy)
    }

    fn call(id: &str, name: &str, args: Value) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: name.into(),
            arguments: args,
        }
    }

    #[tokio::test]
    async fn concurrent_results_keep_request_order() {
        let registry = registry();
        let d = dispatcher(&registry, Arc::new(HookRegistry::new()), Default::default());
        // The slow tool comes first in request order but finishes last.
        let calls = vec![
            call("call_1", "slow", serde_json::json!({})),
            call("call_2", "echo", serde_json::json!({"n": 1})),
        ];

        let results = d.execute(&calls, ExecutionMode::Concurrent).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].tool_call_id, "call_1");
        assert_eq!(results[0].content(), "slow done");
        assert_eq!(results[1].tool_call_id, "call_2");
        assert_eq!(results[1].value["n"], 1);
    }

    #[tokio::test]
    async fn concurrent_and_sequential_agree() {
        let registry = registry();
        let d = dispatcher(&registry, Arc::new(HookRegistry::new()), Default::default());
        let calls = vec![
            call("call_1", "slow", serde_json::json!({})),
            call("call_2", "echo", serde_json::json!({"x": "y"})),
            call("call_3", "broken", serde_json::json!({})),
        ];

        let concurrent = d.execute(&calls, ExecutionMode::Concurrent).await.unwrap();
        let sequential = d.execute(&calls, ExecutionMode::Sequential).await.unwrap();
        assert_eq!(concurrent, sequential);
    }

    #[tokio::test]
    async fn tool_failure_becomes_result_and_batch_continues() {
        let registry = registry();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = HookRegistry::new();
        hooks.register(Arc::new(EventLogHandler {
            log: Arc::clone(&log),
        }));
        let d = dispatcher(&registry, Arc::new(hooks), Default::default());
        let calls = vec![
            call("call_1", "broken", serde_json::json!({})),
            call("call_2", "echo", serde_json::json!({"ok": true})),
        ];

        let results = d.execute(&calls, ExecutionMode::Sequential).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(!results[0].success);
        assert_eq!(results[0].value["error"], "tool exploded");
        assert!(results[1].success);
        assert_eq!(*log.lock().unwrap(), vec![
            "on_function_call_start",
            "on_function_call_error",
            "on_function_call_start",
            "on_function_call_end",
        ]);
    }

    #[tokio::test]
    async fn string_arguments_are_decoded() {
        let registry = registry();
        let d = dispatcher(&registry, Arc::new(HookRegistry::new()), Default::default());
        let calls = vec![call(
            "call_1",
            "echo",
            serde_json::json!("{\"city\": \"Tokyo\"}"),
        )];

        let results = d.execute(&calls, ExecutionMode::Sequential).await.unwrap();
        assert!(results[0].success);
        assert_eq!(results[0].value["city"], "Tokyo");
    }

    #[tokio::test]
    async fn undecodable_arguments_become_error_result() {
        let registry = registry();
        let d = dispatcher(&registry, Arc::new(HookRegistry::new()), Default::default());
        let calls = vec![
            call("call_1", "echo", serde_json::json!("not json at all")),
            call("call_2", "echo", serde_json::json!({"fine": 1})),
        ];

        let results = d.execute(&calls, ExecutionMode::Concurrent).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(!results[0].success);
        assert!(
            results[0].value["error"]
                .as_str()
                .unwrap()
                .contains("unparseable tool arguments")
        );
        assert!(results[1].success);
    }

    #[tokio::test]
    async fn unknown_tool_report_policy_produces_error_result() {
        let registry = registry();
        let d = dispatcher(
            &registry,
            Arc::new(HookRegistry::new()),
            UnknownToolPolicy::Report,
        );
        let calls = vec![call("call_1", "nonexistent", serde_json::json!({}))];

        let results = d.execute(&calls, ExecutionMode::Sequential).await.unwrap();
        assert_eq!(results.len(), 1);
        assert!(!results[0].success);
        assert_eq!(results[0].value["error"], "unknown tool: nonexistent");
    }

    #[tokio::test]
    async fn unknown_tool_skip_policy_drops_the_call() {
        let registry = registry();
        let d = dispatcher(
            &registry,
            Arc::new(HookRegistry::new()),
            UnknownToolPolicy::Skip,
        );
        let calls = vec![
            call("call_1", "nonexistent", serde_json::json!({})),
            call("call_2", "echo", serde_json::json!({})),
        ];

        let results = d.execute(&calls, ExecutionMode::Concurrent).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].tool_call_id, "call_2");
    }

    #[tokio::test]
    async fn hook_fault_carries_completed_sibling_results() {
        let registry = registry();
        let mut hooks = HookRegistry::new();
        hooks.register(Arc::new(FailOnEndHandler {
            target: "slow".into(),
        }));
        let d = dispatcher(&registry, Arc::new(hooks), Default::default());
        let calls = vec![
            call("call_1", "echo", serde_json::json!({"keep": "me"})),
            call("call_2", "slow", serde_json::json!({})),
        ];

        let err = d
            .execute(&calls, ExecutionMode::Concurrent)
            .await
            .unwrap_err();
        assert_eq!(err.faults.len(), 1);
        assert!(err.faults[0].to_string().contains("hook rejected slow"));
        // The sibling that completed is salvageable.
        assert_eq!(err.completed.len(), 1);
        assert_eq!(err.completed[0].tool_call_id, "call_1");
        assert!(err.to_string().contains("1 fault(s)"));
    }

    #[tokio::test]
    async fn context_fields_are_merged_into_arguments() {
        let registry = registry();
        let d = ToolDispatcher::new(
            &registry,
            Arc::new(HookRegistry::new()),
            "sess-1".into(),
            Some(serde_json::json!({"_session_key": "sess-1", "_caller": "tests"})),
            Default::default(),
        );
        let calls = vec![call("call_1", "echo", serde_json::json!({"own": 1}))];

        let results = d.execute(&calls, ExecutionMode::Sequential).await.unwrap();
        assert_eq!(results[0].value["own"], 1);
        assert_eq!(results[0].value["_session_key"], "sess-1");
        assert_eq!(results[0].value["_caller"], "tests");
    }

    #[test]
    fn result_content_unquotes_bare_strings() {
        let call = call("call_1", "echo", serde_json::json!({}));
        let string_result = ToolResult::ok(&call, serde_json::json!("14:02:11"));
        assert_eq!(string_result.content(), "14:02:11");

        let object_result = ToolResult::ok(&call, serde_json::json!({"temp": 22}));
        assert_eq!(object_result.content(), "{\"temp\":22}");
    }
}
