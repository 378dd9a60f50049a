// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
/// End-to-end tests for the agentic loop.
///
/// Uses the scripted mock provider so every scenario is deterministic and
/// requires no network access.
#[cfg(test)]
mod loop_tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::{json, Map, Value};
    use tokio_util::sync::CancellationToken;

    use freja_config::{CheckpointFrequency, Config};
    use freja_events::{
        AgentEvent, EventBus, PermissionScope, PolicyDecision, RememberPolicy,
    };
    use freja_model::{mock::ScriptedProvider, ContentPart, Message, Role};
    use freja_session::{
        AgentLoopState, CheckpointSource, ExecutionCheckpoint, MemorySessionStore, PendingWrites,
        Session, SessionStore,
    };
    use freja_tools::{AiFunction, AiFunctionContext, ToolError, ToolOptions, ToolRegistry};

    use crate::{middlewares, Agent, AgentError};

    // ── Helpers ───────────────────────────────────────────────────────────────

    struct EchoTool {
        name: &'static str,
        calls: Arc<AtomicU32>,
        delay_ms: u64,
    }

    #[async_trait]
    impl AiFunction for EchoTool {
        fn name(&self) -> &str {
            self.name
        }
        fn description(&self) -> &str {
            "echoes args back"
        }
        fn json_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        async fn invoke(
            &self,
            args: &Map<String, Value>,
            _ctx: &AiFunctionContext,
        ) -> Result<Value, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            }
            Ok(Value::Object(args.clone()))
        }
    }

    struct GuardedTool {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl AiFunction for GuardedTool {
        fn name(&self) -> &str {
            "write_file"
        }
        fn description(&self) -> &str {
            "writes a file"
        }
        fn json_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn options(&self) -> ToolOptions {
            ToolOptions { requires_permission: true, ..Default::default() }
        }
        async fn invoke(
            &self,
            _args: &Map<String, Value>,
            _ctx: &AiFunctionContext,
        ) -> Result<Value, ToolError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!("written"))
        }
    }

    fn config() -> Config {
        let mut c = Config::default();
        // Keep prompt timeouts short so negative-path tests stay fast.
        c.middleware.permission.timeout = "200ms".into();
        c.middleware.continuation.timeout = "200ms".into();
        c.middleware.retry.base_delay = "1ms".into();
        c
    }

    fn agent(model: ScriptedProvider, registry: ToolRegistry, config: Config) -> Agent {
        let pipeline = middlewares::standard_pipeline(&config);
        Agent::new(
            Arc::new(model),
            Arc::new(registry),
            pipeline,
            Arc::new(config),
            EventBus::new(),
        )
    }

    fn args(v: i64) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("v".into(), json!(v));
        m
    }

    /// Drain every event emitted so far without blocking.
    async fn drain(
        stream: &mut tokio_stream::wrappers::UnboundedReceiverStream<AgentEvent>,
    ) -> Vec<AgentEvent> {
        let mut events = Vec::new();
        while let Ok(Some(e)) = tokio::time::timeout(Duration::from_millis(30), stream.next()).await
        {
            events.push(e);
        }
        events
    }

    fn respond_to_permissions(bus: &EventBus, approve: bool, remember: Option<RememberPolicy>) {
        let mut stream = bus.subscribe();
        let bus = bus.clone();
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                if let AgentEvent::PermissionRequest { correlation_id, function_name, .. } = event {
                    let response = if approve {
                        AgentEvent::PermissionApproved {
                            correlation_id: correlation_id.clone(),
                            function_name,
                            remember,
                        }
                    } else {
                        AgentEvent::PermissionDenied {
                            correlation_id: correlation_id.clone(),
                            function_name,
                            reason: freja_events::DenialReason::Response,
                        }
                    };
                    bus.send_response(&correlation_id, response);
                }
            }
        });
    }

    fn respond_to_continuations(bus: &EventBus, approve: bool, extend_by: u32) {
        let mut stream = bus.subscribe();
        let bus = bus.clone();
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                if let AgentEvent::ContinuationRequest { correlation_id, .. } = event {
                    bus.send_response(
                        &correlation_id.clone(),
                        AgentEvent::ContinuationResponse { correlation_id, approved: approve, extend_by },
                    );
                }
            }
        });
    }

    // ── Scenario: single iteration, no tools ─────────────────────────────────

    #[tokio::test]
    async fn single_iteration_no_tools() {
        let model = ScriptedProvider::new();
        model.push_text("hello");
        let agent = agent(model, ToolRegistry::new(), config());
        let mut stream = agent.bus().subscribe();

        let mut session = Session::new();
        let report = agent
            .submit(&mut session, Message::user("hi"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.final_text, "hello");
        assert_eq!(report.iterations, 1);

        // Session messages equal [user("hi"), assistant("hello")].
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].role, Role::User);
        assert_eq!(session.messages[0].text(), "hi");
        assert_eq!(session.messages[1].role, Role::Assistant);
        assert_eq!(session.messages[1].text(), "hello");
        assert!(session.execution_state.is_none());

        // Event order: started → iteration → delta → finished.
        let events = drain(&mut stream).await;
        let pos = |pred: &dyn Fn(&AgentEvent) -> bool| events.iter().position(|e| pred(e));
        let started = pos(&|e| matches!(e, AgentEvent::MessageTurnStarted { .. })).unwrap();
        let iter = pos(&|e| matches!(e, AgentEvent::IterationStart { iteration: 0 })).unwrap();
        let delta =
            pos(&|e| matches!(e, AgentEvent::TextDelta { delta } if delta == "hello")).unwrap();
        let finished = pos(&|e| matches!(e, AgentEvent::MessageTurnFinished { .. })).unwrap();
        assert!(started < iter && iter < delta && delta < finished);
    }

    // ── Tool rounds ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn tool_round_appends_calls_then_results() {
        let model = ScriptedProvider::new();
        model.push_tool_calls(vec![("c1", "echo", args(1))]);
        model.push_text("all done");

        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool { name: "echo", calls: Arc::clone(&calls), delay_ms: 0 });

        let agent = agent(model, registry, config());
        let mut session = Session::new();
        let report = agent
            .submit(&mut session, Message::user("go"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.final_text, "all done");
        assert_eq!(report.iterations, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // [user, assistant(call), tool(result), assistant(text)]
        assert_eq!(session.messages.len(), 4);
        assert!(session.messages[1].has_function_calls());
        assert_eq!(session.messages[2].role, Role::Tool);
        assert!(session.results_are_correlated());
    }

    #[tokio::test]
    async fn parallel_tool_calls_preserve_call_id_order() {
        let model = ScriptedProvider::new();
        model.push_tool_calls(vec![("c1", "slow", args(1)), ("c2", "fast", args(2))]);
        model.push_text("done");

        let mut registry = ToolRegistry::new();
        registry.register(EchoTool { name: "slow", calls: Default::default(), delay_ms: 40 });
        registry.register(EchoTool { name: "fast", calls: Default::default(), delay_ms: 1 });

        let agent = agent(model, registry, config());
        let mut session = Session::new();
        agent.submit(&mut session, Message::user("go"), CancellationToken::new()).await.unwrap();

        let tool_msg = &session.messages[2];
        let ids: Vec<&str> = tool_msg
            .contents
            .iter()
            .filter_map(|p| match p {
                ContentPart::FunctionResult { call_id, .. } => Some(call_id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec!["c1", "c2"]);
    }

    // ── Scenario: permission ask → approve with memory ───────────────────────

    #[tokio::test]
    async fn permission_approval_remembers_conversation_policy() {
        let model = ScriptedProvider::new();
        model.push_tool_calls(vec![("c1", "write_file", args(1))]);
        model.push_text("first done");
        model.push_tool_calls(vec![("c2", "write_file", args(2))]);
        model.push_text("second done");

        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(GuardedTool { calls: Arc::clone(&calls) });

        let agent = agent(model, registry, config());
        respond_to_permissions(
            agent.bus(),
            true,
            Some(RememberPolicy {
                decision: PolicyDecision::AlwaysAllow,
                scope: PermissionScope::Conversation,
            }),
        );
        let mut stream = agent.bus().subscribe();

        let mut session = Session::new();
        agent
            .submit(&mut session, Message::user("write it"), CancellationToken::new())
            .await
            .unwrap();
        let first_turn = drain(&mut stream).await;
        let first_requests = first_turn
            .iter()
            .filter(|e| matches!(e, AgentEvent::PermissionRequest { .. }))
            .count();
        assert_eq!(first_requests, 1);
        assert!(first_turn.iter().any(|e| matches!(e, AgentEvent::PermissionApproved { .. })));

        // Second turn: stored AlwaysAllow, no prompt.
        agent
            .submit(&mut session, Message::user("write again"), CancellationToken::new())
            .await
            .unwrap();
        let second_turn = drain(&mut stream).await;
        assert!(
            !second_turn.iter().any(|e| matches!(e, AgentEvent::PermissionRequest { .. })),
            "stored policy must suppress the prompt"
        );
        assert!(second_turn.iter().any(|e| matches!(
            e,
            AgentEvent::PermissionCheck { decision: PolicyDecision::AlwaysAllow, .. }
        )));
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // The policy round-trips through the session's persistent state.
        let stored = session.persistent_state.get("permissions").unwrap();
        let store: freja_tools::PolicyStore =
            serde_json::from_value(stored.value.clone()).unwrap();
        assert_eq!(
            store.lookup("write_file", &session.id, "."),
            Some((PolicyDecision::AlwaysAllow, PermissionScope::Conversation))
        );
    }

    #[tokio::test]
    async fn permission_denial_ends_turn_with_denial_message() {
        let model = ScriptedProvider::new();
        model.push_tool_calls(vec![("c1", "write_file", args(1))]);
        model.push_text("never reached");

        let calls = Arc::new(AtomicU32::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(GuardedTool { calls: Arc::clone(&calls) });

        let agent = agent(model, registry, config());
        respond_to_permissions(agent.bus(), false, None);

        let mut session = Session::new();
        let report = agent
            .submit(&mut session, Message::user("write it"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 0, "denied tool must not run");
        assert!(report.final_text.contains("Stopping here"));
        // The model script for the follow-up text was never consumed.
        let last = session.messages.last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert!(last.text().contains("permission denied"));
    }

    // ── Scenario: continuation at the iteration cap ──────────────────────────

    #[tokio::test]
    async fn continuation_approval_extends_the_cap() {
        let model = ScriptedProvider::new();
        model.push_tool_calls(vec![("c1", "echo", args(1))]);
        model.push_text("finished after extension");

        let mut registry = ToolRegistry::new();
        registry.register(EchoTool { name: "echo", calls: Default::default(), delay_ms: 0 });

        let mut cfg = config();
        cfg.agent.max_iterations = 1;
        let agent = agent(model, registry, cfg);
        respond_to_continuations(agent.bus(), true, 3);
        let mut stream = agent.bus().subscribe();

        let mut session = Session::new();
        let report = agent
            .submit(&mut session, Message::user("go"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.final_text, "finished after extension");
        let events = drain(&mut stream).await;
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::ContinuationRequest { requested_iteration: 2, max_iterations: 1, .. }
        )));
    }

    #[tokio::test]
    async fn continuation_denial_stops_gracefully() {
        let model = ScriptedProvider::new();
        model.push_tool_calls(vec![("c1", "echo", args(1))]);
        model.push_text("never consumed");

        let mut registry = ToolRegistry::new();
        registry.register(EchoTool { name: "echo", calls: Default::default(), delay_ms: 0 });

        let mut cfg = config();
        cfg.agent.max_iterations = 1;
        let agent = agent(model, registry, cfg);
        respond_to_continuations(agent.bus(), false, 0);

        let mut session = Session::new();
        let report = agent
            .submit(&mut session, Message::user("go"), CancellationToken::new())
            .await
            .unwrap();
        assert!(report.final_text.contains("iteration limit"));
        assert_eq!(session.messages.last().unwrap().role, Role::Assistant);
    }

    // ── Boundary: max_iterations = 0 ─────────────────────────────────────────

    #[tokio::test]
    async fn zero_max_iterations_makes_no_model_call() {
        let model = ScriptedProvider::new();
        model.push_text("must not be consumed");
        let mut cfg = config();
        cfg.agent.max_iterations = 0;
        let agent = agent(model, ToolRegistry::new(), cfg);
        let mut session = Session::new();
        let report = agent
            .submit(&mut session, Message::user("hi"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.iterations, 0, "no model call may happen");
        assert_eq!(report.final_text, "");
        // Only the user message; no assistant message, no error.
        assert_eq!(session.messages.len(), 1);
        assert_eq!(session.messages[0].role, Role::User);
    }

    // ── Turn lock ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn second_turn_on_same_branch_is_rejected() {
        let model = ScriptedProvider::new();
        model.push_tool_calls(vec![("c1", "slow", args(1))]);
        model.push_text("done");

        let mut registry = ToolRegistry::new();
        registry.register(EchoTool { name: "slow", calls: Default::default(), delay_ms: 150 });

        let agent = Arc::new(agent(model, registry, config()));
        let mut session_a = Session::with_id("shared");
        let mut session_b = Session::with_id("shared");

        let racer = Arc::clone(&agent);
        let first = tokio::spawn(async move {
            racer.submit(&mut session_a, Message::user("go"), CancellationToken::new()).await
        });
        tokio::time::sleep(Duration::from_millis(40)).await;

        let err = agent
            .submit(&mut session_b, Message::user("also go"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::TurnInProgress { .. }));
        first.await.unwrap().unwrap();
    }

    // ── Persistence ──────────────────────────────────────────────────────────

    #[tokio::test]
    async fn auto_save_round_trips_the_session() {
        let model = ScriptedProvider::new();
        model.push_text("saved reply");
        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let cfg = config();
        let agent = agent(model, ToolRegistry::new(), cfg).with_store(Arc::clone(&store));

        let mut session = Session::new();
        agent.submit(&mut session, Message::user("hi"), CancellationToken::new()).await.unwrap();

        let loaded = store.load_session(&session.id).await.unwrap();
        assert_eq!(loaded.messages, session.messages);
        assert_eq!(loaded.persistent_state, session.persistent_state);
    }

    #[tokio::test]
    async fn per_iteration_checkpoints_are_pruned_after_the_turn() {
        let model = ScriptedProvider::new();
        model.push_tool_calls(vec![("c1", "echo", args(1))]);
        model.push_text("done");

        let mut registry = ToolRegistry::new();
        registry.register(EchoTool { name: "echo", calls: Default::default(), delay_ms: 0 });

        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        let mut cfg = config();
        cfg.agent.checkpoint_frequency = CheckpointFrequency::PerIteration;
        cfg.store.keep_latest_checkpoints = 1;
        let agent = agent(model, registry, cfg).with_store(Arc::clone(&store));

        let mut session = Session::new();
        agent.submit(&mut session, Message::user("go"), CancellationToken::new()).await.unwrap();

        let manifest = store.checkpoint_manifest(&session.id).await.unwrap();
        assert_eq!(manifest.len(), 1, "retention keeps only the newest checkpoint");
        assert_eq!(manifest[0].source, CheckpointSource::PerIteration);
    }

    // ── Scenario: crash recovery on parallel tools ───────────────────────────

    #[tokio::test]
    async fn resume_skips_calls_covered_by_pending_writes() {
        // Simulated crash state: the model had requested A and B; A's result
        // reached the pending-writes record, B never completed.
        let session_id = "recovering";
        let mut session = Session::with_id(session_id);
        session.push(Message::user("run both"));
        session.push(Message::new(
            Role::Assistant,
            vec![
                ContentPart::function_call("call_a", "tool_a", args(1)),
                ContentPart::function_call("call_b", "tool_b", args(2)),
            ],
        ));

        let mut state = AgentLoopState::new(5);
        state.current_messages = session.messages.clone();
        state.operation_metadata.had_function_calls = true;
        let checkpoint = ExecutionCheckpoint::new(
            session_id,
            None,
            1,
            CheckpointSource::PerIteration,
            state,
        );

        let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
        store.save_checkpoint(&checkpoint).await.unwrap();
        let mut writes = PendingWrites::new(session_id, checkpoint.checkpoint_id.clone());
        writes.record("call_a", json!("ok"));
        store.save_pending_writes(&writes).await.unwrap();

        // The manifest lists the iteration checkpoint and its pending writes.
        let manifest = store.checkpoint_manifest(session_id).await.unwrap();
        assert_eq!(manifest.len(), 1);
        let recovered = store
            .load_pending_writes(session_id, &checkpoint.checkpoint_id)
            .await
            .unwrap()
            .unwrap();
        assert!(recovered.covers("call_a"));
        assert!(!recovered.covers("call_b"));

        let a_calls = Arc::new(AtomicU32::new(0));
        let b_calls = Arc::new(AtomicU32::new(0));
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool { name: "tool_a", calls: Arc::clone(&a_calls), delay_ms: 0 });
        registry.register(EchoTool { name: "tool_b", calls: Arc::clone(&b_calls), delay_ms: 0 });

        let model = ScriptedProvider::new();
        model.push_text("recovered and finished");

        let mut cfg = config();
        cfg.agent.checkpoint_frequency = CheckpointFrequency::PerIteration;
        let agent = agent(model, registry, cfg).with_store(Arc::clone(&store));

        let loaded = store.load_checkpoint_latest(session_id).await.unwrap().unwrap();
        let report =
            agent.resume(&mut session, loaded, CancellationToken::new()).await.unwrap();

        assert_eq!(report.final_text, "recovered and finished");
        assert_eq!(a_calls.load(Ordering::SeqCst), 0, "A must not be re-invoked");
        assert_eq!(b_calls.load(Ordering::SeqCst), 1, "B must be re-invoked");

        // The aggregated tool message carries both results.
        let tool_msg = session.messages.iter().find(|m| m.role == Role::Tool).unwrap();
        let results: Vec<(&str, &Value)> = tool_msg
            .contents
            .iter()
            .filter_map(|p| match p {
                ContentPart::FunctionResult { call_id, value } => {
                    Some((call_id.as_str(), value))
                }
                _ => None,
            })
            .collect();
        assert_eq!(results[0], ("call_a", &json!("ok")));
        assert_eq!(results[1], ("call_b", &json!({ "v": 2 })));
        assert!(session.results_are_correlated());
    }

    // ── Reasoning handling ───────────────────────────────────────────────────

    #[tokio::test]
    async fn reasoning_streams_but_is_not_persisted_by_default() {
        use freja_model::{mock::Script, FinishReason, ResponseUpdate, Usage};
        let model = ScriptedProvider::new();
        model.push(Script::Updates(vec![
            ResponseUpdate::ReasoningStart,
            ResponseUpdate::ReasoningDelta("thinking...".into()),
            ResponseUpdate::ReasoningEnd { trace: None },
            ResponseUpdate::TextDelta("answer".into()),
            ResponseUpdate::Usage(Usage { input_tokens: 3, output_tokens: 4 }),
            ResponseUpdate::Finished(FinishReason::Stop),
        ]));

        let agent = agent(model, ToolRegistry::new(), config());
        let mut stream = agent.bus().subscribe();
        let mut session = Session::new();
        agent.submit(&mut session, Message::user("hi"), CancellationToken::new()).await.unwrap();

        let events = drain(&mut stream).await;
        assert!(events.iter().any(|e| matches!(e, AgentEvent::ReasoningMessageStart)));
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::ReasoningMessageDelta { delta } if delta == "thinking...")));
        assert!(events.iter().any(|e| matches!(e, AgentEvent::ReasoningMessageEnd)));

        let assistant = &session.messages[1];
        assert!(!assistant.contents.iter().any(|p| p.is_reasoning()));
        assert_eq!(assistant.text(), "answer");
    }

    #[tokio::test]
    async fn reasoning_is_persisted_when_configured() {
        use freja_model::{mock::Script, FinishReason, ResponseUpdate, Usage};
        let model = ScriptedProvider::new();
        model.push(Script::Updates(vec![
            ResponseUpdate::ReasoningStart,
            ResponseUpdate::ReasoningDelta("kept".into()),
            ResponseUpdate::ReasoningEnd { trace: None },
            ResponseUpdate::TextDelta("answer".into()),
            ResponseUpdate::Usage(Usage { input_tokens: 1, output_tokens: 1 }),
            ResponseUpdate::Finished(FinishReason::Stop),
        ]));

        let mut cfg = config();
        cfg.agent.preserve_reasoning_in_history = true;
        let agent = agent(model, ToolRegistry::new(), cfg);
        let mut session = Session::new();
        agent.submit(&mut session, Message::user("hi"), CancellationToken::new()).await.unwrap();

        let assistant = &session.messages[1];
        assert!(assistant.contents.iter().any(|p| p.is_reasoning()));
    }

    // ── Usage attribution ────────────────────────────────────────────────────

    #[tokio::test]
    async fn usage_lands_on_user_and_assistant_messages() {
        let model = ScriptedProvider::new();
        model.push_text("short reply");
        let agent = agent(model, ToolRegistry::new(), config());
        let mut session = Session::new();
        let report = agent
            .submit(&mut session, Message::user("hi"), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(session.messages[0].input_tokens, Some(report.usage.input_tokens));
        assert_eq!(session.messages[1].output_tokens, Some(report.usage.output_tokens));
    }

    #[tokio::test]
    async fn textless_turn_routes_output_tokens_to_the_last_assistant_message() {
        use freja_model::{mock::Script, FinishReason, ResponseUpdate};
        // Two iterations of pure function calls, then a bare stop: every
        // assistant message in the turn has zero text length.
        let model = ScriptedProvider::new();
        model.push_tool_calls(vec![("c1", "echo", args(1))]);
        model.push_tool_calls(vec![("c2", "echo", args(2))]);
        model.push(Script::Updates(vec![ResponseUpdate::Finished(FinishReason::Stop)]));

        let mut registry = ToolRegistry::new();
        registry.register(EchoTool { name: "echo", calls: Default::default(), delay_ms: 0 });

        let agent = agent(model, registry, config());
        let mut session = Session::new();
        let report = agent
            .submit(&mut session, Message::user("go"), CancellationToken::new())
            .await
            .unwrap();

        // [user, assistant(calls), tool, assistant(calls), tool]
        assert_eq!(session.messages.len(), 5);
        assert_eq!(session.messages[1].text_len(), 0);
        assert_eq!(session.messages[3].text_len(), 0);

        // With no text to apportion by, the last assistant message receives
        // the full amount; the earlier one gets an explicit zero.
        assert_eq!(session.messages[1].output_tokens, Some(0));
        assert_eq!(session.messages[3].output_tokens, Some(report.usage.output_tokens));
        assert!(report.usage.output_tokens > 0);
        assert_eq!(session.messages[0].input_tokens, Some(report.usage.input_tokens));
    }

    // ── Cancellation ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn pre_canceled_turn_errors_with_canceled() {
        let model = ScriptedProvider::new();
        model.push_text("never consumed");
        let agent = agent(model, ToolRegistry::new(), config());
        let mut stream = agent.bus().subscribe();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut session = Session::new();
        let err = agent.submit(&mut session, Message::user("hi"), cancel).await.unwrap_err();
        assert!(matches!(err, AgentError::Canceled));

        let events = drain(&mut stream).await;
        assert!(events.iter().any(|e| matches!(
            e,
            AgentEvent::MessageTurnError { code: freja_events::ErrorCode::Canceled, .. }
        )));
        // The session is not corrupted: user message appended, no dangling
        // execution state.
        assert_eq!(session.messages.len(), 1);
        assert!(session.execution_state.is_none());
    }
}
