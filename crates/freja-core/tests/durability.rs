// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Durable-execution tests against the file-backed session store: snapshots,
//! per-iteration checkpoints, and crash recovery through pending writes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use freja_config::{CheckpointFrequency, Config};
use freja_core::{middlewares, Agent};
use freja_events::EventBus;
use freja_model::{mock::ScriptedProvider, ContentPart, Message, Role};
use freja_session::{
    AgentLoopState, CheckpointSource, ExecutionCheckpoint, FileSessionStore, PendingWrites,
    Session, SessionStore,
};
use freja_tools::{AiFunction, AiFunctionContext, ToolError, ToolRegistry};

struct CountingTool {
    name: &'static str,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl AiFunction for CountingTool {
    fn name(&self) -> &str {
        self.name
    }
    fn description(&self) -> &str {
        "counts invocations"
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
        Ok(Value::Object(args.clone()))
    }
}

fn durable_config() -> Config {
    let mut config = Config::default();
    config.agent.checkpoint_frequency = CheckpointFrequency::PerIteration;
    config.middleware.retry.base_delay = "1ms".into();
    config
}

fn durable_agent(
    model: ScriptedProvider,
    registry: ToolRegistry,
    store: Arc<dyn SessionStore>,
    config: Config,
) -> Agent {
    let pipeline = middlewares::standard_pipeline(&config);
    Agent::new(
        Arc::new(model),
        Arc::new(registry),
        pipeline,
        Arc::new(config),
        EventBus::new(),
    )
    .with_store(store)
}

fn args(v: i64) -> Map<String, Value> {
    let mut m = Map::new();
    m.insert("v".into(), json!(v));
    m
}

#[tokio::test]
async fn snapshot_survives_a_process_boundary() {
    let dir = tempfile::tempdir().unwrap();

    // First "process": run a turn and let auto-save write the snapshot.
    let session_id = {
        let store: Arc<dyn SessionStore> = Arc::new(FileSessionStore::new(dir.path()));
        let model = ScriptedProvider::new();
        model.push_text("persisted reply");
        let agent = durable_agent(model, ToolRegistry::new(), store, Config::default());
        let mut session = Session::new();
        agent
            .submit(&mut session, Message::user("remember this"), CancellationToken::new())
            .await
            .unwrap();
        session.id
    };

    // Second "process": a fresh store over the same directory sees the turn.
    let store = FileSessionStore::new(dir.path());
    let loaded = store.load_session(&session_id).await.unwrap();
    assert_eq!(loaded.messages.len(), 2);
    assert_eq!(loaded.messages[1].text(), "persisted reply");
}

#[tokio::test]
async fn per_iteration_run_leaves_a_checkpoint_chain() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn SessionStore> = Arc::new(FileSessionStore::new(dir.path()));

    let model = ScriptedProvider::new();
    model.push_tool_calls(vec![("c1", "count", args(1))]);
    model.push_tool_calls(vec![("c2", "count", args(2))]);
    model.push_text("done");

    let mut registry = ToolRegistry::new();
    registry.register(CountingTool { name: "count", calls: Default::default() });

    let mut config = durable_config();
    // Keep everything so the chain is inspectable.
    config.store.keep_latest_checkpoints = 16;
    let agent = durable_agent(model, registry, Arc::clone(&store), config);

    let mut session = Session::new();
    agent.submit(&mut session, Message::user("go"), CancellationToken::new()).await.unwrap();

    // Two tool rounds, each framed by a pre- and post-round checkpoint.
    let manifest = store.checkpoint_manifest(&session.id).await.unwrap();
    assert_eq!(manifest.len(), 4);
    let steps: Vec<u64> = manifest.iter().map(|e| e.step).collect();
    assert_eq!(steps, vec![4, 3, 2, 1]);

    // Parent links chain newest to oldest.
    assert_eq!(manifest[0].parent_checkpoint_id.as_ref(), Some(&manifest[1].checkpoint_id));

    // Pending writes were promoted; nothing is left behind.
    for entry in &manifest {
        assert!(store
            .load_pending_writes(&session.id, &entry.checkpoint_id)
            .await
            .unwrap()
            .is_none());
    }
}

#[tokio::test]
async fn crash_recovery_resumes_from_the_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn SessionStore> = Arc::new(FileSessionStore::new(dir.path()));
    let session_id = "crashed-session";

    // Fabricate the on-disk state a crash mid-round leaves behind: a session
    // snapshot from before the turn, an iteration checkpoint whose working
    // list ends in an assistant function-call message, and a pending write
    // covering the call that completed.
    {
        let mut before = Session::with_id(session_id);
        before.push(Message::user("earlier turn"));
        before.push(Message::assistant("earlier reply"));
        store.save_snapshot(&before).await.unwrap();

        let mut working = before.messages.clone();
        working.push(Message::user("run a and b"));
        working.push(Message::new(
            Role::Assistant,
            vec![
                ContentPart::function_call("call_a", "tool_a", args(1)),
                ContentPart::function_call("call_b", "tool_b", args(2)),
            ],
        ));
        let mut state = AgentLoopState::new(8);
        state.current_messages = working;
        state.operation_metadata.had_function_calls = true;
        let checkpoint = ExecutionCheckpoint::new(
            session_id,
            None,
            1,
            CheckpointSource::PerIteration,
            state,
        );
        store.save_checkpoint(&checkpoint).await.unwrap();

        let mut writes = PendingWrites::new(session_id, checkpoint.checkpoint_id.clone());
        writes.record("call_a", json!({ "v": 1 }));
        store.save_pending_writes(&writes).await.unwrap();
    }

    // Recovery is explicit: manifest, then checkpoint, then resume.
    let manifest = store.checkpoint_manifest(session_id).await.unwrap();
    assert_eq!(manifest.len(), 1);
    let checkpoint =
        store.load_checkpoint_at(session_id, &manifest[0].checkpoint_id).await.unwrap();

    let a_calls = Arc::new(AtomicU32::new(0));
    let b_calls = Arc::new(AtomicU32::new(0));
    let mut registry = ToolRegistry::new();
    registry.register(CountingTool { name: "tool_a", calls: Arc::clone(&a_calls) });
    registry.register(CountingTool { name: "tool_b", calls: Arc::clone(&b_calls) });

    let model = ScriptedProvider::new();
    model.push_text("both results in hand");

    let agent = durable_agent(model, registry, Arc::clone(&store), durable_config());
    let mut session = store.load_session(session_id).await.unwrap();
    let report = agent.resume(&mut session, checkpoint, CancellationToken::new()).await.unwrap();

    assert_eq!(report.final_text, "both results in hand");
    assert_eq!(a_calls.load(Ordering::SeqCst), 0, "covered call must not re-run");
    assert_eq!(b_calls.load(Ordering::SeqCst), 1);

    // The aggregated tool message carries both results in call order.
    let tool_msg = session.messages.iter().find(|m| m.role == Role::Tool).unwrap();
    let ids: Vec<&str> = tool_msg
        .contents
        .iter()
        .filter_map(|p| match p {
            ContentPart::FunctionResult { call_id, .. } => Some(call_id.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(ids, vec!["call_a", "call_b"]);
    assert!(session.results_are_correlated());

    // And the saved snapshot reflects the recovered conversation.
    let reloaded = store.load_session(session_id).await.unwrap();
    assert_eq!(reloaded.messages, session.messages);
}

#[tokio::test]
async fn retention_prunes_older_checkpoints_after_success() {
    let dir = tempfile::tempdir().unwrap();
    let store: Arc<dyn SessionStore> = Arc::new(FileSessionStore::new(dir.path()));

    let model = ScriptedProvider::new();
    model.push_tool_calls(vec![("c1", "count", args(1))]);
    model.push_tool_calls(vec![("c2", "count", args(2))]);
    model.push_text("done");

    let mut registry = ToolRegistry::new();
    registry.register(CountingTool { name: "count", calls: Default::default() });

    let mut config = durable_config();
    config.store.keep_latest_checkpoints = 2;
    let agent = durable_agent(model, registry, Arc::clone(&store), config);

    let mut session = Session::new();
    agent.submit(&mut session, Message::user("go"), CancellationToken::new()).await.unwrap();

    let manifest = store.checkpoint_manifest(&session.id).await.unwrap();
    assert_eq!(manifest.len(), 2);
    assert_eq!(manifest[0].step, 4);
}
