// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use freja_config::Config;
use freja_events::{ErrorCode, EventBus};
use freja_model::{ContentPart, FinishReason, ModelRequest, Usage};
use freja_session::{AgentLoopState, VersionedState};
use freja_tools::{AiFunction, AiFunctionContext, ToolCall};

use crate::AgentError;

// ─── Requests and responses flowing through the wrap chains ──────────────────

/// A model invocation as seen by the wrap chain.
#[derive(Debug, Clone)]
pub struct ModelCallRequest {
    pub request: ModelRequest,
}

/// The materialized result of one model invocation.  Streaming happens inside
/// the base handler (which emits deltas on the bus); middlewares see the
/// assembled response.
#[derive(Debug, Clone)]
pub struct ModelCallResponse {
    pub contents: Vec<ContentPart>,
    pub usage: Usage,
    pub finish: FinishReason,
}

/// A tool invocation as seen by the wrap chain.
#[derive(Clone)]
pub struct ToolCallRequest {
    pub call: ToolCall,
    pub tool: Arc<dyn AiFunction>,
    /// The context handed to the tool's `invoke`.
    pub fctx: AiFunctionContext,
}

#[derive(Debug, Clone)]
pub struct ToolCallResponse {
    pub value: Value,
    pub is_error: bool,
}

/// How a turn ended, as seen by `after_turn` hooks.
#[derive(Debug, Clone, Default)]
pub struct TurnOutcome {
    /// Set when the turn failed or was canceled.
    pub error: Option<(ErrorCode, String)>,
}

// ─── Turn context ─────────────────────────────────────────────────────────────

struct TurnStateInner {
    loop_state: Mutex<AgentLoopState>,
    persistent: Mutex<BTreeMap<String, VersionedState>>,
}

/// Shared state of one in-flight turn, threaded through every middleware hook
/// and the loop itself.  State is updated through closures so middlewares
/// never hold references across await points.
#[derive(Clone)]
pub struct TurnContext {
    pub session_id: String,
    pub branch_id: String,
    /// Workspace root used to qualify project-scoped permission policies.
    pub project_root: String,
    pub bus: EventBus,
    pub cancel: CancellationToken,
    pub config: Arc<Config>,
    /// Serializes interactive prompts so a suspended middleware is the only
    /// thing running on the agent while it waits.
    prompt_gate: Arc<tokio::sync::Mutex<()>>,
    state: Arc<TurnStateInner>,
}

impl TurnContext {
    pub fn new(
        session_id: impl Into<String>,
        branch_id: impl Into<String>,
        project_root: impl Into<String>,
        bus: EventBus,
        cancel: CancellationToken,
        config: Arc<Config>,
        loop_state: AgentLoopState,
        persistent: BTreeMap<String, VersionedState>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            branch_id: branch_id.into(),
            project_root: project_root.into(),
            bus,
            cancel,
            config,
            prompt_gate: Arc::new(tokio::sync::Mutex::new(())),
            state: Arc::new(TurnStateInner {
                loop_state: Mutex::new(loop_state),
                persistent: Mutex::new(persistent),
            }),
        }
    }

    /// Hold this guard across an emit-and-wait prompt so concurrent tool
    /// calls prompt one at a time.
    pub async fn prompt_gate(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.prompt_gate.lock().await
    }

    // ── Loop state ───────────────────────────────────────────────────────────

    pub fn loop_state(&self) -> AgentLoopState {
        self.state.loop_state.lock().unwrap().clone()
    }

    pub fn with_loop_state<R>(&self, f: impl FnOnce(&mut AgentLoopState) -> R) -> R {
        f(&mut self.state.loop_state.lock().unwrap())
    }

    pub fn approve_call(&self, call_id: &str) {
        self.with_loop_state(|s| {
            s.approved_tool_call_ids.insert(call_id.to_string());
        });
    }

    pub fn is_call_approved(&self, call_id: &str) -> bool {
        self.with_loop_state(|s| s.approved_tool_call_ids.contains(call_id))
    }

    // ── Runtime (turn-scoped) middleware state ───────────────────────────────

    pub fn runtime(&self, key: &str) -> Option<Value> {
        self.with_loop_state(|s| s.middleware_runtime_state.get(key).cloned())
    }

    pub fn update_runtime(&self, key: &str, f: impl FnOnce(Option<Value>) -> Value) {
        self.with_loop_state(|s| {
            let old = s.middleware_runtime_state.get(key).cloned();
            s.middleware_runtime_state.insert(key.to_string(), f(old));
        });
    }

    // ── Persistent (cross-turn) middleware state ─────────────────────────────

    pub fn persistent(&self, key: &str) -> Option<Value> {
        self.state.persistent.lock().unwrap().get(key).map(|v| v.value.clone())
    }

    pub fn update_persistent(
        &self,
        key: &str,
        version: u32,
        f: impl FnOnce(Option<Value>) -> Value,
    ) {
        let mut map = self.state.persistent.lock().unwrap();
        let old = map.get(key).map(|v| v.value.clone());
        map.insert(key.to_string(), VersionedState { version, value: f(old) });
    }

    /// Snapshot of the persistent-state map, merged into the session at
    /// turn end.
    pub fn persistent_state(&self) -> BTreeMap<String, VersionedState> {
        self.state.persistent.lock().unwrap().clone()
    }
}

// ─── Base handlers and wrap chains ───────────────────────────────────────────

/// The innermost model-call frame.
#[async_trait]
pub trait ModelCallHandler: Send + Sync {
    async fn call(
        &self,
        req: ModelCallRequest,
        ctx: &TurnContext,
    ) -> Result<ModelCallResponse, AgentError>;
}

/// The innermost tool-call frame.
#[async_trait]
pub trait ToolCallHandler: Send + Sync {
    async fn call(
        &self,
        req: ToolCallRequest,
        ctx: &TurnContext,
    ) -> Result<ToolCallResponse, AgentError>;
}

/// The remainder of a model wrap chain.  `run` peels one middleware; for the
/// ordered list `[m1, m2, m3]` the effective composition is `m1(m2(m3(base)))`,
/// so `m1` sees the request first and the response last.
#[derive(Clone, Copy)]
pub struct ModelNext<'a> {
    pub(crate) chain: &'a [Arc<dyn Middleware>],
    pub(crate) base: &'a dyn ModelCallHandler,
}

impl<'a> ModelNext<'a> {
    pub async fn run(
        self,
        req: ModelCallRequest,
        ctx: &TurnContext,
    ) -> Result<ModelCallResponse, AgentError> {
        match self.chain.split_first() {
            Some((mw, rest)) => {
                mw.wrap_model_call(req, ctx, ModelNext { chain: rest, base: self.base }).await
            }
            None => self.base.call(req, ctx).await,
        }
    }
}

/// The remainder of a tool wrap chain.  Same composition rule as
/// [`ModelNext`].
#[derive(Clone, Copy)]
pub struct ToolNext<'a> {
    pub(crate) chain: &'a [Arc<dyn Middleware>],
    pub(crate) base: &'a dyn ToolCallHandler,
}

impl<'a> ToolNext<'a> {
    pub async fn run(
        self,
        req: ToolCallRequest,
        ctx: &TurnContext,
    ) -> Result<ToolCallResponse, AgentError> {
        match self.chain.split_first() {
            Some((mw, rest)) => {
                mw.wrap_tool_call(req, ctx, ToolNext { chain: rest, base: self.base }).await
            }
            None => self.base.call(req, ctx).await,
        }
    }
}

// ─── The middleware trait ─────────────────────────────────────────────────────

/// A turn interceptor.  Implement any subset of the hooks; every default is a
/// pass-through.  An error returned from a wrap hook is caught by the next
/// outer frame (which may recover, as the retry middleware does) or, if none
/// does, terminates the current call.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Key under which this middleware's state lives in sessions and
    /// checkpoints.
    fn state_key(&self) -> &str;

    /// Version of the persistent-state schema this middleware writes.
    fn state_version(&self) -> u32 {
        1
    }

    /// Upgrade persistent state written at `from` to the current version.
    /// Invoked during session attach when the stored version is older.
    fn migrate(&self, _from: u32, value: Value) -> Result<Value, AgentError> {
        Ok(value)
    }

    async fn before_turn(&self, _ctx: &TurnContext) -> Result<(), AgentError> {
        Ok(())
    }

    async fn wrap_model_call(
        &self,
        req: ModelCallRequest,
        ctx: &TurnContext,
        next: ModelNext<'_>,
    ) -> Result<ModelCallResponse, AgentError> {
        next.run(req, ctx).await
    }

    async fn wrap_tool_call(
        &self,
        req: ToolCallRequest,
        ctx: &TurnContext,
        next: ToolNext<'_>,
    ) -> Result<ToolCallResponse, AgentError> {
        next.run(req, ctx).await
    }

    /// Consulted when the loop has exhausted `max_iterations` with tool work
    /// still pending.  `Some(true)` continues (the middleware extended the
    /// cap), `Some(false)` stops the turn gracefully, `None` defers to the
    /// next middleware.
    async fn on_iteration_limit(
        &self,
        _ctx: &TurnContext,
        _next_iteration: u32,
    ) -> Result<Option<bool>, AgentError> {
        Ok(None)
    }

    /// Always runs, in reverse registration order, even when the turn failed
    /// or was canceled.
    async fn after_turn(&self, _ctx: &TurnContext, _outcome: &TurnOutcome) -> Result<(), AgentError> {
        Ok(())
    }
}
