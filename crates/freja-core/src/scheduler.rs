// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::sync::{Mutex, Semaphore};
use tracing::warn;

use freja_events::AgentEvent;
use freja_model::{ContentPart, Message};
use freja_session::{PendingWrites, SessionStore, StoreError};
use freja_tools::{AiFunctionContext, ToolCall, ToolRegistry};

use crate::{
    middleware::{ToolCallHandler, ToolCallRequest, ToolCallResponse, TurnContext},
    AgentError, MiddlewarePipeline,
};

/// Persists pending writes incrementally as parallel calls complete.
pub struct PendingSink {
    store: Arc<dyn SessionStore>,
    writes: Mutex<PendingWrites>,
}

impl PendingSink {
    pub fn new(store: Arc<dyn SessionStore>, writes: PendingWrites) -> Self {
        Self { store, writes: Mutex::new(writes) }
    }

    pub async fn covers(&self, call_id: &str) -> bool {
        self.writes.lock().await.covers(call_id)
    }

    pub async fn recorded_value(&self, call_id: &str) -> Option<Value> {
        let writes = self.writes.lock().await;
        writes.results.iter().find(|w| w.call_id == call_id).map(|w| w.value.clone())
    }

    async fn record(&self, call_id: &str, value: Value) -> Result<(), StoreError> {
        let mut writes = self.writes.lock().await;
        writes.record(call_id, value);
        self.store.save_pending_writes(&writes).await
    }

    /// Promote: the results now live in a checkpoint, drop the side record.
    pub async fn promote(&self) -> Result<(), StoreError> {
        let writes = self.writes.lock().await;
        self.store.clear_pending_writes(&writes.session_id, &writes.checkpoint_id).await
    }
}

/// The outcome of one tool round.
pub struct ToolRound {
    /// Aggregated tool-role message, results in request order.
    pub message: Message,
    /// Set when a call demanded the turn end (interactive permission
    /// denial).  The aggregated message still carries results for every
    /// call, including a denial payload for the terminating one.
    pub terminated: Option<AgentError>,
}

/// The innermost tool frame: invoke the resolved tool, converting its error
/// values into classified failures and observing cancellation.
struct InvokeHandler;

#[async_trait]
impl ToolCallHandler for InvokeHandler {
    async fn call(
        &self,
        req: ToolCallRequest,
        ctx: &TurnContext,
    ) -> Result<ToolCallResponse, AgentError> {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(AgentError::Canceled),
            result = req.tool.invoke(&req.call.args, &req.fctx) => match result {
                Ok(value) => Ok(ToolCallResponse { value, is_error: false }),
                Err(e) => Err(AgentError::Tool { name: req.call.name.clone(), source: e }),
            },
        }
    }
}

/// Dispatches one iteration's function calls in parallel under a concurrency
/// cap, driving each through the middleware wrap chain.
pub struct ToolScheduler {
    registry: Arc<ToolRegistry>,
    parallel_limit: usize,
}

impl ToolScheduler {
    pub fn new(registry: Arc<ToolRegistry>, parallel_limit: usize) -> Self {
        Self { registry, parallel_limit: parallel_limit.max(1) }
    }

    fn error_payload(e: &AgentError) -> Value {
        json!({ "error": { "code": e.code(), "message": e.to_string() } })
    }

    /// Execute `calls`, returning the aggregated tool-role message.
    ///
    /// `snapshot` is the read-only conversation at dispatch time; `pending`
    /// enables durable partial results — calls whose ids are already covered
    /// are not re-invoked.
    pub async fn run_round(
        &self,
        calls: Vec<ToolCall>,
        pipeline: Arc<MiddlewarePipeline>,
        ctx: &TurnContext,
        snapshot: Arc<Vec<Message>>,
        metadata: Map<String, Value>,
        pending: Option<Arc<PendingSink>>,
    ) -> Result<ToolRound, AgentError> {
        // All ToolCallStart events precede any ToolCallEnd.
        for call in &calls {
            ctx.bus.emit(AgentEvent::ToolCallStart {
                call_id: call.call_id.clone(),
                name: call.name.clone(),
            });
        }

        let semaphore = Arc::new(Semaphore::new(self.parallel_limit));
        // Child token so a turn-terminating denial can stop the rest of the
        // batch without canceling the turn itself.
        let batch_cancel = ctx.cancel.child_token();
        let mut tasks = Vec::with_capacity(calls.len());

        for call in calls.iter().cloned() {
            // Covered by pending writes from a previous run: do not re-invoke.
            if let Some(sink) = &pending {
                if sink.covers(&call.call_id).await {
                    let value = sink.recorded_value(&call.call_id).await.unwrap_or(Value::Null);
                    tasks.push(RoundTask::Recovered { call_id: call.call_id.clone(), value });
                    continue;
                }
            }

            let semaphore = Arc::clone(&semaphore);
            let pipeline = Arc::clone(&pipeline);
            let registry = Arc::clone(&self.registry);
            let mut ctx = ctx.clone();
            ctx.cancel = batch_cancel.clone();
            let snapshot = Arc::clone(&snapshot);
            let metadata = metadata.clone();
            let pending = pending.clone();
            let call_id_for_task = call.call_id.clone();

            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|_| AgentError::Canceled)?;

                ctx.bus.emit(AgentEvent::ToolCallArgs {
                    call_id: call.call_id.clone(),
                    args: Value::Object(call.args.clone()),
                });

                let tool = match registry.resolve(&call.name) {
                    Ok(tool) => tool,
                    Err(e) => {
                        return Err(AgentError::Tool { name: call.name.clone(), source: e });
                    }
                };
                let fctx = AiFunctionContext {
                    call_id: call.call_id.clone(),
                    session_id: ctx.session_id.clone(),
                    branch_id: ctx.branch_id.clone(),
                    messages: snapshot,
                    metadata,
                    bus: ctx.bus.clone(),
                    cancel: ctx.cancel.clone(),
                };
                let req = ToolCallRequest { call: call.clone(), tool, fctx };
                let response = pipeline.tool_call(req, &ctx, &InvokeHandler).await?;

                // Durable partial result, written as the call completes.
                if let Some(sink) = &pending {
                    if let Err(e) = sink.record(&call.call_id, response.value.clone()).await {
                        warn!(call_id = call.call_id.as_str(), error = %e, "pending write failed");
                    }
                }
                Ok(response)
            });
            tasks.push(RoundTask::Running { call_id: call_id_for_task, handle });
        }

        // Await in request order so the aggregated message is deterministic.
        let mut parts = Vec::with_capacity(calls.len());
        let mut terminated: Option<AgentError> = None;

        for task in tasks {
            let (call_id, outcome) = match task {
                RoundTask::Recovered { call_id, value } => {
                    (call_id, Ok(ToolCallResponse { value, is_error: false }))
                }
                RoundTask::Running { call_id, handle } => match handle.await {
                    Ok(outcome) => (call_id, outcome),
                    Err(e) => (
                        call_id,
                        Err(AgentError::Internal(format!("tool task panicked: {e}"))),
                    ),
                },
            };

            let (value, is_error) = match outcome {
                Ok(resp) => (resp.value, resp.is_error),
                Err(AgentError::Canceled) if terminated.is_none() => {
                    return Err(AgentError::Canceled);
                }
                Err(e) if e.terminates_turn() && !matches!(e, AgentError::Canceled) => {
                    // Stop the rest of the batch; keep the denial payload as
                    // this call's result so the conversation stays coherent.
                    batch_cancel.cancel();
                    let payload = Self::error_payload(&e);
                    if terminated.is_none() {
                        terminated = Some(e);
                    }
                    (payload, true)
                }
                Err(e) => (Self::error_payload(&e), true),
            };

            ctx.bus.emit(AgentEvent::ToolCallResult {
                call_id: call_id.clone(),
                value: value.clone(),
                is_error,
            });
            ctx.bus.emit(AgentEvent::ToolCallEnd { call_id: call_id.clone() });
            parts.push(ContentPart::function_result(call_id, value));
        }

        Ok(ToolRound { message: Message::tool_results(parts), terminated })
    }
}

enum RoundTask {
    Recovered { call_id: String, value: Value },
    Running { call_id: String, handle: tokio::task::JoinHandle<Result<ToolCallResponse, AgentError>> },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
