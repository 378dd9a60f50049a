// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use freja_config::{CheckpointFrequency, Config};
use freja_events::AgentEvent;
use freja_model::{
    ChatOptions, ContentPart, FinishReason, Message, ModelProvider, ModelRequest, Role, Usage,
};
use freja_session::{
    AgentLoopState, CheckpointSource, ExecutionCheckpoint, PendingWrites, Session, SessionStore,
};
use freja_tools::{ToolCall, ToolRegistry};

use crate::{
    middleware::{
        ModelCallHandler, ModelCallRequest, ModelCallResponse, TurnContext, TurnOutcome,
    },
    scheduler::{PendingSink, ToolScheduler},
    AgentError, MiddlewarePipeline,
};

/// Summary of a finished turn.
#[derive(Debug, Clone, Default)]
pub struct TurnReport {
    /// Concatenated assistant text of the final iteration.
    pub final_text: String,
    /// Model invocations performed.
    pub iterations: u32,
    pub usage: Usage,
}

// ─── Turn locks ───────────────────────────────────────────────────────────────

/// Process-wide registry enforcing one turn per `(session_id, branch_id)`.
struct TurnLocks {
    held: Mutex<HashSet<(String, String)>>,
}

impl TurnLocks {
    fn new() -> Self {
        Self { held: Mutex::new(HashSet::new()) }
    }

    fn acquire(self: &Arc<Self>, session_id: &str, branch_id: &str) -> Option<TurnLockGuard> {
        let key = (session_id.to_string(), branch_id.to_string());
        let mut held = self.held.lock().unwrap();
        if !held.insert(key.clone()) {
            return None;
        }
        Some(TurnLockGuard { locks: Arc::clone(self), key })
    }
}

/// Releases the lock on drop, including on panic and cancel unwinding.
struct TurnLockGuard {
    locks: Arc<TurnLocks>,
    key: (String, String),
}

impl Drop for TurnLockGuard {
    fn drop(&mut self) {
        self.locks.held.lock().unwrap().remove(&self.key);
    }
}

// ─── Streaming base handler ───────────────────────────────────────────────────

/// The innermost model frame: drive the provider stream, emit deltas on the
/// bus as they arrive, and assemble the materialized response the wrap chain
/// unwinds with.
struct StreamingModelHandler {
    model: Arc<dyn ModelProvider>,
}

#[async_trait]
impl ModelCallHandler for StreamingModelHandler {
    async fn call(
        &self,
        req: ModelCallRequest,
        ctx: &TurnContext,
    ) -> Result<ModelCallResponse, AgentError> {
        let mut stream =
            self.model.generate_streaming(req.request, ctx.cancel.clone()).await?;

        let mut contents: Vec<ContentPart> = Vec::new();
        let mut calls: Vec<ContentPart> = Vec::new();
        let mut text_buf = String::new();
        let mut reasoning_buf = String::new();
        let mut usage = Usage::default();
        let mut finish = FinishReason::Stop;

        loop {
            let update = tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(AgentError::Canceled),
                next = stream.next() => match next {
                    Some(update) => update?,
                    None => break,
                },
            };
            match update {
                freja_model::ResponseUpdate::TextDelta(delta) => {
                    if !delta.is_empty() {
                        text_buf.push_str(&delta);
                        ctx.bus.emit(AgentEvent::TextDelta { delta });
                    }
                }
                freja_model::ResponseUpdate::ReasoningStart => {
                    ctx.bus.emit(AgentEvent::ReasoningMessageStart);
                }
                freja_model::ResponseUpdate::ReasoningDelta(delta) => {
                    reasoning_buf.push_str(&delta);
                    ctx.bus.emit(AgentEvent::ReasoningMessageDelta { delta });
                }
                freja_model::ResponseUpdate::ReasoningEnd { trace } => {
                    ctx.bus.emit(AgentEvent::ReasoningMessageEnd);
                    if !reasoning_buf.is_empty() {
                        contents.push(ContentPart::Reasoning {
                            text: std::mem::take(&mut reasoning_buf),
                            trace,
                        });
                    }
                }
                freja_model::ResponseUpdate::FunctionCall(part) => {
                    calls.push(ContentPart::FunctionCall {
                        call_id: part.call_id,
                        name: part.name,
                        args: part.args,
                    });
                }
                freja_model::ResponseUpdate::Usage(u) => {
                    usage.input_tokens += u.input_tokens;
                    usage.output_tokens += u.output_tokens;
                }
                freja_model::ResponseUpdate::Finished(reason) => {
                    finish = reason;
                }
            }
        }

        // A reasoning block the provider never closed is still content.
        if !reasoning_buf.is_empty() {
            ctx.bus.emit(AgentEvent::ReasoningMessageEnd);
            contents.push(ContentPart::Reasoning { text: reasoning_buf, trace: None });
        }
        if !text_buf.is_empty() {
            contents.push(ContentPart::text(text_buf));
        }
        contents.extend(calls);

        Ok(ModelCallResponse { contents, usage, finish })
    }
}

// ─── The agent ────────────────────────────────────────────────────────────────

/// A configured model + tools + middleware bundle that drives turns against
/// a session.
pub struct Agent {
    model: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
    pipeline: Arc<MiddlewarePipeline>,
    config: Arc<Config>,
    store: Option<Arc<dyn SessionStore>>,
    bus: freja_events::EventBus,
    default_options: ChatOptions,
    project_root: String,
    locks: Arc<TurnLocks>,
}

impl Agent {
    pub fn new(
        model: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        pipeline: MiddlewarePipeline,
        config: Arc<Config>,
        bus: freja_events::EventBus,
    ) -> Self {
        Self {
            model,
            tools,
            pipeline: Arc::new(pipeline),
            config,
            store: None,
            bus,
            default_options: ChatOptions::default(),
            project_root: ".".to_string(),
            locks: Arc::new(TurnLocks::new()),
        }
    }

    /// Attach a session store; enables auto-save, checkpoints, and pending
    /// writes per the configured frequency.
    pub fn with_store(mut self, store: Arc<dyn SessionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_default_options(mut self, options: ChatOptions) -> Self {
        self.default_options = options;
        self
    }

    pub fn with_project_root(mut self, root: impl Into<String>) -> Self {
        self.project_root = root.into();
        self
    }

    pub fn bus(&self) -> &freja_events::EventBus {
        &self.bus
    }

    /// Run one turn on the default branch.
    pub async fn submit(
        &self,
        session: &mut Session,
        user_message: Message,
        cancel: CancellationToken,
    ) -> Result<TurnReport, AgentError> {
        self.submit_on_branch(session, "main", user_message, ChatOptions::default(), cancel)
            .await
    }

    /// Run one turn with explicit branch and per-turn option overrides.
    pub async fn submit_on_branch(
        &self,
        session: &mut Session,
        branch_id: &str,
        user_message: Message,
        options: ChatOptions,
        cancel: CancellationToken,
    ) -> Result<TurnReport, AgentError> {
        let state = AgentLoopState::new(self.config.agent.max_iterations);
        self.run_locked(session, branch_id, Some(user_message), options, state, None, cancel)
            .await
    }

    /// Resume a crashed turn from an execution checkpoint.
    ///
    /// Recovery is explicit: the caller picks the checkpoint (usually via
    /// the store manifest).  The checkpoint's working message list must
    /// extend the session's log — a session that has already moved past the
    /// checkpoint rejects it.  The working list is restored into the
    /// session, covered pending writes are not re-invoked, and the loop
    /// continues from the interrupted iteration.
    pub async fn resume(
        &self,
        session: &mut Session,
        checkpoint: ExecutionCheckpoint,
        cancel: CancellationToken,
    ) -> Result<TurnReport, AgentError> {
        if checkpoint.execution_state.current_messages.len() < session.messages.len() {
            return Err(AgentError::Internal(format!(
                "checkpoint {} is stale for session {}: the session has moved past it",
                checkpoint.checkpoint_id, session.id
            )));
        }
        session.messages = checkpoint.execution_state.current_messages.clone();
        let resume_from = Some(checkpoint.checkpoint_id.clone());
        self.run_locked(
            session,
            "main",
            None,
            ChatOptions::default(),
            checkpoint.execution_state,
            resume_from,
            cancel,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_locked(
        &self,
        session: &mut Session,
        branch_id: &str,
        user_message: Option<Message>,
        options: ChatOptions,
        state: AgentLoopState,
        resume_checkpoint: Option<String>,
        cancel: CancellationToken,
    ) -> Result<TurnReport, AgentError> {
        let Some(_lock) = self.locks.acquire(&session.id, branch_id) else {
            warn!(
                session_id = session.id.as_str(),
                branch_id,
                "dropping turn: lock already held"
            );
            return Err(AgentError::TurnInProgress {
                session_id: session.id.clone(),
                branch_id: branch_id.to_string(),
            });
        };

        // Turn timeout is cancellation with a deadline on a child token.
        let turn_cancel = cancel.child_token();
        let _watchdog = self.config.agent.turn_timeout().map(|timeout| {
            let token = turn_cancel.clone();
            Watchdog(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                token.cancel();
            }))
        });

        self.bus.emit(AgentEvent::MessageTurnStarted {
            session_id: session.id.clone(),
            branch_id: branch_id.to_string(),
        });

        if let Some(message) = user_message {
            session.push(message);
        }
        session.execution_state = Some(state.clone());

        let ctx = TurnContext::new(
            session.id.clone(),
            branch_id,
            self.project_root.clone(),
            self.bus.clone(),
            turn_cancel,
            Arc::clone(&self.config),
            state,
            self.pipeline.attach_session_state(session),
        );

        let result = self.run_turn(session, &ctx, options, resume_checkpoint).await;

        // `after_turn` hooks always run, reverse order, even on error.
        let outcome = TurnOutcome {
            error: result.as_ref().err().map(|e| (e.code(), e.to_string())),
        };
        self.pipeline.after_turn(&ctx, &outcome).await;

        // Persistent middleware state merges into the session regardless of
        // how the turn ended; the session's message log is already correct
        // because appends happen only at commit points.
        session.persistent_state = ctx.persistent_state();
        session.execution_state = None;
        session.touch();

        match result {
            Ok(report) => {
                self.bus.emit(AgentEvent::AgentCompletion {
                    text: report.final_text.clone(),
                    input_tokens: report.usage.input_tokens,
                    output_tokens: report.usage.output_tokens,
                });
                self.bus.emit(AgentEvent::MessageTurnFinished {
                    session_id: session.id.clone(),
                    branch_id: branch_id.to_string(),
                });
                if let Some(store) = &self.store {
                    if self.config.agent.auto_save {
                        store.save_snapshot(session).await?;
                    }
                    store
                        .prune_checkpoints(&session.id, self.config.store.keep_latest_checkpoints)
                        .await?;
                }
                Ok(report)
            }
            Err(e) => {
                self.bus.emit(AgentEvent::MessageTurnError {
                    session_id: session.id.clone(),
                    branch_id: branch_id.to_string(),
                    code: e.code(),
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run_turn(
        &self,
        session: &mut Session,
        ctx: &TurnContext,
        options: ChatOptions,
        resume_checkpoint: Option<String>,
    ) -> Result<TurnReport, AgentError> {
        self.pipeline.before_turn(ctx).await?;

        let durable = self.config.agent.checkpoint_frequency == CheckpointFrequency::PerIteration
            && self.store.is_some();
        let scheduler = ToolScheduler::new(
            Arc::clone(&self.tools),
            self.config.agent.parallel_tool_limit,
        );
        let merged_options = self.default_options.merged(&options);

        // Checkpoint steps continue monotonically from the session's history.
        let mut step = match &self.store {
            Some(store)
                if self.config.agent.checkpoint_frequency != CheckpointFrequency::Disabled =>
            {
                store
                    .checkpoint_manifest(&session.id)
                    .await?
                    .first()
                    .map(|e| e.step)
                    .unwrap_or(0)
            }
            _ => 0,
        };
        let mut parent_checkpoint = resume_checkpoint.clone();
        // On resume, pending writes recorded before the crash cover their
        // call ids for the first tool round.
        let mut recovered_writes: Option<PendingWrites> = match (&self.store, &resume_checkpoint) {
            (Some(store), Some(checkpoint_id)) => {
                store.load_pending_writes(&session.id, checkpoint_id).await?
            }
            _ => None,
        };

        let mut report = TurnReport::default();
        let mut assistant_indices: Vec<usize> = Vec::new();
        let mut last_had_calls = ctx.with_loop_state(|s| s.operation_metadata.had_function_calls);
        let mut final_text = String::new();

        // A resumed turn whose last message is an assistant function-call
        // message re-enters the tool round directly — the model already
        // decided; only the execution was interrupted.
        let mut resumed_round: Option<Vec<ToolCall>> = match &resume_checkpoint {
            Some(_) => session
                .messages
                .last()
                .filter(|m| m.role == Role::Assistant && m.has_function_calls())
                .map(|m| extract_tool_calls(&m.contents)),
            None => None,
        };

        loop {
            if ctx.cancel.is_cancelled() {
                return Err(AgentError::Canceled);
            }

            let calls = if let Some(calls) = resumed_round.take() {
                last_had_calls = true;
                calls
            } else {
                let (iteration, max_iterations) =
                    ctx.with_loop_state(|s| (s.iteration, s.max_iterations));

                if iteration >= max_iterations {
                    // Exhausted.  With tool work pending, consult the
                    // continuation filter; otherwise the turn simply ends.
                    if !last_had_calls {
                        break;
                    }
                    if self.pipeline.iteration_limit(ctx, iteration + 1).await? {
                        debug!(iteration, "iteration cap extended; continuing");
                    } else {
                        let note = Message::assistant(
                            "Stopping here: the iteration limit was reached and no extension \
                             was granted. The work so far is preserved above.",
                        );
                        final_text = note.text();
                        self.commit_message(session, ctx, note);
                        assistant_indices.push(session.messages.len() - 1);
                        break;
                    }
                }

                ctx.bus.emit(AgentEvent::IterationStart {
                    iteration: ctx.with_loop_state(|s| s.iteration),
                });

                // Model call through the wrap chain.
                let request = ModelRequest {
                    messages: self.prepare_messages(session),
                    tools: self.tools.schemas(),
                    options: merged_options.clone(),
                };
                let base = StreamingModelHandler { model: Arc::clone(&self.model) };
                let response = self
                    .pipeline
                    .model_call(ModelCallRequest { request }, ctx, &base)
                    .await?;
                report.iterations += 1;
                report.usage.input_tokens += response.usage.input_tokens;
                report.usage.output_tokens += response.usage.output_tokens;

                let calls = extract_tool_calls(&response.contents);
                let call_names: Vec<String> = calls.iter().map(|c| c.name.clone()).collect();
                ctx.bus.emit(AgentEvent::AgentDecision {
                    had_function_calls: !calls.is_empty(),
                    function_calls: call_names.clone(),
                });
                ctx.with_loop_state(|s| {
                    s.operation_metadata.had_function_calls = !calls.is_empty();
                    s.operation_metadata.function_calls = call_names;
                    s.operation_metadata.function_call_count = calls.len() as u32;
                });
                last_had_calls = !calls.is_empty();

                // Assemble the assistant message.  Reasoning is emitted on
                // the stream regardless, but persisted only when configured.
                let persisted: Vec<ContentPart> = response
                    .contents
                    .iter()
                    .filter(|p| {
                        self.config.agent.preserve_reasoning_in_history || !p.is_reasoning()
                    })
                    .cloned()
                    .collect();
                let text = persisted
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::Text { text } => Some(text.as_str()),
                        _ => None,
                    })
                    .collect::<String>();
                if !persisted.is_empty() {
                    let message = Message::new(Role::Assistant, persisted);
                    self.commit_message(session, ctx, message);
                    assistant_indices.push(session.messages.len() - 1);
                }
                if !text.is_empty() {
                    final_text = text;
                }

                if calls.is_empty() {
                    ctx.with_loop_state(|s| s.finish_iteration());
                    break;
                }
                calls
            };

            // Durable execution: checkpoint before the tool round so pending
            // writes have a parent to attach to.
            let sink = if durable {
                let store = self.store.as_ref().expect("durable implies store");
                let checkpoint = self
                    .write_checkpoint(session, ctx, &mut step, &mut parent_checkpoint)
                    .await?;
                let writes = match recovered_writes.take() {
                    Some(mut w) => {
                        // Carry recovered results forward under the new
                        // checkpoint id and drop the crashed turn's record.
                        if let Some(old) = &resume_checkpoint {
                            store.clear_pending_writes(&session.id, old).await?;
                        }
                        w.checkpoint_id = checkpoint.clone();
                        w
                    }
                    None => PendingWrites::new(session.id.clone(), checkpoint),
                };
                Some(Arc::new(PendingSink::new(Arc::clone(store), writes)))
            } else {
                None
            };

            let round = scheduler
                .run_round(
                    calls,
                    Arc::clone(&self.pipeline),
                    ctx,
                    Arc::new(session.messages.clone()),
                    session.metadata.clone(),
                    sink.clone(),
                )
                .await?;

            self.commit_message(session, ctx, round.message);

            if durable {
                // Post-round checkpoint captures the tool results; pending
                // writes are promoted into it.
                self.write_checkpoint(session, ctx, &mut step, &mut parent_checkpoint).await?;
                if let Some(sink) = sink {
                    sink.promote().await?;
                }
            }

            if let Some(denial) = round.terminated {
                let note = Message::assistant(format!(
                    "Stopping here: {denial}. Nothing further was executed."
                ));
                final_text = note.text();
                self.commit_message(session, ctx, note);
                assistant_indices.push(session.messages.len() - 1);
                ctx.with_loop_state(|s| s.finish_iteration());
                break;
            }

            ctx.with_loop_state(|s| s.finish_iteration());
        }

        // Per-turn durability without intra-turn checkpoints.
        if self.config.agent.checkpoint_frequency == CheckpointFrequency::PerTurn {
            if let Some(store) = &self.store {
                let checkpoint = ExecutionCheckpoint::new(
                    session.id.clone(),
                    parent_checkpoint.clone(),
                    step + 1,
                    CheckpointSource::PerTurn,
                    ctx.loop_state(),
                );
                store.save_checkpoint(&checkpoint).await?;
            }
        }

        self.assign_usage(session, &assistant_indices, report.usage);
        report.final_text = final_text;
        Ok(report)
    }

    /// Append to the session log and the loop's working copy together.
    fn commit_message(&self, session: &mut Session, ctx: &TurnContext, message: Message) {
        session.push(message.clone());
        ctx.with_loop_state(|s| s.current_messages.push(message));
    }

    async fn write_checkpoint(
        &self,
        session: &Session,
        ctx: &TurnContext,
        step: &mut u64,
        parent: &mut Option<String>,
    ) -> Result<String, AgentError> {
        let store = self.store.as_ref().expect("checkpointing requires a store");
        *step += 1;
        let checkpoint = ExecutionCheckpoint::new(
            session.id.clone(),
            parent.clone(),
            *step,
            CheckpointSource::PerIteration,
            ctx.loop_state(),
        );
        store.save_checkpoint(&checkpoint).await?;
        ctx.bus.emit(AgentEvent::StepStarted {
            step: *step,
            checkpoint_id: checkpoint.checkpoint_id.clone(),
        });
        *parent = Some(checkpoint.checkpoint_id.clone());
        Ok(checkpoint.checkpoint_id)
    }

    /// Merge system instructions exactly once at the head when the history
    /// does not already start with a system message.
    fn prepare_messages(&self, session: &Session) -> Vec<Message> {
        let mut messages = session.messages.clone();
        if let Some(instructions) = &self.config.agent.system_instructions {
            let has_system =
                messages.first().map(|m| m.role == Role::System).unwrap_or(false);
            if !has_system {
                messages.insert(0, Message::system(instructions.clone()));
            }
        }
        messages
    }

    /// Attribute usage counts: input tokens go to the last user message,
    /// output tokens split across this turn's assistant messages
    /// proportionally to text length.  The split is approximate by design; a
    /// single assistant message receives the full amount, and any remainder
    /// lands on the last one so the total is conserved.
    fn assign_usage(&self, session: &mut Session, assistant_indices: &[usize], usage: Usage) {
        if let Some(last_user) =
            session.messages.iter_mut().rev().find(|m| m.role == Role::User)
        {
            last_user.input_tokens = Some(usage.input_tokens);
        }

        if assistant_indices.is_empty() || usage.output_tokens == 0 {
            return;
        }
        let lengths: Vec<usize> =
            assistant_indices.iter().map(|&i| session.messages[i].text_len()).collect();
        let total: usize = lengths.iter().sum();
        if total == 0 {
            // Nothing to apportion by (all messages were pure function
            // calls): the last message receives the full amount.
            for (pos, &index) in assistant_indices.iter().enumerate() {
                let share =
                    if pos == assistant_indices.len() - 1 { usage.output_tokens } else { 0 };
                session.messages[index].output_tokens = Some(share);
            }
            return;
        }
        let mut assigned = 0u32;
        for (pos, &index) in assistant_indices.iter().enumerate() {
            let share = if pos == assistant_indices.len() - 1 {
                usage.output_tokens - assigned
            } else {
                ((usage.output_tokens as u64 * lengths[pos] as u64) / total as u64) as u32
            };
            assigned += share;
            session.messages[index].output_tokens = Some(share);
        }
    }
}

/// Abort the timeout watchdog when the turn finishes first.
struct Watchdog(tokio::task::JoinHandle<()>);

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn extract_tool_calls(contents: &[ContentPart]) -> Vec<ToolCall> {
    contents
        .iter()
        .filter_map(|p| match p {
            ContentPart::FunctionCall { call_id, name, args } => {
                Some(ToolCall::new(call_id.clone(), name.clone(), args.clone()))
            }
            _ => None,
        })
        .collect()
}
