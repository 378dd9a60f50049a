// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::warn;

use freja_session::{Session, VersionedState};

use crate::{
    middleware::{
        Middleware, ModelCallHandler, ModelCallRequest, ModelCallResponse, ModelNext,
        ToolCallHandler, ToolCallRequest, ToolCallResponse, ToolNext, TurnContext, TurnOutcome,
    },
    AgentError,
};

/// An ordered middleware composition over model calls, tool calls, and turn
/// boundaries.
///
/// For `[m1, m2, m3]` the effective wrap of a base handler `h` is
/// `m1(m2(m3(h)))`.  Composition is associative: grouping middlewares into
/// sub-pipelines yields the same effective chain as one flat list.
pub struct MiddlewarePipeline {
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl MiddlewarePipeline {
    pub fn new(middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self { middlewares }
    }

    pub fn empty() -> Self {
        Self { middlewares: Vec::new() }
    }

    pub fn push(&mut self, mw: Arc<dyn Middleware>) {
        self.middlewares.push(mw);
    }

    /// Flatten several pipelines into one, preserving order.
    pub fn compose(parts: Vec<MiddlewarePipeline>) -> Self {
        Self { middlewares: parts.into_iter().flat_map(|p| p.middlewares).collect() }
    }

    pub fn middlewares(&self) -> &[Arc<dyn Middleware>] {
        &self.middlewares
    }

    // ── Turn hooks ───────────────────────────────────────────────────────────

    /// Run all `before_turn` hooks in registration order.
    pub async fn before_turn(&self, ctx: &TurnContext) -> Result<(), AgentError> {
        for mw in &self.middlewares {
            mw.before_turn(ctx).await?;
        }
        Ok(())
    }

    /// Run all `after_turn` hooks in reverse registration order.  Hook
    /// failures are logged, never propagated — every hook must get its
    /// chance to run, including on error and cancel paths.
    pub async fn after_turn(&self, ctx: &TurnContext, outcome: &TurnOutcome) {
        for mw in self.middlewares.iter().rev() {
            if let Err(e) = mw.after_turn(ctx, outcome).await {
                warn!(middleware = mw.state_key(), error = %e, "after_turn hook failed");
            }
        }
    }

    // ── Wrap chains ──────────────────────────────────────────────────────────

    pub async fn model_call(
        &self,
        req: ModelCallRequest,
        ctx: &TurnContext,
        base: &dyn ModelCallHandler,
    ) -> Result<ModelCallResponse, AgentError> {
        ModelNext { chain: &self.middlewares, base }.run(req, ctx).await
    }

    pub async fn tool_call(
        &self,
        req: ToolCallRequest,
        ctx: &TurnContext,
        base: &dyn ToolCallHandler,
    ) -> Result<ToolCallResponse, AgentError> {
        ToolNext { chain: &self.middlewares, base }.run(req, ctx).await
    }

    /// Walk `on_iteration_limit` hooks in order; the first decisive answer
    /// wins.  With no decisive middleware the turn stops.
    pub async fn iteration_limit(
        &self,
        ctx: &TurnContext,
        next_iteration: u32,
    ) -> Result<bool, AgentError> {
        for mw in &self.middlewares {
            if let Some(decision) = mw.on_iteration_limit(ctx, next_iteration).await? {
                return Ok(decision);
            }
        }
        Ok(false)
    }

    // ── Persistent-state lifecycle ───────────────────────────────────────────

    /// Extract the persistent-state map from a loaded session, migrating
    /// entries whose stored version is older than the owning middleware's
    /// declared version.  Entries that fail migration are dropped with a
    /// diagnostic; entries owned by no registered middleware pass through
    /// untouched.
    pub fn attach_session_state(
        &self,
        session: &Session,
    ) -> BTreeMap<String, VersionedState> {
        let mut out = BTreeMap::new();
        for (key, stored) in &session.persistent_state {
            let owner = self.middlewares.iter().find(|m| m.state_key() == key);
            match owner {
                Some(mw) if stored.version < mw.state_version() => {
                    match mw.migrate(stored.version, stored.value.clone()) {
                        Ok(value) => {
                            out.insert(
                                key.clone(),
                                VersionedState { version: mw.state_version(), value },
                            );
                        }
                        Err(e) => {
                            warn!(
                                middleware = key.as_str(),
                                from = stored.version,
                                to = mw.state_version(),
                                error = %e,
                                "dropping middleware state that failed migration"
                            );
                        }
                    }
                }
                _ => {
                    out.insert(key.clone(), stored.clone());
                }
            }
        }
        out
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
