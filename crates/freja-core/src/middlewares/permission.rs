// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use freja_config::PermissionConfig;
use freja_events::{AgentEvent, BusError, DenialReason, PolicyDecision};
use freja_tools::{scope_key, PolicyStore};

use crate::{
    middleware::{Middleware, ToolCallRequest, ToolCallResponse, ToolNext, TurnContext},
    AgentError,
};

const STATE_KEY: &str = "permissions";
const RUNTIME_KEY: &str = "permissions.approved_fingerprints";

/// Gates tools that declare `requires_permission`.
///
/// Stored policy is consulted first (conversation → project → global); an
/// `Ask` outcome emits a `PermissionRequest` and suspends until a response,
/// a timeout, or cancellation.  Interactive denials and timeouts end the
/// turn; a stored `AlwaysDeny` ends only the call.
pub struct PermissionMiddleware {
    timeout: Duration,
}

impl PermissionMiddleware {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn from_config(config: &PermissionConfig) -> Self {
        Self::new(config.timeout())
    }

    fn policy_store(ctx: &TurnContext) -> PolicyStore {
        ctx.persistent(STATE_KEY)
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }

    fn save_policy_store(ctx: &TurnContext, store: &PolicyStore) {
        let value = serde_json::to_value(store).unwrap_or(Value::Null);
        ctx.update_persistent(STATE_KEY, 1, |_| value);
    }

    /// Stable fingerprint of `(function, args)` used to suppress duplicate
    /// prompts for identical calls approved earlier in the same turn.
    fn fingerprint(req: &ToolCallRequest) -> String {
        use sha2::Digest;
        let mut hasher = sha2::Sha256::new();
        hasher.update(req.call.name.as_bytes());
        hasher.update(serde_json::to_string(&req.call.args).unwrap_or_default().as_bytes());
        hex::encode(hasher.finalize())
    }

    fn fingerprint_approved(ctx: &TurnContext, fp: &str) -> bool {
        ctx.runtime(RUNTIME_KEY)
            .and_then(|v| v.as_array().cloned())
            .map(|a| a.iter().any(|e| e.as_str() == Some(fp)))
            .unwrap_or(false)
    }

    fn approve_fingerprint(ctx: &TurnContext, fp: &str) {
        let fp = fp.to_string();
        ctx.update_runtime(RUNTIME_KEY, move |old| {
            let mut list = old.and_then(|v| v.as_array().cloned()).unwrap_or_default();
            list.push(Value::String(fp));
            Value::Array(list)
        });
    }
}

#[async_trait]
impl Middleware for PermissionMiddleware {
    fn state_key(&self) -> &str {
        STATE_KEY
    }

    async fn wrap_tool_call(
        &self,
        req: ToolCallRequest,
        ctx: &TurnContext,
        next: ToolNext<'_>,
    ) -> Result<ToolCallResponse, AgentError> {
        if !req.tool.options().requires_permission {
            return next.run(req, ctx).await;
        }

        let function_name = req.call.name.clone();

        // Already approved by an earlier prompt this turn, by call id.
        if ctx.is_call_approved(&req.call.call_id) {
            return next.run(req, ctx).await;
        }

        // One prompt at a time: while a suspended request waits, nothing
        // else on this agent asks.
        let gate = ctx.prompt_gate().await;

        // An identical call approved earlier this turn does not re-prompt.
        let fp = Self::fingerprint(&req);
        if Self::fingerprint_approved(ctx, &fp) {
            ctx.approve_call(&req.call.call_id);
            drop(gate);
            return next.run(req, ctx).await;
        }

        // Stored policy.
        let store = Self::policy_store(ctx);
        if let Some((decision, scope)) =
            store.lookup(&function_name, &ctx.session_id, &ctx.project_root)
        {
            ctx.bus.emit(AgentEvent::PermissionCheck {
                function_name: function_name.clone(),
                decision,
                scope,
            });
            match decision {
                PolicyDecision::AlwaysAllow => {
                    drop(gate);
                    return next.run(req, ctx).await;
                }
                PolicyDecision::AlwaysDeny => {
                    return Err(AgentError::PermissionDenied {
                        function_name,
                        turn: false,
                        reason: DenialReason::Policy,
                    });
                }
                PolicyDecision::Ask => {}
            }
        }

        // Ask.
        let correlation_id = Uuid::new_v4().to_string();
        ctx.bus.emit(AgentEvent::PermissionRequest {
            correlation_id: correlation_id.clone(),
            function_name: function_name.clone(),
            args: Value::Object(req.call.args.clone()),
        });

        let response =
            ctx.bus.wait_for_response(&correlation_id, self.timeout, &ctx.cancel).await;

        match response {
            Ok(AgentEvent::PermissionApproved { remember, .. }) => {
                ctx.bus.emit(AgentEvent::PermissionApproved {
                    correlation_id,
                    function_name: function_name.clone(),
                    remember,
                });
                if let Some(policy) = remember {
                    let mut store = Self::policy_store(ctx);
                    let key = scope_key(policy.scope, &ctx.session_id, &ctx.project_root);
                    store.set(&function_name, &key, policy.decision);
                    Self::save_policy_store(ctx, &store);
                }
                ctx.approve_call(&req.call.call_id);
                Self::approve_fingerprint(ctx, &fp);
                drop(gate);
                next.run(req, ctx).await
            }
            Ok(other) => {
                if !matches!(other, AgentEvent::PermissionDenied { .. }) {
                    warn!(
                        function_name = function_name.as_str(),
                        "unexpected response event treated as denial"
                    );
                }
                ctx.bus.emit(AgentEvent::PermissionDenied {
                    correlation_id,
                    function_name: function_name.clone(),
                    reason: DenialReason::Response,
                });
                Err(AgentError::PermissionDenied {
                    function_name,
                    turn: true,
                    reason: DenialReason::Response,
                })
            }
            Err(BusError::TimedOut { .. }) => {
                ctx.bus.emit(AgentEvent::PermissionDenied {
                    correlation_id,
                    function_name: function_name.clone(),
                    reason: DenialReason::Timeout,
                });
                Err(AgentError::PermissionDenied {
                    function_name,
                    turn: true,
                    reason: DenialReason::Timeout,
                })
            }
            Err(BusError::Canceled { .. }) => {
                ctx.bus.emit(AgentEvent::PermissionDenied {
                    correlation_id,
                    function_name,
                    reason: DenialReason::Canceled,
                });
                Err(AgentError::Canceled)
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
