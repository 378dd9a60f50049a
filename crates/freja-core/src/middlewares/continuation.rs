// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use freja_config::ContinuationConfig;
use freja_events::{AgentEvent, BusError};

use crate::{
    middleware::{Middleware, TurnContext},
    AgentError,
};

/// Answers the loop's iteration-limit question by asking the observer.
///
/// Emits `ContinuationRequest(next_iteration, max_iterations)` and waits; an
/// approval extends the turn's `max_iterations` (by the response's
/// `extend_by`, or this middleware's configured default when the response
/// leaves it at zero).  Denials and timeouts stop the turn gracefully.
pub struct ContinuationMiddleware {
    extend_by: u32,
    timeout: Duration,
}

impl ContinuationMiddleware {
    pub fn new(extend_by: u32, timeout: Duration) -> Self {
        Self { extend_by, timeout }
    }

    pub fn from_config(config: &ContinuationConfig) -> Self {
        Self::new(config.extend_by, config.timeout())
    }
}

#[async_trait]
impl Middleware for ContinuationMiddleware {
    fn state_key(&self) -> &str {
        "continuation"
    }

    async fn on_iteration_limit(
        &self,
        ctx: &TurnContext,
        next_iteration: u32,
    ) -> Result<Option<bool>, AgentError> {
        let max_iterations = ctx.with_loop_state(|s| s.max_iterations);
        let correlation_id = Uuid::new_v4().to_string();

        let _gate = ctx.prompt_gate().await;
        ctx.bus.emit(AgentEvent::ContinuationRequest {
            correlation_id: correlation_id.clone(),
            requested_iteration: next_iteration,
            max_iterations,
        });

        match ctx.bus.wait_for_response(&correlation_id, self.timeout, &ctx.cancel).await {
            Ok(AgentEvent::ContinuationResponse { approved, extend_by, .. }) => {
                ctx.bus.emit(AgentEvent::ContinuationResponse {
                    correlation_id,
                    approved,
                    extend_by,
                });
                if approved {
                    let grant = if extend_by > 0 { extend_by } else { self.extend_by };
                    ctx.with_loop_state(|s| s.max_iterations += grant);
                    Ok(Some(true))
                } else {
                    Ok(Some(false))
                }
            }
            Ok(_) | Err(BusError::TimedOut { .. }) => {
                ctx.bus.emit(AgentEvent::ContinuationResponse {
                    correlation_id,
                    approved: false,
                    extend_by: 0,
                });
                Ok(Some(false))
            }
            Err(BusError::Canceled { .. }) => Err(AgentError::Canceled),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
