// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use freja_config::RetryConfig;

use crate::{
    middleware::{
        Middleware, ModelCallRequest, ModelCallResponse, ModelNext, ToolCallRequest,
        ToolCallResponse, ToolNext, TurnContext,
    },
    AgentError,
};

/// Retries transient failures of model and tool calls with exponential
/// backoff.  Terminal errors pass through on the first failure.
pub struct RetryMiddleware {
    max_attempts: u32,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
}

impl RetryMiddleware {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay(),
            multiplier: config.multiplier,
            max_delay: config.max_delay(),
        }
    }

    fn delay_for(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        if let Some(hint) = hint {
            return hint.min(self.max_delay);
        }
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = (self.base_delay.as_millis() as f64 * factor) as u64;
        Duration::from_millis(millis).min(self.max_delay)
    }

    /// Sleep that races the cancel token.
    async fn backoff(&self, ctx: &TurnContext, delay: Duration) -> Result<(), AgentError> {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => Err(AgentError::Canceled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[async_trait]
impl Middleware for RetryMiddleware {
    fn state_key(&self) -> &str {
        "retry"
    }

    async fn wrap_model_call(
        &self,
        req: ModelCallRequest,
        ctx: &TurnContext,
        next: ModelNext<'_>,
    ) -> Result<ModelCallResponse, AgentError> {
        let mut attempt = 1;
        loop {
            match next.run(req.clone(), ctx).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let hint = match &e {
                        AgentError::Model(m) => m.retry_hint(),
                        _ => None,
                    };
                    let delay = self.delay_for(attempt, hint);
                    warn!(attempt, error = %e, ?delay, "retrying model call");
                    self.backoff(ctx, delay).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn wrap_tool_call(
        &self,
        req: ToolCallRequest,
        ctx: &TurnContext,
        next: ToolNext<'_>,
    ) -> Result<ToolCallResponse, AgentError> {
        let mut attempt = 1;
        loop {
            match next.run(req.clone(), ctx).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt, None);
                    warn!(
                        tool = req.call.name.as_str(),
                        attempt,
                        error = %e,
                        ?delay,
                        "retrying tool call"
                    );
                    self.backoff(ctx, delay).await?;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
