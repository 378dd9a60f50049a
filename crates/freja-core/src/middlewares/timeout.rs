// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use async_trait::async_trait;

use freja_config::TimeoutConfig;

use crate::{
    middleware::{Middleware, ToolCallRequest, ToolCallResponse, ToolNext, TurnContext},
    AgentError,
};

/// Applies a per-call deadline to tool invocations.  Expiry drops the inner
/// future (canceling the call) and surfaces `ToolTimedOut`.
pub struct TimeoutMiddleware {
    per_call: Duration,
}

impl TimeoutMiddleware {
    pub fn new(per_call: Duration) -> Self {
        Self { per_call }
    }

    pub fn from_config(config: &TimeoutConfig) -> Self {
        Self::new(config.per_call())
    }
}

#[async_trait]
impl Middleware for TimeoutMiddleware {
    fn state_key(&self) -> &str {
        "timeout"
    }

    async fn wrap_tool_call(
        &self,
        req: ToolCallRequest,
        ctx: &TurnContext,
        next: ToolNext<'_>,
    ) -> Result<ToolCallResponse, AgentError> {
        let function_name = req.call.name.clone();
        match tokio::time::timeout(self.per_call, next.run(req, ctx)).await {
            Ok(result) => result,
            Err(_) => Err(AgentError::ToolTimedOut { function_name, timeout: self.per_call }),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
