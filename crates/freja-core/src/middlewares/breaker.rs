// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{json, Value};

use freja_config::CircuitBreakerConfig;
use freja_events::AgentEvent;

use crate::{
    middleware::{Middleware, ToolCallRequest, ToolCallResponse, ToolNext, TurnContext},
    AgentError,
};

const RUNTIME_KEY: &str = "circuit_breaker";

/// Trips when one function is called with identical arguments too many times
/// in a row — the signature of a model stuck in a loop.
pub struct CircuitBreakerMiddleware {
    threshold: u32,
}

impl CircuitBreakerMiddleware {
    pub fn new(threshold: u32) -> Self {
        Self { threshold }
    }

    pub fn from_config(config: &CircuitBreakerConfig) -> Self {
        Self::new(config.threshold)
    }

    fn args_hash(req: &ToolCallRequest) -> String {
        use sha2::Digest;
        let mut hasher = sha2::Sha256::new();
        hasher.update(serde_json::to_string(&req.call.args).unwrap_or_default().as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[async_trait]
impl Middleware for CircuitBreakerMiddleware {
    fn state_key(&self) -> &str {
        RUNTIME_KEY
    }

    async fn wrap_tool_call(
        &self,
        req: ToolCallRequest,
        ctx: &TurnContext,
        next: ToolNext<'_>,
    ) -> Result<ToolCallResponse, AgentError> {
        let function_name = req.call.name.clone();
        let hash = Self::args_hash(&req);

        let mut consecutive = 0u32;
        ctx.update_runtime(RUNTIME_KEY, |old| {
            let mut table = old.and_then(|v| {
                if let Value::Object(m) = v {
                    Some(m)
                } else {
                    None
                }
            })
            .unwrap_or_default();
            let entry = table.get(&function_name);
            let prev_hash = entry.and_then(|e| e["hash"].as_str().map(str::to_string));
            let prev_count = entry.and_then(|e| e["count"].as_u64()).unwrap_or(0) as u32;
            consecutive = if prev_hash.as_deref() == Some(hash.as_str()) {
                prev_count + 1
            } else {
                1
            };
            table.insert(function_name.clone(), json!({ "hash": hash, "count": consecutive }));
            Value::Object(table)
        });

        if consecutive >= self.threshold {
            ctx.bus.emit(AgentEvent::CircuitBreakerTriggered {
                function_name: function_name.clone(),
                consecutive,
            });
            return Err(AgentError::CircuitOpen { function_name });
        }

        next.run(req, ctx).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use serde_json::Map;
    use tokio_util::sync::CancellationToken;

    use freja_config::Config;
    use freja_events::EventBus;
    use freja_session::AgentLoopState;
    use freja_tools::{AiFunction, AiFunctionContext, ToolCall, ToolError, ToolOptions};

    use super::*;
    use crate::middleware::ToolCallHandler;

    struct NoopTool;

    #[async_trait]
    impl AiFunction for NoopTool {
        fn name(&self) -> &str {
            "noop"
        }
        fn description(&self) -> &str {
            "does nothing"
        }
        fn json_schema(&self) -> Value {
            json!({ "type": "object" })
        }
        fn options(&self) -> ToolOptions {
            ToolOptions::default()
        }
        async fn invoke(
            &self,
            _args: &Map<String, Value>,
            _ctx: &AiFunctionContext,
        ) -> Result<Value, ToolError> {
            Ok(json!(null))
        }
    }

    struct OkBase;

    #[async_trait]
    impl ToolCallHandler for OkBase {
        async fn call(
            &self,
            _req: ToolCallRequest,
            _ctx: &TurnContext,
        ) -> Result<ToolCallResponse, AgentError> {
            Ok(ToolCallResponse { value: json!("ran"), is_error: false })
        }
    }

    fn ctx() -> TurnContext {
        TurnContext::new(
            "s",
            "main",
            ".",
            EventBus::new(),
            CancellationToken::new(),
            Arc::new(Config::default()),
            AgentLoopState::new(10),
            BTreeMap::new(),
        )
    }

    fn request(args: Map<String, Value>) -> ToolCallRequest {
        ToolCallRequest {
            call: ToolCall::new("c", "noop", args),
            tool: Arc::new(NoopTool),
            fctx: AiFunctionContext::for_tests(),
        }
    }

    fn args(v: i64) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("x".into(), json!(v));
        m
    }

    #[tokio::test]
    async fn trips_on_the_call_that_reaches_the_threshold() {
        let mw = CircuitBreakerMiddleware::new(3);
        let ctx = ctx();
        let chain: Vec<Arc<dyn Middleware>> = vec![];
        for _ in 0..2 {
            let resp = mw
                .wrap_tool_call(request(args(1)), &ctx, ToolNext { chain: &chain, base: &OkBase })
                .await
                .unwrap();
            assert_eq!(resp.value, json!("ran"));
        }
        let err = mw
            .wrap_tool_call(request(args(1)), &ctx, ToolNext { chain: &chain, base: &OkBase })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn different_arguments_reset_the_counter() {
        let mw = CircuitBreakerMiddleware::new(3);
        let ctx = ctx();
        let chain: Vec<Arc<dyn Middleware>> = vec![];
        for v in [1, 1, 2, 2, 1, 1] {
            mw.wrap_tool_call(request(args(v)), &ctx, ToolNext { chain: &chain, base: &OkBase })
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn trip_emits_the_breaker_event() {
        use futures::StreamExt;
        let mw = CircuitBreakerMiddleware::new(1);
        let ctx = ctx();
        let mut stream = ctx.bus.subscribe();
        let chain: Vec<Arc<dyn Middleware>> = vec![];
        let _ = mw
            .wrap_tool_call(request(args(5)), &ctx, ToolNext { chain: &chain, base: &OkBase })
            .await;
        match stream.next().await {
            Some(AgentEvent::CircuitBreakerTriggered { function_name, consecutive }) => {
                assert_eq!(function_name, "noop");
                assert_eq!(consecutive, 1);
            }
            other => panic!("expected breaker event, got {other:?}"),
        }
    }
}
