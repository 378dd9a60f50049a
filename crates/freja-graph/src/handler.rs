// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use freja_events::EventBus;

use crate::{Graph, GraphError, NodeError};

/// What a node handler may observe while running.
#[derive(Clone)]
pub struct NodeContext {
    pub node_id: String,
    pub run_id: String,
    /// The node's static config value.
    pub config: Value,
    /// Child bus of the run; emitted events bubble to the run's observers.
    pub bus: EventBus,
    pub cancel: CancellationToken,
}

/// User code behind a `Handler` node.
#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// Identity of the handler implementation, folded into cache
    /// fingerprints under the code-aware strategies.
    fn code_version(&self) -> &str {
        "0"
    }

    async fn run(&self, input: Value, ctx: NodeContext) -> Result<Value, NodeError>;
}

/// Per-item routing for `Map` nodes: picks the processor graph an item runs
/// through.
#[async_trait]
pub trait MapRouter: Send + Sync {
    async fn route(&self, item: &Value) -> Result<Graph, NodeError>;
}

type Predicate = dyn Fn(&Value) -> bool + Send + Sync;

/// Handlers, map routers, and named edge predicates, materialized by the
/// embedding application before a run.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn NodeHandler>>,
    routers: HashMap<String, Arc<dyn MapRouter>>,
    predicates: HashMap<String, Arc<Predicate>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler(&mut self, name: impl Into<String>, handler: impl NodeHandler + 'static) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    pub fn register_router(&mut self, name: impl Into<String>, router: impl MapRouter + 'static) {
        self.routers.insert(name.into(), Arc::new(router));
    }

    pub fn register_predicate(
        &mut self,
        name: impl Into<String>,
        predicate: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) {
        self.predicates.insert(name.into(), Arc::new(predicate));
    }

    pub fn handler(&self, name: &str) -> Result<Arc<dyn NodeHandler>, GraphError> {
        self.handlers.get(name).cloned().ok_or_else(|| GraphError::UnknownHandler(name.into()))
    }

    pub fn router(&self, name: &str) -> Result<Arc<dyn MapRouter>, GraphError> {
        self.routers.get(name).cloned().ok_or_else(|| GraphError::UnknownRouter(name.into()))
    }

    pub fn predicate(&self, name: &str) -> Result<Arc<Predicate>, GraphError> {
        self.predicates
            .get(name)
            .cloned()
            .ok_or_else(|| GraphError::UnknownPredicate(name.into()))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    struct Doubler;

    #[async_trait]
    impl NodeHandler for Doubler {
        async fn run(&self, input: Value, _ctx: NodeContext) -> Result<Value, NodeError> {
            let n = input.as_i64().ok_or_else(|| NodeError::fatal("expected a number"))?;
            Ok(json!(n * 2))
        }
    }

    #[test]
    fn unknown_lookups_fail_with_typed_errors() {
        let reg = HandlerRegistry::new();
        assert!(matches!(reg.handler("h"), Err(GraphError::UnknownHandler(_))));
        assert!(matches!(reg.router("r"), Err(GraphError::UnknownRouter(_))));
        assert!(matches!(reg.predicate("p"), Err(GraphError::UnknownPredicate(_))));
    }

    #[tokio::test]
    async fn registered_handler_runs() {
        let mut reg = HandlerRegistry::new();
        reg.register_handler("double", Doubler);
        let handler = reg.handler("double").unwrap();
        let ctx = NodeContext {
            node_id: "n".into(),
            run_id: "r".into(),
            config: Value::Null,
            bus: EventBus::new(),
            cancel: CancellationToken::new(),
        };
        assert_eq!(handler.run(json!(4), ctx).await.unwrap(), json!(8));
    }

    #[test]
    fn predicates_evaluate_values() {
        let mut reg = HandlerRegistry::new();
        reg.register_predicate("is_ready", |v| v["ready"] == json!(true));
        let p = reg.predicate("is_ready").unwrap();
        assert!(p(&json!({ "ready": true })));
        assert!(!p(&json!({ "ready": false })));
    }
}
