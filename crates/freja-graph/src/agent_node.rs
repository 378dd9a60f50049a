// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use freja_core::Agent;
use freja_model::Message;
use freja_session::Session;

use crate::{
    handler::{NodeContext, NodeHandler},
    NodeError,
};

/// Runs a full agent turn as a graph node.
///
/// The node input becomes the user message (a string input verbatim, any
/// other value as JSON); the output carries the final assistant text and the
/// turn's usage.  Each execution uses a fresh session so map fan-outs and
/// back-edge re-runs stay independent.
///
/// Construct the agent with a bus that is a child of the executor's bus so
/// its turn events bubble into the workflow's observers.
pub struct AgentNodeHandler {
    agent: Arc<Agent>,
}

impl AgentNodeHandler {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self { agent }
    }
}

#[async_trait]
impl NodeHandler for AgentNodeHandler {
    async fn run(&self, input: Value, ctx: NodeContext) -> Result<Value, NodeError> {
        let prompt = match &input {
            Value::String(s) => s.clone(),
            other => serde_json::to_string(other)
                .map_err(|e| NodeError::fatal(format!("unencodable node input: {e}")))?,
        };

        let mut session = Session::new();
        let report = self
            .agent
            .submit(&mut session, Message::user(prompt), ctx.cancel.clone())
            .await
            .map_err(|e| match e {
                freja_core::AgentError::Canceled => NodeError::transient("agent turn canceled"),
                other => NodeError::recoverable(other.to_string()),
            })?;

        Ok(json!({
            "text": report.final_text,
            "iterations": report.iterations,
            "input_tokens": report.usage.input_tokens,
            "output_tokens": report.usage.output_tokens,
        }))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    use freja_config::Config;
    use freja_core::{middlewares, Agent};
    use freja_events::{AgentEvent, EventBus};
    use freja_model::mock::ScriptedProvider;
    use freja_tools::ToolRegistry;

    use super::*;
    use crate::{compile, Edge, Graph, GraphExecutor, HandlerRegistry, Node, NodeStatus};

    fn scripted_agent(bus: EventBus, replies: &[&str]) -> Arc<Agent> {
        let model = ScriptedProvider::new();
        for reply in replies {
            model.push_text(*reply);
        }
        let config = Config::default();
        let pipeline = middlewares::standard_pipeline(&config);
        Arc::new(Agent::new(
            Arc::new(model),
            Arc::new(ToolRegistry::new()),
            pipeline,
            Arc::new(config),
            bus,
        ))
    }

    #[tokio::test]
    async fn agent_node_runs_a_turn_and_returns_its_text() {
        let root = EventBus::new();
        let agent = scripted_agent(root.child(), &["node says hi"]);

        let mut registry = HandlerRegistry::new();
        registry.register_handler("agent", AgentNodeHandler::new(agent));
        let executor = GraphExecutor::new(Arc::new(registry), root.clone());

        let graph = Graph::new("g", "agents")
            .add_node(Node::handler("speaker", "agent"))
            .add_edge(Edge::new("start", "speaker"))
            .add_edge(Edge::new("speaker", "end"));
        let compiled = compile(graph).unwrap();

        let run = executor
            .run(&compiled, json!("hello node"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.outcomes["speaker"].status, NodeStatus::Success);
        assert_eq!(run.final_output.unwrap()["text"], "node says hi");
    }

    #[tokio::test]
    async fn agent_turn_events_bubble_to_the_workflow_observer() {
        use futures::StreamExt;
        let root = EventBus::new();
        let mut stream = root.subscribe();
        let agent = scripted_agent(root.child(), &["bubbled"]);

        let mut registry = HandlerRegistry::new();
        registry.register_handler("agent", AgentNodeHandler::new(agent));
        let executor = GraphExecutor::new(Arc::new(registry), root.clone());

        let graph = Graph::new("g", "agents")
            .add_node(Node::handler("speaker", "agent"))
            .add_edge(Edge::new("start", "speaker"))
            .add_edge(Edge::new("speaker", "end"));
        let compiled = compile(graph).unwrap();
        executor.run(&compiled, json!("q"), CancellationToken::new()).await.unwrap();

        let mut saw_turn = false;
        let mut saw_node = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(std::time::Duration::from_millis(30), stream.next()).await
        {
            match event {
                AgentEvent::MessageTurnFinished { .. } => saw_turn = true,
                AgentEvent::WorkflowNodeCompleted { .. } => saw_node = true,
                _ => {}
            }
        }
        assert!(saw_turn, "agent turn events must reach the workflow observer");
        assert!(saw_node);
    }
}
