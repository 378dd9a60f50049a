// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_recursion::async_recursion;
use futures::future::join_all;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use freja_events::{AgentEvent, DiagnosticLevel, EventBus};

use crate::{
    cloning::deep_clone,
    compile,
    handler::{HandlerRegistry, NodeContext},
    model::{CloningPolicy, Edge, EdgeCondition, Graph, MapRouterSpec, Node, NodeKind},
    CompiledGraph, GraphError, NodeCache, NodeError, Severity,
};

/// Terminal state of one node in a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Success,
    Failure,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub status: NodeStatus,
    pub output: Option<Value>,
    pub error: Option<String>,
}

impl NodeOutcome {
    fn success(output: Value) -> Self {
        Self { status: NodeStatus::Success, output: Some(output), error: None }
    }
    fn failure(error: impl Into<String>) -> Self {
        Self { status: NodeStatus::Failure, output: None, error: Some(error.into()) }
    }
    fn skipped(reason: impl Into<String>) -> Self {
        Self { status: NodeStatus::Skipped, output: None, error: Some(reason.into()) }
    }
}

/// The append-only result of one graph run.
#[derive(Debug, Clone, Default)]
pub struct RunResult {
    pub run_id: String,
    /// Latest outcome per node id.
    pub outcomes: BTreeMap<String, NodeOutcome>,
    /// Times each node executed (back-edges re-execute).
    pub executions: BTreeMap<String, u32>,
    /// Value delivered to the exit node, when any path reached it.
    pub final_output: Option<Value>,
}

impl RunResult {
    pub fn count(&self, status: NodeStatus) -> u32 {
        self.outcomes.values().filter(|o| o.status == status).count() as u32
    }
}

/// Layered topological executor for multi-node workflows.
pub struct GraphExecutor {
    registry: Arc<HandlerRegistry>,
    bus: EventBus,
    cache: Arc<Mutex<NodeCache>>,
    default_node_timeout: Option<Duration>,
}

impl GraphExecutor {
    pub fn new(registry: Arc<HandlerRegistry>, bus: EventBus) -> Self {
        Self {
            registry,
            bus,
            cache: Arc::new(Mutex::new(NodeCache::new(256))),
            default_node_timeout: None,
        }
    }

    pub fn with_default_node_timeout(mut self, timeout: Duration) -> Self {
        self.default_node_timeout = Some(timeout);
        self
    }

    /// Apply the configured graph defaults (per-node deadline).
    pub fn from_config(
        registry: Arc<HandlerRegistry>,
        bus: EventBus,
        defaults: &freja_config::GraphDefaults,
    ) -> Self {
        let mut executor = Self::new(registry, bus);
        executor.default_node_timeout = defaults.node_timeout();
        executor
    }

    /// Run a compiled graph to completion.
    pub async fn run(
        &self,
        compiled: &CompiledGraph,
        input: Value,
        cancel: CancellationToken,
    ) -> Result<RunResult, GraphError> {
        let run_id = Uuid::new_v4().to_string();
        let run_bus = self.bus.child();
        run_bus.emit(AgentEvent::WorkflowStarted {
            graph_id: compiled.graph.id.clone(),
            run_id: run_id.clone(),
        });

        // Graph timeout is cancellation with a deadline.
        let run_cancel = cancel.child_token();
        let _watchdog = compiled.graph.timeout.map(|timeout| {
            let token = run_cancel.clone();
            Watchdog(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                token.cancel();
            }))
        });

        let result = self.run_inner(compiled, input, &run_bus, run_id.clone(), &run_cancel).await;
        match &result {
            Ok(run) => {
                run_bus.emit(AgentEvent::WorkflowCompleted {
                    graph_id: compiled.graph.id.clone(),
                    run_id,
                    successful: run.count(NodeStatus::Success),
                    failed: run.count(NodeStatus::Failure),
                    skipped: run.count(NodeStatus::Skipped),
                });
            }
            Err(e) => {
                run_bus.emit(AgentEvent::WorkflowDiagnostic {
                    level: DiagnosticLevel::Error,
                    message: e.to_string(),
                    node_id: None,
                });
            }
        }
        result
    }

    #[async_recursion]
    async fn run_inner(
        &self,
        compiled: &CompiledGraph,
        input: Value,
        run_bus: &EventBus,
        run_id: String,
        cancel: &CancellationToken,
    ) -> Result<RunResult, GraphError> {
        let graph = &compiled.graph;
        let mut result = RunResult { run_id: run_id.clone(), ..Default::default() };

        // Nodes still to execute in the current sweep.
        let mut pending: BTreeSet<String> = compiled.order.iter().cloned().collect();
        let mut iterations_used: u32 = 0;

        loop {
            for (layer_index, layer) in compiled.layers.iter().enumerate() {
                if cancel.is_cancelled() {
                    return Err(GraphError::Canceled);
                }
                let runnable: Vec<&String> =
                    layer.iter().filter(|id| pending.contains(*id)).collect();
                if runnable.is_empty() {
                    continue;
                }
                run_bus.emit(AgentEvent::WorkflowLayerStarted {
                    index: layer_index as u32,
                    nodes: runnable.iter().map(|s| s.to_string()).collect(),
                });

                // Eligibility and input assembly happen serially (cheap);
                // execution happens in parallel.
                let mut scheduled: Vec<(String, Value)> = Vec::new();
                let mut consumer_counts: HashMap<String, usize> = HashMap::new();
                for id in &runnable {
                    let node = &graph.nodes[*id];
                    match self.assemble_input(
                        compiled,
                        node,
                        &input,
                        &result.outcomes,
                        &mut consumer_counts,
                        run_bus,
                    )? {
                        Eligibility::Run(value) => scheduled.push(((*id).clone(), value)),
                        Eligibility::Skip(reason) => {
                            debug!(node = id.as_str(), reason = reason.as_str(), "node skipped");
                            run_bus.emit(AgentEvent::WorkflowNodeSkipped {
                                node_id: (*id).clone(),
                                reason: reason.clone(),
                            });
                            result.outcomes.insert((*id).clone(), NodeOutcome::skipped(reason));
                            pending.remove(*id);
                        }
                    }
                }

                let executions: Vec<_> = scheduled
                    .into_iter()
                    .map(|(id, value)| {
                        let node = graph.nodes[&id].clone();
                        let run_id = run_id.clone();
                        async move {
                            let outcome = self
                                .execute_node(&node, value, run_bus, &run_id, cancel)
                                .await;
                            (id, outcome)
                        }
                    })
                    .collect();

                for (id, outcome) in join_all(executions).await {
                    let outcome = outcome?;
                    *result.executions.entry(id.clone()).or_insert(0) += 1;
                    run_bus.emit(AgentEvent::WorkflowNodeCompleted {
                        node_id: id.clone(),
                        failed: outcome.status == NodeStatus::Failure,
                        error: outcome.error.clone(),
                    });
                    result.outcomes.insert(id.clone(), outcome);
                    pending.remove(&id);
                }

                run_bus.emit(AgentEvent::WorkflowLayerCompleted { index: layer_index as u32 });
            }

            // Back-edge propagation, largest jump first.
            let mut requeued = false;
            for back_edge in &compiled.back_edges {
                let edge = graph
                    .edges
                    .iter()
                    .find(|e| e.from == back_edge.from && e.to == back_edge.to)
                    .expect("back edge derives from an existing edge");
                if !self.back_edge_fires(edge, &result.outcomes)? {
                    continue;
                }
                if iterations_used >= graph.max_iterations {
                    run_bus.emit(AgentEvent::WorkflowDiagnostic {
                        level: DiagnosticLevel::Warn,
                        message: format!(
                            "back edge {} -> {} suppressed: max_iterations ({}) reached",
                            edge.from, edge.to, graph.max_iterations
                        ),
                        node_id: Some(edge.to.clone()),
                    });
                    continue;
                }
                let target = &graph.nodes[&edge.to];
                let count = result.executions.get(&edge.to).copied().unwrap_or(0);
                if let Some(cap) = target.max_executions {
                    if count >= cap {
                        run_bus.emit(AgentEvent::WorkflowDiagnostic {
                            level: DiagnosticLevel::Warn,
                            message: format!(
                                "node '{}' reached max_executions ({cap})",
                                edge.to
                            ),
                            node_id: Some(edge.to.clone()),
                        });
                        continue;
                    }
                }

                iterations_used += 1;
                run_bus.emit(AgentEvent::WorkflowEdgeTraversed {
                    from: edge.from.clone(),
                    to: edge.to.clone(),
                });
                pending = reachable_from(graph, compiled, &edge.to);
                requeued = true;
                break;
            }

            if !requeued {
                break;
            }
        }

        // Deliver into the exit node.
        let exit = &graph.nodes[&graph.exit];
        let mut exit_consumers = HashMap::new();
        if let Eligibility::Run(value) = self.assemble_input(
            compiled,
            exit,
            &input,
            &result.outcomes,
            &mut exit_consumers,
            run_bus,
        )? {
            result.final_output = Some(value);
        }

        Ok(result)
    }

    /// Evaluate a node's incoming edges against completed upstream outcomes
    /// and assemble its input value.
    fn assemble_input(
        &self,
        compiled: &CompiledGraph,
        node: &Node,
        run_input: &Value,
        outcomes: &BTreeMap<String, NodeOutcome>,
        consumer_counts: &mut HashMap<String, usize>,
        run_bus: &EventBus,
    ) -> Result<Eligibility, GraphError> {
        let graph = &compiled.graph;
        let mut incoming: Vec<&Edge> = graph.edges.iter().filter(|e| e.to == node.id).collect();
        incoming.sort_by_key(|e| e.priority);

        if incoming.is_empty() {
            // A source node: receives the run input.
            return Ok(Eligibility::Run(run_input.clone()));
        }

        let is_back = |edge: &Edge| {
            compiled
                .back_edges
                .iter()
                .any(|b| b.from == edge.from && b.to == edge.to)
        };

        let upstream_condition =
            incoming.iter().find_map(|e| e.condition.as_ref().filter(|c| c.is_upstream()));

        // Upstream termination bookkeeping.  Start counts as a successful
        // upstream carrying the run input.  Back-edge sources are excluded:
        // they have not run yet on the first sweep and deliver only through
        // re-queues.
        let mut all_done = true;
        let mut any_success = false;
        let mut any_failure = false;
        for edge in &incoming {
            if is_start(graph, &edge.from) {
                any_success = true;
                continue;
            }
            if is_back(*edge) {
                continue;
            }
            match outcomes.get(&edge.from) {
                Some(outcome) => {
                    match outcome.status {
                        NodeStatus::Success => any_success = true,
                        NodeStatus::Failure => any_failure = true,
                        NodeStatus::Skipped => {}
                    };
                }
                None => all_done = false,
            }
        }

        let eligible = match upstream_condition {
            Some(EdgeCondition::UpstreamOneSuccess) => any_success,
            Some(EdgeCondition::UpstreamAllDone) => all_done,
            Some(EdgeCondition::UpstreamAllDoneOneSuccess) => all_done && any_success,
            _ => {
                // Default propagation: every upstream must have terminated;
                // the per-edge delivery check below decides the rest.
                all_done
            }
        };
        if !eligible {
            return Ok(Eligibility::Skip(match upstream_condition {
                Some(c) => format!("upstream condition {c:?} not met"),
                None => "upstream not terminated".to_string(),
            }));
        }

        // Collect delivering edges.  An explicit to_port forces keyed-object
        // delivery so consumers see stable slot names regardless of how many
        // branches survived.
        let mut delivered: Vec<(String, Value)> = Vec::new();
        let mut keyed = false;
        for edge in &incoming {
            let source_output: Option<Value> = if is_start(graph, &edge.from) {
                Some(run_input.clone())
            } else {
                match outcomes.get(&edge.from) {
                    Some(o) if o.status == NodeStatus::Success => o.output.clone(),
                    _ => None,
                }
            };
            let Some(output) = source_output else { continue };

            let passes = match &edge.condition {
                None => true,
                Some(c) if c.is_upstream() => true,
                Some(condition) => self.evaluate_field_condition(condition, &output)?,
            };
            if !passes {
                continue;
            }

            run_bus.emit(AgentEvent::WorkflowEdgeTraversed {
                from: edge.from.clone(),
                to: edge.to.clone(),
            });

            let policy = edge.cloning.unwrap_or(graph.default_cloning);
            let consumed = consumer_counts.entry(edge.from.clone()).or_insert(0);
            *consumed += 1;
            let value = match policy {
                CloningPolicy::AlwaysClone => deep_clone(&edge.from, &output)?,
                CloningPolicy::NeverClone => output,
                CloningPolicy::CloneOnWrite => {
                    if *consumed > 1 {
                        deep_clone(&edge.from, &output)?
                    } else {
                        output
                    }
                }
            };
            let key = match &edge.to_port {
                Some(port) => {
                    keyed = true;
                    port.clone()
                }
                None => edge.from.clone(),
            };
            delivered.push((key, value));
        }

        if delivered.is_empty() {
            return Ok(Eligibility::Skip(if any_failure {
                "upstream failure".to_string()
            } else {
                "no incoming edge delivered".to_string()
            }));
        }
        if delivered.len() == 1 && !keyed {
            return Ok(Eligibility::Run(delivered.into_iter().next().unwrap().1));
        }
        let mut merged = Map::new();
        for (key, value) in delivered {
            merged.insert(key, value);
        }
        Ok(Eligibility::Run(Value::Object(merged)))
    }

    fn evaluate_field_condition(
        &self,
        condition: &EdgeCondition,
        output: &Value,
    ) -> Result<bool, GraphError> {
        Ok(match condition {
            EdgeCondition::FieldEquals { field, value } => output.get(field) == Some(value),
            EdgeCondition::FieldExists { field } => output.get(field).is_some(),
            EdgeCondition::FieldPredicate { name } => {
                let predicate = self.registry.predicate(name)?;
                predicate(output)
            }
            _ => true,
        })
    }

    fn back_edge_fires(
        &self,
        edge: &Edge,
        outcomes: &BTreeMap<String, NodeOutcome>,
    ) -> Result<bool, GraphError> {
        let Some(outcome) = outcomes.get(&edge.from) else {
            return Ok(false);
        };
        if outcome.status != NodeStatus::Success {
            return Ok(false);
        }
        let output = outcome.output.clone().unwrap_or(Value::Null);
        match &edge.condition {
            None => Ok(true),
            Some(c) if c.is_upstream() => Ok(true),
            Some(condition) => self.evaluate_field_condition(condition, &output),
        }
    }

    /// Execute one node, honoring retry, timeout, cache, and kind semantics.
    #[async_recursion]
    async fn execute_node(
        &self,
        node: &Node,
        input: Value,
        run_bus: &EventBus,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<NodeOutcome, GraphError> {
        run_bus.emit(AgentEvent::WorkflowNodeStarted { node_id: node.id.clone() });

        let attempts = node.retry_policy.as_ref().map(|p| p.max_attempts.max(1)).unwrap_or(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = self.execute_once(node, input.clone(), run_bus, run_id, cancel).await;
            match outcome {
                Err(GraphError::Canceled) => return Err(GraphError::Canceled),
                Err(other) => return Err(other),
                Ok(Ok(value)) => return Ok(NodeOutcome::success(value)),
                Ok(Err(node_error)) => {
                    if node_error.severity == Severity::Transient && attempt < attempts {
                        let policy = node.retry_policy.clone().unwrap_or_default();
                        let factor = policy.multiplier.powi(attempt.saturating_sub(1) as i32);
                        let delay = Duration::from_millis(
                            (policy.base_delay.as_millis() as f64 * factor) as u64,
                        );
                        warn!(
                            node = node.id.as_str(),
                            attempt,
                            error = %node_error,
                            "retrying transient node failure"
                        );
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(GraphError::Canceled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        continue;
                    }
                    if node_error.severity == Severity::Fatal {
                        run_bus.emit(AgentEvent::WorkflowDiagnostic {
                            level: DiagnosticLevel::Error,
                            message: node_error.message.clone(),
                            node_id: Some(node.id.clone()),
                        });
                    }
                    return Ok(NodeOutcome::failure(node_error.message));
                }
            }
        }
    }

    /// One attempt at a node body.  The outer `Result` carries run-level
    /// failures (cancellation, misconfiguration); the inner one carries the
    /// node's own verdict.
    async fn execute_once(
        &self,
        node: &Node,
        input: Value,
        run_bus: &EventBus,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Result<Value, NodeError>, GraphError> {
        match &node.kind {
            NodeKind::Start | NodeKind::End | NodeKind::Router => Ok(Ok(input)),

            NodeKind::Handler => {
                let name = node
                    .handler_name
                    .as_deref()
                    .ok_or_else(|| GraphError::UnknownHandler(node.id.clone()))?;
                let handler = self.registry.handler(name)?;

                // Cache lookup before the handler runs.
                let cache_key = node.cache_strategy.map(|strategy| {
                    NodeCache::fingerprint(
                        strategy,
                        &node.id,
                        &input,
                        handler.code_version(),
                        &node.config,
                    )
                });
                if let (Some(key), Some(ttl)) = (&cache_key, node.cache_ttl) {
                    if let Some(hit) = self.cache.lock().unwrap().get(key, ttl) {
                        debug!(node = node.id.as_str(), "cache hit");
                        return Ok(Ok(hit));
                    }
                }

                let ctx = NodeContext {
                    node_id: node.id.clone(),
                    run_id: run_id.to_string(),
                    config: node.config.clone(),
                    bus: run_bus.child(),
                    cancel: cancel.clone(),
                };
                let deadline = node.timeout.or(self.default_node_timeout);
                let work = handler.run(input, ctx);
                let verdict = match deadline {
                    Some(timeout) => tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(GraphError::Canceled),
                        result = tokio::time::timeout(timeout, work) => match result {
                            Ok(v) => v,
                            // Transient so the node's retry policy covers a
                            // deadline miss; without one the failure stands.
                            Err(_) => Err(NodeError::transient(format!(
                                "node timed out after {timeout:?}"
                            ))),
                        },
                    },
                    None => tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(GraphError::Canceled),
                        result = work => result,
                    },
                };

                if let (Ok(value), Some(key)) = (&verdict, cache_key) {
                    self.cache.lock().unwrap().put(key, value.clone());
                }
                Ok(verdict)
            }

            NodeKind::SubGraph(inner) => {
                let compiled = compile((**inner).clone())?;
                let sub = self
                    .run_inner(
                        &compiled,
                        input,
                        &run_bus.child(),
                        Uuid::new_v4().to_string(),
                        cancel,
                    )
                    .await?;
                if sub.count(NodeStatus::Failure) > 0 && sub.final_output.is_none() {
                    return Ok(Err(NodeError::recoverable(format!(
                        "sub-graph '{}' failed without reaching its exit",
                        compiled.graph.id
                    ))));
                }
                Ok(Ok(sub.final_output.unwrap_or(Value::Null)))
            }

            NodeKind::Map(map) => {
                let Value::Array(items) = input else {
                    return Ok(Err(NodeError::fatal("map node input must be a collection")));
                };
                // The node's input buffer caps in-flight item deliveries.
                let limit = node.input_buffer.unwrap_or(items.len().max(1));
                let semaphore = Arc::new(tokio::sync::Semaphore::new(limit));

                let mut futures = Vec::with_capacity(items.len());
                for (index, item) in items.into_iter().enumerate() {
                    let semaphore = Arc::clone(&semaphore);
                    let router = map.router.clone();
                    let item_bus = run_bus.child();
                    futures.push(async move {
                        let _permit = semaphore
                            .acquire()
                            .await
                            .map_err(|_| GraphError::Canceled)?;
                        let processor = match router {
                            MapRouterSpec::Static(graph) => *graph,
                            MapRouterSpec::Named(name) => {
                                let router = self.registry.router(&name)?;
                                match router.route(&item).await {
                                    Ok(graph) => graph,
                                    Err(e) => return Ok::<_, GraphError>((index, Err(e))),
                                }
                            }
                        };
                        let compiled = compile(processor)?;
                        let sub = self
                            .run_inner(
                                &compiled,
                                item,
                                &item_bus,
                                Uuid::new_v4().to_string(),
                                cancel,
                            )
                            .await?;
                        let verdict = if sub.count(NodeStatus::Failure) > 0
                            && sub.final_output.is_none()
                        {
                            Err(NodeError::recoverable(format!(
                                "map item {index} failed in processor '{}'",
                                compiled.graph.id
                            )))
                        } else {
                            Ok(sub.final_output.unwrap_or(Value::Null))
                        };
                        Ok((index, verdict))
                    });
                }

                let mut outputs: Vec<Option<Value>> = Vec::new();
                let mut first_error: Option<NodeError> = None;
                let mut results: Vec<(usize, Result<Value, NodeError>)> = Vec::new();
                for item in join_all(futures).await {
                    results.push(item?);
                }
                results.sort_by_key(|(index, _)| *index);
                for (_, verdict) in results {
                    match verdict {
                        Ok(value) => outputs.push(Some(value)),
                        Err(e) => {
                            if first_error.is_none() {
                                first_error = Some(e);
                            }
                            outputs.push(None);
                        }
                    }
                }
                match first_error {
                    Some(e) => Ok(Err(e)),
                    None => Ok(Ok(Value::Array(
                        outputs.into_iter().map(|v| v.unwrap_or(Value::Null)).collect(),
                    ))),
                }
            }
        }
    }
}

enum Eligibility {
    Run(Value),
    Skip(String),
}

fn is_start(graph: &Graph, node_id: &str) -> bool {
    matches!(graph.nodes.get(node_id).map(|n| &n.kind), Some(NodeKind::Start))
}

/// The target of a fired back-edge plus everything reachable from it over
/// forward edges — the set that re-executes on the next sweep.
fn reachable_from(graph: &Graph, compiled: &CompiledGraph, target: &str) -> BTreeSet<String> {
    let index_of: HashMap<&String, usize> =
        compiled.order.iter().enumerate().map(|(i, id)| (id, i)).collect();
    let mut reached = BTreeSet::new();
    let mut frontier = vec![target.to_string()];
    while let Some(id) = frontier.pop() {
        if !reached.insert(id.clone()) {
            continue;
        }
        for edge in &graph.edges {
            if edge.from != id {
                continue;
            }
            let (Some(&from), Some(&to)) =
                (index_of.get(&edge.from), index_of.get(&edge.to))
            else {
                continue;
            };
            // Forward edges only; a nested back-edge does not extend the set.
            if to > from {
                frontier.push(edge.to.clone());
            }
        }
    }
    reached
}

/// Abort the graph-timeout watchdog when the run finishes first.
struct Watchdog(tokio::task::JoinHandle<()>);

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.0.abort();
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
