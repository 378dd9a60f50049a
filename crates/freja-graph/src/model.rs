// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{Map, Value};

use crate::{artifacts::ArtifactKey, namespace::validate_namespace, GraphError};

/// How outputs crossing an edge are shared with the consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CloningPolicy {
    /// Deep-clone for every consumer.
    #[default]
    AlwaysClone,
    /// Hand the value through; consumers share.
    NeverClone,
    /// First consumer gets the value, additional consumers get clones.
    CloneOnWrite,
}

/// Retry policy for transient node failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_attempts: 3, base_delay: Duration::from_millis(100), multiplier: 2.0 }
    }
}

/// Condition gating an edge.  Field conditions evaluate against the source
/// node's output; upstream conditions aggregate over all of the target's
/// upstream terminations.
#[derive(Debug, Clone, PartialEq)]
pub enum EdgeCondition {
    FieldEquals { field: String, value: Value },
    FieldExists { field: String },
    /// Named predicate resolved from the handler registry at run time.
    FieldPredicate { name: String },
    UpstreamOneSuccess,
    UpstreamAllDone,
    UpstreamAllDoneOneSuccess,
}

impl EdgeCondition {
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            Self::UpstreamOneSuccess | Self::UpstreamAllDone | Self::UpstreamAllDoneOneSuccess
        )
    }
}

#[derive(Debug, Clone)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub from_port: Option<String>,
    pub to_port: Option<String>,
    /// Lower value evaluates first where order matters.
    pub priority: i32,
    pub condition: Option<EdgeCondition>,
    /// Edge-level override of the graph's cloning default.
    pub cloning: Option<CloningPolicy>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            from_port: None,
            to_port: None,
            priority: 0,
            condition: None,
            cloning: None,
        }
    }

    pub fn with_condition(mut self, condition: EdgeCondition) -> Self {
        self.condition = Some(condition);
        self
    }

    /// Name the input slot this edge feeds.  A named port always delivers as
    /// a keyed object, even when it is the only delivering edge.
    pub fn with_to_port(mut self, port: impl Into<String>) -> Self {
        self.to_port = Some(port.into());
        self
    }

    pub fn with_cloning(mut self, cloning: CloningPolicy) -> Self {
        self.cloning = Some(cloning);
        self
    }
}

/// Routing of map items to a processor graph.
#[derive(Debug, Clone)]
pub enum MapRouterSpec {
    /// Every item runs through the same embedded processor graph.
    Static(Box<Graph>),
    /// A registered [`crate::MapRouter`] picks a processor graph per item.
    Named(String),
}

/// Fan-out node: the input collection's items each run through a processor
/// graph in parallel; outputs aggregate in item order.
#[derive(Debug, Clone)]
pub struct MapNode {
    pub router: MapRouterSpec,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    Start,
    End,
    Handler,
    /// Control flow only; passes its input through untouched.
    Router,
    SubGraph(Box<Graph>),
    Map(MapNode),
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub kind: NodeKind,
    /// Registry name of the handler; required for `Handler` nodes.
    pub handler_name: Option<String>,
    pub config: Value,
    pub timeout: Option<Duration>,
    pub retry_policy: Option<RetryPolicy>,
    /// Cap on executions through back-edge re-queues.
    pub max_executions: Option<u32>,
    /// Namespace segments this node contributes to its subtree.
    pub artifact_namespace: Vec<String>,
    pub produces_artifact: Option<ArtifactKey>,
    /// Cap on in-flight deliveries into this node (map fan-out pressure).
    pub input_buffer: Option<usize>,
    pub cache_strategy: Option<crate::CacheKeyStrategy>,
    pub cache_ttl: Option<Duration>,
}

impl Node {
    fn with_kind(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: id.into(),
            kind,
            handler_name: None,
            config: Value::Null,
            timeout: None,
            retry_policy: None,
            max_executions: None,
            artifact_namespace: Vec::new(),
            produces_artifact: None,
            input_buffer: None,
            cache_strategy: None,
            cache_ttl: None,
        }
    }

    pub fn start(id: impl Into<String>) -> Self {
        Self::with_kind(id, NodeKind::Start)
    }

    pub fn end(id: impl Into<String>) -> Self {
        Self::with_kind(id, NodeKind::End)
    }

    pub fn handler(id: impl Into<String>, handler_name: impl Into<String>) -> Self {
        let mut node = Self::with_kind(id, NodeKind::Handler);
        node.handler_name = Some(handler_name.into());
        node
    }

    pub fn router(id: impl Into<String>) -> Self {
        Self::with_kind(id, NodeKind::Router)
    }

    pub fn sub_graph(id: impl Into<String>, graph: Graph) -> Self {
        Self::with_kind(id, NodeKind::SubGraph(Box::new(graph)))
    }

    pub fn map(id: impl Into<String>, router: MapRouterSpec) -> Self {
        Self::with_kind(id, NodeKind::Map(MapNode { router }))
    }

    pub fn with_namespace(mut self, segments: &[&str]) -> Self {
        self.artifact_namespace = segments.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_artifact(mut self, key: ArtifactKey) -> Self {
        self.produces_artifact = Some(key);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_max_executions(mut self, cap: u32) -> Self {
        self.max_executions = Some(cap);
        self
    }

    pub fn with_cache(mut self, strategy: crate::CacheKeyStrategy, ttl: Duration) -> Self {
        self.cache_strategy = Some(strategy);
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn with_input_buffer(mut self, cap: usize) -> Self {
        self.input_buffer = Some(cap);
        self
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }
}

/// A multi-node workflow.  Nodes are held by id; edges reference ids — the
/// structure is cycle-capable without embedded references.
#[derive(Debug, Clone)]
pub struct Graph {
    pub id: String,
    pub name: String,
    pub version: String,
    pub nodes: BTreeMap<String, Node>,
    pub edges: Vec<Edge>,
    pub entry: String,
    pub exit: String,
    /// Back-edge re-execution cap.
    pub max_iterations: u32,
    pub timeout: Option<Duration>,
    pub metadata: Map<String, Value>,
    /// Default cloning policy for edges that do not set their own.
    pub default_cloning: CloningPolicy,
}

impl Graph {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let mut graph = Self {
            id: id.into(),
            name: name.into(),
            version: "1".to_string(),
            nodes: BTreeMap::new(),
            edges: Vec::new(),
            entry: "start".to_string(),
            exit: "end".to_string(),
            max_iterations: 25,
            timeout: None,
            metadata: Map::new(),
            default_cloning: CloningPolicy::AlwaysClone,
        };
        graph.nodes.insert("start".into(), Node::start("start"));
        graph.nodes.insert("end".into(), Node::end("end"));
        graph
    }

    pub fn add_node(mut self, node: Node) -> Self {
        self.nodes.insert(node.id.clone(), node);
        self
    }

    pub fn add_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn with_max_iterations(mut self, cap: u32) -> Self {
        self.max_iterations = cap;
        self
    }

    /// Structural validation: boundary nodes, edge endpoints, namespaces,
    /// and per-target upstream-condition homogeneity.
    pub fn validate(&self) -> Result<(), GraphError> {
        match self.nodes.get(&self.entry).map(|n| &n.kind) {
            Some(NodeKind::Start) => {}
            _ => {
                return Err(GraphError::BadBoundary(format!(
                    "entry '{}' must be a Start node",
                    self.entry
                )))
            }
        }
        match self.nodes.get(&self.exit).map(|n| &n.kind) {
            Some(NodeKind::End) => {}
            _ => {
                return Err(GraphError::BadBoundary(format!(
                    "exit '{}' must be an End node",
                    self.exit
                )))
            }
        }

        for edge in &self.edges {
            for endpoint in [&edge.from, &edge.to] {
                if !self.nodes.contains_key(endpoint) {
                    return Err(GraphError::UnknownEdgeEndpoint(endpoint.clone()));
                }
            }
        }

        for node in self.nodes.values() {
            if !node.artifact_namespace.is_empty() {
                validate_namespace(&node.artifact_namespace)?;
            }
            if let Some(key) = &node.produces_artifact {
                validate_namespace(&key.path)?;
            }
        }

        // Either all of a target's incoming edges share one upstream
        // condition type, or none carries one.
        for (id, _) in &self.nodes {
            let incoming: Vec<&Edge> = self.edges.iter().filter(|e| &e.to == id).collect();
            let upstream: Vec<&EdgeCondition> = incoming
                .iter()
                .filter_map(|e| e.condition.as_ref())
                .filter(|c| c.is_upstream())
                .collect();
            if !upstream.is_empty() {
                let first = upstream[0];
                let homogeneous = upstream.iter().all(|c| *c == first)
                    && upstream.len() == incoming.len();
                if !homogeneous {
                    return Err(GraphError::MixedUpstreamConditions { node_id: id.clone() });
                }
            }
        }

        // Sub-graphs and map processor graphs validate recursively.
        for node in self.nodes.values() {
            match &node.kind {
                NodeKind::SubGraph(graph) => graph.validate()?,
                NodeKind::Map(map) => {
                    if let MapRouterSpec::Static(graph) = &map.router {
                        graph.validate()?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_graph_has_start_and_end() {
        let g = Graph::new("g1", "test");
        assert!(g.validate().is_ok());
        assert!(matches!(g.nodes["start"].kind, NodeKind::Start));
        assert!(matches!(g.nodes["end"].kind, NodeKind::End));
    }

    #[test]
    fn edge_to_unknown_node_fails_validation() {
        let g = Graph::new("g1", "test").add_edge(Edge::new("start", "ghost"));
        assert!(matches!(g.validate(), Err(GraphError::UnknownEdgeEndpoint(_))));
    }

    #[test]
    fn bad_namespace_fails_validation() {
        let g = Graph::new("g1", "test")
            .add_node(Node::handler("a", "h").with_namespace(&["bad--ns"]));
        assert!(matches!(g.validate(), Err(GraphError::InvalidNamespace { .. })));
    }

    #[test]
    fn mixed_upstream_conditions_fail_validation() {
        let g = Graph::new("g1", "test")
            .add_node(Node::handler("a", "h"))
            .add_node(Node::handler("b", "h"))
            .add_node(Node::handler("c", "h"))
            .add_edge(Edge::new("a", "c").with_condition(EdgeCondition::UpstreamOneSuccess))
            .add_edge(Edge::new("b", "c").with_condition(EdgeCondition::UpstreamAllDone));
        assert!(matches!(g.validate(), Err(GraphError::MixedUpstreamConditions { .. })));
    }

    #[test]
    fn partially_conditioned_upstream_edges_fail_validation() {
        let g = Graph::new("g1", "test")
            .add_node(Node::handler("a", "h"))
            .add_node(Node::handler("b", "h"))
            .add_node(Node::handler("c", "h"))
            .add_edge(Edge::new("a", "c").with_condition(EdgeCondition::UpstreamAllDone))
            .add_edge(Edge::new("b", "c"));
        assert!(matches!(g.validate(), Err(GraphError::MixedUpstreamConditions { .. })));
    }

    #[test]
    fn homogeneous_upstream_conditions_pass() {
        let g = Graph::new("g1", "test")
            .add_node(Node::handler("a", "h"))
            .add_node(Node::handler("b", "h"))
            .add_node(Node::handler("c", "h"))
            .add_edge(Edge::new("a", "c").with_condition(EdgeCondition::UpstreamAllDoneOneSuccess))
            .add_edge(Edge::new("b", "c").with_condition(EdgeCondition::UpstreamAllDoneOneSuccess));
        assert!(g.validate().is_ok());
    }

    #[test]
    fn field_conditions_are_not_upstream() {
        assert!(!EdgeCondition::FieldExists { field: "x".into() }.is_upstream());
        assert!(EdgeCondition::UpstreamOneSuccess.is_upstream());
    }
}
