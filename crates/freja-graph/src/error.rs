// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// How bad a node failure is, driving retry and propagation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Propagates as a terminal node result and suppresses success-gated
    /// downstream branches.
    Fatal,
    /// The node failed but the graph may continue per edge conditions.
    Recoverable,
    /// Expected to clear on retry; handled by the node's retry policy.
    Transient,
}

/// A node handler failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct NodeError {
    pub severity: Severity,
    pub message: String,
}

impl NodeError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self { severity: Severity::Fatal, message: message.into() }
    }
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self { severity: Severity::Recoverable, message: message.into() }
    }
    pub fn transient(message: impl Into<String>) -> Self {
        Self { severity: Severity::Transient, message: message.into() }
    }
}

/// Graph build and run failures.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),
    #[error("edge references unknown node '{0}'")]
    UnknownEdgeEndpoint(String),
    #[error("invalid namespace '{namespace}': {message}")]
    InvalidNamespace { namespace: String, message: String },
    #[error("node '{node_id}' mixes upstream condition types on its incoming edges")]
    MixedUpstreamConditions { node_id: String },
    #[error("graph entry/exit misconfigured: {0}")]
    BadBoundary(String),
    #[error("no handler registered under '{0}'")]
    UnknownHandler(String),
    #[error("no map router registered under '{0}'")]
    UnknownRouter(String),
    #[error("no predicate registered under '{0}'")]
    UnknownPredicate(String),
    #[error("node '{node_id}' failed: {source}")]
    Node {
        node_id: String,
        #[source]
        source: NodeError,
    },
    #[error("output of node '{node_id}' is not cloneable: {message}")]
    NotCloneable { node_id: String, message: String },
    #[error("graph run canceled")]
    Canceled,
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
