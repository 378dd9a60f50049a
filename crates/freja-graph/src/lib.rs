// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod agent_node;
mod artifacts;
mod cache;
mod cloning;
mod compile;
mod error;
mod executor;
mod handler;
mod model;
mod namespace;

pub use agent_node::AgentNodeHandler;
pub use artifacts::{ArtifactIndex, ArtifactKey};
pub use cache::{CacheKeyStrategy, NodeCache};
pub use cloning::deep_clone;
pub use compile::{compile, BackEdge, CompiledGraph};
pub use error::{GraphError, NodeError, Severity};
pub use executor::{GraphExecutor, NodeOutcome, NodeStatus, RunResult};
pub use handler::{HandlerRegistry, MapRouter, NodeContext, NodeHandler};
pub use model::{
    CloningPolicy, Edge, EdgeCondition, Graph, MapNode, MapRouterSpec, Node, NodeKind, RetryPolicy,
};
pub use namespace::validate_namespace;
