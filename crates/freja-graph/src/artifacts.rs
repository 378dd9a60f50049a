// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::model::{Graph, MapRouterSpec, NodeKind};

/// A namespaced path identifying a typed output a node declares to produce.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ArtifactKey {
    pub path: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
}

impl ArtifactKey {
    pub fn new(parts: &[&str]) -> Self {
        Self { path: parts.iter().map(|s| s.to_string()).collect(), partition: None }
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    /// The canonical string used for index lookups.
    pub fn qualified(&self, namespace: &[String]) -> String {
        let mut segments: Vec<&str> = namespace.iter().map(String::as_str).collect();
        segments.extend(self.path.iter().map(String::as_str));
        match &self.partition {
            Some(p) => format!("{}#{p}", segments.join(".")),
            None => segments.join("."),
        }
    }
}

/// O(1) producer lookup: which node ids declare a given artifact key, with
/// the key qualified by the producing node's accumulated namespace.
///
/// Derived from the graph; rebuild after any graph change.
#[derive(Debug, Default)]
pub struct ArtifactIndex {
    producers: HashMap<String, BTreeSet<String>>,
}

impl ArtifactIndex {
    pub fn build(graph: &Graph) -> Self {
        let mut index = Self::default();
        index.walk(graph, &[]);
        index
    }

    fn walk(&mut self, graph: &Graph, prefix: &[String]) {
        for node in graph.nodes.values() {
            let mut namespace = prefix.to_vec();
            namespace.extend(node.artifact_namespace.iter().cloned());

            if let Some(key) = &node.produces_artifact {
                self.producers
                    .entry(key.qualified(&namespace))
                    .or_default()
                    .insert(node.id.clone());
            }

            match &node.kind {
                NodeKind::SubGraph(inner) => self.walk(inner, &namespace),
                NodeKind::Map(map) => {
                    if let MapRouterSpec::Static(inner) = &map.router {
                        self.walk(inner, &namespace);
                    }
                }
                _ => {}
            }
        }
    }

    /// The exact set of producing node ids for a fully-qualified key.
    pub fn producers(&self, qualified_key: &str) -> BTreeSet<String> {
        self.producers.get(qualified_key).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.producers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.is_empty()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
