// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::{
    artifacts::ArtifactIndex,
    model::{Graph, NodeKind},
    GraphError,
};

/// An edge whose source is topologically later than its target; expresses a
/// cycle whose re-execution the run caps with `graph.max_iterations`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackEdge {
    pub from: String,
    pub to: String,
    /// Topological distance jumped backwards; larger jumps re-queue first.
    pub jump: usize,
}

/// A validated graph with its derived execution structures.
pub struct CompiledGraph {
    pub graph: Graph,
    /// Topological order over Handler/Router/SubGraph/Map nodes.
    pub order: Vec<String>,
    /// Execution layers: all nodes in a layer are eligible for parallel
    /// scheduling.
    pub layers: Vec<Vec<String>>,
    /// Sorted by descending jump distance for deterministic tie-break.
    pub back_edges: Vec<BackEdge>,
    pub artifacts: ArtifactIndex,
}

/// Validate and compile: Kahn's algorithm over the interior nodes (Start and
/// End excluded), with a deterministic cycle break — when no zero-in-degree
/// node remains, the lexicographically smallest remaining node is forced into
/// its own layer and the edges that kept it blocked become back-edges.
pub fn compile(graph: Graph) -> Result<CompiledGraph, GraphError> {
    graph.validate()?;

    let interior: BTreeSet<String> = graph
        .nodes
        .values()
        .filter(|n| !matches!(n.kind, NodeKind::Start | NodeKind::End))
        .map(|n| n.id.clone())
        .collect();

    // Adjacency over interior nodes only.
    let mut in_degree: BTreeMap<String, usize> =
        interior.iter().map(|id| (id.clone(), 0)).collect();
    let mut outgoing: BTreeMap<String, Vec<String>> =
        interior.iter().map(|id| (id.clone(), Vec::new())).collect();
    for edge in &graph.edges {
        if interior.contains(&edge.from) && interior.contains(&edge.to) {
            outgoing.get_mut(&edge.from).unwrap().push(edge.to.clone());
            *in_degree.get_mut(&edge.to).unwrap() += 1;
        }
    }

    let mut order: Vec<String> = Vec::with_capacity(interior.len());
    let mut layers: Vec<Vec<String>> = Vec::new();
    let mut remaining: BTreeSet<String> = interior.clone();

    while !remaining.is_empty() {
        let mut layer: Vec<String> = remaining
            .iter()
            .filter(|id| in_degree[*id] == 0)
            .cloned()
            .collect();

        if layer.is_empty() {
            // Cycle: force the smallest remaining node, deterministically.
            let forced = remaining.iter().next().unwrap().clone();
            debug!(node = forced.as_str(), "breaking cycle during layering");
            layer.push(forced);
        }

        for id in &layer {
            remaining.remove(id);
            order.push(id.clone());
            for succ in &outgoing[id] {
                if remaining.contains(succ) {
                    let d = in_degree.get_mut(succ).unwrap();
                    *d = d.saturating_sub(1);
                }
            }
        }
        layers.push(layer);
    }

    let index_of: BTreeMap<&String, usize> =
        order.iter().enumerate().map(|(i, id)| (id, i)).collect();
    let mut back_edges: Vec<BackEdge> = graph
        .edges
        .iter()
        .filter_map(|e| {
            let from = *index_of.get(&e.from)?;
            let to = *index_of.get(&e.to)?;
            (from > to).then(|| BackEdge { from: e.from.clone(), to: e.to.clone(), jump: from - to })
        })
        .collect();
    back_edges.sort_by(|a, b| b.jump.cmp(&a.jump).then_with(|| a.from.cmp(&b.from)));

    let artifacts = ArtifactIndex::build(&graph);

    Ok(CompiledGraph { graph, order, layers, back_edges, artifacts })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
