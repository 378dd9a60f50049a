// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde_json::Value;

use crate::GraphError;

/// Deep-clone a node output for delivery across an edge.
///
/// The clone goes through a serialize/deserialize round trip, which keeps the
/// guarantee explicit: whatever crosses an edge is exactly what survives a
/// serializable representation, and the clone is fully independent of the
/// original.  Node payloads are JSON values, so handles to streams, tasks,
/// and cancellation tokens cannot enter edge traffic in the first place; the
/// round trip enforces the same boundary for any future payload type.
pub fn deep_clone(node_id: &str, value: &Value) -> Result<Value, GraphError> {
    let bytes = serde_json::to_vec(value).map_err(|e| GraphError::NotCloneable {
        node_id: node_id.to_string(),
        message: e.to_string(),
    })?;
    serde_json::from_slice(&bytes).map_err(|e| GraphError::NotCloneable {
        node_id: node_id.to_string(),
        message: e.to_string(),
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
