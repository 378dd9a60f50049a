// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use freja_model::Message;

/// A middleware's persisted state with the schema version it was written at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedState {
    pub version: u32,
    pub value: Value,
}

/// Per-turn bookkeeping about what the model asked for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationMetadata {
    pub had_function_calls: bool,
    pub function_calls: Vec<String>,
    pub function_call_count: u32,
}

/// The loop's intra-turn execution state.  Present on a session only while a
/// turn is in flight; captured verbatim into execution checkpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentLoopState {
    pub iteration: u32,
    pub max_iterations: u32,
    /// Working message list for the current turn (post reduction/merging).
    pub current_messages: Vec<Message>,
    /// Call ids approved by a permission prompt this turn; identical parallel
    /// calls do not re-prompt.
    pub approved_tool_call_ids: BTreeSet<String>,
    pub operation_metadata: OperationMetadata,
    /// Turn-scoped middleware state, serialized so suspended middleware
    /// counters survive crash recovery.
    pub middleware_runtime_state: BTreeMap<String, Value>,
}

impl AgentLoopState {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            iteration: 0,
            max_iterations,
            current_messages: Vec::new(),
            approved_tool_call_ids: BTreeSet::new(),
            operation_metadata: OperationMetadata::default(),
            middleware_runtime_state: BTreeMap::new(),
        }
    }

    /// Reset the per-iteration counters after a completed iteration.
    pub fn finish_iteration(&mut self) {
        self.iteration += 1;
        self.operation_metadata = OperationMetadata::default();
    }
}

/// A conversation session.  The session owns its messages: a turn appends to
/// the list and never rewrites it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub messages: Vec<Message>,
    pub metadata: Map<String, Value>,
    /// Middleware persistent state, keyed by each middleware's state key.
    pub persistent_state: BTreeMap<String, VersionedState>,
    /// Present only while a turn is in flight.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_state: Option<AgentLoopState>,
}

impl Session {
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            created_at: now,
            last_activity: now,
            messages: Vec::new(),
            metadata: Map::new(),
            persistent_state: BTreeMap::new(),
            execution_state: None,
        }
    }

    pub fn push(&mut self, msg: Message) {
        self.messages.push(msg);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Check the result-correlation invariant: every `FunctionResult` must be
    /// preceded by a `FunctionCall` with the same call id.
    pub fn results_are_correlated(&self) -> bool {
        let mut seen = BTreeSet::new();
        for msg in &self.messages {
            for part in &msg.contents {
                match part {
                    freja_model::ContentPart::FunctionCall { call_id, .. } => {
                        seen.insert(call_id.clone());
                    }
                    freja_model::ContentPart::FunctionResult { call_id, .. } => {
                        if !seen.contains(call_id) {
                            return false;
                        }
                    }
                    _ => {}
                }
            }
        }
        true
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
