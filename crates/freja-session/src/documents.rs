// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use freja_model::Message;

use crate::{AgentLoopState, Session, VersionedState};

pub const SNAPSHOT_VERSION: u32 = 1;
pub const CHECKPOINT_VERSION: u32 = 1;
pub const PENDING_WRITES_VERSION: u32 = 1;
pub const MANIFEST_VERSION: u32 = 1;

/// Post-turn persistent record of a session.  Small (~20 KB typical).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub version: u32,
    pub snapshot_id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub messages: Vec<Message>,
    pub metadata: Map<String, Value>,
    pub persistent_state: BTreeMap<String, VersionedState>,
}

impl SessionSnapshot {
    pub fn from_session(session: &Session) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            snapshot_id: Uuid::new_v4().to_string(),
            session_id: session.id.clone(),
            created_at: session.created_at,
            last_activity: session.last_activity,
            messages: session.messages.clone(),
            metadata: session.metadata.clone(),
            persistent_state: session.persistent_state.clone(),
        }
    }

    pub fn into_session(self) -> Session {
        Session {
            id: self.session_id,
            created_at: self.created_at,
            last_activity: self.last_activity,
            messages: self.messages,
            metadata: self.metadata,
            persistent_state: self.persistent_state,
            execution_state: None,
        }
    }
}

/// What caused a checkpoint to be written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointSource {
    PerTurn,
    PerIteration,
    Manual,
}

/// Intra-turn snapshot of the loop's execution state.  Larger than a session
/// snapshot (~100 KB typical) since it carries the working message list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionCheckpoint {
    pub version: u32,
    pub checkpoint_id: String,
    pub session_id: String,
    /// The previous checkpoint in this turn's chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_checkpoint_id: Option<String>,
    /// Monotonic per-session step counter.
    pub step: u64,
    pub source: CheckpointSource,
    pub created_at: DateTime<Utc>,
    pub execution_state: AgentLoopState,
}

impl ExecutionCheckpoint {
    pub fn new(
        session_id: impl Into<String>,
        parent: Option<String>,
        step: u64,
        source: CheckpointSource,
        execution_state: AgentLoopState,
    ) -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            checkpoint_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            parent_checkpoint_id: parent,
            step,
            source,
            created_at: Utc::now(),
            execution_state,
        }
    }

    /// A checkpoint whose captured message count exceeds the current
    /// session's is from a divergent past and must not be resumed.
    ///
    /// Recovery is explicit: the store never auto-loads; callers apply this
    /// guard before resuming.
    pub fn is_stale_for(&self, session: &Session) -> bool {
        self.execution_state.current_messages.len() > session.messages.len()
    }
}

/// One not-yet-promoted tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub call_id: String,
    pub value: Value,
}

/// Partial tool results persisted alongside a checkpoint, appended as
/// parallel calls complete and promoted into the next checkpoint on
/// successful iteration completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrites {
    pub version: u32,
    pub session_id: String,
    pub checkpoint_id: String,
    pub results: Vec<PendingWrite>,
}

impl PendingWrites {
    pub fn new(session_id: impl Into<String>, checkpoint_id: impl Into<String>) -> Self {
        Self {
            version: PENDING_WRITES_VERSION,
            session_id: session_id.into(),
            checkpoint_id: checkpoint_id.into(),
            results: Vec::new(),
        }
    }

    pub fn covers(&self, call_id: &str) -> bool {
        self.results.iter().any(|w| w.call_id == call_id)
    }

    /// Record a result; a repeated call id overwrites the earlier value.
    pub fn record(&mut self, call_id: impl Into<String>, value: Value) {
        let call_id = call_id.into();
        if let Some(existing) = self.results.iter_mut().find(|w| w.call_id == call_id) {
            existing.value = value;
        } else {
            self.results.push(PendingWrite { call_id, value });
        }
    }
}

/// Manifest entry for one checkpoint, newest (highest step) first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub checkpoint_id: String,
    pub step: u64,
    pub source: CheckpointSource,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_checkpoint_id: Option<String>,
}

/// Manifest entry for one snapshot, newest first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
}

/// Per-session index of snapshots and checkpoints.
///
/// The manifest is always written AFTER the blob it references, so a crash
/// between the two leaves a recoverable orphan blob — never a dangling
/// manifest entry pointing at nothing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub session_id: String,
    /// Newest first.
    pub snapshots: Vec<SnapshotEntry>,
    /// Sorted by step descending.
    pub checkpoints: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            version: MANIFEST_VERSION,
            session_id: session_id.into(),
            snapshots: Vec::new(),
            checkpoints: Vec::new(),
        }
    }

    pub fn push_snapshot(&mut self, entry: SnapshotEntry) {
        self.snapshots.insert(0, entry);
    }

    pub fn push_checkpoint(&mut self, entry: ManifestEntry) {
        self.checkpoints.push(entry);
        self.checkpoints.sort_by(|a, b| b.step.cmp(&a.step));
    }

    pub fn latest_checkpoint(&self) -> Option<&ManifestEntry> {
        self.checkpoints.first()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
