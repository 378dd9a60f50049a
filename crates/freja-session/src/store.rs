// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{ExecutionCheckpoint, ManifestEntry, PendingWrites, Session};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("corrupt store entry at {path}: {message}")]
    Corrupt { path: String, message: String },
}

/// Outcome of a `delete_inactive_sessions` sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaintenanceReport {
    /// Sessions that were (or, in a dry run, would be) deleted.
    pub sessions: Vec<String>,
    /// Bytes reclaimed (or reclaimable).
    pub bytes: u64,
    pub dry_run: bool,
}

/// Durable session persistence.
///
/// All writes are atomic (temp-then-rename or equivalent).  Recovery is
/// explicit: the store exposes manifests and load operations but never
/// auto-loads a checkpoint into a turn.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Read the latest snapshot for `id`, or construct a new empty session
    /// with that id when none exists.
    async fn load_session(&self, id: &str) -> Result<Session, StoreError>;

    /// Atomic post-turn write.  Returns the new snapshot id.
    async fn save_snapshot(&self, session: &Session) -> Result<String, StoreError>;

    /// Atomic intra-turn write.
    async fn save_checkpoint(&self, checkpoint: &ExecutionCheckpoint) -> Result<(), StoreError>;

    async fn load_checkpoint_latest(
        &self,
        session_id: &str,
    ) -> Result<Option<ExecutionCheckpoint>, StoreError>;

    async fn load_checkpoint_at(
        &self,
        session_id: &str,
        checkpoint_id: &str,
    ) -> Result<ExecutionCheckpoint, StoreError>;

    /// Checkpoint index for a session, sorted by step descending.
    async fn checkpoint_manifest(
        &self,
        session_id: &str,
    ) -> Result<Vec<ManifestEntry>, StoreError>;

    /// Append-only until promoted into the next checkpoint.
    async fn save_pending_writes(&self, writes: &PendingWrites) -> Result<(), StoreError>;

    async fn load_pending_writes(
        &self,
        session_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<PendingWrites>, StoreError>;

    /// Drop a pending-writes record after its results were promoted.
    async fn clear_pending_writes(
        &self,
        session_id: &str,
        checkpoint_id: &str,
    ) -> Result<(), StoreError>;

    /// Keep the newest `keep_latest` checkpoints, delete the rest.  Returns
    /// the number deleted.
    async fn prune_checkpoints(
        &self,
        session_id: &str,
        keep_latest: usize,
    ) -> Result<usize, StoreError>;

    async fn delete_checkpoints(
        &self,
        session_id: &str,
        checkpoint_ids: &[String],
    ) -> Result<(), StoreError>;

    /// Delete checkpoints older than `cutoff` across all sessions.  Returns
    /// the number deleted.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Delete whole sessions whose last activity predates `threshold`.
    async fn delete_inactive_sessions(
        &self,
        threshold: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<MaintenanceReport, StoreError>;

    async fn list_sessions(&self) -> Result<Vec<String>, StoreError>;
}
