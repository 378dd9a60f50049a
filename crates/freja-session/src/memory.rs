// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    ExecutionCheckpoint, MaintenanceReport, ManifestEntry, PendingWrites, Session,
    SessionSnapshot, SessionStore, StoreError,
};

#[derive(Default)]
struct MemoryState {
    /// Newest snapshot first, per session.
    snapshots: HashMap<String, Vec<SessionSnapshot>>,
    /// Checkpoints per session, kept sorted by step descending.
    checkpoints: HashMap<String, Vec<ExecutionCheckpoint>>,
    /// Keyed by (session_id, checkpoint_id).
    pending: HashMap<(String, String), PendingWrites>,
}

/// In-memory store for tests and single-process embedding.
#[derive(Default)]
pub struct MemorySessionStore {
    state: Mutex<MemoryState>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn load_session(&self, id: &str) -> Result<Session, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .snapshots
            .get(id)
            .and_then(|v| v.first())
            .cloned()
            .map(SessionSnapshot::into_session)
            .unwrap_or_else(|| Session::with_id(id)))
    }

    async fn save_snapshot(&self, session: &Session) -> Result<String, StoreError> {
        let snapshot = SessionSnapshot::from_session(session);
        let id = snapshot.snapshot_id.clone();
        let mut state = self.state.lock().unwrap();
        state.snapshots.entry(session.id.clone()).or_default().insert(0, snapshot);
        Ok(id)
    }

    async fn save_checkpoint(&self, checkpoint: &ExecutionCheckpoint) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let list = state.checkpoints.entry(checkpoint.session_id.clone()).or_default();
        list.push(checkpoint.clone());
        list.sort_by(|a, b| b.step.cmp(&a.step));
        Ok(())
    }

    async fn load_checkpoint_latest(
        &self,
        session_id: &str,
    ) -> Result<Option<ExecutionCheckpoint>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.checkpoints.get(session_id).and_then(|v| v.first()).cloned())
    }

    async fn load_checkpoint_at(
        &self,
        session_id: &str,
        checkpoint_id: &str,
    ) -> Result<ExecutionCheckpoint, StoreError> {
        let state = self.state.lock().unwrap();
        state
            .checkpoints
            .get(session_id)
            .and_then(|v| v.iter().find(|c| c.checkpoint_id == checkpoint_id))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("checkpoint {checkpoint_id}")))
    }

    async fn checkpoint_manifest(
        &self,
        session_id: &str,
    ) -> Result<Vec<ManifestEntry>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .checkpoints
            .get(session_id)
            .map(|v| {
                v.iter()
                    .map(|c| ManifestEntry {
                        checkpoint_id: c.checkpoint_id.clone(),
                        step: c.step,
                        source: c.source,
                        created_at: c.created_at,
                        parent_checkpoint_id: c.parent_checkpoint_id.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn save_pending_writes(&self, writes: &PendingWrites) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state
            .pending
            .insert((writes.session_id.clone(), writes.checkpoint_id.clone()), writes.clone());
        Ok(())
    }

    async fn load_pending_writes(
        &self,
        session_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<PendingWrites>, StoreError> {
        let state = self.state.lock().unwrap();
        Ok(state.pending.get(&(session_id.to_string(), checkpoint_id.to_string())).cloned())
    }

    async fn clear_pending_writes(
        &self,
        session_id: &str,
        checkpoint_id: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.pending.remove(&(session_id.to_string(), checkpoint_id.to_string()));
        Ok(())
    }

    async fn prune_checkpoints(
        &self,
        session_id: &str,
        keep_latest: usize,
    ) -> Result<usize, StoreError> {
        let mut state = self.state.lock().unwrap();
        let Some(list) = state.checkpoints.get_mut(session_id) else {
            return Ok(0);
        };
        let before = list.len();
        list.truncate(keep_latest);
        Ok(before - list.len())
    }

    async fn delete_checkpoints(
        &self,
        session_id: &str,
        checkpoint_ids: &[String],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(list) = state.checkpoints.get_mut(session_id) {
            list.retain(|c| !checkpoint_ids.contains(&c.checkpoint_id));
        }
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut state = self.state.lock().unwrap();
        let mut deleted = 0;
        for list in state.checkpoints.values_mut() {
            let before = list.len();
            list.retain(|c| c.created_at >= cutoff);
            deleted += before - list.len();
        }
        Ok(deleted)
    }

    async fn delete_inactive_sessions(
        &self,
        threshold: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<MaintenanceReport, StoreError> {
        let mut state = self.state.lock().unwrap();
        let doomed: Vec<String> = state
            .snapshots
            .iter()
            .filter(|(_, v)| v.first().map(|s| s.last_activity < threshold).unwrap_or(false))
            .map(|(id, _)| id.clone())
            .collect();
        if !dry_run {
            for id in &doomed {
                state.snapshots.remove(id);
                state.checkpoints.remove(id);
                state.pending.retain(|(sid, _), _| sid != id);
            }
        }
        Ok(MaintenanceReport { sessions: doomed, bytes: 0, dry_run })
    }

    async fn list_sessions(&self) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().unwrap();
        let mut ids: Vec<String> = state.snapshots.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use freja_model::Message;

    use super::*;
    use crate::{AgentLoopState, CheckpointSource};

    #[tokio::test]
    async fn memory_store_round_trips_a_session() {
        let store = MemorySessionStore::new();
        let mut session = Session::with_id("s");
        session.push(Message::user("hi"));
        store.save_snapshot(&session).await.unwrap();
        let loaded = store.load_session("s").await.unwrap();
        assert_eq!(loaded.messages, session.messages);
    }

    #[tokio::test]
    async fn memory_store_prunes_and_lists() {
        let store = MemorySessionStore::new();
        for step in 1u64..=4 {
            store
                .save_checkpoint(&ExecutionCheckpoint::new(
                    "s",
                    None,
                    step,
                    CheckpointSource::PerIteration,
                    AgentLoopState::new(5),
                ))
                .await
                .unwrap();
        }
        assert_eq!(store.prune_checkpoints("s", 1).await.unwrap(), 3);
        let manifest = store.checkpoint_manifest("s").await.unwrap();
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest[0].step, 4);
    }
}
