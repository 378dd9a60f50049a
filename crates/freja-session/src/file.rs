// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    ExecutionCheckpoint, MaintenanceReport, Manifest, ManifestEntry, PendingWrites, Session,
    SessionSnapshot, SessionStore, SnapshotEntry, StoreError,
};

/// File-backed session store.
///
/// Layout under the state root:
///
/// ```text
/// sessions/{id}/manifest.json
/// sessions/{id}/snapshots/{snapshot_id}.json
/// sessions/{id}/checkpoints/{checkpoint_id}.json
/// sessions/{id}/pending/{session_id}_{checkpoint_id}.json
/// ```
///
/// Every write goes to a temp file and is renamed into place.  Manifest
/// updates happen after the blob write, so a crash between the two leaves an
/// orphan blob that loading tolerates; a dangling manifest entry (only
/// possible through external deletion) is repaired on read.
pub struct FileSessionStore {
    root: PathBuf,
    /// Serializes manifest read-modify-write cycles within this process.
    manifest_lock: Mutex<()>,
}

impl FileSessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), manifest_lock: Mutex::new(()) }
    }

    fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.sessions_dir().join(session_id)
    }

    fn manifest_path(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("manifest.json")
    }

    fn snapshot_path(&self, session_id: &str, snapshot_id: &str) -> PathBuf {
        self.session_dir(session_id).join("snapshots").join(format!("{snapshot_id}.json"))
    }

    fn checkpoint_path(&self, session_id: &str, checkpoint_id: &str) -> PathBuf {
        self.session_dir(session_id).join("checkpoints").join(format!("{checkpoint_id}.json"))
    }

    fn pending_path(&self, session_id: &str, checkpoint_id: &str) -> PathBuf {
        self.session_dir(session_id).join("pending").join(format!("{session_id}_{checkpoint_id}.json"))
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!("tmp.{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, bytes).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn write_json<T: serde::Serialize>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec_pretty(value)?;
        self.write_atomic(path, &bytes).await
    }

    async fn read_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &Path,
    ) -> Result<Option<T>, StoreError> {
        match tokio::fs::read(path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                StoreError::Corrupt { path: path.display().to_string(), message: e.to_string() }
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_manifest(&self, session_id: &str) -> Result<Manifest, StoreError> {
        Ok(self
            .read_json::<Manifest>(&self.manifest_path(session_id))
            .await?
            .unwrap_or_else(|| Manifest::new(session_id)))
    }

    async fn save_manifest(&self, manifest: &Manifest) -> Result<(), StoreError> {
        self.write_json(&self.manifest_path(&manifest.session_id), manifest).await
    }

    async fn remove_file_if_exists(&self, path: &Path) -> Result<(), StoreError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete the named checkpoints (blobs + pending files) and drop their
    /// manifest entries.  Caller holds the manifest lock.
    async fn delete_checkpoints_locked(
        &self,
        session_id: &str,
        checkpoint_ids: &[String],
    ) -> Result<usize, StoreError> {
        let mut manifest = self.load_manifest(session_id).await?;
        let before = manifest.checkpoints.len();
        manifest.checkpoints.retain(|e| !checkpoint_ids.contains(&e.checkpoint_id));
        let deleted = before - manifest.checkpoints.len();
        self.save_manifest(&manifest).await?;
        for id in checkpoint_ids {
            self.remove_file_if_exists(&self.checkpoint_path(session_id, id)).await?;
            self.remove_file_if_exists(&self.pending_path(session_id, id)).await?;
        }
        Ok(deleted)
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn load_session(&self, id: &str) -> Result<Session, StoreError> {
        let _guard = self.manifest_lock.lock().await;
        let mut manifest = self.load_manifest(id).await?;
        let mut repaired = false;
        let mut surviving = Vec::with_capacity(manifest.snapshots.len());
        let mut loaded: Option<SessionSnapshot> = None;

        for entry in manifest.snapshots.drain(..) {
            if loaded.is_some() {
                surviving.push(entry);
                continue;
            }
            let path = self.snapshot_path(id, &entry.snapshot_id);
            match self.read_json::<SessionSnapshot>(&path).await? {
                Some(snapshot) => {
                    loaded = Some(snapshot);
                    surviving.push(entry);
                }
                None => {
                    warn!(
                        session_id = id,
                        snapshot_id = %entry.snapshot_id,
                        "dropping dangling snapshot manifest entry"
                    );
                    repaired = true;
                }
            }
        }
        manifest.snapshots = surviving;
        if repaired {
            self.save_manifest(&manifest).await?;
        }

        Ok(match loaded {
            Some(snapshot) => snapshot.into_session(),
            None => {
                debug!(session_id = id, "no snapshot found; constructing empty session");
                Session::with_id(id)
            }
        })
    }

    async fn save_snapshot(&self, session: &Session) -> Result<String, StoreError> {
        let snapshot = SessionSnapshot::from_session(session);
        let path = self.snapshot_path(&session.id, &snapshot.snapshot_id);
        // Blob first, manifest second.
        self.write_json(&path, &snapshot).await?;

        let _guard = self.manifest_lock.lock().await;
        let mut manifest = self.load_manifest(&session.id).await?;
        manifest.push_snapshot(SnapshotEntry {
            snapshot_id: snapshot.snapshot_id.clone(),
            created_at: Utc::now(),
        });
        self.save_manifest(&manifest).await?;
        Ok(snapshot.snapshot_id)
    }

    async fn save_checkpoint(&self, checkpoint: &ExecutionCheckpoint) -> Result<(), StoreError> {
        let path = self.checkpoint_path(&checkpoint.session_id, &checkpoint.checkpoint_id);
        self.write_json(&path, checkpoint).await?;

        let _guard = self.manifest_lock.lock().await;
        let mut manifest = self.load_manifest(&checkpoint.session_id).await?;
        manifest.push_checkpoint(ManifestEntry {
            checkpoint_id: checkpoint.checkpoint_id.clone(),
            step: checkpoint.step,
            source: checkpoint.source,
            created_at: checkpoint.created_at,
            parent_checkpoint_id: checkpoint.parent_checkpoint_id.clone(),
        });
        self.save_manifest(&manifest).await?;
        Ok(())
    }

    async fn load_checkpoint_latest(
        &self,
        session_id: &str,
    ) -> Result<Option<ExecutionCheckpoint>, StoreError> {
        let manifest = self.load_manifest(session_id).await?;
        for entry in &manifest.checkpoints {
            let path = self.checkpoint_path(session_id, &entry.checkpoint_id);
            match self.read_json::<ExecutionCheckpoint>(&path).await? {
                Some(cp) => return Ok(Some(cp)),
                None => {
                    warn!(
                        session_id,
                        checkpoint_id = %entry.checkpoint_id,
                        "manifest references missing checkpoint blob; skipping"
                    );
                }
            }
        }
        Ok(None)
    }

    async fn load_checkpoint_at(
        &self,
        session_id: &str,
        checkpoint_id: &str,
    ) -> Result<ExecutionCheckpoint, StoreError> {
        let path = self.checkpoint_path(session_id, checkpoint_id);
        self.read_json::<ExecutionCheckpoint>(&path)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("checkpoint {checkpoint_id}")))
    }

    async fn checkpoint_manifest(
        &self,
        session_id: &str,
    ) -> Result<Vec<ManifestEntry>, StoreError> {
        Ok(self.load_manifest(session_id).await?.checkpoints)
    }

    async fn save_pending_writes(&self, writes: &PendingWrites) -> Result<(), StoreError> {
        let path = self.pending_path(&writes.session_id, &writes.checkpoint_id);
        self.write_json(&path, writes).await
    }

    async fn load_pending_writes(
        &self,
        session_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<PendingWrites>, StoreError> {
        self.read_json(&self.pending_path(session_id, checkpoint_id)).await
    }

    async fn clear_pending_writes(
        &self,
        session_id: &str,
        checkpoint_id: &str,
    ) -> Result<(), StoreError> {
        self.remove_file_if_exists(&self.pending_path(session_id, checkpoint_id)).await
    }

    async fn prune_checkpoints(
        &self,
        session_id: &str,
        keep_latest: usize,
    ) -> Result<usize, StoreError> {
        let _guard = self.manifest_lock.lock().await;
        let manifest = self.load_manifest(session_id).await?;
        let doomed: Vec<String> = manifest
            .checkpoints
            .iter()
            .skip(keep_latest)
            .map(|e| e.checkpoint_id.clone())
            .collect();
        if doomed.is_empty() {
            return Ok(0);
        }
        self.delete_checkpoints_locked(session_id, &doomed).await
    }

    async fn delete_checkpoints(
        &self,
        session_id: &str,
        checkpoint_ids: &[String],
    ) -> Result<(), StoreError> {
        let _guard = self.manifest_lock.lock().await;
        self.delete_checkpoints_locked(session_id, checkpoint_ids).await?;
        Ok(())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut deleted = 0;
        for session_id in self.list_sessions().await? {
            let _guard = self.manifest_lock.lock().await;
            let manifest = self.load_manifest(&session_id).await?;
            let doomed: Vec<String> = manifest
                .checkpoints
                .iter()
                .filter(|e| e.created_at < cutoff)
                .map(|e| e.checkpoint_id.clone())
                .collect();
            if !doomed.is_empty() {
                deleted += self.delete_checkpoints_locked(&session_id, &doomed).await?;
            }
        }
        Ok(deleted)
    }

    async fn delete_inactive_sessions(
        &self,
        threshold: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<MaintenanceReport, StoreError> {
        let mut report = MaintenanceReport { dry_run, ..Default::default() };
        for session_id in self.list_sessions().await? {
            // A session with no snapshot yet loads fresh (last_activity = now)
            // and is therefore never swept.
            let session = self.load_session(&session_id).await?;
            if session.last_activity >= threshold {
                continue;
            }
            let dir = self.session_dir(&session_id);
            let bytes: u64 = walkdir::WalkDir::new(&dir)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter_map(|e| e.metadata().ok())
                .filter(|m| m.is_file())
                .map(|m| m.len())
                .sum();
            report.sessions.push(session_id.clone());
            report.bytes += bytes;
            if !dry_run {
                tokio::fs::remove_dir_all(&dir).await?;
            }
        }
        Ok(report)
    }

    async fn list_sessions(&self) -> Result<Vec<String>, StoreError> {
        let dir = self.sessions_dir();
        let mut sessions = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(sessions),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    sessions.push(name.to_string());
                }
            }
        }
        sessions.sort();
        Ok(sessions)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
