// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod documents;
mod file;
mod memory;
mod session;
mod store;

pub use documents::{
    CheckpointSource, ExecutionCheckpoint, Manifest, ManifestEntry, PendingWrite, PendingWrites,
    SessionSnapshot, SnapshotEntry, CHECKPOINT_VERSION, PENDING_WRITES_VERSION, SNAPSHOT_VERSION,
};
pub use file::FileSessionStore;
pub use memory::MemorySessionStore;
pub use session::{AgentLoopState, OperationMetadata, Session, VersionedState};
pub use store::{MaintenanceReport, SessionStore, StoreError};
