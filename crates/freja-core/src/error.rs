// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

use freja_events::{BusError, DenialReason, ErrorCode};
use freja_model::ModelError;
use freja_session::StoreError;
use freja_tools::ToolError;

/// Engine-level failures, classified so the event stream and retry policy
/// can react without string matching.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("tool '{name}' failed: {source}")]
    Tool {
        name: String,
        #[source]
        source: ToolError,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A permission request ended in denial.  `turn` distinguishes an
    /// interactive denial (ends the turn) from a stored `AlwaysDeny`
    /// policy (ends only the call).
    #[error("permission denied for '{function_name}'")]
    PermissionDenied {
        function_name: String,
        turn: bool,
        reason: DenialReason,
    },

    #[error("circuit breaker open for '{function_name}'")]
    CircuitOpen { function_name: String },

    #[error("tool '{function_name}' timed out after {timeout:?}")]
    ToolTimedOut {
        function_name: String,
        timeout: Duration,
    },

    #[error("a turn is already running for session {session_id} branch {branch_id}")]
    TurnInProgress {
        session_id: String,
        branch_id: String,
    },

    #[error("turn canceled")]
    Canceled,

    #[error("{0}")]
    Internal(String),
}

impl From<BusError> for AgentError {
    fn from(e: BusError) -> Self {
        match e {
            BusError::Canceled { .. } => Self::Canceled,
            BusError::TimedOut { correlation_id } => {
                Self::Internal(format!("response wait timed out: {correlation_id}"))
            }
        }
    }
}

impl AgentError {
    /// The classification surfaced on `MessageTurnError` events.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Model(m) => match m {
                ModelError::Auth(_) => ErrorCode::Auth,
                ModelError::TransientNetwork(_) => ErrorCode::TransientNetwork,
                ModelError::RateLimit { .. } => ErrorCode::RateLimit,
                ModelError::Client(_) => ErrorCode::ClientError,
                ModelError::ContextLength(_) => ErrorCode::ContextLength,
                ModelError::Server { .. } => ErrorCode::Server,
                ModelError::Canceled => ErrorCode::Canceled,
            },
            Self::Tool { .. } => ErrorCode::Internal,
            Self::Store(_) => ErrorCode::Internal,
            Self::PermissionDenied { .. } => ErrorCode::PermissionDenied,
            Self::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            Self::ToolTimedOut { .. } => ErrorCode::ToolTimeout,
            Self::TurnInProgress { .. } => ErrorCode::TurnInProgress,
            Self::Canceled => ErrorCode::Canceled,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether the retry middleware may re-attempt the failed call.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Model(m) => m.is_retryable(),
            Self::Tool { source, .. } => source.is_transient(),
            _ => false,
        }
    }

    /// Errors that must abort the whole turn rather than become a tool
    /// error payload.
    pub fn terminates_turn(&self) -> bool {
        matches!(
            self,
            Self::Canceled | Self::PermissionDenied { turn: true, .. }
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
