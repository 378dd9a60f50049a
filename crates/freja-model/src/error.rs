// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::time::Duration;

/// Classified model-call failures.
///
/// The classification drives retry behavior: `is_retryable` errors are
/// retried with exponential backoff by the callers that choose to; everything
/// else surfaces immediately.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Credentials missing or rejected.  Never retried.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// Timeout, connection reset, DNS failure.  Retried with backoff.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Provider rate limit.  `retryable` distinguishes a throttle (retry
    /// after the hint) from an exhausted quota (terminal).
    #[error("rate limited: {message}")]
    RateLimit {
        message: String,
        retryable: bool,
        /// Vendor-provided wait hint, when present.
        retry_after: Option<Duration>,
    },

    /// Malformed request or invalid schema.  Never retried.
    #[error("client error: {0}")]
    Client(String),

    /// Prompt exceeds the model's context window.  Never retried.
    #[error("context length exceeded: {0}")]
    ContextLength(String),

    /// Upstream 5xx.  Retried.
    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    /// Cooperative cancellation.  Propagated, never retried.
    #[error("model call canceled")]
    Canceled,
}

impl ModelError {
    /// Whether a caller should retry this failure with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientNetwork(_) | Self::Server { .. } => true,
            Self::RateLimit { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Vendor-provided backoff hint, when one exists.
    pub fn retry_hint(&self) -> Option<Duration> {
        match self {
            Self::RateLimit { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_server_errors_are_retryable() {
        assert!(ModelError::TransientNetwork("reset".into()).is_retryable());
        assert!(ModelError::Server { status: 503, message: "overloaded".into() }.is_retryable());
    }

    #[test]
    fn auth_client_context_cancel_are_terminal() {
        assert!(!ModelError::Auth("no key".into()).is_retryable());
        assert!(!ModelError::Client("bad schema".into()).is_retryable());
        assert!(!ModelError::ContextLength("too long".into()).is_retryable());
        assert!(!ModelError::Canceled.is_retryable());
    }

    #[test]
    fn rate_limit_retryability_follows_flag() {
        let throttle = ModelError::RateLimit {
            message: "slow down".into(),
            retryable: true,
            retry_after: Some(Duration::from_secs(2)),
        };
        let quota = ModelError::RateLimit {
            message: "quota exceeded".into(),
            retryable: false,
            retry_after: None,
        };
        assert!(throttle.is_retryable());
        assert_eq!(throttle.retry_hint(), Some(Duration::from_secs(2)));
        assert!(!quota.is_retryable());
        assert_eq!(quota.retry_hint(), None);
    }
}
