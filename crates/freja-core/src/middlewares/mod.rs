// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod breaker;
mod continuation;
mod history;
mod permission;
mod redaction;
mod retry;
mod timeout;

pub use breaker::CircuitBreakerMiddleware;
pub use continuation::ContinuationMiddleware;
pub use history::{ExtractiveSummarizer, HistoryMiddleware, HistorySummarizer};
pub use permission::PermissionMiddleware;
pub use redaction::RedactionMiddleware;
pub use retry::RetryMiddleware;
pub use timeout::TimeoutMiddleware;

use std::sync::Arc;

use freja_config::Config;

use crate::MiddlewarePipeline;

/// The mandated built-in stack, outermost first: permission gating, the
/// circuit breaker, retry, per-call timeout, redaction, and history
/// reduction.  Continuation sits anywhere since it only answers
/// `on_iteration_limit`.
pub fn standard_pipeline(config: &Config) -> MiddlewarePipeline {
    MiddlewarePipeline::new(vec![
        Arc::new(PermissionMiddleware::from_config(&config.middleware.permission)),
        Arc::new(ContinuationMiddleware::from_config(&config.middleware.continuation)),
        Arc::new(CircuitBreakerMiddleware::from_config(&config.middleware.circuit_breaker)),
        Arc::new(RetryMiddleware::from_config(&config.middleware.retry)),
        Arc::new(TimeoutMiddleware::from_config(&config.middleware.timeout)),
        Arc::new(RedactionMiddleware::from_config(&config.middleware.redaction)),
        Arc::new(HistoryMiddleware::from_config(&config.middleware.history)),
    ])
}
