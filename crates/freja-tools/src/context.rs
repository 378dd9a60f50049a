// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use freja_events::EventBus;
use freja_model::Message;

/// Everything a tool invocation may observe, threaded explicitly — there is
/// no ambient task-local state.
#[derive(Clone)]
pub struct AiFunctionContext {
    /// The id of the function call being served.
    pub call_id: String,
    pub session_id: String,
    pub branch_id: String,
    /// Read-only snapshot of the conversation at dispatch time.
    pub messages: Arc<Vec<Message>>,
    /// Session metadata snapshot.
    pub metadata: Map<String, Value>,
    /// Bus for emitting progress events; bubbles into the turn's observers.
    pub bus: EventBus,
    /// Cooperative cancellation; long-running tools must observe this.
    pub cancel: CancellationToken,
}

impl AiFunctionContext {
    /// An empty context for unit tests.
    pub fn for_tests() -> Self {
        Self {
            call_id: "call_test".to_string(),
            session_id: "session_test".to_string(),
            branch_id: "main".to_string(),
            messages: Arc::new(Vec::new()),
            metadata: Map::new(),
            bus: EventBus::new(),
            cancel: CancellationToken::new(),
        }
    }
}
