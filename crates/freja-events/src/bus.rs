// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::AgentEvent;

/// Failures of bus suspension waits.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BusError {
    #[error("timed out waiting for response {correlation_id}")]
    TimedOut { correlation_id: String },
    #[error("canceled while waiting for response {correlation_id}")]
    Canceled { correlation_id: String },
}

type WaiterTable = Arc<Mutex<HashMap<String, oneshot::Sender<AgentEvent>>>>;

/// Typed, ordered event fan-out with parent-child bubbling.
///
/// Every event emitted on a bus is delivered to its own subscribers and then
/// to every ancestor's subscribers; parents never push downward.  The waiter
/// table backing [`EventBus::wait_for_response`] is shared across the whole
/// bus tree, so a response sent on any bus reaches a waiter registered on any
/// other bus in the same tree.
///
/// Transport is an unbounded in-memory queue scoped to a turn.  A consumer
/// that needs bounded buffering wraps the subscription stream itself.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

struct BusInner {
    parent: Option<EventBus>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<AgentEvent>>>,
    waiters: WaiterTable,
}

impl EventBus {
    /// A new root bus with its own waiter table.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                parent: None,
                subscribers: Mutex::new(Vec::new()),
                waiters: Arc::new(Mutex::new(HashMap::new())),
            }),
        }
    }

    /// A child bus bubbling into `self`.  The child shares the root's waiter
    /// table so suspension correlation works tree-wide.
    pub fn child(&self) -> Self {
        Self {
            inner: Arc::new(BusInner {
                parent: Some(self.clone()),
                subscribers: Mutex::new(Vec::new()),
                waiters: Arc::clone(&self.inner.waiters),
            }),
        }
    }

    /// Register an observer.  The stream yields every event emitted on this
    /// bus or bubbled up from a descendant, in emission order.
    pub fn subscribe(&self) -> UnboundedReceiverStream<AgentEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.subscribers.lock().unwrap().push(tx);
        UnboundedReceiverStream::new(rx)
    }

    /// Emit an event to this bus and every ancestor.
    pub fn emit(&self, event: AgentEvent) {
        let mut bus = Some(self.clone());
        while let Some(b) = bus {
            b.deliver_local(&event);
            bus = b.inner.parent.clone();
        }
    }

    fn deliver_local(&self, event: &AgentEvent) {
        // Dropped receivers are pruned on the fly.
        let mut subs = self.inner.subscribers.lock().unwrap();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Suspend until a response event with `correlation_id` arrives via
    /// [`EventBus::send_response`], the timeout elapses, or `cancel` fires.
    ///
    /// A second wait on the same correlation id replaces the first waiter.
    pub async fn wait_for_response(
        &self,
        correlation_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<AgentEvent, BusError> {
        let (tx, rx) = oneshot::channel();
        self.inner.waiters.lock().unwrap().insert(correlation_id.to_string(), tx);

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                Err(BusError::Canceled { correlation_id: correlation_id.to_string() })
            }
            resp = tokio::time::timeout(timeout, rx) => match resp {
                Ok(Ok(event)) => Ok(event),
                // Sender dropped without a response; treat like a timeout.
                Ok(Err(_)) | Err(_) => {
                    Err(BusError::TimedOut { correlation_id: correlation_id.to_string() })
                }
            },
        };
        if outcome.is_err() {
            self.inner.waiters.lock().unwrap().remove(correlation_id);
        }
        outcome
    }

    /// Deliver an out-of-band response to a suspended waiter anywhere in the
    /// bus tree.  Returns `true` when a waiter was woken.
    pub fn send_response(&self, correlation_id: &str, event: AgentEvent) -> bool {
        let waiter = self.inner.waiters.lock().unwrap().remove(correlation_id);
        match waiter {
            Some(tx) => tx.send(event).is_ok(),
            None => {
                debug!(correlation_id, "response with no registered waiter dropped");
                false
            }
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
