// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use freja_config::HistoryConfig;
use freja_model::{ContentPart, Message, Role};

use crate::{
    middleware::{Middleware, ModelCallRequest, ModelCallResponse, ModelNext, TurnContext},
    AgentError,
};

const STATE_KEY: &str = "history";

/// Produces a summary of a message prefix.
///
/// The default is deterministic and extractive so reduction never requires a
/// model call; embedders plug in a model-backed implementation for richer
/// summaries.
#[async_trait]
pub trait HistorySummarizer: Send + Sync {
    async fn summarize(&self, messages: &[Message]) -> Result<String, AgentError>;
}

/// One line per message, truncated.  Deterministic and model-free.
pub struct ExtractiveSummarizer {
    max_chars_per_message: usize,
}

impl Default for ExtractiveSummarizer {
    fn default() -> Self {
        Self { max_chars_per_message: 120 }
    }
}

#[async_trait]
impl HistorySummarizer for ExtractiveSummarizer {
    async fn summarize(&self, messages: &[Message]) -> Result<String, AgentError> {
        let mut lines = Vec::with_capacity(messages.len());
        for m in messages {
            let role = match m.role {
                Role::System => "system",
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::Tool => "tool",
            };
            let mut text = m.text();
            if text.is_empty() && m.has_function_calls() {
                let names: Vec<&str> = m
                    .contents
                    .iter()
                    .filter_map(|p| match p {
                        ContentPart::FunctionCall { name, .. } => Some(name.as_str()),
                        _ => None,
                    })
                    .collect();
                text = format!("called {}", names.join(", "));
            }
            let mut truncated: String = text.chars().take(self.max_chars_per_message).collect();
            if truncated.len() < text.len() {
                truncated.push('…');
            }
            lines.push(format!("- {role}: {truncated}"));
        }
        Ok(lines.join("\n"))
    }
}

/// Cached summary of the summarized prefix.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct SummaryState {
    summary: String,
    /// Messages covered by the summary, counted past the head system message.
    snapshot_count: usize,
    /// Hash of the summarized prefix; a mismatch means the history was
    /// structurally modified and the summary is void.
    hash: String,
}

/// Replaces a long conversation prefix with a cached summary when preparing
/// model input.  The cache is valid only while the prefix is untouched (hash
/// match) AND the tail has not outgrown the growth window; anything else
/// forces a full resummarization.
pub struct HistoryMiddleware {
    enabled: bool,
    tail_keep: usize,
    resummarize_after: usize,
    min_messages: usize,
    summarizer: Arc<dyn HistorySummarizer>,
}

impl HistoryMiddleware {
    pub fn from_config(config: &HistoryConfig) -> Self {
        Self::with_summarizer(config, Arc::new(ExtractiveSummarizer::default()))
    }

    pub fn with_summarizer(config: &HistoryConfig, summarizer: Arc<dyn HistorySummarizer>) -> Self {
        Self {
            enabled: config.enabled,
            tail_keep: config.tail_keep.max(1),
            resummarize_after: config.resummarize_after,
            min_messages: config.min_messages,
            summarizer,
        }
    }

    fn prefix_hash(messages: &[Message]) -> String {
        use sha2::Digest;
        let mut hasher = sha2::Sha256::new();
        for m in messages {
            hasher.update(format!("{:?}\u{1f}", m.role).as_bytes());
            hasher.update(serde_json::to_string(&m.contents).unwrap_or_default().as_bytes());
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    fn cached(ctx: &TurnContext) -> Option<SummaryState> {
        ctx.persistent(STATE_KEY).and_then(|v| serde_json::from_value(v).ok())
    }

    fn reduced(summary: &str, head: &[Message], tail: &[Message]) -> Vec<Message> {
        let mut out = Vec::with_capacity(head.len() + 1 + tail.len());
        out.extend_from_slice(head);
        out.push(Message::assistant(format!("[Summary of earlier conversation]\n{summary}")));
        out.extend_from_slice(tail);
        out
    }
}

#[async_trait]
impl Middleware for HistoryMiddleware {
    fn state_key(&self) -> &str {
        STATE_KEY
    }

    async fn wrap_model_call(
        &self,
        mut req: ModelCallRequest,
        ctx: &TurnContext,
        next: ModelNext<'_>,
    ) -> Result<ModelCallResponse, AgentError> {
        if !self.enabled || req.request.messages.len() < self.min_messages {
            return next.run(req, ctx).await;
        }

        // The head system message is never summarized.
        let offset = usize::from(
            req.request.messages.first().map(|m| m.role == Role::System).unwrap_or(false),
        );
        let (head, body) = req.request.messages.split_at(offset);

        if let Some(cached) = Self::cached(ctx) {
            // Validity requires BOTH the count window and the prefix hash; a
            // hash mismatch means structural modification and voids the cache.
            let within_window = cached.snapshot_count > 0
                && !cached.summary.is_empty()
                && body.len() >= cached.snapshot_count
                && body.len() - cached.snapshot_count <= self.resummarize_after;
            let hash_matches = within_window
                && Self::prefix_hash(&body[..cached.snapshot_count]) == cached.hash;
            if within_window && hash_matches {
                debug!(covered = cached.snapshot_count, "reusing cached history summary");
                req.request.messages =
                    Self::reduced(&cached.summary, head, &body[cached.snapshot_count..]);
                return next.run(req, ctx).await;
            }
        }

        // Resummarize.  Keep the trailing window verbatim, and never split a
        // tool-call/result group: pull the boundary back past tool-role
        // messages so no orphaned results survive in the tail.
        let mut split = body.len().saturating_sub(self.tail_keep);
        while split > 0 && body[split].role == Role::Tool {
            split -= 1;
        }
        if split == 0 {
            return next.run(req, ctx).await;
        }

        let summary = self.summarizer.summarize(&body[..split]).await?;
        let state = SummaryState {
            summary: summary.clone(),
            snapshot_count: split,
            hash: Self::prefix_hash(&body[..split]),
        };
        ctx.update_persistent(STATE_KEY, 1, |_| {
            serde_json::to_value(&state).unwrap_or_else(|_| json!(null))
        });

        req.request.messages = Self::reduced(&summary, head, &body[split..]);
        next.run(req, ctx).await
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
