// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::AiFunctionContext;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Opaque identifier returned by the model (forwarded verbatim)
    pub call_id: String,
    pub name: String,
    /// Parsed JSON argument object
    pub args: Map<String, Value>,
}

impl ToolCall {
    pub fn new(call_id: impl Into<String>, name: impl Into<String>, args: Map<String, Value>) -> Self {
        Self { call_id: call_id.into(), name: name.into(), args }
    }
}

/// Declarative options attached to a tool.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOptions {
    /// The permission filter prompts (or consults stored policy) before
    /// every invocation of this tool.
    pub requires_permission: bool,
    /// Free-form scope tags used for grouping and filtering.
    pub scopes: Vec<String>,
    /// A container tool's invocation returns a manifest of nested tools
    /// rather than performing work itself.
    pub container: bool,
}

/// Tool execution failures, classified for retry purposes.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// Arguments did not match the declared schema.  Never retried.
    #[error("invalid arguments: {0}")]
    InvalidArgs(String),
    /// A failure that is expected to clear on retry (flaky IO, busy
    /// resource).  Retried with backoff by the retry middleware.
    #[error("transient failure: {0}")]
    Transient(String),
    /// A terminal failure.  Surfaced to the model as an error result.
    #[error("{0}")]
    Failed(String),
    /// The requested tool is not registered.
    #[error("unknown tool: {0}")]
    Unknown(String),
}

impl ToolError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Trait that every tool handed to an agent must implement.
///
/// Registration is the embedder's concern: the runtime receives a fully
/// materialized [`crate::ToolRegistry`] and never discovers tools itself.
#[async_trait]
pub trait AiFunction: Send + Sync {
    /// Unique within one agent's tool set.
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for the argument object
    fn json_schema(&self) -> Value;
    fn options(&self) -> ToolOptions {
        ToolOptions::default()
    }
    /// Execute the tool.  Errors are values; the scheduler converts them
    /// into error payloads on the conversation, never into turn aborts.
    async fn invoke(&self, args: &Map<String, Value>, ctx: &AiFunctionContext)
        -> Result<Value, ToolError>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
