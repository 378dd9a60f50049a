// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::{
    provider::ResponseStream, FinishReason, FunctionCallPart, ModelError, ModelProvider,
    ModelRequest, ResponseUpdate, Role, Usage,
};

/// Deterministic mock provider for tests.  Echoes the last user message
/// back as the assistant response.
#[derive(Default)]
pub struct EchoProvider;

#[async_trait]
impl ModelProvider for EchoProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "echo"
    }

    async fn generate_streaming(
        &self,
        req: ModelRequest,
        _cancel: CancellationToken,
    ) -> Result<ResponseStream, ModelError> {
        let reply = req
            .messages
            .iter()
            .rev()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.text())
            .unwrap_or_else(|| "[no input]".to_string());

        let updates: Vec<Result<ResponseUpdate, ModelError>> = vec![
            Ok(ResponseUpdate::TextDelta(format!("MOCK: {reply}"))),
            Ok(ResponseUpdate::Usage(Usage { input_tokens: 10, output_tokens: 10 })),
            Ok(ResponseUpdate::Finished(FinishReason::Stop)),
        ];
        Ok(Box::pin(stream::iter(updates)))
    }
}

/// One scripted model invocation.
pub enum Script {
    /// Yield these updates in order.
    Updates(Vec<ResponseUpdate>),
    /// Fail the call before any update is produced.
    Fail(ModelError),
}

/// A pre-scripted mock provider.  Each call to `generate_streaming` pops the
/// next script from the front of the queue, so a test can lay out an entire
/// multi-iteration turn up front.  An exhausted queue yields an empty `Stop`
/// turn rather than an error, which keeps loop-shutdown tests simple.
#[derive(Default)]
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    /// Script a plain text reply that finishes with `stop`.
    pub fn push_text(&self, text: impl Into<String>) {
        self.push(Script::Updates(vec![
            ResponseUpdate::TextDelta(text.into()),
            ResponseUpdate::Usage(Usage { input_tokens: 5, output_tokens: 5 }),
            ResponseUpdate::Finished(FinishReason::Stop),
        ]));
    }

    /// Script a reply that requests the given tool calls.
    pub fn push_tool_calls(&self, calls: Vec<(&str, &str, Map<String, Value>)>) {
        let mut updates = Vec::with_capacity(calls.len() + 2);
        for (call_id, name, args) in calls {
            updates.push(ResponseUpdate::FunctionCall(FunctionCallPart {
                call_id: call_id.to_string(),
                name: name.to_string(),
                args,
            }));
        }
        updates.push(ResponseUpdate::Usage(Usage { input_tokens: 5, output_tokens: 5 }));
        updates.push(ResponseUpdate::Finished(FinishReason::ToolCalls));
        self.push(Script::Updates(updates));
    }

    /// Script a failing call.
    pub fn push_error(&self, err: ModelError) {
        self.push(Script::Fail(err));
    }

    /// Number of scripts not yet consumed.
    pub fn remaining(&self) -> usize {
        self.scripts.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "mock"
    }
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn generate_streaming(
        &self,
        _req: ModelRequest,
        cancel: CancellationToken,
    ) -> Result<ResponseStream, ModelError> {
        if cancel.is_cancelled() {
            return Err(ModelError::Canceled);
        }
        let script = self.scripts.lock().unwrap().pop_front();
        match script {
            Some(Script::Fail(err)) => Err(err),
            Some(Script::Updates(updates)) => {
                let items: Vec<Result<ResponseUpdate, ModelError>> =
                    updates.into_iter().map(Ok).collect();
                Ok(Box::pin(stream::iter(items)))
            }
            None => Ok(Box::pin(stream::iter(vec![Ok(ResponseUpdate::Finished(
                FinishReason::Stop,
            ))]))),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
