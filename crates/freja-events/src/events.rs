// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error classification surfaced on the event stream.
///
/// Mirrors the engine error taxonomy so observers can react without parsing
/// message strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Auth,
    TransientNetwork,
    RateLimit,
    ClientError,
    ContextLength,
    Server,
    Canceled,
    PermissionDenied,
    CircuitOpen,
    ToolTimeout,
    TurnInProgress,
    Internal,
}

/// A stored or requested permission decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyDecision {
    AlwaysAllow,
    AlwaysDeny,
    Ask,
}

/// Where a remembered permission decision applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionScope {
    Global,
    Project,
    Conversation,
}

/// A decision the responder asks to persist alongside an approval/denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RememberPolicy {
    pub decision: PolicyDecision,
    pub scope: PermissionScope,
}

/// Why a permission request ended in denial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// The responder said no.
    Response,
    /// No response arrived before the deadline.
    Timeout,
    /// The turn was canceled while waiting.
    Canceled,
    /// A stored `AlwaysDeny` policy matched.
    Policy,
}

/// Severity of a workflow diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticLevel {
    Info,
    Warn,
    Error,
}

/// Events emitted during agent turns and graph runs.
///
/// The set is closed: observers can exhaustively match.  Events within one
/// turn arrive in causal order; events for distinct parallel tool calls may
/// interleave but are ordered per `call_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    // ── Turn lifecycle ───────────────────────────────────────────────────────
    MessageTurnStarted {
        session_id: String,
        branch_id: String,
    },
    MessageTurnFinished {
        session_id: String,
        branch_id: String,
    },
    MessageTurnError {
        session_id: String,
        branch_id: String,
        code: ErrorCode,
        message: String,
    },
    IterationStart {
        iteration: u32,
    },
    /// The model finished one invocation; records whether it asked for tools.
    AgentDecision {
        had_function_calls: bool,
        function_calls: Vec<String>,
    },
    /// A checkpoint step began (durable execution only).
    StepStarted {
        step: u64,
        checkpoint_id: String,
    },
    AgentCompletion {
        text: String,
        input_tokens: u32,
        output_tokens: u32,
    },

    // ── Model output ─────────────────────────────────────────────────────────
    TextDelta {
        delta: String,
    },
    ReasoningMessageStart,
    ReasoningMessageDelta {
        delta: String,
    },
    ReasoningMessageEnd,

    // ── Tool calls ───────────────────────────────────────────────────────────
    ToolCallStart {
        call_id: String,
        name: String,
    },
    ToolCallArgs {
        call_id: String,
        args: Value,
    },
    ToolCallResult {
        call_id: String,
        value: Value,
        is_error: bool,
    },
    ToolCallEnd {
        call_id: String,
    },

    // ── Permissions ──────────────────────────────────────────────────────────
    PermissionRequest {
        correlation_id: String,
        function_name: String,
        args: Value,
    },
    PermissionApproved {
        correlation_id: String,
        function_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        remember: Option<RememberPolicy>,
    },
    PermissionDenied {
        correlation_id: String,
        function_name: String,
        reason: DenialReason,
    },
    /// A stored policy resolved the call without prompting.
    PermissionCheck {
        function_name: String,
        decision: PolicyDecision,
        scope: PermissionScope,
    },

    // ── Continuation ─────────────────────────────────────────────────────────
    ContinuationRequest {
        correlation_id: String,
        requested_iteration: u32,
        max_iterations: u32,
    },
    ContinuationResponse {
        correlation_id: String,
        approved: bool,
        extend_by: u32,
    },

    // ── Guards ───────────────────────────────────────────────────────────────
    CircuitBreakerTriggered {
        function_name: String,
        consecutive: u32,
    },

    // ── Workflow layer ───────────────────────────────────────────────────────
    WorkflowStarted {
        graph_id: String,
        run_id: String,
    },
    WorkflowCompleted {
        graph_id: String,
        run_id: String,
        successful: u32,
        failed: u32,
        skipped: u32,
    },
    WorkflowLayerStarted {
        index: u32,
        nodes: Vec<String>,
    },
    WorkflowLayerCompleted {
        index: u32,
    },
    WorkflowNodeStarted {
        node_id: String,
    },
    WorkflowNodeCompleted {
        node_id: String,
        failed: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    WorkflowNodeSkipped {
        node_id: String,
        reason: String,
    },
    WorkflowEdgeTraversed {
        from: String,
        to: String,
    },
    WorkflowDiagnostic {
        level: DiagnosticLevel,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        node_id: Option<String>,
    },
}

impl AgentEvent {
    /// The correlation id carried by request/response events, if any.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::PermissionRequest { correlation_id, .. }
            | Self::PermissionApproved { correlation_id, .. }
            | Self::PermissionDenied { correlation_id, .. }
            | Self::ContinuationRequest { correlation_id, .. }
            | Self::ContinuationResponse { correlation_id, .. } => Some(correlation_id),
            _ => None,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
