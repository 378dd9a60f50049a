// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be enabled unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

/// Parse a humantime duration string, falling back to `default` on malformed
/// input (with a diagnostic rather than a hard failure, so a typo in one
/// config field cannot take the whole engine down).
fn parse_duration(s: &str, default: Duration) -> Duration {
    match humantime::parse_duration(s) {
        Ok(d) => d,
        Err(e) => {
            warn!(value = s, error = %e, "invalid duration in config; using default");
            default
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub middleware: MiddlewareConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub graph: GraphDefaults,
}

/// When execution checkpoints are written during a turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointFrequency {
    /// No intra-turn durability.
    #[default]
    Disabled,
    /// One checkpoint at the end of a successful turn.
    PerTurn,
    /// A checkpoint after every model/tool iteration, plus pending writes
    /// for partial tool results.
    PerIteration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Maximum model/tool iterations per turn before the continuation
    /// filter is consulted.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// Concurrency cap for tool calls within one iteration.
    #[serde(default = "default_parallel_tool_limit")]
    pub parallel_tool_limit: usize,
    /// Keep reasoning parts in persisted history.  When off, reasoning is
    /// emitted on the event stream only.
    #[serde(default)]
    pub preserve_reasoning_in_history: bool,
    /// Persist a session snapshot after every successful turn.
    #[serde(default = "default_true")]
    pub auto_save: bool,
    #[serde(default)]
    pub checkpoint_frequency: CheckpointFrequency,
    /// Optional whole-turn deadline, e.g. `"5m"`.  Empty means unlimited.
    #[serde(default)]
    pub turn_timeout: String,
    /// System instructions merged once at the head of the conversation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_instructions: Option<String>,
}

fn default_max_iterations() -> u32 {
    10
}
fn default_parallel_tool_limit() -> usize {
    4
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            parallel_tool_limit: default_parallel_tool_limit(),
            preserve_reasoning_in_history: false,
            auto_save: true,
            checkpoint_frequency: CheckpointFrequency::Disabled,
            turn_timeout: String::new(),
            system_instructions: None,
        }
    }
}

impl AgentConfig {
    pub fn turn_timeout(&self) -> Option<Duration> {
        if self.turn_timeout.is_empty() {
            return None;
        }
        Some(parse_duration(&self.turn_timeout, Duration::from_secs(300)))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MiddlewareConfig {
    #[serde(default)]
    pub permission: PermissionConfig,
    #[serde(default)]
    pub continuation: ContinuationConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub timeout: TimeoutConfig,
    #[serde(default)]
    pub redaction: RedactionConfig,
    #[serde(default)]
    pub history: HistoryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PermissionConfig {
    /// How long a permission prompt may wait for a response before it is
    /// treated as a denial.
    #[serde(default = "default_permission_timeout")]
    pub timeout: String,
}

fn default_permission_timeout() -> String {
    "60s".to_string()
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self { timeout: default_permission_timeout() }
    }
}

impl PermissionConfig {
    pub fn timeout(&self) -> Duration {
        parse_duration(&self.timeout, Duration::from_secs(60))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContinuationConfig {
    /// How many extra iterations an approval grants.
    #[serde(default = "default_extend_by")]
    pub extend_by: u32,
    #[serde(default = "default_continuation_timeout")]
    pub timeout: String,
}

fn default_extend_by() -> u32 {
    3
}
fn default_continuation_timeout() -> String {
    "60s".to_string()
}

impl Default for ContinuationConfig {
    fn default() -> Self {
        Self { extend_by: default_extend_by(), timeout: default_continuation_timeout() }
    }
}

impl ContinuationConfig {
    pub fn timeout(&self) -> Duration {
        parse_duration(&self.timeout, Duration::from_secs(60))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive identical-argument calls of one function that trip the
    /// breaker.
    #[serde(default = "default_breaker_threshold")]
    pub threshold: u32,
}

fn default_breaker_threshold() -> u32 {
    3
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self { threshold: default_breaker_threshold() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_delay")]
    pub base_delay: String,
    #[serde(default = "default_retry_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_retry_max_delay")]
    pub max_delay: String,
}

fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_base_delay() -> String {
    "100ms".to_string()
}
fn default_retry_multiplier() -> f64 {
    2.0
}
fn default_retry_max_delay() -> String {
    "10s".to_string()
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_attempts(),
            base_delay: default_retry_base_delay(),
            multiplier: default_retry_multiplier(),
            max_delay: default_retry_max_delay(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        parse_duration(&self.base_delay, Duration::from_millis(100))
    }
    pub fn max_delay(&self) -> Duration {
        parse_duration(&self.max_delay, Duration::from_secs(10))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Per-tool-call deadline.
    #[serde(default = "default_tool_timeout")]
    pub per_call: String,
}

fn default_tool_timeout() -> String {
    "120s".to_string()
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { per_call: default_tool_timeout() }
    }
}

impl TimeoutConfig {
    pub fn per_call(&self) -> Duration {
        parse_duration(&self.per_call, Duration::from_secs(120))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Extra regex patterns scrubbed in addition to the built-in set.
    #[serde(default)]
    pub patterns: Vec<String>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self { enabled: true, patterns: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Number of trailing messages preserved verbatim behind the summary.
    #[serde(default = "default_history_tail")]
    pub tail_keep: usize,
    /// Messages that may accumulate past the cached summary before it is
    /// invalidated.
    #[serde(default = "default_history_growth")]
    pub resummarize_after: usize,
    /// Minimum history length before reduction is attempted at all.
    #[serde(default = "default_history_min")]
    pub min_messages: usize,
}

fn default_history_tail() -> usize {
    8
}
fn default_history_growth() -> usize {
    6
}
fn default_history_min() -> usize {
    12
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tail_keep: default_history_tail(),
            resummarize_after: default_history_growth(),
            min_messages: default_history_min(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// State directory root.  Defaults to `<data-dir>/freja` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    /// Checkpoints retained per session after a successful turn.
    #[serde(default = "default_keep_latest")]
    pub keep_latest_checkpoints: usize,
}

fn default_keep_latest() -> usize {
    5
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self { root: None, keep_latest_checkpoints: default_keep_latest() }
    }
}

impl StoreConfig {
    pub fn root(&self) -> PathBuf {
        self.root.clone().unwrap_or_else(|| {
            dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("freja")
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphDefaults {
    /// Back-edge re-execution cap applied when a graph does not set its own.
    #[serde(default = "default_graph_iterations")]
    pub max_iterations: u32,
    /// Default per-node deadline, e.g. `"2m"`.  Empty means unlimited.
    #[serde(default)]
    pub node_timeout: String,
}

fn default_graph_iterations() -> u32 {
    25
}

impl Default for GraphDefaults {
    fn default() -> Self {
        Self { max_iterations: default_graph_iterations(), node_timeout: String::new() }
    }
}

impl GraphDefaults {
    pub fn node_timeout(&self) -> Option<Duration> {
        if self.node_timeout.is_empty() {
            return None;
        }
        Some(parse_duration(&self.node_timeout, Duration::from_secs(120)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
