// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use freja_model::ToolSchema;

use crate::{AiFunction, ToolError};

/// Central registry holding all tools available to one agent.
///
/// Tools may be registered bare or under a namespace; a namespaced tool is
/// addressed as `<namespace>.<name>`.  The registry is immutable once handed
/// to an agent — the tool set is read-only for the duration of a turn.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn AiFunction>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: HashMap::new() }
    }

    pub fn register(&mut self, tool: impl AiFunction + 'static) {
        self.tools.insert(tool.name().to_string(), Arc::new(tool));
    }

    /// Register a tool under a namespace, addressable as `<ns>.<name>`.
    pub fn register_in(&mut self, namespace: &str, tool: impl AiFunction + 'static) {
        self.tools.insert(format!("{namespace}.{}", tool.name()), Arc::new(tool));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn AiFunction>> {
        self.tools.get(name).cloned()
    }

    /// Resolve a tool or fail with [`ToolError::Unknown`].
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn AiFunction>, ToolError> {
        self.get(name).ok_or_else(|| ToolError::Unknown(name.to_string()))
    }

    /// Produce schemas for all registered tools, sorted by name.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .iter()
            .map(|(addr, t)| ToolSchema {
                name: addr.clone(),
                description: t.description().to_string(),
                parameters: t.json_schema(),
            })
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Manifest of every tool registered under `namespace`.
    ///
    /// Container tools return this value from their `invoke`, collapsing a
    /// whole namespace behind a single schema until the model opens it.
    pub fn container_manifest(&self, namespace: &str) -> Value {
        let prefix = format!("{namespace}.");
        let mut entries: Vec<Value> = self
            .tools
            .iter()
            .filter(|(addr, _)| addr.starts_with(&prefix))
            .map(|(addr, t)| {
                json!({
                    "name": addr,
                    "description": t.description(),
                    "parameters": t.json_schema(),
                })
            })
            .collect();
        entries.sort_by_key(|e| e["name"].as_str().unwrap_or_default().to_string());
        json!({ "namespace": namespace, "tools": entries })
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
