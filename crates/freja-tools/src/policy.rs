// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use freja_events::{PermissionScope, PolicyDecision};

/// The qualifier that makes a scope concrete for one lookup.
///
/// `global` needs none; `project` binds to a workspace root; `conversation`
/// binds to a session id.
pub fn scope_key(scope: PermissionScope, session_id: &str, project_root: &str) -> String {
    match scope {
        PermissionScope::Global => "global".to_string(),
        PermissionScope::Project => format!("project:{project_root}"),
        PermissionScope::Conversation => format!("conversation:{session_id}"),
    }
}

/// Persistent permission decisions keyed by `(function, scope-key)`.
///
/// This is the record shape the permission middleware stores in its
/// persistent state; only `AlwaysAllow` / `AlwaysDeny` are stored — `Ask` is
/// the absence of an entry.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PolicyStore {
    entries: BTreeMap<String, PolicyDecision>,
}

impl PolicyStore {
    fn entry_key(function: &str, scope_key: &str) -> String {
        format!("{function}|{scope_key}")
    }

    pub fn set(&mut self, function: &str, scope_key: &str, decision: PolicyDecision) {
        if decision == PolicyDecision::Ask {
            self.entries.remove(&Self::entry_key(function, scope_key));
        } else {
            self.entries.insert(Self::entry_key(function, scope_key), decision);
        }
    }

    pub fn get(&self, function: &str, scope_key: &str) -> Option<PolicyDecision> {
        self.entries.get(&Self::entry_key(function, scope_key)).copied()
    }

    /// Resolve the effective decision for `function`, checking conversation,
    /// then project, then global scope.  `None` means ask.
    pub fn lookup(
        &self,
        function: &str,
        session_id: &str,
        project_root: &str,
    ) -> Option<(PolicyDecision, PermissionScope)> {
        for scope in [
            PermissionScope::Conversation,
            PermissionScope::Project,
            PermissionScope::Global,
        ] {
            let key = scope_key(scope, session_id, project_root);
            if let Some(decision) = self.get(function, &key) {
                return Some((decision, scope));
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
