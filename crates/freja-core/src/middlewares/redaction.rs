// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tracing::warn;

use freja_config::RedactionConfig;
use freja_model::ContentPart;

use crate::{
    middleware::{
        Middleware, ModelCallRequest, ModelCallResponse, ModelNext, ToolCallRequest,
        ToolCallResponse, ToolNext, TurnContext,
    },
    AgentError,
};

const REPLACEMENT: &str = "[REDACTED]";

/// Scrubs PII-shaped substrings from outgoing model inputs and inbound tool
/// results.  The built-in set covers emails, bearer/API tokens, and SSN-like
/// digit runs; extra patterns come from config.
pub struct RedactionMiddleware {
    enabled: bool,
    patterns: Vec<Regex>,
}

fn builtin_patterns() -> Vec<Regex> {
    [
        // Email addresses.
        r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}",
        // Bearer tokens and api-key shapes.
        r"(?i)bearer\s+[A-Za-z0-9._~+/=-]{16,}",
        r"(?i)(api[_-]?key|secret|token)\s*[:=]\s*\S{12,}",
        // US SSN shape.
        r"\b\d{3}-\d{2}-\d{4}\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
}

impl RedactionMiddleware {
    pub fn from_config(config: &RedactionConfig) -> Self {
        let mut patterns = builtin_patterns();
        for p in &config.patterns {
            match Regex::new(p) {
                Ok(re) => patterns.push(re),
                Err(e) => warn!(pattern = p.as_str(), error = %e, "ignoring invalid redaction pattern"),
            }
        }
        Self { enabled: config.enabled, patterns }
    }

    fn scrub_str(&self, s: &str) -> String {
        let mut out = s.to_string();
        for re in &self.patterns {
            out = re.replace_all(&out, REPLACEMENT).into_owned();
        }
        out
    }

    fn scrub_value(&self, value: &mut Value) {
        match value {
            Value::String(s) => *s = self.scrub_str(s),
            Value::Array(items) => items.iter_mut().for_each(|v| self.scrub_value(v)),
            Value::Object(map) => map.values_mut().for_each(|v| self.scrub_value(v)),
            _ => {}
        }
    }

    fn scrub_part(&self, part: &mut ContentPart) {
        match part {
            ContentPart::Text { text } => *text = self.scrub_str(text),
            ContentPart::Reasoning { text, .. } => *text = self.scrub_str(text),
            ContentPart::FunctionResult { value, .. } => self.scrub_value(value),
            ContentPart::Json { value } => self.scrub_value(value),
            _ => {}
        }
    }
}

#[async_trait]
impl Middleware for RedactionMiddleware {
    fn state_key(&self) -> &str {
        "redaction"
    }

    async fn wrap_model_call(
        &self,
        mut req: ModelCallRequest,
        ctx: &TurnContext,
        next: ModelNext<'_>,
    ) -> Result<ModelCallResponse, AgentError> {
        if self.enabled {
            for message in &mut req.request.messages {
                for part in &mut message.contents {
                    self.scrub_part(part);
                }
            }
        }
        next.run(req, ctx).await
    }

    async fn wrap_tool_call(
        &self,
        req: ToolCallRequest,
        ctx: &TurnContext,
        next: ToolNext<'_>,
    ) -> Result<ToolCallResponse, AgentError> {
        let mut resp = next.run(req, ctx).await?;
        if self.enabled {
            self.scrub_value(&mut resp.value);
        }
        Ok(resp)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn middleware() -> RedactionMiddleware {
        RedactionMiddleware::from_config(&RedactionConfig::default())
    }

    #[test]
    fn emails_are_scrubbed() {
        let mw = middleware();
        assert_eq!(mw.scrub_str("contact alice@example.com please"), "contact [REDACTED] please");
    }

    #[test]
    fn bearer_tokens_are_scrubbed() {
        let mw = middleware();
        let out = mw.scrub_str("Authorization: Bearer abcdef0123456789XYZ");
        assert!(!out.contains("abcdef0123456789XYZ"));
    }

    #[test]
    fn ssn_shapes_are_scrubbed() {
        let mw = middleware();
        assert_eq!(mw.scrub_str("ssn 123-45-6789 done"), "ssn [REDACTED] done");
    }

    #[test]
    fn nested_values_are_scrubbed() {
        let mw = middleware();
        let mut value = json!({
            "user": { "email": "bob@corp.example" },
            "items": ["x", "carol@corp.example"]
        });
        mw.scrub_value(&mut value);
        assert_eq!(value["user"]["email"], "[REDACTED]");
        assert_eq!(value["items"][1], "[REDACTED]");
    }

    #[test]
    fn extra_config_pattern_applies() {
        let mw = RedactionMiddleware::from_config(&RedactionConfig {
            enabled: true,
            patterns: vec![r"\bproject-[a-z]+\b".to_string()],
        });
        assert_eq!(mw.scrub_str("codename project-falcon here"), "codename [REDACTED] here");
    }

    #[test]
    fn invalid_config_pattern_is_ignored() {
        let mw = RedactionMiddleware::from_config(&RedactionConfig {
            enabled: true,
            patterns: vec!["([unclosed".to_string()],
        });
        // Built-ins still work.
        assert_eq!(mw.scrub_str("a@b.co"), "[REDACTED]");
    }
}
