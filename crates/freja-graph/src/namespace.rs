// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::OnceLock;

use regex::Regex;

use crate::GraphError;

const MAX_SEGMENTS: usize = 10;

fn segment_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9_-]{0,48}[a-zA-Z0-9])?$").unwrap()
    })
}

/// Validate a namespace: 1..=10 segments, each alphanumeric-bounded with
/// inner `-`/`_` allowed but never doubled or mixed back to back.
pub fn validate_namespace(segments: &[String]) -> Result<(), GraphError> {
    let namespace = segments.join(".");
    if segments.is_empty() || segments.len() > MAX_SEGMENTS {
        return Err(GraphError::InvalidNamespace {
            namespace,
            message: format!("expected 1..={MAX_SEGMENTS} segments, got {}", segments.len()),
        });
    }
    for segment in segments {
        if !segment_pattern().is_match(segment) {
            return Err(GraphError::InvalidNamespace {
                namespace,
                message: format!("segment '{segment}' does not match the namespace grammar"),
            });
        }
        for run in ["--", "__", "-_", "_-"] {
            if segment.contains(run) {
                return Err(GraphError::InvalidNamespace {
                    namespace,
                    message: format!("segment '{segment}' contains the forbidden run '{run}'"),
                });
            }
        }
    }
    Ok(())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn segs(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn simple_namespaces_pass() {
        assert!(validate_namespace(&segs(&["research"])).is_ok());
        assert!(validate_namespace(&segs(&["team1", "sub-agent", "out_2"])).is_ok());
        assert!(validate_namespace(&segs(&["a"])).is_ok());
    }

    #[test]
    fn empty_and_oversized_namespaces_fail() {
        assert!(validate_namespace(&[]).is_err());
        let eleven: Vec<String> = (0..11).map(|i| format!("s{i}")).collect();
        assert!(validate_namespace(&eleven).is_err());
    }

    #[test]
    fn segments_must_be_alphanumeric_bounded() {
        assert!(validate_namespace(&segs(&["-leading"])).is_err());
        assert!(validate_namespace(&segs(&["trailing_"])).is_err());
        assert!(validate_namespace(&segs(&["has space"])).is_err());
        assert!(validate_namespace(&segs(&[""])).is_err());
    }

    #[test]
    fn consecutive_separator_runs_fail() {
        assert!(validate_namespace(&segs(&["a--b"])).is_err());
        assert!(validate_namespace(&segs(&["a__b"])).is_err());
        assert!(validate_namespace(&segs(&["a-_b"])).is_err());
        assert!(validate_namespace(&segs(&["a_-b"])).is_err());
        assert!(validate_namespace(&segs(&["a-b_c"])).is_ok());
    }

    #[test]
    fn segment_length_cap_is_fifty() {
        let fifty = format!("a{}b", "x".repeat(48));
        assert!(validate_namespace(&[fifty]).is_ok());
        let fifty_one = format!("a{}b", "x".repeat(49));
        assert!(validate_namespace(&[fifty_one]).is_err());
    }
}
