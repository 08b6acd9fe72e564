//! Security gate (C11).
//!
//! Grounded in `utils/security.py`: regex batteries for prompt-injection,
//! XSS, command-injection, SQL-injection, and encoding-obfuscation detection;
//! a sliding-window rate limiter; recursive sanitization with a depth/length
//! cap; path traversal rejection; and output redaction of common PII shapes.

use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::{Duration, Instant};

const MAX_STRING_LENGTH: usize = 10_000;
const MAX_DEPTH: usize = 10;

static PROMPT_INJECTION_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)ignore (all )?(previous|prior|above) instructions",
        r"(?i)disregard (all )?(previous|prior|above)",
        r"(?i)you are now",
        r"(?i)system prompt",
        r"(?i)act as (if )?(you|a)",
        r"(?i)new instructions:",
    ])
    .expect("prompt injection pattern set must compile")
});

static XSS_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)<script[\s>]",
        r"(?i)javascript:",
        r"(?i)on(load|error|click|mouseover)\s*=",
        r"(?i)<iframe[\s>]",
    ])
    .expect("xss pattern set must compile")
});

static COMMAND_INJECTION_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"[;&|`]\s*(rm|cat|curl|wget|nc|bash|sh)\b",
        r"\$\([^)]*\)",
        r"(?i)&&\s*\w+",
    ])
    .expect("command injection pattern set must compile")
});

static SQL_INJECTION_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)\bunion\b.*\bselect\b",
        r"(?i)\bdrop\s+table\b",
        r"(?i)'\s*or\s*'1'\s*=\s*'1",
        r"(?i);\s*--",
    ])
    .expect("sql injection pattern set must compile")
});

static ENCODING_OBFUSCATION_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"%[0-9a-fA-F]{2}%[0-9a-fA-F]{2}%[0-9a-fA-F]{2}",
        r"&#x?[0-9a-fA-F]+;",
        r"\\u00[0-9a-fA-F]{2}",
    ])
    .expect("encoding obfuscation pattern set must compile")
});

static EMAIL_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[\w.+-]+@[\w-]+\.[\w.-]+").unwrap());
static PHONE_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{3}[-.]?\d{3}[-.]?\d{4}\b").unwrap());
static CARD_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b(?:\d[ -]*?){13,16}\b").unwrap());
static SSN_PATTERN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreatKind {
    PromptInjection,
    Xss,
    CommandInjection,
    SqlInjection,
    EncodingObfuscation,
}

/// Scan `text` against every threat battery, returning the first kind that
/// matches. Callers that need every match can call `scan_all` instead.
pub fn scan(text: &str) -> Option<ThreatKind> {
    if PROMPT_INJECTION_PATTERNS.is_match(text) {
        return Some(ThreatKind::PromptInjection);
    }
    if XSS_PATTERNS.is_match(text) {
        return Some(ThreatKind::Xss);
    }
    if COMMAND_INJECTION_PATTERNS.is_match(text) {
        return Some(ThreatKind::CommandInjection);
    }
    if SQL_INJECTION_PATTERNS.is_match(text) {
        return Some(ThreatKind::SqlInjection);
    }
    if ENCODING_OBFUSCATION_PATTERNS.is_match(text) {
        return Some(ThreatKind::EncodingObfuscation);
    }
    None
}

pub fn scan_all(text: &str) -> Vec<ThreatKind> {
    let mut found = Vec::new();
    if PROMPT_INJECTION_PATTERNS.is_match(text) {
        found.push(ThreatKind::PromptInjection);
    }
    if XSS_PATTERNS.is_match(text) {
        found.push(ThreatKind::Xss);
    }
    if COMMAND_INJECTION_PATTERNS.is_match(text) {
        found.push(ThreatKind::CommandInjection);
    }
    if SQL_INJECTION_PATTERNS.is_match(text) {
        found.push(ThreatKind::SqlInjection);
    }
    if ENCODING_OBFUSCATION_PATTERNS.is_match(text) {
        found.push(ThreatKind::EncodingObfuscation);
    }
    found
}

/// Reject any path containing a `..` traversal segment.
pub fn validate_path(path: &str) -> Result<(), String> {
    if path.split(['/', '\\']).any(|seg| seg == "..") {
        return Err(format!("path '{}' contains a traversal segment", path));
    }
    Ok(())
}

/// Recursively sanitize a JSON value: strings beyond `MAX_STRING_LENGTH` are
/// truncated, and nesting beyond `MAX_DEPTH` is collapsed to `null` rather
/// than recursed into further.
pub fn sanitize_value(value: &serde_json::Value) -> serde_json::Value {
    sanitize_at_depth(value, 0)
}

fn sanitize_at_depth(value: &serde_json::Value, depth: usize) -> serde_json::Value {
    if depth >= MAX_DEPTH {
        return serde_json::Value::Null;
    }
    match value {
        serde_json::Value::String(s) => {
            if s.len() > MAX_STRING_LENGTH {
                serde_json::Value::String(s.chars().take(MAX_STRING_LENGTH).collect())
            } else {
                serde_json::Value::String(s.clone())
            }
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(|v| sanitize_at_depth(v, depth + 1)).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.iter().map(|(k, v)| (k.clone(), sanitize_at_depth(v, depth + 1))).collect(),
        ),
        other => other.clone(),
    }
}

/// Redact common PII shapes (email, phone, card, SSN) from caller-facing
/// output text.
pub fn redact_output(text: &str) -> String {
    let text = EMAIL_PATTERN.replace_all(text, "[REDACTED_EMAIL]");
    let text = SSN_PATTERN.replace_all(&text, "[REDACTED_SSN]");
    let text = CARD_PATTERN.replace_all(&text, "[REDACTED_CARD]");
    let text = PHONE_PATTERN.replace_all(&text, "[REDACTED_PHONE]");
    text.into_owned()
}

/// Sliding-window request rate limiter keyed by an arbitrary identity (e.g.
/// request source, API key).
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    windows: RwLock<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self { max_requests, window, windows: RwLock::new(HashMap::new()) }
    }

    /// Record a request for `key` and report whether it's within the limit.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.write().unwrap();
        let entries = windows.entry(key.to_string()).or_default();
        while let Some(&front) = entries.front() {
            if now.duration_since(front) > self.window {
                entries.pop_front();
            } else {
                break;
            }
        }
        if entries.len() >= self.max_requests {
            return false;
        }
        entries.push_back(now);
        true
    }
}
