//! Rule engine (C2).
//!
//! Grounded in `examples/original_source/mcp_server_gateway/reasoning/rule_engine.py`:
//! priority-ordered evaluation, dotted-path field resolution, `AND`/`OR`/`NOT`
//! logic, a pre-compiled regex cache keyed by `{rule}_{field}_{pattern}`, and
//! invalid-regex-degrades-to-no-match with a logged warning.

use once_cell::sync::OnceCell;
use regex::RegexBuilder;
use std::collections::HashMap;
use std::sync::RwLock;

use super::config::{RuleConfig, RuleOperator, RulesFileConfig};

/// A rule match carrying the rule's confidence, target agents, and a short
/// human-readable explanation of why it matched.
#[derive(Debug, Clone)]
pub struct RuleMatch {
    pub rule_name: String,
    pub confidence: f64,
    pub target_agents: Vec<String>,
    pub reasons: Vec<String>,
    pub priority: i32,
}

struct RegexCache {
    compiled: RwLock<HashMap<String, Option<regex::Regex>>>,
}

impl RegexCache {
    fn new() -> Self {
        Self {
            compiled: RwLock::new(HashMap::new()),
        }
    }

    /// Compile (or fetch) the regex for `pattern` under a cache key scoped to
    /// the rule and field so the same literal pattern in different rules
    /// doesn't share case-sensitivity settings.
    fn get(&self, rule_name: &str, field: &str, pattern: &str, case_sensitive: bool) -> Option<regex::Regex> {
        let key = format!("{}_{}_{}", rule_name, field, pattern);
        if let Some(cached) = self.compiled.read().unwrap().get(&key) {
            return cached.clone();
        }
        let compiled = RegexBuilder::new(pattern)
            .case_insensitive(!case_sensitive)
            .build()
            .map_err(|e| {
                tracing::warn!(rule = %rule_name, field = %field, pattern = %pattern, error = %e, "invalid regex, rule degrades to no-match");
                e
            })
            .ok();
        self.compiled.write().unwrap().insert(key, compiled.clone());
        compiled
    }
}

fn regex_cache() -> &'static RegexCache {
    static CACHE: OnceCell<RegexCache> = OnceCell::new();
    CACHE.get_or_init(RegexCache::new)
}

/// Resolve a dotted field path (`a.b.c`) into a nested JSON object. A missing
/// intermediate key yields `None`.
pub fn resolve_field(request: &serde_json::Value, field: &str) -> Option<serde_json::Value> {
    let mut current = request;
    for part in field.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current.clone())
}

fn stringify(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn evaluate_condition(request: &serde_json::Value, rule_name: &str, condition: &super::config::RuleCondition) -> (bool, String) {
    let resolved = resolve_field(request, &condition.field);

    match condition.operator.as_str() {
        "exists" => {
            let passes = matches!(&resolved, Some(v) if !v.is_null());
            (passes, format!("{} exists = {}", condition.field, passes))
        }
        "contains" => {
            let value = condition.value.clone().unwrap_or_default();
            let (haystack, needle) = prepare_strings(&resolved, &value, condition.case_sensitive);
            let passes = haystack.map(|h| h.contains(&needle)).unwrap_or(false);
            (passes, format!("{} contains '{}' = {}", condition.field, value, passes))
        }
        "equals" => {
            let value = condition.value.clone().unwrap_or_default();
            let (haystack, needle) = prepare_strings(&resolved, &value, condition.case_sensitive);
            let passes = haystack.map(|h| h == needle).unwrap_or(false);
            (passes, format!("{} equals '{}' = {}", condition.field, value, passes))
        }
        "regex" => {
            let pattern = condition.value.clone().unwrap_or_default();
            let passes = match resolved {
                Some(ref v) => {
                    let text = stringify(v);
                    regex_cache()
                        .get(rule_name, &condition.field, &pattern, condition.case_sensitive)
                        .map(|re| re.is_match(&text))
                        .unwrap_or(false)
                }
                None => false,
            };
            (passes, format!("{} matches /{}/ = {}", condition.field, pattern, passes))
        }
        other => {
            tracing::warn!(operator = %other, "unknown rule operator, treating as no-match");
            (false, format!("unknown operator '{}'", other))
        }
    }
}

fn prepare_strings(resolved: &Option<serde_json::Value>, value: &str, case_sensitive: bool) -> (Option<String>, String) {
    let haystack = resolved.as_ref().map(stringify);
    if case_sensitive {
        (haystack, value.to_string())
    } else {
        (haystack.map(|s| s.to_lowercase()), value.to_lowercase())
    }
}

fn combine(logic: RuleOperator, results: &[bool]) -> bool {
    match logic {
        RuleOperator::And => results.iter().all(|&r| r),
        RuleOperator::Or => results.iter().any(|&r| r),
        RuleOperator::Not => !results.iter().all(|&r| r),
    }
}

pub struct RuleEngine {
    rules: RulesFileConfig,
}

impl RuleEngine {
    pub fn new(rules: RulesFileConfig) -> Self {
        Self { rules }
    }

    /// Evaluate every enabled rule against `request`, in priority order
    /// (ties broken by insertion order), returning all matches.
    pub fn evaluate(&self, request: &serde_json::Value) -> Vec<RuleMatch> {
        let mut matches = Vec::new();
        for rule in self.rules.get_sorted_rules() {
            if let Some(m) = self.evaluate_rule(rule, request) {
                matches.push(m);
            }
        }
        matches
    }

    fn evaluate_rule(&self, rule: &RuleConfig, request: &serde_json::Value) -> Option<RuleMatch> {
        let mut results = Vec::with_capacity(rule.conditions.len());
        let mut reasons = Vec::with_capacity(rule.conditions.len());
        for condition in &rule.conditions {
            let (passes, reason) = evaluate_condition(request, &rule.name, condition);
            results.push(passes);
            reasons.push(reason);
        }
        if results.is_empty() {
            return None;
        }
        if combine(rule.logic, &results) {
            Some(RuleMatch {
                rule_name: rule.name.clone(),
                confidence: rule.confidence,
                target_agents: rule.target_agents.clone(),
                reasons,
                priority: rule.priority,
            })
        } else {
            None
        }
    }

    /// The highest-priority match, ties broken by input order (invariant 7).
    pub fn get_best_match(&self, request: &serde_json::Value) -> Option<RuleMatch> {
        self.evaluate(request).into_iter().next()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.rules.len()
    }

    pub fn enabled_rule_count(&self) -> usize {
        self.rules.get_sorted_rules().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::config::RuleCondition;

    fn condition(field: &str, operator: &str, value: Option<&str>) -> RuleCondition {
        RuleCondition {
            field: field.to_string(),
            operator: operator.to_string(),
            value: value.map(|s| s.to_string()),
            case_sensitive: false,
        }
    }

    fn rule(name: &str, priority: i32, conditions: Vec<RuleCondition>, logic: RuleOperator, targets: &[&str], confidence: f64) -> RuleConfig {
        RuleConfig {
            name: name.to_string(),
            priority,
            conditions,
            logic,
            target_agents: targets.iter().map(|s| s.to_string()).collect(),
            confidence,
            enabled: true,
        }
    }

    #[test]
    fn matches_rule_via_contains() {
        let engine = RuleEngine::new(RulesFileConfig {
            rules: vec![rule(
                "arithmetic",
                10,
                vec![condition("query", "contains", Some("calculate"))],
                RuleOperator::And,
                &["calculator"],
                0.9,
            )],
        });
        let req = serde_json::json!({"query": "please calculate 15 + 27"});
        let best = engine.get_best_match(&req).unwrap();
        assert_eq!(best.target_agents, vec!["calculator".to_string()]);
        assert_eq!(best.confidence, 0.9);
    }

    #[test]
    fn dotted_path_resolution() {
        let req = serde_json::json!({"user": {"profile": {"city": "NY"}}});
        assert_eq!(resolve_field(&req, "user.profile.city"), Some(serde_json::json!("NY")));
        assert_eq!(resolve_field(&req, "user.profile.missing"), None);
        assert_eq!(resolve_field(&req, "user.missing.city"), None);
    }

    #[test]
    fn highest_priority_wins_ties_broken_by_order() {
        let engine = RuleEngine::new(RulesFileConfig {
            rules: vec![
                rule("first", 5, vec![condition("query", "exists", None)], RuleOperator::And, &["a"], 0.5),
                rule("second", 5, vec![condition("query", "exists", None)], RuleOperator::And, &["b"], 0.6),
                rule("third", 9, vec![condition("query", "exists", None)], RuleOperator::And, &["c"], 0.7),
            ],
        });
        let req = serde_json::json!({"query": "hi"});
        let best = engine.get_best_match(&req).unwrap();
        assert_eq!(best.rule_name, "third");
        let all = engine.evaluate(&req);
        assert_eq!(all[1].rule_name, "first");
    }

    #[test]
    fn invalid_regex_degrades_to_no_match() {
        let engine = RuleEngine::new(RulesFileConfig {
            rules: vec![rule(
                "broken",
                10,
                vec![condition("query", "regex", Some("(unclosed"))],
                RuleOperator::And,
                &["x"],
                0.9,
            )],
        });
        let req = serde_json::json!({"query": "anything"});
        assert!(engine.get_best_match(&req).is_none());
    }

    #[test]
    fn disabled_rules_are_skipped() {
        let mut r = rule("off", 100, vec![condition("query", "exists", None)], RuleOperator::And, &["a"], 1.0);
        r.enabled = false;
        let engine = RuleEngine::new(RulesFileConfig { rules: vec![r] });
        assert!(engine.get_best_match(&serde_json::json!({"query": "hi"})).is_none());
    }

    #[test]
    fn not_logic_inverts_all_conditions_passing() {
        let engine = RuleEngine::new(RulesFileConfig {
            rules: vec![rule(
                "not-billing",
                1,
                vec![condition("query", "contains", Some("billing"))],
                RuleOperator::Not,
                &["support"],
                0.5,
            )],
        });
        assert!(engine.get_best_match(&serde_json::json!({"query": "reset password"})).is_some());
        assert!(engine.get_best_match(&serde_json::json!({"query": "billing issue"})).is_none());
    }
}
