//! Policy evaluation (C10).
//!
//! Grounded in `agent_orchestrator/policy/evaluators.py`: a pluggable set of
//! evaluators (timed restriction, rate limit, threshold) run in order over a
//! bounded action history, each independently able to deny a request. A
//! misbehaving evaluator is logged and skipped rather than aborting the
//! whole chain (§4.1: "a failing component degrades, it does not cascade").

use std::collections::VecDeque;
use std::error::Error;
use std::sync::RwLock;

use chrono::{DateTime, Utc};

/// Closed classification of what a user action does, taken from the
/// glossary: the categories evaluators key their rules on (e.g. a timed
/// restriction keyed on `AddressChange` blocking `CardOrder`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionCategory {
    ProfileChange,
    AddressChange,
    PaymentMethodChange,
    HighValueTransaction,
    CardOrder,
    AccountClosure,
    PasswordChange,
    Transfer,
    Purchase,
    Query,
    Other,
}

/// Map a request's free-text query to the closed action category it
/// represents, by keyword. Checked in a fixed precedence order so a more
/// specific phrase (e.g. "order a card") is not swallowed by a broader one
/// ("order"). Falls back to `Query` for what look like read-only look-ups
/// and `Other` otherwise.
pub fn map_query_to_action_category(query: &str) -> ActionCategory {
    const RULES: &[(ActionCategory, &[&str])] = &[
        (ActionCategory::AccountClosure, &["close my account", "close account", "delete my account", "cancel my account"]),
        (ActionCategory::PasswordChange, &["change my password", "reset my password", "change password"]),
        (ActionCategory::AddressChange, &["change my address", "update my address", "new address", "move to"]),
        (
            ActionCategory::PaymentMethodChange,
            &["change my card details", "update payment method", "new payment method", "update my card"],
        ),
        (ActionCategory::ProfileChange, &["update my profile", "change my name", "update my email", "edit my profile"]),
        (ActionCategory::CardOrder, &["order a card", "order new card", "request a new card", "replace my card"]),
        (ActionCategory::Transfer, &["transfer money", "transfer funds", "send money", "wire transfer"]),
        (ActionCategory::HighValueTransaction, &["large payment", "high value transaction", "big transfer"]),
        (ActionCategory::Purchase, &["buy ", "purchase ", "order "]),
    ];
    let q = query.to_lowercase();
    for (category, keywords) in RULES {
        if keywords.iter().any(|k| q.contains(k)) {
            return *category;
        }
    }
    if q.starts_with("what") || q.starts_with("how") || q.starts_with("show") || q.starts_with("check") || q.contains('?') {
        return ActionCategory::Query;
    }
    ActionCategory::Other
}

#[derive(Debug, Clone)]
pub struct PolicyAction {
    pub category: ActionCategory,
    pub agent: String,
    pub timestamp: DateTime<Utc>,
    /// Whether the action completed successfully. Only successful actions
    /// count as triggers for evaluators like [`TimedRestrictionEvaluator`].
    pub success: bool,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone)]
pub enum PolicyDecision {
    Allow,
    Deny { reason: String, blocked_until: Option<DateTime<Utc>> },
}

impl PolicyDecision {
    pub fn is_denied(&self) -> bool {
        matches!(self, PolicyDecision::Deny { .. })
    }
}

pub trait PolicyEvaluator: Send + Sync {
    fn name(&self) -> &str;
    fn evaluate(&self, action: &PolicyAction, history: &[PolicyAction]) -> Result<PolicyDecision, Box<dyn Error + Send + Sync>>;
}

/// Denies a `blocked_categories` action when a successful `trigger_category`
/// action was recorded within the last `block_hours` hours (e.g. an address
/// change blocks card orders for 24h). `blocked_until` is anchored to the
/// triggering historical action's timestamp, not to the action under
/// evaluation, so `hours_remaining` counts down from the trigger.
pub struct TimedRestrictionEvaluator {
    pub blocked_categories: Vec<ActionCategory>,
    pub trigger_category: ActionCategory,
    pub block_hours: i64,
}

impl PolicyEvaluator for TimedRestrictionEvaluator {
    fn name(&self) -> &str {
        "timed_restriction"
    }

    fn evaluate(&self, action: &PolicyAction, history: &[PolicyAction]) -> Result<PolicyDecision, Box<dyn Error + Send + Sync>> {
        if !self.blocked_categories.contains(&action.category) {
            return Ok(PolicyDecision::Allow);
        }
        let window = chrono::Duration::hours(self.block_hours);
        let trigger = history
            .iter()
            .filter(|a| a.category == self.trigger_category && a.success && action.timestamp - a.timestamp < window)
            .max_by_key(|a| a.timestamp);

        match trigger {
            Some(t) => {
                let blocked_until = t.timestamp + window;
                let hours_remaining = (blocked_until - action.timestamp).num_hours().max(0);
                Ok(PolicyDecision::Deny {
                    reason: format!(
                        "{:?} is blocked for {} hour(s) following a {:?} action (hours_remaining={})",
                        action.category, self.block_hours, self.trigger_category, hours_remaining
                    ),
                    blocked_until: Some(blocked_until),
                })
            }
            None => Ok(PolicyDecision::Allow),
        }
    }
}

/// Denies an action of `category` once more than `max_count` have occurred
/// within the last `window` from the same agent.
pub struct RateLimitEvaluator {
    pub category: ActionCategory,
    pub max_count: usize,
    pub window: chrono::Duration,
}

impl PolicyEvaluator for RateLimitEvaluator {
    fn name(&self) -> &str {
        "rate_limit"
    }

    fn evaluate(&self, action: &PolicyAction, history: &[PolicyAction]) -> Result<PolicyDecision, Box<dyn Error + Send + Sync>> {
        if action.category != self.category {
            return Ok(PolicyDecision::Allow);
        }
        let cutoff = action.timestamp - self.window;
        let recent = history
            .iter()
            .filter(|a| a.category == self.category && a.agent == action.agent && a.timestamp >= cutoff)
            .count();
        if recent >= self.max_count {
            Ok(PolicyDecision::Deny {
                reason: format!("rate limit of {} {:?} actions per window exceeded for '{}'", self.max_count, self.category, action.agent),
                blocked_until: Some(action.timestamp + self.window),
            })
        } else {
            Ok(PolicyDecision::Allow)
        }
    }
}

/// Denies an action of `category` whose `metadata[field]` numeric value
/// exceeds `max_value`.
pub struct ThresholdEvaluator {
    pub category: ActionCategory,
    pub field: String,
    pub max_value: f64,
}

impl PolicyEvaluator for ThresholdEvaluator {
    fn name(&self) -> &str {
        "threshold"
    }

    fn evaluate(&self, action: &PolicyAction, _history: &[PolicyAction]) -> Result<PolicyDecision, Box<dyn Error + Send + Sync>> {
        if action.category != self.category {
            return Ok(PolicyDecision::Allow);
        }
        match action.metadata.get(&self.field).and_then(|v| v.as_f64()) {
            Some(value) if value > self.max_value => Ok(PolicyDecision::Deny {
                reason: format!("{} {} exceeds threshold {}", self.field, value, self.max_value),
                blocked_until: None,
            }),
            _ => Ok(PolicyDecision::Allow),
        }
    }
}

/// Fixed-capacity history of past actions, consulted by rate-limit style
/// evaluators. Oldest entries are dropped once `capacity` is exceeded.
pub struct ActionHistory {
    capacity: usize,
    entries: RwLock<VecDeque<PolicyAction>>,
}

impl ActionHistory {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, entries: RwLock::new(VecDeque::with_capacity(capacity)) }
    }

    pub fn record(&self, action: PolicyAction) {
        let mut entries = self.entries.write().unwrap();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(action);
    }

    pub fn snapshot(&self) -> Vec<PolicyAction> {
        self.entries.read().unwrap().iter().cloned().collect()
    }
}

/// Runs every registered evaluator in order. `stop_on_first_denial` (the
/// common case) short-circuits at the first deny; set to `false` to collect
/// every evaluator's verdict for audit purposes.
pub struct PolicyEngine {
    evaluators: Vec<Box<dyn PolicyEvaluator>>,
    history: ActionHistory,
    stop_on_first_denial: bool,
}

impl PolicyEngine {
    pub fn new(evaluators: Vec<Box<dyn PolicyEvaluator>>, history_capacity: usize, stop_on_first_denial: bool) -> Self {
        Self { evaluators, history: ActionHistory::new(history_capacity), stop_on_first_denial }
    }

    /// Evaluate `action` against every evaluator. A denial from any
    /// evaluator denies the whole action; an evaluator that errors is logged
    /// and treated as `Allow` so one broken rule can't take the gate down.
    pub fn evaluate(&self, action: &PolicyAction) -> PolicyDecision {
        let history = self.history.snapshot();
        for evaluator in &self.evaluators {
            match evaluator.evaluate(action, &history) {
                Ok(PolicyDecision::Allow) => continue,
                Ok(deny @ PolicyDecision::Deny { .. }) => {
                    if self.stop_on_first_denial {
                        return deny;
                    }
                }
                Err(e) => {
                    tracing::warn!(evaluator = evaluator.name(), error = %e, "policy evaluator failed, treating as allow");
                }
            }
        }
        PolicyDecision::Allow
    }

    /// Append `action` to the history used by subsequent rate-limit checks.
    /// Callers decide whether to record automatically on every allowed
    /// action or only explicitly (`auto_record_policy_actions`).
    pub fn record(&self, action: PolicyAction) {
        self.history.record(action);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(category: ActionCategory, agent: &str, ts: DateTime<Utc>) -> PolicyAction {
        PolicyAction { category, agent: agent.to_string(), timestamp: ts, success: true, metadata: serde_json::Map::new() }
    }

    #[test]
    fn maps_query_text_to_category() {
        assert_eq!(map_query_to_action_category("please close my account"), ActionCategory::AccountClosure);
        assert_eq!(map_query_to_action_category("I want to order a card"), ActionCategory::CardOrder);
        assert_eq!(map_query_to_action_category("change my address to 12 Main St"), ActionCategory::AddressChange);
        assert_eq!(map_query_to_action_category("what is my balance?"), ActionCategory::Query);
        assert_eq!(map_query_to_action_category("xyzzy"), ActionCategory::Other);
    }

    #[test]
    fn timed_restriction_denies_blocked_category_after_trigger() {
        let evaluator = TimedRestrictionEvaluator {
            blocked_categories: vec![ActionCategory::CardOrder],
            trigger_category: ActionCategory::AddressChange,
            block_hours: 24,
        };
        let now = Utc::now();
        let trigger_time = now - chrono::Duration::hours(2);
        let history = vec![action(ActionCategory::AddressChange, "user-1", trigger_time)];
        let decision = evaluator.evaluate(&action(ActionCategory::CardOrder, "user-1", now), &history).unwrap();
        match decision {
            PolicyDecision::Deny { blocked_until, reason } => {
                let blocked_until = blocked_until.unwrap();
                assert_eq!(blocked_until, trigger_time + chrono::Duration::hours(24));
                assert!(reason.contains("hours_remaining=22"), "reason was: {reason}");
            }
            PolicyDecision::Allow => panic!("expected deny"),
        }
    }

    #[test]
    fn timed_restriction_allows_once_window_has_elapsed() {
        let evaluator = TimedRestrictionEvaluator {
            blocked_categories: vec![ActionCategory::CardOrder],
            trigger_category: ActionCategory::AddressChange,
            block_hours: 24,
        };
        let now = Utc::now();
        let history = vec![action(ActionCategory::AddressChange, "user-1", now - chrono::Duration::hours(25))];
        let decision = evaluator.evaluate(&action(ActionCategory::CardOrder, "user-1", now), &history).unwrap();
        assert!(!decision.is_denied());
    }

    #[test]
    fn timed_restriction_ignores_unrelated_categories() {
        let evaluator = TimedRestrictionEvaluator {
            blocked_categories: vec![ActionCategory::CardOrder],
            trigger_category: ActionCategory::AddressChange,
            block_hours: 24,
        };
        let now = Utc::now();
        let history = vec![action(ActionCategory::AddressChange, "user-1", now - chrono::Duration::hours(1))];
        let decision = evaluator.evaluate(&action(ActionCategory::Query, "user-1", now), &history).unwrap();
        assert!(!decision.is_denied());
    }

    #[test]
    fn rate_limit_denies_after_max_count() {
        let evaluator = RateLimitEvaluator { category: ActionCategory::Transfer, max_count: 2, window: chrono::Duration::minutes(5) };
        let now = Utc::now();
        let history = vec![action(ActionCategory::Transfer, "a", now), action(ActionCategory::Transfer, "a", now)];
        let decision = evaluator.evaluate(&action(ActionCategory::Transfer, "a", now), &history).unwrap();
        assert!(decision.is_denied());
    }

    #[test]
    fn rate_limit_ignores_other_agents() {
        let evaluator = RateLimitEvaluator { category: ActionCategory::Transfer, max_count: 1, window: chrono::Duration::minutes(5) };
        let now = Utc::now();
        let history = vec![action(ActionCategory::Transfer, "b", now)];
        let decision = evaluator.evaluate(&action(ActionCategory::Transfer, "a", now), &history).unwrap();
        assert!(!decision.is_denied());
    }

    #[test]
    fn threshold_denies_when_exceeded() {
        let evaluator = ThresholdEvaluator { category: ActionCategory::HighValueTransaction, field: "amount".to_string(), max_value: 1000.0 };
        let mut act = action(ActionCategory::HighValueTransaction, "payer", Utc::now());
        act.metadata.insert("amount".to_string(), serde_json::json!(5000));
        assert!(evaluator.evaluate(&act, &[]).unwrap().is_denied());
    }

    #[test]
    fn engine_stops_on_first_denial() {
        struct AlwaysDeny;
        impl PolicyEvaluator for AlwaysDeny {
            fn name(&self) -> &str {
                "always_deny"
            }
            fn evaluate(&self, _: &PolicyAction, _: &[PolicyAction]) -> Result<PolicyDecision, Box<dyn Error + Send + Sync>> {
                Ok(PolicyDecision::Deny { reason: "no".to_string(), blocked_until: None })
            }
        }
        let engine = PolicyEngine::new(vec![Box::new(AlwaysDeny)], 100, true);
        let decision = engine.evaluate(&action(ActionCategory::Query, "a", Utc::now()));
        assert!(decision.is_denied());
    }

    #[test]
    fn engine_treats_evaluator_error_as_allow_and_continues() {
        struct Explodes;
        impl PolicyEvaluator for Explodes {
            fn name(&self) -> &str {
                "explodes"
            }
            fn evaluate(&self, _: &PolicyAction, _: &[PolicyAction]) -> Result<PolicyDecision, Box<dyn Error + Send + Sync>> {
                Err("boom".into())
            }
        }
        let engine = PolicyEngine::new(vec![Box::new(Explodes)], 100, true);
        let decision = engine.evaluate(&action(ActionCategory::Query, "a", Utc::now()));
        assert!(!decision.is_denied());
    }

    #[test]
    fn history_evicts_oldest_beyond_capacity() {
        let history = ActionHistory::new(2);
        history.record(action(ActionCategory::Query, "a", Utc::now()));
        history.record(action(ActionCategory::Query, "b", Utc::now()));
        history.record(action(ActionCategory::Query, "c", Utc::now()));
        let snapshot = history.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].agent, "b");
    }
}
