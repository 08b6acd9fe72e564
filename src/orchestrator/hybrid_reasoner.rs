//! Hybrid reasoning dispatch (C4).
//!
//! Grounded in `agent_orchestrator/reasoning/hybrid_reasoner.py`: try the rule
//! engine first; above `rule_confidence_threshold`, accept it outright; below
//! threshold (or on no match), consult the AI reasoner and fall back to the
//! best rule match (confidence scaled) if the AI plan is unusable. Agents
//! whose circuit breaker is open are excluded from both the rule engine's
//! candidate set and the AI reasoner's catalog before either is consulted
//! (`agent_orchestrator/utils/retry.py::CircuitBreaker` gates availability,
//! not just call counting).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::agent::AgentRegistry;
use super::ai_reasoner::{AiReasoner, AiReasonerOutcome};
use super::circuit_breaker::CircuitBreakerRegistry;
use super::config::{OrchestratorConfig, ReasoningMode, RulesFileConfig};
use super::rules::{RuleEngine, RuleMatch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningMethod {
    Rule,
    Ai,
    Hybrid,
    RuleFallback,
}

/// The plan a reasoning strategy produced: which agents to call, in what
/// order, with what per-call parameter overrides, and how confident the
/// strategy is in the plan.
#[derive(Debug, Clone)]
pub struct ReasoningResult {
    /// Ordered multiset of agent names (§4.4 invariant 3: duplicates are
    /// legal and distinguished by occurrence at execution time).
    pub agents: Vec<String>,
    pub confidence: f64,
    pub method: ReasoningMethod,
    pub parallel: bool,
    /// Per-call overrides keyed by `name` / `name_2` / `name_3` ... for the
    /// k-th occurrence of an agent in `agents`.
    pub parameters: HashMap<String, serde_json::Value>,
    pub reasoning: String,
    pub rule_matches: Vec<String>,
    pub ai_plan: Option<serde_json::Value>,
}

pub struct HybridReasoner {
    rule_engine: RuleEngine,
    ai_reasoner: Option<AiReasoner>,
    mode: ReasoningMode,
    rule_confidence_threshold: f64,
    breaker: Arc<CircuitBreakerRegistry>,
}

impl HybridReasoner {
    pub fn new(
        rules: RulesFileConfig,
        ai_reasoner: Option<AiReasoner>,
        config: &OrchestratorConfig,
        breaker: Arc<CircuitBreakerRegistry>,
    ) -> Self {
        Self {
            rule_engine: RuleEngine::new(rules),
            ai_reasoner,
            mode: config.reasoning_mode,
            rule_confidence_threshold: config.rule_confidence_threshold,
            breaker,
        }
    }

    /// Produce a plan for `request` against the currently registered agents.
    /// Returns `None` when no strategy could produce a usable plan (both the
    /// rule engine and the AI reasoner came up empty or failed).
    pub async fn reason(
        &self,
        request: &serde_json::Value,
        registry: &AgentRegistry,
    ) -> Option<ReasoningResult> {
        match self.mode {
            ReasoningMode::Rule => self.rule_based(request),
            ReasoningMode::Ai => self.ai_based(request, registry).await,
            ReasoningMode::Hybrid => self.hybrid(request, registry).await,
        }
    }

    /// The highest-priority rule match whose entire target-agent set is
    /// currently available (no member excluded by an open circuit breaker).
    fn best_available_rule_match(&self, request: &serde_json::Value) -> Option<RuleMatch> {
        self.rule_engine
            .evaluate(request)
            .into_iter()
            .find(|m| m.target_agents.iter().all(|a| !self.breaker.is_unavailable(a)))
    }

    /// Registered agent names minus any currently excluded by an open
    /// circuit breaker, for scoping the AI reasoner's catalog and response
    /// validation.
    fn available_agents(&self, registry: &AgentRegistry) -> HashSet<String> {
        registry.names().into_iter().filter(|n| !self.breaker.is_unavailable(n)).collect()
    }

    fn rule_based(&self, request: &serde_json::Value) -> Option<ReasoningResult> {
        let best = self.best_available_rule_match(request)?;
        Some(from_rule_match(best, ReasoningMethod::Rule, 1.0))
    }

    async fn ai_based(
        &self,
        request: &serde_json::Value,
        registry: &AgentRegistry,
    ) -> Option<ReasoningResult> {
        let reasoner = self.ai_reasoner.as_ref()?;
        let available = self.available_agents(registry);
        match reasoner.reason(request, &available).await {
            AiReasonerOutcome::Plan(plan) => Some(plan),
            AiReasonerOutcome::Invalid(_) | AiReasonerOutcome::Failed(_) => None,
        }
    }

    async fn hybrid(
        &self,
        request: &serde_json::Value,
        registry: &AgentRegistry,
    ) -> Option<ReasoningResult> {
        let rule_match = self.best_available_rule_match(request);

        if let Some(ref m) = rule_match {
            if m.confidence >= self.rule_confidence_threshold {
                return Some(from_rule_match(m.clone(), ReasoningMethod::Rule, 1.0));
            }
        }

        if let Some(reasoner) = &self.ai_reasoner {
            let available = self.available_agents(registry);
            match reasoner.reason(request, &available).await {
                // An AI plan accepted in hybrid mode is labelled `Hybrid`,
                // not `Ai`: the rule engine was consulted first and informed
                // the decision to fall through to the model.
                AiReasonerOutcome::Plan(mut plan) => {
                    plan.method = ReasoningMethod::Hybrid;
                    return Some(plan);
                }
                // AI produced a plan but it named unknown or unavailable
                // agents, or was otherwise malformed: fall back to the rule
                // match at full confidence, since the AI's opinion carries
                // no weight here.
                AiReasonerOutcome::Invalid(_) => {
                    if let Some(m) = rule_match {
                        return Some(from_rule_match(m, ReasoningMethod::RuleFallback, 1.0));
                    }
                }
                // AI call itself failed (transport/provider error): fall back
                // to the rule match, discounted, since the rule engine itself
                // was not confident enough to accept outright.
                AiReasonerOutcome::Failed(_) => {
                    if let Some(m) = rule_match {
                        return Some(from_rule_match(m, ReasoningMethod::RuleFallback, 0.8));
                    }
                }
            }
        }

        rule_match.map(|m| from_rule_match(m, ReasoningMethod::RuleFallback, 1.0))
    }
}

fn from_rule_match(m: RuleMatch, method: ReasoningMethod, confidence_scale: f64) -> ReasoningResult {
    ReasoningResult {
        agents: m.target_agents,
        confidence: m.confidence * confidence_scale,
        method,
        parallel: true,
        parameters: HashMap::new(),
        reasoning: m.reasons.join("; "),
        rule_matches: vec![m.rule_name],
        ai_plan: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::config::{RuleCondition, RuleConfig, RuleOperator};

    fn config(mode: ReasoningMode, threshold: f64) -> OrchestratorConfig {
        let mut c = OrchestratorConfig::default();
        c.reasoning_mode = mode;
        c.rule_confidence_threshold = threshold;
        c
    }

    fn rules_with_match(confidence: f64) -> RulesFileConfig {
        RulesFileConfig {
            rules: vec![RuleConfig {
                name: "arithmetic".to_string(),
                priority: 10,
                conditions: vec![RuleCondition {
                    field: "query".to_string(),
                    operator: "contains".to_string(),
                    value: Some("calculate".to_string()),
                    case_sensitive: false,
                }],
                logic: RuleOperator::And,
                target_agents: vec!["calculator".to_string()],
                confidence,
                enabled: true,
            }],
        }
    }

    fn breaker() -> Arc<CircuitBreakerRegistry> {
        Arc::new(CircuitBreakerRegistry::default_policy())
    }

    #[tokio::test]
    async fn rule_only_mode_never_consults_ai() {
        let reasoner = HybridReasoner::new(rules_with_match(0.5), None, &config(ReasoningMode::Rule, 0.9), breaker());
        let registry = AgentRegistry::new();
        let result = reasoner.reason(&serde_json::json!({"query": "calculate 1+1"}), &registry).await.unwrap();
        assert_eq!(result.method, ReasoningMethod::Rule);
    }

    #[tokio::test]
    async fn hybrid_accepts_high_confidence_rule_without_ai() {
        let reasoner = HybridReasoner::new(rules_with_match(0.95), None, &config(ReasoningMode::Hybrid, 0.7), breaker());
        let registry = AgentRegistry::new();
        let result = reasoner.reason(&serde_json::json!({"query": "calculate 1+1"}), &registry).await.unwrap();
        assert_eq!(result.method, ReasoningMethod::Rule);
        assert_eq!(result.confidence, 0.95);
    }

    #[tokio::test]
    async fn hybrid_falls_back_to_rule_when_no_ai_reasoner_configured() {
        let reasoner = HybridReasoner::new(rules_with_match(0.5), None, &config(ReasoningMode::Hybrid, 0.9), breaker());
        let registry = AgentRegistry::new();
        let result = reasoner.reason(&serde_json::json!({"query": "calculate 1+1"}), &registry).await.unwrap();
        assert_eq!(result.method, ReasoningMethod::RuleFallback);
        assert_eq!(result.confidence, 0.5);
    }

    #[tokio::test]
    async fn hybrid_returns_none_when_nothing_matches() {
        let reasoner = HybridReasoner::new(
            RulesFileConfig { rules: vec![] },
            None,
            &config(ReasoningMode::Hybrid, 0.9),
            breaker(),
        );
        let registry = AgentRegistry::new();
        let result = reasoner.reason(&serde_json::json!({"query": "hello"}), &registry).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn rule_based_skips_match_whose_agent_breaker_is_open() {
        let b = breaker();
        for _ in 0..10 {
            b.record_failure("calculator");
        }
        let reasoner = HybridReasoner::new(rules_with_match(0.9), None, &config(ReasoningMode::Rule, 0.5), b);
        let registry = AgentRegistry::new();
        let result = reasoner.reason(&serde_json::json!({"query": "calculate 1+1"}), &registry).await;
        assert!(result.is_none());
    }
}
