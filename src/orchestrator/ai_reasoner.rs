//! AI-driven reasoning (C3).
//!
//! Grounded in `agent_orchestrator/reasoning/ai_reasoner.py` for the prompt
//! shape (catalog of agents + JSON-plan response contract) and in
//! `mcp_server_gateway/reasoning/gateway_reasoner.py` for the provider-error
//! retry policy (no retry on 4xx except 429, longer backoff on 429, retry on
//! 5xx/timeout/connection). Composes with [`crate::llm::client_wrapper::ClientWrapper`]
//! rather than talking to a provider directly.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::llm::client_wrapper::{ClientWrapper, Message, Role};
use crate::orchestrator::config::AgentsFileConfig;
use crate::orchestrator::hybrid_reasoner::{ReasoningMethod, ReasoningResult};

/// Why `AiReasoner::reason` did not return a usable plan.
pub enum AiReasonerOutcome {
    Plan(ReasoningResult),
    /// The model replied, but the plan named unknown agents, had no required
    /// fields, or otherwise failed the response contract.
    Invalid(String),
    /// The provider call itself failed after exhausting its retry policy.
    Failed(String),
}

/// Bounded retry policy for provider calls: 400/401/404 never retried, 429
/// retried with a longer delay, everything else (5xx, timeout, connection)
/// retried at the base delay. Distinct from the agent-level [`super::retry`]
/// policy since provider errors classify differently than agent errors.
struct ProviderRetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    rate_limit_delay: Duration,
}

impl Default for ProviderRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            rate_limit_delay: Duration::from_secs(5),
        }
    }
}

fn classify_provider_error(message: &str) -> ProviderErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("429") || lower.contains("rate limit") {
        ProviderErrorKind::RateLimited
    } else if lower.contains("400") || lower.contains("401") || lower.contains("404") {
        ProviderErrorKind::NonRetryable
    } else {
        ProviderErrorKind::Retryable
    }
}

enum ProviderErrorKind {
    NonRetryable,
    RateLimited,
    Retryable,
}

pub struct AiReasoner {
    client: Arc<dyn ClientWrapper>,
    agents_catalog: AgentsFileConfig,
    retry_policy: ProviderRetryPolicy,
}

impl AiReasoner {
    pub fn new(client: Arc<dyn ClientWrapper>, agents_catalog: AgentsFileConfig) -> Self {
        Self {
            client,
            agents_catalog,
            retry_policy: ProviderRetryPolicy::default(),
        }
    }

    /// `available` is the set of agent names currently eligible to be called
    /// (i.e. not excluded by an open circuit breaker). Both the prompt's
    /// catalog and the response's agent-name validation are scoped to it.
    pub async fn reason(&self, request: &serde_json::Value, available: &HashSet<String>) -> AiReasonerOutcome {
        let prompt = self.build_prompt(request, available);
        let messages = [Message {
            role: Role::User,
            content: Arc::from(prompt.as_str()),
            tool_calls: vec![],
        }];

        let mut last_error = String::new();
        for attempt in 0..self.retry_policy.max_attempts {
            match self.client.send_message(&messages, None).await {
                Ok(reply) => return self.parse_plan(&reply.content, available),
                Err(e) => {
                    let message = e.to_string();
                    let kind = classify_provider_error(&message);
                    last_error = message;
                    match kind {
                        ProviderErrorKind::NonRetryable => break,
                        ProviderErrorKind::RateLimited => {
                            if attempt + 1 < self.retry_policy.max_attempts {
                                tokio::time::sleep(self.retry_policy.rate_limit_delay).await;
                            }
                        }
                        ProviderErrorKind::Retryable => {
                            if attempt + 1 < self.retry_policy.max_attempts {
                                tokio::time::sleep(self.retry_policy.base_delay * (attempt + 1)).await;
                            }
                        }
                    }
                }
            }
        }
        AiReasonerOutcome::Failed(last_error)
    }

    fn build_prompt(&self, request: &serde_json::Value, available: &HashSet<String>) -> String {
        let catalog: Vec<serde_json::Value> = self
            .agents_catalog
            .agents
            .iter()
            .filter(|a| a.enabled && available.contains(&a.name))
            .map(|a| {
                serde_json::json!({
                    "name": a.name,
                    "capabilities": a.capabilities,
                    "role": a.role.as_ref().map(|r| r.description.clone()),
                })
            })
            .collect();

        format!(
            "You are an orchestration planner. Given the request and the catalog of \
             available agents below, choose which agents to call and in what order.\n\n\
             Respond with ONLY a JSON object of the form:\n\
             {{\"agents\": [\"agent_name\", ...], \"parallel\": true|false, \
             \"parameters\": {{\"agent_name\": {{...overrides...}}}}, \"reasoning\": \"...\"}}\n\n\
             Agent catalog:\n{}\n\nRequest:\n{}",
            serde_json::to_string_pretty(&catalog).unwrap_or_default(),
            serde_json::to_string_pretty(request).unwrap_or_default(),
        )
    }

    fn parse_plan(&self, raw: &str, available: &HashSet<String>) -> AiReasonerOutcome {
        let stripped = strip_json_fence(raw);
        let value: serde_json::Value = match serde_json::from_str(&stripped) {
            Ok(v) => v,
            Err(e) => return AiReasonerOutcome::Invalid(format!("response was not valid JSON: {}", e)),
        };

        let agents: Vec<String> = match value.get("agents").and_then(|v| v.as_array()) {
            Some(arr) => arr.iter().filter_map(|v| v.as_str().map(|s| s.to_string())).collect(),
            None => return AiReasonerOutcome::Invalid("plan is missing required field 'agents'".to_string()),
        };
        if agents.is_empty() {
            return AiReasonerOutcome::Invalid("plan named zero agents".to_string());
        }

        for name in &agents {
            if !available.contains(name) {
                return AiReasonerOutcome::Invalid(format!("plan named unknown or unavailable agent '{}'", name));
            }
        }

        let parallel = value.get("parallel").and_then(|v| v.as_bool()).unwrap_or(true);
        let reasoning = value
            .get("reasoning")
            .and_then(|v| v.as_str())
            .unwrap_or("ai plan")
            .to_string();

        let parameters: HashMap<String, serde_json::Value> = value
            .get("parameters")
            .and_then(|v| v.as_object())
            .map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        AiReasonerOutcome::Plan(ReasoningResult {
            agents,
            confidence: 1.0,
            method: ReasoningMethod::Ai,
            parallel,
            parameters,
            reasoning,
            rule_matches: vec![],
            ai_plan: Some(value),
        })
    }
}

/// Strip a surrounding ` ```json ... ``` ` or ` ``` ... ``` ` fence if present.
fn strip_json_fence(raw: &str) -> String {
    let trimmed = raw.trim();
    if let Some(rest) = trimmed.strip_prefix("```json") {
        rest.trim_end_matches("```").trim().to_string()
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest.trim_end_matches("```").trim().to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::error::Error;

    struct EchoClient {
        reply: String,
    }
    #[async_trait]
    impl ClientWrapper for EchoClient {
        async fn send_message(
            &self,
            _messages: &[Message],
            _tools: Option<Vec<crate::llm::client_wrapper::ToolDefinition>>,
        ) -> Result<Message, Box<dyn Error>> {
            Ok(Message {
                role: Role::Assistant,
                content: Arc::from(self.reply.as_str()),
                tool_calls: vec![],
            })
        }
        fn model_name(&self) -> &str {
            "stub"
        }
    }

    fn available(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn strips_json_fence() {
        assert_eq!(strip_json_fence("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_json_fence("{\"a\":1}"), "{\"a\":1}");
    }

    #[tokio::test]
    async fn valid_plan_naming_known_agents_is_accepted() {
        let reasoner = AiReasoner::new(
            Arc::new(EchoClient { reply: r#"{"agents": ["calculator"], "parallel": true, "reasoning": "math"}"#.to_string() }),
            AgentsFileConfig { agents: vec![] },
        );
        match reasoner.reason(&serde_json::json!({"query": "2+2"}), &available(&["calculator"])).await {
            AiReasonerOutcome::Plan(plan) => {
                assert_eq!(plan.agents, vec!["calculator".to_string()]);
                assert_eq!(plan.method, ReasoningMethod::Ai);
            }
            _ => panic!("expected a plan"),
        }
    }

    #[tokio::test]
    async fn plan_naming_unknown_agent_is_invalid() {
        let reasoner = AiReasoner::new(
            Arc::new(EchoClient { reply: r#"{"agents": ["ghost"]}"#.to_string() }),
            AgentsFileConfig { agents: vec![] },
        );
        match reasoner.reason(&serde_json::json!({"query": "x"}), &available(&["calculator"])).await {
            AiReasonerOutcome::Invalid(msg) => assert!(msg.contains("ghost")),
            _ => panic!("expected invalid"),
        }
    }

    #[tokio::test]
    async fn plan_naming_breaker_unavailable_agent_is_invalid() {
        let reasoner = AiReasoner::new(
            Arc::new(EchoClient { reply: r#"{"agents": ["calculator"]}"#.to_string() }),
            AgentsFileConfig { agents: vec![] },
        );
        match reasoner.reason(&serde_json::json!({"query": "x"}), &available(&["web_search"])).await {
            AiReasonerOutcome::Invalid(msg) => assert!(msg.contains("calculator")),
            _ => panic!("expected invalid"),
        }
    }

    #[tokio::test]
    async fn malformed_json_is_invalid() {
        let reasoner = AiReasoner::new(
            Arc::new(EchoClient { reply: "not json at all".to_string() }),
            AgentsFileConfig { agents: vec![] },
        );
        match reasoner.reason(&serde_json::json!({"query": "x"}), &available(&["calculator"])).await {
            AiReasonerOutcome::Invalid(_) => {}
            _ => panic!("expected invalid"),
        }
    }
}
