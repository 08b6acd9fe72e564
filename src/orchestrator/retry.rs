//! Retry/fallback executor (C5).
//!
//! Grounded in `agent_orchestrator/utils/retry.py` (`RetryHandler`,
//! `FallbackStrategy`) for the attempt/backoff/fallback bookkeeping, and in
//! the toolkit's `tokio::spawn` fan-out-then-await-in-plan-order pattern
//! (`src/llm/orchestration.rs::Orchestration::execute_parallel`) for the
//! parallel dispatch half: one task per call, joined in plan order rather than
//! completion order (§5 ordering guarantee (b)).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::agent::{AgentRegistry, AgentResponse};
use super::circuit_breaker::CircuitBreakerRegistry;
use super::config::RetryConfig;
use super::error::is_retryable_text;
use super::hybrid_reasoner::ReasoningResult;

/// Per-agent occurrence counter used to derive the suffixed parameter key
/// (`name`, `name_2`, `name_3`, ...) for the k-th occurrence of an agent name
/// in the plan's ordered multiset (§4.4 invariant 3).
fn parameter_key_for_occurrence(name: &str, occurrence: usize) -> String {
    if occurrence == 1 {
        name.to_string()
    } else {
        format!("{}_{}", name, occurrence)
    }
}

/// A jitter source with no external `rand` dependency: draws from the
/// sub-second component of the monotonic clock, which is unpredictable enough
/// for backoff jitter without pulling in a crate this pipeline has no other
/// use for.
fn jitter_fraction() -> f64 {
    let nanos = std::time::Instant::now().elapsed().subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base = if config.exponential_backoff {
        config.base_delay * 2f64.powi(attempt as i32)
    } else {
        config.base_delay
    };
    let jittered = base * (0.85 + 0.3 * jitter_fraction());
    Duration::from_secs_f64(jittered.min(config.max_delay))
}

fn is_retryable(response: &AgentResponse, config: &RetryConfig) -> bool {
    match &response.error {
        Some(text) => is_retryable_text(text, config.retry_on_timeout, config.retry_on_connection_error),
        None => false,
    }
}

/// Executes one agent's calls against the retry policy, returning the final
/// response. On exhaustion, falls back to `fallback` (if configured) exactly
/// once, without its own retries, stamping `metadata.fallback_from`.
pub struct RetryHandler {
    config: RetryConfig,
    breaker: Arc<CircuitBreakerRegistry>,
}

impl RetryHandler {
    pub fn new(config: RetryConfig, breaker: Arc<CircuitBreakerRegistry>) -> Self {
        Self { config, breaker }
    }

    pub async fn call_with_retry(
        &self,
        registry: &AgentRegistry,
        agent_name: &str,
        fallback_name: Option<&str>,
        input: serde_json::Value,
        timeout: Option<Duration>,
    ) -> AgentResponse {
        let mut last_response = None;
        for attempt in 0..self.config.max_attempts {
            let response = self.dispatch_once(registry, agent_name, input.clone(), timeout).await;
            let success = response.success;
            if success {
                self.breaker.record_success(agent_name);
                return response;
            }
            self.breaker.record_failure(agent_name);
            let retryable = is_retryable(&response, &self.config);
            last_response = Some(response);
            if !retryable || attempt + 1 >= self.config.max_attempts {
                break;
            }
            tokio::time::sleep(backoff_delay(&self.config, attempt)).await;
        }

        let exhausted = last_response.unwrap_or_else(|| {
            AgentResponse::failure(agent_name, "no attempts were made", 0.0)
        });

        if let Some(fallback) = fallback_name {
            if registry.get(fallback).is_some() {
                let mut fallback_response = self.dispatch_once(registry, fallback, input, timeout).await;
                if fallback_response.success {
                    self.breaker.record_success(fallback);
                } else {
                    self.breaker.record_failure(fallback);
                }
                fallback_response = fallback_response.with_metadata(
                    "fallback_from",
                    serde_json::json!(agent_name),
                );
                return fallback_response;
            }
        }

        exhausted
    }

    async fn dispatch_once(
        &self,
        registry: &AgentRegistry,
        agent_name: &str,
        input: serde_json::Value,
        timeout: Option<Duration>,
    ) -> AgentResponse {
        let handle = match registry.get(agent_name) {
            Some(h) => h,
            None => return AgentResponse::failure(agent_name, format!("agent '{}' not found", agent_name), 0.0),
        };
        let started = std::time::Instant::now();
        let result = handle.agent.call(input, timeout).await;
        let response = match result {
            Ok(r) => r,
            Err(e) => AgentResponse::failure(agent_name, e.to_string(), started.elapsed().as_secs_f64()),
        };
        handle.stats.record_call(response.execution_time, response.success);
        response
    }
}

/// Merge the base request with per-call parameters, as plain JSON objects.
fn merge_params(
    request: &serde_json::Map<String, serde_json::Value>,
    overrides: Option<&serde_json::Value>,
) -> serde_json::Value {
    let mut merged = request.clone();
    if let Some(serde_json::Value::Object(map)) = overrides {
        for (k, v) in map {
            merged.insert(k.clone(), v.clone());
        }
    }
    serde_json::Value::Object(merged)
}

/// Extract a nested numeric field from a weather-shaped response, falling
/// back to the literal field name. Mirrors the `current.temp`/
/// `current.temperature` convenience path in
/// `_extract_data_from_responses` (open question 2, resolved to keep this as
/// the only convenience path — see DESIGN.md).
fn extract_field(response: &AgentResponse, field: &str) -> Option<serde_json::Value> {
    if let Some(v) = response.data.get(field) {
        return Some(v.clone());
    }
    if field == "temp" || field == "temperature" {
        if let Some(current) = response.data.get("current").and_then(|c| c.as_object()) {
            if let Some(v) = current.get("temp").or_else(|| current.get("temperature")) {
                return Some(v.clone());
            }
        }
    }
    None
}

/// Result of executing a plan: responses in plan order plus which agents were
/// actually retried (for per-query log reporting).
pub struct ExecutionOutcome {
    pub responses: Vec<AgentResponse>,
    pub agent_trail: Vec<String>,
}

/// Execute a reasoning plan's calls against the registry.
///
/// Parallel plans dispatch every call concurrently and join in plan order
/// (not completion order). Sequential plans run one at a time and support
/// data chaining: a call whose parameters contain `data_source: "previous"`
/// has its input replaced with values extracted from prior successful
/// responses.
pub async fn execute_plan(
    handler: &RetryHandler,
    registry: &AgentRegistry,
    plan: &ReasoningResult,
    request: &serde_json::Map<String, serde_json::Value>,
    fallback_map: &HashMap<String, String>,
    default_timeout: Duration,
) -> ExecutionOutcome {
    let mut occurrence_counts: HashMap<String, usize> = HashMap::new();
    let calls: Vec<(String, serde_json::Value)> = plan
        .agents
        .iter()
        .map(|name| {
            let occurrence = {
                let counter = occurrence_counts.entry(name.clone()).or_insert(0);
                *counter += 1;
                *counter
            };
            let key = parameter_key_for_occurrence(name, occurrence);
            let overrides = plan.parameters.get(&key);
            (name.clone(), merge_params(request, overrides))
        })
        .collect();

    let agent_trail: Vec<String> = calls.iter().map(|(name, _)| name.clone()).collect();

    if plan.parallel {
        let futures = calls.into_iter().map(|(name, input)| {
            let fallback = fallback_map.get(&name).cloned();
            async move {
                handler
                    .call_with_retry(registry, &name, fallback.as_deref(), input, Some(default_timeout))
                    .await
            }
        });
        let responses = futures_util::future::join_all(futures).await;
        return ExecutionOutcome { responses, agent_trail };
    }

    let mut responses: Vec<AgentResponse> = Vec::with_capacity(calls.len());
    for (name, mut input) in calls {
        if let Some(true) = input.get("data_source").map(|v| v == "previous") {
            if let Some(field) = input.get("field").and_then(|v| v.as_str()).map(|s| s.to_string()) {
                let operation = input.get("operation").and_then(|v| v.as_str()).map(|s| s.to_string());
                let values: Vec<serde_json::Value> = responses
                    .iter()
                    .filter(|r| r.success)
                    .filter_map(|r| extract_field(r, &field))
                    .collect();
                input = match operation {
                    Some(op) => serde_json::json!({"operation": op, "operands": values}),
                    None => serde_json::json!({"values": values}),
                };
            }
        }
        let fallback = fallback_map.get(&name).cloned();
        let response = handler
            .call_with_retry(registry, &name, fallback.as_deref(), input, Some(default_timeout))
            .await;
        responses.push(response);
    }

    ExecutionOutcome { responses, agent_trail }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::agent::Agent;
    use crate::orchestrator::hybrid_reasoner::ReasoningMethod;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc as StdArc;

    struct FlakyAgent {
        name: String,
        attempts: StdArc<AtomicUsize>,
        fail_times: usize,
    }

    #[async_trait]
    impl Agent for FlakyAgent {
        fn name(&self) -> &str {
            &self.name
        }
        fn capabilities(&self) -> &[String] {
            &[]
        }
        async fn call(
            &self,
            _input: serde_json::Value,
            _timeout: Option<Duration>,
        ) -> Result<AgentResponse, Box<dyn std::error::Error + Send + Sync>> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
            if attempt < self.fail_times {
                Ok(AgentResponse::failure(&self.name, "connection refused", 0.001))
            } else {
                Ok(AgentResponse::success(&self.name, serde_json::json!({"ok": true}), 0.001))
            }
        }
    }

    fn base_plan(agents: Vec<&str>, parallel: bool, parameters: HashMap<String, serde_json::Value>) -> ReasoningResult {
        ReasoningResult {
            agents: agents.into_iter().map(|s| s.to_string()).collect(),
            confidence: 1.0,
            method: ReasoningMethod::Rule,
            parallel,
            parameters,
            reasoning: "test".to_string(),
            rule_matches: vec![],
            ai_plan: None,
        }
    }

    #[tokio::test]
    async fn retries_up_to_max_attempts_then_gives_up() {
        let registry = AgentRegistry::new();
        let attempts = StdArc::new(AtomicUsize::new(0));
        registry
            .register(
                StdArc::new(FlakyAgent { name: "calculator".into(), attempts: attempts.clone(), fail_times: 10 }),
                true,
            )
            .await
            .unwrap();
        let breaker = StdArc::new(CircuitBreakerRegistry::default_policy());
        let handler = RetryHandler::new(
            RetryConfig { max_attempts: 3, base_delay: 0.001, max_delay: 0.01, ..RetryConfig::default() },
            breaker,
        );
        let resp = handler
            .call_with_retry(&registry, "calculator", None, serde_json::json!({}), None)
            .await;
        assert!(!resp.success);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let registry = AgentRegistry::new();
        let attempts = StdArc::new(AtomicUsize::new(0));
        registry
            .register(
                StdArc::new(FlakyAgent { name: "calculator".into(), attempts: attempts.clone(), fail_times: 1 }),
                true,
            )
            .await
            .unwrap();
        let breaker = StdArc::new(CircuitBreakerRegistry::default_policy());
        let handler = RetryHandler::new(
            RetryConfig { max_attempts: 3, base_delay: 0.001, max_delay: 0.01, ..RetryConfig::default() },
            breaker,
        );
        let resp = handler
            .call_with_retry(&registry, "calculator", None, serde_json::json!({}), None)
            .await;
        assert!(resp.success);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn falls_back_once_after_exhaustion() {
        let registry = AgentRegistry::new();
        let primary_attempts = StdArc::new(AtomicUsize::new(0));
        let fallback_attempts = StdArc::new(AtomicUsize::new(0));
        registry
            .register(StdArc::new(FlakyAgent { name: "primary".into(), attempts: primary_attempts.clone(), fail_times: 100 }), true)
            .await
            .unwrap();
        registry
            .register(StdArc::new(FlakyAgent { name: "backup".into(), attempts: fallback_attempts.clone(), fail_times: 0 }), true)
            .await
            .unwrap();
        let breaker = StdArc::new(CircuitBreakerRegistry::default_policy());
        let handler = RetryHandler::new(
            RetryConfig { max_attempts: 2, base_delay: 0.001, max_delay: 0.01, ..RetryConfig::default() },
            breaker,
        );
        let resp = handler
            .call_with_retry(&registry, "primary", Some("backup"), serde_json::json!({}), None)
            .await;
        assert!(resp.success);
        assert_eq!(resp.metadata.get("fallback_from"), Some(&serde_json::json!("primary")));
        assert_eq!(fallback_attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sequential_plan_preserves_order_and_chains_data() {
        struct WeatherAgent {
            name: String,
            temp: f64,
        }
        #[async_trait]
        impl Agent for WeatherAgent {
            fn name(&self) -> &str {
                &self.name
            }
            fn capabilities(&self) -> &[String] {
                &[]
            }
            async fn call(
                &self,
                _input: serde_json::Value,
                _timeout: Option<Duration>,
            ) -> Result<AgentResponse, Box<dyn std::error::Error + Send + Sync>> {
                Ok(AgentResponse::success(&self.name, serde_json::json!({"current": {"temp": self.temp}}), 0.001))
            }
        }
        struct AverageAgent;
        #[async_trait]
        impl Agent for AverageAgent {
            fn name(&self) -> &str {
                "calculator"
            }
            fn capabilities(&self) -> &[String] {
                &[]
            }
            async fn call(
                &self,
                input: serde_json::Value,
                _timeout: Option<Duration>,
            ) -> Result<AgentResponse, Box<dyn std::error::Error + Send + Sync>> {
                let operands = input["operands"].as_array().unwrap();
                let sum: f64 = operands.iter().filter_map(|v| v.as_f64()).sum();
                Ok(AgentResponse::success("calculator", serde_json::json!({"result": sum / operands.len() as f64}), 0.001))
            }
        }

        let registry = AgentRegistry::new();
        registry.register(StdArc::new(WeatherAgent { name: "weather".into(), temp: 72.0 }), true).await.unwrap();
        registry.register(StdArc::new(AverageAgent), true).await.unwrap();

        let mut parameters = HashMap::new();
        parameters.insert("weather".to_string(), serde_json::json!({"city": "NY"}));
        parameters.insert(
            "weather_2".to_string(),
            serde_json::json!({"city": "LA"}),
        );
        parameters.insert(
            "calculator".to_string(),
            serde_json::json!({"data_source": "previous", "field": "temp", "operation": "average"}),
        );
        let plan = base_plan(vec!["weather", "weather", "calculator"], false, parameters);

        let breaker = StdArc::new(CircuitBreakerRegistry::default_policy());
        let handler = RetryHandler::new(RetryConfig::default(), breaker);
        let outcome = execute_plan(&handler, &registry, &plan, &serde_json::Map::new(), &HashMap::new(), Duration::from_secs(5)).await;

        assert_eq!(outcome.agent_trail, vec!["weather", "weather", "calculator"]);
        let last = outcome.responses.last().unwrap();
        assert_eq!(last.data.get("operation"), None);
        assert_eq!(last.data.get("result"), Some(&serde_json::json!(72.0)));
    }
}
