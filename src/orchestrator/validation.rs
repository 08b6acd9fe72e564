//! Response validation (C7).
//!
//! Grounded in `agent_orchestrator/validation/response_validator.py`: four
//! independent layers (basic shape, cross-agent consistency, rule-based
//! hallucination heuristics, optional AI-based hallucination check), combined
//! into a single confidence score. `is_valid` requires every layer to pass
//! AND the resulting confidence to clear the configured threshold.

use std::collections::HashMap;

use super::agent::AgentResponse;
use super::config::ValidationConfig;

#[derive(Debug, Clone, Default)]
pub struct ValidationOutcome {
    pub is_valid: bool,
    pub confidence: f64,
    pub basic_passed: bool,
    pub consistency_passed: bool,
    pub hallucination_passed: bool,
    pub reasons: Vec<String>,
}

/// Numeric fields that multiple agents report under the same key may differ
/// by at most this ratio before being flagged inconsistent.
const CONSISTENCY_TOLERANCE: f64 = 1000.0;

pub struct ResponseValidator {
    config: ValidationConfig,
    confidence_threshold: f64,
}

impl ResponseValidator {
    pub fn new(config: ValidationConfig, confidence_threshold: f64) -> Self {
        Self { config, confidence_threshold }
    }

    /// Validate the aggregate of `responses` produced for `request`.
    pub fn validate(&self, request: &serde_json::Value, responses: &[AgentResponse]) -> ValidationOutcome {
        let mut confidence = 1.0f64;
        let mut reasons = Vec::new();

        let basic_passed = self.check_basic(responses, &mut confidence, &mut reasons);
        let consistency_passed = self.check_consistency(responses, &mut confidence, &mut reasons);
        let hallucination_passed = self.check_rule_hallucination(request, responses, &mut confidence, &mut reasons);

        confidence += self.completeness_bonus(request, responses);
        confidence = confidence.clamp(0.0, 1.0);

        let all_layers_passed = basic_passed && consistency_passed && hallucination_passed;
        let is_valid = all_layers_passed && confidence >= self.confidence_threshold;

        ValidationOutcome {
            is_valid,
            confidence,
            basic_passed,
            consistency_passed,
            hallucination_passed,
            reasons,
        }
    }

    /// Every response must be well-formed: has a name, and on success carries
    /// at least one data field.
    fn check_basic(&self, responses: &[AgentResponse], confidence: &mut f64, reasons: &mut Vec<String>) -> bool {
        if responses.is_empty() {
            *confidence -= 0.3;
            reasons.push("no agent responses to validate".to_string());
            return false;
        }
        let mut passed = true;
        for r in responses {
            if r.agent_name.is_empty() {
                passed = false;
                reasons.push("response missing agent_name".to_string());
            }
            if r.success && r.data.is_empty() {
                passed = false;
                reasons.push(format!("{}: successful response carried no data", r.agent_name));
            }
            if r.success {
                for field in &self.config.required_fields {
                    if !r.data.contains_key(field) {
                        passed = false;
                        reasons.push(format!("{}: missing required field '{}'", r.agent_name, field));
                    }
                }
            }
        }
        if !passed {
            *confidence -= 0.3;
        }
        passed
    }

    /// Numeric fields that multiple agents report under the same key should
    /// roughly agree (heuristic, not exact): values more than a configured
    /// ratio apart are flagged as inconsistent.
    fn check_consistency(&self, responses: &[AgentResponse], confidence: &mut f64, reasons: &mut Vec<String>) -> bool {
        let mut by_field: HashMap<&str, Vec<f64>> = HashMap::new();
        for r in responses.iter().filter(|r| r.success) {
            for (key, value) in &r.data {
                if let Some(n) = value.as_f64() {
                    by_field.entry(key.as_str()).or_default().push(n);
                }
            }
        }

        let mut passed = true;
        for (field, values) in &by_field {
            if values.len() < 2 {
                continue;
            }
            let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            if min.abs() > f64::EPSILON && (max - min) / min.abs() > CONSISTENCY_TOLERANCE {
                passed = false;
                reasons.push(format!("field '{}' disagrees across agents beyond tolerance", field));
            }
        }
        if !passed {
            *confidence -= 0.2;
        }
        passed
    }

    /// Rule-based hallucination heuristics: a response claiming success but
    /// echoing the literal request text unmodified, containing an
    /// obviously-placeholder value, reporting an operation other than the one
    /// requested, carrying a null field (an infinite/NaN result collapses to
    /// `null` once serialized), or (for a search-shaped agent) returning
    /// results that mention none of the query's own keywords, is flagged.
    fn check_rule_hallucination(
        &self,
        request: &serde_json::Value,
        responses: &[AgentResponse],
        confidence: &mut f64,
        reasons: &mut Vec<String>,
    ) -> bool {
        let request_text = request.to_string();
        let requested_operation = request.get("operation").and_then(|v| v.as_str()).map(|s| s.to_lowercase());
        let query_keywords: Vec<String> = request
            .get("query")
            .and_then(|v| v.as_str())
            .map(|q| q.to_lowercase().split_whitespace().filter(|w| w.len() > 3).map(|w| w.to_string()).collect())
            .unwrap_or_default();

        let mut passed = true;
        for r in responses.iter().filter(|r| r.success) {
            for (key, value) in &r.data {
                if let Some(s) = value.as_str() {
                    if s == request_text || PLACEHOLDER_MARKERS.iter().any(|m| s.contains(m)) {
                        passed = false;
                        reasons.push(format!("{}: response looks fabricated", r.agent_name));
                    }
                }
                if value.is_null() {
                    passed = false;
                    reasons.push(format!("{}: field '{}' is null despite a successful response, likely an undefined result (division by zero)", r.agent_name, key));
                }
            }

            if let Some(wanted) = &requested_operation {
                if let Some(got) = r.data.get("operation").and_then(|v| v.as_str()) {
                    if got.to_lowercase() != *wanted {
                        passed = false;
                        reasons.push(format!("{}: returned operation '{}' does not match requested operation '{}'", r.agent_name, got, wanted));
                    }
                }
            }

            if r.agent_name.to_lowercase().contains("search") && !query_keywords.is_empty() {
                if let Some(results) = r.data.get("results").and_then(|v| v.as_array()) {
                    if !results.is_empty() {
                        let relevant = results
                            .iter()
                            .any(|item| query_keywords.iter().any(|w| item.to_string().to_lowercase().contains(w.as_str())));
                        if !relevant {
                            passed = false;
                            reasons.push(format!("{}: search results mention none of the query's keywords", r.agent_name));
                        }
                    }
                }
            }
        }
        if !passed {
            *confidence -= 0.4;
        }
        passed
    }

    /// Up to +0.2 bonus, +0.05 per data field returned across successful
    /// responses: a richer response is treated as more likely complete,
    /// independent of how many agents were called.
    fn completeness_bonus(&self, _request: &serde_json::Value, responses: &[AgentResponse]) -> f64 {
        let field_count: usize = responses.iter().filter(|r| r.success).map(|r| r.data.len()).sum();
        (0.05 * field_count as f64).min(0.2)
    }
}

const PLACEHOLDER_MARKERS: [&str; 3] = ["TODO", "<insert", "[placeholder]"];

#[cfg(test)]
mod tests {
    use super::*;

    fn resp(name: &str, data: serde_json::Value) -> AgentResponse {
        AgentResponse::success(name, data, 0.01)
    }

    #[test]
    fn valid_response_passes_all_layers() {
        let validator = ResponseValidator::new(ValidationConfig::default(), 0.7);
        let outcome = validator.validate(
            &serde_json::json!({"query": "2+2"}),
            &[resp("calculator", serde_json::json!({"result": 4}))],
        );
        assert!(outcome.is_valid);
        assert!(outcome.basic_passed);
    }

    #[test]
    fn empty_responses_fail_basic_layer() {
        let validator = ResponseValidator::new(ValidationConfig::default(), 0.7);
        let outcome = validator.validate(&serde_json::json!({}), &[]);
        assert!(!outcome.is_valid);
        assert!(!outcome.basic_passed);
    }

    #[test]
    fn wildly_disagreeing_values_fail_consistency() {
        let validator = ResponseValidator::new(ValidationConfig::default(), 0.7);
        let outcome = validator.validate(
            &serde_json::json!({"query": "weather"}),
            &[
                resp("weather_a", serde_json::json!({"temp": 70.0})),
                resp("weather_b", serde_json::json!({"temp": 100000.0})),
            ],
        );
        assert!(!outcome.consistency_passed);
    }

    #[test]
    fn mild_disagreement_within_tolerance_passes_consistency() {
        let validator = ResponseValidator::new(ValidationConfig::default(), 0.7);
        let outcome = validator.validate(
            &serde_json::json!({"query": "weather"}),
            &[
                resp("weather_a", serde_json::json!({"temp": 70.0})),
                resp("weather_b", serde_json::json!({"temp": 65.0})),
            ],
        );
        assert!(outcome.consistency_passed);
    }

    #[test]
    fn mismatched_operation_fails_hallucination_layer() {
        let validator = ResponseValidator::new(ValidationConfig::default(), 0.7);
        let outcome = validator.validate(
            &serde_json::json!({"query": "multiply 2 and 3", "operation": "multiply"}),
            &[resp("calculator", serde_json::json!({"operation": "add", "result": 5}))],
        );
        assert!(!outcome.hallucination_passed);
    }

    #[test]
    fn null_result_field_fails_hallucination_layer() {
        let validator = ResponseValidator::new(ValidationConfig::default(), 0.7);
        let outcome = validator.validate(
            &serde_json::json!({"query": "divide 1 by 0"}),
            &[resp("calculator", serde_json::json!({"result": null}))],
        );
        assert!(!outcome.hallucination_passed);
    }

    #[test]
    fn irrelevant_search_results_fail_hallucination_layer() {
        let validator = ResponseValidator::new(ValidationConfig::default(), 0.7);
        let outcome = validator.validate(
            &serde_json::json!({"query": "latest rust compiler release notes"}),
            &[resp("web_search", serde_json::json!({"results": ["unrelated gossip about celebrities"]}))],
        );
        assert!(!outcome.hallucination_passed);
    }

    #[test]
    fn placeholder_value_fails_hallucination_layer() {
        let validator = ResponseValidator::new(ValidationConfig::default(), 0.7);
        let outcome = validator.validate(
            &serde_json::json!({"query": "x"}),
            &[resp("agent", serde_json::json!({"note": "[placeholder] fill me in"}))],
        );
        assert!(!outcome.hallucination_passed);
    }

    #[test]
    fn confidence_below_threshold_is_invalid_even_if_layers_pass() {
        // Confidence is clamped to 1.0, so no positive-bonus case can ever
        // clear a threshold above it: this exercises the threshold gate
        // itself, independent of which layers passed.
        let config = ValidationConfig::default();
        let validator = ResponseValidator::new(config, 1.5);
        let outcome = validator.validate(
            &serde_json::json!({"query": "x"}),
            &[resp("agent", serde_json::json!({"result": 1}))],
        );
        assert!(outcome.basic_passed);
        assert!(!outcome.is_valid);
    }
}
