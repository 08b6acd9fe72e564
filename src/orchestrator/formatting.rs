//! Output formatting (C8).
//!
//! Grounded in `agent_orchestrator/orchestrator.py`'s response-shaping
//! helpers: a uniform `{success, data, _metadata}` envelope for both single-
//! and multi-agent results, an `agent_trail` recording which agents actually
//! ran in order, and an idempotent error envelope (invariant 10: formatting
//! an already-formatted error output is a no-op, not a double-wrap).

use chrono::Utc;

use super::agent::AgentResponse;
use super::hybrid_reasoner::ReasoningResult;

/// Format a successful (or partially successful) result. Every response,
/// even a lone one, is aggregated under `data` keyed by agent name (later
/// occurrences of a repeated agent are suffixed `_2`, `_3`, ... mirroring the
/// plan's own occurrence numbering) — the pipeline always aggregates, even
/// for a single agent, so callers have one stable shape to parse.
/// `success` is the AND over every response's own success flag, per
/// invariant: per-agent failure never fails the whole batch on its own —
/// that is the validator's job — but the envelope still reports it.
pub fn format_success(
    responses: &[AgentResponse],
    plan: &ReasoningResult,
    request_id: &str,
    total_execution_time: f64,
) -> serde_json::Value {
    let agent_trail: Vec<String> = responses.iter().map(|r| r.agent_name.clone()).collect();
    let successful = responses.iter().filter(|r| r.success).count();
    let failed = responses.len() - successful;
    let max_execution_time = responses.iter().map(|r| r.execution_time).fold(0.0_f64, f64::max);
    let overall_success = responses.iter().all(|r| r.success);

    let data = {
        let mut occurrences: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
        let mut aggregate = serde_json::Map::new();
        for r in responses {
            let count = occurrences.entry(r.agent_name.clone()).or_insert(0);
            *count += 1;
            let key = if *count == 1 {
                r.agent_name.clone()
            } else {
                format!("{}_{}", r.agent_name, count)
            };
            aggregate.insert(key, serde_json::Value::Object(r.data.clone()));
        }
        serde_json::Value::Object(aggregate)
    };

    serde_json::json!({
        "success": overall_success,
        "data": data,
        "_metadata": {
            "request_id": request_id,
            "count": responses.len(),
            "successful": successful,
            "failed": failed,
            "agent_trail": agent_trail,
            "total_execution_time": total_execution_time,
            "max_execution_time": max_execution_time,
            "timestamp": Utc::now().to_rfc3339(),
            "reasoning": {
                "method": plan.method,
                "confidence": plan.confidence,
                "explanation": plan.reasoning,
                "parallel": plan.parallel,
                "selected_agents": plan.agents,
            },
        },
    })
}

/// Format a terminal failure: `{success:false, error, data:{}, _metadata}`.
/// Idempotent: calling this on a value that is already a formatted error
/// output (has `success: false`) returns it unchanged rather than wrapping
/// it again.
pub fn create_error_output(message: impl Into<String>, request_id: &str, existing: Option<&serde_json::Value>) -> serde_json::Value {
    if let Some(value) = existing {
        if value.get("success").and_then(|v| v.as_bool()) == Some(false) {
            return value.clone();
        }
    }
    serde_json::json!({
        "success": false,
        "error": message.into(),
        "data": {},
        "_metadata": {
            "request_id": request_id,
            "timestamp": Utc::now().to_rfc3339(),
        },
    })
}

/// Attach a `validation_warning` to `_metadata` on an already-formatted
/// success output when validation retries were exhausted without ever
/// passing — this is not an error (invariant: exhaustion still returns the
/// best aggregated response).
pub fn attach_validation_warning(mut output: serde_json::Value, reason: impl Into<String>) -> serde_json::Value {
    if let Some(metadata) = output.get_mut("_metadata").and_then(|m| m.as_object_mut()) {
        metadata.insert("validation_warning".to_string(), serde_json::Value::String(reason.into()));
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::hybrid_reasoner::ReasoningMethod;
    use std::collections::HashMap;

    fn plan() -> ReasoningResult {
        ReasoningResult {
            agents: vec!["calculator".to_string()],
            confidence: 0.9,
            method: ReasoningMethod::Rule,
            parallel: true,
            parameters: HashMap::new(),
            reasoning: "matched arithmetic rule".to_string(),
            rule_matches: vec!["arithmetic".to_string()],
            ai_plan: None,
        }
    }

    #[test]
    fn single_response_is_still_keyed_by_agent_name() {
        let resp = AgentResponse::success("calculator", serde_json::json!({"result": 42}), 0.01);
        let out = format_success(&[resp], &plan(), "req-1", 0.01);
        assert_eq!(out["data"]["calculator"]["result"], 42);
        assert_eq!(out["success"], true);
        assert_eq!(out["_metadata"]["request_id"], "req-1");
        assert_eq!(out["_metadata"]["agent_trail"][0], "calculator");
        assert_eq!(out["_metadata"]["reasoning"]["method"], "rule");
    }

    #[test]
    fn multiple_responses_key_by_agent_name() {
        let responses = vec![
            AgentResponse::success("weather", serde_json::json!({"temp": 70}), 0.01),
            AgentResponse::success("weather", serde_json::json!({"temp": 65}), 0.01),
        ];
        let out = format_success(&responses, &plan(), "req-2", 0.02);
        assert_eq!(out["data"]["weather"]["temp"], 70);
        assert_eq!(out["data"]["weather_2"]["temp"], 65);
        assert_eq!(out["_metadata"]["agent_trail"], serde_json::json!(["weather", "weather"]));
    }

    #[test]
    fn a_failed_response_marks_overall_success_false() {
        let responses = vec![
            AgentResponse::success("search", serde_json::json!({"results": []}), 0.01),
            AgentResponse::failure("calculator", "timeout", 0.01),
        ];
        let out = format_success(&responses, &plan(), "req-3", 0.03);
        assert_eq!(out["success"], false);
        assert_eq!(out["_metadata"]["successful"], 1);
        assert_eq!(out["_metadata"]["failed"], 1);
    }

    #[test]
    fn error_output_is_idempotent() {
        let first = create_error_output("boom", "req-4", None);
        let second = create_error_output("different message", "req-4", Some(&first));
        assert_eq!(first, second);
    }

    #[test]
    fn error_output_wraps_non_error_values() {
        let success_shaped = serde_json::json!({"success": true, "data": {}});
        let wrapped = create_error_output("boom", "req-5", Some(&success_shaped));
        assert_eq!(wrapped["success"], false);
        assert_eq!(wrapped["error"], "boom");
    }

    #[test]
    fn validation_warning_attaches_without_marking_error() {
        let resp = AgentResponse::success("calculator", serde_json::json!({"result": 42}), 0.01);
        let out = format_success(&[resp], &plan(), "req-6", 0.01);
        let warned = attach_validation_warning(out, "confidence 0.5 below threshold 0.7");
        assert_eq!(warned["success"], true);
        assert_eq!(warned["_metadata"]["validation_warning"], "confidence 0.5 below threshold 0.7");
    }
}
