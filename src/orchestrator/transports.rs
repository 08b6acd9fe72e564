//! Concrete agent transports: remote HTTP endpoints and in-process callables.
//!
//! The remote transport mirrors the toolkit's `McpClientProtocol`
//! (`src/llm/tool_protocols.rs`) — `GET {base}/tools`, `POST {base}/call`,
//! `GET {base}/health` — generalized to the `Agent` trait. The in-process
//! transport is grounded in `agent_orchestrator/agents/direct_agent.py`:
//! a named callable that introspects its own accepted keys and drops the rest.

use async_trait::async_trait;
use serde::Deserialize;
use std::error::Error;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::agent::{strip_reserved_keys, Agent, AgentResponse};

/// An agent reached over HTTP: discovery via `GET {base}/tools`, invocation
/// via `POST {base}/call`, health via `GET {base}/health` (2xx = healthy).
pub struct RemoteHttpAgent {
    name: String,
    base_url: String,
    capabilities: Vec<String>,
    client: reqwest::Client,
    default_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct CallResponseBody {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    data: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<String>,
}

impl RemoteHttpAgent {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        capabilities: Vec<String>,
        default_timeout: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            capabilities,
            client: reqwest::Client::new(),
            default_timeout,
        }
    }

    /// Discover tool metadata advertised at `GET {base}/tools`.
    pub async fn discover_tools(&self) -> Result<serde_json::Value, Box<dyn Error + Send + Sync>> {
        let url = format!("{}/tools", self.base_url);
        let resp = self.client.get(&url).send().await?;
        Ok(resp.json::<serde_json::Value>().await?)
    }
}

#[async_trait]
impl Agent for RemoteHttpAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    async fn call(
        &self,
        input: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<AgentResponse, Box<dyn Error + Send + Sync>> {
        let started = Instant::now();
        let effective_timeout = timeout.unwrap_or(self.default_timeout);

        let params = match input {
            serde_json::Value::Object(map) => strip_reserved_keys(map),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };

        let mut body = serde_json::Map::new();
        body.insert("tool".to_string(), serde_json::json!(self.name));
        body.insert("parameters".to_string(), serde_json::Value::Object(params));

        let url = format!("{}/call", self.base_url);
        let result = tokio::time::timeout(
            effective_timeout,
            self.client.post(&url).json(&body).send(),
        )
        .await;

        let elapsed = started.elapsed().as_secs_f64();

        let response = match result {
            Err(_) => {
                return Ok(AgentResponse::failure(
                    &self.name,
                    format!("timeout after {:?}", effective_timeout),
                    elapsed,
                ))
            }
            Ok(Err(e)) => {
                return Ok(AgentResponse::failure(
                    &self.name,
                    format!("connection error: {}", e),
                    elapsed,
                ))
            }
            Ok(Ok(resp)) => resp,
        };

        if !response.status().is_success() {
            let status = response.status();
            return Ok(AgentResponse::failure(
                &self.name,
                format!("agent returned HTTP {}", status),
                elapsed,
            ));
        }

        let parsed: CallResponseBody = match response.json().await {
            Ok(body) => body,
            Err(e) => {
                return Ok(AgentResponse::failure(
                    &self.name,
                    format!("invalid response body: {}", e),
                    elapsed,
                ))
            }
        };

        if parsed.success == Some(false) {
            return Ok(AgentResponse::failure(
                &self.name,
                parsed.error.unwrap_or_else(|| "agent reported failure".to_string()),
                elapsed,
            ));
        }

        Ok(AgentResponse::success(
            &self.name,
            parsed.data.unwrap_or(serde_json::Value::Null),
            elapsed,
        ))
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        matches!(self.client.get(&url).send().await, Ok(resp) if resp.status().is_success())
    }
}

/// Signature for an in-process callable agent: takes the stripped/filtered
/// parameter map and returns the raw (unwrapped) output value.
pub type DirectCallable =
    dyn Fn(serde_json::Map<String, serde_json::Value>) -> Result<serde_json::Value, Box<dyn Error + Send + Sync>>
        + Send
        + Sync;

/// An in-process agent bound to a Rust closure. Introspects its declared
/// `accepted_parameters`: request keys not in this set are dropped before the
/// closure is invoked, and missing required parameters fail with a clear
/// execution error (§4.1).
pub struct DirectAgent {
    name: String,
    capabilities: Vec<String>,
    accepted_parameters: Vec<String>,
    required_parameters: Vec<String>,
    callable: Arc<DirectCallable>,
}

impl DirectAgent {
    pub fn new(
        name: impl Into<String>,
        capabilities: Vec<String>,
        accepted_parameters: Vec<String>,
        required_parameters: Vec<String>,
        callable: Arc<DirectCallable>,
    ) -> Self {
        Self {
            name: name.into(),
            capabilities,
            accepted_parameters,
            required_parameters,
            callable,
        }
    }
}

#[async_trait]
impl Agent for DirectAgent {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    async fn call(
        &self,
        input: serde_json::Value,
        _timeout: Option<Duration>,
    ) -> Result<AgentResponse, Box<dyn Error + Send + Sync>> {
        let started = Instant::now();

        let map = match input {
            serde_json::Value::Object(map) => strip_reserved_keys(map),
            _ => serde_json::Map::new(),
        };

        for required in &self.required_parameters {
            if !map.contains_key(required) {
                return Ok(AgentResponse::failure(
                    &self.name,
                    format!("missing required parameter '{}'", required),
                    started.elapsed().as_secs_f64(),
                ));
            }
        }

        let filtered: serde_json::Map<String, serde_json::Value> = if self.accepted_parameters.is_empty() {
            map
        } else {
            map.into_iter()
                .filter(|(k, _)| self.accepted_parameters.iter().any(|a| a == k))
                .collect()
        };

        let callable = self.callable.clone();
        let result = tokio::task::spawn_blocking(move || callable(filtered))
            .await
            .map_err(|e| format!("direct agent task panicked: {}", e))?;

        let elapsed = started.elapsed().as_secs_f64();
        match result {
            Ok(value) => Ok(AgentResponse::success(&self.name, value, elapsed)),
            Err(e) => Ok(AgentResponse::failure(&self.name, e.to_string(), elapsed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn direct_agent_drops_unrecognized_keys() {
        let agent = DirectAgent::new(
            "calculator",
            vec!["math".to_string()],
            vec!["operation".to_string(), "operands".to_string()],
            vec!["operation".to_string(), "operands".to_string()],
            Arc::new(|params| {
                let operands = params["operands"].as_array().unwrap();
                let sum: f64 = operands.iter().filter_map(|v| v.as_f64()).sum();
                Ok(serde_json::json!({"result": sum}))
            }),
        );

        let input = serde_json::json!({
            "operation": "add",
            "operands": [15, 27],
            "extraneous_field": "should be dropped",
        });

        let resp = agent.call(input, None).await.unwrap();
        assert!(resp.success);
        assert_eq!(resp.data.get("result"), Some(&serde_json::json!(42.0)));
    }

    #[tokio::test]
    async fn direct_agent_fails_clearly_on_missing_required_parameter() {
        let agent = DirectAgent::new(
            "calculator",
            vec![],
            vec!["operation".to_string(), "operands".to_string()],
            vec!["operands".to_string()],
            Arc::new(|_| Ok(serde_json::json!({"result": 0}))),
        );

        let resp = agent.call(serde_json::json!({"operation": "add"}), None).await.unwrap();
        assert!(!resp.success);
        assert!(resp.error.unwrap().contains("operands"));
    }

    #[tokio::test]
    async fn direct_agent_strips_reserved_keys() {
        let agent = DirectAgent::new(
            "echo",
            vec![],
            vec![],
            vec![],
            Arc::new(|params| Ok(serde_json::Value::Object(params))),
        );
        let resp = agent
            .call(serde_json::json!({"request_id": "x", "city": "NY"}), None)
            .await
            .unwrap();
        assert!(!resp.data.contains_key("request_id"));
        assert!(resp.data.contains_key("city"));
    }
}
