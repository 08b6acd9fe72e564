//! Agent interface and registry (C1).
//!
//! Generalized from the toolkit's `ToolProtocol`/`ToolRegistry`/`ToolResult`
//! (`src/llm/tool_protocol.rs`): the same call/list/metadata shape, widened
//! with `capabilities`, a capability index, and `health_check`/`initialize`/
//! `cleanup` lifecycle hooks (supplemented from
//! `agent_orchestrator/agents/base_agent.py`'s abstract `BaseAgent`).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Reserved request keys stripped before dispatch to any agent (§4.1, §9).
pub const RESERVED_KEYS: [&str; 4] = ["tool", "agent", "timeout", "request_id"];

/// Produced by every agent call. Non-mapping scalar outputs are wrapped by the
/// caller as `{"result": value}` before construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResponse {
    pub success: bool,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
    pub error: Option<String>,
    #[serde(default)]
    pub agent_name: String,
    #[serde(default)]
    pub execution_time: f64,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl AgentResponse {
    pub fn success(agent_name: impl Into<String>, data: serde_json::Value, execution_time: f64) -> Self {
        let data = match data {
            serde_json::Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("result".to_string(), other);
                map
            }
        };
        Self {
            success: true,
            data,
            error: None,
            agent_name: agent_name.into(),
            execution_time,
            metadata: serde_json::Map::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn failure(agent_name: impl Into<String>, error: impl Into<String>, execution_time: f64) -> Self {
        Self {
            success: false,
            data: serde_json::Map::new(),
            error: Some(error.into()),
            agent_name: agent_name.into(),
            execution_time,
            metadata: serde_json::Map::new(),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Error kinds surfaced by agent implementations before being translated into
/// a failed [`AgentResponse`] at the registry boundary.
#[derive(Debug, Clone)]
pub enum AgentError {
    Timeout(String),
    Connection(String),
    Execution(String),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentError::Timeout(msg) => write!(f, "agent timeout: {}", msg),
            AgentError::Connection(msg) => write!(f, "agent connection error: {}", msg),
            AgentError::Execution(msg) => write!(f, "agent execution failed: {}", msg),
        }
    }
}

impl Error for AgentError {}

/// Uniform contract every agent implements, regardless of transport.
///
/// `call` MUST never throw across the boundary — transport/timeout failures
/// are returned as `AgentResponse{success:false, ..}`, never as `Err`, except
/// where the registry itself cannot even construct a response (caught and
/// converted by the registry).
#[async_trait]
pub trait Agent: Send + Sync {
    fn name(&self) -> &str;

    fn capabilities(&self) -> &[String];

    async fn call(
        &self,
        input: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Result<AgentResponse, Box<dyn Error + Send + Sync>>;

    async fn health_check(&self) -> bool {
        true
    }

    async fn initialize(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), Box<dyn Error + Send + Sync>> {
        Ok(())
    }
}

/// Strip orchestrator-reserved meta keys from a request object before
/// merging it into the call input.
pub fn strip_reserved_keys(mut input: serde_json::Map<String, serde_json::Value>) -> serde_json::Map<String, serde_json::Value> {
    for key in RESERVED_KEYS.iter() {
        input.remove(*key);
    }
    input
}

/// Runtime counters tracked per agent, owned by the registry rather than the
/// trait object itself (an `Arc<dyn Agent>` is shared and has no interior
/// mutability guarantee of its own).
#[derive(Default)]
pub struct AgentStats {
    call_count: AtomicU64,
    error_count: AtomicU64,
    total_execution_time_micros: AtomicU64,
    healthy: AtomicBool,
}

impl AgentStats {
    fn new() -> Self {
        Self {
            call_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            total_execution_time_micros: AtomicU64::new(0),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn record_call(&self, execution_time: f64, success: bool) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.error_count.fetch_add(1, Ordering::Relaxed);
        }
        self.total_execution_time_micros
            .fetch_add((execution_time * 1_000_000.0) as u64, Ordering::Relaxed);
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> AgentStatsSnapshot {
        let calls = self.call_count.load(Ordering::Relaxed);
        let errors = self.error_count.load(Ordering::Relaxed);
        let total_time = self.total_execution_time_micros.load(Ordering::Relaxed) as f64 / 1_000_000.0;
        AgentStatsSnapshot {
            call_count: calls,
            error_count: errors,
            total_execution_time: total_time,
            avg_execution_time: if calls > 0 { total_time / calls as f64 } else { 0.0 },
            success_rate: if calls > 0 { (calls - errors) as f64 / calls as f64 } else { 1.0 },
            error_rate: if calls > 0 { errors as f64 / calls as f64 } else { 0.0 },
            is_healthy: self.healthy.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStatsSnapshot {
    pub call_count: u64,
    pub error_count: u64,
    pub total_execution_time: f64,
    pub avg_execution_time: f64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub is_healthy: bool,
}

/// An agent plus its registry-owned runtime counters.
pub struct AgentHandle {
    pub agent: Arc<dyn Agent>,
    pub stats: AgentStats,
}

/// Concurrent name → agent map with a secondary capability index.
///
/// Additions/removals are exclusive; lookups and capability queries are
/// read-mostly (§5 shared-resource policy).
pub struct AgentRegistry {
    agents: std::sync::RwLock<HashMap<String, Arc<AgentHandle>>>,
    capability_index: std::sync::RwLock<HashMap<String, HashSet<String>>>,
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self {
            agents: std::sync::RwLock::new(HashMap::new()),
            capability_index: std::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Register an agent, optionally running its `initialize()` hook.
    /// Fails if the name is already bound.
    pub async fn register(
        &self,
        agent: Arc<dyn Agent>,
        initialize: bool,
    ) -> Result<(), Box<dyn Error + Send + Sync>> {
        let name = agent.name().to_string();
        {
            let agents = self.agents.read().unwrap();
            if agents.contains_key(&name) {
                return Err(format!("agent '{}' is already registered", name).into());
            }
        }
        if initialize {
            agent.initialize().await?;
        }
        let capabilities = agent.capabilities().to_vec();
        let handle = Arc::new(AgentHandle {
            agent,
            stats: AgentStats::new(),
        });
        self.agents.write().unwrap().insert(name.clone(), handle);
        let mut index = self.capability_index.write().unwrap();
        for cap in capabilities {
            index.entry(cap.to_lowercase()).or_default().insert(name.clone());
        }
        Ok(())
    }

    /// Unregister an agent, optionally running its `cleanup()` hook. Cleanup
    /// failures are logged and do not propagate (§4.1).
    pub async fn unregister(&self, name: &str, cleanup: bool) -> Result<(), Box<dyn Error + Send + Sync>> {
        let handle = {
            let mut agents = self.agents.write().unwrap();
            agents.remove(name)
        }
        .ok_or_else(|| format!("agent '{}' is not registered", name))?;

        let mut index = self.capability_index.write().unwrap();
        for set in index.values_mut() {
            set.remove(name);
        }
        drop(index);

        if cleanup {
            if let Err(e) = handle.agent.cleanup().await {
                tracing::warn!(agent = %name, error = %e, "agent cleanup failed, continuing");
            }
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<AgentHandle>> {
        self.agents.read().unwrap().get(name).cloned()
    }

    pub fn by_capability(&self, tag: &str) -> Vec<String> {
        self.capability_index
            .read()
            .unwrap()
            .get(&tag.to_lowercase())
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn names(&self) -> Vec<String> {
        self.agents.read().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.agents.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `health_check()` across all agents concurrently.
    pub async fn health_check_all(&self) -> HashMap<String, bool> {
        let handles: Vec<(String, Arc<AgentHandle>)> = self
            .agents
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let futures = handles.into_iter().map(|(name, handle)| async move {
            let healthy = handle.agent.health_check().await;
            handle.stats.set_healthy(healthy);
            (name, healthy)
        });

        futures_util::future::join_all(futures).await.into_iter().collect()
    }

    /// Cleanup every registered agent on shutdown; individual failures never
    /// block remaining teardowns.
    pub async fn cleanup_all(&self) {
        let handles: Vec<Arc<AgentHandle>> = self.agents.read().unwrap().values().cloned().collect();
        for handle in handles {
            if let Err(e) = handle.agent.cleanup().await {
                tracing::warn!(agent = %handle.agent.name(), error = %e, "agent cleanup failed during shutdown");
            }
        }
    }

    pub fn stats(&self) -> HashMap<String, AgentStatsSnapshot> {
        self.agents
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.stats.snapshot()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct MockAgent {
        name: String,
        capabilities: Vec<String>,
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Agent for MockAgent {
        fn name(&self) -> &str {
            &self.name
        }

        fn capabilities(&self) -> &[String] {
            &self.capabilities
        }

        async fn call(
            &self,
            _input: serde_json::Value,
            _timeout: Option<Duration>,
        ) -> Result<AgentResponse, Box<dyn Error + Send + Sync>> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            if self.fail {
                Ok(AgentResponse::failure(&self.name, "boom", 0.01))
            } else {
                Ok(AgentResponse::success(&self.name, serde_json::json!({"result": 42}), 0.01))
            }
        }
    }

    fn mock(name: &str, caps: &[&str], fail: bool) -> Arc<dyn Agent> {
        Arc::new(MockAgent {
            name: name.to_string(),
            capabilities: caps.iter().map(|s| s.to_string()).collect(),
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    #[tokio::test]
    async fn register_and_get() {
        let registry = AgentRegistry::new();
        registry.register(mock("calculator", &["math"], false), true).await.unwrap();
        assert!(registry.get("calculator").is_some());
        assert!(registry.get("missing").is_none());
    }

    #[tokio::test]
    async fn duplicate_registration_fails() {
        let registry = AgentRegistry::new();
        registry.register(mock("calculator", &["math"], false), true).await.unwrap();
        let err = registry.register(mock("calculator", &["math"], false), true).await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn unregister_unknown_fails() {
        let registry = AgentRegistry::new();
        assert!(registry.unregister("ghost", true).await.is_err());
    }

    #[tokio::test]
    async fn capability_lookup_is_case_insensitive() {
        let registry = AgentRegistry::new();
        registry.register(mock("calculator", &["Math"], false), true).await.unwrap();
        assert_eq!(registry.by_capability("math"), vec!["calculator".to_string()]);
        assert_eq!(registry.by_capability("MATH"), vec!["calculator".to_string()]);
    }

    #[tokio::test]
    async fn unregister_removes_from_capability_index() {
        let registry = AgentRegistry::new();
        registry.register(mock("calculator", &["math"], false), true).await.unwrap();
        registry.unregister("calculator", true).await.unwrap();
        assert!(registry.by_capability("math").is_empty());
    }

    #[tokio::test]
    async fn health_check_all_runs_concurrently() {
        let registry = AgentRegistry::new();
        registry.register(mock("a", &[], false), true).await.unwrap();
        registry.register(mock("b", &[], false), true).await.unwrap();
        let results = registry.health_check_all().await;
        assert_eq!(results.len(), 2);
        assert!(results.values().all(|&v| v));
    }

    #[test]
    fn strip_reserved_keys_removes_meta_fields() {
        let mut map = serde_json::Map::new();
        map.insert("tool".into(), serde_json::json!("calculator"));
        map.insert("request_id".into(), serde_json::json!("abc"));
        map.insert("city".into(), serde_json::json!("NY"));
        let stripped = strip_reserved_keys(map);
        assert_eq!(stripped.len(), 1);
        assert!(stripped.contains_key("city"));
    }

    #[test]
    fn scalar_result_is_wrapped() {
        let resp = AgentResponse::success("calculator", serde_json::json!(42), 0.01);
        assert_eq!(resp.data.get("result"), Some(&serde_json::json!(42)));
    }
}
