//! Configuration models and loader.
//!
//! Three logical documents (orchestrator, agents, rules), expressed as TOML and
//! deserialized with `serde`, mirroring `OrchestratorConfig`/`AgentsFileConfig`/
//! `RulesFileConfig` from the source implementation. `${VAR}` / `${VAR:default}`
//! substitution runs over every string value after parsing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use super::error::OrchestratorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningMode {
    Ai,
    Rule,
    Hybrid,
}

impl Default for ReasoningMode {
    fn default() -> Self {
        ReasoningMode::Hybrid
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    Mcp,
    Direct,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleOperator {
    And,
    Or,
    Not,
}

impl Default for RuleOperator {
    fn default() -> Self {
        RuleOperator::And
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpConnectionConfig {
    pub url: String,
    #[serde(default = "default_connection_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

fn default_connection_timeout() -> u64 {
    30
}

impl McpConnectionConfig {
    fn validate(&self) -> Result<(), OrchestratorError> {
        if self.url == "stdio" {
            return Ok(());
        }
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(OrchestratorError::Configuration(format!(
                "url must start with http://, https://, or be 'stdio': {}",
                self.url
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectToolConfig {
    pub module: String,
    pub function: String,
    #[serde(default)]
    pub is_async: bool,
}

impl DirectToolConfig {
    fn validate(&self) -> Result<(), OrchestratorError> {
        if self.module.contains("..") || self.module.contains('/') || self.module.contains('\\') {
            return Err(OrchestratorError::Configuration(format!(
                "module path contains invalid characters: {}",
                self.module
            )));
        }
        Ok(())
    }
}

fn default_allow_all() -> Vec<String> {
    vec!["*".to_string()]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRole {
    pub name: String,
    pub description: String,
    #[serde(default = "default_allow_all")]
    pub allowed_operations: Vec<String>,
    #[serde(default)]
    pub denied_operations: Vec<String>,
    pub max_execution_time: Option<u64>,
    pub max_input_size: Option<usize>,
    #[serde(default)]
    pub require_approval: bool,
    #[serde(default)]
    pub guardrails: HashMap<String, toml::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentConstraints {
    pub max_retries: Option<u32>,
    pub timeout: Option<u64>,
    pub rate_limit: Option<u32>,
    #[serde(default)]
    pub require_validation: bool,
    #[serde(default = "default_allow_all")]
    pub allowed_input_fields: Vec<String>,
    #[serde(default)]
    pub denied_input_fields: Vec<String>,
    #[serde(default = "default_true")]
    pub output_sanitization: bool,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "INFO".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub agent_type: AgentType,
    pub connection: Option<McpConnectionConfig>,
    pub direct_tool: Option<DirectToolConfig>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub role: Option<AgentRole>,
    pub constraints: Option<AgentConstraints>,
    pub fallback: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub metadata: HashMap<String, toml::Value>,
}

impl AgentConfig {
    fn validate(&self) -> Result<(), OrchestratorError> {
        match self.agent_type {
            AgentType::Mcp => {
                let conn = self.connection.as_ref().ok_or_else(|| {
                    OrchestratorError::Configuration(format!(
                        "agent '{}' of type 'mcp' requires connection config",
                        self.name
                    ))
                })?;
                conn.validate()?;
            }
            AgentType::Direct => {
                let tool = self.direct_tool.as_ref().ok_or_else(|| {
                    OrchestratorError::Configuration(format!(
                        "agent '{}' of type 'direct' requires direct_tool config",
                        self.name
                    ))
                })?;
                tool.validate()?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleCondition {
    pub field: String,
    pub operator: String,
    pub value: Option<String>,
    #[serde(default)]
    pub case_sensitive: bool,
}

fn default_confidence() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    pub conditions: Vec<RuleCondition>,
    #[serde(default)]
    pub logic: RuleOperator,
    pub target_agents: Vec<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ValidationConfig {
    pub schema_name: Option<String>,
    #[serde(default)]
    pub required_fields: Vec<String>,
    #[serde(default)]
    pub strict: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_true")]
    pub exponential_backoff: bool,
    #[serde(default = "default_base_delay")]
    pub base_delay: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
    #[serde(default = "default_true")]
    pub retry_on_timeout: bool,
    #[serde(default = "default_true")]
    pub retry_on_connection_error: bool,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> f64 {
    1.0
}
fn default_max_delay() -> f64 {
    30.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            exponential_backoff: true,
            base_delay: default_base_delay(),
            max_delay: default_max_delay(),
            retry_on_timeout: true,
            retry_on_connection_error: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BedrockConfig {
    #[serde(default = "default_bedrock_region")]
    pub region: String,
    #[serde(default = "default_bedrock_model")]
    pub model_id: String,
    pub role_arn: Option<String>,
    #[serde(default = "default_session_name")]
    pub session_name: String,
    pub aws_profile: Option<String>,
}

fn default_bedrock_region() -> String {
    "us-east-1".to_string()
}
fn default_bedrock_model() -> String {
    "anthropic.claude-sonnet-3-5-v2-20241022".to_string()
}
fn default_session_name() -> String {
    "agent-orchestrator".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_url")]
    pub url: String,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub api_key: Option<String>,
}

fn default_gateway_url() -> String {
    "http://localhost:8000".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_orchestrator_name")]
    pub name: String,
    #[serde(default)]
    pub reasoning_mode: ReasoningMode,
    #[serde(default = "default_ai_provider")]
    pub ai_provider: String,
    #[serde(default = "default_ai_model")]
    pub ai_model: String,
    pub bedrock: Option<BedrockConfig>,
    pub gateway: Option<GatewayConfig>,
    #[serde(default = "default_max_parallel_agents")]
    pub max_parallel_agents: usize,
    #[serde(default = "default_timeout_secs")]
    pub default_timeout: u64,
    #[serde(default)]
    pub retry_config: RetryConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default = "default_agents_path")]
    pub agents_config_path: String,
    #[serde(default = "default_rules_path")]
    pub rules_config_path: String,
    #[serde(default = "default_schemas_path")]
    pub schemas_path: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_true")]
    pub enable_metrics: bool,
    #[serde(default = "default_true")]
    pub enable_audit_log: bool,
    #[serde(default = "default_validation_confidence_threshold")]
    pub validation_confidence_threshold: f64,
    #[serde(default = "default_validation_max_retries")]
    pub validation_max_retries: u32,
    #[serde(default = "default_query_log_dir")]
    pub query_log_dir: String,
    #[serde(default = "default_true")]
    pub log_queries_to_file: bool,
    #[serde(default)]
    pub log_queries_to_console: bool,
    /// Controller-level toggle deciding whether a successful action is recorded
    /// to policy history automatically (open question 3, resolved in DESIGN.md).
    #[serde(default)]
    pub auto_record_policy_actions: bool,
    /// Rule-confidence threshold at which the hybrid reasoner accepts a rule
    /// match without consulting the AI reasoner.
    #[serde(default = "default_rule_confidence_threshold")]
    pub rule_confidence_threshold: f64,
}

fn default_orchestrator_name() -> String {
    "agent-orchestrator".to_string()
}
fn default_ai_provider() -> String {
    "anthropic".to_string()
}
fn default_ai_model() -> String {
    "claude-sonnet-4-5-20250929".to_string()
}
fn default_max_parallel_agents() -> usize {
    3
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_agents_path() -> String {
    "config/agents.toml".to_string()
}
fn default_rules_path() -> String {
    "config/rules.toml".to_string()
}
fn default_schemas_path() -> String {
    "config/schemas/".to_string()
}
fn default_validation_confidence_threshold() -> f64 {
    0.7
}
fn default_validation_max_retries() -> u32 {
    2
}
fn default_query_log_dir() -> String {
    "logs/queries".to_string()
}
fn default_rule_confidence_threshold() -> f64 {
    0.7
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            name: default_orchestrator_name(),
            reasoning_mode: ReasoningMode::default(),
            ai_provider: default_ai_provider(),
            ai_model: default_ai_model(),
            bedrock: None,
            gateway: None,
            max_parallel_agents: default_max_parallel_agents(),
            default_timeout: default_timeout_secs(),
            retry_config: RetryConfig::default(),
            validation: ValidationConfig::default(),
            agents_config_path: default_agents_path(),
            rules_config_path: default_rules_path(),
            schemas_path: default_schemas_path(),
            log_level: default_log_level(),
            enable_metrics: true,
            enable_audit_log: true,
            validation_confidence_threshold: default_validation_confidence_threshold(),
            validation_max_retries: default_validation_max_retries(),
            query_log_dir: default_query_log_dir(),
            log_queries_to_file: true,
            log_queries_to_console: false,
            auto_record_policy_actions: false,
            rule_confidence_threshold: default_rule_confidence_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsFileConfig {
    pub agents: Vec<AgentConfig>,
}

impl AgentsFileConfig {
    pub fn get_agent(&self, name: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn get_agents_by_capability(&self, capability: &str) -> Vec<&AgentConfig> {
        self.agents
            .iter()
            .filter(|a| a.capabilities.iter().any(|c| c == capability))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RulesFileConfig {
    pub rules: Vec<RuleConfig>,
}

impl RulesFileConfig {
    /// Enabled rules sorted by priority, highest first; ties keep input order
    /// (Rust's sort is stable, mirroring the Python `sorted(..., reverse=True)`).
    pub fn get_sorted_rules(&self) -> Vec<&RuleConfig> {
        let mut enabled: Vec<&RuleConfig> = self.rules.iter().filter(|r| r.enabled).collect();
        enabled.sort_by(|a, b| b.priority.cmp(&a.priority));
        enabled
    }
}

/// Substitute `${VAR}` / `${VAR:default}` occurrences in every string found in
/// a parsed TOML document, recursing through tables and arrays.
pub fn substitute_env_vars(value: toml::Value) -> toml::Value {
    match value {
        toml::Value::String(s) => toml::Value::String(substitute_in_string(&s)),
        toml::Value::Array(items) => {
            toml::Value::Array(items.into_iter().map(substitute_env_vars).collect())
        }
        toml::Value::Table(table) => {
            let mut out = toml::map::Map::new();
            for (k, v) in table {
                out.insert(k, substitute_env_vars(v));
            }
            toml::Value::Table(out)
        }
        other => other,
    }
}

fn substitute_in_string(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some(close) = input[i + 2..].find('}') {
                let inner = &input[i + 2..i + 2 + close];
                let (name, default) = match inner.find(':') {
                    Some(idx) => (&inner[..idx], Some(&inner[idx + 1..])),
                    None => (inner, None),
                };
                let resolved = std::env::var(name)
                    .unwrap_or_else(|_| default.unwrap_or("").to_string());
                output.push_str(&resolved);
                i = i + 2 + close + 1;
                continue;
            }
        }
        output.push(bytes[i] as char);
        i += 1;
    }
    output
}

pub fn load_toml_file(path: &Path) -> Result<toml::Value, OrchestratorError> {
    if !path.exists() {
        return Err(OrchestratorError::Configuration(format!(
            "configuration file not found: {}",
            path.display()
        )));
    }
    let raw = std::fs::read_to_string(path).map_err(|e| {
        OrchestratorError::Configuration(format!("failed to read file {}: {}", path.display(), e))
    })?;
    let parsed: toml::Value = toml::from_str(&raw)
        .map_err(|e| OrchestratorError::Configuration(format!("failed to parse TOML file {}: {}", path.display(), e)))?;
    Ok(substitute_env_vars(parsed))
}

pub fn load_orchestrator_config(path: &Path) -> Result<OrchestratorConfig, OrchestratorError> {
    let value = load_toml_file(path)?;
    let config: OrchestratorConfig = value
        .try_into()
        .map_err(|e: toml::de::Error| OrchestratorError::Configuration(e.to_string()))?;
    Ok(config)
}

pub fn load_agents_config(path: &Path) -> Result<AgentsFileConfig, OrchestratorError> {
    let value = load_toml_file(path)?;
    let config: AgentsFileConfig = value
        .try_into()
        .map_err(|e: toml::de::Error| OrchestratorError::Configuration(e.to_string()))?;
    for agent in &config.agents {
        agent.validate()?;
    }
    Ok(config)
}

pub fn load_rules_config(path: &Path) -> Result<RulesFileConfig, OrchestratorError> {
    let value = load_toml_file(path)?;
    let config: RulesFileConfig = value
        .try_into()
        .map_err(|e: toml::de::Error| OrchestratorError::Configuration(e.to_string()))?;
    Ok(config)
}

/// Load the three configuration documents, deriving the agents/rules paths
/// relative to the orchestrator config's parent directory.
pub fn load_all_configs(
    orchestrator_path: &Path,
) -> Result<(OrchestratorConfig, AgentsFileConfig, RulesFileConfig), OrchestratorError> {
    let orch_config = load_orchestrator_config(orchestrator_path)?;
    let base = orchestrator_path.parent().unwrap_or_else(|| Path::new("."));
    let agents_path = base.join(&orch_config.agents_config_path);
    let rules_path = base.join(&orch_config.rules_config_path);
    let agents_config = load_agents_config(&agents_path)?;
    let rules_config = load_rules_config(&rules_path)?;
    Ok((orch_config, agents_config, rules_config))
}
