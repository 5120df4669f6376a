use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StrandError};

/// Retry budget for an agent's model calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

fn default_max_attempts() -> u32 { 3 }
fn default_backoff_ms() -> u64 { 1000 }
fn default_backoff_multiplier() -> f64 { 2.0 }
fn default_max_backoff_ms() -> u64 { 30000 }

/// Declarative tool description. The handler capability is bound separately
/// at registration time; only the metadata round-trips through config files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the tool's parameters.
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// Agent definition, loadable from a JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub tools: Vec<ToolConfig>,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_agent_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_temperature() -> f32 { 0.0 }
fn default_max_tokens() -> u32 { 4096 }
fn default_agent_timeout_ms() -> u64 { 60000 }

impl AgentConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            system_prompt: None,
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            tools: vec![],
            retry: RetryConfig::default(),
            timeout_ms: default_agent_timeout_ms(),
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Parse an agent definition from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// The kind of work a step performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    Agent,
    Tool,
    Condition,
    Loop,
    Parallel,
}

/// One step in a workflow. Nested `steps` hold loop bodies, parallel
/// branches, and condition targets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepConfig {
    pub id: String,
    pub kind: StepKind,
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub tool_name: Option<String>,
    #[serde(default)]
    pub iterations: Option<u32>,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
    /// For `condition` steps: the nested step to run when the predicate
    /// holds. For top-level steps, consulted by the containing workflow.
    #[serde(default)]
    pub on_success: Option<String>,
    /// For `condition` steps: the nested step for a false predicate. For
    /// top-level steps: the recovery step the workflow runs on failure.
    #[serde(default)]
    pub on_failure: Option<String>,
    /// Declared for config parity; step execution does not consume it.
    /// Retry lives at the agent layer.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl StepConfig {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            kind,
            agent_id: None,
            tool_name: None,
            iterations: None,
            steps: vec![],
            on_success: None,
            on_failure: None,
            retry: None,
        }
    }

    pub fn agent(id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        let mut cfg = Self::new(id, StepKind::Agent);
        cfg.agent_id = Some(agent_id.into());
        cfg
    }

    pub fn tool(id: impl Into<String>, tool_name: impl Into<String>) -> Self {
        let mut cfg = Self::new(id, StepKind::Tool);
        cfg.tool_name = Some(tool_name.into());
        cfg
    }

    pub fn with_on_failure(mut self, step_id: impl Into<String>) -> Self {
        self.on_failure = Some(step_id.into());
        self
    }

    pub fn with_on_success(mut self, step_id: impl Into<String>) -> Self {
        self.on_success = Some(step_id.into());
        self
    }

    pub fn with_iterations(mut self, iterations: u32) -> Self {
        self.iterations = Some(iterations);
        self
    }

    pub fn with_steps(mut self, steps: Vec<StepConfig>) -> Self {
        self.steps = steps;
        self
    }
}

/// Workflow definition, loadable from a JSON document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub steps: Vec<StepConfig>,
    /// Fan-out composition for the top-level steps instead of sequential.
    #[serde(default)]
    pub parallel: bool,
    /// Declared for config parity; workflow execution does not consume it.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl WorkflowConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            steps: vec![],
            parallel: false,
            retry: None,
        }
    }

    pub fn with_steps(mut self, steps: Vec<StepConfig>) -> Self {
        self.steps = steps;
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    /// Parse a workflow definition from a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Top-level engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_executions: usize,
    #[serde(default = "default_execution_timeout_ms")]
    pub execution_timeout_ms: u64,
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_executions: default_max_concurrent(),
            execution_timeout_ms: default_execution_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

fn default_max_concurrent() -> usize { 10 }
fn default_execution_timeout_ms() -> u64 { 300000 }
fn default_shutdown_grace_ms() -> u64 { 30000 }

impl EngineConfig {
    /// Load engine settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(StrandError::ConfigNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| StrandError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.max_concurrent_executions, 10);
        assert_eq!(config.execution_timeout_ms, 300000);
        assert_eq!(config.shutdown_grace_ms, 30000);
    }

    #[test]
    fn test_engine_config_load_from_toml() {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        tmp.write_all(b"max_concurrent_executions = 4\nexecution_timeout_ms = 5000\n")
            .expect("write toml");

        let config = EngineConfig::load(tmp.path()).expect("load config");
        assert_eq!(config.max_concurrent_executions, 4);
        assert_eq!(config.execution_timeout_ms, 5000);
        // Unset fields fall back to defaults
        assert_eq!(config.shutdown_grace_ms, 30000);
    }

    #[test]
    fn test_engine_config_missing_file() {
        let result = EngineConfig::load(Path::new("/nonexistent/strand.toml"));
        assert!(matches!(result, Err(StrandError::ConfigNotFound(_))));
    }

    #[test]
    fn test_agent_config_from_json() {
        let json = r#"{
            "id": "assistant",
            "name": "Assistant",
            "system_prompt": "You are helpful.",
            "temperature": 0.5,
            "tools": [
                {"name": "search", "description": "Web search", "parameters": {"type": "object"}}
            ],
            "retry": {"max_attempts": 5}
        }"#;

        let config = AgentConfig::from_json(json).expect("parse agent config");
        assert_eq!(config.id, "assistant");
        assert_eq!(config.tools.len(), 1);
        assert_eq!(config.tools[0].name, "search");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.backoff_ms, 1000);
        assert_eq!(config.max_tokens, 4096);
    }

    #[test]
    fn test_workflow_config_from_json() {
        let json = r#"{
            "id": "pipeline",
            "name": "Pipeline",
            "parallel": false,
            "steps": [
                {"id": "draft", "kind": "agent", "agent_id": "writer", "on_failure": "recover"},
                {"id": "recover", "kind": "tool", "tool_name": "log_error"},
                {"id": "fanout", "kind": "parallel", "steps": [
                    {"id": "a", "kind": "agent", "agent_id": "writer"},
                    {"id": "b", "kind": "agent", "agent_id": "writer"}
                ]}
            ]
        }"#;

        let config = WorkflowConfig::from_json(json).expect("parse workflow config");
        assert_eq!(config.steps.len(), 3);
        assert_eq!(config.steps[0].kind, StepKind::Agent);
        assert_eq!(config.steps[0].on_failure.as_deref(), Some("recover"));
        assert_eq!(config.steps[2].steps.len(), 2);
    }
}
