use thiserror::Error;

#[derive(Debug, Error)]
pub enum StrandError {
    // Model errors
    #[error("Model request failed: {0}")]
    ModelRequest(String),

    #[error("Model streaming error: {0}")]
    ModelStream(String),

    #[error("Model quota exhausted: {0}")]
    QuotaExhausted(String),

    // Registry errors
    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    // Tool errors
    #[error("Tool execution failed: {tool}: {message}")]
    ToolExecution { tool: String, message: String },

    // Step/workflow errors
    #[error("Invalid step '{step_id}': {message}")]
    InvalidStep { step_id: String, message: String },

    #[error("{failed} of {total} parallel steps failed: [{}]", .failed_ids.join(", "))]
    Aggregate {
        failed: usize,
        total: usize,
        failed_ids: Vec<String>,
    },

    // Orchestrator errors
    #[error("Max concurrent executions reached ({active}/{max})")]
    Capacity { active: usize, max: usize },

    #[error("Execution timeout after {timeout_ms}ms")]
    ExecutionTimeout { timeout_ms: u64 },

    #[error("Agent '{agent_id}' timed out after {timeout_ms}ms")]
    AgentTimeout { agent_id: String, timeout_ms: u64 },

    #[error("Execution cancelled")]
    Cancelled,

    // Plugin errors
    #[error("Plugin error: {plugin}: {message}")]
    Plugin { plugin: String, message: String },

    #[error("Rate limit exceeded for {key}: {message}")]
    RateLimited { key: String, message: String },

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StrandError {
    /// Build an aggregate error from the ids of failed parallel branches.
    pub fn aggregate(failed_ids: Vec<String>, total: usize) -> Self {
        Self::Aggregate {
            failed: failed_ids.len(),
            total,
            failed_ids,
        }
    }
}

pub type Result<T> = std::result::Result<T, StrandError>;
