use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StrandError;

/// Unique execution identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct ExecutionId(pub String);

impl ExecutionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One finalized-once history record per step attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionStep {
    /// Unique per attempt.
    pub id: String,
    /// Logical step id.
    pub step_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub input: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

/// Point-in-time copy of the context state, for condition predicates and
/// callers inspecting a finished run.
#[derive(Debug, Clone, Serialize)]
pub struct ContextSnapshot {
    pub execution_id: ExecutionId,
    pub workflow_id: String,
    pub current_step: Option<String>,
    pub variables: HashMap<String, Value>,
    pub history: Vec<ExecutionStep>,
    pub metadata: HashMap<String, Value>,
}

struct ContextState {
    execution_id: ExecutionId,
    workflow_id: String,
    current_step: Option<String>,
    variables: HashMap<String, Value>,
    history: Vec<ExecutionStep>,
    metadata: HashMap<String, Value>,
}

/// Per-run shared state, threaded through a single `execute` call.
///
/// Cloning is cheap: all clones point at the same state. Writes are
/// serialized behind an async lock because parallel branches mutate
/// `variables` and `history` concurrently.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<RwLock<ContextState>>,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // State sits behind an async lock; avoid blocking in Debug.
        f.debug_struct("ExecutionContext").finish_non_exhaustive()
    }
}

impl ExecutionContext {
    /// Build the context for a new execution. `variables` starts as
    /// `{"input": input}`, plus a spread of input's top-level keys when it
    /// is an object.
    pub fn new(workflow_id: impl Into<String>, input: Value, metadata: HashMap<String, Value>) -> Self {
        let mut variables = HashMap::new();
        if let Value::Object(map) = &input {
            for (k, v) in map {
                variables.insert(k.clone(), v.clone());
            }
        }
        variables.insert("input".to_string(), input);

        Self {
            inner: Arc::new(RwLock::new(ContextState {
                execution_id: ExecutionId::new(),
                workflow_id: workflow_id.into(),
                current_step: None,
                variables,
                history: Vec::new(),
                metadata,
            })),
        }
    }

    pub async fn execution_id(&self) -> ExecutionId {
        self.inner.read().await.execution_id.clone()
    }

    pub async fn workflow_id(&self) -> String {
        self.inner.read().await.workflow_id.clone()
    }

    pub async fn variable(&self, key: &str) -> Option<Value> {
        self.inner.read().await.variables.get(key).cloned()
    }

    pub async fn set_variable(&self, key: impl Into<String>, value: Value) {
        self.inner.write().await.variables.insert(key.into(), value);
    }

    pub async fn variables(&self) -> HashMap<String, Value> {
        self.inner.read().await.variables.clone()
    }

    pub async fn metadata(&self, key: &str) -> Option<Value> {
        self.inner.read().await.metadata.get(key).cloned()
    }

    pub async fn set_metadata(&self, key: impl Into<String>, value: Value) {
        self.inner.write().await.metadata.insert(key.into(), value);
    }

    pub async fn history(&self) -> Vec<ExecutionStep> {
        self.inner.read().await.history.clone()
    }

    pub async fn history_len(&self) -> usize {
        self.inner.read().await.history.len()
    }

    /// The most recent `n` history records, oldest first.
    pub async fn recent_history(&self, n: usize) -> Vec<ExecutionStep> {
        let state = self.inner.read().await;
        let skip = state.history.len().saturating_sub(n);
        state.history[skip..].to_vec()
    }

    /// Append a started history record and return its attempt id.
    pub async fn begin_step(
        &self,
        step_id: &str,
        agent_id: Option<&str>,
        input: &Value,
    ) -> String {
        let attempt_id = Uuid::new_v4().to_string();
        let mut state = self.inner.write().await;
        state.current_step = Some(step_id.to_string());
        state.history.push(ExecutionStep {
            id: attempt_id.clone(),
            step_id: step_id.to_string(),
            agent_id: agent_id.map(str::to_string),
            input: input.clone(),
            output: None,
            error: None,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
        });
        attempt_id
    }

    /// Finalize a history record with its outcome. Records are finalized at
    /// most once; a second call for the same attempt id is a no-op.
    pub async fn finish_step(
        &self,
        attempt_id: &str,
        outcome: std::result::Result<&Value, &StrandError>,
    ) {
        let mut state = self.inner.write().await;
        if let Some(record) = state
            .history
            .iter_mut()
            .find(|r| r.id == attempt_id && r.finished_at.is_none())
        {
            let now = Utc::now();
            record.duration_ms = Some(
                (now - record.started_at).num_milliseconds().max(0) as u64,
            );
            record.finished_at = Some(now);
            match outcome {
                Ok(output) => record.output = Some(output.clone()),
                Err(e) => record.error = Some(e.to_string()),
            }
        }
    }

    pub async fn snapshot(&self) -> ContextSnapshot {
        let state = self.inner.read().await;
        ContextSnapshot {
            execution_id: state.execution_id.clone(),
            workflow_id: state.workflow_id.clone(),
            current_step: state.current_step.clone(),
            variables: state.variables.clone(),
            history: state.history.clone(),
            metadata: state.metadata.clone(),
        }
    }
}
