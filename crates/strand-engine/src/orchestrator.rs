use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use strand_core::config::EngineConfig;
use strand_core::context::{ExecutionContext, ExecutionId};
use strand_core::error::{Result, StrandError};
use strand_core::event::{EventBus, ExecutionEvent};
use strand_core::plugin::{HookContext, HookPoint, Plugin};

use crate::agent::Agent;
use crate::hooks::HookPipeline;
use crate::registry::{AgentRegistry, ExecEnv};
use crate::workflow::Workflow;

/// A failed execution. Carries the execution context so partial progress
/// (history records, variables written before the failure) stays
/// inspectable.
pub struct ExecutionFailure {
    pub error: StrandError,
    pub context: ExecutionContext,
}

impl ExecutionFailure {
    fn new(error: StrandError, context: ExecutionContext) -> Self {
        Self { error, context }
    }
}

impl std::fmt::Debug for ExecutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionFailure")
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl std::fmt::Display for ExecutionFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.error.fmt(f)
    }
}

impl std::error::Error for ExecutionFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<ExecutionFailure> for StrandError {
    fn from(failure: ExecutionFailure) -> Self {
        failure.error
    }
}

/// Per-call execution options.
#[derive(Default)]
pub struct ExecuteOptions {
    /// Overrides the engine-wide execution timeout.
    pub timeout_ms: Option<u64>,
    /// Seeded into the context's metadata. Plugins key off this (the rate
    /// limiter reads `caller` here, for example).
    pub metadata: HashMap<String, Value>,
}

impl ExecuteOptions {
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Top-level coordinator: owns the agent and workflow registries, the hook
/// pipeline, and the in-flight execution table; enforces admission control,
/// timeouts, and cancellation around workflow runs.
pub struct Orchestrator {
    config: EngineConfig,
    agents: RwLock<AgentRegistry>,
    workflows: RwLock<HashMap<String, Arc<Workflow>>>,
    hooks: Arc<HookPipeline>,
    // Sync mutex so the entry can be removed from a Drop impl.
    in_flight: Mutex<HashMap<ExecutionId, CancellationToken>>,
    events: Arc<EventBus>,
}

/// Releases one admission slot on drop. Covers the normal return paths and
/// a caller abandoning the `execute` future mid-flight; the token is
/// cancelled so any spawned work winds down.
struct InFlightGuard<'a> {
    table: &'a Mutex<HashMap<ExecutionId, CancellationToken>>,
    execution_id: ExecutionId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.table.lock().unwrap().remove(&self.execution_id) {
            token.cancel();
        }
    }
}

impl Orchestrator {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            agents: RwLock::new(AgentRegistry::new()),
            workflows: RwLock::new(HashMap::new()),
            hooks: Arc::new(HookPipeline::new()),
            in_flight: Mutex::new(HashMap::new()),
            events: Arc::new(EventBus::default()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    pub async fn register_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        self.hooks.register(plugin).await
    }

    pub async fn unregister_plugin(&self, name: &str) -> Result<bool> {
        self.hooks.unregister(name).await
    }

    pub async fn plugin_names(&self) -> Vec<String> {
        self.hooks.plugin_names().await
    }

    /// Register an agent, replacing any previous agent with the same id.
    pub async fn register_agent(&self, agent: Agent) -> Result<Arc<Agent>> {
        let agent = Arc::new(agent);
        let hook_ctx = HookContext::default().with_agent(agent.id());
        self.hooks
            .dispatch(
                HookPoint::BeforeAgentRegister,
                json!({ "agent_id": agent.id() }),
                &hook_ctx,
            )
            .await?;

        self.agents.write().await.insert(agent.clone());
        info!(agent_id = %agent.id(), "Registered agent");

        self.hooks
            .dispatch(
                HookPoint::AfterAgentRegister,
                json!({ "agent_id": agent.id() }),
                &hook_ctx,
            )
            .await?;
        Ok(agent)
    }

    pub async fn remove_agent(&self, id: &str) -> Option<Arc<Agent>> {
        self.agents.write().await.remove(id)
    }

    pub async fn agent(&self, id: &str) -> Option<Arc<Agent>> {
        self.agents.read().await.get(id)
    }

    pub async fn agent_ids(&self) -> Vec<String> {
        self.agents.read().await.ids()
    }

    /// Register a workflow, replacing any previous workflow with the same id.
    pub async fn register_workflow(&self, workflow: Workflow) -> Result<()> {
        let workflow = Arc::new(workflow);
        let hook_ctx = HookContext {
            workflow_id: Some(workflow.id().to_string()),
            ..Default::default()
        };
        self.hooks
            .dispatch(
                HookPoint::BeforeWorkflowRegister,
                json!({ "workflow_id": workflow.id() }),
                &hook_ctx,
            )
            .await?;

        self.workflows
            .write()
            .await
            .insert(workflow.id().to_string(), workflow.clone());
        info!(workflow_id = %workflow.id(), "Registered workflow");

        self.hooks
            .dispatch(
                HookPoint::AfterWorkflowRegister,
                json!({ "workflow_id": workflow.id() }),
                &hook_ctx,
            )
            .await?;
        Ok(())
    }

    pub async fn remove_workflow(&self, id: &str) -> Option<Arc<Workflow>> {
        self.workflows.write().await.remove(id)
    }

    pub async fn workflow_ids(&self) -> Vec<String> {
        self.workflows.read().await.keys().cloned().collect()
    }

    pub async fn active_executions(&self) -> usize {
        self.in_flight.lock().unwrap().len()
    }

    /// Cancel a running execution. Returns false if the id is unknown or
    /// the execution already finished.
    pub async fn cancel(&self, execution_id: &ExecutionId) -> bool {
        match self.in_flight.lock().unwrap().get(execution_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Run a workflow to completion. The returned context carries the full
    /// step history and variables; the workflow's final output sits in the
    /// last step's variable. A failure still carries the context, with
    /// whatever history accumulated before the error.
    pub async fn execute(
        &self,
        workflow_id: &str,
        input: Value,
        options: ExecuteOptions,
    ) -> std::result::Result<ExecutionContext, ExecutionFailure> {
        let ctx = ExecutionContext::new(workflow_id, input.clone(), options.metadata);

        let workflow = match self.workflows.read().await.get(workflow_id).cloned() {
            Some(workflow) => workflow,
            None => {
                return Err(ExecutionFailure::new(
                    StrandError::WorkflowNotFound(workflow_id.to_string()),
                    ctx,
                ))
            }
        };

        let execution_id = ctx.execution_id().await;
        let cancel = CancellationToken::new();

        // Admission control: check and insert under one lock so two racing
        // calls cannot both slip under the cap.
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            let active = in_flight.len();
            if active >= self.config.max_concurrent_executions {
                return Err(ExecutionFailure::new(
                    StrandError::Capacity {
                        active,
                        max: self.config.max_concurrent_executions,
                    },
                    ctx,
                ));
            }
            in_flight.insert(execution_id.clone(), cancel.clone());
        }
        let _guard = InFlightGuard {
            table: &self.in_flight,
            execution_id: execution_id.clone(),
        };

        self.events.publish(ExecutionEvent::Started {
            execution_id: execution_id.clone(),
            workflow_id: workflow_id.to_string(),
        });
        info!(execution_id = %execution_id, workflow_id = %workflow_id, "Execution started");

        let env = ExecEnv::new(
            self.agents.read().await.snapshot(),
            self.hooks.clone(),
            cancel.clone(),
        );
        let timeout_ms = options.timeout_ms.unwrap_or(self.config.execution_timeout_ms);

        let result = tokio::select! {
            result = self.run_hooked(&workflow, &ctx, &env, input) => result,
            _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => {
                cancel.cancel();
                Err(StrandError::ExecutionTimeout { timeout_ms })
            }
            _ = cancel.cancelled() => Err(StrandError::Cancelled),
        };

        match result {
            Ok(_) => {
                info!(execution_id = %execution_id, workflow_id = %workflow_id, "Execution completed");
                self.events.publish(ExecutionEvent::Completed {
                    execution_id,
                    workflow_id: workflow_id.to_string(),
                });
                Ok(ctx)
            }
            Err(e) => {
                warn!(execution_id = %execution_id, workflow_id = %workflow_id, error = %e, "Execution failed");
                self.events.publish(ExecutionEvent::Failed {
                    execution_id,
                    workflow_id: workflow_id.to_string(),
                    error: e.to_string(),
                });
                Err(ExecutionFailure::new(e, ctx))
            }
        }
    }

    async fn run_hooked(
        &self,
        workflow: &Workflow,
        ctx: &ExecutionContext,
        env: &ExecEnv,
        input: Value,
    ) -> Result<Value> {
        let hook_ctx = HookContext::for_execution(ctx.clone(), workflow.id());

        let before = self
            .hooks
            .dispatch(
                HookPoint::BeforeWorkflowExecute,
                json!({ "workflow_id": workflow.id(), "input": &input }),
                &hook_ctx,
            )
            .await?;
        // A hook may rewrite the workflow input; the workflow reads it back
        // out of the context.
        if let Some(rewritten) = before.get("input") {
            if *rewritten != input {
                ctx.set_variable("input", rewritten.clone()).await;
            }
        }

        match workflow.execute(ctx, env).await {
            Ok(output) => {
                self.hooks
                    .dispatch(
                        HookPoint::AfterWorkflowExecute,
                        json!({ "workflow_id": workflow.id(), "output": &output }),
                        &hook_ctx,
                    )
                    .await?;
                Ok(output)
            }
            Err(e) => {
                let payload = json!({ "workflow_id": workflow.id(), "error": e.to_string() });
                self.hooks
                    .dispatch(HookPoint::OnError, payload.clone(), &hook_ctx)
                    .await?;
                self.hooks
                    .dispatch(HookPoint::OnWorkflowError, payload, &hook_ctx)
                    .await?;
                Err(e)
            }
        }
    }

    /// Dispatch an application-defined event through the hook pipeline.
    pub async fn emit(&self, event: &str, payload: Value) -> Result<Value> {
        let hook_ctx = HookContext {
            event: Some(event.to_string()),
            ..Default::default()
        };
        self.hooks
            .dispatch(HookPoint::OnCustomEvent, payload, &hook_ctx)
            .await
    }

    /// Graceful shutdown: wait up to the configured grace period for
    /// in-flight executions to drain, cancel whatever remains, then run
    /// plugin cleanup.
    pub async fn shutdown(&self) {
        info!("Orchestrator shutting down");
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.shutdown_grace_ms);

        while tokio::time::Instant::now() < deadline {
            if self.in_flight.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        {
            let mut in_flight = self.in_flight.lock().unwrap();
            for (execution_id, token) in in_flight.iter() {
                warn!(execution_id = %execution_id, "Cancelling execution at shutdown");
                token.cancel();
            }
            in_flight.clear();
        }

        self.hooks.cleanup_all().await;
        self.events.publish(ExecutionEvent::Shutdown);
    }
}

impl Default for Orchestrator {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}
