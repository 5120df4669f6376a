use serde_json::{json, Value};
use tracing::{info, warn};

use strand_core::config::WorkflowConfig;
use strand_core::context::ExecutionContext;
use strand_core::error::{Result, StrandError};
use strand_core::plugin::{HookContext, HookPoint};

use crate::registry::ExecEnv;
use crate::step::Step;

/// An ordered collection of steps plus a composition mode. Sequential
/// workflows thread each step's output into the next step's input;
/// parallel workflows fan the initial input out to every step.
pub struct Workflow {
    config: WorkflowConfig,
    steps: Vec<Step>,
}

impl Workflow {
    pub fn new(config: WorkflowConfig) -> Self {
        let steps = config.steps.iter().cloned().map(Step::from_config).collect();
        Self { config, steps }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Append a step built outside the config path, typically a condition
    /// step carrying a predicate closure.
    pub fn add_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn remove_step(&mut self, id: &str) -> bool {
        let before = self.steps.len();
        self.steps.retain(|s| s.id() != id);
        before != self.steps.len()
    }

    pub fn get_step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id() == id)
    }

    pub fn list_steps(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.id().to_string()).collect()
    }

    pub async fn execute(&self, ctx: &ExecutionContext, env: &ExecEnv) -> Result<Value> {
        info!(
            workflow_id = %self.config.id,
            steps = self.steps.len(),
            parallel = self.config.parallel,
            "Executing workflow"
        );
        if self.config.parallel {
            self.execute_parallel(ctx, env).await
        } else {
            self.execute_sequential(ctx, env).await
        }
    }

    async fn execute_sequential(&self, ctx: &ExecutionContext, env: &ExecEnv) -> Result<Value> {
        let mut current = ctx.variable("input").await.unwrap_or(Value::Null);

        let mut idx = 0;
        while idx < self.steps.len() {
            let step = &self.steps[idx];
            let hook_ctx = HookContext::for_execution(ctx.clone(), &self.config.id)
                .with_step(step.id());

            let before = env
                .hooks
                .dispatch(
                    HookPoint::BeforeStep,
                    json!({ "step_id": step.id(), "input": &current }),
                    &hook_ctx,
                )
                .await?;
            // Hooks may rewrite the step input.
            if let Some(rewritten) = before.get("input") {
                current = rewritten.clone();
            }

            match step.execute(current.clone(), ctx, env).await {
                Ok(output) => {
                    ctx.set_variable(step.id(), output.clone()).await;
                    env.hooks
                        .dispatch(
                            HookPoint::AfterStep,
                            json!({ "step_id": step.id(), "output": &output }),
                            &hook_ctx,
                        )
                        .await?;
                    current = output;
                    idx += 1;
                }
                Err(e) => {
                    env.hooks
                        .dispatch(
                            HookPoint::OnError,
                            json!({ "step_id": step.id(), "error": e.to_string() }),
                            &hook_ctx,
                        )
                        .await?;

                    let recovery = step
                        .config()
                        .on_failure
                        .as_deref()
                        .and_then(|id| self.get_step(id));
                    let Some(recovery) = recovery else {
                        return Err(e);
                    };

                    warn!(
                        workflow_id = %self.config.id,
                        step_id = %step.id(),
                        recovery_id = %recovery.id(),
                        error = %e,
                        "Step failed, running recovery step"
                    );
                    // The recovery step sees the failure message as input
                    // and substitutes for the failed step once; if it fails
                    // too, the workflow fails.
                    let output = recovery
                        .execute(Value::String(e.to_string()), ctx, env)
                        .await?;
                    ctx.set_variable(recovery.id(), output.clone()).await;
                    current = output;
                    idx += 1;
                }
            }
        }
        Ok(current)
    }

    async fn execute_parallel(&self, ctx: &ExecutionContext, env: &ExecEnv) -> Result<Value> {
        let input = ctx.variable("input").await.unwrap_or(Value::Null);

        let futs: Vec<_> = self
            .steps
            .iter()
            .map(|step| {
                let input = input.clone();
                let hook_ctx = HookContext::for_execution(ctx.clone(), &self.config.id)
                    .with_step(step.id());
                async move {
                    let before = env
                        .hooks
                        .dispatch(
                            HookPoint::BeforeStep,
                            json!({ "step_id": step.id(), "input": &input }),
                            &hook_ctx,
                        )
                        .await;
                    let input = match before {
                        Ok(payload) => payload.get("input").cloned().unwrap_or(input),
                        Err(e) => return (step.id().to_string(), Err(e)),
                    };
                    let result = step.execute(input, ctx, env).await;
                    if let Ok(output) = &result {
                        let _ = env
                            .hooks
                            .dispatch(
                                HookPoint::AfterStep,
                                json!({ "step_id": step.id(), "output": &output }),
                                &hook_ctx,
                            )
                            .await;
                    }
                    (step.id().to_string(), result)
                }
            })
            .collect();
        let settled = futures::future::join_all(futs).await;

        let total = settled.len();
        let mut results = serde_json::Map::new();
        let mut failed_ids = Vec::new();
        for (id, result) in settled {
            match result {
                Ok(output) => {
                    // Successful branches keep their variable writes even
                    // when a sibling fails.
                    ctx.set_variable(&id, output.clone()).await;
                    results.insert(id, output);
                }
                Err(e) => {
                    warn!(workflow_id = %self.config.id, step_id = %id, error = %e, "Parallel step failed");
                    failed_ids.push(id);
                }
            }
        }

        if failed_ids.is_empty() {
            Ok(Value::Object(results))
        } else {
            Err(StrandError::aggregate(failed_ids, total))
        }
    }
}
