use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tracing::{debug, warn};

use strand_core::config::{StepConfig, StepKind};
use strand_core::context::{ContextSnapshot, ExecutionContext};
use strand_core::error::{Result, StrandError};
use strand_core::plugin::{HookContext, HookPoint};

use crate::registry::ExecEnv;

/// Predicate a `condition` step evaluates over the context.
pub type ConditionFn = Arc<dyn Fn(&ContextSnapshot) -> bool + Send + Sync>;

/// One typed unit of work inside a workflow. Loop bodies, parallel branches,
/// and condition targets nest as child steps.
pub struct Step {
    config: StepConfig,
    condition: Option<ConditionFn>,
    steps: Vec<Step>,
}

impl Step {
    /// Build a step tree from config. Condition predicates are attached
    /// afterwards with [`Step::with_condition`]; they do not serialize.
    pub fn from_config(config: StepConfig) -> Self {
        let steps = config.steps.iter().cloned().map(Step::from_config).collect();
        Self {
            config,
            condition: None,
            steps,
        }
    }

    pub fn with_condition(
        mut self,
        condition: impl Fn(&ContextSnapshot) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.condition = Some(Arc::new(condition));
        self
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &StepConfig {
        &self.config
    }

    /// Execute this step. Exactly one history record is appended per call:
    /// begun before dispatch, finalized on success and failure alike.
    ///
    /// Agent steps record the full agent output (tool calls included) but
    /// return only the textual response.
    pub fn execute<'a>(
        &'a self,
        input: Value,
        ctx: &'a ExecutionContext,
        env: &'a ExecEnv,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            let attempt = ctx
                .begin_step(&self.config.id, self.config.agent_id.as_deref(), &input)
                .await;

            match self.dispatch(input, ctx, env).await {
                Ok(record) => {
                    ctx.finish_step(&attempt, Ok(&record)).await;
                    let result = if self.config.kind == StepKind::Agent {
                        record.get("response").cloned().unwrap_or(record)
                    } else {
                        record
                    };
                    Ok(result)
                }
                Err(e) => {
                    ctx.finish_step(&attempt, Err(&e)).await;
                    Err(e)
                }
            }
        })
    }

    async fn dispatch(&self, input: Value, ctx: &ExecutionContext, env: &ExecEnv) -> Result<Value> {
        debug!(step_id = %self.config.id, kind = ?self.config.kind, "Executing step");
        match self.config.kind {
            StepKind::Agent => self.run_agent(input, ctx, env).await,
            StepKind::Tool => self.run_tool(input, ctx, env).await,
            StepKind::Condition => self.run_condition(input, ctx, env).await,
            StepKind::Loop => self.run_loop(input, ctx, env).await,
            StepKind::Parallel => self.run_parallel(input, ctx, env).await,
        }
    }

    fn invalid(&self, message: &str) -> StrandError {
        StrandError::InvalidStep {
            step_id: self.config.id.clone(),
            message: message.to_string(),
        }
    }

    async fn run_agent(&self, input: Value, ctx: &ExecutionContext, env: &ExecEnv) -> Result<Value> {
        let agent_id = self
            .config
            .agent_id
            .as_deref()
            .ok_or_else(|| self.invalid("agent_id is required for agent steps"))?;
        let agent = env
            .agent(agent_id)
            .ok_or_else(|| StrandError::AgentNotFound(agent_id.to_string()))?;

        let prompt = match input {
            Value::String(s) => s,
            other => other.to_string(),
        };

        let hook_ctx = HookContext::for_execution(ctx.clone(), ctx.workflow_id().await)
            .with_agent(agent_id)
            .with_step(&self.config.id);

        let payload = env
            .hooks
            .dispatch(
                HookPoint::BeforeAgentExecute,
                json!({ "agent_id": agent_id, "prompt": &prompt }),
                &hook_ctx,
            )
            .await?;

        // A before-hook (the cache) may short-circuit the model call.
        if let Some(cached) = payload.get("cached") {
            ctx.set_metadata("cache_hit", json!(true)).await;
            let response = cached.as_str().unwrap_or_default().to_string();
            return Ok(serde_json::to_value(
                strand_core::types::AgentOutput::text(response),
            )?);
        }

        // Hooks may rewrite the prompt in flight.
        let prompt = payload
            .get("prompt")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or(prompt);

        match agent.execute(&prompt, ctx, env.cancel.clone()).await {
            Ok(output) => {
                env.hooks
                    .dispatch(
                        HookPoint::AfterAgentExecute,
                        json!({
                            "agent_id": agent_id,
                            "prompt": prompt,
                            "response": &output.response,
                        }),
                        &hook_ctx,
                    )
                    .await?;
                Ok(serde_json::to_value(output)?)
            }
            Err(e) => {
                env.hooks
                    .dispatch(
                        HookPoint::OnAgentError,
                        json!({ "agent_id": agent_id, "error": e.to_string() }),
                        &hook_ctx,
                    )
                    .await?;
                Err(e)
            }
        }
    }

    async fn run_tool(&self, input: Value, ctx: &ExecutionContext, env: &ExecEnv) -> Result<Value> {
        let tool_name = self
            .config
            .tool_name
            .as_deref()
            .ok_or_else(|| self.invalid("tool_name is required for tool steps"))?;
        let (_agent, tool) = env
            .find_tool(tool_name)
            .await
            .ok_or_else(|| StrandError::ToolNotFound(tool_name.to_string()))?;
        tool.handler.call(input, ctx.clone()).await
    }

    async fn run_condition(
        &self,
        input: Value,
        ctx: &ExecutionContext,
        env: &ExecEnv,
    ) -> Result<Value> {
        let predicate = self
            .condition
            .as_ref()
            .ok_or_else(|| self.invalid("condition predicate is required"))?;

        let verdict = predicate(&ctx.snapshot().await);
        let branch_id = if verdict {
            self.config.on_success.as_deref()
        } else {
            self.config.on_failure.as_deref()
        };

        if let Some(id) = branch_id {
            if let Some(branch) = self.steps.iter().find(|s| s.config.id == id) {
                return branch.execute(input, ctx, env).await;
            }
        }
        Ok(Value::Bool(verdict))
    }

    async fn run_loop(&self, input: Value, ctx: &ExecutionContext, env: &ExecEnv) -> Result<Value> {
        if self.steps.is_empty() {
            return Err(self.invalid("loop steps require nested steps"));
        }
        let iterations = self.config.iterations.unwrap_or(1).max(1);

        let mut results = Vec::with_capacity(iterations as usize);
        let mut current = input;
        for _ in 0..iterations {
            for step in &self.steps {
                current = step.execute(current, ctx, env).await?;
            }
            results.push(current.clone());
        }
        Ok(Value::Array(results))
    }

    async fn run_parallel(
        &self,
        input: Value,
        ctx: &ExecutionContext,
        env: &ExecEnv,
    ) -> Result<Value> {
        if self.steps.is_empty() {
            return Err(self.invalid("parallel steps require nested steps"));
        }

        // All branches start before any is awaited; the same input goes to
        // each (not threaded between siblings).
        let futs: Vec<_> = self
            .steps
            .iter()
            .map(|step| {
                let input = input.clone();
                async move { (step.config.id.clone(), step.execute(input, ctx, env).await) }
            })
            .collect();
        let settled = futures::future::join_all(futs).await;

        let mut results = serde_json::Map::new();
        let mut failed_ids = Vec::new();
        for (id, result) in settled {
            match result {
                Ok(value) => {
                    results.insert(id, value);
                }
                Err(e) => {
                    warn!(step_id = %id, error = %e, "Parallel branch failed");
                    failed_ids.push(id);
                }
            }
        }

        if failed_ids.is_empty() {
            Ok(Value::Object(results))
        } else {
            Err(StrandError::aggregate(failed_ids, self.steps.len()))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tokio_util::sync::CancellationToken;

    use strand_core::config::{AgentConfig, ToolConfig};
    use strand_core::traits::ToolRegistration;

    use crate::agent::Agent;
    use crate::hooks::HookPipeline;

    use super::*;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("wf", json!("seed"), HashMap::new())
    }

    async fn env_with_agent(response: &str) -> ExecEnv {
        let agent = Arc::new(Agent::new(
            AgentConfig::new("assistant", "Assistant"),
            Arc::new(strand_test_utils::ScriptedProvider::always(response)),
        ));
        agent
            .add_tool(ToolRegistration::new(
                ToolConfig {
                    name: "echo".into(),
                    description: String::new(),
                    parameters: json!({}),
                },
                Arc::new(strand_test_utils::EchoTool),
            ))
            .await;
        ExecEnv::new(
            vec![agent],
            Arc::new(HookPipeline::new()),
            CancellationToken::new(),
        )
    }

    fn empty_env() -> ExecEnv {
        ExecEnv::new(
            vec![],
            Arc::new(HookPipeline::new()),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_agent_step_returns_text_records_full_output() {
        let env = env_with_agent(r#"done [TOOL:echo]{"k": 1}[/TOOL]"#).await;
        let ctx = ctx();
        let step = Step::from_config(StepConfig::agent("respond", "assistant"));

        let result = step.execute(json!("hi"), &ctx, &env).await.unwrap();
        assert_eq!(result, json!(r#"done [TOOL:echo]{"k": 1}[/TOOL]"#));

        // The history record keeps the tool-call metadata the return drops.
        let history = ctx.history().await;
        assert_eq!(history.len(), 1);
        let record = history[0].output.as_ref().unwrap();
        assert_eq!(record["tool_calls"][0]["tool"], json!("echo"));
    }

    #[tokio::test]
    async fn test_agent_step_missing_agent() {
        let env = empty_env();
        let ctx = ctx();
        let step = Step::from_config(StepConfig::agent("s", "ghost"));

        let result = step.execute(json!("x"), &ctx, &env).await;
        assert!(matches!(result, Err(StrandError::AgentNotFound(_))));

        // The failed attempt is still a finalized history record.
        let history = ctx.history().await;
        assert_eq!(history.len(), 1);
        assert!(history[0].error.is_some());
        assert!(history[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn test_agent_step_stringifies_non_string_input() {
        let env = env_with_agent("ok").await;
        let ctx = ctx();
        let step = Step::from_config(StepConfig::agent("s", "assistant"));
        step.execute(json!({"n": 1}), &ctx, &env).await.unwrap();

        let history = ctx.history().await;
        assert_eq!(history[0].input, json!({"n": 1}));
    }

    #[tokio::test]
    async fn test_tool_step_searches_agents() {
        let env = env_with_agent("unused").await;
        let ctx = ctx();
        let step = Step::from_config(StepConfig::tool("t", "echo"));

        let result = step.execute(json!({"x": 2}), &ctx, &env).await.unwrap();
        assert_eq!(result, json!({"echo": {"x": 2}}));
    }

    #[tokio::test]
    async fn test_tool_step_not_found() {
        let env = env_with_agent("unused").await;
        let step = Step::from_config(StepConfig::tool("t", "ghost"));
        let result = step.execute(json!(null), &ctx(), &env).await;
        assert!(matches!(result, Err(StrandError::ToolNotFound(_))));
    }

    #[tokio::test]
    async fn test_condition_dispatches_branch() {
        let env = env_with_agent("unused").await;
        let ctx = ctx();

        let config = StepConfig::new("check", StepKind::Condition)
            .with_on_success("yes")
            .with_on_failure("no")
            .with_steps(vec![
                StepConfig::tool("yes", "echo"),
                StepConfig::tool("no", "echo"),
            ]);
        let step = Step::from_config(config)
            .with_condition(|snap| snap.variables.contains_key("input"));

        let result = step.execute(json!("payload"), &ctx, &env).await.unwrap();
        assert_eq!(result, json!({"echo": "payload"}));

        // Outer condition record plus the dispatched branch record.
        let history = ctx.history().await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].step_id, "yes");
    }

    #[tokio::test]
    async fn test_condition_without_branch_returns_bool() {
        let env = empty_env();
        let step = Step::from_config(StepConfig::new("check", StepKind::Condition))
            .with_condition(|_| false);
        let result = step.execute(json!(null), &ctx(), &env).await.unwrap();
        assert_eq!(result, json!(false));
    }

    #[tokio::test]
    async fn test_condition_requires_predicate() {
        let env = empty_env();
        let step = Step::from_config(StepConfig::new("check", StepKind::Condition));
        let result = step.execute(json!(null), &ctx(), &env).await;
        assert!(matches!(result, Err(StrandError::InvalidStep { .. })));
    }

    #[tokio::test]
    async fn test_loop_threads_output_between_iterations() {
        let env = env_with_agent("unused").await;
        let ctx = ctx();

        let config = StepConfig::new("grow", StepKind::Loop)
            .with_iterations(3)
            .with_steps(vec![StepConfig::tool("wrap", "echo")]);
        let step = Step::from_config(config);

        let result = step.execute(json!(0), &ctx, &env).await.unwrap();
        // Each iteration wraps the previous iteration's output once more.
        assert_eq!(
            result,
            json!([
                {"echo": 0},
                {"echo": {"echo": 0}},
                {"echo": {"echo": {"echo": 0}}}
            ])
        );
    }

    #[tokio::test]
    async fn test_loop_requires_nested_steps() {
        let env = empty_env();
        let step = Step::from_config(StepConfig::new("l", StepKind::Loop).with_iterations(2));
        let result = step.execute(json!(null), &ctx(), &env).await;
        assert!(matches!(result, Err(StrandError::InvalidStep { .. })));
    }

    #[tokio::test]
    async fn test_parallel_success_maps_by_id() {
        let env = env_with_agent("unused").await;
        let config = StepConfig::new("fan", StepKind::Parallel).with_steps(vec![
            StepConfig::tool("a", "echo"),
            StepConfig::tool("b", "echo"),
        ]);
        let step = Step::from_config(config);

        let result = step.execute(json!("shared"), &ctx(), &env).await.unwrap();
        assert_eq!(
            result,
            json!({"a": {"echo": "shared"}, "b": {"echo": "shared"}})
        );
    }

    #[tokio::test]
    async fn test_parallel_aggregate_names_failed_children() {
        let env = env_with_agent("unused").await;
        let config = StepConfig::new("fan", StepKind::Parallel).with_steps(vec![
            StepConfig::tool("a", "echo"),
            StepConfig::tool("b", "ghost"),
            StepConfig::tool("c", "echo"),
        ]);
        let step = Step::from_config(config);

        let ctx = ctx();
        let result = step.execute(json!("x"), &ctx, &env).await;
        match result {
            Err(StrandError::Aggregate {
                failed,
                total,
                failed_ids,
            }) => {
                assert_eq!(failed, 1);
                assert_eq!(total, 3);
                assert_eq!(failed_ids, vec!["b"]);
            }
            other => panic!("expected aggregate error, got {:?}", other.map(|_| ())),
        }

        // A and C still executed; their records exist even though the step
        // returned nothing for them.
        let history = ctx.history().await;
        let finished_ok = history
            .iter()
            .filter(|r| r.error.is_none() && r.finished_at.is_some())
            .count();
        assert_eq!(finished_ok, 2);
    }
}
