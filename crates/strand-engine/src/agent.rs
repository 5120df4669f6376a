use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::BoxStream;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use strand_core::config::AgentConfig;
use strand_core::context::ExecutionContext;
use strand_core::error::{Result, StrandError};
use strand_core::retry::with_retry;
use strand_core::traits::{ModelProvider, ToolRegistration};
use strand_core::types::{AgentOutput, GenerateOptions, ToolInvocation};

use crate::toolcall::{MarkupParser, ToolCallParser};

/// How many history records are folded into the prompt.
const HISTORY_WINDOW: usize = 3;

/// A configured binding of a model provider, a system prompt, and a tool
/// registry, with retry and timeout around every model call.
pub struct Agent {
    config: AgentConfig,
    provider: Arc<dyn ModelProvider>,
    tools: RwLock<HashMap<String, ToolRegistration>>,
    parser: Box<dyn ToolCallParser>,
}

impl Agent {
    pub fn new(config: AgentConfig, provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            config,
            provider,
            tools: RwLock::new(HashMap::new()),
            parser: Box::new(MarkupParser::new()),
        }
    }

    /// Swap the tool-call parser (the markup grammar is one implementation).
    pub fn with_parser(mut self, parser: Box<dyn ToolCallParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    // Registry mutation is safe between executions; mutating concurrently
    // with an in-flight execute that is mid tool-call-scan is a hazard the
    // caller owns.

    pub async fn add_tool(&self, tool: ToolRegistration) {
        self.tools
            .write()
            .await
            .insert(tool.name().to_string(), tool);
    }

    pub async fn remove_tool(&self, name: &str) -> bool {
        self.tools.write().await.remove(name).is_some()
    }

    pub async fn list_tools(&self) -> Vec<String> {
        self.tools.read().await.keys().cloned().collect()
    }

    pub async fn tool(&self, name: &str) -> Option<ToolRegistration> {
        self.tools.read().await.get(name).cloned()
    }

    /// Assemble the full prompt: system prompt, context variables, the last
    /// few history entries, then the user prompt.
    async fn build_prompt(&self, prompt: &str, ctx: &ExecutionContext) -> String {
        let mut parts = Vec::new();

        if let Some(system) = &self.config.system_prompt {
            parts.push(system.clone());
        }

        let variables = ctx.variables().await;
        if !variables.is_empty() {
            let json = serde_json::to_string(&variables).unwrap_or_default();
            parts.push(format!("Context variables:\n{}", json));
        }

        let recent = ctx.recent_history(HISTORY_WINDOW).await;
        if !recent.is_empty() {
            let mut section = String::from("Recent steps:\n");
            for record in &recent {
                let output = record
                    .output
                    .as_ref()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|| "null".to_string());
                section.push_str(&format!("- {}: {}\n", record.step_id, output));
            }
            parts.push(section.trim_end().to_string());
        }

        parts.push(prompt.to_string());
        parts.join("\n\n")
    }

    fn generate_options(&self) -> GenerateOptions {
        GenerateOptions {
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            timeout_ms: Some(self.config.timeout_ms),
            ..Default::default()
        }
    }

    /// Single-shot execution: retry + per-attempt timeout around the model
    /// call, then tool-call post-processing over the response text.
    pub async fn execute(
        &self,
        prompt: &str,
        ctx: &ExecutionContext,
        cancel: CancellationToken,
    ) -> Result<AgentOutput> {
        let full_prompt = self.build_prompt(prompt, ctx).await;
        let options = self.generate_options();
        let timeout = Duration::from_millis(self.config.timeout_ms);

        let attempt = || {
            let prompt = full_prompt.clone();
            let options = options.clone();
            let cancel = cancel.clone();
            async move {
                // Each attempt gets its own token so a timed-out request is
                // actively aborted, not just abandoned.
                let attempt_cancel = cancel.child_token();
                tokio::select! {
                    result = self.provider.generate(prompt, options, attempt_cancel.clone()) => result,
                    _ = tokio::time::sleep(timeout) => {
                        attempt_cancel.cancel();
                        Err(StrandError::AgentTimeout {
                            agent_id: self.config.id.clone(),
                            timeout_ms: self.config.timeout_ms,
                        })
                    }
                }
            }
        };

        let response = tokio::select! {
            result = with_retry(&self.config.retry, attempt) => result?,
            _ = cancel.cancelled() => return Err(StrandError::Cancelled),
        };

        let tool_calls = self.dispatch_tool_calls(&response, ctx).await;
        debug!(
            agent_id = %self.config.id,
            response_len = response.len(),
            tool_calls = tool_calls.len(),
            "Agent execution complete"
        );

        Ok(AgentOutput {
            tokens: Some(self.provider.estimate_tokens(&response)),
            response,
            tool_calls,
        })
    }

    /// Streaming execution: same prompt assembly, no retry/timeout wrapper,
    /// no tool-call post-processing. The stream is finite and not
    /// restartable.
    pub async fn execute_stream(
        &self,
        prompt: &str,
        ctx: &ExecutionContext,
    ) -> Result<BoxStream<'static, Result<String>>> {
        let full_prompt = self.build_prompt(prompt, ctx).await;
        self.provider
            .generate_stream(full_prompt, self.generate_options())
            .await
    }

    /// Scan the response for tool markup and run each matched call.
    /// Unknown tool names are skipped silently; per-call failures are
    /// recorded, never raised.
    async fn dispatch_tool_calls(
        &self,
        response: &str,
        ctx: &ExecutionContext,
    ) -> Vec<ToolInvocation> {
        let mut invocations = Vec::new();

        for raw in self.parser.parse(response) {
            let Some(tool) = self.tool(&raw.name).await else {
                debug!(agent_id = %self.config.id, tool = %raw.name, "Unknown tool in markup, skipping");
                continue;
            };

            let args: serde_json::Value = match serde_json::from_str(&raw.raw_args) {
                Ok(v) => v,
                Err(e) => {
                    warn!(tool = %raw.name, error = %e, "Malformed tool args");
                    invocations.push(ToolInvocation {
                        tool: raw.name,
                        args: serde_json::Value::String(raw.raw_args),
                        result: None,
                        error: Some(format!("invalid args: {}", e)),
                    });
                    continue;
                }
            };

            match tool.handler.call(args.clone(), ctx.clone()).await {
                Ok(result) => invocations.push(ToolInvocation {
                    tool: raw.name,
                    args,
                    result: Some(result),
                    error: None,
                }),
                Err(e) => {
                    warn!(tool = %raw.name, error = %e, "Tool handler failed");
                    invocations.push(ToolInvocation {
                        tool: raw.name,
                        args,
                        result: None,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        invocations
    }
}
