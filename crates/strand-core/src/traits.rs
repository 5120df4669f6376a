use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::ToolConfig;
use crate::context::ExecutionContext;
use crate::error::Result;
use crate::types::GenerateOptions;

/// Model-invocation capability: black-box text generation.
///
/// Implementations must observe `cancel`: a cancelled token means the caller
/// gave up (timeout or shutdown) and any in-flight request should be aborted
/// rather than left running.
pub trait ModelProvider: Send + Sync + 'static {
    /// Generate a completion for a prompt.
    fn generate(
        &self,
        prompt: String,
        options: GenerateOptions,
        cancel: CancellationToken,
    ) -> BoxFuture<'_, Result<String>>;

    /// Generate a lazy, finite stream of text fragments. Not restartable.
    fn generate_stream(
        &self,
        prompt: String,
        options: GenerateOptions,
    ) -> BoxFuture<'_, Result<BoxStream<'static, Result<String>>>>;

    /// Rough token estimate for budgeting. Default: 4 chars per token.
    fn estimate_tokens(&self, text: &str) -> u32 {
        (text.len() / 4) as u32
    }
}

/// Tool handler capability: `(params, context) -> result`, fallible.
pub trait ToolHandler: Send + Sync + 'static {
    fn call(&self, params: Value, ctx: ExecutionContext) -> BoxFuture<'_, Result<Value>>;
}

/// A tool handler built from an async closure.
pub struct FnTool<F>(pub F);

impl<F, Fut> ToolHandler for FnTool<F>
where
    F: Fn(Value, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<Value>> + Send + 'static,
{
    fn call(&self, params: Value, ctx: ExecutionContext) -> BoxFuture<'_, Result<Value>> {
        Box::pin((self.0)(params, ctx))
    }
}

/// A declared tool bound to its handler.
#[derive(Clone)]
pub struct ToolRegistration {
    pub config: ToolConfig,
    pub handler: Arc<dyn ToolHandler>,
}

impl ToolRegistration {
    pub fn new(config: ToolConfig, handler: Arc<dyn ToolHandler>) -> Self {
        Self { config, handler }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }
}

impl std::fmt::Debug for ToolRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistration")
            .field("name", &self.config.name)
            .finish()
    }
}
