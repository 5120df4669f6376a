use std::collections::HashMap;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::ExecutionContext;
use crate::error::Result;

/// Explicit plugin identity. `name` is the registry key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginMetadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
}

impl PluginMetadata {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Higher priority runs earlier in the pipeline.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub options: HashMap<String, Value>,
}

fn default_enabled() -> bool { true }

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: 0,
            options: HashMap::new(),
        }
    }
}

impl PluginConfig {
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// Lifecycle interception points a plugin may handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookPoint {
    BeforeInit,
    AfterInit,
    BeforeAgentRegister,
    AfterAgentRegister,
    BeforeAgentExecute,
    AfterAgentExecute,
    BeforeWorkflowRegister,
    AfterWorkflowRegister,
    BeforeWorkflowExecute,
    AfterWorkflowExecute,
    BeforeStep,
    AfterStep,
    OnError,
    OnAgentError,
    OnWorkflowError,
    OnCustomEvent,
}

impl HookPoint {
    /// Error-class hooks re-raise plugin failures instead of swallowing them.
    pub fn is_error_hook(&self) -> bool {
        matches!(
            self,
            Self::OnError | Self::OnAgentError | Self::OnWorkflowError
        )
    }
}

/// Ambient information accompanying a hook dispatch.
#[derive(Clone, Default)]
pub struct HookContext {
    pub execution: Option<ExecutionContext>,
    pub workflow_id: Option<String>,
    pub agent_id: Option<String>,
    pub step_id: Option<String>,
    /// Set for `OnCustomEvent` dispatches.
    pub event: Option<String>,
}

impl HookContext {
    pub fn for_execution(execution: ExecutionContext, workflow_id: impl Into<String>) -> Self {
        Self {
            execution: Some(execution),
            workflow_id: Some(workflow_id.into()),
            agent_id: None,
            step_id: None,
            event: None,
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }
}

/// What a hook decided about the payload flowing through the pipeline.
#[derive(Debug)]
pub enum HookAction {
    /// Pass this (possibly replaced) payload to the next hook.
    Continue(Value),
    /// Deliberate veto: abort the pipeline and fail the guarded operation.
    Reject(crate::error::StrandError),
}

/// An ordered-interceptor plugin.
///
/// Plugins declare which hook points they handle; the pipeline dispatches
/// only those, sorted by descending priority. A plugin returning `Err` from
/// `on_hook` is logged and skipped unless the hook point is error-class.
pub trait Plugin: Send + Sync + 'static {
    fn metadata(&self) -> &PluginMetadata;

    fn config(&self) -> &PluginConfig;

    /// The hook points this plugin intercepts.
    fn hooks(&self) -> Vec<HookPoint>;

    /// Called once when the plugin is registered.
    fn init(&self) -> Result<()> {
        Ok(())
    }

    /// Release held resources (timers, caches) on unregister/shutdown.
    fn cleanup(&self) -> Result<()> {
        Ok(())
    }

    /// Handle one hook dispatch.
    fn on_hook(
        &self,
        hook: HookPoint,
        payload: Value,
        ctx: HookContext,
    ) -> BoxFuture<'_, Result<HookAction>>;
}
