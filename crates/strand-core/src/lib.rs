pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod plugin;
pub mod retry;
pub mod traits;
pub mod types;

pub use config::{AgentConfig, EngineConfig, RetryConfig, StepConfig, StepKind, WorkflowConfig};
pub use context::{ContextSnapshot, ExecutionContext, ExecutionId, ExecutionStep};
pub use error::{Result, StrandError};
pub use event::{EventBus, ExecutionEvent};
pub use plugin::{HookAction, HookContext, HookPoint, Plugin, PluginConfig, PluginMetadata};
pub use types::*;
