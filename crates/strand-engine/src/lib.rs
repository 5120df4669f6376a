//! Workflow execution engine: agents, typed steps, workflows, the plugin
//! hook pipeline, and the orchestrator that runs them.

pub mod agent;
pub mod hooks;
pub mod orchestrator;
pub mod registry;
pub mod step;
pub mod toolcall;
pub mod workflow;

pub use agent::Agent;
pub use hooks::HookPipeline;
pub use orchestrator::{ExecuteOptions, ExecutionFailure, Orchestrator};
pub use registry::{AgentRegistry, ExecEnv};
pub use step::{ConditionFn, Step};
pub use toolcall::{MarkupParser, RawToolCall, ToolCallParser};
pub use workflow::Workflow;
