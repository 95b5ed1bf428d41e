pub mod actions;
pub mod condition;
pub mod dag;
pub mod executor;
pub mod handlers;
pub mod queue;
pub mod registry;
pub mod step_executor;
pub mod template;

pub use actions::{ActionDispatcher, ActionTrigger, DispatchReport};
pub use dag::{validate_definition, DependencyGraph};
pub use executor::{EngineBuilder, WorkflowEngine, SYSTEM_ACTOR};
pub use queue::ExecutionQueue;
pub use registry::{DefinitionRegistry, ExecutionCounters};
pub use step_executor::{StepHandler, StepHandlerRegistry, StepRequest};
