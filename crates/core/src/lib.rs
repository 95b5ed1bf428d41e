//! Procflow core: workflow definitions, executions and the queue processor that drives them.

pub mod analytics;
pub mod audit;
pub mod config;
pub mod error;
pub mod rbac;
pub mod side_effects;
pub mod storage;
pub mod types;
pub mod workflow;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use types::*;
pub use workflow::{EngineBuilder, WorkflowEngine};
