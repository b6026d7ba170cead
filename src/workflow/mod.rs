//! Workflow definitions and their orchestration.
//!
//! A workflow is a named, versioned list of steps. Each step names a
//! registered [`StepExecutor`] (the analyzer runner, or anything else an
//! embedding application registers). [`WorkflowOrchestrator`] runs one
//! execution per workflow and customer at a time and persists every
//! transition.

mod cache;
mod context;
mod orchestrator;
mod parser;
mod steps;
mod types;
mod validator;

pub use cache::DefinitionCache;
pub use context::ContextStore;
pub use orchestrator::{OrchestratorConfig, PersistenceMode, WorkflowOrchestrator};
pub use parser::{parse_definition, parse_definition_file};
pub use steps::{AnalyzerStep, StepContext, StepExecutor, StepRegistry};
pub use types::*;
pub use validator::{
    check_context_size, truncate_error, validate_definition, validate_steps, TRUNCATION_MARKER,
};
