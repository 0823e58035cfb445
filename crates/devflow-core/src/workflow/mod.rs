//! Workflow execution: definition parsing, variable resolution, step
//! execution and the run engine.
//!
//! - `definition` -- YAML parsing and validation into typed steps
//! - `resolver` -- `${...}` templates and the expression language
//! - `context` -- per-run variable map with size limits
//! - `retry` -- retry decisions and exponential backoff
//! - `step_executor` -- one action or generation step through the guards
//! - `checkpoint` -- durable run records and resume points
//! - `engine` -- sequencing, control steps, rollback and cancellation

pub mod checkpoint;
pub mod context;
pub mod definition;
pub mod engine;
pub mod resolver;
pub mod retry;
pub mod step_executor;

pub use definition::{WorkflowError, load_workflow_file, parse_workflow_yaml};
pub use engine::{EngineError, WorkflowEngine};
