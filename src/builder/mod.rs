//! Build execution.
//!
//! This module runs a resolved plan: the per-step runner and its child
//! process protocol, failure classification, status reconciliation, the
//! built-in core steps and the pipeline state machine that ties them together.

pub mod classify;
pub mod core_steps;
pub mod env;
pub mod events;
pub mod ipc;
pub mod pipeline;
pub mod runner;
pub mod status;

pub use classify::{classify, ErrorOrigin};
pub use core_steps::{CoreStep, CoreStepContext, CoreStepRegistry};
pub use env::Environment;
pub use events::BuildEvent;
pub use pipeline::{PipelineController, PipelineOptions, PipelineState};
pub use runner::{HandlerOutcome, HandlerRunner, RunnerOptions};
pub use status::StatusAggregator;
