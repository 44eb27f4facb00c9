//! quay - A plugin-driven build orchestrator
//!
//! This crate provides the library behind the `quay` command: resolving a
//! build configuration and its plugins into an execution plan, running that
//! plan event by event with isolated plugin processes, and aggregating the
//! outcome into a build report.

pub mod builder;
pub mod core;
pub mod ops;
pub mod resolver;
pub mod util;

/// Test utilities for quay unit tests.
///
/// This module is only available when compiling with `--cfg test`. It
/// provides plugin fixtures backed by shell scripts and recording mocks for
/// core steps and output sinks.
#[cfg(test)]
pub mod test_support;

pub use core::{
    error::{ClassifiedError, ErrorKind, Severity},
    event::{LifecycleEvent, Timeline},
    report::BuildReport,
    step::{ExecutionPlan, Step},
};

pub use resolver::resolve_plan;
pub use util::context::GlobalContext;
