//! Core data structures for quay.
//!
//! This module contains the foundational types used throughout quay:
//! - Lifecycle events and timelines
//! - Steps and the execution plan
//! - The build configuration and its access-controlled mutation layer
//! - The failure taxonomy and the build report

pub mod config;
pub mod constants;
pub mod error;
pub mod event;
pub mod mutable;
pub mod plugin;
pub mod report;
pub mod step;

pub use config::{ConfigError, ConfigOptions, ResolvedConfig, CONFIG_FILE};
pub use constants::{Constants, ConstantsContext};
pub use error::{ClassifiedError, ErrorKind, ErrorLocation, RawError, Severity};
pub use event::{LifecycleEvent, Timeline};
pub use mutable::{KeyPath, MutableConfig, Mutation, MutationError, MutationLog};
pub use plugin::{LoadedPlugin, PluginDeclaration, PluginManifest, PluginOrigin};
pub use report::{BuildReport, GeneratedFunction, Metric, PluginStatus, StatusReport, StatusState};
pub use step::{ExecutionPlan, Step, StepKind};
