//! High-level operations.
//!
//! This module contains the implementation of quay commands.

pub mod quay_build;

pub use quay_build::{build, dev, plan, print_plan, run_timeline, BuildOptions};
