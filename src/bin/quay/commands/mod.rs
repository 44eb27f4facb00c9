//! Command implementations

pub mod build;
pub mod completions;
pub mod dev;
pub mod plan;
