//! `quay plan` command
//!
//! Resolves the plan, including the plugin handshakes, and prints it.

use std::sync::Arc;

use anyhow::Result;

use crate::cli::PlanArgs;
use crate::commands::build::config_options;
use quay::ops::quay_build::plan;
use quay::util::shell::Shell;
use quay::GlobalContext;

pub fn execute(gctx: &GlobalContext, shell: Arc<Shell>, args: PlanArgs) -> Result<i32> {
    let report = plan(gctx, shell, &config_options(args.config), args.timeline.into());
    Ok(report.exit_code())
}
