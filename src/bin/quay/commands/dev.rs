//! `quay dev` command

use std::sync::Arc;

use anyhow::Result;

use crate::cli::BuildArgs;
use crate::commands::build::options;
use quay::ops::quay_build::dev;
use quay::util::shell::Shell;
use quay::GlobalContext;

pub fn execute(gctx: &GlobalContext, shell: Arc<Shell>, args: BuildArgs) -> Result<i32> {
    let report = dev(gctx, shell, &options(args));
    Ok(report.exit_code())
}
