//! `quay build` command

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::cli::{BuildArgs, ConfigArgs};
use quay::ops::quay_build::{build, BuildOptions};
use quay::util::shell::Shell;
use quay::GlobalContext;

pub fn execute(gctx: &GlobalContext, shell: Arc<Shell>, args: BuildArgs) -> Result<i32> {
    let opts = options(args);
    let report = build(gctx, shell, &opts);
    Ok(report.exit_code())
}

/// Translate command-line arguments into build options.
pub fn options(args: BuildArgs) -> BuildOptions {
    BuildOptions {
        save_config: args.save_config,
        dry: args.dry,
        debug: args.debug,
        timeout: args.timeout.map(Duration::from_secs),
        system_log_file: args.system_log_file,
        output_report: args.output_report,
        ..config_options(args.config)
    }
}

/// Options shared by every command that resolves a plan.
pub fn config_options(args: ConfigArgs) -> BuildOptions {
    BuildOptions {
        config_path: args.config,
        context: args.context,
        cached_config: args.cached_config,
        feature_flags: args.feature_flags,
        plugins_list: args.plugins_list,
        ..BuildOptions::default()
    }
}
