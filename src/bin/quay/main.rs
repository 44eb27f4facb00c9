//! quay CLI - A plugin-driven build orchestrator

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;
mod commands;

use cli::{Cli, Commands, MessageFormat};
use quay::util::shell::Shell;
use quay::GlobalContext;

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {:#}", e);
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();

    let debug = match &cli.command {
        Commands::Build(args) | Commands::Dev(args) => args.debug,
        _ => false,
    };
    let filter = if cli.verbose || debug {
        EnvFilter::new("quay=debug")
    } else {
        EnvFilter::new("quay=info")
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .without_time()
        .init();

    let shell = Arc::new(Shell::from_flags(
        cli.quiet,
        cli.verbose,
        cli.color.into(),
        cli.message_format == MessageFormat::Json,
    ));

    let gctx = match &cli.cwd {
        Some(cwd) => GlobalContext::with_cwd(std::path::absolute(cwd)?),
        None => GlobalContext::new()?,
    };

    match cli.command {
        Commands::Build(args) => commands::build::execute(&gctx, shell, args),
        Commands::Dev(args) => commands::dev::execute(&gctx, shell, args),
        Commands::Plan(args) => commands::plan::execute(&gctx, shell, args),
        Commands::Completions(args) => commands::completions::execute(args),
    }
}
