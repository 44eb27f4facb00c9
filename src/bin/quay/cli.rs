//! CLI definitions using clap.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell as CompletionShell;

use quay::util::shell::ColorChoice;
use quay::Timeline;

/// quay - A plugin-driven build orchestrator
#[derive(Parser)]
#[command(name = "quay")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Run as if quay was started in <CWD>
    #[arg(long, global = true, env = "QUAY_CWD")]
    pub cwd: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only print errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Coloring of the output
    #[arg(long, global = true, value_enum, default_value_t = ColorArg::Auto)]
    pub color: ColorArg,

    /// Output format for build messages
    #[arg(long, global = true, value_enum, default_value_t = MessageFormat::Human)]
    pub message_format: MessageFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the build lifecycle
    Build(BuildArgs),

    /// Run the dev lifecycle
    Dev(BuildArgs),

    /// Print the execution plan without running it
    Plan(PlanArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ColorArg {
    Auto,
    Always,
    Never,
}

impl From<ColorArg> for ColorChoice {
    fn from(arg: ColorArg) -> Self {
        match arg {
            ColorArg::Auto => ColorChoice::Auto,
            ColorArg::Always => ColorChoice::Always,
            ColorArg::Never => ColorChoice::Never,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MessageFormat {
    Human,
    Json,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TimelineArg {
    Build,
    Dev,
}

impl From<TimelineArg> for Timeline {
    fn from(arg: TimelineArg) -> Self {
        match arg {
            TimelineArg::Build => Timeline::Build,
            TimelineArg::Dev => Timeline::Dev,
        }
    }
}

/// How the configuration and plugins are resolved.
#[derive(Args, Clone, Default)]
pub struct ConfigArgs {
    /// Path to the configuration file
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Deploy context whose `[context.<name>]` overrides apply
    #[arg(long, env = "QUAY_CONTEXT")]
    pub context: Option<String>,

    /// Use an already-resolved configuration (JSON) instead of quay.toml
    #[arg(long, value_name = "PATH")]
    pub cached_config: Option<PathBuf>,

    /// Feature flags, as `name` or `name=false`, comma-separated
    #[arg(long, value_delimiter = ',', env = "QUAY_FEATURE_FLAGS")]
    pub feature_flags: Vec<String>,

    /// Plugin compatibility list (JSON)
    #[arg(long, value_name = "PATH")]
    pub plugins_list: Option<PathBuf>,
}

#[derive(Args)]
pub struct BuildArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Write accepted configuration changes back to quay.toml
    #[arg(long)]
    pub save_config: bool,

    /// Print the plan instead of running it
    #[arg(long)]
    pub dry: bool,

    /// Keep internal stack frames and print every configuration change
    #[arg(long)]
    pub debug: bool,

    /// Per-step timeout in seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Append handler system logs to this file
    #[arg(long, value_name = "PATH")]
    pub system_log_file: Option<PathBuf>,

    /// Write the JSON build report to this file
    #[arg(long, value_name = "PATH")]
    pub output_report: Option<PathBuf>,
}

#[derive(Args)]
pub struct PlanArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Timeline to plan
    #[arg(long, value_enum, default_value_t = TimelineArg::Build)]
    pub timeline: TimelineArg,
}

#[derive(Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: CompletionShell,
}
