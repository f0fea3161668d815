use clap::builder::BoolishValueParser;
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::config::ConfigOverrides;

#[derive(Parser, Debug)]
#[clap(name = "codelet")]
#[clap(version, about = "Sandboxed JavaScript snippet executor")]
#[clap(propagate_version = true)]
pub struct Cli {
    #[clap(flatten)]
    pub global_opts: GlobalOpts,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Args, Debug)]
pub struct GlobalOpts {
    /// Configuration file path
    #[clap(short, long, global = true, env = "CODELET_CONFIG")]
    pub config: Option<PathBuf>,

    /// Verbosity level (-v, -vv, -vvv)
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Output format
    #[clap(long, global = true, default_value = "text", value_enum)]
    pub format: OutputFormat,

    #[clap(flatten)]
    pub policy: PolicyOpts,
}

/// Policy overrides shared by `serve` and `exec`.
#[derive(Args, Debug, Default)]
pub struct PolicyOpts {
    /// Maximum snippet length in characters
    #[clap(long, global = true, env = "CODELET_MAX_CODE_LENGTH")]
    pub max_code_length: Option<usize>,

    /// Execution timeout in milliseconds
    #[clap(long, global = true, env = "CODELET_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    /// Let snippets use fetch
    #[clap(long, global = true, env = "CODELET_ALLOW_NETWORK", value_parser = BoolishValueParser::new())]
    pub allow_network: Option<bool>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP execution service
    Serve(ServeArgs),

    /// Execute one snippet and print its output
    Exec(ExecArgs),

    /// Initialize a new codelet configuration
    Init(InitArgs),

    /// Manage configuration
    Config(ConfigArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Interface to listen on
    #[clap(long, env = "CODELET_HOST")]
    pub host: Option<String>,

    /// Port to listen on
    #[clap(long, short = 'p', env = "CODELET_PORT")]
    pub port: Option<u16>,
}

#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Snippet source, or "-" to read it from stdin
    #[clap(required_unless_present = "file", conflicts_with = "file")]
    pub code: Option<String>,

    /// Read the snippet from a file
    #[clap(long, short = 'f')]
    pub file: Option<PathBuf>,

    /// Send the snippet to a running server instead of executing locally
    #[clap(long)]
    pub remote: Option<String>,
}

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Force overwrite existing configuration
    #[clap(short, long)]
    pub force: bool,
}

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[clap(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,
    /// Show configuration file path
    Path,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl Cli {
    /// Collect the flag and environment overrides into one place.
    pub fn overrides(&self) -> ConfigOverrides {
        let (host, port) = match &self.command {
            Commands::Serve(args) => (args.host.clone(), args.port),
            _ => (None, None),
        };
        ConfigOverrides {
            host,
            port,
            max_code_length: self.global_opts.policy.max_code_length,
            timeout_ms: self.global_opts.policy.timeout_ms,
            allow_network: self.global_opts.policy.allow_network,
        }
    }
}
