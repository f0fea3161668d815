use clap::Parser;

use codelet::cli::args::{Cli, Commands};
use codelet::cli::commands;
use codelet::config::loader::load_config;
use codelet::config::CodeletConfig;
use codelet::error::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    init_logging(cli.global_opts.verbose);

    // Configuration is file + flag/env overrides; `init` runs without one
    let config_path = cli.global_opts.config.clone();
    let overrides = cli.overrides();
    let load = || -> Result<CodeletConfig> {
        let mut config = load_config(config_path.as_deref())?;
        config.apply(&overrides);
        Ok(config)
    };
    let format = cli.global_opts.format;

    // Dispatch to subcommand handler
    match cli.command {
        Commands::Serve(_) => {
            commands::serve(load()?).await?;
        }
        Commands::Exec(args) => {
            commands::exec(args, load()?, format).await?;
        }
        Commands::Init(args) => {
            commands::init(args, config_path.as_deref()).await?;
        }
        Commands::Config(args) => {
            commands::config(args, load()?, config_path.as_deref()).await?;
        }
    }

    Ok(())
}

fn init_logging(verbosity: u8) {
    use tracing_subscriber::EnvFilter;

    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
