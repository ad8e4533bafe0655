//! Dalec CLI entry point

use clap::{CommandFactory, Parser};
use console::style;
use dalec::cli::{commands, Cli, Commands};
use dalec::config::{Config, ConfigManager};
use dalec::error::DalecResult;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::FAILURE
        }
    }
}

fn init_logging(verbose: u8, config: &Config) {
    // 0 = warn (spinners only), 1 = info, 2+ = debug
    let level = match (verbose, config.general.verbose) {
        (0, false) => "warn",
        (0, true) | (1, _) => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_env("DALEC_LOG").unwrap_or_else(|_| EnvFilter::new(format!("dalec={}", level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if config.general.log_format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}

async fn run() -> DalecResult<()> {
    let cli = Cli::parse();

    if let Commands::Completions { shell } = cli.command {
        clap_complete::generate(shell, &mut Cli::command(), "dalec", &mut std::io::stdout());
        return Ok(());
    }

    let manager = match cli.config {
        Some(ref path) => ConfigManager::with_path(path.clone()),
        None => ConfigManager::new(),
    };
    let config = manager.load().await?;
    init_logging(cli.verbose, &config);

    match cli.command {
        Commands::Completions { .. } => Ok(()),
        Commands::Validate(args) => commands::validate(args).await,
        Commands::Deps(args) => commands::deps(args, &config).await,
        Commands::Build(args) => commands::build(args, &config).await,
        Commands::Repo(args) => commands::repo(args, &config).await,
        Commands::Resolve(args) => commands::resolve(args).await,
        Commands::Targets { format } => commands::targets(format, &config).await,
        Commands::Cache(args) => commands::cache(args, &config).await,
        Commands::Config(args) => commands::config(args, &manager, &config).await,
    }
}
