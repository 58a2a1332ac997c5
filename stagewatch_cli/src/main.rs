mod commands;
mod ui;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "stagewatch")]
#[command(about = "In-process metrics, SLO and trace-continuity service for staged pipelines", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP surface until Ctrl-C
    Serve {
        /// Path to config file (YAML, TOML, or JSON)
        #[arg(short, long, env = "STAGEWATCH_CONFIG")]
        config: Option<PathBuf>,

        /// Override the configured listen port
        #[arg(short, long, env = "STAGEWATCH_PORT")]
        port: Option<u16>,
    },

    /// Validate a config file and print what it declares
    Validate {
        /// Path to config file
        config_file: PathBuf,
    },
}

fn init_logging(verbose: bool, quiet: bool, format: LogFormat) {
    let default_level = if verbose {
        "debug"
    } else if quiet {
        "error"
    } else {
        "info"
    };
    // RUST_LOG takes precedence over the flags.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet, cli.log_format);

    match cli.command {
        Commands::Serve { config, port } => {
            commands::serve::execute(config, port).await?;
        }

        Commands::Validate { config_file } => {
            commands::validate::execute(config_file).await?;
        }
    }

    Ok(())
}
