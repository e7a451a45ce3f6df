//! dockvm CLI entry point.

use clap::{Parser, Subcommand, ValueEnum};
use dockvm::DockvmConfig;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cli;

/// dockvm - supervisor for a QEMU VM hosting a Docker Engine
#[derive(Parser, Debug)]
#[command(name = "dockvm")]
#[command(about = "Supervisor for a QEMU VM hosting a Docker Engine")]
#[command(version)]
struct Cli {
    /// Enable debug logging (or set RUST_LOG=dockvm=debug)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Use this configuration file instead of the default one
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Prepare disk, boot media and machine profile.
    Init(cli::init::InitCmd),

    /// Run the VM in the foreground.
    Run(cli::run::RunCmd),

    /// Start the HTTP API server.
    Serve(cli::serve::ServeCmd),

    /// Run a command in the running VM.
    Exec(cli::exec::ExecCmd),

    /// Print the VM command line.
    Args(cli::args::ArgsCmd),

    /// Manage configuration.
    #[command(subcommand)]
    Config(cli::config::ConfigCmd),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn main() {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_format);

    tracing::debug!(version = dockvm::VERSION, "starting dockvm");

    let config_path = match cli.config.clone().map_or_else(DockvmConfig::config_path, Ok) {
        Ok(path) => path,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    let mut config = match DockvmConfig::load_from(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            DockvmConfig::default()
        }
    };

    let result = match cli.command {
        Commands::Init(cmd) => cmd.run(&mut config, &config_path),
        Commands::Run(cmd) => cmd.run(&config),
        Commands::Serve(cmd) => cmd.run(&config),
        Commands::Exec(cmd) => cmd.run(&config),
        Commands::Args(cmd) => cmd.run(&config),
        Commands::Config(cmd) => cmd.run(&mut config, &config_path),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber. Logs go to stderr.
fn init_logging(verbose: bool, format: LogFormat) {
    let default = if verbose { "dockvm=debug" } else { "dockvm=warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    match format {
        LogFormat::Text => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init(),
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init(),
    }
}
