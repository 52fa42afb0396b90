mod cmd;
mod output;
mod session;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use crossbuild_lib::shell::Shell;
use tracing_subscriber::EnvFilter;

use crate::output::print_error;

/// Cross-build a Cargo project for several target platforms
#[derive(Parser)]
#[command(name = "xb", author, version, about, long_about = None)]
struct Cli {
  /// Enable debug logging
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Configuration file (default: ./crossbuild.toml or $CROSSBUILD_CONFIG)
  #[arg(long, global = true, value_name = "PATH")]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Show the host platform and store location
  Info,

  /// Show the resolved target matrix
  Targets {
    #[arg(long)]
    json: bool,
  },

  /// Print the cross-compilation environment as a shell script
  Env {
    /// Shell to generate the script for (auto-detected if not specified)
    #[arg(short, long)]
    shell: Option<Shell>,

    #[arg(long)]
    json: bool,
  },

  /// Populate or reuse the vendor directory for the project's lock files
  Vendor {
    #[arg(long)]
    json: bool,
  },

  /// Build the project for every target of the matrix
  Build {
    /// Only build these targets (repeatable)
    #[arg(short, long = "target", value_name = "ID")]
    targets: Vec<String>,

    /// Maximum number of targets built at once
    #[arg(short, long)]
    jobs: Option<usize>,

    #[arg(long)]
    json: bool,
  },
}

fn init_tracing(verbose: bool) {
  let filter = if verbose {
    EnvFilter::new("debug")
  } else {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
  };
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();
}

fn main() -> ExitCode {
  let cli = Cli::parse();
  init_tracing(cli.verbose);

  let config = cli.config.as_deref();
  let result = match cli.command {
    Commands::Info => cmd::cmd_info(config),
    Commands::Targets { json } => cmd::cmd_targets(config, json),
    Commands::Env { shell, json } => cmd::cmd_env(config, shell, json),
    Commands::Vendor { json } => cmd::cmd_vendor(config, json),
    Commands::Build { targets, jobs, json } => cmd::cmd_build(config, &targets, jobs, json),
  };

  match result {
    Ok(()) => ExitCode::SUCCESS,
    Err(e) => {
      print_error(&format!("{:#}", e));
      ExitCode::FAILURE
    }
  }
}
