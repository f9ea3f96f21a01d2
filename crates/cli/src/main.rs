mod cmd;
mod output;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use crate::cmd::{BuildArgs, cmd_build, cmd_targets};
use crate::output::{OutputFormat, print_error};

/// kiln - build orchestration with dynamic dependencies
#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable debug logging (overrides RUST_LOG)
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Repository root
  #[arg(long, global = true, default_value = ".")]
  root: PathBuf,

  /// Configuration file (default: <root>/.kiln.toml)
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  /// Output format
  #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
  output: OutputFormat,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Build targets and everything they depend on
  Build {
    /// Labels to build, e.g. //app:bin or //lib:all
    #[arg(required = true)]
    labels: Vec<String>,

    /// Number of targets to build at once
    #[arg(short, long)]
    jobs: Option<usize>,

    /// Stop starting new work after the first failure
    #[arg(long)]
    fail_fast: bool,
  },

  /// Parse packages and list the targets they declare
  Targets {
    /// Package paths, e.g. //app or lib/util
    #[arg(required = true)]
    packages: Vec<String>,
  },
}

fn main() -> ExitCode {
  let cli = Cli::parse();

  let filter = if cli.verbose {
    EnvFilter::new("debug")
  } else {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
  };
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  let result = match cli.command {
    Commands::Build {
      labels,
      jobs,
      fail_fast,
    } => cmd_build(
      &cli.root,
      cli.config.as_deref(),
      BuildArgs {
        labels,
        jobs,
        fail_fast,
      },
      cli.output,
    ),
    Commands::Targets { packages } => cmd_targets(&cli.root, cli.config.as_deref(), &packages, cli.output),
  };

  match result {
    Ok(true) => ExitCode::SUCCESS,
    Ok(false) => ExitCode::FAILURE,
    Err(err) => {
      print_error(&format!("{:#}", err));
      ExitCode::FAILURE
    }
  }
}
