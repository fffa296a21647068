//! moleval CLI: evaluate every checkpoint of a generative molecular model
//! exactly once and inspect the resulting metrics.

mod commands;

use clap::Parser;
use moleval_core::Device;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// moleval: checkpoint-driven evaluation of generative molecular models
#[derive(Parser, Debug)]
#[command(name = "moleval", version, about, long_about = None)]
struct Cli {
    /// Workspace directory (relative config paths resolve against it)
    #[arg(short, long, global = true, default_value = ".")]
    workspace: PathBuf,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Compute device: cpu, cuda, cuda:N
    #[arg(long, global = true)]
    device: Option<Device>,

    /// Parallel jobs handed to the metrics library
    #[arg(short, long, global = true)]
    jobs: Option<usize>,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only print errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// List evaluable checkpoints and whether their metrics exist
    Discover,
    /// Evaluate a single checkpoint
    Evaluate {
        /// Model directory name
        #[arg(short, long)]
        model: String,
        /// Checkpoint index
        #[arg(long)]
        checkpoint: u64,
        /// Replace an existing metrics artifact
        #[arg(long)]
        overwrite: bool,
    },
    /// Evaluate every checkpoint that has no metrics yet
    Run {
        /// Restrict to these models (repeatable)
        #[arg(short, long)]
        model: Vec<String>,
        /// Record failures and keep going instead of stopping
        #[arg(long)]
        continue_on_error: bool,
    },
    /// Tabulate all persisted metrics
    Summary {
        /// Also write the table as CSV
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Check the Python interpreter and required packages
    Doctor,
}

#[derive(clap::Subcommand, Debug)]
enum ConfigAction {
    /// Write a default .moleval/config.toml
    Init,
    /// Print the merged configuration
    Show,
}

/// Settings given on the command line that win over every config layer.
#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Overrides {
    pub config: Option<PathBuf>,
    pub device: Option<Device>,
    pub jobs: Option<usize>,
}

fn stderr_filter(verbose: u8, quiet: bool) -> &'static str {
    match verbose {
        0 if quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Human-readable layer for stderr
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(stderr_filter(cli.verbose, cli.quiet)));

    // JSON file layer for structured logging
    let log_dir = directories::ProjectDirs::from("dev", "moleval", "moleval")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "moleval.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let overrides = Overrides {
        config: cli.config,
        device: cli.device,
        jobs: cli.jobs,
    };

    commands::handle_command(cli.command, &workspace, &overrides).await
}
