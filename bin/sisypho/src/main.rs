mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "sisypho")]
#[command(about = "Desktop and browser automation runtime", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the configured backends and list their tools
    Tools,

    /// Call one capability through the backend registry
    Call {
        /// Tool name
        tool: String,
        /// JSON arguments (e.g. '{"app_name":"Notes"}')
        #[arg(long)]
        args: Option<String>,
        /// Route to this backend instead of resolving by tool name
        #[arg(long)]
        backend: Option<String>,
    },

    /// Execute a skill payload
    Run {
        /// Encrypted payload file (or plain source with --plain)
        skill: PathBuf,
        /// JSON object of keyword parameters for `run`
        #[arg(long)]
        params: Option<String>,
        /// Treat an undecryptable payload or a `false` result as failure
        #[arg(long)]
        stop_on_failure: bool,
        /// Deadline in milliseconds (overrides config skills.timeoutMs)
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// The file holds plain skill source
        #[arg(long)]
        plain: bool,
    },

    /// Seal skill source into a payload for the current time
    Encrypt {
        /// Skill source file
        source: PathBuf,
        /// Unix timestamp to seal for (defaults to now)
        #[arg(long)]
        timestamp: Option<i64>,
    },

    /// Record desktop and browser interactions until Ctrl-C
    Record {
        /// Output directory (defaults to a timestamped folder under recordings/)
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Acquire a browser session and print its health
    BrowserStatus,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    // stdout carries command output, logs go to stderr
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match cli.command {
        Commands::Tools => {
            commands::tools_cmd::run().await?;
        }
        Commands::Call { tool, args, backend } => {
            commands::call_cmd::run(&tool, args.as_deref(), backend.as_deref()).await?;
        }
        Commands::Run {
            skill,
            params,
            stop_on_failure,
            timeout_ms,
            plain,
        } => {
            commands::run_cmd::run(&skill, params.as_deref(), stop_on_failure, timeout_ms, plain).await?;
        }
        Commands::Encrypt { source, timestamp } => {
            commands::encrypt_cmd::run(&source, timestamp).await?;
        }
        Commands::Record { output_dir } => {
            commands::record_cmd::run(output_dir).await?;
        }
        Commands::BrowserStatus => {
            commands::browser_cmd::status().await?;
        }
    }

    Ok(())
}
