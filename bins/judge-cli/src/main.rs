mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "judge-cli")]
#[command(about = "Judge CLI - Run submissions locally, inspect backends, talk to the job queue", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a submission file locally and print the verdict
    Run {
        /// Submission JSON: {"code", "language", "testCases", "limits"?}
        #[arg(short, long)]
        file: PathBuf,

        /// Language configuration (built-in defaults when the file is missing)
        #[arg(short, long, default_value = judge_common::config::DEFAULT_LANGUAGES_CONFIG)]
        languages: PathBuf,
    },

    /// List configured language backends
    Langs {
        /// Run a trivial solution through every backend
        #[arg(long, default_value = "false")]
        probe: bool,

        /// Language configuration (built-in defaults when the file is missing)
        #[arg(short, long, default_value = judge_common::config::DEFAULT_LANGUAGES_CONFIG)]
        languages: PathBuf,
    },

    /// Push a submission onto the Redis job queue
    Submit {
        /// Job JSON: {"challengeId"?, "code", "language", "testCases", "limits"?}
        #[arg(short, long)]
        file: PathBuf,

        /// Wait for the worker's result and print it
        #[arg(long, default_value = "false")]
        wait: bool,

        /// Redis URL (defaults to $REDIS_URL, then localhost)
        #[arg(long)]
        redis_url: Option<String>,
    },

    /// Show aggregated statistics for a challenge
    Stats {
        /// Challenge identifier
        #[arg(short, long)]
        challenge: String,

        /// Redis URL (defaults to $REDIS_URL, then localhost)
        #[arg(long)]
        redis_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so verdict JSON on stdout stays machine-readable
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { file, languages } => {
            let all_passed = commands::run_submission(&file, &languages).await?;
            if !all_passed {
                std::process::exit(1);
            }
        }
        Commands::Langs { probe, languages } => {
            commands::list_languages(&languages, probe).await?;
        }
        Commands::Submit { file, wait, redis_url } => {
            commands::submit_job(&file, wait, redis_url.as_deref()).await?;
        }
        Commands::Stats { challenge, redis_url } => {
            commands::show_stats(&challenge, redis_url.as_deref()).await?;
        }
    }

    Ok(())
}
