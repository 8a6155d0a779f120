// src/cli.rs
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect the workout session engine's local state", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the cached per-exercise history
    History {
        /// Only show this exercise (accent and case insensitive)
        #[arg(short, long)]
        exercise: Option<String>,
        /// Show the history recorded locally by finished sessions instead
        #[arg(long)]
        local: bool,
    },
    /// Rebuild the history cache from the server
    RefreshHistory,
    /// Suggest a deload for an exercise from the cached history
    Deload {
        /// Name of the exercise
        exercise: String,
        /// Weight recommended by the coach, used when no history exists
        #[arg(long, value_name = "KG")]
        ai_weight: Option<f64>,
        /// Free-text coach recommendation, e.g. "Try 60 kg for 8 reps"
        #[arg(long, value_name = "TEXT", conflicts_with = "ai_weight")]
        ai_note: Option<String>,
        /// Override the reduction percentage (e.g. 15)
        #[arg(long, value_name = "PCT", conflicts_with = "weight")]
        percent: Option<f64>,
        /// Override the suggested weight
        #[arg(long)]
        weight: Option<f64>,
    },
    /// List finished sessions waiting to be delivered
    Queue {
        /// Report the device as offline in the summary
        #[arg(long)]
        offline: bool,
    },
    /// Deliver queued sessions to the server
    Sync {
        /// Ignore backoff and retry failed jobs too
        #[arg(short, long)]
        force: bool,
    },
    /// Make a queued job due immediately with a fresh attempt budget
    BumpJob {
        /// ID of the queued job
        id: String,
    },
    /// Set the server URL (and optionally the API token)
    SetServer {
        url: String,
        #[arg(short, long)]
        token: Option<String>,
    },
    /// Show the path to the config file
    ConfigPath,
    /// Show the path to the database file
    DbPath,
    /// Generate shell completion scripts
    GenerateCompletion {
        /// The shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

// Function to parse CLI arguments
pub fn parse_args() -> Cli {
    Cli::parse()
}

pub fn build_cli_command() -> clap::Command {
    Cli::command()
}
