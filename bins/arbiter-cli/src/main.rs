mod commands;

use anyhow::Result;
use arbiter_common::config::Settings;
use arbiter_common::types::SubmissionMode;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "arbiter-cli")]
#[command(about = "Arbiter CLI - Inspect languages and challenges, queue and track submissions", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List languages configured in languages.json
    ListLangs {
        /// Path to languages.json (defaults to ARBITER_LANGUAGES_FILE)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Validate a challenge file, or every challenge in a directory
    ValidateChallenge {
        #[arg(short, long)]
        path: PathBuf,
    },

    /// Show which harness style a source file would be judged with
    Detect {
        /// Language name (e.g., python, javascript, cpp)
        #[arg(short, long)]
        lang: String,

        /// Challenge function name
        #[arg(short, long, default_value = "solve")]
        function: String,

        /// Source file
        #[arg(long)]
        file: PathBuf,

        /// Print the generated entry program
        #[arg(long, default_value = "false")]
        show_entry: bool,
    },

    /// Queue a submission
    Enqueue {
        #[arg(short, long)]
        user: String,

        #[arg(short, long)]
        challenge: String,

        #[arg(short, long)]
        lang: String,

        /// Source file
        #[arg(long)]
        file: PathBuf,

        /// test_run or submit
        #[arg(short, long, default_value = "submit")]
        mode: SubmissionMode,
    },

    /// Show a submission's status
    Status {
        /// Submission id
        id: String,

        /// View as this user (owners see per-test results)
        #[arg(short, long)]
        user: Option<String>,

        /// View as admin
        #[arg(long, default_value = "false")]
        admin: bool,

        /// Poll until the submission finishes
        #[arg(short, long, default_value = "false")]
        wait: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::ListLangs { config } => {
            let path = match config {
                Some(path) => path,
                None => Settings::from_env()?.languages_file,
            };
            commands::list_languages(&path)?;
        }
        Commands::ValidateChallenge { path } => {
            commands::validate_challenge(&path)?;
        }
        Commands::Detect {
            lang,
            function,
            file,
            show_entry,
        } => {
            commands::detect(&lang, &function, &file, show_entry)?;
        }
        Commands::Enqueue {
            user,
            challenge,
            lang,
            file,
            mode,
        } => {
            let settings = Settings::from_env()?;
            commands::enqueue(
                &settings,
                commands::EnqueueArgs {
                    user: &user,
                    challenge: &challenge,
                    language: &lang,
                    file: &file,
                    mode,
                },
            )
            .await?;
        }
        Commands::Status { id, user, admin, wait } => {
            let settings = Settings::from_env()?;
            commands::status(&settings, &id, user.as_deref(), admin, wait).await?;
        }
    }

    Ok(())
}
