//! examsession CLI — take timed tests from a terminal.

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(name = "examsession", version, about = "Timed, auto-saving exam sessions")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Take a test interactively
    Take {
        /// Path to a .toml test definition, or a test id in the tests directory
        #[arg(long)]
        test: String,

        /// Resume an existing attempt instead of starting one
        #[arg(long)]
        resume: Option<String>,

        /// User id (defaults to the config's user_id, then a generated guest id)
        #[arg(long)]
        user: Option<String>,

        /// Run against an in-memory attempt API instead of the server
        #[arg(long)]
        offline: bool,

        /// Directory for the result JSON (defaults to the config's results_dir)
        #[arg(long)]
        output: Option<PathBuf>,

        /// Config file path
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Validate test definition TOML files
    Validate {
        /// Path to a test definition file or directory
        #[arg(long)]
        test: PathBuf,
    },

    /// Show a saved result
    Summary {
        /// Result JSON written by `take`
        #[arg(long)]
        result: PathBuf,
    },

    /// Create starter config and example test definition
    Init,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("examsession=info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Take {
            test,
            resume,
            user,
            offline,
            output,
            config,
        } => {
            commands::take::execute(commands::take::TakeArgs {
                test,
                resume,
                user,
                offline,
                output,
                config,
            })
            .await
        }
        Commands::Validate { test } => commands::validate::execute(test),
        Commands::Summary { result } => commands::summary::execute(result),
        Commands::Init => commands::init::execute(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}
