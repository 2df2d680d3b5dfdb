use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use fitsync_cli::cli::{commands, init_tracing, CliConfig};

#[derive(Parser)]
#[command(name = "fitsync")]
#[command(about = "Live messaging, unread counts and achievements for trainers and clients")]
struct Cli {
    /// Pretty-print JSON output
    #[arg(long, short, global = true)]
    pretty: bool,

    /// Debug logging to stderr (FITSYNC_LOG overrides)
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Path to JSON config file (backend, identity, sync tunables)
    #[arg(long, short = 'c', global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open a conversation; lines typed on stdin are sent
    Chat {
        /// Conversation ID
        conversation_id: String,
    },

    /// Print the unread message count
    Unread {
        /// Keep running and print every change
        #[arg(long, short)]
        follow: bool,
    },

    /// Look for newly granted achievements
    Achievements {
        /// Ask the backend to evaluate achievements first
        #[arg(long, short)]
        evaluate: bool,
    },

    /// Run a scripted session against an in-memory backend
    Demo,

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    init_tracing(cli.verbose)?;
    let config = CliConfig::resolve(cli.config.as_deref())?;

    match cli.command {
        Commands::Chat { conversation_id } => {
            let core = commands::connect(&config).await?;
            commands::run_chat(core, &conversation_id).await
        }
        Commands::Unread { follow } => {
            let core = commands::connect(&config).await?;
            commands::run_unread(core, follow, cli.pretty).await
        }
        Commands::Achievements { evaluate } => {
            let core = commands::connect(&config).await?;
            commands::run_achievements(core, evaluate, cli.pretty, &config.sync).await
        }
        Commands::Demo => commands::run_demo(config.sync).await,
        Commands::Config => {
            println!("{}", config.to_json()?);
            Ok(())
        }
    }
}
