mod modules;

use clap::{Parser, Subcommand};
use std::error::Error;

const GIT_VERSION: &str =
    git_version::git_version!(args = ["--tags", "--always", "--dirty=-modified"]);

#[derive(Parser)]
#[command(author, version = GIT_VERSION, about, long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Sub command
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// run the node's mount service: consume the broker queue, supervise
    /// mounted processes, and reconcile on the configured interval.
    Serve {
        /// overrides DMS_NODE_ID for this run.
        #[arg(long)]
        node_id: Option<String>,
    },
    /// run a single reconciliation pass and exit.
    Reconcile {
        /// overrides DMS_NODE_ID for this run.
        #[arg(long)]
        node_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Cli::parse();

    let level = if args.debug {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };

    simple_logger::SimpleLogger::new()
        .with_utc_timestamps()
        .with_level(level)
        .init()
        .unwrap();

    let mut config = dms::config::Config::from_env();

    let result = match args.command {
        Commands::Serve { node_id } => {
            if let Some(node_id) = node_id {
                config.node_id = node_id;
            }
            modules::serve::run(config).await
        }
        Commands::Reconcile { node_id } => {
            if let Some(node_id) = node_id {
                config.node_id = node_id;
            }
            modules::reconcile::run(config).await
        }
    };

    if let Err(err) = result {
        log::error!("{:#}", err);
        std::process::exit(1);
    }

    Ok(())
}
