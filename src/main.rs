use clap::{Parser, Subcommand};
use std::path::PathBuf;

use map_relay::config::{self, Config};
use map_relay::errors::AppResult;
use map_relay::history::{JsonFileStore, UploadHistory};
use map_relay::relay;
use map_relay::uploader::{self, RelayClient, UploadStrategy};

#[derive(Parser)]
#[command(name = "map-relay", version, about = "Relay map files to the Facepunch upload API")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the relay endpoint
    Serve {
        /// Address to listen on, overriding the config file
        #[arg(long)]
        listen: Option<String>,
    },
    /// Upload a map file through the relay
    Upload {
        /// Path to the map file
        file: PathBuf,
        /// Send the file as sequential 512 KiB chunks
        #[arg(long)]
        chunked: bool,
        /// Relay endpoint URL, overriding the config file
        #[arg(long)]
        relay_url: Option<String>,
    },
    /// Inspect the local upload history
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },
}

#[derive(Subcommand)]
enum HistoryAction {
    /// Print all recorded uploads, oldest first
    List,
    /// Delete the history list
    Clear,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match config::load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    env_logger::Builder::from_default_env()
        .filter_level(
            config
                .log_level
                .parse()
                .unwrap_or(log::LevelFilter::Info),
        )
        .init();

    if let Err(e) = run(cli, config).await {
        log::error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli, mut config: Config) -> AppResult<()> {
    match cli.command {
        Command::Serve { listen } => {
            if let Some(listen) = listen {
                config.listen_addr = listen;
            }
            config::validate_config(&config)?;

            log::info!("Starting map relay");
            relay::serve(&config).await
        }
        Command::Upload {
            file,
            chunked,
            relay_url,
        } => {
            let relay_url = relay_url.unwrap_or_else(|| config.relay_url.clone());
            let client = RelayClient::with_chunk_size(relay_url, config.chunk_size_bytes);
            let history = UploadHistory::new(JsonFileStore::open_default()?);
            let progress = uploader::new_progress();

            let strategy = if chunked {
                UploadStrategy::Chunked
            } else {
                UploadStrategy::Whole
            };

            let url = uploader::upload_file(&client, &history, &file, strategy, &progress).await?;
            println!("{}", url);
            Ok(())
        }
        Command::History { action } => {
            let history = UploadHistory::new(JsonFileStore::open_default()?);

            match action {
                HistoryAction::List => {
                    let entries = history.entries()?;
                    if entries.is_empty() {
                        println!("No uploads recorded");
                    }
                    for entry in entries {
                        println!("{}\t{}\t{}", entry.timestamp, entry.name, entry.url);
                    }
                    Ok(())
                }
                HistoryAction::Clear => history.clear(),
            }
        }
    }
}
