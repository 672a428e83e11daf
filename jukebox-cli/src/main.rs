//! LAN Jukebox - Command Line Front End
//!
//! Usage:
//!   jukebox play <url>                  # Play one URL locally
//!   jukebox host [--port 7685] [urls]   # Share a queue on the LAN
//!   jukebox join <address>              # Follow someone else's queue
//!   jukebox search <query>              # List matches

mod commands;
mod display;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use jukebox_core::{logging, JukeboxConfig};

#[derive(Parser)]
#[command(name = "jukebox", version, about = "Shared audio queue for your LAN")]
struct Cli {
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Media engine executable
    #[arg(long, global = true, env = "JUKEBOX_ENGINE")]
    engine: Option<PathBuf>,

    /// Search and stream resolver executable
    #[arg(long, global = true, env = "JUKEBOX_RESOLVER")]
    resolver: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a URL directly
    Play { url: String },

    /// Host a shared queue on the LAN
    Host {
        /// Port to listen on
        #[arg(short, long, env = "JUKEBOX_PORT")]
        port: Option<u16>,
        /// URLs to queue up front
        urls: Vec<String>,
    },

    /// Join a shared queue on the LAN
    Join {
        /// Host name or IP of the machine hosting
        address: String,
        /// Port to connect to
        #[arg(short, long, env = "JUKEBOX_PORT")]
        port: Option<u16>,
    },

    /// Search and print matches
    Search {
        #[arg(required = true)]
        query: Vec<String>,
        /// How many results
        #[arg(short, long, default_value_t = 10)]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let mut config = JukeboxConfig::from_env();
    if let Some(engine) = cli.engine {
        config.engine.program = engine;
    }
    if let Some(resolver) = cli.resolver {
        config.resolver = resolver;
    }

    match cli.command {
        Commands::Play { url } => commands::play(config, url).await,
        Commands::Host { port, urls } => {
            if let Some(port) = port {
                config.port = port;
            }
            commands::host(config, urls).await
        }
        Commands::Join { address, port } => {
            if let Some(port) = port {
                config.port = port;
            }
            commands::join(config, address).await
        }
        Commands::Search { query, count } => commands::search(config, query.join(" "), count).await,
    }
}
