use clap::{Parser, Subcommand};

use synapse::commands::settings::Settings;

#[derive(Parser)]
#[command(name = "synapse")]
#[command(about = "Peer-to-peer LAN file transfer", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a file or directory to peers on the local network
    Send {
        /// Path to the file or directory to send
        path: String,
    },
    /// Discover senders and receive a file or directory
    Receive {
        /// Peer address (host:port); skips discovery when given
        address: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Configure logging based on verbose flag
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    let settings = Settings::load();

    let result = match cli.command {
        Commands::Send { path } => synapse::commands::send::run(&path, &settings).await,
        Commands::Receive { address } => {
            synapse::commands::receive::run(address, &settings).await
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
