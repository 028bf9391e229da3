use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use indicatif::{ProgressBar, ProgressStyle};
use log::debug;

use crate::commands::history::{self, HistoryEntry};
use crate::commands::settings::Settings;
use crate::discovery::{self, Peer};
use crate::error::{Result, TransferError};
use crate::events::{Direction, EventSink, Progress};
use crate::receiver::{self, ReceiverOptions};

/// Function handler to kick off receiver logic:
///     - Scan the local service directory for senders (or take an
///       explicit address and skip discovery)
///     - Let the user pick a peer
///     - Download, verify, and extract into the download directory
pub async fn run(address: Option<String>, settings: &Settings) -> Result<()> {
    let target = match address {
        Some(addr) => addr.parse::<SocketAddr>().map_err(|_| {
            TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid peer address: {addr}"),
            ))
        })?,
        None => {
            println!("Scanning for peers...");
            let peers = discovery::scan_peers(discovery::DEFAULT_BROWSE_TIMEOUT).await?;
            if peers.is_empty() {
                return Err(TransferError::Discovery(
                    "no peers found on the local network".to_string(),
                ));
            }
            let peer = choose_peer(&peers)?;
            peer.socket_addr().ok_or_else(|| {
                TransferError::Discovery(format!(
                    "peer '{}' has no usable address",
                    peer.instance_name
                ))
            })?
        }
    };

    let opts = ReceiverOptions {
        download_dir: settings.download_dir.clone(),
        events: Arc::new(ReceiveSink::new()),
    };
    let path = receiver::connect_and_receive(target, &opts).await?;
    println!("Saved to {}", path.display());
    Ok(())
}

fn choose_peer(peers: &[Peer]) -> Result<&Peer> {
    for (index, peer) in peers.iter().enumerate() {
        let endpoint = peer
            .socket_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|| "no address".to_string());
        println!("  [{}] {} ({endpoint})", index + 1, peer.instance_name);
    }

    loop {
        print!("Select a peer [1-{}]: ", peers.len());
        let _ = std::io::stdout().flush();
        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        match input.trim().parse::<usize>() {
            Ok(choice) if (1..=peers.len()).contains(&choice) => {
                return Ok(&peers[choice - 1]);
            }
            _ => println!("Please enter a number between 1 and {}.", peers.len()),
        }
    }
}

/// Terminal sink for a single receive session: one progress bar plus a
/// history entry at the end.
struct ReceiveSink {
    bar: Mutex<Option<ProgressBar>>,
}

impl ReceiveSink {
    fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }
}

impl EventSink for ReceiveSink {
    fn on_progress(&self, progress: &Progress) {
        let mut slot = self.bar.lock().unwrap_or_else(|e| e.into_inner());
        let bar = slot.get_or_insert_with(|| {
            let bar = ProgressBar::new(progress.total_bytes);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
            bar.set_message(format!("receiving {}", progress.file_name));
            bar
        });
        bar.set_position(progress.bytes_transferred);
    }

    fn on_complete(&self, file_name: &str, peer_addr: SocketAddr, direction: Direction) {
        if let Some(bar) = self
            .bar
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            bar.finish_with_message("download complete");
        }
        if let Err(e) = history::append(HistoryEntry::completed(
            file_name,
            direction.as_str(),
            peer_addr.to_string(),
        )) {
            debug!("failed to record history entry: {e}");
        }
    }

    fn on_error(&self, error: &TransferError, peer_addr: SocketAddr, direction: Direction) {
        if let Some(bar) = self
            .bar
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            bar.abandon();
        }
        eprintln!("Transfer from {peer_addr} failed: {error}");
        if let Err(e) = history::append(HistoryEntry::failed(
            "",
            direction.as_str(),
            peer_addr.to_string(),
            error.to_string(),
        )) {
            debug!("failed to record history entry: {e}");
        }
    }
}
