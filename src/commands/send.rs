use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use log::debug;
use tokio_util::sync::CancellationToken;

use crate::commands::history::{self, HistoryEntry};
use crate::commands::settings::Settings;
use crate::error::{Result, TransferError};
use crate::events::{Direction, EventSink, Progress};
use crate::sender::{self, SenderOptions};

/// Function handler to kick off sender logic:
///     - Validate the input path
///     - Archive directories and open a TLS listener
///     - Announce the session on the local service directory
///     - Prompt for approval on every incoming connection
///     - Serve receivers until Ctrl+C
pub async fn run(file_path: &str, settings: &Settings) -> Result<()> {
    let input = Path::new(file_path);
    if !input.exists() {
        return Err(TransferError::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("path does not exist: {file_path}"),
        )));
    }

    println!("Preparing to send '{file_path}'...");

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nStopping sender...");
            ctrl_c_cancel.cancel();
        }
    });

    let sink = Arc::new(SendSink::new(settings.auto_accept));
    let opts = SenderOptions {
        device_name: settings.device_name.clone(),
        port: settings.port,
        events: sink,
        cancel,
        advertise: true,
    };

    println!("Waiting for receivers to connect... (Press Ctrl+C to stop)");
    sender::start_sender(input, opts, None).await
}

/// Event sink for the terminal: one progress bar per connected
/// receiver, approval prompts on stdin, history entries on completion.
struct SendSink {
    auto_accept: bool,
    bars: MultiProgress,
    active: Mutex<HashMap<SocketAddr, ProgressBar>>,
}

impl SendSink {
    fn new(auto_accept: bool) -> Self {
        Self {
            auto_accept,
            bars: MultiProgress::new(),
            active: Mutex::new(HashMap::new()),
        }
    }

    fn bar_for(&self, peer: SocketAddr, total: u64) -> ProgressBar {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active
            .entry(peer)
            .or_insert_with(|| {
                let bar = self.bars.add(ProgressBar::new(total));
                bar.set_style(
                    ProgressStyle::default_bar()
                        .template("{msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")
                        .unwrap_or_else(|_| ProgressStyle::default_bar()),
                );
                bar.set_message(format!("sending to {peer}"));
                bar
            })
            .clone()
    }

    fn take_bar(&self, peer: SocketAddr) -> Option<ProgressBar> {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&peer)
    }
}

impl EventSink for SendSink {
    fn on_progress(&self, progress: &Progress) {
        let bar = self.bar_for(progress.peer_addr, progress.total_bytes);
        bar.set_position(progress.bytes_transferred);
    }

    fn on_complete(&self, file_name: &str, peer_addr: SocketAddr, direction: Direction) {
        if let Some(bar) = self.take_bar(peer_addr) {
            bar.finish_with_message(format!("sent to {peer_addr}"));
        }
        println!("Transfer to {peer_addr} completed");
        if let Err(e) = history::append(HistoryEntry::completed(
            file_name,
            direction.as_str(),
            peer_addr.to_string(),
        )) {
            debug!("failed to record history entry: {e}");
        }
    }

    fn on_error(&self, error: &TransferError, peer_addr: SocketAddr, direction: Direction) {
        if let Some(bar) = self.take_bar(peer_addr) {
            bar.abandon();
        }
        eprintln!("Transfer to {peer_addr} failed: {error}");
        if let Err(e) = history::append(HistoryEntry::failed(
            "",
            direction.as_str(),
            peer_addr.to_string(),
            error.to_string(),
        )) {
            debug!("failed to record history entry: {e}");
        }
    }

    fn approve_connection(&self, peer_addr: SocketAddr) -> bool {
        if self.auto_accept {
            println!("Auto-accepted connection from {peer_addr}");
            return true;
        }
        print!("Incoming connection from {peer_addr}. Accept? (y/n): ");
        let _ = std::io::stdout().flush();
        let mut response = String::new();
        if std::io::stdin().read_line(&mut response).is_err() {
            return false;
        }
        response.trim().eq_ignore_ascii_case("y")
    }
}
