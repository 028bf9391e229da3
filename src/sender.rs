//! Sender engine: prepare a source, listen over TLS, advertise, and
//! serve any number of receivers concurrently.
//!
//! Each accepted connection runs in its own handler task. Handlers
//! share nothing mutable; every one opens its own read-only cursor
//! into the source, so a directory archive is materialized exactly
//! once per session and reused by all receivers.

use std::io::{self, SeekFrom};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use log::{debug, error, info, warn};
use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::compression::{self, ContentEncoder};
use crate::cryptography;
use crate::discovery;
use crate::error::{Result, TransferError};
use crate::events::{Direction, EventSink, Progress};
use crate::protocol::{self, ChunkedWriter, Compression, FileHeader, TransferRequest};
use crate::utils;
use crate::COPY_BUFFER_SIZE;

/// How long [`spawn_sender`] waits for the engine to report its bound
/// port before giving up.
pub const PORT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

// One sender session per process.
static SESSION_ACTIVE: StdMutex<bool> = StdMutex::new(false);

struct SessionGuard;

impl SessionGuard {
    fn acquire() -> Result<Self> {
        let mut active = SESSION_ACTIVE.lock().unwrap_or_else(|e| e.into_inner());
        if *active {
            return Err(TransferError::SessionActive);
        }
        *active = true;
        Ok(SessionGuard)
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        *SESSION_ACTIVE.lock().unwrap_or_else(|e| e.into_inner()) = false;
    }
}

pub struct SenderOptions {
    /// Feeds the discovery instance name.
    pub device_name: String,
    /// Listener port hint; 0 lets the OS choose.
    pub port: u16,
    pub events: Arc<dyn EventSink>,
    /// Cancelling stops the accept loop; in-flight handlers finish.
    pub cancel: CancellationToken,
    /// Whether to publish the session on the service directory.
    pub advertise: bool,
}

impl SenderOptions {
    pub fn new(device_name: impl Into<String>, events: Arc<dyn EventSink>) -> Self {
        Self {
            device_name: device_name.into(),
            port: 0,
            events,
            cancel: CancellationToken::new(),
            advertise: true,
        }
    }
}

/// What a session serves. `size` and the backing bytes are fixed for
/// the whole session; the temp archive (if any) lives exactly as long
/// as this value.
struct Source {
    name: String,
    size: u64,
    is_archive: bool,
    path: PathBuf,
    _archive: Option<TempPath>,
}

async fn prepare_source(input: &Path) -> Result<Source> {
    let metadata = tokio::fs::metadata(input).await?;
    let name = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            TransferError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("'{}' has no base name", input.display()),
            ))
        })?;

    if !metadata.is_dir() {
        return Ok(Source {
            name,
            size: metadata.len(),
            is_archive: false,
            path: input.to_path_buf(),
            _archive: None,
        });
    }

    info!("archiving directory '{}'", input.display());
    let dir = input.to_path_buf();
    let temp = tokio::task::spawn_blocking(move || -> Result<TempPath> {
        let temp = tempfile::NamedTempFile::new()?;
        crate::archive::archive_directory(&dir, temp.as_file())?;
        Ok(temp.into_temp_path())
    })
    .await
    .map_err(|e| TransferError::Io(io::Error::other(e)))??;

    let size = tokio::fs::metadata(&temp).await?.len();
    Ok(Source {
        name,
        size,
        is_archive: true,
        path: temp.to_path_buf(),
        _archive: Some(temp),
    })
}

/// Runs a full sender session: prepare, listen, advertise, accept
/// until cancelled, then drain outstanding handlers. The bound port is
/// reported through `port_tx` once the listener is up.
pub async fn start_sender(
    input: &Path,
    opts: SenderOptions,
    port_tx: Option<oneshot::Sender<u16>>,
) -> Result<()> {
    let _session = SessionGuard::acquire()?;

    let source = Arc::new(prepare_source(input).await?);
    info!(
        "serving '{}' ({}{})",
        source.name,
        utils::format_bytes(source.size),
        if source.is_archive { ", archived" } else { "" }
    );

    let acceptor = TlsAcceptor::from(cryptography::server_config()?);
    let listener = TcpListener::bind(("0.0.0.0", opts.port)).await?;
    let port = listener.local_addr()?.port();
    info!("listening on port {port}");
    if let Some(tx) = port_tx {
        let _ = tx.send(port);
    }

    let announcement = if opts.advertise {
        Some(discovery::announce(&opts.device_name, port)?)
    } else {
        None
    };

    // Serializes approval prompts so concurrent handlers cannot
    // interleave them.
    let approval_lock = Arc::new(Mutex::new(()));
    let mut handlers = JoinSet::new();

    loop {
        tokio::select! {
            _ = opts.cancel.cancelled() => {
                info!("stop requested, no longer accepting connections");
                break;
            }
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("accept failed: {e}");
                        continue;
                    }
                };
                debug!("connection from {peer_addr}");
                let acceptor = acceptor.clone();
                let source = Arc::clone(&source);
                let events = Arc::clone(&opts.events);
                let approval_lock = Arc::clone(&approval_lock);
                handlers.spawn(async move {
                    let file_name = source.name.clone();
                    match handle_connection(stream, peer_addr, acceptor, source, &*events, approval_lock).await {
                        Ok(()) => {
                            info!("transfer to {peer_addr} completed");
                            events.on_complete(&file_name, peer_addr, Direction::Send);
                        }
                        Err(TransferError::ApprovalDenied) => {
                            info!("connection from {peer_addr} rejected");
                        }
                        Err(e) => {
                            error!("transfer to {peer_addr} failed: {e}");
                            events.on_error(&e, peer_addr, Direction::Send);
                        }
                    }
                });
            }
        }
    }

    drop(listener);
    if let Some(announcement) = announcement {
        announcement.shutdown();
    }
    while handlers.join_next().await.is_some() {}
    Ok(())
}

async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    acceptor: TlsAcceptor,
    source: Arc<Source>,
    events: &dyn EventSink,
    approval_lock: Arc<Mutex<()>>,
) -> Result<()> {
    let approved = {
        let _prompt = approval_lock.lock().await;
        events.approve_connection(peer_addr)
    };
    if !approved {
        return Err(TransferError::ApprovalDenied);
    }

    let mut stream = acceptor.accept(stream).await?;
    serve_transfer(&mut stream, peer_addr, &source, events).await?;
    let _ = stream.shutdown().await;
    Ok(())
}

/// One transfer over an established connection: header out, request
/// in, content with a hash tee over the source bytes, digest footer.
async fn serve_transfer<S>(
    stream: &mut S,
    peer_addr: SocketAddr,
    source: &Source,
    events: &dyn EventSink,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mode = compression::compression_for(&source.name, source.is_archive);
    let header = FileHeader {
        name: source.name.clone(),
        size: source.size as i64,
        is_archive: source.is_archive,
        compression: mode,
    };
    protocol::write_record(stream, &serde_json::to_vec(&header)?).await?;
    stream.flush().await?;

    let request: TransferRequest =
        serde_json::from_slice(&protocol::read_record(stream).await?)?;
    let offset = match u64::try_from(request.offset) {
        Ok(offset) if offset <= source.size => offset,
        // Out-of-range offsets restart the transfer.
        _ => 0,
    };
    if offset > 0 {
        info!("resuming transfer to {peer_addr} from offset {offset}");
    }

    let mut file = tokio::fs::File::open(&source.path).await?;
    file.seek(SeekFrom::Start(offset)).await?;

    let total = source.size - offset;
    let mut hasher = blake3::Hasher::new();
    let mut sent = 0u64;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    let progress = |sent: u64| Progress {
        bytes_transferred: sent,
        total_bytes: total,
        file_name: source.name.clone(),
        peer_addr,
        direction: Direction::Send,
    };

    if mode == Compression::Zstd {
        let mut encoder = ContentEncoder::new()?;
        let mut chunked = ChunkedWriter::new(&mut *stream);
        let mut remaining = total;
        while remaining > 0 {
            let want = buf.len().min(remaining as usize);
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(TransferError::protocol(
                    "source ended before the advertised size",
                ));
            }
            hasher.update(&buf[..n]);
            let compressed = encoder.compress(&buf[..n])?;
            chunked.write_chunk(&compressed).await?;
            remaining -= n as u64;
            sent += n as u64;
            events.on_progress(&progress(sent));
        }
        let tail = encoder.finish()?;
        chunked.write_chunk(&tail).await?;
        chunked.finish().await?;
    } else {
        let mut remaining = total;
        while remaining > 0 {
            let want = buf.len().min(remaining as usize);
            let n = file.read(&mut buf[..want]).await?;
            if n == 0 {
                return Err(TransferError::protocol(
                    "source ended before the advertised size",
                ));
            }
            hasher.update(&buf[..n]);
            stream.write_all(&buf[..n]).await?;
            remaining -= n as u64;
            sent += n as u64;
            events.on_progress(&progress(sent));
        }
    }

    let digest = hasher.finalize();
    stream.write_all(digest.as_bytes()).await?;
    stream.flush().await?;
    debug!("sent {} bytes and digest to {peer_addr}", sent);
    Ok(())
}

/// A running sender session started with [`spawn_sender`].
pub struct SenderHandle {
    port: u16,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<Result<()>>,
}

impl SenderHandle {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Graceful stop: the accept loop exits and in-progress transfers
    /// run to completion before [`SenderHandle::join`] returns.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Aggressive stop: drops handler futures, closing their sockets.
    pub fn abort(&self) {
        self.task.abort();
    }

    pub async fn join(self) -> Result<()> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(TransferError::Cancelled),
            Err(e) => Err(TransferError::Io(io::Error::other(e))),
        }
    }
}

/// Launches the engine as a task and waits for the bound port so the
/// caller can hand it to a shell or a test peer.
pub async fn spawn_sender(input: PathBuf, opts: SenderOptions) -> Result<SenderHandle> {
    let cancel = opts.cancel.clone();
    let (port_tx, port_rx) = oneshot::channel();
    let task = tokio::spawn(async move { start_sender(&input, opts, Some(port_tx)).await });

    match tokio::time::timeout(PORT_HANDSHAKE_TIMEOUT, port_rx).await {
        Ok(Ok(port)) => Ok(SenderHandle { port, cancel, task }),
        Ok(Err(_)) => {
            // The engine exited before binding; surface its error.
            match task.await {
                Ok(Err(e)) => Err(e),
                Ok(Ok(())) => Err(TransferError::protocol(
                    "sender exited before reporting a port",
                )),
                Err(e) => Err(TransferError::Io(io::Error::other(e))),
            }
        }
        Err(_) => {
            cancel.cancel();
            task.abort();
            Err(TransferError::Timeout("the sender to report its bound port"))
        }
    }
}
