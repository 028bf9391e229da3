//! Receiver engine: dial a sender, negotiate a resume offset, consume
//! the content stream, verify the footer digest, and extract archives.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};
use tempfile::TempPath;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::archive;
use crate::compression::ContentDecoder;
use crate::cryptography;
use crate::error::{Result, TransferError};
use crate::events::{Direction, EventSink, Progress};
use crate::protocol::{self, ChunkedReader, FileHeader, TransferRequest};
use crate::utils;
use crate::{COPY_BUFFER_SIZE, DIGEST_SIZE};

pub struct ReceiverOptions {
    /// Where received files land; created with mode 0755 if missing.
    pub download_dir: PathBuf,
    pub events: Arc<dyn EventSink>,
}

/// Connects to a sender and receives whatever it serves. Returns the
/// final path of the received file (for directories, the extracted
/// root under the download directory).
pub async fn connect_and_receive(address: SocketAddr, opts: &ReceiverOptions) -> Result<PathBuf> {
    match receive_session(address, opts).await {
        Ok(path) => {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            opts.events.on_complete(&name, address, Direction::Receive);
            Ok(path)
        }
        Err(e) => {
            opts.events.on_error(&e, address, Direction::Receive);
            Err(e)
        }
    }
}

async fn receive_session(address: SocketAddr, opts: &ReceiverOptions) -> Result<PathBuf> {
    info!("connecting to {address}");
    let tcp = TcpStream::connect(address).await?;
    let connector = TlsConnector::from(cryptography::client_config());
    let mut stream = connector.connect(cryptography::server_name()?, tcp).await?;

    // The sender only speaks after its approval callback says yes.
    let header: FileHeader = serde_json::from_slice(&protocol::read_record(&mut stream).await?)?;
    let size = u64::try_from(header.size)
        .map_err(|_| TransferError::protocol(format!("negative content size {}", header.size)))?;
    let safe_name = utils::sanitize_file_name(&header.name);
    info!(
        "receiving {} '{safe_name}' ({})",
        if header.is_archive { "directory" } else { "file" },
        utils::format_bytes(size)
    );

    create_download_dir(&opts.download_dir)?;
    let final_path = opts.download_dir.join(&safe_name);

    // Resume negotiation. Archives always restart into a temp file;
    // a shorter regular file at the target resumes where it left off.
    let (offset, mut dest, temp_archive) = open_destination(&final_path, size, header.is_archive).await?;

    let request = TransferRequest {
        offset: offset as i64,
    };
    protocol::write_record(&mut stream, &serde_json::to_vec(&request)?).await?;
    stream.flush().await?;

    let total = size - offset;
    let mut hasher = blake3::Hasher::new();
    let mut received = 0u64;
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];

    match ContentDecoder::new(header.compression)? {
        None => {
            let mut remaining = total;
            while remaining > 0 {
                let want = buf.len().min(remaining as usize);
                let n = stream.read(&mut buf[..want]).await?;
                if n == 0 {
                    return Err(TransferError::protocol(
                        "content ended before the advertised size",
                    ));
                }
                hasher.update(&buf[..n]);
                dest.write_all(&buf[..n]).await?;
                remaining -= n as u64;
                received += n as u64;
                opts.events.on_progress(&Progress {
                    bytes_transferred: received,
                    total_bytes: total,
                    file_name: safe_name.clone(),
                    peer_addr: address,
                    direction: Direction::Receive,
                });
            }
        }
        Some(mut decoder) => {
            let mut chunked = ChunkedReader::new(&mut stream);
            loop {
                let n = chunked.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                let out = decoder.decompress(&buf[..n])?;
                if out.is_empty() {
                    continue;
                }
                hasher.update(&out);
                dest.write_all(&out).await?;
                received += out.len() as u64;
                opts.events.on_progress(&Progress {
                    bytes_transferred: received,
                    total_bytes: total,
                    file_name: safe_name.clone(),
                    peer_addr: address,
                    direction: Direction::Receive,
                });
            }
            let tail = decoder.finish()?;
            if !tail.is_empty() {
                hasher.update(&tail);
                dest.write_all(&tail).await?;
                received += tail.len() as u64;
            }
        }
    }
    dest.flush().await?;
    debug!("received {received} content bytes from {address}");

    // Footer digest over the uncompressed bytes of [offset, size).
    let mut footer = [0u8; DIGEST_SIZE];
    stream.read_exact(&mut footer).await?;
    let computed = hasher.finalize();
    if computed.as_bytes() != &footer {
        // The partial file stays on disk so a later session can resume.
        return Err(TransferError::ChecksumMismatch {
            expected: cryptography::hex(&footer),
            computed: computed.to_hex().to_string(),
        });
    }
    info!("checksum verified for '{safe_name}'");

    if let Some(temp_archive) = temp_archive {
        drop(dest);
        info!("extracting archive into {}", opts.download_dir.display());
        let download_dir = opts.download_dir.clone();
        tokio::task::spawn_blocking(move || {
            let result = archive::extract_archive(&temp_archive, &download_dir);
            drop(temp_archive);
            result
        })
        .await
        .map_err(|e| TransferError::Io(std::io::Error::other(e)))??;
    }

    Ok(final_path)
}

async fn open_destination(
    final_path: &Path,
    size: u64,
    is_archive: bool,
) -> Result<(u64, tokio::fs::File, Option<TempPath>)> {
    if is_archive {
        let temp = tempfile::NamedTempFile::new()?.into_temp_path();
        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&temp)
            .await?;
        return Ok((0, file, Some(temp)));
    }

    match tokio::fs::metadata(final_path).await {
        Ok(meta) if meta.is_file() && meta.len() < size => {
            info!(
                "found partial file, resuming from {}",
                utils::format_bytes(meta.len())
            );
            let file = tokio::fs::OpenOptions::new()
                .append(true)
                .open(final_path)
                .await?;
            Ok((meta.len(), file, None))
        }
        _ => Ok((0, tokio::fs::File::create(final_path).await?, None)),
    }
}

fn create_download_dir(dir: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(dir)
            .or_else(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    Ok(())
                } else {
                    Err(e)
                }
            })?;
    }
    #[cfg(not(unix))]
    {
        std::fs::create_dir_all(dir)?;
    }
    Ok(())
}
