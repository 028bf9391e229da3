// Integration tests for the synapse transfer engine
// These tests drive sender and receiver over real TLS loopback connections

use std::io::Write as _;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;

use synapse::cryptography;
use synapse::error::TransferError;
use synapse::events::{Direction, EventSink, Progress};
use synapse::protocol::{self, ChunkedWriter, Compression, FileHeader, TransferRequest};
use synapse::receiver::{self, ReceiverOptions};
use synapse::sender::{self, SenderHandle, SenderOptions};

// The engine allows one sender session per process, so tests that use
// it take this lock to run one at a time.
static SENDER_SLOT: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

// ============================================================================
// Helpers
// ============================================================================

struct RecordingSink {
    approve: AtomicBool,
    progress: Mutex<Vec<(u64, u64)>>,
    completions: Mutex<Vec<String>>,
    errors: Mutex<Vec<String>>,
}

impl RecordingSink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            approve: AtomicBool::new(true),
            progress: Mutex::new(Vec::new()),
            completions: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
        })
    }
}

impl EventSink for RecordingSink {
    fn on_progress(&self, progress: &Progress) {
        self.progress
            .lock()
            .unwrap()
            .push((progress.bytes_transferred, progress.total_bytes));
    }

    fn on_complete(&self, file_name: &str, _peer_addr: SocketAddr, _direction: Direction) {
        self.completions.lock().unwrap().push(file_name.to_string());
    }

    fn on_error(&self, error: &TransferError, _peer_addr: SocketAddr, _direction: Direction) {
        self.errors.lock().unwrap().push(error.to_string());
    }

    fn approve_connection(&self, _peer_addr: SocketAddr) -> bool {
        self.approve.load(Ordering::SeqCst)
    }
}

async fn serve(path: PathBuf, sink: Arc<RecordingSink>) -> SenderHandle {
    let opts = SenderOptions {
        device_name: "test-device".to_string(),
        port: 0,
        events: sink,
        cancel: tokio_util::sync::CancellationToken::new(),
        advertise: false,
    };
    sender::spawn_sender(path, opts).await.expect("sender starts")
}

fn loopback(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

fn receiver_opts(download_dir: &Path, sink: Arc<RecordingSink>) -> ReceiverOptions {
    ReceiverOptions {
        download_dir: download_dir.to_path_buf(),
        events: sink,
    }
}

/// Deterministic filler that does not compress to nothing.
fn pseudo_random(len: usize, mut seed: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        out.extend_from_slice(&seed.to_le_bytes());
    }
    out.truncate(len);
    out
}

async fn raw_client(port: u16) -> tokio_rustls::client::TlsStream<TcpStream> {
    let tcp = TcpStream::connect(loopback(port)).await.expect("tcp connect");
    let connector = tokio_rustls::TlsConnector::from(cryptography::client_config());
    connector
        .connect(cryptography::server_name().unwrap(), tcp)
        .await
        .expect("tls connect")
}

// ============================================================================
// Round Trip Tests
// ============================================================================

#[tokio::test]
async fn test_round_trip_uncompressed_file() {
    let _slot = SENDER_SLOT.lock().await;
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("photo.jpg");
    let content = pseudo_random(1_234_567, 7);
    std::fs::write(&source, &content).unwrap();

    let sink = RecordingSink::new();
    let handle = serve(source, Arc::clone(&sink)).await;

    let download = tmp.path().join("downloads");
    let recv_sink = RecordingSink::new();
    let path = receiver::connect_and_receive(
        loopback(handle.port()),
        &receiver_opts(&download, Arc::clone(&recv_sink)),
    )
    .await
    .expect("receive succeeds");

    assert_eq!(path, download.join("photo.jpg"));
    assert_eq!(std::fs::read(&path).unwrap(), content);
    assert_eq!(recv_sink.completions.lock().unwrap().as_slice(), ["photo.jpg"]);

    handle.stop();
    handle.join().await.unwrap();
    assert_eq!(sink.completions.lock().unwrap().as_slice(), ["photo.jpg"]);
}

#[tokio::test]
async fn test_round_trip_compressed_text() {
    let _slot = SENDER_SLOT.lock().await;
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("hello.txt");
    let content = b"the quick brown fox\n".to_vec();
    std::fs::write(&source, &content).unwrap();

    let handle = serve(source, RecordingSink::new()).await;

    let download = tmp.path().join("downloads");
    let path = receiver::connect_and_receive(
        loopback(handle.port()),
        &receiver_opts(&download, RecordingSink::new()),
    )
    .await
    .expect("receive succeeds");

    assert_eq!(std::fs::read(&path).unwrap(), content);

    handle.stop();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn test_compressed_wire_format() {
    let _slot = SENDER_SLOT.lock().await;
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("notes.txt");
    let content = b"the quick brown fox jumps over the lazy dog\n".repeat(200);
    std::fs::write(&source, &content).unwrap();

    let handle = serve(source, RecordingSink::new()).await;
    let mut stream = raw_client(handle.port()).await;

    let header: FileHeader =
        serde_json::from_slice(&protocol::read_record(&mut stream).await.unwrap()).unwrap();
    assert_eq!(header.name, "notes.txt");
    assert_eq!(header.size as usize, content.len());
    assert_eq!(header.compression, Compression::Zstd);
    assert!(!header.is_archive);

    let request = serde_json::to_vec(&TransferRequest { offset: 0 }).unwrap();
    protocol::write_record(&mut stream, &request).await.unwrap();
    stream.flush().await.unwrap();

    // Drain the chunked sub-stream by hand to observe the wire size.
    let mut compressed = Vec::new();
    loop {
        let len = stream.read_u32().await.unwrap();
        if len == 0 {
            break;
        }
        let mut chunk = vec![0u8; len as usize];
        stream.read_exact(&mut chunk).await.unwrap();
        compressed.extend_from_slice(&chunk);
    }
    assert!(
        compressed.len() < content.len(),
        "compressible content should shrink on the wire"
    );

    let mut footer = [0u8; 32];
    stream.read_exact(&mut footer).await.unwrap();
    assert_eq!(blake3::hash(&content).as_bytes(), &footer);

    let decoded = zstd::stream::decode_all(std::io::Cursor::new(compressed)).unwrap();
    assert_eq!(decoded, content);

    handle.stop();
    handle.join().await.unwrap();
}

// ============================================================================
// Resume and Offset Tests
// ============================================================================

#[tokio::test]
async fn test_resume_from_partial_file() {
    let _slot = SENDER_SLOT.lock().await;
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("data.bin");
    let content: Vec<u8> = (0u8..=255).collect::<Vec<_>>().repeat(4096);
    assert_eq!(content.len(), 1_048_576);
    std::fs::write(&source, &content).unwrap();

    let download = tmp.path().join("downloads");
    std::fs::create_dir_all(&download).unwrap();
    std::fs::write(download.join("data.bin"), &content[..100_000]).unwrap();

    let handle = serve(source, RecordingSink::new()).await;
    let recv_sink = RecordingSink::new();
    let path = receiver::connect_and_receive(
        loopback(handle.port()),
        &receiver_opts(&download, Arc::clone(&recv_sink)),
    )
    .await
    .expect("resume succeeds");

    assert_eq!(std::fs::read(&path).unwrap(), content);
    // The session moved only the missing suffix.
    let progress = recv_sink.progress.lock().unwrap();
    assert!(progress.iter().all(|(_, total)| *total == 948_576));

    handle.stop();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn test_complete_file_is_retransmitted() {
    let _slot = SENDER_SLOT.lock().await;
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("data.bin");
    let content = pseudo_random(65_536, 11);
    std::fs::write(&source, &content).unwrap();

    // The target already holds at least `size` bytes, so the receiver
    // truncates and starts over.
    let download = tmp.path().join("downloads");
    std::fs::create_dir_all(&download).unwrap();
    std::fs::write(download.join("data.bin"), pseudo_random(70_000, 13)).unwrap();

    let handle = serve(source, RecordingSink::new()).await;
    let path = receiver::connect_and_receive(
        loopback(handle.port()),
        &receiver_opts(&download, RecordingSink::new()),
    )
    .await
    .expect("receive succeeds");

    assert_eq!(std::fs::read(&path).unwrap(), content);

    handle.stop();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn test_offset_beyond_size_restarts_from_zero() {
    let _slot = SENDER_SLOT.lock().await;
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("blob.bin");
    let content = pseudo_random(200_000, 21);
    std::fs::write(&source, &content).unwrap();

    let handle = serve(source, RecordingSink::new()).await;
    let mut stream = raw_client(handle.port()).await;

    let header: FileHeader =
        serde_json::from_slice(&protocol::read_record(&mut stream).await.unwrap()).unwrap();
    assert_eq!(header.compression, Compression::None);

    let request = serde_json::to_vec(&TransferRequest {
        offset: header.size + 1000,
    })
    .unwrap();
    protocol::write_record(&mut stream, &request).await.unwrap();
    stream.flush().await.unwrap();

    let mut body = vec![0u8; content.len()];
    stream.read_exact(&mut body).await.unwrap();
    assert_eq!(body, content, "sender must stream the whole file from 0");

    let mut footer = [0u8; 32];
    stream.read_exact(&mut footer).await.unwrap();
    assert_eq!(blake3::hash(&content).as_bytes(), &footer);

    handle.stop();
    handle.join().await.unwrap();
}

// ============================================================================
// Concurrency Tests
// ============================================================================

#[tokio::test]
async fn test_concurrent_receivers_get_identical_content() {
    let _slot = SENDER_SLOT.lock().await;
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("big.bin");
    let content = pseudo_random(4 * 1024 * 1024 + 123, 31);
    std::fs::write(&source, &content).unwrap();

    let handle = serve(source, RecordingSink::new()).await;
    let addr = loopback(handle.port());

    let download_a = tmp.path().join("a");
    let download_b = tmp.path().join("b");
    let opts_a = receiver_opts(&download_a, RecordingSink::new());
    let opts_b = receiver_opts(&download_b, RecordingSink::new());

    let (a, b) = tokio::join!(
        receiver::connect_and_receive(addr, &opts_a),
        receiver::connect_and_receive(addr, &opts_b),
    );
    let (a, b) = (a.expect("first receiver"), b.expect("second receiver"));

    assert_eq!(std::fs::read(a).unwrap(), content);
    assert_eq!(std::fs::read(b).unwrap(), content);

    handle.stop();
    handle.join().await.unwrap();
}

#[tokio::test]
async fn test_single_sender_session_per_process() {
    let _slot = SENDER_SLOT.lock().await;
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("file.bin");
    std::fs::write(&source, b"occupied").unwrap();

    let handle = serve(source.clone(), RecordingSink::new()).await;

    let second = sender::spawn_sender(
        source,
        SenderOptions {
            device_name: "test-device".to_string(),
            port: 0,
            events: RecordingSink::new(),
            cancel: tokio_util::sync::CancellationToken::new(),
            advertise: false,
        },
    )
    .await;
    assert!(matches!(second, Err(TransferError::SessionActive)));

    handle.stop();
    handle.join().await.unwrap();
}

// ============================================================================
// Directory Transfer Tests
// ============================================================================

#[tokio::test]
async fn test_directory_transfer_and_extraction() {
    let _slot = SENDER_SLOT.lock().await;
    let tmp = TempDir::new().unwrap();
    let proj = tmp.path().join("proj");
    std::fs::create_dir_all(proj.join("sub")).unwrap();
    std::fs::write(proj.join("a.txt"), "A").unwrap();
    std::fs::write(proj.join("sub").join("b.txt"), "B").unwrap();

    let handle = serve(proj, RecordingSink::new()).await;

    let download = tmp.path().join("downloads");
    let path = receiver::connect_and_receive(
        loopback(handle.port()),
        &receiver_opts(&download, RecordingSink::new()),
    )
    .await
    .expect("directory receive succeeds");

    assert_eq!(path, download.join("proj"));
    assert_eq!(
        std::fs::read_to_string(download.join("proj/a.txt")).unwrap(),
        "A"
    );
    assert_eq!(
        std::fs::read_to_string(download.join("proj/sub/b.txt")).unwrap(),
        "B"
    );

    handle.stop();
    handle.join().await.unwrap();
}

// ============================================================================
// Approval Tests
// ============================================================================

#[tokio::test]
async fn test_denied_approval_transmits_no_header() {
    let _slot = SENDER_SLOT.lock().await;
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("secret.bin");
    std::fs::write(&source, pseudo_random(4096, 41)).unwrap();

    let sink = RecordingSink::new();
    sink.approve.store(false, Ordering::SeqCst);
    let handle = serve(source, Arc::clone(&sink)).await;

    // The connection is closed before the header record; depending on
    // timing that surfaces during the handshake or on first read.
    let tcp = TcpStream::connect(loopback(handle.port())).await.unwrap();
    let connector = tokio_rustls::TlsConnector::from(cryptography::client_config());
    match connector
        .connect(cryptography::server_name().unwrap(), tcp)
        .await
    {
        Err(_) => {}
        Ok(mut stream) => {
            assert!(protocol::read_record(&mut stream).await.is_err());
        }
    }

    // A later, approved connection is still served.
    sink.approve.store(true, Ordering::SeqCst);
    let download = tmp.path().join("downloads");
    receiver::connect_and_receive(
        loopback(handle.port()),
        &receiver_opts(&download, RecordingSink::new()),
    )
    .await
    .expect("approved connection succeeds");

    handle.stop();
    handle.join().await.unwrap();
}

// ============================================================================
// Scripted Sender Tests (receiver resilience)
// ============================================================================

/// Accepts one TLS connection and lets the script drive the protocol.
async fn scripted_sender<F, Fut>(script: F) -> SocketAddr
where
    F: FnOnce(tokio_rustls::server::TlsStream<TcpStream>) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = TlsAcceptor::from(cryptography::server_config().unwrap());
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let stream = acceptor.accept(tcp).await.unwrap();
        script(stream).await;
    });
    addr
}

async fn send_header_and_read_request(
    stream: &mut tokio_rustls::server::TlsStream<TcpStream>,
    header: &FileHeader,
) {
    let bytes = serde_json::to_vec(header).unwrap();
    protocol::write_record(stream, &bytes).await.unwrap();
    stream.flush().await.unwrap();
    protocol::read_record(stream).await.unwrap();
}

#[tokio::test]
async fn test_checksum_mismatch_preserves_partial_file() {
    let tmp = TempDir::new().unwrap();
    let payload = pseudo_random(50_000, 51);
    let size = payload.len() as i64;

    let addr = scripted_sender(move |mut stream| async move {
        let header = FileHeader {
            name: "tainted.bin".to_string(),
            size,
            is_archive: false,
            compression: Compression::None,
        };
        send_header_and_read_request(&mut stream, &header).await;
        stream.write_all(&payload).await.unwrap();
        stream.write_all(&[0u8; 32]).await.unwrap();
        stream.flush().await.unwrap();
        let _ = stream.shutdown().await;
    })
    .await;

    let download = tmp.path().join("downloads");
    let sink = RecordingSink::new();
    let err = receiver::connect_and_receive(
        addr,
        &receiver_opts(&download, Arc::clone(&sink)),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, TransferError::ChecksumMismatch { .. }));
    assert_eq!(sink.errors.lock().unwrap().len(), 1);
    // The partial file survives so a later session can resume it.
    assert_eq!(
        std::fs::metadata(download.join("tainted.bin")).unwrap().len(),
        50_000
    );
}

#[tokio::test]
async fn test_gzip_content_is_accepted() {
    let tmp = TempDir::new().unwrap();
    let payload = b"legacy peers may still gzip their streams\n".repeat(300);
    let size = payload.len() as i64;
    let digest = *blake3::hash(&payload).as_bytes();

    let mut encoder =
        flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&payload).unwrap();
    let compressed = encoder.finish().unwrap();

    let expected = payload.clone();
    let addr = scripted_sender(move |mut stream| async move {
        let header = FileHeader {
            name: "legacy.txt".to_string(),
            size,
            is_archive: false,
            compression: Compression::Gzip,
        };
        send_header_and_read_request(&mut stream, &header).await;
        let mut chunked = ChunkedWriter::new(&mut stream);
        for chunk in compressed.chunks(1000) {
            chunked.write_chunk(chunk).await.unwrap();
        }
        chunked.finish().await.unwrap();
        stream.write_all(&digest).await.unwrap();
        stream.flush().await.unwrap();
        let _ = stream.shutdown().await;
    })
    .await;

    let download = tmp.path().join("downloads");
    let path = receiver::connect_and_receive(
        addr,
        &receiver_opts(&download, RecordingSink::new()),
    )
    .await
    .expect("gzip receive succeeds");

    assert_eq!(std::fs::read(path).unwrap(), expected);
}

#[tokio::test]
async fn test_escaping_archive_entry_fails_extraction() {
    let tmp = TempDir::new().unwrap();

    let mut raw = std::io::Cursor::new(Vec::new());
    let mut writer = zip::ZipWriter::new(&mut raw);
    writer
        .start_file("../evil.txt", zip::write::SimpleFileOptions::default())
        .unwrap();
    writer.write_all(b"escape attempt").unwrap();
    writer.finish().unwrap();
    let archive_bytes = raw.into_inner();

    let size = archive_bytes.len() as i64;
    let digest = *blake3::hash(&archive_bytes).as_bytes();
    let addr = scripted_sender(move |mut stream| async move {
        let header = FileHeader {
            name: "trap".to_string(),
            size,
            is_archive: true,
            compression: Compression::None,
        };
        send_header_and_read_request(&mut stream, &header).await;
        stream.write_all(&archive_bytes).await.unwrap();
        stream.write_all(&digest).await.unwrap();
        stream.flush().await.unwrap();
        let _ = stream.shutdown().await;
    })
    .await;

    let download = tmp.path().join("downloads");
    let err = receiver::connect_and_receive(
        addr,
        &receiver_opts(&download, RecordingSink::new()),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, TransferError::UnsafePath(_)));
    assert!(!tmp.path().join("evil.txt").exists());
    assert!(!download.join("evil.txt").exists());
}

#[tokio::test]
async fn test_oversized_header_rejected() {
    let addr = scripted_sender(|mut stream| async move {
        // Announce a record far past the 64 KiB cap.
        let _ = stream.write_i64(1024 * 1024).await;
        let _ = stream.flush().await;
        let _ = protocol::read_record(&mut stream).await;
    })
    .await;

    let tmp = TempDir::new().unwrap();
    let err = receiver::connect_and_receive(
        addr,
        &receiver_opts(&tmp.path().join("downloads"), RecordingSink::new()),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, TransferError::Protocol(_)));
}

// ============================================================================
// Discovery Tests
// ============================================================================

#[tokio::test]
#[ignore = "requires a multicast-capable network interface"]
async fn test_discovery_round_trip() {
    let _slot = SENDER_SLOT.lock().await;
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("announce.bin");
    std::fs::write(&source, b"visible").unwrap();

    let device = format!("synapse-it-{}", std::process::id());
    let opts = SenderOptions {
        device_name: device.clone(),
        port: 0,
        events: RecordingSink::new(),
        cancel: tokio_util::sync::CancellationToken::new(),
        advertise: true,
    };
    let handle = sender::spawn_sender(source, opts).await.unwrap();

    let peers = synapse::discovery::scan_peers(std::time::Duration::from_secs(3))
        .await
        .unwrap();
    assert!(
        peers.iter().any(|p| p.instance_name.contains(&device)),
        "announced sender should be discoverable"
    );

    handle.stop();
    handle.join().await.unwrap();

    let peers = synapse::discovery::scan_peers(std::time::Duration::from_secs(3))
        .await
        .unwrap();
    assert!(
        !peers.iter().any(|p| p.instance_name.contains(&device)),
        "stopped sender should disappear from the directory"
    );
}
