//! Wire protocol for a transfer connection.
//!
//! A connection carries, in order: a header record, a request record,
//! the content stream, and a 32-byte footer digest. Records are an
//! 8-byte big-endian signed length followed by UTF-8 JSON. When
//! compression is active the content is additionally framed into
//! chunks of a 4-byte big-endian unsigned length followed by that many
//! bytes; a zero length marks end-of-stream.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, TransferError};
use crate::MAX_RECORD_SIZE;

/// Content codec advertised in the header. The sender only ever emits
/// `None` or `Zstd`; `Gzip` is accepted on the receive path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Zstd,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Zstd => "zstd",
        }
    }
}

/// Metadata sent by the sender before the content stream. `name` is a
/// logical label only; receivers derive their own filesystem name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileHeader {
    pub name: String,
    pub size: i64,
    #[serde(default)]
    pub is_archive: bool,
    #[serde(default)]
    pub compression: Compression,
}

/// Sent by the receiver to negotiate the transfer. `offset` is the
/// byte position in the uncompressed content to resume from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TransferRequest {
    pub offset: i64,
}

pub async fn write_record<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = payload.len() as i64;
    if len > MAX_RECORD_SIZE {
        return Err(TransferError::protocol(format!(
            "record of {len} bytes exceeds the {MAX_RECORD_SIZE} byte limit"
        )));
    }
    writer.write_i64(len).await?;
    writer.write_all(payload).await?;
    Ok(())
}

pub async fn read_record<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_i64().await?;
    if !(0..=MAX_RECORD_SIZE).contains(&len) {
        return Err(TransferError::protocol(format!(
            "announced record length {len} is outside 0..={MAX_RECORD_SIZE}"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Writes the chunked sub-framing used for compressed content. Each
/// call emits one chunk; `finish` emits the zero-length sentinel.
pub struct ChunkedWriter<'a, W> {
    inner: &'a mut W,
    closed: bool,
}

impl<'a, W> ChunkedWriter<'a, W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            closed: false,
        }
    }

    /// Writing an empty slice is a no-op so a sentinel is never emitted
    /// by accident.
    pub async fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        if self.closed {
            return Err(TransferError::protocol(
                "write after the chunked stream was closed",
            ));
        }
        if data.is_empty() {
            return Ok(());
        }
        if data.len() > u32::MAX as usize {
            return Err(TransferError::protocol("chunk exceeds the u32 length field"));
        }
        self.inner.write_u32(data.len() as u32).await?;
        self.inner.write_all(data).await?;
        Ok(())
    }

    pub async fn finish(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.inner.write_u32(0).await?;
        Ok(())
    }
}

/// Reads across chunk boundaries transparently; returns 0 once the
/// zero-length sentinel has been consumed.
pub struct ChunkedReader<'a, R> {
    inner: &'a mut R,
    remaining: u64,
    done: bool,
}

impl<'a, R> ChunkedReader<'a, R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: &'a mut R) -> Self {
        Self {
            inner,
            remaining: 0,
            done: false,
        }
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.done || buf.is_empty() {
            return Ok(0);
        }
        if self.remaining == 0 {
            let len = self.inner.read_u32().await?;
            if len == 0 {
                self.done = true;
                return Ok(0);
            }
            self.remaining = u64::from(len);
        }
        let want = buf.len().min(self.remaining as usize);
        let n = self.inner.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(TransferError::protocol("content chunk truncated"));
        }
        self.remaining -= n as u64;
        Ok(n)
    }
}
