//! Adaptive compression policy and streaming codec adapters.

use std::ffi::OsStr;
use std::io::Write;
use std::path::Path;

use crate::error::{Result, TransferError};
use crate::protocol::Compression;

/// Extensions that are already compressed; re-encoding them wastes CPU.
const SKIP_EXTENSIONS: &[&str] = &[
    "jpg", "png", "mp4", "zip", "iso", "dmg", "gz", "zst", "7z", "rar",
];

/// Text-like extensions that compress well.
const COMPRESS_EXTENSIONS: &[&str] = &["txt", "log", "json", "md", "go"];

/// Picks the content codec from the file name and archive flag alone.
/// Archives are produced with per-entry deflate already applied, and
/// unknown binary types default to no compression.
pub fn compression_for(file_name: &str, is_archive: bool) -> Compression {
    if is_archive {
        return Compression::None;
    }
    let ext = Path::new(file_name)
        .extension()
        .and_then(OsStr::to_str)
        .map(str::to_ascii_lowercase);
    match ext.as_deref() {
        Some(ext) if SKIP_EXTENSIONS.contains(&ext) => Compression::None,
        Some(ext) if COMPRESS_EXTENSIONS.contains(&ext) => Compression::Zstd,
        _ => Compression::None,
    }
}

/// Streaming zstd encoder. Source buffers go in, and whatever
/// compressed output the codec has ready comes back out so the caller
/// can frame it onto the wire; the whole transfer forms one zstd
/// stream regardless of how it was fed.
pub struct ContentEncoder {
    inner: zstd::stream::write::Encoder<'static, Vec<u8>>,
}

impl ContentEncoder {
    pub fn new() -> Result<Self> {
        let inner = zstd::stream::write::Encoder::new(Vec::new(), 0)
            .map_err(|e| TransferError::Compression(e.to_string()))?;
        Ok(Self { inner })
    }

    pub fn compress(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        self.inner
            .write_all(input)
            .map_err(|e| TransferError::Compression(e.to_string()))?;
        Ok(std::mem::take(self.inner.get_mut()))
    }

    /// Flushes the codec epilogue; the returned bytes complete the
    /// stream and must still be framed.
    pub fn finish(self) -> Result<Vec<u8>> {
        self.inner
            .finish()
            .map_err(|e| TransferError::Compression(e.to_string()))
    }
}

/// Streaming decoder for the receive path. Zstd mirrors what the
/// sender produces; gzip is kept for peers that still advertise it.
pub enum ContentDecoder {
    Zstd(zstd::stream::write::Decoder<'static, Vec<u8>>),
    Gzip(flate2::write::GzDecoder<Vec<u8>>),
}

impl ContentDecoder {
    /// Returns `None` for uncompressed content.
    pub fn new(mode: Compression) -> Result<Option<Self>> {
        match mode {
            Compression::None => Ok(None),
            Compression::Zstd => {
                let inner = zstd::stream::write::Decoder::new(Vec::new())
                    .map_err(|e| TransferError::Compression(e.to_string()))?;
                Ok(Some(ContentDecoder::Zstd(inner)))
            }
            Compression::Gzip => Ok(Some(ContentDecoder::Gzip(flate2::write::GzDecoder::new(
                Vec::new(),
            )))),
        }
    }

    pub fn decompress(&mut self, input: &[u8]) -> Result<Vec<u8>> {
        let failure = |e: std::io::Error| TransferError::Compression(e.to_string());
        match self {
            ContentDecoder::Zstd(decoder) => {
                decoder.write_all(input).map_err(failure)?;
                decoder.flush().map_err(failure)?;
                Ok(std::mem::take(decoder.get_mut()))
            }
            ContentDecoder::Gzip(decoder) => {
                decoder.write_all(input).map_err(failure)?;
                decoder.flush().map_err(failure)?;
                Ok(std::mem::take(decoder.get_mut()))
            }
        }
    }

    pub fn finish(mut self) -> Result<Vec<u8>> {
        match &mut self {
            ContentDecoder::Zstd(decoder) => {
                decoder
                    .flush()
                    .map_err(|e| TransferError::Compression(e.to_string()))?;
                Ok(std::mem::take(decoder.get_mut()))
            }
            ContentDecoder::Gzip(decoder) => {
                decoder
                    .try_finish()
                    .map_err(|e| TransferError::Compression(e.to_string()))?;
                Ok(std::mem::take(decoder.get_mut()))
            }
        }
    }
}
