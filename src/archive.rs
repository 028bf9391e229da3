//! Directory archiving and safe extraction.
//!
//! Directories travel as a single zip produced with a deterministic
//! lexicographic walk, so every receiver of a session sees identical
//! bytes. Entries are named `<basename>/<relative path>` with forward
//! slashes; file entries are stored raw when their extension is
//! already-compressed and deflated otherwise.

use std::fs::{self, File};
use std::io::{self, Seek, Write};
use std::path::Path;

use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::compression;
use crate::error::{Result, TransferError};
use crate::protocol::Compression;

pub fn archive_directory<W>(source: &Path, target: W) -> Result<()>
where
    W: Write + Seek,
{
    let base = source
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .ok_or_else(|| {
            TransferError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("'{}' has no base name", source.display()),
            ))
        })?;

    let mut writer = ZipWriter::new(target);
    writer.add_directory(format!("{base}/"), directory_options())?;
    add_directory_entries(&mut writer, source, &base)?;
    writer.finish()?;
    Ok(())
}

fn directory_options() -> SimpleFileOptions {
    SimpleFileOptions::default().unix_permissions(0o755)
}

fn add_directory_entries<W>(writer: &mut ZipWriter<W>, dir: &Path, prefix: &str) -> Result<()>
where
    W: Write + Seek,
{
    let mut entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let entry_name = format!("{prefix}/{name}");
        let metadata = entry.metadata()?;

        if metadata.is_dir() {
            writer.add_directory(format!("{entry_name}/"), directory_options())?;
            add_directory_entries(writer, &entry.path(), &entry_name)?;
        } else {
            let method = match compression::compression_for(&name, false) {
                Compression::Zstd => CompressionMethod::Deflated,
                _ => CompressionMethod::Stored,
            };
            let options = SimpleFileOptions::default()
                .compression_method(method)
                .unix_permissions(entry_mode(&metadata))
                .large_file(metadata.len() > u32::MAX as u64);
            writer.start_file(entry_name, options)?;
            let mut file = File::open(entry.path())?;
            io::copy(&mut file, writer)?;
        }
    }
    Ok(())
}

/// Unpacks `archive` under `destination`. Every entry path must stay a
/// descendant of the destination; an escaping entry fails the whole
/// extraction with `UnsafePath`, and entries already written stay in
/// place under the destination.
pub fn extract_archive(archive: &Path, destination: &Path) -> Result<()> {
    let file = File::open(archive)?;
    let mut zip = ZipArchive::new(file)?;
    fs::create_dir_all(destination)?;

    for index in 0..zip.len() {
        let mut entry = zip.by_index(index)?;
        let relative = entry
            .enclosed_name()
            .ok_or_else(|| TransferError::UnsafePath(entry.name().to_string()))?;
        let target = destination.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            set_mode(&target, 0o755)?;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out)?;
        if let Some(mode) = entry.unix_mode() {
            set_mode(&target, mode)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn entry_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode()
}

#[cfg(not(unix))]
fn entry_mode(_metadata: &fs::Metadata) -> u32 {
    0o644
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}
