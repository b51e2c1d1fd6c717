// Gzip adapter for dump files.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::{debug, warn};

use crate::catalog::is_compressed;
use crate::error::{BackupError, Result};

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

// Best effort: the original error is what the caller reports.
fn discard(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!("Could not remove {}: {}", path.display(), e);
        }
    }
}

/// Stream `path` (a `.gz` file) into the same path without the extension.
/// The compressed source is left in place. On failure nothing is left at the
/// output path.
pub fn decompress(path: &Path) -> Result<PathBuf> {
    if !is_compressed(path) {
        return Err(BackupError::InvalidArtifact(path.to_path_buf()));
    }
    let raw_path = path.with_extension("");
    debug!("Decompressing {} to {}", path.display(), raw_path.display());

    let input = File::open(path).map_err(|e| BackupError::io(path, e))?;
    let mut decoder = GzDecoder::new(BufReader::new(input));
    let output = File::create(&raw_path).map_err(|e| BackupError::io(&raw_path, e))?;
    let mut writer = BufWriter::new(output);

    let written = io::copy(&mut decoder, &mut writer)
        .map_err(|e| BackupError::io(path, e))
        .and_then(|_| writer.flush().map_err(|e| BackupError::io(&raw_path, e)));
    if let Err(e) = written {
        drop(writer);
        discard(&raw_path);
        return Err(e);
    }
    Ok(raw_path)
}

/// Stream `path` into `<path>.gz`, then delete `path`.
///
/// The archive is written as `<path>.gz.partial` and renamed into place once
/// complete, so a failed run never leaves a file the catalog would list.
pub fn compress(path: &Path) -> Result<PathBuf> {
    let compressed_path = with_suffix(path, ".gz");
    let partial_path = with_suffix(&compressed_path, ".partial");
    debug!("Compressing {} to {}", path.display(), compressed_path.display());

    if let Err(e) = write_gzip(path, &partial_path) {
        discard(&partial_path);
        return Err(e);
    }
    fs::rename(&partial_path, &compressed_path).map_err(|e| {
        discard(&partial_path);
        BackupError::io(&compressed_path, e)
    })?;

    fs::remove_file(path).map_err(|e| BackupError::io(path, e))?;
    Ok(compressed_path)
}

fn write_gzip(source: &Path, destination: &Path) -> Result<()> {
    let input = File::open(source).map_err(|e| BackupError::io(source, e))?;
    let output = File::create(destination).map_err(|e| BackupError::io(destination, e))?;
    let mut encoder = GzEncoder::new(BufWriter::new(output), Compression::default());

    io::copy(&mut BufReader::new(input), &mut encoder).map_err(|e| BackupError::io(source, e))?;
    encoder
        .finish()
        .and_then(|mut w| w.flush())
        .map_err(|e| BackupError::io(destination, e))
}

/// A dump extracted for a restore. The raw file is removed when the guard
/// goes out of scope.
#[derive(Debug)]
pub struct ExtractedDump {
    path: PathBuf,
}

impl ExtractedDump {
    pub fn extract(compressed: &Path) -> Result<Self> {
        Ok(Self {
            path: decompress(compressed)?,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ExtractedDump {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed extracted dump {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Could not remove {}: {}", self.path.display(), e),
        }
    }
}
