// Backup file catalog
//
// Backups live in a single directory as `backup-<YYYYMMDD>-<HHMMSS>-<db>.dump.gz`.
// The catalog scans that directory, parses the embedded timestamp and resolves
// a date key (or full stamp) to one artifact.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::NaiveDateTime;
use log::debug;
use regex::Regex;

use crate::error::{BackupError, Result};

const PREFIX: &str = "backup-";
const DUMP_EXTENSION: &str = ".dump";
const COMPRESSED_EXTENSION: &str = ".gz";

fn artifact_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^backup-(?P<date>\d{8})-(?P<time>\d{6})-(?P<db>.+)\.dump\.gz$")
            .expect("artifact pattern is valid")
    })
}

fn key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[0-9]{8}(-[0-9]{6})?$").expect("key pattern is valid"))
}

/// A compressed dump found in the backup directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackupArtifact {
    pub path: PathBuf,
    /// `YYYYMMDD`
    pub date: String,
    /// `HHMMSS`
    pub time: String,
    pub database: String,
    pub size: u64,
}

impl BackupArtifact {
    /// Parse a file name; `None` if it is not a backup artifact.
    pub fn parse(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let caps = artifact_pattern().captures(name)?;
        Some(BackupArtifact {
            path: path.to_path_buf(),
            date: caps["date"].to_string(),
            time: caps["time"].to_string(),
            database: caps["db"].to_string(),
            size: 0,
        })
    }

    /// The backup key used to select a restore: the date segment.
    pub fn key(&self) -> &str {
        &self.date
    }

    /// Full `YYYYMMDD-HHMMSS` stamp.
    pub fn stamp(&self) -> String {
        format!("{}-{}", self.date, self.time)
    }

    fn matches(&self, key: &str) -> bool {
        self.date == key || self.stamp() == key
    }
}

/// Lists and resolves the backups of one database in one directory.
#[derive(Clone, Debug)]
pub struct BackupCatalog {
    dir: PathBuf,
    database: String,
}

impl BackupCatalog {
    pub fn new(dir: impl Into<PathBuf>, database: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            database: database.into(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// All artifacts of the configured database, oldest first.
    pub fn list(&self) -> Result<Vec<BackupArtifact>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| BackupError::io(&self.dir, e))?;
        let mut artifacts = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| BackupError::io(&self.dir, e))?;
            let path = entry.path();
            let Some(mut artifact) = BackupArtifact::parse(&path) else {
                continue;
            };
            if artifact.database != self.database {
                continue;
            }
            let metadata = entry.metadata().map_err(|e| BackupError::io(&path, e))?;
            if !metadata.is_file() {
                continue;
            }
            artifact.size = metadata.len();
            artifacts.push(artifact);
        }
        artifacts.sort_by(|a, b| a.stamp().cmp(&b.stamp()));
        debug!("Found {} backups in {}", artifacts.len(), self.dir.display());
        Ok(artifacts)
    }

    /// Date keys of every artifact, oldest first. Two backups taken on the
    /// same day produce the same key twice.
    pub fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self.list()?.into_iter().map(|a| a.date).collect())
    }

    pub fn list_files(&self) -> Result<Vec<PathBuf>> {
        Ok(self.list()?.into_iter().map(|a| a.path).collect())
    }

    /// Resolve a date key (`YYYYMMDD`) or a full stamp (`YYYYMMDD-HHMMSS`).
    /// When several artifacts match, the newest one wins. Any other key shape
    /// is rejected before the directory is read.
    pub fn resolve(&self, key: &str) -> Result<BackupArtifact> {
        if !key_pattern().is_match(key) {
            return Err(BackupError::InvalidKey(key.to_string()));
        }
        let artifacts = self.list()?;
        let newest = artifacts
            .iter()
            .filter(|a| a.matches(key))
            .max_by(|a, b| a.stamp().cmp(&b.stamp()))
            .cloned();
        match newest {
            Some(artifact) => Ok(artifact),
            None => {
                let mut available: Vec<String> =
                    artifacts.iter().map(|a| a.date.clone()).collect();
                available.dedup();
                Err(BackupError::NotFound {
                    key: key.to_string(),
                    available,
                })
            }
        }
    }

    /// Path of the uncompressed dump a backup started at `now` writes to.
    pub fn new_dump_path(&self, now: NaiveDateTime) -> PathBuf {
        self.dir.join(format!(
            "{}{}-{}{}",
            PREFIX,
            now.format("%Y%m%d-%H%M%S"),
            self.database,
            DUMP_EXTENSION
        ))
    }
}

/// Whether `path` ends with the compressed extension.
pub fn is_compressed(path: &Path) -> bool {
    path.to_str()
        .map(|p| p.ends_with(COMPRESSED_EXTENSION))
        .unwrap_or(false)
}
