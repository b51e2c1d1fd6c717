// Error taxonomy for pgstage.
//
// Every fallible operation in the library returns `BackupError`. Only the
// binary decides whether an error ends the process; some variants
// (`RestoreFailed`, `DropFailed`) are logged and tolerated by their callers.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// SQLSTATE for "database does not exist".
pub const INVALID_CATALOG_NAME: &str = "3D000";
/// SQLSTATE raised when a database is still being accessed by other sessions.
pub const OBJECT_IN_USE: &str = "55006";

/// A failed SQL statement, reduced to its SQLSTATE and message so that it can
/// be produced by test sessions as well as by `tokio-postgres`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlError {
    pub code: Option<String>,
    pub message: String,
}

impl SqlError {
    pub fn new(code: Option<&str>, message: impl Into<String>) -> Self {
        Self {
            code: code.map(str::to_string),
            message: message.into(),
        }
    }

    /// True when the statement failed because the database is absent.
    pub fn is_missing_database(&self) -> bool {
        self.code.as_deref() == Some(INVALID_CATALOG_NAME)
    }

    /// True when the statement failed because other sessions hold the database.
    pub fn is_object_in_use(&self) -> bool {
        self.code.as_deref() == Some(OBJECT_IN_USE)
    }
}

impl fmt::Display for SqlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{} (SQLSTATE {})", self.message, code),
            None => write!(f, "{}", self.message),
        }
    }
}

impl std::error::Error for SqlError {}

impl From<tokio_postgres::Error> for SqlError {
    fn from(e: tokio_postgres::Error) -> Self {
        match e.as_db_error() {
            Some(db) => SqlError::new(Some(db.code().code()), db.message()),
            None => SqlError::new(e.code().map(|c| c.code()), e.to_string()),
        }
    }
}

/// The step of a promotion that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionStep {
    Terminate,
    RetireActive,
    RenameScratch,
}

impl fmt::Display for PromotionStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let step = match self {
            PromotionStep::Terminate => "terminating connections",
            PromotionStep::RetireActive => "retiring the active database",
            PromotionStep::RenameScratch => "renaming the scratch database",
        };
        f.write_str(step)
    }
}

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("cannot connect to admin database {database} on {host}:{port}: {message}")]
    Connection {
        host: String,
        port: u16,
        database: String,
        message: String,
    },

    #[error("SQL statement failed: {0}")]
    Sql(#[from] SqlError),

    #[error("{tool} exited with status {status}")]
    DumpFailed { tool: String, status: i32 },

    #[error("{tool} exited with status {status}; the restored database may be incomplete")]
    RestoreFailed { tool: String, status: i32 },

    #[error("failed to launch {tool}: {source}")]
    ToolLaunch {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid backup key {0:?}; expected YYYYMMDD or YYYYMMDD-HHMMSS")]
    InvalidKey(String),

    #[error("no backup found for {key}; available keys: {}", .available.join(", "))]
    NotFound { key: String, available: Vec<String> },

    #[error("could not drop database {database}: {source}")]
    DropFailed {
        database: String,
        #[source]
        source: SqlError,
    },

    #[error("scratch database {0} does not exist; run a restore before promoting")]
    ScratchMissing(String),

    #[error("scratch database name {0} is the same as the active database")]
    NameCollision(String),

    #[error("promotion of {scratch} into {active} failed while {step}: {source}{}", rollback_note(.rolled_back))]
    PromotionFailed {
        scratch: String,
        active: String,
        step: PromotionStep,
        rolled_back: bool,
        #[source]
        source: SqlError,
    },

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("{0} is not a backup artifact")]
    InvalidArtifact(PathBuf),

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn rollback_note(rolled_back: &bool) -> &'static str {
    if *rolled_back {
        " (rolled back, active database unchanged)"
    } else {
        ""
    }
}

impl BackupError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BackupError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
