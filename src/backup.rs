use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;

use log::{debug, error};
use tokio::process::Command;

use crate::config::{AppConfig, PostgresConfig};
use crate::error::{BackupError, Result};

/// Output of a finished external tool run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub tool: String,
    /// Exit code; -1 when the process was killed by a signal.
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// stdout followed by stderr, one entry per non-empty line.
    /// pg_dump and pg_restore write their `-v` progress to stderr.
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout
            .lines()
            .chain(self.stderr.lines())
            .filter(|line| !line.trim().is_empty())
    }
}

/// Result of a pg_restore run. A failed restore is reported, not raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub database: String,
    pub output: ToolOutput,
}

impl RestoreReport {
    /// The non-fatal error to log when pg_restore exited non-zero.
    pub fn failure(&self) -> Option<BackupError> {
        if self.output.success() {
            None
        } else {
            Some(BackupError::RestoreFailed {
                tool: self.output.tool.clone(),
                status: self.output.status,
            })
        }
    }
}

/// Build the pg_dump argument list for a custom-format dump of the active database.
///
/// # Arguments
///
/// * `pg` - Connection settings; the password travels inside `--dbname`
/// * `destination` - File pg_dump writes to
///
/// # Returns
///
/// The arguments in the order pg_dump receives them
pub fn dump_args(pg: &PostgresConfig, destination: &Path) -> Vec<OsString> {
    vec![
        format!("--dbname={}", pg.connection_url(&pg.database)).into(),
        "-Fc".into(),
        "-f".into(),
        destination.as_os_str().to_owned(),
        "-v".into(),
    ]
}

/// Build the pg_restore argument list. Ownership is stripped so that objects
/// belong to the restoring user.
///
/// # Arguments
///
/// * `pg` - Connection settings
/// * `database` - Target database, normally the scratch database
/// * `source` - Uncompressed custom-format dump
///
/// # Returns
///
/// The arguments in the order pg_restore receives them
pub fn restore_args(pg: &PostgresConfig, database: &str, source: &Path) -> Vec<OsString> {
    vec![
        "--no-owner".into(),
        format!("--dbname={}", pg.connection_url(database)).into(),
        "-v".into(),
        source.as_os_str().to_owned(),
    ]
}

fn tool_command(program: &str, args: &[OsString], pg: &PostgresConfig) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // Without SSL the operator's own PGSSLMODE, if any, is inherited.
    if let Some(mode) = pg.tool_ssl_mode() {
        cmd.env("PGSSLMODE", mode);
    }
    cmd
}

async fn run_tool(program: &str, args: Vec<OsString>, pg: &PostgresConfig) -> Result<ToolOutput> {
    let mut cmd = tool_command(program, &args, pg);
    let output = cmd.output().await.map_err(|source| BackupError::ToolLaunch {
        tool: program.to_string(),
        source,
    })?;

    Ok(ToolOutput {
        tool: program.to_string(),
        status: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Dump the active database in custom format to `destination`.
///
/// A non-zero exit status is an error. A partially written file is left
/// where the tool put it.
///
/// # Arguments
///
/// * `config` - Application configuration (tool path and connection settings)
/// * `destination` - File the dump is written to
///
/// # Returns
///
/// The captured tool output, or `DumpFailed`/`ToolLaunch`
pub async fn dump_database(config: &AppConfig, destination: &Path) -> Result<ToolOutput> {
    let pg = &config.postgres;
    // Log the command with the password masked
    debug!(
        "Executing {} --dbname={} -Fc -f {} -v",
        config.pg_dump_bin,
        pg.redacted_url(&pg.database),
        destination.display()
    );
    let output = run_tool(&config.pg_dump_bin, dump_args(pg, destination), pg).await?;

    if !output.success() {
        error!("{} failed: {}", output.tool, output.stderr.trim());
        return Err(BackupError::DumpFailed {
            tool: output.tool,
            status: output.status,
        });
    }
    Ok(output)
}

/// Restore `source` into `database` with ownership stripped.
///
/// Only a failure to launch pg_restore is an error; its exit status is
/// returned in the report for the caller to judge.
///
/// # Arguments
///
/// * `config` - Application configuration (tool path and connection settings)
/// * `database` - Database to restore into
/// * `source` - Uncompressed dump file
///
/// # Returns
///
/// A `RestoreReport` carrying the tool output, or `ToolLaunch`
pub async fn restore_database(
    config: &AppConfig,
    database: &str,
    source: &Path,
) -> Result<RestoreReport> {
    let pg = &config.postgres;
    // Log the command with the password masked
    debug!(
        "Executing {} --no-owner --dbname={} -v {}",
        config.pg_restore_bin,
        pg.redacted_url(database),
        source.display()
    );
    let output = run_tool(&config.pg_restore_bin, restore_args(pg, database, source), pg).await?;

    // pg_restore exits non-zero on warnings too, so the caller decides
    if !output.success() {
        error!("{} exited with status {}", output.tool, output.status);
    }
    Ok(RestoreReport {
        database: database.to_string(),
        output,
    })
}
