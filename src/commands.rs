// Command dispatcher: one function per action. Errors are returned, never
// turned into a process exit here.

use std::fs;
use std::path::PathBuf;

use chrono::NaiveDateTime;
use humansize::{format_size, DECIMAL};
use log::{error, info, warn};

use crate::backup::{dump_database, restore_database, RestoreReport};
use crate::catalog::{BackupArtifact, BackupCatalog};
use crate::cli::Action;
use crate::compression::{compress, ExtractedDump};
use crate::config::AppConfig;
use crate::error::{BackupError, Result};
use crate::lifecycle::{AdminConnector, DatabaseLifecycle, PromotionReport, ScratchDatabase};

fn catalog(config: &AppConfig) -> BackupCatalog {
    BackupCatalog::new(&config.backup_path, &config.postgres.database)
}

/// Log every backup of the configured database and return them, oldest first.
pub fn list(config: &AppConfig) -> Result<Vec<BackupArtifact>> {
    let artifacts = catalog(config).list()?;
    if artifacts.is_empty() {
        info!("No backups in {}", config.backup_path.display());
    }
    for artifact in &artifacts {
        info!(
            "{} {} {:>10} {}",
            artifact.key(),
            artifact.stamp(),
            format_size(artifact.size, DECIMAL),
            artifact.path.display()
        );
    }
    let keys: Vec<&str> = artifacts.iter().map(|a| a.key()).collect();
    info!("Backup keys: {:?}", keys);
    Ok(artifacts)
}

/// Dump the active database to a new artifact stamped `now` and compress it.
/// Returns the path of the compressed artifact.
pub async fn backup(config: &AppConfig, now: NaiveDateTime) -> Result<PathBuf> {
    let catalog = catalog(config);
    fs::create_dir_all(catalog.dir()).map_err(|e| BackupError::io(catalog.dir(), e))?;

    let dump_path = catalog.new_dump_path(now);
    info!(
        "Backing up {} database to {}",
        config.postgres.database,
        dump_path.display()
    );
    let output = dump_database(config, &dump_path).await?;
    for line in output.lines() {
        info!("{}", line);
    }
    info!("Backup complete");

    info!("Compressing {}", dump_path.display());
    let compressed = tokio::task::spawn_blocking(move || compress(&dump_path)).await??;
    let size = fs::metadata(&compressed)
        .map_err(|e| BackupError::io(&compressed, e))?
        .len();
    info!(
        "Backup stored at {} ({})",
        compressed.display(),
        format_size(size, DECIMAL)
    );
    Ok(compressed)
}

/// Restore the newest backup matching `key` into the scratch database.
///
/// The artifact is extracted before the scratch database is touched, so a
/// corrupt archive leaves an already staged scratch database in place.
/// Returns the scratch database, `Restored` or `Failed` depending on
/// pg_restore's exit status, with the tool report.
pub async fn restore(
    config: &AppConfig,
    connector: &dyn AdminConnector,
    key: &str,
) -> Result<(ScratchDatabase, RestoreReport)> {
    let artifact = match catalog(config).resolve(key) {
        Ok(artifact) => artifact,
        Err(BackupError::NotFound { key, available }) => {
            error!("No match found for backups with date: {}", key);
            info!("Available keys: {:?}", available);
            return Err(BackupError::NotFound { key, available });
        }
        Err(e) => return Err(e),
    };
    info!("Found backup {} ({})", artifact.stamp(), artifact.path.display());

    let source = artifact.path.clone();
    let extracted = tokio::task::spawn_blocking(move || ExtractedDump::extract(&source)).await??;

    let lifecycle = DatabaseLifecycle::new(connector, &config.postgres);
    info!(
        "Creating temp database for restore: {}",
        config.postgres.scratch_database()
    );
    let mut scratch = lifecycle.create_scratch().await?;
    info!("Created temp database for restore: {}", scratch.name);

    info!("Restore starting");
    let report = match restore_database(config, &scratch.name, extracted.path()).await {
        Ok(report) => report,
        Err(e) => {
            scratch.mark_failed();
            warn!("Scratch database {} is {}", scratch.name, scratch.state());
            return Err(e);
        }
    };
    drop(extracted);

    for line in report.output.lines() {
        info!("{}", line);
    }
    match report.failure() {
        None => {
            scratch.mark_restored();
            info!("Restore complete");
        }
        Some(err) => {
            scratch.mark_failed();
            error!("{}", err);
            warn!(
                "Inspect {} before promoting it with --action active",
                scratch.name
            );
        }
    }
    info!("Scratch database {} is {}", scratch.name, scratch.state());
    Ok((scratch, report))
}

/// Promote the scratch database to the active database.
/// Returns the scratch database, now `Promoted`, with the promotion report.
pub async fn activate(
    config: &AppConfig,
    connector: &dyn AdminConnector,
) -> Result<(ScratchDatabase, PromotionReport)> {
    let pg = &config.postgres;
    info!(
        "Switching restored database with active one: {} -> {}",
        pg.scratch_database(),
        pg.database
    );
    let (scratch, report) = DatabaseLifecycle::new(connector, pg).promote().await?;
    if let Some(retained) = &report.retained {
        warn!("Previous database kept as {}", retained);
    }
    info!(
        "Database restored and active. Scratch database {} is {}",
        scratch.name,
        scratch.state()
    );
    Ok((scratch, report))
}

/// Run `action`. `restore_key` is required for `Action::Restore`.
pub async fn run(
    action: Action,
    restore_key: Option<&str>,
    config: &AppConfig,
    connector: &dyn AdminConnector,
    now: NaiveDateTime,
) -> Result<()> {
    match action {
        Action::List => {
            list(config)?;
        }
        Action::Backup => {
            backup(config, now).await?;
        }
        Action::Restore => match restore_key {
            Some(key) => {
                restore(config, connector, key).await?;
            }
            None => warn!(
                "No date was chosen for restore. Run again with the \"list\" action to see available restore dates"
            ),
        },
        Action::Active => {
            activate(config, connector).await?;
        }
    }
    Ok(())
}
