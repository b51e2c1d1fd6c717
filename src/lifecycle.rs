// Database lifecycle: scratch creation and promotion.
//
// A restore never writes into the active database. It goes into a scratch
// database (`<db>_restore`) which `promote` later swaps into the active name:
//
//   active  -> <db>_retired   (after terminating its other sessions)
//   scratch -> active
//   drop <db>_retired
//
// If the second rename fails the first is undone, so the active name is
// never left unbound by a failed promotion. A leftover `<db>_retired` marks a
// run that stopped before its final drop.

use std::fmt;

use async_trait::async_trait;
use log::{debug, error, info, warn};

use crate::config::PostgresConfig;
use crate::error::{BackupError, PromotionStep, Result, SqlError};

/// How many times a rename is retried when sessions reconnect between
/// terminating them and issuing the rename.
pub const RENAME_ATTEMPTS: u32 = 3;

/// Administrative operations on the server, one session per operation.
/// Statements run in autocommit mode: CREATE/DROP/ALTER DATABASE cannot run
/// inside a transaction block.
#[async_trait]
pub trait AdminSession: Send + Sync {
    async fn database_exists(&self, name: &str) -> std::result::Result<bool, SqlError>;

    async fn create_database(&self, name: &str) -> std::result::Result<(), SqlError>;

    async fn drop_database(&self, name: &str) -> std::result::Result<(), SqlError>;

    async fn grant_all(&self, database: &str, user: &str) -> std::result::Result<(), SqlError>;

    async fn rename_database(&self, from: &str, to: &str) -> std::result::Result<(), SqlError>;

    /// Terminate every backend connected to `database` except our own.
    /// Returns how many were terminated.
    async fn terminate_connections(&self, database: &str) -> std::result::Result<u64, SqlError>;
}

/// Opens admin sessions. Failing to connect is `BackupError::Connection`.
#[async_trait]
pub trait AdminConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn AdminSession>>;
}

/// Where a scratch database is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScratchState {
    Absent,
    Created,
    Restored,
    Promoted,
    Failed,
}

impl fmt::Display for ScratchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScratchState::Absent => "absent",
            ScratchState::Created => "created",
            ScratchState::Restored => "restored",
            ScratchState::Promoted => "promoted",
            ScratchState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScratchDatabase {
    pub name: String,
    state: ScratchState,
}

impl ScratchDatabase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ScratchState::Absent,
        }
    }

    pub fn state(&self) -> ScratchState {
        self.state
    }

    fn transition(&mut self, next: ScratchState) {
        debug!("Scratch database {}: {} -> {}", self.name, self.state, next);
        self.state = next;
    }

    /// Record that a dump has been restored into this database.
    pub fn mark_restored(&mut self) {
        self.transition(ScratchState::Restored);
    }

    /// Record a failure; from here the database needs a fresh restore.
    pub fn mark_failed(&mut self) {
        self.transition(ScratchState::Failed);
    }
}

/// What happened to a pre-existing database before the scratch was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropOutcome {
    Dropped,
    /// There was no database of that name.
    NothingToDrop,
    /// The name is the protected production database; no drop was attempted.
    Protected,
    /// DROP failed for another reason; logged and tolerated.
    Tolerated,
}

async fn drop_previous(session: &dyn AdminSession, name: &str, protected: &str) -> DropOutcome {
    if name == protected {
        warn!("Refusing to drop protected database {}", name);
        return DropOutcome::Protected;
    }
    match session.drop_database(name).await {
        Ok(()) => {
            info!("Dropped previous database {}", name);
            DropOutcome::Dropped
        }
        Err(e) if e.is_missing_database() => {
            info!("Database {} does not exist, nothing to drop", name);
            DropOutcome::NothingToDrop
        }
        Err(source) => {
            let err = BackupError::DropFailed {
                database: name.to_string(),
                source,
            };
            warn!("{}", err);
            DropOutcome::Tolerated
        }
    }
}

/// Drop (unless protected) and recreate `name`, then grant `user` all
/// privileges on it.
///
/// # Arguments
///
/// * `session` - Admin session on the server
/// * `name` - Scratch database to (re)create
/// * `protected` - The active database, which is never dropped
/// * `user` - Role that receives all privileges on the new database
///
/// # Returns
///
/// The created name and what happened to any previous database of that
/// name. DROP failures are tolerated; CREATE and GRANT failures propagate.
pub async fn create_scratch(
    session: &dyn AdminSession,
    name: &str,
    protected: &str,
    user: &str,
) -> Result<(String, DropOutcome)> {
    // Clear the previous scratch database, if any
    let outcome = drop_previous(session, name, protected).await;
    session.create_database(name).await?;
    session.grant_all(name, user).await?;
    info!("Created database {} for {}", name, user);
    Ok((name.to_string(), outcome))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotionReport {
    pub active: String,
    /// Backends terminated on the active and scratch databases.
    pub terminated: u64,
    /// The previous active database, when it could not be dropped.
    pub retained: Option<String>,
}

// Terminate sessions on `from` and rename it, retrying while sessions keep
// reappearing.
async fn rename_exclusive(
    session: &dyn AdminSession,
    from: &str,
    to: &str,
    step: PromotionStep,
) -> std::result::Result<u64, (PromotionStep, SqlError)> {
    let mut terminated = 0;
    let mut attempt = 1;
    loop {
        terminated += session
            .terminate_connections(from)
            .await
            .map_err(|e| (PromotionStep::Terminate, e))?;
        match session.rename_database(from, to).await {
            Ok(()) => {
                debug!("Renamed {} to {}", from, to);
                return Ok(terminated);
            }
            Err(e) if e.is_object_in_use() && attempt < RENAME_ATTEMPTS => {
                warn!(
                    "{} is still in use (attempt {}/{}), terminating again",
                    from, attempt, RENAME_ATTEMPTS
                );
                attempt += 1;
            }
            Err(e) => return Err((step, e)),
        }
    }
}

/// Swap `scratch` into the name `active`, parking the old database as `retired`.
///
/// # Arguments
///
/// * `session` - Admin session on the server
/// * `scratch` - Restored database to promote
/// * `active` - Name the promoted database takes over
/// * `retired` - Temporary name for the previous active database
///
/// # Returns
///
/// A report with the terminated session count and any retired database that
/// could not be dropped. `PromotionFailed` names the failed step and whether
/// the active name was restored.
pub async fn promote_scratch(
    session: &dyn AdminSession,
    scratch: &str,
    active: &str,
    retired: &str,
) -> Result<PromotionReport> {
    // Refuse before touching anything
    if scratch == active {
        return Err(BackupError::NameCollision(scratch.to_string()));
    }
    if !session.database_exists(scratch).await? {
        return Err(BackupError::ScratchMissing(scratch.to_string()));
    }

    let failed = |step: PromotionStep, rolled_back: bool, source: SqlError| BackupError::PromotionFailed {
        scratch: scratch.to_string(),
        active: active.to_string(),
        step,
        rolled_back,
        source,
    };

    let active_exists = session.database_exists(active).await?;
    let mut terminated = 0;
    if active_exists {
        if session.database_exists(retired).await? {
            warn!("Dropping {} left over from an interrupted promotion", retired);
            session.drop_database(retired).await?;
        }
        // Nothing has changed yet if this fails.
        terminated += rename_exclusive(session, active, retired, PromotionStep::RetireActive)
            .await
            .map_err(|(step, e)| failed(step, true, e))?;
    } else {
        warn!("Active database {} does not exist, promoting {} directly", active, scratch);
    }

    match rename_exclusive(session, scratch, active, PromotionStep::RenameScratch).await {
        Ok(n) => terminated += n,
        Err((step, e)) => {
            // Put the previous database back under the active name
            let rolled_back = if active_exists {
                match session.rename_database(retired, active).await {
                    Ok(()) => {
                        info!("Rolled back: {} renamed to {} again", retired, active);
                        true
                    }
                    Err(rollback) => {
                        error!(
                            "Rollback failed, the previous active database is now {}: {}",
                            retired, rollback
                        );
                        false
                    }
                }
            } else {
                true
            };
            return Err(failed(step, rolled_back, e));
        }
    }

    // The swap is done; a retired copy that cannot be dropped is only reported
    let mut retained = None;
    if active_exists {
        if let Err(source) = session.drop_database(retired).await {
            let err = BackupError::DropFailed {
                database: retired.to_string(),
                source,
            };
            warn!("{}; drop it manually once it is no longer needed", err);
            retained = Some(retired.to_string());
        }
    }

    Ok(PromotionReport {
        active: active.to_string(),
        terminated,
        retained,
    })
}

/// Scratch database lifecycle for one configured server and database.
/// Each operation opens its own admin session and closes it on return.
pub struct DatabaseLifecycle<'a> {
    connector: &'a dyn AdminConnector,
    pg: &'a PostgresConfig,
}

impl<'a> DatabaseLifecycle<'a> {
    /// # Arguments
    ///
    /// * `connector` - Opens admin sessions on the server
    /// * `pg` - Connection settings; the scratch and retired names derive from `pg.database`
    pub fn new(connector: &'a dyn AdminConnector, pg: &'a PostgresConfig) -> Self {
        Self { connector, pg }
    }

    /// Recreate the scratch database, ready for pg_restore.
    ///
    /// # Returns
    ///
    /// The scratch database in the `Created` state
    pub async fn create_scratch(&self) -> Result<ScratchDatabase> {
        let mut scratch = ScratchDatabase::new(self.pg.scratch_database());
        let session = self.connector.connect().await?;
        match create_scratch(session.as_ref(), &scratch.name, &self.pg.database, &self.pg.user).await {
            Ok(_) => {
                scratch.transition(ScratchState::Created);
                Ok(scratch)
            }
            Err(e) => {
                scratch.mark_failed();
                Err(e)
            }
        }
    }

    /// Promote the scratch database into the active database's name.
    ///
    /// # Returns
    ///
    /// The scratch database in the `Promoted` state and the promotion report
    pub async fn promote(&self) -> Result<(ScratchDatabase, PromotionReport)> {
        let mut scratch = ScratchDatabase::new(self.pg.scratch_database());
        let session = self.connector.connect().await?;
        if session.database_exists(&scratch.name).await? {
            // Whatever was restored into it in an earlier run.
            scratch.transition(ScratchState::Restored);
        }
        match promote_scratch(
            session.as_ref(),
            &scratch.name,
            &self.pg.database,
            &self.pg.retired_database(),
        )
        .await
        {
            Ok(report) => {
                scratch.transition(ScratchState::Promoted);
                Ok((scratch, report))
            }
            Err(e) => {
                if scratch.state() != ScratchState::Absent {
                    scratch.mark_failed();
                }
                Err(e)
            }
        }
    }
}
