use std::path::PathBuf;

use chrono::NaiveDate;
use clap::{Parser, ValueEnum};
use log::LevelFilter;

use crate::config::{AppConfig, PostgresConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Action {
    /// List the backups in BACKUP_PATH
    List,
    /// Dump the active database and compress the dump
    Backup,
    /// Restore a backup into the scratch database
    Restore,
    /// Promote the scratch database to the active database
    Active,
}

fn parse_date(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|e| format!("expected YYYY-MM-DD, got {:?}: {}", value, e))
}

fn parse_level(value: &str) -> Result<LevelFilter, String> {
    value
        .parse()
        .map_err(|_| format!("unknown log level {:?}", value))
}

/// Command-line options for pgstage
#[derive(Debug, Parser)]
#[command(name = "pgstage", version)]
#[command(about = "PostgreSQL backup and staged restore")]
pub struct Cli {
    #[arg(long, value_enum, help = "Action to run")]
    pub action: Action,

    #[arg(
        long,
        value_name = "YYYY-MM-DD",
        value_parser = parse_date,
        required_if_eq("action", "restore"),
        help = "Date to use for restore (show with --action list)"
    )]
    pub date: Option<NaiveDate>,

    #[arg(long, env = "BACKUP_PATH", help = "Directory holding the backup files")]
    pub backup_path: PathBuf,

    #[arg(long, default_value = "localhost", env = "PSQL_HOST", help = "Postgres Host")]
    pub host: String,

    #[arg(long, default_value_t = 5432, env = "PSQL_PORT", help = "Postgres Port")]
    pub port: u16,

    #[arg(long, env = "PSQL_DATABASE", help = "Active database name")]
    pub database: String,

    #[arg(long, default_value = "postgres", env = "PSQL_ADMIN_DATABASE", help = "Database to connect to for administrative commands")]
    pub admin_database: String,

    #[arg(long, env = "PSQL_USER", help = "Postgres Username")]
    pub user: String,

    #[arg(long, env = "PSQL_PASSWORD", hide_env_values = true, help = "Postgres Password")]
    pub password: Option<String>,

    #[arg(long, default_value = "false", env = "PSQL_USE_SSL", help = "Postgres Enable SSL")]
    pub use_ssl: bool,

    #[arg(long, default_value = "false", env = "PSQL_VERIFY_SSL", help = "Postgres Verify SSL certificates")]
    pub verify_ssl: bool,

    #[arg(long, env = "PSQL_ROOT_CERT_PATH", help = "Postgres Path to custom root certificates")]
    pub root_cert_path: Option<PathBuf>,

    #[arg(long, default_value = "pg_dump", env = "PG_DUMP_BIN", help = "pg_dump executable")]
    pub pg_dump_bin: String,

    #[arg(long, default_value = "pg_restore", env = "PG_RESTORE_BIN", help = "pg_restore executable")]
    pub pg_restore_bin: String,

    #[arg(long, default_value = "info", env = "LOG_LEVEL", value_parser = parse_level, help = "Log level")]
    pub log_level: LevelFilter,

    #[arg(long, env = "LOG_FILE", help = "Also write the log to this file")]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    /// Backup key for the requested restore date: `YYYY-MM-DD` without dashes.
    pub fn restore_key(&self) -> Option<String> {
        self.date.map(|d| d.format("%Y%m%d").to_string())
    }

    pub fn to_config(&self) -> AppConfig {
        AppConfig {
            backup_path: self.backup_path.clone(),
            postgres: PostgresConfig {
                host: self.host.clone(),
                port: self.port,
                database: self.database.clone(),
                admin_database: self.admin_database.clone(),
                user: self.user.clone(),
                password: self.password.clone(),
                use_ssl: self.use_ssl,
                verify_ssl: self.verify_ssl,
                root_cert_path: self.root_cert_path.clone(),
            },
            pg_dump_bin: self.pg_dump_bin.clone(),
            pg_restore_bin: self.pg_restore_bin.clone(),
        }
    }
}
