use std::env;
use std::path::PathBuf;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use tokio_postgres::config::SslMode;
use tokio_postgres::Config as PgConfig;

/// Suffix appended to the active database name to form the scratch database.
pub const SCRATCH_SUFFIX: &str = "_restore";
/// Suffix the active database carries while a promotion swaps it out.
pub const RETIRED_SUFFIX: &str = "_retired";

// Userinfo and path segments of a postgres URL keep only unreserved characters.
const URL_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Load environment variables from .env file or from the file specified in DOTENV_PATH
///
/// Returns the path of the file that was loaded, if any.
pub fn load_env() -> Option<PathBuf> {
    match env::var("DOTENV_PATH") {
        Ok(dotenv_path) => dotenvy::from_path(&dotenv_path)
            .ok()
            .map(|_| PathBuf::from(dotenv_path)),
        Err(_) => dotenvy::dotenv().ok(),
    }
}

/// Connection settings for the PostgreSQL server that hosts the active database.
#[derive(Clone, Debug, PartialEq)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    /// The active (production) database.
    pub database: String,
    /// Database used for administrative connections (CREATE/DROP/ALTER DATABASE).
    pub admin_database: String,
    pub user: String,
    pub password: Option<String>,
    pub use_ssl: bool,
    pub verify_ssl: bool,
    pub root_cert_path: Option<PathBuf>,
}

impl PostgresConfig {
    /// Name of the scratch database restores are staged into.
    pub fn scratch_database(&self) -> String {
        format!("{}{}", self.database, SCRATCH_SUFFIX)
    }

    /// Name the active database is parked under during promotion.
    pub fn retired_database(&self) -> String {
        format!("{}{}", self.database, RETIRED_SUFFIX)
    }

    /// Connection URL for `dbname`, as passed to pg_dump and pg_restore.
    pub fn connection_url(&self, dbname: &str) -> String {
        let password = self
            .password
            .as_deref()
            .map(|p| utf8_percent_encode(p, URL_COMPONENT).to_string());
        self.url_with(password.as_deref(), dbname)
    }

    /// Same as `connection_url` with the password masked, for logging.
    pub fn redacted_url(&self, dbname: &str) -> String {
        self.url_with(self.password.as_ref().map(|_| "****"), dbname)
    }

    // `password` must already be encoded.
    fn url_with(&self, password: Option<&str>, dbname: &str) -> String {
        let user = utf8_percent_encode(&self.user, URL_COMPONENT);
        let credentials = match password {
            Some(password) => format!("{}:{}", user, password),
            None => user.to_string(),
        };
        format!(
            "postgresql://{}@{}:{}/{}",
            credentials,
            self.host,
            self.port,
            utf8_percent_encode(dbname, URL_COMPONENT)
        )
    }

    /// PGSSLMODE to force on pg_dump and pg_restore. `None` leaves whatever the
    /// operator exported in place.
    pub fn tool_ssl_mode(&self) -> Option<&'static str> {
        if self.use_ssl {
            Some("require")
        } else {
            None
        }
    }

    /// tokio-postgres configuration for an administrative connection.
    pub fn admin_pg_config(&self) -> PgConfig {
        let mut config = PgConfig::new();
        config
            .host(&self.host)
            .port(self.port)
            .user(&self.user)
            .dbname(&self.admin_database)
            .application_name("pgstage");
        if let Some(password) = &self.password {
            config.password(password);
        }
        if self.use_ssl {
            config.ssl_mode(SslMode::Require);
        }
        config
    }
}

/// Everything a command needs, built once at startup and passed by reference.
#[derive(Clone, Debug, PartialEq)]
pub struct AppConfig {
    /// Directory holding `backup-<YYYYMMDD>-<HHMMSS>-<db>.dump.gz` files.
    pub backup_path: PathBuf,
    pub postgres: PostgresConfig,
    pub pg_dump_bin: String,
    pub pg_restore_bin: String,
}
