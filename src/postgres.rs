// PostgreSQL admin sessions for the lifecycle manager.
//
// Connections go to the admin database (normally `postgres`) because a
// database cannot be dropped or renamed while we are connected to it.

use anyhow::Context;
use async_trait::async_trait;
use log::{debug, error};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::Config as PgConfig;

use crate::config::PostgresConfig;
use crate::error::{BackupError, Result, SqlError};
use crate::lifecycle::{AdminConnector, AdminSession};

/// Connect to PostgreSQL with SSL security
///
/// Builds a native-tls connector, optionally trusting an extra root
/// certificate, and spawns the connection driver.
///
/// # Arguments
///
/// * `config` - PostgreSQL connection configuration
/// * `verify` - Whether to verify certificates (false accepts self-signed servers)
/// * `root_cert_path` - Optional PEM root certificate added to the trust store
///
/// # Returns
///
/// The connected client, or the TLS/connection error with context
pub async fn connect_ssl(
    config: &PgConfig,
    verify: bool,
    root_cert_path: Option<&std::path::Path>,
) -> anyhow::Result<tokio_postgres::Client> {
    debug!("Building TLS connector for PostgreSQL connection");
    // Start from the platform trust store
    let mut builder = TlsConnector::builder();

    if !verify {
        debug!("SSL certificate verification disabled");
        builder.danger_accept_invalid_certs(true);
    }

    if let Some(path) = root_cert_path {
        debug!("Loading custom root certificate from: {}", path.display());
        let cert_data = std::fs::read(path)
            .with_context(|| format!("reading root certificate {}", path.display()))?;
        let cert = native_tls::Certificate::from_pem(&cert_data)?;
        builder.add_root_certificate(cert);
    }

    // Wrap the native-tls connector for tokio-postgres
    let connector = MakeTlsConnector::new(builder.build()?);

    debug!("Attempting to connect to PostgreSQL with SSL");
    let (client, connection) = config.connect(connector).await?;

    // The connection future must be polled for the client to make progress.
    // It finishes when the client is dropped.
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("PostgreSQL connection error: {}", e);
        }
    });

    Ok(client)
}

/// Connect to PostgreSQL without SSL security
///
/// Only suitable for local servers or trusted networks.
///
/// # Arguments
///
/// * `config` - PostgreSQL connection configuration
///
/// # Returns
///
/// The connected client, or the connection error
pub async fn connect_no_ssl(config: &PgConfig) -> anyhow::Result<tokio_postgres::Client> {
    debug!("Attempting to connect to PostgreSQL without SSL");
    let (client, connection) = config.connect(tokio_postgres::NoTls).await?;

    // Drive the connection in the background until the client is dropped
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("PostgreSQL connection error: {}", e);
        }
    });

    Ok(client)
}

/// Quote an identifier for interpolation into DDL.
///
/// Database names cannot be bound as parameters in CREATE/DROP/ALTER
/// DATABASE, so they are double-quoted with embedded quotes doubled.
///
/// # Arguments
///
/// * `name` - Database or role name
///
/// # Returns
///
/// The quoted identifier
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `CREATE DATABASE` statement for `name`.
pub fn create_database_sql(name: &str) -> String {
    format!("CREATE DATABASE {}", quote_ident(name))
}

pub fn drop_database_sql(name: &str) -> String {
    format!("DROP DATABASE {}", quote_ident(name))
}

/// Grant `user` every privilege on `database`.
pub fn grant_all_sql(database: &str, user: &str) -> String {
    format!(
        "GRANT ALL PRIVILEGES ON DATABASE {} TO {}",
        quote_ident(database),
        quote_ident(user)
    )
}

pub fn rename_database_sql(from: &str, to: &str) -> String {
    format!("ALTER DATABASE {} RENAME TO {}", quote_ident(from), quote_ident(to))
}

const TERMINATE_SQL: &str = "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
     WHERE pid <> pg_backend_pid() AND datname = $1";

const EXISTS_SQL: &str = "SELECT 1 FROM pg_database WHERE datname = $1";

/// An admin connection. DDL goes through the simple query protocol, outside
/// any transaction block. The connection closes when the session is dropped.
pub struct PgAdminSession {
    client: tokio_postgres::Client,
}

impl PgAdminSession {
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self { client }
    }

    // Simple query protocol: no implicit transaction around the statement.
    async fn ddl(&self, sql: String) -> std::result::Result<(), SqlError> {
        debug!("Executing: {}", sql);
        self.client.batch_execute(&sql).await.map_err(SqlError::from)
    }
}

#[async_trait]
impl AdminSession for PgAdminSession {
    async fn database_exists(&self, name: &str) -> std::result::Result<bool, SqlError> {
        let row = self.client.query_opt(EXISTS_SQL, &[&name]).await?;
        Ok(row.is_some())
    }

    async fn create_database(&self, name: &str) -> std::result::Result<(), SqlError> {
        self.ddl(create_database_sql(name)).await
    }

    async fn drop_database(&self, name: &str) -> std::result::Result<(), SqlError> {
        self.ddl(drop_database_sql(name)).await
    }

    async fn grant_all(&self, database: &str, user: &str) -> std::result::Result<(), SqlError> {
        self.ddl(grant_all_sql(database, user)).await
    }

    async fn rename_database(&self, from: &str, to: &str) -> std::result::Result<(), SqlError> {
        self.ddl(rename_database_sql(from, to)).await
    }

    async fn terminate_connections(&self, database: &str) -> std::result::Result<u64, SqlError> {
        let rows = self.client.query(TERMINATE_SQL, &[&database]).await?;
        debug!("Terminated {} connections to {}", rows.len(), database);
        Ok(rows.len() as u64)
    }
}

/// Opens `PgAdminSession`s against the configured admin database.
pub struct PgConnector {
    pg: PostgresConfig,
}

impl PgConnector {
    /// Create a connector for the server described by `pg`.
    ///
    /// # Arguments
    ///
    /// * `pg` - Connection settings; sessions use `pg.admin_database`
    pub fn new(pg: PostgresConfig) -> Self {
        Self { pg }
    }
}

#[async_trait]
impl AdminConnector for PgConnector {
    async fn connect(&self) -> Result<Box<dyn AdminSession>> {
        let config = self.pg.admin_pg_config();
        // Pick the transport from the configuration
        let result = if self.pg.use_ssl {
            connect_ssl(&config, self.pg.verify_ssl, self.pg.root_cert_path.as_deref()).await
        } else {
            connect_no_ssl(&config).await
        };
        match result {
            Ok(client) => {
                let session: Box<dyn AdminSession> = Box::new(PgAdminSession::new(client));
                Ok(session)
            }
            // Keep the whole anyhow context chain in the message
            Err(e) => Err(BackupError::Connection {
                host: self.pg.host.clone(),
                port: self.pg.port,
                database: self.pg.admin_database.clone(),
                message: format!("{:#}", e),
            }),
        }
    }
}
