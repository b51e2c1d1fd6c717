// In-memory stand-in for a PostgreSQL server, driven through the same
// AdminSession trait as the real one.
#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use pgstage::config::{AppConfig, PostgresConfig};
use pgstage::error::{BackupError, Result, SqlError};
use pgstage::lifecycle::{AdminConnector, AdminSession};

#[derive(Default)]
pub struct ServerState {
    pub databases: BTreeSet<String>,
    /// Open backends per database.
    pub connections: HashMap<String, u32>,
    /// How many more times a database gets a new backend right after its
    /// backends were terminated.
    pub reconnecting: HashMap<String, u32>,
    /// Mutating statements in the order they succeeded.
    pub statements: Vec<String>,
    pub unreachable: bool,
    failures: Vec<(String, String, SqlError)>,
}

impl ServerState {
    fn take_failure(&mut self, op: &str, name: &str) -> Option<SqlError> {
        let pos = self
            .failures
            .iter()
            .position(|(o, n, _)| o == op && n == name)?;
        Some(self.failures.remove(pos).2)
    }
}

#[derive(Clone, Default)]
pub struct FakeServer {
    pub state: Arc<Mutex<ServerState>>,
}

impl FakeServer {
    pub fn with_databases(names: &[&str]) -> Self {
        let server = FakeServer::default();
        server
            .state
            .lock()
            .unwrap()
            .databases
            .extend(names.iter().map(|n| n.to_string()));
        server
    }

    pub fn databases(&self) -> Vec<String> {
        self.state.lock().unwrap().databases.iter().cloned().collect()
    }

    pub fn has(&self, name: &str) -> bool {
        self.state.lock().unwrap().databases.contains(name)
    }

    pub fn statements(&self) -> Vec<String> {
        self.state.lock().unwrap().statements.clone()
    }

    pub fn set_connections(&self, database: &str, count: u32) {
        self.state
            .lock()
            .unwrap()
            .connections
            .insert(database.to_string(), count);
    }

    pub fn set_reconnecting(&self, database: &str, times: u32) {
        self.state
            .lock()
            .unwrap()
            .reconnecting
            .insert(database.to_string(), times);
    }

    /// Make the next `op` on `name` fail with `code`.
    pub fn fail(&self, op: &str, name: &str, code: &str) {
        self.state.lock().unwrap().failures.push((
            op.to_string(),
            name.to_string(),
            SqlError::new(Some(code), format!("injected {} failure on {}", op, name)),
        ));
    }

    pub fn set_unreachable(&self) {
        self.state.lock().unwrap().unreachable = true;
    }

    pub fn session(&self) -> FakeSession {
        FakeSession {
            state: self.state.clone(),
        }
    }
}

pub struct FakeSession {
    state: Arc<Mutex<ServerState>>,
}

fn missing(name: &str) -> SqlError {
    SqlError::new(Some("3D000"), format!("database \"{}\" does not exist", name))
}

fn duplicate(name: &str) -> SqlError {
    SqlError::new(Some("42P04"), format!("database \"{}\" already exists", name))
}

fn in_use(name: &str) -> SqlError {
    SqlError::new(
        Some("55006"),
        format!("database \"{}\" is being accessed by other users", name),
    )
}

#[async_trait]
impl AdminSession for FakeSession {
    async fn database_exists(&self, name: &str) -> std::result::Result<bool, SqlError> {
        Ok(self.state.lock().unwrap().databases.contains(name))
    }

    async fn create_database(&self, name: &str) -> std::result::Result<(), SqlError> {
        let mut s = self.state.lock().unwrap();
        if let Some(e) = s.take_failure("create", name) {
            return Err(e);
        }
        if !s.databases.insert(name.to_string()) {
            return Err(duplicate(name));
        }
        s.statements.push(format!("CREATE {}", name));
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> std::result::Result<(), SqlError> {
        let mut s = self.state.lock().unwrap();
        if let Some(e) = s.take_failure("drop", name) {
            return Err(e);
        }
        if !s.databases.contains(name) {
            return Err(missing(name));
        }
        if s.connections.get(name).copied().unwrap_or(0) > 0 {
            return Err(in_use(name));
        }
        s.databases.remove(name);
        s.statements.push(format!("DROP {}", name));
        Ok(())
    }

    async fn grant_all(&self, database: &str, user: &str) -> std::result::Result<(), SqlError> {
        let mut s = self.state.lock().unwrap();
        if let Some(e) = s.take_failure("grant", database) {
            return Err(e);
        }
        if !s.databases.contains(database) {
            return Err(missing(database));
        }
        s.statements.push(format!("GRANT {} {}", database, user));
        Ok(())
    }

    async fn rename_database(&self, from: &str, to: &str) -> std::result::Result<(), SqlError> {
        let mut s = self.state.lock().unwrap();
        if let Some(e) = s.take_failure("rename", from) {
            return Err(e);
        }
        if !s.databases.contains(from) {
            return Err(missing(from));
        }
        if s.databases.contains(to) {
            return Err(duplicate(to));
        }
        if s.connections.get(from).copied().unwrap_or(0) > 0 {
            return Err(in_use(from));
        }
        s.databases.remove(from);
        s.databases.insert(to.to_string());
        s.statements.push(format!("RENAME {} {}", from, to));
        Ok(())
    }

    async fn terminate_connections(&self, database: &str) -> std::result::Result<u64, SqlError> {
        let mut guard = self.state.lock().unwrap();
        let s = &mut *guard;
        if let Some(e) = s.take_failure("terminate", database) {
            return Err(e);
        }
        let terminated = s.connections.remove(database).unwrap_or(0);
        if let Some(left) = s.reconnecting.get_mut(database) {
            if *left > 0 {
                *left -= 1;
                s.connections.insert(database.to_string(), 1);
            }
        }
        s.statements.push(format!("TERMINATE {}", database));
        Ok(terminated as u64)
    }
}

#[async_trait]
impl AdminConnector for FakeServer {
    async fn connect(&self) -> Result<Box<dyn AdminSession>> {
        if self.state.lock().unwrap().unreachable {
            return Err(BackupError::Connection {
                host: "localhost".to_string(),
                port: 5432,
                database: "postgres".to_string(),
                message: "connection refused".to_string(),
            });
        }
        let session: Box<dyn AdminSession> = Box::new(self.session());
        Ok(session)
    }
}

pub fn postgres_config() -> PostgresConfig {
    PostgresConfig {
        host: "localhost".to_string(),
        port: 5432,
        database: "residence".to_string(),
        admin_database: "postgres".to_string(),
        user: "admin".to_string(),
        password: Some("secret".to_string()),
        use_ssl: false,
        verify_ssl: false,
        root_cert_path: None,
    }
}

pub fn app_config(backup_path: &Path) -> AppConfig {
    AppConfig {
        backup_path: backup_path.to_path_buf(),
        postgres: postgres_config(),
        pg_dump_bin: "pg_dump".to_string(),
        pg_restore_bin: "pg_restore".to_string(),
    }
}

/// Write an executable shell script and return its path.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
