mod key;
mod migrations;
pub mod queries;
mod schema;
mod table;


use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, ErrorCode};
use thiserror::Error;

use crate::bus::{BusError, DbEventData, DbEventType, EventBus};

pub use key::{Key, Keys};
pub use schema::{DatabaseSchema, IndexKind, IndexSpec, PrimaryKey, TableSchema};
pub use table::{InsertOptions, Lookup, Query, Table};

const BUSY_TIMEOUT_MS: u64 = 5_000;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
    #[error("migration failed: {0}")]
    Migration(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("invalid schema: {0}")]
    InvalidSchema(String),
    #[error("table `{table}` changed without a version bump")]
    SchemaMismatch { table: String },
    #[error("stored database version {stored} is newer than declared version {declared}")]
    VersionDowngrade { stored: u32, declared: u32 },
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("row for table `{table}` has no usable primary key")]
    MissingKey { table: String },
    #[error("unknown table: {0}")]
    UnknownTable(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Bus(#[from] BusError),
}

impl From<rusqlite::Error> for DbError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, message) = &err {
            if failure.code == ErrorCode::ConstraintViolation {
                return DbError::Constraint(
                    message.clone().unwrap_or_else(|| failure.to_string()),
                );
            }
        }
        DbError::Sqlite(err)
    }
}

/// Shared handle to the on-device store of one origin.
///
/// The handle starts unconnected; the first operation opens the SQLite file,
/// applies the declared schema and broadcasts `TABLE_UPGRADE` for every table
/// whose layout changed with a version bump.
pub struct Database {
    schema: DatabaseSchema,
    path: Option<PathBuf>,
    bus: Arc<EventBus>,
    conn: Mutex<Option<Connection>>,
}

impl Database {
    /// Create an unconnected handle for `<data_dir>/<schema.name>.sqlite3`.
    pub fn new(
        schema: DatabaseSchema,
        data_dir: impl AsRef<Path>,
        bus: Arc<EventBus>,
    ) -> Result<Self, DbError> {
        schema.validate()?;
        let path = data_dir
            .as_ref()
            .join(format!("{}.sqlite3", schema.name));
        Ok(Self {
            schema,
            path: Some(path),
            bus,
            conn: Mutex::new(None),
        })
    }

    #[cfg(test)]
    /// An in-memory store, private to this handle.
    pub(crate) fn in_memory(schema: DatabaseSchema, bus: Arc<EventBus>) -> Result<Self, DbError> {
        schema.validate()?;
        Ok(Self {
            schema,
            path: None,
            bus,
            conn: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.schema.name
    }

    pub fn version(&self) -> u32 {
        self.schema.version
    }

    pub fn schema(&self) -> &DatabaseSchema {
        &self.schema
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn table_schema(&self, table: &str) -> Result<&TableSchema, DbError> {
        self.schema
            .get(table)
            .ok_or_else(|| DbError::UnknownTable(table.to_string()))
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    /// Open the store if it is not open yet. Idempotent.
    pub fn open(&self) -> Result<(), DbError> {
        let upgraded = {
            let mut guard = self.lock();
            if guard.is_some() {
                return Ok(());
            }
            let conn = self.connect()?;
            let upgraded = migrations::apply_schema(&conn, &self.schema)?;
            *guard = Some(conn);
            upgraded
        };

        // Handlers may call back into the store, so the lock is released first.
        for table in upgraded {
            tracing::info!(db = %self.schema.name, %table, "table upgraded");
            self.emit(DbEventData::for_table(
                DbEventType::TableUpgrade,
                &self.schema.name,
                &table,
                Vec::new(),
            ))?;
        }
        Ok(())
    }

    /// Run `f` against the open connection, opening it first if needed.
    pub(crate) fn with_conn<R>(
        &self,
        f: impl FnOnce(&Connection) -> Result<R, DbError>,
    ) -> Result<R, DbError> {
        self.open()?;
        let guard = self.lock();
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(DbError::Migration("connection closed unexpectedly".into())),
        }
    }

    /// Broadcast a DB event for this store. Table and cache events never ask
    /// for self-delivery; whether the local bus honours that is bus policy.
    pub(crate) fn emit(&self, data: DbEventData) -> Result<(), DbError> {
        self.bus.broadcast_db_event(data.into_event().no_self())?;
        Ok(())
    }

    fn connect(&self) -> Result<Connection, DbError> {
        let conn = match &self.path {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                tracing::debug!(path = %path.display(), "opening database");
                Connection::open(path)?
            }
            None => Connection::open_in_memory()?,
        };
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS))?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Ok(conn)
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
