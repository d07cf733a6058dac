//! Chat database module - SQLite storage for conversations and their context
pub mod schema;
pub mod error;
pub mod merge;
pub mod migration;
pub mod conversation_store;
pub use schema::*;
pub use error::{ErrorKind, StoreError, StoreResult};
pub use migration::{MigrationReport, SchemaMigrator};
pub use conversation_store::ConversationStore;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use r2d2::{CustomizeConnection, Pool};
use r2d2_sqlite::SqliteConnectionManager;
use tracing::info;

/// Options for opening an on-disk database
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    pub path: PathBuf,
    pub backup_dir: Option<PathBuf>,
    pub default_model: String,
    pub pool_size: u32,
}

impl DatabaseOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            backup_dir: None,
            default_model: CANONICAL_MODEL.to_string(),
            pool_size: 8,
        }
    }
}

/// Per-connection pragmas
#[derive(Debug)]
struct SqlitePragmaCustomizer;

impl CustomizeConnection<rusqlite::Connection, rusqlite::Error> for SqlitePragmaCustomizer {
    fn on_acquire(&self, conn: &mut rusqlite::Connection) -> Result<(), rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA synchronous = NORMAL;",
        )
    }
}

/// An opened, migrated chat database.
///
/// Opening is a two-step startup: the schema is reconciled on a pooled
/// connection first, and the [`ConversationStore`] is only built once that
/// succeeded. A failed migration returns [`StoreError::Migration`] and no
/// store is ever handed out.
pub struct ChatDatabase {
    pub conversations: ConversationStore,
    pool: Arc<Pool<SqliteConnectionManager>>,
    migration: MigrationReport,
}

impl ChatDatabase {
    pub fn open(options: &DatabaseOptions) -> StoreResult<Self> {
        let db_path = options.path.as_path();
        info!("Opening chat database at: {}", db_path.display());
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(db_path)
            .with_flags(
                rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
                | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
                | rusqlite::OpenFlags::SQLITE_OPEN_FULL_MUTEX,
            );
        let pool = Pool::builder()
            .max_size(options.pool_size.max(1))
            .connection_customizer(Box::new(SqlitePragmaCustomizer))
            .build(manager)?;

        let migration = {
            let mut conn = pool.get()?;
            let report = SchemaMigrator::new(&mut conn)
                .with_backup(db_path, options.backup_dir.as_deref())
                .reconcile()?;
            conn.execute_batch("PRAGMA journal_mode = WAL;")?;
            report
        };

        let pool = Arc::new(pool);
        info!("Chat database initialized successfully");
        Ok(Self {
            conversations: ConversationStore::new(Arc::clone(&pool), options.default_model.clone()),
            pool,
            migration,
        })
    }

    /// Private in-memory database. The pool holds a single connection
    /// because every SQLite memory connection is its own database.
    pub fn new_in_memory() -> StoreResult<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)?;
        let migration = {
            let mut conn = pool.get()?;
            SchemaMigrator::new(&mut conn).reconcile()?
        };
        let pool = Arc::new(pool);
        Ok(Self {
            conversations: ConversationStore::new(Arc::clone(&pool), CANONICAL_MODEL),
            pool,
            migration,
        })
    }

    /// Report of the startup migration
    pub fn migration_report(&self) -> &MigrationReport {
        &self.migration
    }

    pub fn path_of_backup(&self) -> Option<&Path> {
        self.migration.backup_path.as_deref()
    }
}

impl Drop for ChatDatabase {
    fn drop(&mut self) {
        if let Ok(conn) = self.pool.get() {
            let _ = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);");
        }
    }
}
