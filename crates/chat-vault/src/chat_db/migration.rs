//! Schema reconciliation for the chats table
//!
//! The table predates any version ledger, so the migrator diffs the physical
//! column set against [`CHAT_COLUMNS`] and adds whatever is missing. Existing
//! columns and rows are never altered or dropped.

use rusqlite::{params, Connection};
use tracing::{info, warn, error};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::chat_db::error::{StoreError, StoreResult};
use crate::chat_db::schema::{
    self, ColumnSpec, CANONICAL_MODEL, CHATS_TABLE, CHAT_COLUMNS, LEGACY_MODELS,
};

const UPDATED_AT_INDEX: &str = "idx_chats_updated_at";

/// What a reconcile pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    pub table_created: bool,
    pub columns_added: Vec<String>,
    pub legacy_models_updated: usize,
    pub changes: Vec<String>,
    pub errors: Vec<String>,
    pub backup_path: Option<PathBuf>,
}

impl MigrationReport {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_changes(&self) -> bool {
        !self.changes.is_empty()
    }

    fn record_change(&mut self, change: String) {
        info!("{}", change);
        self.changes.push(change);
    }

    fn record_error(&mut self, err: String) {
        error!("{}", err);
        self.errors.push(err);
    }
}

impl fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Migration summary")?;
        if self.changes.is_empty() {
            writeln!(f, "  no changes needed, schema is up to date")?;
        } else {
            writeln!(f, "  changes made:")?;
            for change in &self.changes {
                writeln!(f, "    - {}", change)?;
            }
        }
        if !self.errors.is_empty() {
            writeln!(f, "  errors encountered:")?;
            for err in &self.errors {
                writeln!(f, "    - {}", err)?;
            }
        }
        match &self.backup_path {
            Some(path) => write!(f, "  backup: {}", path.display()),
            None => write!(f, "  backup: none taken"),
        }
    }
}

/// Brings the chats table up to the current descriptor
pub struct SchemaMigrator<'a> {
    conn: &'a mut Connection,
    db_path: Option<PathBuf>,
    backup_dir: Option<PathBuf>,
}

impl<'a> SchemaMigrator<'a> {
    /// Migrator without a backing file; no snapshot is taken.
    pub fn new(conn: &'a mut Connection) -> Self {
        Self { conn, db_path: None, backup_dir: None }
    }

    /// Snapshot `db_path` into `backup_dir` (or next to the database) before mutating.
    pub fn with_backup(mut self, db_path: &Path, backup_dir: Option<&Path>) -> Self {
        self.db_path = Some(db_path.to_path_buf());
        self.backup_dir = backup_dir.map(Path::to_path_buf);
        self
    }

    /// Run the full pass: create or extend the table, normalize legacy
    /// model identifiers, then verify. Column failures do not stop the
    /// remaining columns; they are collected and returned together.
    pub fn reconcile(&mut self) -> StoreResult<MigrationReport> {
        info!("Reconciling '{}' table schema...", CHATS_TABLE);
        let mut report = MigrationReport::default();

        let existing = existing_columns(self.conn)?;
        let table_exists = !existing.is_empty();
        let missing: Vec<&ColumnSpec> = CHAT_COLUMNS
            .iter()
            .filter(|spec| !spec.primary_key && !has_column(&existing, spec.name))
            .collect();
        let legacy_rows = if has_column(&existing, "model") {
            self.count_legacy_models()?
        } else {
            0
        };
        let index_missing = !self.index_exists()?;

        let needs_changes = !table_exists || !missing.is_empty() || legacy_rows > 0 || index_missing;
        if !needs_changes {
            info!("Schema is up to date, {} columns present", existing.len());
            return Ok(report);
        }

        match self.snapshot() {
            Ok(path) => report.backup_path = path,
            Err(e) => {
                report.record_error(format!("Backup creation failed: {}", e));
                return Err(StoreError::Migration(Box::new(report)));
            }
        }

        if table_exists {
            for spec in missing {
                self.add_column(spec, &mut report);
            }
        } else {
            self.create_table(&mut report);
        }

        if index_missing {
            match self.conn.execute_batch(schema::INDEX_SQL) {
                Ok(()) => report.record_change(format!("Created index {}", UPDATED_AT_INDEX)),
                Err(e) => report.record_error(format!("Failed to create index {}: {}", UPDATED_AT_INDEX, e)),
            }
        }

        self.normalize_legacy_models(&mut report);
        self.verify(&mut report);

        if report.is_success() {
            info!("Schema reconciliation finished with {} change(s)", report.changes.len());
            Ok(report)
        } else {
            error!("Schema reconciliation failed with {} error(s)", report.errors.len());
            Err(StoreError::Migration(Box::new(report)))
        }
    }

    fn create_table(&mut self, report: &mut MigrationReport) {
        match self.conn.execute_batch(&schema::create_table_sql()) {
            Ok(()) => {
                report.table_created = true;
                report.record_change(format!("Created table '{}'", CHATS_TABLE));
            }
            Err(e) => report.record_error(format!("Failed to create table '{}': {}", CHATS_TABLE, e)),
        }
    }

    fn add_column(&mut self, spec: &ColumnSpec, report: &mut MigrationReport) {
        let sql = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            CHATS_TABLE, spec.name, spec.add_definition
        );
        if let Err(e) = self.conn.execute_batch(&sql) {
            report.record_error(format!("Failed to add column {}: {}", spec.name, e));
            return;
        }
        report.columns_added.push(spec.name.to_string());
        report.record_change(format!("Added column: {} {}", spec.name, spec.add_definition));

        if let Some(expr) = spec.backfill {
            let sql = format!(
                "UPDATE {table} SET {col} = {expr} WHERE {col} IS NULL",
                table = CHATS_TABLE,
                col = spec.name,
                expr = expr,
            );
            match self.conn.execute(&sql, []) {
                Ok(0) => {}
                Ok(rows) => report.record_change(format!("Backfilled {} in {} row(s)", spec.name, rows)),
                Err(e) => report.record_error(format!("Failed to backfill {}: {}", spec.name, e)),
            }
        }
    }

    fn count_legacy_models(&self) -> rusqlite::Result<usize> {
        let mut total = 0usize;
        for legacy in LEGACY_MODELS {
            let count: i64 = self.conn.query_row(
                "SELECT COUNT(*) FROM chats WHERE model = ?1",
                [legacy],
                |row| row.get(0),
            )?;
            total += count as usize;
        }
        Ok(total)
    }

    /// Data fix, not a schema step: old model ids map to the canonical one.
    fn normalize_legacy_models(&mut self, report: &mut MigrationReport) {
        match existing_columns(self.conn) {
            Ok(cols) if has_column(&cols, "model") => {}
            Ok(_) => return,
            Err(e) => {
                report.record_error(format!("Failed to inspect columns before model update: {}", e));
                return;
            }
        }

        let updated = (|| -> rusqlite::Result<Vec<(&'static str, usize)>> {
            let tx = self.conn.transaction()?;
            let mut updated = Vec::new();
            for legacy in LEGACY_MODELS {
                let rows = tx.execute(
                    "UPDATE chats SET model = ?1 WHERE model = ?2",
                    params![CANONICAL_MODEL, legacy],
                )?;
                if rows > 0 {
                    updated.push((*legacy, rows));
                }
            }
            tx.commit()?;
            Ok(updated)
        })();

        match updated {
            Ok(updated) => {
                for (legacy, rows) in updated {
                    report.legacy_models_updated += rows;
                    report.record_change(format!(
                        "Updated {} chat(s) from '{}' to '{}'",
                        rows, legacy, CANONICAL_MODEL
                    ));
                }
            }
            Err(e) => report.record_error(format!("Failed to update model defaults: {}", e)),
        }
    }

    fn verify(&self, report: &mut MigrationReport) {
        match existing_columns(self.conn) {
            Ok(cols) => {
                let missing: Vec<&str> = CHAT_COLUMNS
                    .iter()
                    .filter(|spec| !has_column(&cols, spec.name))
                    .map(|spec| spec.name)
                    .collect();
                if missing.is_empty() {
                    info!("Migration verification successful, all expected columns present");
                } else {
                    report.record_error(format!(
                        "Verification failed, missing columns: {}",
                        missing.join(", ")
                    ));
                }
            }
            Err(e) => report.record_error(format!("Verification could not read columns: {}", e)),
        }
    }

    fn index_exists(&self) -> rusqlite::Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'index' AND name = ?1",
            [UPDATED_AT_INDEX],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Byte copy of the database file. Skipped for in-memory stores and
    /// for files that do not exist yet or are still empty.
    fn snapshot(&self) -> std::io::Result<Option<PathBuf>> {
        let Some(db_path) = &self.db_path else {
            return Ok(None);
        };
        match std::fs::metadata(db_path) {
            Ok(meta) if meta.len() > 0 => {}
            _ => {
                info!("Database file does not exist yet, no backup needed");
                return Ok(None);
            }
        }

        // Fold any WAL content into the main file so the copy is complete.
        if let Err(e) = self.conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
            warn!("WAL checkpoint before backup failed: {}", e);
        }

        let dir = match &self.backup_dir {
            Some(dir) => dir.clone(),
            None => db_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };
        std::fs::create_dir_all(&dir)?;

        let stem = db_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("chats");
        let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S_%3f");
        let backup_path = dir.join(format!("{}_backup_{}.db", stem, stamp));

        std::fs::copy(db_path, &backup_path)?;
        info!("Backup created: {}", backup_path.display());
        Ok(Some(backup_path))
    }
}

/// Column names of the chats table, empty when the table does not exist.
pub fn existing_columns(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", CHATS_TABLE))?;
    let columns = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

// SQLite identifiers are case-insensitive.
fn has_column(columns: &[String], name: &str) -> bool {
    columns.iter().any(|c| c.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> (Connection, PathBuf) {
        let path = dir.path().join("chats.db");
        (Connection::open(&path).unwrap(), path)
    }

    fn backups_in(dir: &TempDir) -> usize {
        std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().contains("_backup_"))
            .count()
    }

    fn create_legacy_table(conn: &Connection) {
        conn.execute_batch(
            "CREATE TABLE chats (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                model TEXT NOT NULL,
                messages TEXT DEFAULT '[]'
            );
            INSERT INTO chats (id, title, model, messages)
            VALUES ('c1', 'Old chat', 'gemini-pro', '[{\"id\":\"m1\",\"sender\":\"user\",\"content\":\"hi\"}]');
            INSERT INTO chats (id, title, model) VALUES ('c2', 'Newer chat', 'custom-model');",
        )
        .unwrap();
    }

    #[test]
    fn test_fresh_database_creates_table_without_backup() {
        let dir = TempDir::new().unwrap();
        let (mut conn, path) = open(&dir);

        let report = SchemaMigrator::new(&mut conn)
            .with_backup(&path, None)
            .reconcile()
            .unwrap();

        assert!(report.table_created);
        assert!(report.backup_path.is_none());
        assert!(report.is_success());
        let cols = existing_columns(&conn).unwrap();
        assert_eq!(cols.len(), CHAT_COLUMNS.len());
        assert_eq!(backups_in(&dir), 0);
    }

    #[test]
    fn test_second_run_makes_no_changes() {
        let dir = TempDir::new().unwrap();
        let (mut conn, path) = open(&dir);
        create_legacy_table(&conn);

        let first = SchemaMigrator::new(&mut conn).with_backup(&path, None).reconcile().unwrap();
        assert!(first.has_changes());
        let cols_after_first = existing_columns(&conn).unwrap();

        let second = SchemaMigrator::new(&mut conn).with_backup(&path, None).reconcile().unwrap();
        assert!(!second.has_changes());
        assert!(second.columns_added.is_empty());
        assert!(second.backup_path.is_none());
        assert_eq!(existing_columns(&conn).unwrap(), cols_after_first);
        assert_eq!(backups_in(&dir), 1);
    }

    #[test]
    fn test_legacy_table_is_upgraded_in_place() {
        let dir = TempDir::new().unwrap();
        let (mut conn, path) = open(&dir);
        create_legacy_table(&conn);

        let report = SchemaMigrator::new(&mut conn).with_backup(&path, None).reconcile().unwrap();

        assert!(!report.table_created);
        assert_eq!(
            report.columns_added,
            vec![
                "master_rules", "character_sheet", "local_history", "current_plot",
                "relations", "aventura", "lastCompressionTime", "created_at", "updated_at",
            ]
        );
        assert_eq!(report.legacy_models_updated, 1);

        let (title, model, messages, rules, created): (String, String, String, String, Option<String>) = conn
            .query_row(
                "SELECT title, model, messages, master_rules, created_at FROM chats WHERE id = 'c1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
            )
            .unwrap();
        assert_eq!(title, "Old chat");
        assert_eq!(model, CANONICAL_MODEL);
        assert!(messages.contains("\"m1\""));
        assert_eq!(rules, "");
        assert!(created.is_some());

        let untouched: String = conn
            .query_row("SELECT model FROM chats WHERE id = 'c2'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(untouched, "custom-model");
    }

    #[test]
    fn test_backup_holds_pre_migration_state() {
        let dir = TempDir::new().unwrap();
        let (mut conn, path) = open(&dir);
        create_legacy_table(&conn);

        let report = SchemaMigrator::new(&mut conn).with_backup(&path, None).reconcile().unwrap();
        let backup = report.backup_path.expect("backup path");
        assert!(backup.exists());

        let snapshot = Connection::open(&backup).unwrap();
        let cols = existing_columns(&snapshot).unwrap();
        assert_eq!(cols, vec!["id", "title", "model", "messages"]);
        let model: String = snapshot
            .query_row("SELECT model FROM chats WHERE id = 'c1'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(model, "gemini-pro");
    }

    #[test]
    fn test_backup_dir_is_honored() {
        let dir = TempDir::new().unwrap();
        let backups = TempDir::new().unwrap();
        let (mut conn, path) = open(&dir);
        create_legacy_table(&conn);

        let report = SchemaMigrator::new(&mut conn)
            .with_backup(&path, Some(backups.path()))
            .reconcile()
            .unwrap();
        let backup = report.backup_path.unwrap();
        assert_eq!(backup.parent(), Some(backups.path()));

        // chats_backup_YYYYmmdd_HHMMSS_mmm.db
        let name = backup.file_name().unwrap().to_string_lossy().into_owned();
        let stamp = name
            .strip_prefix("chats_backup_")
            .and_then(|rest| rest.strip_suffix(".db"))
            .unwrap();
        let parts: Vec<&str> = stamp.split('_').collect();
        assert_eq!(parts.iter().map(|p| p.len()).collect::<Vec<_>>(), vec![8, 6, 3]);
        assert!(parts.iter().all(|p| p.chars().all(|c| c.is_ascii_digit())));
    }

    #[test]
    fn test_column_failures_are_aggregated() {
        let mut conn = Connection::open_in_memory().unwrap();
        // A view answers PRAGMA table_info but rejects ALTER TABLE.
        conn.execute_batch("CREATE VIEW chats AS SELECT 'x' AS id, 't' AS title")
            .unwrap();

        let report = match SchemaMigrator::new(&mut conn).reconcile() {
            Err(StoreError::Migration(report)) => report,
            other => panic!("expected migration error, got {other:?}"),
        };
        let add_failures = report
            .errors
            .iter()
            .filter(|e| e.starts_with("Failed to add column"))
            .count();
        assert_eq!(add_failures, CHAT_COLUMNS.len() - 2);
        assert!(report.errors.iter().any(|e| e.starts_with("Verification failed")));
        assert!(report.to_string().contains("errors encountered"));
    }

    #[test]
    fn test_summary_mentions_backup() {
        let report = MigrationReport {
            changes: vec!["Added column: relations TEXT DEFAULT ''".into()],
            backup_path: Some(PathBuf::from("/tmp/chats_backup_1.db")),
            ..Default::default()
        };
        let text = report.to_string();
        assert!(text.contains("Added column: relations"));
        assert!(text.contains("/tmp/chats_backup_1.db"));
    }
}
