use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use taskvault_core::EntityKind;
use time::OffsetDateTime;

const LATEST_SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS tasks (
  id TEXT PRIMARY KEY,
  position INTEGER NOT NULL,
  title TEXT,
  description TEXT,
  status TEXT,
  priority TEXT,
  task_type TEXT,
  phase TEXT,
  size TEXT,
  parent_id TEXT,
  labels_json TEXT NOT NULL DEFAULT '[]',
  notes_json TEXT NOT NULL DEFAULT '[]',
  created_at TEXT,
  updated_at TEXT,
  completed_at TEXT,
  raw_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS task_dependencies (
  task_id TEXT NOT NULL,
  depends_on TEXT NOT NULL,
  PRIMARY KEY (task_id, depends_on),
  FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS sessions (
  id TEXT PRIMARY KEY,
  position INTEGER NOT NULL,
  name TEXT,
  status TEXT,
  parent_session_id TEXT,
  focus_task_id TEXT,
  scope_json TEXT,
  agent TEXT,
  notes_json TEXT NOT NULL DEFAULT '[]',
  started_at TEXT,
  ended_at TEXT,
  raw_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS archived_tasks (
  id TEXT PRIMARY KEY,
  position INTEGER NOT NULL,
  title TEXT,
  status TEXT,
  parent_id TEXT,
  depends_json TEXT NOT NULL DEFAULT '[]',
  labels_json TEXT NOT NULL DEFAULT '[]',
  archived_at TEXT,
  archive_reason TEXT,
  raw_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_position ON tasks(position);
CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent_id);
CREATE INDEX IF NOT EXISTS idx_task_dependencies_on ON task_dependencies(depends_on);
CREATE INDEX IF NOT EXISTS idx_sessions_position ON sessions(position);
CREATE INDEX IF NOT EXISTS idx_archived_tasks_position ON archived_tasks(position);
";

/// Relational task store that the legacy documents are migrated into.
///
/// The store is kept as a single file (`journal_mode = DELETE`) so that a
/// closed store can be byte-copied for backups and published with one rename.
pub struct TaskStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskRow {
    pub id: String,
    pub title: Option<String>,
    pub description: Option<String>,
    pub status: Option<String>,
    pub priority: Option<String>,
    pub task_type: Option<String>,
    pub phase: Option<String>,
    pub size: Option<String>,
    pub parent_id: Option<String>,
    pub depends: Vec<String>,
    pub labels_json: String,
    pub notes_json: String,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub completed_at: Option<String>,
    pub raw_json: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionRow {
    pub id: String,
    pub name: Option<String>,
    pub status: Option<String>,
    pub parent_session_id: Option<String>,
    pub focus_task_id: Option<String>,
    pub scope_json: Option<String>,
    pub agent: Option<String>,
    pub notes_json: String,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub raw_json: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchivedTaskRow {
    pub id: String,
    pub title: Option<String>,
    pub status: Option<String>,
    pub parent_id: Option<String>,
    pub depends_json: String,
    pub labels_json: String,
    pub archived_at: Option<String>,
    pub archive_reason: Option<String>,
    pub raw_json: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
}

impl IntegrityReport {
    #[must_use]
    pub fn is_healthy(&self) -> bool {
        self.quick_check_ok
            && self.foreign_key_violations.is_empty()
            && self.schema_status.pending_versions.is_empty()
    }
}

impl TaskStore {
    /// Open (creating if needed) a task store for writing and configure its pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = DELETE;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Open an existing store without the ability to modify it.
    ///
    /// # Errors
    /// Returns an error when the file is missing or is not a `SQLite` database.
    pub fn open_read_only(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open sqlite database read-only at {}", path.display()))?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))
            .context("failed to configure busy timeout")?;
        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let current_version = if table_exists(&self.conn, "schema_migrations")? {
            current_schema_version(&self.conn)?
        } else {
            0
        };
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus { current_version, target_version: LATEST_SCHEMA_VERSION, pending_versions })
    }

    /// Apply all forward schema migrations up to the latest version.
    ///
    /// # Errors
    /// Returns an error when any migration step fails or the store is newer
    /// than this build understands.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let version = current_schema_version(&self.conn)?;
        if version > LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected at most {LATEST_SCHEMA_VERSION}"
            ));
        }

        if version < 1 {
            let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
            tx.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&tx, 1)?;
            tx.commit().context("failed to commit migration v1")?;
        }

        Ok(())
    }

    /// Insert task rows in the given order inside one transaction. With
    /// `replace`, existing tasks (and their dependency rows) are deleted in
    /// the same transaction first. Either every row commits or none do.
    ///
    /// # Errors
    /// Returns an error when any statement fails; the transaction is rolled back.
    pub fn import_tasks(&mut self, rows: &[TaskRow], replace: bool) -> Result<usize> {
        let tx = self.conn.transaction().context("failed to start task import transaction")?;
        if replace {
            tx.execute("DELETE FROM tasks", []).context("failed to clear tasks")?;
        }

        for (position, row) in rows.iter().enumerate() {
            tx.execute(
                "INSERT INTO tasks(
                    id, position, title, description, status, priority, task_type, phase, size,
                    parent_id, labels_json, notes_json, created_at, updated_at, completed_at, raw_json
                ) VALUES (
                    ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9,
                    ?10, ?11, ?12, ?13, ?14, ?15, ?16
                )",
                params![
                    row.id,
                    position_value(position)?,
                    row.title,
                    row.description,
                    row.status,
                    row.priority,
                    row.task_type,
                    row.phase,
                    row.size,
                    row.parent_id,
                    row.labels_json,
                    row.notes_json,
                    row.created_at,
                    row.updated_at,
                    row.completed_at,
                    row.raw_json,
                ],
            )
            .with_context(|| format!("failed to insert task {}", row.id))?;

            insert_dependencies(&tx, &row.id, &row.depends)?;
        }

        tx.commit().context("failed to commit task import")?;
        Ok(rows.len())
    }

    /// Insert session rows in one transaction; see [`TaskStore::import_tasks`].
    ///
    /// # Errors
    /// Returns an error when any statement fails; the transaction is rolled back.
    pub fn import_sessions(&mut self, rows: &[SessionRow], replace: bool) -> Result<usize> {
        let tx = self.conn.transaction().context("failed to start session import transaction")?;
        if replace {
            tx.execute("DELETE FROM sessions", []).context("failed to clear sessions")?;
        }

        for (position, row) in rows.iter().enumerate() {
            tx.execute(
                "INSERT INTO sessions(
                    id, position, name, status, parent_session_id, focus_task_id, scope_json,
                    agent, notes_json, started_at, ended_at, raw_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    row.id,
                    position_value(position)?,
                    row.name,
                    row.status,
                    row.parent_session_id,
                    row.focus_task_id,
                    row.scope_json,
                    row.agent,
                    row.notes_json,
                    row.started_at,
                    row.ended_at,
                    row.raw_json,
                ],
            )
            .with_context(|| format!("failed to insert session {}", row.id))?;
        }

        tx.commit().context("failed to commit session import")?;
        Ok(rows.len())
    }

    /// Insert archived task rows in one transaction; see [`TaskStore::import_tasks`].
    ///
    /// # Errors
    /// Returns an error when any statement fails; the transaction is rolled back.
    pub fn import_archived(&mut self, rows: &[ArchivedTaskRow], replace: bool) -> Result<usize> {
        let tx = self.conn.transaction().context("failed to start archive import transaction")?;
        if replace {
            tx.execute("DELETE FROM archived_tasks", [])
                .context("failed to clear archived tasks")?;
        }

        for (position, row) in rows.iter().enumerate() {
            tx.execute(
                "INSERT INTO archived_tasks(
                    id, position, title, status, parent_id, depends_json, labels_json,
                    archived_at, archive_reason, raw_json
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    row.id,
                    position_value(position)?,
                    row.title,
                    row.status,
                    row.parent_id,
                    row.depends_json,
                    row.labels_json,
                    row.archived_at,
                    row.archive_reason,
                    row.raw_json,
                ],
            )
            .with_context(|| format!("failed to insert archived task {}", row.id))?;
        }

        tx.commit().context("failed to commit archive import")?;
        Ok(rows.len())
    }

    /// Row count for one entity table; zero when the table does not exist yet.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count(&self, kind: EntityKind) -> Result<u64> {
        let table = table_name(kind);
        if !table_exists(&self.conn, table)? {
            return Ok(0);
        }
        let count = self
            .conn
            .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get::<_, i64>(0))
            .with_context(|| format!("failed to count rows in {table}"))?;
        u64::try_from(count).with_context(|| format!("negative row count in {table}"))
    }

    /// Whether the primary table already holds migrated rows.
    ///
    /// # Errors
    /// Returns an error when the count query fails.
    pub fn has_migrated_data(&self) -> Result<bool> {
        Ok(self.count(EntityKind::Task)? > 0)
    }

    /// Ids of one entity table in the order they were inserted.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn ids_in_insert_order(&self, kind: EntityKind) -> Result<Vec<String>> {
        let table = table_name(kind);
        if !table_exists(&self.conn, table)? {
            return Ok(Vec::new());
        }
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT id FROM {table} ORDER BY position ASC, rowid ASC"))?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Load one task with its dependency list.
    ///
    /// # Errors
    /// Returns an error when the query fails.
    pub fn get_task(&self, id: &str) -> Result<Option<TaskRow>> {
        let mut stmt = self.conn.prepare(
            "SELECT
                id, title, description, status, priority, task_type, phase, size,
                parent_id, labels_json, notes_json, created_at, updated_at, completed_at, raw_json
             FROM tasks WHERE id = ?1",
        )?;
        let task = stmt
            .query_row(params![id], |row| {
                Ok(TaskRow {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    description: row.get(2)?,
                    status: row.get(3)?,
                    priority: row.get(4)?,
                    task_type: row.get(5)?,
                    phase: row.get(6)?,
                    size: row.get(7)?,
                    parent_id: row.get(8)?,
                    depends: Vec::new(),
                    labels_json: row.get(9)?,
                    notes_json: row.get(10)?,
                    created_at: row.get(11)?,
                    updated_at: row.get(12)?,
                    completed_at: row.get(13)?,
                    raw_json: row.get(14)?,
                })
            })
            .optional()
            .with_context(|| format!("failed to load task {id}"))?;

        let Some(mut task) = task else {
            return Ok(None);
        };
        task.depends = self.load_dependencies(id)?;
        Ok(Some(task))
    }

    /// Run quick-check, foreign-key-check, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
        })
    }

    /// Close the connection, surfacing any error from the final flush.
    ///
    /// # Errors
    /// Returns an error when `SQLite` fails to close the database cleanly.
    pub fn close(self) -> Result<()> {
        self.conn.close().map_err(|(_, err)| anyhow!(err)).context("failed to close task store")
    }

    fn load_dependencies(&self, task_id: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT depends_on FROM task_dependencies WHERE task_id = ?1 ORDER BY rowid ASC",
        )?;
        let rows = stmt.query_map(params![task_id], |row| row.get::<_, String>(0))?;
        let mut depends = Vec::new();
        for row in rows {
            depends.push(row?);
        }
        Ok(depends)
    }
}

fn insert_dependencies(tx: &Transaction<'_>, task_id: &str, depends: &[String]) -> Result<()> {
    for depends_on in depends {
        tx.execute(
            "INSERT OR IGNORE INTO task_dependencies(task_id, depends_on) VALUES (?1, ?2)",
            params![task_id, depends_on],
        )
        .with_context(|| format!("failed to insert dependency {task_id} -> {depends_on}"))?;
    }
    Ok(())
}

fn table_name(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Task => "tasks",
        EntityKind::Session => "sessions",
        EntityKind::ArchivedTask => "archived_tasks",
    }
}

fn position_value(position: usize) -> Result<i64> {
    i64::try_from(position).context("row position does not fit in INTEGER")
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: &str, depends: &[&str]) -> TaskRow {
        TaskRow {
            id: id.to_string(),
            title: Some(format!("title {id}")),
            description: None,
            status: Some("pending".to_string()),
            priority: None,
            task_type: None,
            phase: None,
            size: None,
            parent_id: None,
            depends: depends.iter().map(|dep| (*dep).to_string()).collect(),
            labels_json: "[]".to_string(),
            notes_json: "[]".to_string(),
            created_at: None,
            updated_at: None,
            completed_at: None,
            raw_json: format!(r#"{{"id":"{id}"}}"#),
        }
    }

    fn session(id: &str) -> SessionRow {
        SessionRow {
            id: id.to_string(),
            name: None,
            status: Some("active".to_string()),
            parent_session_id: None,
            focus_task_id: Some("T001".to_string()),
            scope_json: None,
            agent: None,
            notes_json: "[]".to_string(),
            started_at: None,
            ended_at: None,
            raw_json: format!(r#"{{"id":"{id}"}}"#),
        }
    }

    fn migrated_store() -> Result<TaskStore> {
        let mut store = TaskStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        Ok(store)
    }

    #[test]
    fn migrate_is_idempotent_and_reports_schema() -> Result<()> {
        let mut store = TaskStore::open(Path::new(":memory:"))?;
        assert_eq!(store.schema_status()?.pending_versions, vec![1]);
        store.migrate()?;
        store.migrate()?;
        let status = store.schema_status()?;
        assert_eq!(status.current_version, 1);
        assert!(status.pending_versions.is_empty());
        Ok(())
    }

    #[test]
    fn tasks_read_back_in_insert_order_with_dependencies() -> Result<()> {
        let mut store = migrated_store()?;
        let imported = store.import_tasks(
            &[task("T001", &[]), task("T002", &["T001"]), task("T003", &["T001", "T002"])],
            false,
        )?;

        assert_eq!(imported, 3);
        assert_eq!(store.ids_in_insert_order(EntityKind::Task)?, vec!["T001", "T002", "T003"]);
        let t3 = store.get_task("T003")?.ok_or_else(|| anyhow!("T003 missing"))?;
        assert_eq!(t3.depends, vec!["T001".to_string(), "T002".to_string()]);
        assert!(store.has_migrated_data()?);
        Ok(())
    }

    #[test]
    fn failed_row_rolls_back_the_whole_entity_batch() -> Result<()> {
        let mut store = migrated_store()?;
        let result = store.import_tasks(&[task("T001", &[]), task("T001", &[])], false);
        assert!(result.is_err());
        assert_eq!(store.count(EntityKind::Task)?, 0);
        Ok(())
    }

    #[test]
    fn replace_truncates_inside_the_same_transaction() -> Result<()> {
        let mut store = migrated_store()?;
        store.import_tasks(&[task("T001", &[]), task("T002", &["T001"])], false)?;
        store.import_sessions(&[session("S1")], false)?;

        store.import_tasks(&[task("T002", &[]), task("T005", &["T002"])], true)?;
        store.import_sessions(&[session("S2")], true)?;

        assert_eq!(store.ids_in_insert_order(EntityKind::Task)?, vec!["T002", "T005"]);
        assert_eq!(store.ids_in_insert_order(EntityKind::Session)?, vec!["S2"]);
        let t2 = store.get_task("T002")?.ok_or_else(|| anyhow!("T002 missing"))?;
        assert!(t2.depends.is_empty());
        Ok(())
    }

    #[test]
    fn replace_that_fails_keeps_previous_rows() -> Result<()> {
        let mut store = migrated_store()?;
        store.import_tasks(&[task("T001", &[])], false)?;
        let result = store.import_tasks(&[task("T009", &[]), task("T009", &[])], true);
        assert!(result.is_err());
        assert_eq!(store.ids_in_insert_order(EntityKind::Task)?, vec!["T001"]);
        Ok(())
    }

    #[test]
    fn dependency_on_external_id_is_kept() -> Result<()> {
        let mut store = migrated_store()?;
        store.import_tasks(&[task("T010", &["T-EXTERNAL"])], false)?;
        let report = store.integrity_check()?;
        assert!(report.is_healthy(), "{report:?}");
        Ok(())
    }

    #[test]
    fn counts_are_zero_before_schema_exists() -> Result<()> {
        let store = TaskStore::open(Path::new(":memory:"))?;
        assert_eq!(store.count(EntityKind::ArchivedTask)?, 0);
        assert!(!store.has_migrated_data()?);
        assert!(store.ids_in_insert_order(EntityKind::Task)?.is_empty());
        Ok(())
    }

    #[test]
    fn read_only_handle_cannot_write() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("tasks.db");
        {
            let mut store = TaskStore::open(&path)?;
            store.migrate()?;
            store.import_tasks(&[task("T001", &[])], false)?;
            store.close()?;
        }

        let mut reader = TaskStore::open_read_only(&path)?;
        assert_eq!(reader.count(EntityKind::Task)?, 1);
        assert!(reader.import_tasks(&[task("T002", &[])], false).is_err());
        Ok(())
    }
}
