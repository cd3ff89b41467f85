use std::io;

use serde_json::Value;
use taskvault_core::{sort_records, EntityKind, SourceCounts, SourceDocument, SourceRecord};
use taskvault_store_sqlite::{ArchivedTaskRow, SessionRow, TaskRow, TaskStore};
use tracing::{info, warn};

use crate::config::DataLayout;
use crate::fs::FileSystem;
use crate::MigrationError;

/// The three legacy documents, parsed. A missing document is an empty one.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSet {
    pub tasks: SourceDocument,
    pub sessions: SourceDocument,
    pub archived: SourceDocument,
    /// Logical names of documents that were not on disk.
    pub missing: Vec<&'static str>,
}

impl SourceSet {
    #[must_use]
    pub fn document(&self, kind: EntityKind) -> &SourceDocument {
        match kind {
            EntityKind::Task => &self.tasks,
            EntityKind::Session => &self.sessions,
            EntityKind::ArchivedTask => &self.archived,
        }
    }

    #[must_use]
    pub fn counts(&self) -> SourceCounts {
        let mut counts = SourceCounts::default();
        for kind in EntityKind::ALL {
            counts.set(kind, self.document(kind).records.len() as u64);
        }
        counts
    }

    /// Reorder every collection so each record follows the records it names.
    ///
    /// # Errors
    /// Returns [`MigrationError::Cycle`] when a collection has no valid order.
    pub fn into_ordered(self) -> Result<Self, MigrationError> {
        let order = |document: SourceDocument| -> Result<SourceDocument, MigrationError> {
            Ok(SourceDocument { kind: document.kind, records: sort_records(document.records)? })
        };
        Ok(Self {
            tasks: order(self.tasks)?,
            sessions: order(self.sessions)?,
            archived: order(self.archived)?,
            missing: self.missing,
        })
    }
}

/// Read and parse every legacy document named by `layout`.
///
/// # Errors
/// Returns [`MigrationError::Parse`] for a malformed document and
/// [`MigrationError::Io`] when a present document cannot be read.
pub fn load_sources(fs: &dyn FileSystem, layout: &DataLayout) -> Result<SourceSet, MigrationError> {
    let mut missing = Vec::new();
    let mut load = |kind: EntityKind| -> Result<SourceDocument, MigrationError> {
        let path = layout.source_path(kind);
        match fs.read(&path) {
            Ok(bytes) => Ok(SourceDocument::parse(kind, layout.source_name(kind), &bytes)?),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                missing.push(kind.source_file());
                Ok(SourceDocument::empty(kind))
            }
            Err(err) => Err(MigrationError::io("read source", &path)(err)),
        }
    };
    let tasks = load(EntityKind::Task)?;
    let sessions = load(EntityKind::Session)?;
    let archived = load(EntityKind::ArchivedTask)?;
    Ok(SourceSet { tasks, sessions, archived, missing })
}

/// Record counts per entity type, without touching the target store.
///
/// # Errors
/// Returns [`MigrationError::Parse`] when any document is malformed.
pub fn count_source_records(
    fs: &dyn FileSystem,
    layout: &DataLayout,
) -> Result<SourceCounts, MigrationError> {
    Ok(load_sources(fs, layout)?.counts())
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportReport {
    pub imported: SourceCounts,
    pub warnings: Vec<String>,
    /// Set when the target already held migrated data and nothing was written.
    pub skipped_reason: Option<String>,
    /// Set when importing would replace existing tasks with an empty source.
    pub data_loss_risk: Option<String>,
}

/// Writes ordered source records into a target store, one transaction per
/// entity type.
#[derive(Debug, Clone, Copy, Default)]
pub struct Importer {
    force: bool,
}

impl Importer {
    #[must_use]
    pub fn new(force: bool) -> Self {
        Self { force }
    }

    /// Import `sources` (already in dependency order) into `store`.
    ///
    /// Without `force`, a store that already holds tasks is left untouched
    /// and the report carries a `skipped_reason`; an empty task source over
    /// a populated store is reported as a data-loss risk instead. Otherwise
    /// every table is replaced. `on_commit` runs after each entity
    /// type commits, with the rows written for it.
    ///
    /// # Errors
    /// Returns [`MigrationError::Store`] when a transaction fails; earlier
    /// entity types stay committed. Errors from `on_commit` abort the import.
    pub fn import(
        &self,
        sources: &SourceSet,
        store: &mut TaskStore,
        mut on_commit: impl FnMut(EntityKind, u64) -> Result<(), MigrationError>,
    ) -> Result<ImportReport, MigrationError> {
        store.migrate()?;
        let mut report = ImportReport::default();

        if store.has_migrated_data()? {
            let existing = store.count(EntityKind::Task)?;
            if sources.tasks.records.is_empty() {
                let message = format!(
                    "task source is empty but the target holds {existing} task(s); \
                     importing would discard them"
                );
                warn!("{message}");
                report.warnings.push(message.clone());
                report.data_loss_risk = Some(message);
                if !self.force {
                    return Ok(report);
                }
            }
            if !self.force {
                let reason = format!(
                    "target store already contains migrated data ({existing} task(s)); \
                     skipping import, re-run with force to replace it"
                );
                warn!("{reason}");
                report.warnings.push(reason.clone());
                report.skipped_reason = Some(reason);
                return Ok(report);
            }
            report
                .warnings
                .push(format!("replacing {existing} existing task(s) in the target store"));
        }

        // Past the gate every table is rebuilt, which also clears rows left
        // by an earlier partial attempt against the same store.
        let replace = true;
        for kind in EntityKind::ALL {
            let records = &sources.document(kind).records;
            let written = match kind {
                EntityKind::Task => {
                    let rows: Vec<TaskRow> = records.iter().map(task_row).collect();
                    store.import_tasks(&rows, replace)?
                }
                EntityKind::Session => {
                    let rows: Vec<SessionRow> = records.iter().map(session_row).collect();
                    store.import_sessions(&rows, replace)?
                }
                EntityKind::ArchivedTask => {
                    let rows: Vec<ArchivedTaskRow> = records.iter().map(archived_row).collect();
                    store.import_archived(&rows, replace)?
                }
            };
            let written = written as u64;
            info!(kind = kind.as_str(), rows = written, "entity batch committed");
            report.imported.set(kind, written);
            on_commit(kind, written)?;
        }
        Ok(report)
    }
}

/// Scalar field as text: strings verbatim, numbers and booleans printed,
/// objects and arrays as JSON.
fn text(record: &SourceRecord, key: &str) -> Option<String> {
    match record.payload.get(key) {
        None | Some(Value::Null) => None,
        Some(Value::String(value)) => Some(value.clone()),
        Some(value) => Some(value.to_string()),
    }
}

fn list_json(record: &SourceRecord, key: &str) -> String {
    Value::Array(record.list_field(key)).to_string()
}

/// Field from the record or, failing that, from its `_archive` metadata block.
fn archive_meta(record: &SourceRecord, key: &str, nested: &str) -> Option<String> {
    text(record, key).or_else(|| {
        record.payload.get("_archive").and_then(|meta| meta.get(nested)).and_then(|value| {
            match value {
                Value::Null => None,
                Value::String(value) => Some(value.clone()),
                other => Some(other.to_string()),
            }
        })
    })
}

#[must_use]
pub fn task_row(record: &SourceRecord) -> TaskRow {
    TaskRow {
        id: record.id.clone(),
        title: text(record, "title"),
        description: text(record, "description"),
        status: text(record, "status"),
        priority: text(record, "priority"),
        task_type: text(record, "type"),
        phase: text(record, "phase"),
        size: text(record, "size"),
        parent_id: record.parent_id.clone(),
        depends: record.depends.clone(),
        labels_json: list_json(record, "labels"),
        notes_json: list_json(record, "notes"),
        created_at: text(record, "createdAt"),
        updated_at: text(record, "updatedAt"),
        completed_at: text(record, "completedAt"),
        raw_json: record.raw_json(),
    }
}

#[must_use]
pub fn session_row(record: &SourceRecord) -> SessionRow {
    let focus_task_id = match record.payload.get("focus") {
        Some(Value::String(task)) => Some(task.clone()),
        Some(Value::Object(focus)) => ["currentTask", "taskId"]
            .iter()
            .find_map(|key| focus.get(*key).and_then(Value::as_str).map(str::to_string)),
        _ => text(record, "focusTaskId"),
    };
    SessionRow {
        id: record.id.clone(),
        name: text(record, "name"),
        status: text(record, "status"),
        parent_session_id: record.parent_id.clone(),
        focus_task_id,
        scope_json: record.json_field("scope"),
        agent: text(record, "agent"),
        notes_json: list_json(record, "notes"),
        started_at: text(record, "startedAt"),
        ended_at: text(record, "endedAt"),
        raw_json: record.raw_json(),
    }
}

#[must_use]
pub fn archived_row(record: &SourceRecord) -> ArchivedTaskRow {
    ArchivedTaskRow {
        id: record.id.clone(),
        title: text(record, "title"),
        status: text(record, "status"),
        parent_id: record.parent_id.clone(),
        depends_json: Value::from(record.depends.clone()).to_string(),
        labels_json: list_json(record, "labels"),
        archived_at: archive_meta(record, "archivedAt", "archivedAt"),
        archive_reason: archive_meta(record, "archiveReason", "reason"),
        raw_json: record.raw_json(),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use crate::config::MigrationConfig;
    use crate::fs::MemoryFileSystem;

    use super::*;

    fn layout() -> DataLayout {
        MigrationConfig::default().layout(Path::new("/data"))
    }

    fn write(fs: &MemoryFileSystem, name: &str, body: &str) -> Result<(), MigrationError> {
        let path = Path::new("/data").join(name);
        fs.write(&path, body.as_bytes()).map_err(MigrationError::io("write", &path))
    }

    fn sample_sources() -> Result<SourceSet, MigrationError> {
        let fs = MemoryFileSystem::new();
        write(
            &fs,
            "todo.json",
            r#"{"tasks":[
                {"id":"T003","title":"three","depends":["T001","T002"]},
                {"id":"T002","title":"two","parentId":"T001","labels":["x"]},
                {"id":"T001","title":"one","size":3}
            ]}"#,
        )?;
        write(
            &fs,
            "sessions.json",
            r#"{"sessions":[
                {"id":"S2","parentSessionId":"S1","focus":{"currentTask":"T002"}},
                {"id":"S1","name":"first","scope":{"type":"epic","rootTaskId":"T001"}}
            ]}"#,
        )?;
        load_sources(&fs, &layout())
    }

    #[test]
    fn missing_documents_load_as_empty() -> Result<(), MigrationError> {
        let fs = MemoryFileSystem::new();
        write(&fs, "todo.json", r#"{"tasks":[{"id":"T1"}]}"#)?;
        let sources = load_sources(&fs, &layout())?;
        assert_eq!(sources.counts(), SourceCounts { tasks: 1, sessions: 0, archived: 0 });
        assert_eq!(sources.missing, vec!["sessions.json", "todo-archive.json"]);
        Ok(())
    }

    #[test]
    fn malformed_document_is_a_parse_error() -> Result<(), MigrationError> {
        let fs = MemoryFileSystem::new();
        write(&fs, "todo.json", "{ invalid json }")?;
        let err = count_source_records(&fs, &layout());
        assert!(matches!(err, Err(MigrationError::Parse(_))));
        Ok(())
    }

    #[test]
    fn rows_carry_mapped_fields_and_raw_json() -> Result<(), MigrationError> {
        let sources = sample_sources()?.into_ordered()?;
        let ids: Vec<&str> = sources.tasks.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["T001", "T002", "T003"]);

        let one = task_row(&sources.tasks.records[0]);
        assert_eq!(one.size.as_deref(), Some("3"));
        assert_eq!(one.labels_json, "[]");
        let raw: Value = serde_json::from_str(&one.raw_json).map_err(MigrationError::json("raw"))?;
        assert_eq!(raw["title"], "one");

        let sessions: Vec<SessionRow> = sources.sessions.records.iter().map(session_row).collect();
        assert_eq!(sessions[0].id, "S1");
        assert_eq!(sessions[1].focus_task_id.as_deref(), Some("T002"));
        assert_eq!(sessions[1].parent_session_id.as_deref(), Some("S1"));
        Ok(())
    }

    #[test]
    fn archive_metadata_block_is_read() -> Result<(), MigrationError> {
        let doc = SourceDocument::parse(
            EntityKind::ArchivedTask,
            "todo-archive.json",
            br#"{"archivedTasks":[{"id":"T9","depends":["T1"],
                "_archive":{"archivedAt":"2025-02-01T00:00:00Z","reason":"completed"}}]}"#,
        )?;
        let row = archived_row(&doc.records[0]);
        assert_eq!(row.archived_at.as_deref(), Some("2025-02-01T00:00:00Z"));
        assert_eq!(row.archive_reason.as_deref(), Some("completed"));
        assert_eq!(row.depends_json, r#"["T1"]"#);
        Ok(())
    }

    #[test]
    fn import_is_idempotent_without_force() -> Result<(), MigrationError> {
        let sources = sample_sources()?.into_ordered()?;
        let mut store = TaskStore::open(Path::new(":memory:"))?;
        let mut commits = Vec::new();

        let first = Importer::new(false).import(&sources, &mut store, |kind, rows| {
            commits.push((kind, rows));
            Ok(())
        })?;
        assert_eq!(first.imported, SourceCounts { tasks: 3, sessions: 2, archived: 0 });
        assert_eq!(commits.len(), 3);

        let second = Importer::new(false).import(&sources, &mut store, |_, _| Ok(()))?;
        assert!(second.skipped_reason.is_some());
        assert!(second.warnings.iter().any(|w| w.contains("already contains migrated data")));
        assert_eq!(second.imported, SourceCounts::default());
        assert_eq!(store.count(EntityKind::Task)?, 3);
        Ok(())
    }

    #[test]
    fn forced_import_replaces_and_empty_source_is_a_risk() -> Result<(), MigrationError> {
        let sources = sample_sources()?.into_ordered()?;
        let mut store = TaskStore::open(Path::new(":memory:"))?;
        Importer::new(false).import(&sources, &mut store, |_, _| Ok(()))?;

        let forced = Importer::new(true).import(&sources, &mut store, |_, _| Ok(()))?;
        assert_eq!(forced.imported.tasks, 3);
        assert_eq!(store.count(EntityKind::Task)?, 3);

        let empty = SourceSet {
            tasks: SourceDocument::empty(EntityKind::Task),
            sessions: SourceDocument::empty(EntityKind::Session),
            archived: SourceDocument::empty(EntityKind::ArchivedTask),
            missing: Vec::new(),
        };
        let risky = Importer::new(false).import(&empty, &mut store, |_, _| Ok(()))?;
        assert!(risky.data_loss_risk.is_some());
        assert_eq!(store.count(EntityKind::Task)?, 3);
        Ok(())
    }
}
