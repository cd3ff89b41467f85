use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum DocumentError {
    #[error("failed to parse {file}: {message}")]
    Malformed { file: String, message: String },
    #[error("failed to parse {file}: `{key}` must be an array of records")]
    MissingCollection { file: String, key: String },
    #[error("failed to parse {file}: record #{index} has no string `id`")]
    MissingId { file: String, index: usize },
    #[error("failed to parse {file}: record `{id}` has a malformed `{field}` field")]
    InvalidField { file: String, id: String, field: String },
    #[error("failed to parse {file}: duplicate record id `{id}`")]
    DuplicateId { file: String, id: String },
}

/// Entity families held by the legacy document store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Task,
    Session,
    ArchivedTask,
}

impl EntityKind {
    /// Import order across entity types: tasks first, since sessions and
    /// archived tasks refer to task ids.
    pub const ALL: [Self; 3] = [Self::Task, Self::Session, Self::ArchivedTask];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Session => "session",
            Self::ArchivedTask => "archived_task",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "task" => Some(Self::Task),
            "session" => Some(Self::Session),
            "archived_task" => Some(Self::ArchivedTask),
            _ => None,
        }
    }

    /// Logical source file name, also the key used in `MigrationState::source_files`.
    #[must_use]
    pub fn source_file(self) -> &'static str {
        match self {
            Self::Task => "todo.json",
            Self::Session => "sessions.json",
            Self::ArchivedTask => "todo-archive.json",
        }
    }

    fn collection_keys(self) -> &'static [&'static str] {
        match self {
            Self::Task => &["tasks"],
            Self::Session => &["sessions"],
            Self::ArchivedTask => &["archivedTasks", "tasks"],
        }
    }

    fn parent_key(self) -> &'static str {
        match self {
            Self::Task | Self::ArchivedTask => "parentId",
            Self::Session => "parentSessionId",
        }
    }
}

/// One task, session or archived task as stored in a legacy JSON document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    pub id: String,
    pub parent_id: Option<String>,
    pub depends: Vec<String>,
    /// The record's full JSON object, copied verbatim into the target store.
    pub payload: Map<String, Value>,
}

impl SourceRecord {
    /// Build a record from one element of a legacy collection array.
    ///
    /// # Errors
    /// Returns [`DocumentError`] when the element is not an object, has no
    /// string `id`, or carries a malformed parent/depends reference.
    pub fn from_value(
        kind: EntityKind,
        file: &str,
        index: usize,
        value: Value,
    ) -> Result<Self, DocumentError> {
        let Value::Object(payload) = value else {
            return Err(DocumentError::Malformed {
                file: file.to_string(),
                message: format!("record #{index} is not an object"),
            });
        };

        let id = match payload.get("id") {
            Some(Value::String(id)) if !id.trim().is_empty() => id.clone(),
            _ => return Err(DocumentError::MissingId { file: file.to_string(), index }),
        };

        let invalid = |field: &str| DocumentError::InvalidField {
            file: file.to_string(),
            id: id.clone(),
            field: field.to_string(),
        };

        let parent_key = kind.parent_key();
        let parent_id = match payload.get(parent_key) {
            None | Some(Value::Null) => None,
            Some(Value::String(parent)) if parent.trim().is_empty() => None,
            Some(Value::String(parent)) => Some(parent.clone()),
            Some(_) => return Err(invalid(parent_key)),
        };

        let depends = match payload.get("depends") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| item.as_str().map(str::to_string).ok_or_else(|| invalid("depends")))
                .collect::<Result<Vec<_>, _>>()?,
            Some(_) => return Err(invalid("depends")),
        };

        Ok(Self { id, parent_id, depends, payload })
    }

    /// Every id this record must be inserted after: its parent, then its dependencies.
    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.parent_id.iter().map(String::as_str).chain(self.depends.iter().map(String::as_str))
    }

    #[must_use]
    pub fn str_field(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Array field, or the empty list when the field is absent or null.
    #[must_use]
    pub fn list_field(&self, key: &str) -> Vec<Value> {
        match self.payload.get(key) {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        }
    }

    /// Any non-null JSON value, re-serialized for storage in a text column.
    #[must_use]
    pub fn json_field(&self, key: &str) -> Option<String> {
        match self.payload.get(key) {
            None | Some(Value::Null) => None,
            Some(value) => Some(value.to_string()),
        }
    }

    /// The verbatim source object.
    #[must_use]
    pub fn raw_json(&self) -> String {
        Value::Object(self.payload.clone()).to_string()
    }
}

/// Parsed contents of one legacy document.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    pub kind: EntityKind,
    pub records: Vec<SourceRecord>,
}

impl SourceDocument {
    #[must_use]
    pub fn empty(kind: EntityKind) -> Self {
        Self { kind, records: Vec::new() }
    }

    /// Parse the bytes of a legacy document for the given entity kind.
    ///
    /// # Errors
    /// Returns [`DocumentError`] when the bytes are not JSON, the top level is
    /// not an object, the collection is missing, or any record is malformed or
    /// duplicated.
    pub fn parse(kind: EntityKind, file: &str, bytes: &[u8]) -> Result<Self, DocumentError> {
        let root: Value = serde_json::from_slice(bytes).map_err(|err| DocumentError::Malformed {
            file: file.to_string(),
            message: err.to_string(),
        })?;

        let Value::Object(mut root) = root else {
            return Err(DocumentError::Malformed {
                file: file.to_string(),
                message: "top-level value must be an object".to_string(),
            });
        };

        let keys = kind.collection_keys();
        let collection = keys.iter().find_map(|key| root.remove(*key));
        let items = match collection {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(DocumentError::MissingCollection {
                    file: file.to_string(),
                    key: keys[0].to_string(),
                })
            }
        };

        let mut seen = BTreeSet::new();
        let mut records = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let record = SourceRecord::from_value(kind, file, index, item)?;
            if !seen.insert(record.id.clone()) {
                return Err(DocumentError::DuplicateId { file: file.to_string(), id: record.id });
            }
            records.push(record);
        }

        Ok(Self { kind, records })
    }
}

/// Record counts per entity type, used for previews and progress totals.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct SourceCounts {
    pub tasks: u64,
    pub sessions: u64,
    pub archived: u64,
}

impl SourceCounts {
    #[must_use]
    pub fn get(&self, kind: EntityKind) -> u64 {
        match kind {
            EntityKind::Task => self.tasks,
            EntityKind::Session => self.sessions,
            EntityKind::ArchivedTask => self.archived,
        }
    }

    pub fn set(&mut self, kind: EntityKind, value: u64) {
        match kind {
            EntityKind::Task => self.tasks = value,
            EntityKind::Session => self.sessions = value,
            EntityKind::ArchivedTask => self.archived = value,
        }
    }
}
