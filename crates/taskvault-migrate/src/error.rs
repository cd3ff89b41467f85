use std::io;
use std::path::{Path, PathBuf};

use taskvault_core::{DocumentError, MigrationPhase, OrderError, StateError};

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error(transparent)]
    Parse(#[from] DocumentError),
    #[error("lock error: {0}")]
    Lock(String),
    #[error("checksum mismatch for {}: expected {expected}, found {actual}", path.display())]
    ChecksumMismatch { path: PathBuf, expected: String, actual: String },
    #[error("cannot order records: {0}")]
    Cycle(#[from] OrderError),
    #[error("atomic publish unsupported: {0}")]
    AtomicityUnsupported(String),
    #[error("{operation} failed for {}: {source}", path.display())]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid migration state: {0}")]
    State(#[from] StateError),
    #[error(
        "a migration is already in progress at phase {phase} and cannot be resumed: {reason}; \
         re-run with force to start over"
    )]
    StateConflict { phase: MigrationPhase, reason: String },
    #[error("data loss risk: {0}")]
    DataLossRisk(String),
    #[error("count mismatch for {kind}: expected {expected}, found {actual}")]
    CountMismatch { kind: &'static str, expected: u64, actual: u64 },
    #[error("target store failed integrity check: {0}")]
    Integrity(String),
    #[error("failed to encode or decode {what}: {source}")]
    Json {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },
    #[error("restore after failure did not succeed ({restore}); original error: {original}")]
    RestoreFailed { original: Box<MigrationError>, restore: Box<MigrationError> },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

impl MigrationError {
    /// Adapter for `map_err` on filesystem calls.
    pub(crate) fn io(operation: &'static str, path: &Path) -> impl FnOnce(io::Error) -> Self {
        let path = path.to_path_buf();
        move |source| Self::Io { operation, path, source }
    }

    pub(crate) fn json(what: &'static str) -> impl FnOnce(serde_json::Error) -> Self {
        move |source| Self::Json { what, source }
    }

    /// Stable machine-readable label, used in audit entries and CLI output.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Parse(_) => "parse",
            Self::Lock(_) => "lock",
            Self::ChecksumMismatch { .. } => "checksum_mismatch",
            Self::Cycle(_) => "cycle",
            Self::AtomicityUnsupported(_) => "atomicity_unsupported",
            Self::Io { .. } => "io",
            Self::State(_) => "state",
            Self::StateConflict { .. } => "state_conflict",
            Self::DataLossRisk(_) => "data_loss_risk",
            Self::CountMismatch { .. } => "count_mismatch",
            Self::Integrity(_) => "integrity",
            Self::Json { .. } => "json",
            Self::RestoreFailed { .. } => "restore_failed",
            Self::Store(_) => "store",
        }
    }
}
