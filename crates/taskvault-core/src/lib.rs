//! Domain model for migrating the legacy JSON task documents into the
//! relational task store: source records, insert ordering and the persisted
//! migration state.

mod audit;
mod document;
mod order;
mod state;

pub use audit::{LogEntry, LogLevel};
pub use document::{DocumentError, EntityKind, SourceCounts, SourceDocument, SourceRecord};
pub use order::{is_acyclic, sort_records, topological_order, DependencyGraph, OrderError};
pub use state::{
    BackupArtifact, MigrationPhase, MigrationState, Progress, ProgressDelta, SourceFile,
    StateError, STATE_VERSION,
};
