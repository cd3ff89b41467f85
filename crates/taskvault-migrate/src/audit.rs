//! Append-only JSON-lines audit log, one file per run under the logs
//! directory. Entries are buffered and written as whole lines in a single
//! append, so a crash can at most tear the final line.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use taskvault_core::{LogEntry, LogLevel, MigrationPhase};
use time::OffsetDateTime;
use tracing::{debug, error, info, warn};

use crate::fs::FileSystem;
use crate::MigrationError;

const LOG_PREFIX: &str = "migration-";
const LOG_SUFFIX: &str = ".jsonl";

#[derive(Debug)]
pub struct AuditLogger {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
    phase: MigrationPhase,
    phase_started: Instant,
    pending: Vec<LogEntry>,
    written: usize,
}

impl AuditLogger {
    /// Open a new log file for a run starting at `started_at`.
    ///
    /// # Errors
    /// Returns [`MigrationError::Io`] when the logs directory cannot be created.
    pub fn create(
        fs: Arc<dyn FileSystem>,
        logs_dir: &Path,
        started_at: OffsetDateTime,
    ) -> Result<Self, MigrationError> {
        fs.create_dir_all(logs_dir).map_err(MigrationError::io("create logs dir", logs_dir))?;
        let millis = started_at.unix_timestamp_nanos() / 1_000_000;
        let mut suffix = 0;
        let path = loop {
            let name = if suffix == 0 {
                format!("{LOG_PREFIX}{millis}{LOG_SUFFIX}")
            } else {
                format!("{LOG_PREFIX}{millis}-{suffix}{LOG_SUFFIX}")
            };
            let candidate = logs_dir.join(name);
            match fs.create_new(&candidate, b"") {
                Ok(()) => break candidate,
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => suffix += 1,
                Err(err) => return Err(MigrationError::io("create log", &candidate)(err)),
            }
        };
        Ok(Self {
            fs,
            path,
            phase: MigrationPhase::Init,
            phase_started: Instant::now(),
            pending: Vec::new(),
            written: 0,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn phase(&self) -> MigrationPhase {
        self.phase
    }

    /// Entries written to disk so far.
    #[must_use]
    pub fn written(&self) -> usize {
        self.written
    }

    /// Close out the current phase with a timing entry, flush, and switch.
    ///
    /// # Errors
    /// Returns [`MigrationError`] when the buffered entries cannot be written.
    pub fn enter_phase(&mut self, phase: MigrationPhase) -> Result<(), MigrationError> {
        let elapsed = u64::try_from(self.phase_started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let finished = self.phase;
        self.record(
            LogEntry::new(LogLevel::Debug, finished, "phase", format!("leaving {finished}"))
                .with_duration_ms(elapsed),
        );
        self.flush()?;
        self.phase = phase;
        self.phase_started = Instant::now();
        self.info("phase", format!("entering {phase}"));
        Ok(())
    }

    pub fn info(&mut self, operation: &str, message: impl Into<String>) {
        self.record(LogEntry::new(LogLevel::Info, self.phase, operation, message));
    }

    pub fn warn(&mut self, operation: &str, message: impl Into<String>) {
        self.record(LogEntry::new(LogLevel::Warn, self.phase, operation, message));
    }

    pub fn error(&mut self, operation: &str, message: impl Into<String>) {
        self.record(LogEntry::new(LogLevel::Error, self.phase, operation, message));
    }

    /// Buffer `entry` and mirror it to `tracing`.
    pub fn record(&mut self, entry: LogEntry) {
        let phase = entry.phase.as_str();
        let operation = entry.operation.as_str();
        match entry.level {
            LogLevel::Debug => debug!(phase, operation, "{}", entry.message),
            LogLevel::Info => info!(phase, operation, "{}", entry.message),
            LogLevel::Warn => warn!(phase, operation, "{}", entry.message),
            LogLevel::Error => error!(phase, operation, "{}", entry.message),
        }
        self.pending.push(entry);
    }

    /// Write every buffered entry in one append.
    ///
    /// # Errors
    /// Returns [`MigrationError`] when an entry cannot be encoded or the
    /// append fails. Entries stay buffered on failure.
    pub fn flush(&mut self) -> Result<(), MigrationError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let mut bytes = Vec::new();
        for entry in &self.pending {
            serde_json::to_writer(&mut bytes, entry).map_err(MigrationError::json("log entry"))?;
            bytes.push(b'\n');
        }
        self.fs.append(&self.path, &bytes).map_err(MigrationError::io("append log", &self.path))?;
        self.written += self.pending.len();
        self.pending.clear();
        Ok(())
    }
}

impl Drop for AuditLogger {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            warn!(error = %err, path = %self.path.display(), "failed to flush migration log");
        }
    }
}

/// Read every complete entry of a log. A torn final line (no trailing
/// newline) is ignored.
///
/// # Errors
/// Returns [`MigrationError::Io`] when the file cannot be read and
/// [`MigrationError::Json`] when a complete line does not parse.
pub fn read_log(fs: &dyn FileSystem, path: &Path) -> Result<Vec<LogEntry>, MigrationError> {
    let bytes = fs.read(path).map_err(MigrationError::io("read log", path))?;
    let complete = match bytes.iter().rposition(|byte| *byte == b'\n') {
        Some(last) => &bytes[..last],
        None => return Ok(Vec::new()),
    };
    complete
        .split(|byte| *byte == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .map(|line| serde_json::from_slice(line).map_err(MigrationError::json("log entry")))
        .collect()
}

/// Most recent run log in `logs_dir`, if any.
///
/// # Errors
/// Returns [`MigrationError::Io`] when the directory cannot be listed.
pub fn latest_log(fs: &dyn FileSystem, logs_dir: &Path) -> Result<Option<PathBuf>, MigrationError> {
    let entries = fs.list_dir(logs_dir).map_err(MigrationError::io("list logs", logs_dir))?;
    Ok(entries
        .into_iter()
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?;
            let stem = name.strip_prefix(LOG_PREFIX)?.strip_suffix(LOG_SUFFIX)?;
            let (millis, suffix) = match stem.split_once('-') {
                Some((millis, suffix)) => {
                    (millis.parse::<i128>().ok()?, suffix.parse::<u32>().ok()?)
                }
                None => (stem.parse::<i128>().ok()?, 0),
            };
            Some(((millis, suffix), path))
        })
        .max_by_key(|(key, _)| *key)
        .map(|(_, path)| path))
}

#[cfg(test)]
mod tests {
    use time::Duration;

    use crate::fs::MemoryFileSystem;

    use super::*;

    fn logs_dir() -> &'static Path {
        Path::new("/data/logs")
    }

    #[test]
    fn entries_are_written_at_phase_boundaries() -> Result<(), MigrationError> {
        let fs = Arc::new(MemoryFileSystem::new());
        let mut logger = AuditLogger::create(fs.clone(), logs_dir(), OffsetDateTime::UNIX_EPOCH)?;
        logger.info("init", "migration started");
        assert_eq!(logger.written(), 0);

        logger.enter_phase(MigrationPhase::Backup)?;
        let entries = read_log(fs.as_ref(), logger.path())?;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "migration started");
        assert!(entries[1].duration_ms.is_some());

        let path = logger.path().to_path_buf();
        drop(logger);
        let entries = read_log(fs.as_ref(), &path)?;
        assert_eq!(entries.last().map(|entry| entry.phase), Some(MigrationPhase::Backup));
        Ok(())
    }

    #[test]
    fn torn_final_line_is_ignored() -> Result<(), MigrationError> {
        let fs = MemoryFileSystem::new();
        let path = logs_dir().join("migration-1.jsonl");
        let entry = LogEntry::new(LogLevel::Info, MigrationPhase::Import, "import", "tasks");
        let mut bytes = serde_json::to_vec(&entry).map_err(MigrationError::json("entry"))?;
        bytes.extend_from_slice(b"\n{\"timestamp\":\"2025-");
        fs.write(&path, &bytes).map_err(MigrationError::io("write", &path))?;

        let entries = read_log(&fs, &path)?;
        assert_eq!(entries, vec![entry]);
        Ok(())
    }

    #[test]
    fn latest_log_orders_by_timestamp_not_name() -> Result<(), MigrationError> {
        let fs = Arc::new(MemoryFileSystem::new());
        assert_eq!(latest_log(fs.as_ref(), logs_dir())?, None);

        let early = OffsetDateTime::UNIX_EPOCH + Duration::seconds(9);
        let late = OffsetDateTime::UNIX_EPOCH + Duration::seconds(10);
        let _first = AuditLogger::create(fs.clone(), logs_dir(), early)?;
        let _second = AuditLogger::create(fs.clone(), logs_dir(), late)?;
        let third = AuditLogger::create(fs.clone(), logs_dir(), late)?;
        assert!(third.path().ends_with("migration-10000-1.jsonl"));

        assert_eq!(latest_log(fs.as_ref(), logs_dir())?.as_deref(), Some(third.path()));
        Ok(())
    }
}
