use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use taskvault_core::SourceFile;

use crate::fs::FileSystem;
use crate::MigrationError;

/// Hex SHA-256 of `bytes`.
#[must_use]
pub fn digest_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone)]
pub struct IntegrityChecker {
    fs: Arc<dyn FileSystem>,
}

impl IntegrityChecker {
    #[must_use]
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self { fs }
    }

    /// # Errors
    /// Returns [`MigrationError::Io`] when `path` cannot be read.
    pub fn digest(&self, path: &Path) -> Result<String, MigrationError> {
        let bytes = self.fs.read(path).map_err(MigrationError::io("checksum", path))?;
        Ok(digest_bytes(&bytes))
    }

    /// Checksum and size of a source document.
    ///
    /// # Errors
    /// Returns [`MigrationError::Io`] when `path` cannot be read.
    pub fn describe(&self, path: &Path) -> Result<SourceFile, MigrationError> {
        let bytes = self.fs.read(path).map_err(MigrationError::io("checksum", path))?;
        Ok(SourceFile {
            path: path.to_path_buf(),
            checksum: digest_bytes(&bytes),
            size: bytes.len() as u64,
        })
    }

    /// `true` when both files hold identical bytes.
    ///
    /// # Errors
    /// Returns [`MigrationError::Io`] when either file cannot be read.
    pub fn compare(&self, left: &Path, right: &Path) -> Result<bool, MigrationError> {
        Ok(self.digest(left)? == self.digest(right)?)
    }

    /// # Errors
    /// Returns [`MigrationError::ChecksumMismatch`] when the digest of `path`
    /// differs from `expected`.
    pub fn verify(&self, path: &Path, expected: &str) -> Result<(), MigrationError> {
        let actual = self.digest(path)?;
        if actual != expected {
            return Err(MigrationError::ChecksumMismatch {
                path: path.to_path_buf(),
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(())
    }

    /// Compare the documents on disk with the checksums captured at `init`.
    /// A document that was absent at `init` must still be absent.
    ///
    /// # Errors
    /// Returns [`MigrationError::Io`] when a present document cannot be read.
    pub fn check_sources(
        &self,
        recorded: &BTreeMap<String, SourceFile>,
        sources: &[(&'static str, PathBuf)],
    ) -> Result<SourceIntegrityReport, MigrationError> {
        let mut files = Vec::with_capacity(sources.len());
        for (name, path) in sources {
            let expected = recorded.get(*name).map(|file| file.checksum.clone());
            let actual = if self.fs.exists(path) { Some(self.digest(path)?) } else { None };
            files.push(FileIntegrity {
                name: (*name).to_string(),
                path: path.clone(),
                matches: expected == actual,
                expected,
                actual,
            });
        }
        Ok(SourceIntegrityReport { ok: files.iter().all(|file| file.matches), files })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileIntegrity {
    pub name: String,
    pub path: PathBuf,
    pub expected: Option<String>,
    pub actual: Option<String>,
    pub matches: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceIntegrityReport {
    pub ok: bool,
    pub files: Vec<FileIntegrity>,
}

impl SourceIntegrityReport {
    /// First mismatch as an error, or `Ok` when every document matches.
    ///
    /// # Errors
    /// Returns [`MigrationError::ChecksumMismatch`] for the first changed document.
    pub fn into_result(self) -> Result<(), MigrationError> {
        match self.files.into_iter().find(|file| !file.matches) {
            None => Ok(()),
            Some(file) => Err(MigrationError::ChecksumMismatch {
                path: file.path,
                expected: file.expected.unwrap_or_else(|| "<absent>".to_string()),
                actual: file.actual.unwrap_or_else(|| "<absent>".to_string()),
            }),
        }
    }
}
