//! Filesystem seam. The engine touches disk only through [`FileSystem`], so
//! lock, state, audit and swap behaviour can be exercised against
//! [`MemoryFileSystem`] and failures can be injected by wrapping
//! [`OsFileSystem`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

pub trait FileSystem: Debug + Send + Sync {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>>;

    /// Replace the contents of `path`, creating it when absent.
    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    /// Create `path` exclusively. Fails with [`io::ErrorKind::AlreadyExists`]
    /// when something is already there.
    fn create_new(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    fn append(&self, path: &Path, contents: &[u8]) -> io::Result<()>;

    /// Atomic replace within one filesystem.
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;

    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64>;

    fn remove_file(&self, path: &Path) -> io::Result<()>;

    fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    fn exists(&self, path: &Path) -> bool;

    fn modified(&self, path: &Path) -> io::Result<SystemTime>;

    /// Direct children of a directory. A missing directory lists as empty.
    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;

    /// Identifier of the filesystem holding `path`, when the platform exposes one.
    fn device_id(&self, path: &Path) -> io::Result<Option<u64>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OsFileSystem;

impl OsFileSystem {
    #[cfg(unix)]
    fn sync_parent(path: &Path) {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
    }

    #[cfg(not(unix))]
    fn sync_parent(_path: &Path) {}
}

impl FileSystem for OsFileSystem {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        fs::read(path)
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let mut file = File::create(path)?;
        file.write_all(contents)?;
        file.sync_all()
    }

    fn create_new(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        file.write_all(contents)?;
        file.sync_all()
    }

    fn append(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(contents)?;
        file.sync_data()
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)?;
        Self::sync_parent(to);
        Ok(())
    }

    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64> {
        let copied = fs::copy(from, to)?;
        File::open(to)?.sync_all()?;
        Ok(copied)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fs::remove_file(path)
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn modified(&self, path: &Path) -> io::Result<SystemTime> {
        fs::metadata(path)?.modified()
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let entries = match fs::read_dir(path) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut paths =
            entries.map(|entry| entry.map(|entry| entry.path())).collect::<io::Result<Vec<_>>>()?;
        paths.sort();
        Ok(paths)
    }

    #[cfg(unix)]
    fn device_id(&self, path: &Path) -> io::Result<Option<u64>> {
        use std::os::unix::fs::MetadataExt;
        Ok(Some(fs::metadata(path)?.dev()))
    }

    #[cfg(not(unix))]
    fn device_id(&self, path: &Path) -> io::Result<Option<u64>> {
        fs::metadata(path)?;
        Ok(None)
    }
}

#[derive(Debug, Clone)]
struct MemoryFile {
    bytes: Vec<u8>,
    modified: SystemTime,
}

#[derive(Debug, Default)]
struct MemoryTree {
    files: BTreeMap<PathBuf, MemoryFile>,
    dirs: BTreeSet<PathBuf>,
    devices: BTreeMap<PathBuf, u64>,
}

impl MemoryTree {
    fn device_of(&self, path: &Path) -> u64 {
        path.ancestors().find_map(|ancestor| self.devices.get(ancestor).copied()).unwrap_or(0)
    }

    fn is_dir(&self, path: &Path) -> bool {
        self.dirs.contains(path) || self.files.keys().any(|file| file.starts_with(path) && file != path)
    }
}

/// In-memory [`FileSystem`] for tests. Directories are implicit parents of
/// files; `set_device` splits the tree into simulated mount points.
#[derive(Debug, Default)]
pub struct MemoryFileSystem {
    tree: Mutex<MemoryTree>,
}

impl MemoryFileSystem {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tree(&self) -> io::Result<MutexGuard<'_, MemoryTree>> {
        self.tree.lock().map_err(|_| io::Error::other("memory filesystem lock poisoned"))
    }

    /// Treat `dir` and everything below it as living on device `id`.
    ///
    /// # Errors
    /// Returns an error when the internal lock is poisoned.
    pub fn set_device(&self, dir: &Path, id: u64) -> io::Result<()> {
        self.tree()?.devices.insert(dir.to_path_buf(), id);
        Ok(())
    }

    /// Backdate or forward-date a file's modification time.
    ///
    /// # Errors
    /// Returns [`io::ErrorKind::NotFound`] when `path` does not exist.
    pub fn set_modified(&self, path: &Path, modified: SystemTime) -> io::Result<()> {
        let mut tree = self.tree()?;
        let file = tree.files.get_mut(path).ok_or_else(|| not_found(path))?;
        file.modified = modified;
        Ok(())
    }

    fn put(tree: &mut MemoryTree, path: &Path, bytes: Vec<u8>) {
        tree.files.insert(path.to_path_buf(), MemoryFile { bytes, modified: SystemTime::now() });
    }
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, format!("{} not found", path.display()))
}

impl FileSystem for MemoryFileSystem {
    fn read(&self, path: &Path) -> io::Result<Vec<u8>> {
        let tree = self.tree()?;
        tree.files.get(path).map(|file| file.bytes.clone()).ok_or_else(|| not_found(path))
    }

    fn write(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        Self::put(&mut *self.tree()?, path, contents.to_vec());
        Ok(())
    }

    fn create_new(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let mut tree = self.tree()?;
        if tree.files.contains_key(path) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", path.display()),
            ));
        }
        Self::put(&mut tree, path, contents.to_vec());
        Ok(())
    }

    fn append(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let mut tree = self.tree()?;
        let mut bytes = tree.files.get(path).map(|file| file.bytes.clone()).unwrap_or_default();
        bytes.extend_from_slice(contents);
        Self::put(&mut tree, path, bytes);
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut tree = self.tree()?;
        if tree.device_of(from) != tree.device_of(to) {
            return Err(io::Error::other("cross-device link"));
        }
        let file = tree.files.remove(from).ok_or_else(|| not_found(from))?;
        tree.files.insert(to.to_path_buf(), file);
        Ok(())
    }

    fn copy(&self, from: &Path, to: &Path) -> io::Result<u64> {
        let mut tree = self.tree()?;
        let bytes =
            tree.files.get(from).map(|file| file.bytes.clone()).ok_or_else(|| not_found(from))?;
        let len = bytes.len() as u64;
        Self::put(&mut tree, to, bytes);
        Ok(len)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        self.tree()?.files.remove(path).map(|_| ()).ok_or_else(|| not_found(path))
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        let mut tree = self.tree()?;
        for ancestor in path.ancestors() {
            if !ancestor.as_os_str().is_empty() {
                tree.dirs.insert(ancestor.to_path_buf());
            }
        }
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.tree().is_ok_and(|tree| tree.files.contains_key(path) || tree.is_dir(path))
    }

    fn modified(&self, path: &Path) -> io::Result<SystemTime> {
        let tree = self.tree()?;
        tree.files.get(path).map(|file| file.modified).ok_or_else(|| not_found(path))
    }

    fn list_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let tree = self.tree()?;
        let mut children: BTreeSet<PathBuf> = BTreeSet::new();
        let nested = tree.files.keys().chain(tree.dirs.iter());
        for entry in nested {
            if let Ok(rest) = entry.strip_prefix(path) {
                if let Some(first) = rest.components().next() {
                    children.insert(path.join(first));
                }
            }
        }
        Ok(children.into_iter().collect())
    }

    fn device_id(&self, path: &Path) -> io::Result<Option<u64>> {
        let tree = self.tree()?;
        if !tree.files.contains_key(path) && !tree.is_dir(path) {
            return Err(not_found(path));
        }
        Ok(Some(tree.device_of(path)))
    }
}
