//! Journal space: fixed-size extent files
//!
//! The journal does not allocate disk space itself. It asks a
//! [`SpaceProvider`] for extents, writes them front to back, and hands them
//! back once everything they hold is dead. [`FilePool`] is a provider backed
//! by a directory of pre-sized files, which it recycles.

mod pool;

pub use pool::FilePool;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;

/// File extension used for extent files.
pub const EXTENT_FILE_EXT: &str = "jrnl";

/// A fixed-size region of journal space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extent {
    id: Uuid,
    path: PathBuf,
    size: u64,
}

impl Extent {
    pub(crate) fn new(id: Uuid, path: PathBuf, size: u64) -> Self {
        Self { id, path, size }
    }

    /// Wraps an extent file already present in a journal directory.
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let size = fs::metadata(path)?.len();
        let id = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| Uuid::parse_str(stem).ok())
            .unwrap_or_else(Uuid::new_v4);
        Ok(Self {
            id,
            path: path.to_path_buf(),
            size,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn file_name(&self) -> String {
        format!("{}.{}", self.id, EXTENT_FILE_EXT)
    }
}

/// Supplier of reusable journal extents.
///
/// Implementations must be shareable across journals.
pub trait SpaceProvider: Send + Sync {
    /// Size of the extents this provider hands out.
    fn extent_size(&self) -> u64;

    /// Places an extent of at least `size_hint` bytes into `target_dir`.
    ///
    /// The returned extent's header block reads back as zeroes.
    fn acquire_extent(&self, target_dir: &Path, size_hint: u64) -> io::Result<Extent>;

    /// Takes back an extent the journal no longer references.
    fn release_extent(&self, extent: Extent) -> io::Result<()>;
}

/// Lists the extent files of a journal directory.
pub fn list_extent_files(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(files),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some(EXTENT_FILE_EXT) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_from_path_recovers_uuid() {
        let dir = TempDir::new().unwrap();
        let id = Uuid::new_v4();
        let path = dir.path().join(format!("{}.{}", id, EXTENT_FILE_EXT));
        fs::write(&path, vec![0u8; 8192]).unwrap();

        let extent = Extent::from_path(&path).unwrap();
        assert_eq!(extent.id(), id);
        assert_eq!(extent.size(), 8192);
        assert_eq!(extent.file_name(), format!("{}.jrnl", id));
    }

    #[test]
    fn test_list_extent_files_filters_extension() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.jrnl"), b"").unwrap();
        fs::write(dir.path().join("b.jrnl"), b"").unwrap();
        fs::write(dir.path().join("notes.txt"), b"").unwrap();

        let files = list_extent_files(dir.path()).unwrap();
        assert_eq!(files.len(), 2);
    }

    #[test]
    fn test_list_missing_dir_is_empty() {
        let dir = TempDir::new().unwrap();
        let files = list_extent_files(&dir.path().join("absent")).unwrap();
        assert!(files.is_empty());
    }
}
