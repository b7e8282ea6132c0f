//! Directory-backed pool of pre-sized extent files

use std::fs::{self, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::debug;
use uuid::Uuid;

use super::{list_extent_files, Extent, SpaceProvider};
use crate::aio::fileio;
use crate::format::SBLK_SIZE;

/// Pool of empty extent files kept in a directory.
///
/// Acquiring moves a file from the pool into the journal directory (creating
/// one when the pool is empty); releasing zeroes the header block and moves
/// the file back.
#[derive(Debug)]
pub struct FilePool {
    dir: PathBuf,
    extent_size: u64,
    free: Mutex<Vec<PathBuf>>,
    created: AtomicU64,
    recycled: AtomicU64,
}

impl FilePool {
    /// Opens (creating if needed) a pool directory.
    ///
    /// Files already in the directory with the right size are adopted.
    pub fn open(dir: impl AsRef<Path>, extent_size: u64) -> io::Result<Self> {
        if extent_size < (2 * SBLK_SIZE) as u64 || extent_size % SBLK_SIZE as u64 != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("extent size {} must be a multiple of {} and hold at least two blocks", extent_size, SBLK_SIZE),
            ));
        }
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut free = Vec::new();
        for path in list_extent_files(&dir)? {
            if fs::metadata(&path)?.len() == extent_size {
                free.push(path);
            }
        }
        debug!(dir = %dir.display(), free = free.len(), "opened extent pool");

        Ok(Self {
            dir,
            extent_size,
            free: Mutex::new(free),
            created: AtomicU64::new(0),
            recycled: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of idle files currently in the pool.
    pub fn free_count(&self) -> usize {
        self.free.lock().map(|free| free.len()).unwrap_or(0)
    }

    /// Files created because the pool was empty.
    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Files handed back and made available again.
    pub fn recycled_count(&self) -> u64 {
        self.recycled.load(Ordering::Relaxed)
    }

    fn pop_free(&self) -> io::Result<Option<PathBuf>> {
        let mut free = self
            .free
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "extent pool lock poisoned"))?;
        Ok(free.pop())
    }

    fn create_file(&self, path: &Path) -> io::Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(self.extent_size)?;
        file.sync_all()
    }
}

impl SpaceProvider for FilePool {
    fn extent_size(&self) -> u64 {
        self.extent_size
    }

    fn acquire_extent(&self, target_dir: &Path, size_hint: u64) -> io::Result<Extent> {
        if size_hint > self.extent_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("requested {} bytes, pool extents are {}", size_hint, self.extent_size),
            ));
        }
        fs::create_dir_all(target_dir)?;

        if let Some(pooled) = self.pop_free()? {
            let extent = Extent::from_path(&pooled)?;
            let target = target_dir.join(extent.file_name());
            fs::rename(&pooled, &target)?;
            debug!(extent = %extent.id(), "reusing pooled extent");
            return Ok(Extent::new(extent.id(), target, self.extent_size));
        }

        let id = Uuid::new_v4();
        let extent = Extent::new(id, PathBuf::new(), self.extent_size);
        let target = target_dir.join(extent.file_name());
        self.create_file(&target)?;
        self.created.fetch_add(1, Ordering::Relaxed);
        debug!(extent = %id, "created extent");
        Ok(Extent::new(id, target, self.extent_size))
    }

    fn release_extent(&self, extent: Extent) -> io::Result<()> {
        let file = OpenOptions::new().write(true).open(extent.path())?;
        fileio::write_all_at(&file, &vec![0u8; SBLK_SIZE], 0)?;
        file.sync_data()?;
        drop(file);

        let pooled = self.dir.join(extent.file_name());
        fs::rename(extent.path(), &pooled)?;
        self.recycled.fetch_add(1, Ordering::Relaxed);

        let mut free = self
            .free
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "extent pool lock poisoned"))?;
        free.push(pooled);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SIZE: u64 = 4 * SBLK_SIZE as u64;

    #[test]
    fn test_acquire_creates_sized_file() {
        let root = TempDir::new().unwrap();
        let pool = FilePool::open(root.path().join("pool"), SIZE).unwrap();
        let extent = pool.acquire_extent(&root.path().join("jrnl"), SIZE).unwrap();

        assert!(extent.path().starts_with(root.path().join("jrnl")));
        assert_eq!(fs::metadata(extent.path()).unwrap().len(), SIZE);
        assert_eq!(pool.created_count(), 1);
    }

    #[test]
    fn test_release_then_acquire_recycles() {
        let root = TempDir::new().unwrap();
        let jdir = root.path().join("jrnl");
        let pool = FilePool::open(root.path().join("pool"), SIZE).unwrap();

        let extent = pool.acquire_extent(&jdir, SIZE).unwrap();
        let id = extent.id();
        fs::write(extent.path(), vec![0xAB; SIZE as usize]).unwrap();
        pool.release_extent(extent).unwrap();
        assert_eq!(pool.free_count(), 1);

        let again = pool.acquire_extent(&jdir, SIZE).unwrap();
        assert_eq!(again.id(), id);
        assert_eq!(pool.created_count(), 1);
        assert_eq!(pool.recycled_count(), 1);

        let bytes = fs::read(again.path()).unwrap();
        assert!(bytes[..SBLK_SIZE].iter().all(|b| *b == 0));
        assert_eq!(bytes[SBLK_SIZE], 0xAB);
    }

    #[test]
    fn test_oversized_request_rejected() {
        let root = TempDir::new().unwrap();
        let pool = FilePool::open(root.path().join("pool"), SIZE).unwrap();
        let err = pool.acquire_extent(root.path(), SIZE + 1).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_invalid_extent_size() {
        let root = TempDir::new().unwrap();
        assert!(FilePool::open(root.path(), 100).is_err());
        assert!(FilePool::open(root.path(), SBLK_SIZE as u64).is_err());
    }

    #[test]
    fn test_existing_files_adopted() {
        let root = TempDir::new().unwrap();
        let pool_dir = root.path().join("pool");
        {
            let pool = FilePool::open(&pool_dir, SIZE).unwrap();
            let extent = pool.acquire_extent(&root.path().join("j"), SIZE).unwrap();
            pool.release_extent(extent).unwrap();
        }
        let reopened = FilePool::open(&pool_dir, SIZE).unwrap();
        assert_eq!(reopened.free_count(), 1);
    }
}
