use std::fs::OpenOptions;
use std::io::Write;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use fs2::FileExt;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::errors::StoreError;

/// Result of a mutation closure: whether the collection must be rewritten.
pub(crate) enum Commit<R> {
    Write(R),
    Skip(R),
}

/// A JSON array persisted as one file, guarded by an in-process mutex and an
/// advisory file lock so other processes sharing the state directory see
/// serialized read-modify-write cycles. Writes go to a temporary file that is
/// fsynced and renamed over the original.
pub(crate) struct Collection<T> {
    path: PathBuf,
    lock_path: PathBuf,
    guard: Mutex<()>,
    _rows: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> Collection<T> {
    pub fn open(state_dir: &Path, name: &str) -> Result<Self, StoreError> {
        let locks_dir = state_dir.join("locks");
        std::fs::create_dir_all(&locks_dir)
            .with_context(|| format!("Failed to create {}", locks_dir.display()))?;
        let collection = Self {
            path: state_dir.join(format!("{name}.json")),
            lock_path: locks_dir.join(format!("{name}.lock")),
            guard: Mutex::new(()),
            _rows: PhantomData,
        };
        if !collection.path.exists() {
            collection.update(|_| Ok::<_, StoreError>(Commit::Write(())))?;
        }
        Ok(collection)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<Vec<T>, StoreError> {
        self.locked(|| self.load())
    }

    /// Run `f` against the current rows under both locks, persisting the
    /// rows when it returns `Commit::Write`.
    pub fn update<R, E>(&self, f: impl FnOnce(&mut Vec<T>) -> Result<Commit<R>, E>) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        self.locked(|| {
            let mut rows = self.load()?;
            match f(&mut rows)? {
                Commit::Write(value) => {
                    self.persist(&rows)?;
                    Ok(value)
                }
                Commit::Skip(value) => Ok(value),
            }
        })
    }

    fn locked<R, E>(&self, f: impl FnOnce() -> Result<R, E>) -> Result<R, E>
    where
        E: From<StoreError>,
    {
        let _guard = self.guard.lock().map_err(|_| StoreError::LockPoisoned)?;
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .with_context(|| format!("Failed to open lock {}", self.lock_path.display()))
            .map_err(StoreError::from)?;
        FileExt::lock_exclusive(&lock_file)
            .with_context(|| format!("Failed to lock {}", self.lock_path.display()))
            .map_err(StoreError::from)?;
        // The advisory lock is released when `lock_file` is dropped.
        f()
    }

    fn load(&self) -> Result<Vec<T>, StoreError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(anyhow::Error::from(err)
                    .context(format!("Failed to read {}", self.path.display()))
                    .into());
            }
        };
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        let rows = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", self.path.display()))?;
        Ok(rows)
    }

    fn persist(&self, rows: &[T]) -> Result<(), StoreError> {
        let dir = self
            .path
            .parent()
            .context("Collection path has no parent directory")?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
        serde_json::to_writer_pretty(&mut tmp, rows).context("Failed to serialize collection")?;
        tmp.write_all(b"\n").context("Failed to write collection")?;
        tmp.as_file()
            .sync_all()
            .context("Failed to fsync collection")?;
        tmp.persist(&self.path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_open_creates_empty_array() {
        let dir = tempdir().unwrap();
        let rows: Collection<u32> = Collection::open(dir.path(), "numbers").unwrap();
        assert_eq!(std::fs::read_to_string(rows.path()).unwrap().trim(), "[]");
        assert!(rows.read().unwrap().is_empty());
    }

    #[test]
    fn test_skip_does_not_rewrite() {
        let dir = tempdir().unwrap();
        let rows: Collection<u32> = Collection::open(dir.path(), "numbers").unwrap();
        rows.update(|r| {
            r.push(1);
            Ok::<_, StoreError>(Commit::Skip(()))
        })
        .unwrap();
        assert!(rows.read().unwrap().is_empty());
    }

    #[test]
    fn test_failed_update_leaves_file_untouched() {
        let dir = tempdir().unwrap();
        let rows: Collection<u32> = Collection::open(dir.path(), "numbers").unwrap();
        rows.update(|r| {
            r.push(1);
            Ok::<_, StoreError>(Commit::Write(()))
        })
        .unwrap();
        let result: Result<(), StoreError> = rows.update(|r| {
            r.push(2);
            Err(StoreError::InvalidInput("nope".into()))
        });
        assert!(result.is_err());
        assert_eq!(rows.read().unwrap(), vec![1]);
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempdir().unwrap();
        let rows: Collection<u32> = Collection::open(dir.path(), "numbers").unwrap();
        std::fs::write(rows.path(), "[1, 2").unwrap();
        assert!(rows.read().is_err());
    }

    #[test]
    fn test_concurrent_updates_are_serialized() {
        let dir = tempdir().unwrap();
        let rows: Arc<Collection<u32>> = Arc::new(Collection::open(dir.path(), "numbers").unwrap());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let rows = rows.clone();
                std::thread::spawn(move || {
                    for j in 0..10 {
                        rows.update(|r| {
                            r.push(i * 100 + j);
                            Ok::<_, StoreError>(Commit::Write(()))
                        })
                        .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(rows.read().unwrap().len(), 80);
    }

    #[test]
    fn test_two_handles_share_the_file_lock() {
        let dir = tempdir().unwrap();
        let a: Collection<u32> = Collection::open(dir.path(), "numbers").unwrap();
        let b: Collection<u32> = Collection::open(dir.path(), "numbers").unwrap();
        a.update(|r| {
            r.push(1);
            Ok::<_, StoreError>(Commit::Write(()))
        })
        .unwrap();
        b.update(|r| {
            r.push(2);
            Ok::<_, StoreError>(Commit::Write(()))
        })
        .unwrap();
        assert_eq!(a.read().unwrap(), vec![1, 2]);
    }
}
