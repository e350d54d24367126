//! File-backed key-value port with atomic replace.
//!
//! Each key maps to one JSON file in the storage directory. Writes go
//! through a temp file plus rename behind an advisory lock, so a reader
//! never observes a torn value and concurrent processes cannot
//! interleave writes.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;

use super::KeyValuePort;

/// Temporary file suffix for atomic writes.
const TMP_SUFFIX: &str = ".tmp";

/// Lock file suffix for concurrent access prevention.
const LOCK_SUFFIX: &str = ".lock";

/// Key-value port persisting each key as a file under one directory.
#[derive(Debug, Clone)]
pub struct FileKeyValuePort {
    /// Directory where value files are stored.
    dir: PathBuf,
}

impl FileKeyValuePort {
    /// Creates a port rooted at the given storage directory.
    ///
    /// The directory is created lazily on first write.
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Returns the path of the file backing a key.
    #[must_use]
    pub fn value_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sanitize(key)))
    }

    fn tmp_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json{TMP_SUFFIX}", sanitize(key)))
    }

    fn lock_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}{LOCK_SUFFIX}", sanitize(key)))
    }

    fn write_atomic(&self, key: &str, value: &str) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)?;

        let lock_file = File::create(self.lock_path(key))?;
        FileExt::lock_exclusive(&lock_file)?;

        let tmp_path = self.tmp_path(key);
        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(value.as_bytes())?;
        tmp_file.sync_all()?;

        fs::rename(&tmp_path, self.value_path(key))?;
        Ok(())
    }

    fn read_value(&self, key: &str) -> anyhow::Result<Option<String>> {
        let path = self.value_path(key);
        if !path.exists() {
            return Ok(None);
        }

        let lock_path = self.lock_path(key);
        if lock_path.exists() {
            let lock_file = File::open(&lock_path)?;
            FileExt::lock_shared(&lock_file)?;
        }

        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Keys become file names; keep them path-safe.
fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            _ => c,
        })
        .collect()
}

#[async_trait]
impl KeyValuePort for FileKeyValuePort {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        // File I/O is blocking; run it off the async executor.
        let this = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || this.read_value(&key)).await?
    }

    async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        let this = self.clone();
        let key = key.to_string();
        let value = value.to_string();
        tokio::task::spawn_blocking(move || this.write_atomic(&key, &value)).await?
    }

    async fn remove(&self, key: &str) -> anyhow::Result<()> {
        let path = self.value_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
