//! Storage backed by files under a root directory. Keys map to relative paths.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::Storage;
use crate::error::{StorageError, StorageResult};

const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone)]
pub struct DiskStorage {
    root: PathBuf,
}

impl DiskStorage {
    pub fn new(root: impl Into<PathBuf>) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| {
            StorageError::WriteFailed(format!("Failed to create {}: {}", root.display(), e))
        })?;
        Ok(Self {
            root,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> StorageResult<PathBuf> {
        if key.is_empty() || key.split('/').any(|part| part.is_empty() || part == "..") {
            return Err(StorageError::WriteFailed(format!("Invalid key '{}'", key)));
        }
        Ok(self.root.join(key))
    }
}

async fn blocking<T, F>(f: F) -> StorageResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StorageResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StorageError::ReadFailed(format!("Task join error: {}", e)))?
}

#[async_trait]
impl Storage for DiskStorage {
    async fn read(&self, key: &str) -> StorageResult<Vec<u8>> {
        let path = self.path(key)?;
        let key = key.to_string();
        blocking(move || match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(key)),
            Err(e) => Err(StorageError::ReadFailed(format!("{}: {}", key, e))),
        })
        .await
    }

    async fn write(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        let path = self.path(key)?;
        let data = data.to_vec();
        blocking(move || {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut temp = path.clone().into_os_string();
            temp.push(TEMP_SUFFIX);
            fs::write(&temp, &data)?;
            fs::rename(&temp, &path)?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, key: &str) -> StorageResult<()> {
        let path = self.path(key)?;
        let key = key.to_string();
        blocking(move || match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StorageError::NotFound(key)),
            Err(e) => Err(StorageError::WriteFailed(format!("{}: {}", key, e))),
        })
        .await
    }

    async fn list(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        blocking(move || {
            let mut keys = Vec::new();
            collect_keys(&root, "", &mut keys)?;
            keys.retain(|key| key.starts_with(&prefix));
            keys.sort();
            Ok(keys)
        })
        .await
    }
}

fn collect_keys(dir: &Path, base: &str, keys: &mut Vec<String>) -> StorageResult<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        let key = if base.is_empty() {
            name
        } else {
            format!("{}/{}", base, name)
        };
        if entry.file_type()?.is_dir() {
            collect_keys(&entry.path(), &key, keys)?;
        } else if !key.ends_with(TEMP_SUFFIX) {
            keys.push(key);
        }
    }
    Ok(())
}
