use std::path::{Path, PathBuf};

use async_trait::async_trait;
use log::debug;
use silent_update_core::{CacheError, CacheLayer, CacheStorage};

/// Named caches stored as subdirectories of the host's cache directory.
#[derive(Debug, Clone)]
pub struct DirectoryCacheStorage {
    root: PathBuf,
}

impl DirectoryCacheStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

#[async_trait]
impl CacheStorage for DirectoryCacheStorage {
    async fn cache_names(&self) -> Result<Vec<String>, CacheError> {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(CacheError::new("List cache directories", error.to_string())),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|error| CacheError::new("List cache directories", error.to_string()))?
        {
            let is_dir = entry
                .file_type()
                .await
                .is_ok_and(|file_type| file_type.is_dir());
            if is_dir && let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn delete_cache(&self, name: &str) -> Result<bool, CacheError> {
        if !is_plain_name(name) {
            return Err(CacheError::new(
                "Delete cache directory",
                format!("refusing to delete {name:?}"),
            ));
        }
        match tokio::fs::remove_dir_all(self.root.join(name)).await {
            Ok(()) => {
                debug!("Deleted cache directory {name}");
                Ok(true)
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(CacheError::new("Delete cache directory", error.to_string())),
        }
    }
}

/// Loose cache files (including leftover `.tmp` files) directly under the
/// cache directory.
#[derive(Debug, Clone)]
pub struct LooseEntryLayer {
    root: PathBuf,
}

impl LooseEntryLayer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

async fn remove_loose_files(root: &Path) -> std::io::Result<usize> {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(error) => return Err(error),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            match tokio::fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => return Err(error),
            }
        }
    }
    Ok(removed)
}

#[async_trait]
impl CacheLayer for LooseEntryLayer {
    fn name(&self) -> &'static str {
        "loose-entries"
    }

    async fn clear(&self) -> Result<usize, CacheError> {
        remove_loose_files(&self.root)
            .await
            .map_err(|error| CacheError::new("Clear loose cache entries", error.to_string()))
    }
}
