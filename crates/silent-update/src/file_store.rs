use std::fmt::Write as _;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use silent_update_core::{KeyValueStore, StorageError};

/// [`KeyValueStore`] keeping one file per key in a directory.
///
/// Writes go through a temp file and a rename, so a crash never leaves a
/// half-written value behind.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    #[must_use]
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(file_name_for(key))
    }
}

/// Injective mapping from a key to a safe file name.
fn file_name_for(key: &str) -> String {
    let mut name = String::with_capacity(key.len() + 3);
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'-' | b'_') {
            name.push(char::from(byte));
        } else {
            let _ = write!(name, "%{byte:02X}");
        }
    }
    name.push_str(".kv");
    name
}

#[async_trait]
impl KeyValueStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match tokio::fs::read_to_string(self.path_for(key)).await {
            Ok(value) => Ok(Some(value)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(key);
        let data = value.as_bytes().to_vec();
        tokio::task::spawn_blocking(move || write_atomic(&path, &data))
            .await
            .map_err(|error| StorageError::Unavailable(format!("write task failed: {error}")))?
            .map_err(StorageError::from)
    }

    async fn remove(&self, key: &str) -> Result<(), StorageError> {
        match tokio::fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error.into()),
        }
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "storage path has no parent")
    })?;
    std::fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or("value");
    let timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |duration| duration.as_nanos());
    let pid = std::process::id();

    let mut tmp_path = None;
    for attempt in 0..16_u8 {
        let candidate = parent.join(format!(".{file_name}.{pid}.{timestamp}.{attempt}.tmp"));
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
        {
            Ok(mut file) => {
                if let Err(error) = file.write_all(data).and_then(|()| file.sync_all()) {
                    let _ = std::fs::remove_file(&candidate);
                    return Err(error);
                }
                tmp_path = Some(candidate);
                break;
            }
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(error) => return Err(error),
        }
    }

    let Some(tmp_path) = tmp_path else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "failed to create unique storage temp file",
        ));
    };

    // rename replaces an existing destination on every supported platform
    if let Err(error) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(error);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use silent_update_core::KeyValueStore;

    use super::{FileStore, file_name_for};

    #[test]
    fn file_names_escape_unsafe_bytes() {
        assert_eq!(file_name_for("silent-update.queue"), "silent-update.queue.kv");
        assert_eq!(file_name_for("../etc/passwd"), "..%2Fetc%2Fpasswd.kv");
        assert_ne!(file_name_for("a/b"), file_name_for("a%2Fb"));
    }

    #[tokio::test]
    async fn set_get_remove_cycle() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let store = FileStore::new(temp_dir.path().join("storage"));

        assert_eq!(store.get("k").await.expect("read should succeed"), None);

        store.set("k", "first").await.expect("write should succeed");
        store.set("k", "second").await.expect("overwrite should succeed");
        assert_eq!(
            store.get("k").await.expect("read should succeed"),
            Some("second".to_string())
        );

        store.remove("k").await.expect("remove should succeed");
        store.remove("k").await.expect("removing twice is fine");
        assert_eq!(store.get("k").await.expect("read should succeed"), None);
    }

    #[tokio::test]
    async fn writes_leave_no_temp_files() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let store = FileStore::new(temp_dir.path());

        store.set("a", "1").await.expect("write should succeed");
        store.set("b", "2").await.expect("write should succeed");

        let names: Vec<String> = std::fs::read_dir(temp_dir.path())
            .expect("dir should be readable")
            .filter_map(Result::ok)
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.iter().all(|name| name.ends_with(".kv")));
    }
}
