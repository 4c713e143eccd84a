use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};

use fs2::FileExt;
use silent_update_platform::AppPaths;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LeaderError {
    #[error("another instance is already running the updater")]
    AlreadyRunning,
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl LeaderError {
    fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }
}

/// Exclusive claim on running the updater for one user profile. Released
/// when dropped.
#[derive(Debug)]
pub struct UpdateLeader {
    _file: File,
}

impl UpdateLeader {
    /// # Errors
    /// Returns [`LeaderError::AlreadyRunning`] when another process holds the
    /// lock, or an IO error when the lock file cannot be used.
    pub fn acquire(paths: &AppPaths) -> Result<Self, LeaderError> {
        paths
            .ensure_dirs()
            .map_err(|error| LeaderError::io("failed to create app directories", error))?;

        let mut lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(paths.leader_lock_file())
            .map_err(|error| LeaderError::io("failed to open updater lock file", error))?;

        match lock_file.try_lock_exclusive() {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(LeaderError::AlreadyRunning);
            }
            Err(error) if error.raw_os_error() == fs2::lock_contended_error().raw_os_error() => {
                return Err(LeaderError::AlreadyRunning);
            }
            Err(error) => {
                return Err(LeaderError::io("failed to acquire updater lock", error));
            }
        }

        lock_file
            .set_len(0)
            .and_then(|()| lock_file.seek(SeekFrom::Start(0)).map(|_| ()))
            .and_then(|()| writeln!(lock_file, "{}", std::process::id()))
            .map_err(|error| LeaderError::io("failed to write updater lock metadata", error))?;

        Ok(Self { _file: lock_file })
    }
}

#[cfg(test)]
mod tests {
    use silent_update_platform::AppPaths;

    use super::{LeaderError, UpdateLeader};

    #[test]
    fn second_claim_is_rejected_until_release() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let paths = AppPaths::rooted_at(temp_dir.path());

        let leader = UpdateLeader::acquire(&paths).expect("first claim should succeed");
        assert!(matches!(
            UpdateLeader::acquire(&paths),
            Err(LeaderError::AlreadyRunning)
        ));

        drop(leader);
        UpdateLeader::acquire(&paths).expect("claim should succeed after release");
    }

    #[cfg(unix)]
    #[test]
    fn lock_file_records_pid() {
        let temp_dir = tempfile::tempdir().expect("temporary directory should be created");
        let paths = AppPaths::rooted_at(temp_dir.path());

        let _leader = UpdateLeader::acquire(&paths).expect("claim should succeed");

        let contents =
            std::fs::read_to_string(paths.leader_lock_file()).expect("lock file should exist");
        assert_eq!(contents.trim(), std::process::id().to_string());
    }
}
