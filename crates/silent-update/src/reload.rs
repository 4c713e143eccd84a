use std::path::PathBuf;

use async_trait::async_trait;
use log::info;
use silent_update_core::{ReloadError, ReloadStrategy};

/// Relaunch the running executable with its original arguments. The host is
/// expected to exit once the update reports completion, which releases the
/// leader lock to the relaunched instance.
#[derive(Debug, Clone, Default)]
pub struct RestartExecutable {
    exe: Option<PathBuf>,
    args: Option<Vec<String>>,
}

impl RestartExecutable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restart a specific binary instead of the current one.
    pub fn with_path(exe: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            exe: Some(exe.into()),
            args: Some(args),
        }
    }

    fn resolve_exe(&self) -> Result<PathBuf, ReloadError> {
        if let Some(exe) = &self.exe {
            return Ok(exe.clone());
        }
        let exe = std::env::current_exe().map_err(|error| {
            ReloadError::new(
                "restart-executable",
                format!("failed to get current executable: {error}"),
            )
        })?;
        Ok(strip_deleted_suffix(exe))
    }
}

/// On Linux, `current_exe()` of a binary replaced on disk points at the old
/// deleted inode and carries a ` (deleted)` suffix.
fn strip_deleted_suffix(exe: PathBuf) -> PathBuf {
    let path_str = exe.to_string_lossy();
    if cfg!(target_os = "linux") && path_str.ends_with(" (deleted)") {
        let fixed = PathBuf::from(path_str.trim_end_matches(" (deleted)"));
        info!("Adjusted exe path from deleted inode: {}", fixed.display());
        fixed
    } else {
        exe
    }
}

#[async_trait]
impl ReloadStrategy for RestartExecutable {
    fn name(&self) -> &'static str {
        "restart-executable"
    }

    async fn reload(&self) -> Result<(), ReloadError> {
        let exe = self.resolve_exe()?;
        let args = self
            .args
            .clone()
            .unwrap_or_else(|| std::env::args().skip(1).collect());

        info!("Restarting from: {}", exe.display());
        std::process::Command::new(&exe)
            .args(&args)
            .spawn()
            .map_err(|error| {
                ReloadError::new(
                    "restart-executable",
                    format!("failed to spawn {}: {error}", exe.display()),
                )
            })?;
        Ok(())
    }
}

/// Run a configured command, e.g. a launcher script or service manager call.
#[derive(Debug, Clone)]
pub struct RelaunchCommand {
    program: String,
    args: Vec<String>,
}

impl RelaunchCommand {
    /// `None` when `command` is empty.
    #[must_use]
    pub fn from_argv(command: &[String]) -> Option<Self> {
        let (program, args) = command.split_first()?;
        if program.trim().is_empty() {
            return None;
        }
        Some(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl ReloadStrategy for RelaunchCommand {
    fn name(&self) -> &'static str {
        "relaunch-command"
    }

    async fn reload(&self) -> Result<(), ReloadError> {
        info!("Running relaunch command: {} {:?}", self.program, self.args);
        let status = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .status()
            .await
            .map_err(|error| {
                ReloadError::new(
                    "relaunch-command",
                    format!("failed to run {}: {error}", self.program),
                )
            })?;

        if status.success() {
            Ok(())
        } else {
            Err(ReloadError::new(
                "relaunch-command",
                format!("{} exited with {status}", self.program),
            ))
        }
    }
}
