//! Thin wrappers over the `git` binary.

use crate::error::GitError;
use std::ffi::OsStr;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};

async fn git<I, S>(dir: Option<&Path>, args: I) -> Result<String, GitError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let args: Vec<_> = args.into_iter().map(|a| a.as_ref().to_os_string()).collect();
    let mut command = Command::new("git");
    command.args(&args).kill_on_drop(true);
    if let Some(dir) = dir {
        command.current_dir(dir);
    }

    debug!("Running git {:?}", args);
    let output = command.output().await?;
    if !output.status.success() {
        return Err(GitError::Failed {
            command: args
                .first()
                .map(|a| a.to_string_lossy().into_owned())
                .unwrap_or_default(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Clone `source` into `dest`, which must not exist or be empty.
pub async fn clone(source: &Path, dest: &Path) -> Result<(), GitError> {
    git(None, [OsStr::new("clone"), OsStr::new("--quiet"), source.as_os_str(), dest.as_os_str()])
        .await
        .map(|_| ())
}

pub async fn checkout(dir: &Path, branch: &str) -> Result<(), GitError> {
    git(Some(dir), ["checkout", "--quiet", branch]).await.map(|_| ())
}

/// The commit hash `HEAD` points at.
pub async fn rev_parse_head(dir: &Path) -> Result<String, GitError> {
    git(Some(dir), ["rev-parse", "HEAD"]).await
}

pub async fn init_bare(path: &Path) -> Result<(), GitError> {
    git(None, [OsStr::new("init"), OsStr::new("--quiet"), OsStr::new("--bare"), path.as_os_str()])
        .await
        .map(|_| ())
}

/// Initialise a bare repository at `path` unless one is already there.
pub async fn ensure_bare_repository(path: &Path) -> Result<(), GitError> {
    if tokio::fs::try_exists(path.join("HEAD")).await? {
        return Ok(());
    }
    tokio::fs::create_dir_all(path).await?;
    init_bare(path).await?;
    info!("Initialised bare repository at {:?}", path);
    Ok(())
}

/// True when a `git` binary can be run.
pub async fn available() -> bool {
    git(None, ["--version"]).await.is_ok()
}
