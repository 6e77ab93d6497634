use backon::{ConstantBuilder, Retryable};
use nix::unistd::{AccessFlags, Gid, Uid, access};
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{DATA_DIR_GID, DATA_DIR_UID};
use crate::error::{EntrypointError, IsRetryable};
use crate::types::DataDirState;

/// Entries a freshly formatted volume may carry before the engine wrote anything.
const IGNORED_ENTRIES: &[&str] = &["lost+found"];

/// Decide first boot vs. later boot from the directory contents alone.
pub fn inspect(dir: &Path) -> Result<DataDirState, EntrypointError> {
    let entries = std::fs::read_dir(dir).map_err(|e| EntrypointError::DataDir {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    })?;

    for entry in entries {
        let name = entry?.file_name();
        if IGNORED_ENTRIES.iter().any(|ignored| name == *ignored) {
            continue;
        }
        debug!(path = %dir.display(), entry = ?name, "data directory is populated");
        return Ok(DataDirState::Populated);
    }
    Ok(DataDirState::Empty)
}

/// Fail before the engine starts if it could not write its files.
pub fn ensure_usable(dir: &Path) -> Result<(), EntrypointError> {
    let meta = std::fs::metadata(dir).map_err(|e| EntrypointError::DataDir {
        path: dir.to_path_buf(),
        reason: e.to_string(),
    })?;
    if !meta.is_dir() {
        return Err(EntrypointError::DataDir {
            path: dir.to_path_buf(),
            reason: "not a directory".to_string(),
        });
    }
    access(dir, AccessFlags::W_OK | AccessFlags::X_OK).map_err(|e| EntrypointError::DataDir {
        path: dir.to_path_buf(),
        reason: format!("not writable by uid {}: {e}", Uid::current()),
    })?;

    let (uid, gid) = (meta.uid(), meta.gid());
    if (uid, gid) == (DATA_DIR_UID, DATA_DIR_GID) {
        info!(path = %dir.display(), uid, gid, "data directory ownership ok");
    } else {
        warn!(
            path = %dir.display(),
            uid,
            gid,
            expected_uid = DATA_DIR_UID,
            expected_gid = DATA_DIR_GID,
            "data directory ownership differs from the image default"
        );
    }
    if Uid::current().as_raw() != DATA_DIR_UID {
        info!(
            uid = Uid::current().as_raw(),
            gid = Gid::current().as_raw(),
            "running as a non-default user; ownership is left untouched"
        );
    }
    Ok(())
}

/// A cleanly stopped engine removes or truncates its lock file. Poll until
/// that is visible, so the next instance never races the previous one.
pub async fn await_lock_release(
    lock: &Path,
    attempts: usize,
    interval: Duration,
) -> Result<(), EntrypointError> {
    let policy = ConstantBuilder::default()
        .with_delay(interval)
        .with_max_times(attempts.max(1) - 1);

    (move || async move { check_lock(lock).await })
        .retry(policy)
        .when(|e: &EntrypointError| e.is_retryable())
        .notify(|_, dur: Duration| {
            debug!(lock = %lock.display(), "lock file still held, retrying in {:?}", dur);
        })
        .await
}

async fn check_lock(lock: &Path) -> Result<(), EntrypointError> {
    match tokio::fs::metadata(lock).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
        Ok(meta) if meta.len() == 0 => Ok(()),
        Ok(_) => Err(EntrypointError::LockHeld(lock.to_path_buf())),
    }
}
