//! Ownership of environment roots.
//!
//! A directory belongs to secbench once it carries [`MARKER_FILE`]. While an
//! environment is active its runner holds an exclusive `flock` on the marker,
//! so a second runner (in this process or another one) cannot adopt the root
//! and tear it down underneath the first.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::Environment;
use crate::error::RunnerError;

/// File written into every root secbench provisions.
pub const MARKER_FILE: &str = ".secbench-env";

/// Contents of [`MARKER_FILE`].
#[derive(Debug, Serialize, Deserialize)]
struct EnvironmentMarker {
    id: String,
    name: String,
    created_at: DateTime<Utc>,
    #[serde(default)]
    venv: bool,
}

/// State of the root before setup touched it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RootOrigin {
    /// The path did not exist.
    Created,
    /// An empty directory.
    Empty,
    /// A directory provisioned earlier, recognised by its marker.
    Adopted,
}

/// A root locked for one setup attempt.
///
/// Either hand it to [`RootLocks::hold`] once the environment is active, or
/// call [`RootClaim::rollback`] to undo what the attempt created.
pub(crate) struct RootClaim {
    root: PathBuf,
    origin: RootOrigin,
    lock: Flock<File>,
}

impl RootClaim {
    /// Applies the setup policy to `root` and locks its marker.
    ///
    /// # Errors
    ///
    /// `RunnerError::Provisioning` for a non-directory or an unmanaged,
    /// non-empty directory (left untouched), and `RunnerError::RootInUse`
    /// when another active environment holds the marker lock.
    pub(crate) async fn claim(root: &Path) -> Result<Self, RunnerError> {
        let origin = match tokio::fs::metadata(root).await {
            Ok(meta) if !meta.is_dir() => {
                return Err(provisioning_error(root, "path exists and is not a directory"));
            }
            Ok(_) => {
                if is_file(&root.join(MARKER_FILE)).await {
                    RootOrigin::Adopted
                } else if dir_is_empty(root).await? {
                    RootOrigin::Empty
                } else {
                    return Err(provisioning_error(
                        root,
                        "directory exists and is not a managed environment",
                    ));
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RootOrigin::Created,
            Err(e) => {
                return Err(provisioning_error(root, format!("cannot inspect path: {}", e)));
            }
        };

        if origin == RootOrigin::Created {
            tokio::fs::create_dir_all(root)
                .await
                .map_err(|e| provisioning_error(root, format!("failed to create directory: {}", e)))?;
        }

        let file = tokio::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(root.join(MARKER_FILE))
            .await
            .map_err(|e| provisioning_error(root, format!("failed to open marker: {}", e)))?
            .into_std()
            .await;

        let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => lock,
            Err((_, errno)) if errno == Errno::EWOULDBLOCK => {
                return Err(RunnerError::RootInUse(root.to_path_buf()));
            }
            Err((_, errno)) => {
                return Err(provisioning_error(root, format!("failed to lock marker: {}", errno)));
            }
        };

        if origin == RootOrigin::Adopted {
            info!("Reusing provisioned environment at {}", root.display());
        }
        debug!("Claimed {} ({:?})", root.display(), origin);
        Ok(Self {
            root: root.to_path_buf(),
            origin,
            lock,
        })
    }

    pub(crate) fn root(&self) -> &Path {
        &self.root
    }

    #[cfg(test)]
    pub(crate) fn origin(&self) -> RootOrigin {
        self.origin
    }

    /// Records `environment` in the marker of a freshly provisioned root.
    ///
    /// Adopted roots keep the marker they already have.
    pub(crate) async fn write_marker(
        &self,
        environment: &Environment,
        venv: bool,
    ) -> Result<(), RunnerError> {
        if self.origin == RootOrigin::Adopted {
            return Ok(());
        }
        let marker = EnvironmentMarker {
            id: environment.id().to_string(),
            name: environment.name().to_string(),
            created_at: Utc::now(),
            venv,
        };
        let json = serde_json::to_string_pretty(&marker)
            .map_err(|e| provisioning_error(&self.root, format!("failed to encode marker: {}", e)))?;
        tokio::fs::write(self.root.join(MARKER_FILE), json)
            .await
            .map_err(|e| provisioning_error(&self.root, format!("failed to write marker: {}", e)))
    }

    /// Removes everything this setup attempt created, then unlocks.
    ///
    /// A created root is deleted, an empty one is emptied again, and an
    /// adopted one is left as it was.
    pub(crate) async fn rollback(self) {
        let result = match self.origin {
            RootOrigin::Created => tokio::fs::remove_dir_all(&self.root).await,
            RootOrigin::Empty => clear_dir(&self.root).await,
            RootOrigin::Adopted => Ok(()),
        };
        if let Err(e) = result {
            warn!(
                "Failed to roll back partial environment {}: {}",
                self.root.display(),
                e
            );
        }
    }
}

/// Marker locks for the roots a runner has active.
#[derive(Default)]
pub(crate) struct RootLocks {
    held: Mutex<HashMap<PathBuf, Flock<File>>>,
}

impl RootLocks {
    /// Keeps the claim's lock until [`RootLocks::release`].
    pub(crate) fn hold(&self, claim: RootClaim) {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(claim.root, claim.lock);
    }

    pub(crate) fn release(&self, root: &Path) {
        self.held
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(root);
    }
}

pub(crate) async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_file())
        .unwrap_or(false)
}

async fn dir_is_empty(path: &Path) -> Result<bool, RunnerError> {
    let mut entries = tokio::fs::read_dir(path)
        .await
        .map_err(|e| provisioning_error(path, format!("cannot read directory: {}", e)))?;
    let first = entries
        .next_entry()
        .await
        .map_err(|e| provisioning_error(path, format!("cannot read directory: {}", e)))?;
    Ok(first.is_none())
}

async fn clear_dir(path: &Path) -> std::io::Result<()> {
    let mut entries = tokio::fs::read_dir(path).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            tokio::fs::remove_dir_all(entry.path()).await?;
        } else {
            tokio::fs::remove_file(entry.path()).await?;
        }
    }
    Ok(())
}

pub(crate) fn provisioning_error(path: &Path, reason: impl Into<String>) -> RunnerError {
    RunnerError::Provisioning {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}
