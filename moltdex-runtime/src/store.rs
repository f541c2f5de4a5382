//! Snapshot Store
//!
//! Owns the data directory. The published snapshot is `current.json`;
//! it only ever changes by renaming a fully written, fsynced temp file
//! over it, so readers see either the old document or the new one. The
//! directory is fsynced after each rename so the new name survives a
//! power loss. Temp files are named `.moltdex-*.tmp`; any left by an
//! interrupted publish are removed by the next [`SnapshotStore::stage`].
//!
//! ```text
//! data/
//!   current.json
//!   history/snapshot-20260131T120000Z-3fa2c91b.json
//! ```

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info, warn};

use moltdex_core::{BuildError, Snapshot};

pub const CURRENT_FILE: &str = "current.json";
pub const HISTORY_DIR: &str = "history";
pub const TEMP_PREFIX: &str = ".moltdex-";
pub const TEMP_SUFFIX: &str = ".tmp";

/// Store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to encode snapshot: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Snapshot {path} does not decode: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Snapshot {path} is inconsistent: {source}")]
    Invalid {
        path: PathBuf,
        #[source]
        source: BuildError,
    },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// File name of a snapshot's history copy
pub fn history_file_name(snapshot: &Snapshot) -> Result<String, StoreError> {
    let fingerprint = snapshot.fingerprint().map_err(StoreError::Encode)?;
    Ok(format!(
        "snapshot-{}-{}.json",
        snapshot.generated_at.format("%Y%m%dT%H%M%SZ"),
        &fingerprint[..8]
    ))
}

/// Directory-backed snapshot store
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
    keep_history: bool,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            keep_history: true,
        }
    }

    pub fn with_history(mut self, keep_history: bool) -> Self {
        self.keep_history = keep_history;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn current_path(&self) -> PathBuf {
        self.dir.join(CURRENT_FILE)
    }

    pub fn history_dir(&self) -> PathBuf {
        self.dir.join(HISTORY_DIR)
    }

    /// Load the published snapshot, or `None` before the first publish
    pub fn load_current(&self) -> Result<Option<Snapshot>, StoreError> {
        let path = self.current_path();
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(&path)(e)),
        };

        let snapshot = Snapshot::from_bytes(&bytes).map_err(|source| StoreError::Decode {
            path: path.clone(),
            source,
        })?;
        snapshot
            .verify()
            .map_err(|source| StoreError::Invalid { path, source })?;

        debug!(
            posts = snapshot.posts.len(),
            agents = snapshot.agents.len(),
            "Loaded current snapshot"
        );
        Ok(Some(snapshot))
    }

    /// Published history copies, oldest first
    pub fn history(&self) -> Result<Vec<PathBuf>, StoreError> {
        let dir = self.history_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&dir)(e)),
        };

        let mut files = Vec::new();
        for entry in entries {
            let path = entry.map_err(io_error(&dir))?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Write `snapshot` to temp files next to its destinations.
    ///
    /// Nothing is visible until [`StagedSnapshot::commit`].
    pub fn stage(&self, snapshot: &Snapshot) -> Result<StagedSnapshot, StoreError> {
        snapshot.verify().map_err(|source| StoreError::Invalid {
            path: self.current_path(),
            source,
        })?;
        let bytes = snapshot.to_bytes().map_err(StoreError::Encode)?;

        // One writer at a time, so anything matching the temp pattern is stale
        fs::create_dir_all(&self.dir).map_err(io_error(&self.dir))?;
        sweep_temp_files(&self.dir)?;
        let current = write_temp(&self.dir, &bytes)?;

        let history = if self.keep_history {
            let dir = self.history_dir();
            fs::create_dir_all(&dir).map_err(io_error(&dir))?;
            sweep_temp_files(&dir)?;
            let target = dir.join(history_file_name(snapshot)?);
            Some((write_temp(&dir, &bytes)?, target))
        } else {
            None
        };

        Ok(StagedSnapshot {
            current,
            target: self.current_path(),
            history,
        })
    }

    /// Stage and commit in one step
    pub fn publish(&self, snapshot: &Snapshot) -> Result<PathBuf, StoreError> {
        self.stage(snapshot)?.commit()
    }
}

fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX))
}

/// Delete temp files an interrupted publish left in `dir`
fn sweep_temp_files(dir: &Path) -> Result<usize, StoreError> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(io_error(dir)(e)),
    };

    let mut removed = 0;
    for entry in entries {
        let path = entry.map_err(io_error(dir))?.path();
        if !is_temp_file(&path) {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(io_error(&path)(e)),
        }
    }

    if removed > 0 {
        warn!(dir = %dir.display(), removed, "Removed temp files from an interrupted publish");
    }
    Ok(removed)
}

fn write_temp(dir: &Path, bytes: &[u8]) -> Result<NamedTempFile, StoreError> {
    let mut temp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .suffix(TEMP_SUFFIX)
        .tempfile_in(dir)
        .map_err(io_error(dir))?;
    temp.write_all(bytes).map_err(io_error(temp.path()))?;
    temp.as_file().sync_all().map_err(io_error(temp.path()))?;
    Ok(temp)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), StoreError> {
    fs::File::open(dir)
        .and_then(|handle| handle.sync_all())
        .map_err(io_error(dir))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), StoreError> {
    Ok(())
}

fn persist(temp: NamedTempFile, target: &Path) -> Result<(), StoreError> {
    temp.persist(target)
        .map_err(|e| io_error(target)(e.error))?;
    let dir = target
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    sync_dir(dir)
}

/// A fully written snapshot waiting to be renamed into place.
///
/// Dropping it deletes the temp files and leaves the store untouched.
#[derive(Debug)]
pub struct StagedSnapshot {
    current: NamedTempFile,
    target: PathBuf,
    history: Option<(NamedTempFile, PathBuf)>,
}

impl StagedSnapshot {
    pub fn temp_path(&self) -> &Path {
        self.current.path()
    }

    /// Rename into place; returns the published path
    pub fn commit(self) -> Result<PathBuf, StoreError> {
        if let Some((temp, target)) = self.history {
            persist(temp, &target)?;
            debug!(path = %target.display(), "Wrote history copy");
        }
        persist(self.current, &self.target)?;
        info!(path = %self.target.display(), "Published snapshot");
        Ok(self.target)
    }
}
