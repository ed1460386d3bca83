//! Per-user workspace layout on disk.
//!
//! Every user owns `<root>/<user_id>/` with a flat `scripts` directory, a
//! `logs` directory holding one file per run, an optional `env` directory
//! created by the installer, and the last submitted dependency manifest.

use chrono::{DateTime, Local};
use serde::Serialize;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use thiserror::Error;

const SCRIPTS_DIR: &str = "scripts";
const LOGS_DIR: &str = "logs";
const ENV_DIR: &str = "env";
const MANIFEST_FILE: &str = "requirements.manifest";

/// Upper bound on same-second suffixes tried when naming a run log.
const MAX_LOG_SUFFIX: u32 = 10_000;

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("invalid user id: {0:?}")]
    InvalidUserId(String),
    #[error("invalid file name: {0:?}")]
    InvalidFilename(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Opaque user identifier, guaranteed to be a single safe path component.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct UserId(String);

impl UserId {
    pub fn parse(raw: &str) -> Result<Self, WorkspaceError> {
        if is_single_component(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(WorkspaceError::InvalidUserId(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rejects anything that could escape the scripts directory.
pub fn validate_filename(name: &str) -> Result<&str, WorkspaceError> {
    if is_single_component(name) {
        Ok(name)
    } else {
        Err(WorkspaceError::InvalidFilename(name.to_string()))
    }
}

fn is_single_component(s: &str) -> bool {
    !s.is_empty()
        && s != "."
        && s != ".."
        && !s.contains(['/', '\\', '\0'])
}

/// Resolved directories for one user.
#[derive(Debug, Clone)]
pub struct UserWorkspace {
    pub user: UserId,
    pub root: PathBuf,
}

impl UserWorkspace {
    pub fn scripts_dir(&self) -> PathBuf {
        self.root.join(SCRIPTS_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join(LOGS_DIR)
    }

    pub fn env_dir(&self) -> PathBuf {
        self.root.join(ENV_DIR)
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    pub fn script_path(&self, name: &str) -> Result<PathBuf, WorkspaceError> {
        Ok(self.scripts_dir().join(validate_filename(name)?))
    }

    pub fn has_env(&self) -> bool {
        self.env_dir().is_dir()
    }

    /// Create a fresh log file for one run of `script`.
    ///
    /// Names follow `<script>_<YYYYMMDD_HHMMSS>.log`; a second run inside the
    /// same second gets `_1`, `_2`, ... appended before the extension.
    pub fn create_run_log(
        &self,
        script: &str,
        now: DateTime<Local>,
    ) -> Result<(PathBuf, File), WorkspaceError> {
        let script = validate_filename(script)?;
        let stamp = now.format("%Y%m%d_%H%M%S");
        let logs_dir = self.logs_dir();
        fs::create_dir_all(&logs_dir)?;

        for n in 0..MAX_LOG_SUFFIX {
            let name = if n == 0 {
                format!("{script}_{stamp}.log")
            } else {
                format!("{script}_{stamp}_{n}.log")
            };
            let path = logs_dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("no free log name for {script} at {stamp}"),
        )
        .into())
    }

    /// Most recent run log for `script`, if it ever ran.
    pub fn latest_log(&self, script: &str) -> Result<Option<PathBuf>, WorkspaceError> {
        let script = validate_filename(script)?;
        let entries = match fs::read_dir(self.logs_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut best: Option<((String, u32), PathBuf)> = None;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(order) = run_log_order(name, script) else {
                continue;
            };
            if best.as_ref().map_or(true, |(b, _)| order > *b) {
                best = Some((order, entry.path()));
            }
        }
        Ok(best.map(|(_, path)| path))
    }
}

/// Sort key for a run log name belonging to `script`, or `None` if the name
/// is some other script's log.
fn run_log_order(name: &str, script: &str) -> Option<(String, u32)> {
    let rest = name.strip_prefix(script)?.strip_prefix('_')?;
    let rest = rest.strip_suffix(".log")?;
    let (stamp, suffix) = match rest.get(15..) {
        Some("") => (rest, 0),
        Some(tail) => (&rest[..15], tail.strip_prefix('_')?.parse().ok()?),
        None => return None,
    };
    let bytes = stamp.as_bytes();
    let well_formed = bytes.len() == 15
        && bytes[8] == b'_'
        && bytes
            .iter()
            .enumerate()
            .all(|(i, b)| i == 8 || b.is_ascii_digit());
    well_formed.then(|| (stamp.to_string(), suffix))
}

/// Read at most the last `max_bytes` of a log file.
pub fn read_log_tail(path: &Path, max_bytes: u64) -> io::Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    file.seek(SeekFrom::Start(len.saturating_sub(max_bytes)))?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Resolves and lazily creates per-user workspaces under one root.
#[derive(Debug, Clone)]
pub struct WorkspaceStore {
    root: PathBuf,
}

impl WorkspaceStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a user's workspace, creating `scripts` and `logs` if absent.
    pub fn workspace_of(&self, user: &UserId) -> Result<UserWorkspace, WorkspaceError> {
        let ws = UserWorkspace {
            user: user.clone(),
            root: self.root.join(user.as_str()),
        };
        fs::create_dir_all(ws.scripts_dir())?;
        fs::create_dir_all(ws.logs_dir())?;
        Ok(ws)
    }

    /// Write (or overwrite) one file in the user's scripts directory.
    pub fn write_script(
        &self,
        user: &UserId,
        filename: &str,
        content: &[u8],
    ) -> Result<PathBuf, WorkspaceError> {
        let path = self.workspace_of(user)?.script_path(filename)?;
        fs::write(&path, content)?;
        Ok(path)
    }

    pub fn list_scripts(&self, user: &UserId) -> Result<Vec<String>, WorkspaceError> {
        let ws = self.workspace_of(user)?;
        let mut names = Vec::new();
        for entry in fs::read_dir(ws.scripts_dir())? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    pub fn delete_script(&self, user: &UserId, filename: &str) -> Result<(), WorkspaceError> {
        let path = self.workspace_of(user)?.script_path(filename)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(WorkspaceError::NotFound(filename.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
