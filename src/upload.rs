//! Multi-step upload conversation.
//!
//! A user first sends a dependency manifest (or skips it), then any number of
//! project files, then picks which collected file is the entry point. Picking
//! the entry point installs the manifest, if any, and starts the script.

use crate::installer::DependencyInstaller;
use crate::registry::{ProcessRegistry, StartOptions, Started};
use crate::workspace::{validate_filename, UserId, WorkspaceError, WorkspaceStore};
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::interval;
use tracing::{info, warn};
use uuid::Uuid;

/// Default idle lifetime of an abandoned upload (30 minutes).
pub const UPLOAD_TTL_SECS: u64 = 1800;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("No upload in progress, start one with /upload")]
    NoSession,
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    AwaitingManifest,
    AwaitingFiles,
    AwaitingEntryPoint,
}

/// One message from the user, after any file bytes have been persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input<'a> {
    SkipManifest,
    Manifest(&'a str),
    File(&'a str),
    Done,
    EntryPoint(&'a str),
}

/// Result of feeding one input to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Input not valid here; stage unchanged.
    Reprompt,
    /// Input accepted; the session continues at `stage`.
    Continue(Stage),
    /// Entry point chosen; the session is complete.
    Ready {
        entry_point: String,
        manifest: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct UploadSession {
    pub id: Uuid,
    pub stage: Stage,
    pub manifest: Option<String>,
    pub collected_files: Vec<String>,
    pub entry_point: Option<String>,
    pub created_at: Instant,
    pub last_used: Instant,
}

impl UploadSession {
    pub fn new(now: Instant) -> Self {
        Self {
            id: Uuid::new_v4(),
            stage: Stage::AwaitingManifest,
            manifest: None,
            collected_files: Vec::new(),
            entry_point: None,
            created_at: now,
            last_used: now,
        }
    }

    pub fn is_expired(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.last_used) > ttl
    }

    /// Pure transition function.
    pub fn apply(&mut self, input: Input<'_>) -> Step {
        match (self.stage, input) {
            (Stage::AwaitingManifest, Input::SkipManifest) => {
                self.stage = Stage::AwaitingFiles;
                Step::Continue(self.stage)
            }
            (Stage::AwaitingManifest, Input::Manifest(text)) if !text.trim().is_empty() => {
                self.manifest = Some(text.to_string());
                self.stage = Stage::AwaitingFiles;
                Step::Continue(self.stage)
            }
            (Stage::AwaitingFiles, Input::File(name)) => {
                // Re-uploading a name overwrites the file; keep its first position.
                if !self.collected_files.iter().any(|f| f == name) {
                    self.collected_files.push(name.to_string());
                }
                Step::Continue(self.stage)
            }
            (Stage::AwaitingFiles, Input::Done) if !self.collected_files.is_empty() => {
                self.stage = Stage::AwaitingEntryPoint;
                Step::Continue(self.stage)
            }
            (Stage::AwaitingEntryPoint, Input::EntryPoint(name))
                if self.collected_files.iter().any(|f| f == name) =>
            {
                self.entry_point = Some(name.to_string());
                Step::Ready {
                    entry_point: name.to_string(),
                    manifest: self.manifest.clone(),
                }
            }
            _ => Step::Reprompt,
        }
    }

    pub fn prompt(&self) -> String {
        match self.stage {
            Stage::AwaitingManifest => {
                "Send your requirements (one package per line), or skip if there are none."
                    .to_string()
            }
            Stage::AwaitingFiles if self.collected_files.is_empty() => {
                "Send your project files. Upload at least one file before finishing.".to_string()
            }
            Stage::AwaitingFiles => format!(
                "Received {}. Send more files or finish with done.",
                self.collected_files.join(", ")
            ),
            Stage::AwaitingEntryPoint => format!(
                "Choose the main script to run: {}",
                self.collected_files.join(", ")
            ),
        }
    }
}

/// What the front end renders after each upload message.
#[derive(Debug, Clone, Serialize)]
pub struct UploadReply {
    pub success: bool,
    pub message: String,
    /// `None` once the session has ended.
    pub stage: Option<Stage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started: Option<Started>,
}

impl UploadReply {
    fn from_session(success: bool, session: &UploadSession, message: String) -> Self {
        Self {
            success,
            message,
            stage: Some(session.stage),
            files: session.collected_files.clone(),
            started: None,
        }
    }

    fn ended(success: bool, message: String) -> Self {
        Self {
            success,
            message,
            stage: None,
            files: Vec::new(),
            started: None,
        }
    }
}

pub type UploadSessions = Arc<RwLock<HashMap<UserId, UploadSession>>>;

/// Drives upload sessions and performs their side effects.
#[derive(Clone)]
pub struct UploadFlow {
    sessions: UploadSessions,
    workspaces: WorkspaceStore,
    installer: Arc<dyn DependencyInstaller>,
    registry: ProcessRegistry,
    ttl: Duration,
}

impl UploadFlow {
    pub fn new(
        workspaces: WorkspaceStore,
        installer: Arc<dyn DependencyInstaller>,
        registry: ProcessRegistry,
        ttl: Duration,
    ) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(HashMap::new())),
            workspaces,
            installer,
            registry,
            ttl,
        }
    }

    /// Start a fresh session, discarding any abandoned one.
    pub async fn begin(&self, user: &UserId) -> UploadReply {
        let session = UploadSession::new(Instant::now());
        let reply = UploadReply::from_session(true, &session, session.prompt());
        info!(%user, session = %session.id, "Upload started");
        if let Some(old) = self.sessions.write().await.insert(user.clone(), session) {
            info!(%user, session = %old.id, "Discarded previous upload");
        }
        reply
    }

    pub async fn submit_manifest(
        &self,
        user: &UserId,
        manifest: Option<&str>,
    ) -> Result<UploadReply, UploadError> {
        let input = match manifest {
            Some(text) => Input::Manifest(text),
            None => Input::SkipManifest,
        };
        self.advance(user, input).await
    }

    /// Persist one file right away, then record it in the session. The write
    /// happens outside the sessions lock.
    pub async fn submit_file(
        &self,
        user: &UserId,
        filename: &str,
        content: &[u8],
    ) -> Result<UploadReply, UploadError> {
        if let Some(reply) = self.reject_unless_collecting(user).await? {
            return Ok(reply);
        }
        validate_filename(filename)?;

        let bytes = content.len();
        let write = {
            let workspaces = self.workspaces.clone();
            let user = user.clone();
            let filename = filename.to_string();
            let content = content.to_vec();
            tokio::task::spawn_blocking(move || workspaces.write_script(&user, &filename, &content))
        };
        write
            .await
            .map_err(|e| WorkspaceError::Io(io::Error::other(e)))??;

        let mut sessions = self.sessions.write().await;
        let session = live_session(&mut sessions, user, self.ttl)?;
        if session.stage != Stage::AwaitingFiles {
            return Ok(UploadReply::from_session(false, session, session.prompt()));
        }
        session.apply(Input::File(filename));
        info!(%user, session = %session.id, filename, bytes, "File received");
        Ok(UploadReply::from_session(true, session, session.prompt()))
    }

    /// `Some(reply)` when the session is not accepting files.
    async fn reject_unless_collecting(
        &self,
        user: &UserId,
    ) -> Result<Option<UploadReply>, UploadError> {
        let mut sessions = self.sessions.write().await;
        let session = live_session(&mut sessions, user, self.ttl)?;
        Ok((session.stage != Stage::AwaitingFiles)
            .then(|| UploadReply::from_session(false, session, session.prompt())))
    }

    pub async fn finish_files(&self, user: &UserId) -> Result<UploadReply, UploadError> {
        self.advance(user, Input::Done).await
    }

    pub async fn cancel(&self, user: &UserId) -> Result<UploadReply, UploadError> {
        let removed = self.sessions.write().await.remove(user);
        match removed {
            Some(session) => {
                info!(%user, session = %session.id, "Upload cancelled");
                Ok(UploadReply::ended(true, "Upload cancelled.".to_string()))
            }
            None => Err(UploadError::NoSession),
        }
    }

    /// Choose the entry point, install dependencies if a manifest was given,
    /// and start the script. The session ends whatever the outcome.
    pub async fn select_entry_point(
        &self,
        user: &UserId,
        filename: &str,
    ) -> Result<UploadReply, UploadError> {
        // Take the session out so a long install never holds the map lock.
        let (session, step) = {
            let mut sessions = self.sessions.write().await;
            let session = live_session(&mut sessions, user, self.ttl)?;
            let step = session.apply(Input::EntryPoint(filename));
            if step == Step::Reprompt {
                return Ok(UploadReply::from_session(false, session, session.prompt()));
            }
            let session = sessions.remove(user).ok_or(UploadError::NoSession)?;
            (session, step)
        };
        let Step::Ready {
            entry_point,
            manifest,
        } = step
        else {
            return Ok(UploadReply::ended(false, session.prompt()));
        };

        let mut notes = Vec::new();
        if let Some(manifest) = manifest {
            let ws = self.workspaces.workspace_of(user)?;
            match self.installer.install(&ws, &manifest).await {
                Ok(_) => notes.push("Requirements installed successfully!".to_string()),
                Err(e) => {
                    warn!(%user, session = %session.id, error = %e, "Upload aborted by install failure");
                    return Ok(UploadReply::ended(false, e.to_string()));
                }
            }
        }

        match self
            .registry
            .start(user, &entry_point, StartOptions::default())
            .await
        {
            Ok(started) => {
                notes.push(format!(
                    "Script {entry_point} started successfully using {}!",
                    started.interpreter.describe()
                ));
                info!(%user, session = %session.id, entry_point = %entry_point, "Upload completed");
                Ok(UploadReply {
                    started: Some(started),
                    ..UploadReply::ended(true, notes.join(" "))
                })
            }
            Err(e) => {
                notes.push(e.to_string());
                Ok(UploadReply::ended(false, notes.join(" ")))
            }
        }
    }

    async fn advance(&self, user: &UserId, input: Input<'_>) -> Result<UploadReply, UploadError> {
        let mut sessions = self.sessions.write().await;
        let session = live_session(&mut sessions, user, self.ttl)?;
        let accepted = session.apply(input) != Step::Reprompt;
        Ok(UploadReply::from_session(accepted, session, session.prompt()))
    }

    pub async fn stage_of(&self, user: &UserId) -> Option<Stage> {
        self.sessions.read().await.get(user).map(|s| s.stage)
    }

    /// Drop sessions idle for longer than the TTL.
    pub async fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|user, s| {
            let keep = !s.is_expired(now, self.ttl);
            if !keep {
                info!(%user, session = %s.id, "Cleaning up expired upload");
            }
            keep
        });
        before - sessions.len()
    }
}

/// Fetch the user's session, evicting it first if it has expired.
fn live_session<'a>(
    sessions: &'a mut HashMap<UserId, UploadSession>,
    user: &UserId,
    ttl: Duration,
) -> Result<&'a mut UploadSession, UploadError> {
    let now = Instant::now();
    if sessions.get(user).is_some_and(|s| s.is_expired(now, ttl)) {
        sessions.remove(user);
        info!(%user, "Upload expired");
    }
    let session = sessions.get_mut(user).ok_or(UploadError::NoSession)?;
    session.last_used = now;
    Ok(session)
}

pub fn spawn_cleanup_task(flow: UploadFlow, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        loop {
            ticker.tick().await;
            flow.cleanup_expired().await;
        }
    })
}
