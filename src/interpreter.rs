//! Choosing which interpreter runs a script.

use crate::workspace::UserWorkspace;
use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Candidates inside `env/`, tried in order.
const ENV_CANDIDATES: [&str; 2] = ["bin/python3", "bin/python"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InterpreterPreference {
    /// Use the provisioned environment when it passes the probe.
    #[default]
    Auto,
    /// Explicitly skip the environment and use the shared interpreter.
    Shared,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InterpreterChoice {
    UsingProvisioned { path: PathBuf },
    UsingShared {
        path: PathBuf,
        fallback: bool,
        /// `env/` exists but none of its interpreters passed the probe.
        env_unusable: bool,
    },
}

impl InterpreterChoice {
    pub fn path(&self) -> &Path {
        match self {
            Self::UsingProvisioned { path } | Self::UsingShared { path, .. } => path,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::UsingProvisioned { .. } => "your virtual environment".to_string(),
            Self::UsingShared { fallback: true, .. } => {
                "the shared interpreter (environment skipped)".to_string()
            }
            Self::UsingShared {
                env_unusable: true, ..
            } => "the shared interpreter (your environment is not usable)".to_string(),
            Self::UsingShared { .. } => "the shared interpreter".to_string(),
        }
    }
}

#[async_trait]
pub trait InterpreterResolver: Send + Sync {
    async fn resolve(
        &self,
        ws: &UserWorkspace,
        preference: InterpreterPreference,
    ) -> InterpreterChoice;
}

/// Trusts an environment interpreter only after it runs successfully.
#[derive(Debug, Clone)]
pub struct ProbingResolver {
    pub shared: PathBuf,
    pub probe_timeout: Duration,
}

impl ProbingResolver {
    pub fn new(shared: impl Into<PathBuf>, probe_timeout: Duration) -> Self {
        Self {
            shared: shared.into(),
            probe_timeout,
        }
    }

    async fn probe(&self, candidate: &Path) -> bool {
        let child = Command::new(candidate)
            .arg("-c")
            .arg("import sys")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        let mut child = match child {
            Ok(child) => child,
            Err(e) => {
                debug!(candidate = %candidate.display(), error = %e, "Probe failed to spawn");
                return false;
            }
        };
        match timeout(self.probe_timeout, child.wait()).await {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                debug!(candidate = %candidate.display(), error = %e, "Probe wait failed");
                false
            }
            Err(_) => {
                warn!(candidate = %candidate.display(), "Probe timed out");
                false
            }
        }
    }
}

#[async_trait]
impl InterpreterResolver for ProbingResolver {
    async fn resolve(
        &self,
        ws: &UserWorkspace,
        preference: InterpreterPreference,
    ) -> InterpreterChoice {
        if preference == InterpreterPreference::Shared {
            info!(user = %ws.user, "Environment skipped on request, using shared interpreter");
            return InterpreterChoice::UsingShared {
                path: self.shared.clone(),
                fallback: true,
                env_unusable: false,
            };
        }

        let env_dir = ws.env_dir();
        let has_env = env_dir.is_dir();
        if has_env {
            for rel in ENV_CANDIDATES {
                let candidate = env_dir.join(rel);
                if candidate.is_file() && self.probe(&candidate).await {
                    return InterpreterChoice::UsingProvisioned { path: candidate };
                }
            }
            warn!(user = %ws.user, "Environment present but no runnable interpreter, using shared");
        }

        InterpreterChoice::UsingShared {
            path: self.shared.clone(),
            fallback: false,
            env_unusable: has_env,
        }
    }
}
