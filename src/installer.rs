//! Dependency environment provisioning.

use crate::workspace::UserWorkspace;
use async_trait::async_trait;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("Failed to create virtual environment: {stderr}")]
    Provision { stderr: String },
    #[error("Creating the virtual environment timed out after {0:?}, please retry")]
    ProvisionTimedOut(Duration),
    #[error("Failed to install requirements: {stderr}")]
    Failed { stderr: String },
    #[error("Installation timed out after {0:?}")]
    TimedOut(Duration),
    #[error("Could not run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// What a successful install did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    /// True when this call created the environment.
    pub provisioned: bool,
    pub manifest_path: PathBuf,
}

#[async_trait]
pub trait DependencyInstaller: Send + Sync {
    async fn install(
        &self,
        ws: &UserWorkspace,
        manifest: &str,
    ) -> Result<InstallReport, InstallError>;
}

/// Provisions `env/` with `<python> -m venv` and installs through its pip.
#[derive(Debug, Clone)]
pub struct VenvInstaller {
    pub python: PathBuf,
    pub provision_timeout: Duration,
    pub install_timeout: Duration,
}

impl VenvInstaller {
    pub fn new(python: impl Into<PathBuf>) -> Self {
        Self {
            python: python.into(),
            provision_timeout: Duration::from_secs(300),
            install_timeout: Duration::from_secs(600),
        }
    }

    async fn provision(&self, ws: &UserWorkspace) -> Result<(), InstallError> {
        let env_dir = ws.env_dir();
        info!(user = %ws.user, env = %env_dir.display(), "Creating virtual environment");

        let mut cmd = Command::new(&self.python);
        cmd.arg("-m").arg("venv").arg(&env_dir);
        let output = run_captured(&mut cmd, self.provision_timeout)
            .await
            .map_err(|source| InstallError::Spawn {
                program: self.python.display().to_string(),
                source,
            })?;

        match output {
            None => {
                warn!(user = %ws.user, "Virtual environment creation timed out");
                Err(InstallError::ProvisionTimedOut(self.provision_timeout))
            }
            Some(out) if !out.status.success() => {
                let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
                error!(user = %ws.user, %stderr, "Failed to create virtual environment");
                Err(InstallError::Provision { stderr })
            }
            Some(_) => Ok(()),
        }
    }
}

#[async_trait]
impl DependencyInstaller for VenvInstaller {
    async fn install(
        &self,
        ws: &UserWorkspace,
        manifest: &str,
    ) -> Result<InstallReport, InstallError> {
        info!(user = %ws.user, "Installing requirements");

        // `env/` without pip is a partial venv; `venv` completes it in place.
        let pip = pip_path(&ws.env_dir());
        let provisioned = !pip.is_file();
        if provisioned {
            self.provision(ws).await?;
        }

        let manifest_path = ws.manifest_path();
        fs::write(&manifest_path, manifest)?;

        let mut cmd = Command::new(&pip);
        cmd.arg("install").arg("-r").arg(&manifest_path);
        let output = run_captured(&mut cmd, self.install_timeout)
            .await
            .map_err(|source| InstallError::Spawn {
                program: pip.display().to_string(),
                source,
            })?;

        match output {
            None => {
                warn!(user = %ws.user, "Requirements installation timed out");
                Err(InstallError::TimedOut(self.install_timeout))
            }
            Some(out) if !out.status.success() => {
                let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
                error!(user = %ws.user, %stderr, "Failed to install requirements");
                Err(InstallError::Failed { stderr })
            }
            Some(_) => {
                info!(user = %ws.user, "Requirements installed successfully");
                Ok(InstallReport {
                    provisioned,
                    manifest_path,
                })
            }
        }
    }
}

fn pip_path(env_dir: &Path) -> PathBuf {
    env_dir.join("bin").join("pip")
}

/// Run to completion with captured output. `Ok(None)` means the limit
/// elapsed; the child is killed when its handle is dropped.
async fn run_captured(cmd: &mut Command, limit: Duration) -> io::Result<Option<Output>> {
    let child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;
    match timeout(limit, child.wait_with_output()).await {
        Ok(out) => out.map(Some),
        Err(_) => Ok(None),
    }
}

/// Delete a user's environment. Returns whether one existed.
pub fn remove_environment(ws: &UserWorkspace) -> io::Result<bool> {
    match fs::remove_dir_all(ws.env_dir()) {
        Ok(()) => {
            info!(user = %ws.user, "Removed virtual environment");
            Ok(true)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::workspace::{UserId, WorkspaceStore};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    pub(crate) fn write_executable(path: &Path, body: &str) {
        fs::write(path, body).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
    }

    /// A stand-in for `python -m venv DIR` that lays down a pip script.
    fn fake_python(dir: &Path, pip_body: &str) -> PathBuf {
        let path = dir.join("fake-python");
        let body = format!(
            "#!/bin/sh\n\
             echo call >> \"$3.calls\"\n\
             mkdir -p \"$3/bin\"\n\
             cat > \"$3/bin/pip\" <<'PIP'\n{pip_body}\nPIP\n\
             chmod +x \"$3/bin/pip\"\n"
        );
        write_executable(&path, &body);
        path
    }

    fn setup() -> (TempDir, UserWorkspace) {
        let tmp = TempDir::new().unwrap();
        let store = WorkspaceStore::new(tmp.path().join("data"));
        let ws = store.workspace_of(&UserId::parse("42").unwrap()).unwrap();
        (tmp, ws)
    }

    fn installer(python: PathBuf) -> VenvInstaller {
        VenvInstaller {
            python,
            provision_timeout: Duration::from_secs(10),
            install_timeout: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn provisions_once_and_persists_manifest() {
        let (tmp, ws) = setup();
        let python = fake_python(tmp.path(), "#!/bin/sh\nexit 0");
        let installer = installer(python);

        let first = installer.install(&ws, "requests==2.31\n").await.unwrap();
        assert!(first.provisioned);
        assert_eq!(fs::read_to_string(ws.manifest_path()).unwrap(), "requests==2.31\n");

        let second = installer.install(&ws, "flask\n").await.unwrap();
        assert!(!second.provisioned);
        assert_eq!(fs::read_to_string(ws.manifest_path()).unwrap(), "flask\n");

        let calls = fs::read_to_string(format!("{}.calls", ws.env_dir().display())).unwrap();
        assert_eq!(calls.lines().count(), 1);
    }

    #[tokio::test]
    async fn pip_failure_surfaces_stderr_and_keeps_env() {
        let (tmp, ws) = setup();
        let python = fake_python(
            tmp.path(),
            "#!/bin/sh\necho 'ERROR: No matching distribution found for nope==0' >&2\nexit 1",
        );

        let err = installer(python).install(&ws, "nope==0\n").await.unwrap_err();
        match err {
            InstallError::Failed { stderr } => {
                assert!(stderr.contains("No matching distribution"), "{stderr}")
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(ws.has_env());
    }

    #[tokio::test]
    async fn provision_failure_is_reported() {
        let (tmp, ws) = setup();
        let python = tmp.path().join("broken-python");
        write_executable(&python, "#!/bin/sh\necho 'No module named venv' >&2\nexit 1\n");

        let err = installer(python).install(&ws, "x\n").await.unwrap_err();
        assert!(matches!(err, InstallError::Provision { ref stderr } if stderr.contains("venv")));
        assert!(!ws.manifest_path().exists());
    }

    #[tokio::test]
    async fn provision_timeout_leaves_partial_env() {
        let (tmp, ws) = setup();
        let python = tmp.path().join("slow-python");
        write_executable(&python, "#!/bin/sh\nmkdir -p \"$3\"\nsleep 5\n");
        let installer = VenvInstaller {
            provision_timeout: Duration::from_millis(500),
            ..installer(python)
        };

        let err = installer.install(&ws, "x\n").await.unwrap_err();
        assert!(matches!(err, InstallError::ProvisionTimedOut(_)));
        assert!(ws.has_env());
    }

    #[tokio::test]
    async fn retry_after_provision_timeout_repairs_the_env() {
        let (tmp, ws) = setup();
        let slow = tmp.path().join("slow-python");
        write_executable(&slow, "#!/bin/sh\nmkdir -p \"$3\"\nsleep 5\n");
        let hanging = VenvInstaller {
            provision_timeout: Duration::from_millis(300),
            ..installer(slow)
        };
        let err = hanging.install(&ws, "x\n").await.unwrap_err();
        assert!(matches!(err, InstallError::ProvisionTimedOut(_)));

        let working = installer(fake_python(tmp.path(), "#!/bin/sh\nexit 0"));
        let report = working.install(&ws, "x\n").await.unwrap();
        assert!(report.provisioned);
        assert!(ws.env_dir().join("bin").join("pip").is_file());
    }

    #[tokio::test]
    async fn install_timeout_is_reported() {
        let (tmp, ws) = setup();
        let python = fake_python(tmp.path(), "#!/bin/sh\nsleep 5");
        let installer = VenvInstaller {
            install_timeout: Duration::from_millis(300),
            ..installer(python)
        };

        let err = installer.install(&ws, "x\n").await.unwrap_err();
        assert!(matches!(err, InstallError::TimedOut(_)));
    }

    #[test]
    fn remove_environment_is_explicit_and_idempotent() {
        let (_tmp, ws) = setup();
        fs::create_dir_all(ws.env_dir().join("bin")).unwrap();
        assert!(remove_environment(&ws).unwrap());
        assert!(!remove_environment(&ws).unwrap());
    }
}
