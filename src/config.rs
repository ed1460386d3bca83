//! Runtime configuration, from flags or `SCRIPTHOST_*` environment variables.

use crate::upload::UPLOAD_TTL_SECS;
use crate::workspace::UserId;
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_VENV_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_INSTALL_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_PROBE_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_STOP_GRACE_SECS: u64 = 10;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_LOG_TAIL_BYTES: u64 = 64 * 1024;

#[derive(Args, Debug, Clone)]
pub struct Config {
    /// Directory holding every user's workspace
    #[arg(long, env = "SCRIPTHOST_ROOT", default_value = "user_data")]
    pub root: PathBuf,

    /// Shared interpreter, also used to create virtual environments
    #[arg(long, env = "SCRIPTHOST_PYTHON", default_value = "python3")]
    pub python: PathBuf,

    /// Comma-separated user ids allowed to use the service (empty allows all)
    #[arg(long, env = "SCRIPTHOST_ALLOWED_USERS", value_delimiter = ',')]
    pub allowed_users: Vec<String>,

    /// Time limit for creating a virtual environment
    #[arg(long, env = "SCRIPTHOST_VENV_TIMEOUT_SECS", default_value_t = DEFAULT_VENV_TIMEOUT_SECS)]
    pub venv_timeout_secs: u64,

    /// Time limit for installing requirements
    #[arg(long, env = "SCRIPTHOST_INSTALL_TIMEOUT_SECS", default_value_t = DEFAULT_INSTALL_TIMEOUT_SECS)]
    pub install_timeout_secs: u64,

    /// Time limit for checking that an environment interpreter runs
    #[arg(long, env = "SCRIPTHOST_PROBE_TIMEOUT_SECS", default_value_t = DEFAULT_PROBE_TIMEOUT_SECS)]
    pub probe_timeout_secs: u64,

    /// How long a stopped script gets to exit before it is killed
    #[arg(long, env = "SCRIPTHOST_STOP_GRACE_SECS", default_value_t = DEFAULT_STOP_GRACE_SECS)]
    pub stop_grace_secs: u64,

    /// Idle lifetime of an unfinished upload
    #[arg(long, env = "SCRIPTHOST_UPLOAD_TTL_SECS", default_value_t = UPLOAD_TTL_SECS)]
    pub upload_ttl_secs: u64,

    /// Interval of the background reaper (0 disables it)
    #[arg(long, env = "SCRIPTHOST_SWEEP_INTERVAL_SECS", default_value_t = DEFAULT_SWEEP_INTERVAL_SECS)]
    pub sweep_interval_secs: u64,

    /// Maximum bytes of a log returned per request
    #[arg(long, env = "SCRIPTHOST_LOG_TAIL_BYTES", default_value_t = DEFAULT_LOG_TAIL_BYTES)]
    pub log_tail_bytes: u64,
}

impl Config {
    /// Defaults rooted at `root`.
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            python: PathBuf::from("python3"),
            allowed_users: Vec::new(),
            venv_timeout_secs: DEFAULT_VENV_TIMEOUT_SECS,
            install_timeout_secs: DEFAULT_INSTALL_TIMEOUT_SECS,
            probe_timeout_secs: DEFAULT_PROBE_TIMEOUT_SECS,
            stop_grace_secs: DEFAULT_STOP_GRACE_SECS,
            upload_ttl_secs: UPLOAD_TTL_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            log_tail_bytes: DEFAULT_LOG_TAIL_BYTES,
        }
    }

    pub fn is_allowed(&self, user: &UserId) -> bool {
        self.allowed_users.is_empty() || self.allowed_users.iter().any(|u| u == user.as_str())
    }

    pub fn venv_timeout(&self) -> Duration {
        Duration::from_secs(self.venv_timeout_secs)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn upload_ttl(&self) -> Duration {
        Duration::from_secs(self.upload_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}
