//! Live process registry and lifecycle controller.
//!
//! Each `(user, script)` key owns a slot guarded by its own async mutex. The
//! outer map lock is only held long enough to find or create a slot, so a
//! slow stop on one key never holds up work on another. Exited children are
//! reaped lazily whenever their slot is touched, and optionally by a
//! periodic sweep.

use crate::interpreter::{InterpreterChoice, InterpreterPreference, InterpreterResolver};
use crate::workspace::{UserId, WorkspaceError, WorkspaceStore};
use chrono::{DateTime, Local};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{interval, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StartError {
    #[error("Script {0} not found")]
    ScriptNotFound(String),
    #[error("Script {0} is already running")]
    AlreadyRunning(String),
    #[error("Error running script {script}: {source}")]
    Spawn {
        script: String,
        #[source]
        source: io::Error,
    },
    #[error("Could not replace the running instance: {0}")]
    Replace(#[source] StopError),
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
}

#[derive(Debug, Error)]
pub enum StopError {
    #[error("Script {0} not running or not found")]
    NotRunning(String),
    #[error("Error stopping script {script}: {source}")]
    KillFailed {
        script: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// Exited within the grace window after SIGTERM.
    Stopped,
    /// Still alive when the grace window elapsed; SIGKILL was sent.
    ForceKilled,
}

/// What to do when the key already has a live process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    #[default]
    Reject,
    Replace,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StartOptions {
    pub conflict: ConflictPolicy,
    pub interpreter: InterpreterPreference,
}

#[derive(Debug, Clone, Serialize)]
pub struct Started {
    pub run_id: Uuid,
    pub pid: u32,
    pub log_file: PathBuf,
    pub interpreter: InterpreterChoice,
    pub replaced: Option<StopOutcome>,
}

/// Written next to the run log as `<log stem>.meta.json`.
#[derive(Debug, Serialize)]
struct RunMetadata<'a> {
    run_id: Uuid,
    user: &'a UserId,
    script: &'a str,
    pid: u32,
    started_at: DateTime<Local>,
    log_file: &'a PathBuf,
    interpreter: &'a InterpreterChoice,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessKey {
    pub user: UserId,
    pub script: String,
}

impl ProcessKey {
    pub fn new(user: &UserId, script: &str) -> Self {
        Self {
            user: user.clone(),
            script: script.to_string(),
        }
    }
}

#[derive(Debug)]
struct ProcessRecord {
    run_id: Uuid,
    child: Child,
    pid: u32,
    log_file: PathBuf,
    started_at: DateTime<Local>,
}

type Slot = Arc<Mutex<Option<ProcessRecord>>>;

struct RegistryInner {
    slots: StdMutex<HashMap<ProcessKey, Slot>>,
    workspaces: WorkspaceStore,
    resolver: Arc<dyn InterpreterResolver>,
    grace: Duration,
}

/// Shared handle to the set of running scripts.
#[derive(Clone)]
pub struct ProcessRegistry {
    inner: Arc<RegistryInner>,
}

impl ProcessRegistry {
    pub fn new(
        workspaces: WorkspaceStore,
        resolver: Arc<dyn InterpreterResolver>,
        grace: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                slots: StdMutex::new(HashMap::new()),
                workspaces,
                resolver,
                grace,
            }),
        }
    }

    fn slots(&self) -> std::sync::MutexGuard<'_, HashMap<ProcessKey, Slot>> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, key: &ProcessKey) -> Slot {
        self.slots().entry(key.clone()).or_default().clone()
    }

    fn existing_slot(&self, key: &ProcessKey) -> Option<Slot> {
        self.slots().get(key).cloned()
    }

    fn user_slots(&self, user: &UserId) -> Vec<(ProcessKey, Slot)> {
        self.slots()
            .iter()
            .filter(|(key, _)| &key.user == user)
            .map(|(key, slot)| (key.clone(), slot.clone()))
            .collect()
    }

    /// Drop empty slots nobody else is holding.
    fn prune_idle(&self) {
        self.slots().retain(|_, slot| {
            Arc::strong_count(slot) > 1
                || slot.try_lock().map(|s| s.is_some()).unwrap_or(true)
        });
    }

    /// Start `script` from the user's scripts directory.
    pub async fn start(
        &self,
        user: &UserId,
        script: &str,
        options: StartOptions,
    ) -> Result<Started, StartError> {
        let ws = self.inner.workspaces.workspace_of(user)?;
        let script_path = ws.script_path(script)?;

        let key = ProcessKey::new(user, script);
        let slot = self.slot(&key);
        let mut guard = slot.lock().await;
        if !script_path.is_file() {
            drop(guard);
            drop(slot);
            self.prune_idle();
            return Err(StartError::ScriptNotFound(script.to_string()));
        }

        let mut replaced = None;
        if poll_live(&key, &mut guard) {
            match options.conflict {
                ConflictPolicy::Reject => {
                    return Err(StartError::AlreadyRunning(script.to_string()));
                }
                ConflictPolicy::Replace => {
                    info!(%user, script, "Replacing running instance");
                    let outcome = self
                        .terminate(&key, &mut guard)
                        .await
                        .map_err(StartError::Replace)?;
                    replaced = Some(outcome);
                }
            }
        }

        let interpreter = self.inner.resolver.resolve(&ws, options.interpreter).await;
        let started_at = Local::now();
        let (log_file, log) = ws.create_run_log(script, started_at)?;

        info!(%user, script, interpreter = %interpreter.path().display(), "Starting script");
        let spawned = match log.try_clone() {
            Ok(log_err) => Command::new(interpreter.path())
                .arg(Path::new(".").join(script))
                .current_dir(ws.scripts_dir())
                .stdin(Stdio::null())
                .stdout(Stdio::from(log))
                .stderr(Stdio::from(log_err))
                .process_group(0)
                .spawn(),
            Err(e) => Err(e),
        };

        let child = match spawned {
            Ok(child) => child,
            Err(source) => {
                error!(%user, script, error = %source, "Failed to spawn script");
                if let Err(e) = fs::remove_file(&log_file) {
                    debug!(log_file = %log_file.display(), error = %e, "Could not remove unused log");
                }
                return Err(StartError::Spawn {
                    script: script.to_string(),
                    source,
                });
            }
        };

        let Some(pid) = child.id() else {
            // Only happens if the child was already reaped, which we never do here.
            return Err(StartError::Spawn {
                script: script.to_string(),
                source: io::Error::new(io::ErrorKind::Other, "child exited before registration"),
            });
        };

        let run_id = Uuid::new_v4();
        write_metadata(&RunMetadata {
            run_id,
            user,
            script,
            pid,
            started_at,
            log_file: &log_file,
            interpreter: &interpreter,
        });

        *guard = Some(ProcessRecord {
            run_id,
            child,
            pid,
            log_file: log_file.clone(),
            started_at,
        });
        info!(%user, script, pid, log_file = %log_file.display(), "Script started");

        Ok(Started {
            run_id,
            pid,
            log_file,
            interpreter,
            replaced,
        })
    }

    /// Names of the user's scripts that are alive right now. Exited ones are
    /// evicted as a side effect.
    pub async fn list_running(&self, user: &UserId) -> Vec<String> {
        let mut running = Vec::new();
        for (key, slot) in self.user_slots(user) {
            let mut guard = slot.lock().await;
            if poll_live(&key, &mut guard) {
                running.push(key.script);
            }
        }
        self.prune_idle();
        running.sort();
        running
    }

    /// Run `f` while holding the key's slot, so no start can interleave.
    /// Returns `None` without calling `f` if the script is live.
    pub async fn when_idle<T>(
        &self,
        user: &UserId,
        script: &str,
        f: impl FnOnce() -> T,
    ) -> Option<T> {
        let key = ProcessKey::new(user, script);
        let slot = self.slot(&key);
        let result = {
            let mut guard = slot.lock().await;
            (!poll_live(&key, &mut guard)).then(f)
        };
        drop(slot);
        self.prune_idle();
        result
    }

    /// SIGTERM, wait out the grace period, then SIGKILL.
    pub async fn stop(&self, user: &UserId, script: &str) -> Result<StopOutcome, StopError> {
        let key = ProcessKey::new(user, script);
        let slot = self
            .existing_slot(&key)
            .ok_or_else(|| StopError::NotRunning(script.to_string()))?;

        let outcome = {
            let mut guard = slot.lock().await;
            if !poll_live(&key, &mut guard) {
                Err(StopError::NotRunning(script.to_string()))
            } else {
                self.terminate(&key, &mut guard).await
            }
        };
        drop(slot);
        self.prune_idle();
        outcome
    }

    async fn terminate(
        &self,
        key: &ProcessKey,
        slot: &mut Option<ProcessRecord>,
    ) -> Result<StopOutcome, StopError> {
        let Some(record) = slot.as_mut() else {
            return Err(StopError::NotRunning(key.script.clone()));
        };
        let pgid = Pid::from_raw(record.pid as i32);
        info!(user = %key.user, script = %key.script, pid = record.pid, "Stopping script");

        match killpg(pgid, Signal::SIGTERM) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(pid = record.pid, error = %e, "SIGTERM failed"),
        }

        let waited = timeout(self.inner.grace, record.child.wait()).await;
        match waited {
            Ok(Ok(status)) => {
                info!(script = %key.script, ?status, "Script stopped");
                *slot = None;
                return Ok(StopOutcome::Stopped);
            }
            Ok(Err(e)) => warn!(pid = record.pid, error = %e, "Wait after SIGTERM failed"),
            Err(_) => warn!(
                script = %key.script,
                grace = ?self.inner.grace,
                "Script ignored SIGTERM, force killing"
            ),
        }

        let kill_failed = |source: io::Error| StopError::KillFailed {
            script: key.script.clone(),
            source,
        };
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => return Err(kill_failed(e.into())),
        }
        record.child.wait().await.map_err(kill_failed)?;

        info!(script = %key.script, "Script force-killed");
        *slot = None;
        Ok(StopOutcome::ForceKilled)
    }

    /// Reap every exited process. Slots busy with another operation are
    /// skipped; they are reaped by whoever holds them.
    pub fn sweep(&self) -> usize {
        let slots: Vec<(ProcessKey, Slot)> = self
            .slots()
            .iter()
            .map(|(key, slot)| (key.clone(), slot.clone()))
            .collect();

        let mut reaped = 0;
        for (key, slot) in slots {
            let Ok(mut guard) = slot.try_lock() else {
                continue;
            };
            if guard.is_some() && !poll_live(&key, &mut guard) {
                reaped += 1;
            }
        }
        self.prune_idle();
        reaped
    }

    /// Stop everything, e.g. on shutdown.
    pub async fn stop_all(&self) {
        let slots: Vec<(ProcessKey, Slot)> = self
            .slots()
            .iter()
            .map(|(key, slot)| (key.clone(), slot.clone()))
            .collect();

        for (key, slot) in slots {
            let mut guard = slot.lock().await;
            if poll_live(&key, &mut guard) {
                if let Err(e) = self.terminate(&key, &mut guard).await {
                    error!(user = %key.user, script = %key.script, error = %e, "Failed to stop on shutdown");
                }
            }
        }
        self.prune_idle();
    }

    #[cfg(test)]
    fn tracked_keys(&self) -> usize {
        self.slots().len()
    }
}

/// Non-blocking liveness check; evicts the record if the child is gone.
fn poll_live(key: &ProcessKey, slot: &mut Option<ProcessRecord>) -> bool {
    let Some(record) = slot.as_mut() else {
        return false;
    };
    match record.child.try_wait() {
        Ok(None) => true,
        Ok(Some(status)) => {
            info!(
                user = %key.user,
                script = %key.script,
                run_id = %record.run_id,
                ?status,
                uptime_secs = (Local::now() - record.started_at).num_seconds(),
                log_file = %record.log_file.display(),
                "Script exited"
            );
            *slot = None;
            false
        }
        Err(e) => {
            warn!(user = %key.user, script = %key.script, error = %e, "Liveness check failed, evicting");
            *slot = None;
            false
        }
    }
}

fn write_metadata(meta: &RunMetadata<'_>) {
    let path = meta.log_file.with_extension("meta.json");
    let result = serde_json::to_vec_pretty(meta)
        .map_err(io::Error::from)
        .and_then(|bytes| fs::write(&path, bytes));
    if let Err(e) = result {
        warn!(path = %path.display(), error = %e, "Failed to write run metadata");
    }
}

/// Periodically reap exited processes so handles do not pile up when nobody
/// asks for status.
pub fn spawn_sweep_task(registry: ProcessRegistry, every: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(every);
        loop {
            ticker.tick().await;
            let reaped = registry.sweep();
            if reaped > 0 {
                info!(reaped, "Swept exited scripts");
            }
        }
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::interpreter::ProbingResolver;
    use std::time::Instant;
    use tempfile::TempDir;

    pub(crate) fn sh_registry(root: &Path, grace: Duration) -> ProcessRegistry {
        let resolver = ProbingResolver::new("/bin/sh", Duration::from_secs(5));
        ProcessRegistry::new(WorkspaceStore::new(root), Arc::new(resolver), grace)
    }

    fn setup(grace: Duration) -> (TempDir, WorkspaceStore, ProcessRegistry, UserId) {
        let tmp = TempDir::new().unwrap();
        let store = WorkspaceStore::new(tmp.path());
        let registry = sh_registry(tmp.path(), grace);
        (tmp, store, registry, UserId::parse("1").unwrap())
    }

    pub(crate) async fn wait_for_log(path: &Path, needle: &str) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let text = fs::read_to_string(path).unwrap_or_default();
            if text.contains(needle) {
                return;
            }
            assert!(Instant::now() < deadline, "log never contained {needle:?}: {text:?}");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    fn run_logs(store: &WorkspaceStore, user: &UserId) -> Vec<PathBuf> {
        let ws = store.workspace_of(user).unwrap();
        let mut logs: Vec<PathBuf> = fs::read_dir(ws.logs_dir())
            .unwrap()
            .map(|e| e.unwrap().path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "log"))
            .collect();
        logs.sort();
        logs
    }

    const IGNORES_TERM: &str = "trap '' TERM\necho ready\nwhile :; do sleep 1; done\n";

    #[tokio::test]
    async fn start_captures_both_streams_in_one_log() {
        let (_tmp, store, registry, user) = setup(Duration::from_secs(5));
        store
            .write_script(&user, "app.py", b"echo to-stdout\necho to-stderr >&2\npwd\n")
            .unwrap();

        let started = registry.start(&user, "app.py", StartOptions::default()).await.unwrap();
        assert!(matches!(started.interpreter, InterpreterChoice::UsingShared { fallback: false, .. }));
        wait_for_log(&started.log_file, "to-stderr").await;
        wait_for_log(&started.log_file, "scripts").await;

        let text = fs::read_to_string(&started.log_file).unwrap();
        assert!(text.contains("to-stdout"));
        assert_eq!(run_logs(&store, &user), vec![started.log_file.clone()]);

        let meta: serde_json::Value = serde_json::from_slice(
            &fs::read(started.log_file.with_extension("meta.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(meta["script"], "app.py");
        assert_eq!(meta["interpreter"]["kind"], "using_shared");
    }

    #[tokio::test]
    async fn dash_prefixed_names_run_as_files() {
        let (_tmp, store, registry, user) = setup(Duration::from_secs(5));
        store.write_script(&user, "-c", b"echo ran-as-file\n").unwrap();

        let started = registry.start(&user, "-c", StartOptions::default()).await.unwrap();
        wait_for_log(&started.log_file, "ran-as-file").await;
    }

    #[tokio::test]
    async fn missing_script_is_not_found() {
        let (_tmp, _store, registry, user) = setup(Duration::from_secs(5));
        let err = registry.start(&user, "nope.py", StartOptions::default()).await.unwrap_err();
        assert!(matches!(err, StartError::ScriptNotFound(ref s) if s == "nope.py"));
    }

    #[tokio::test]
    async fn spawn_failure_leaves_no_entry_and_no_log() {
        let tmp = TempDir::new().unwrap();
        let store = WorkspaceStore::new(tmp.path());
        let resolver = ProbingResolver::new("/nonexistent/python", Duration::from_secs(1));
        let registry =
            ProcessRegistry::new(store.clone(), Arc::new(resolver), Duration::from_secs(1));
        let user = UserId::parse("1").unwrap();
        store.write_script(&user, "app.py", b"sleep 30\n").unwrap();

        let err = registry.start(&user, "app.py", StartOptions::default()).await.unwrap_err();
        assert!(matches!(err, StartError::Spawn { .. }));
        assert!(registry.list_running(&user).await.is_empty());
        assert!(run_logs(&store, &user).is_empty());
    }

    #[tokio::test]
    async fn duplicate_start_is_rejected_by_default() {
        let (_tmp, store, registry, user) = setup(Duration::from_secs(5));
        store.write_script(&user, "app.py", b"sleep 30\n").unwrap();

        registry.start(&user, "app.py", StartOptions::default()).await.unwrap();
        let err = registry.start(&user, "app.py", StartOptions::default()).await.unwrap_err();
        assert!(matches!(err, StartError::AlreadyRunning(_)));
        assert_eq!(run_logs(&store, &user).len(), 1);

        registry.stop(&user, "app.py").await.unwrap();
    }

    #[tokio::test]
    async fn replace_policy_supersedes_the_running_instance() {
        let (_tmp, store, registry, user) = setup(Duration::from_secs(5));
        store.write_script(&user, "app.py", b"sleep 30\n").unwrap();

        let first = registry.start(&user, "app.py", StartOptions::default()).await.unwrap();
        let options = StartOptions {
            conflict: ConflictPolicy::Replace,
            ..StartOptions::default()
        };
        let second = registry.start(&user, "app.py", options).await.unwrap();

        assert_eq!(second.replaced, Some(StopOutcome::Stopped));
        assert_ne!(first.pid, second.pid);
        assert_eq!(registry.list_running(&user).await, vec!["app.py"]);
        assert_eq!(run_logs(&store, &user).len(), 2);

        registry.stop(&user, "app.py").await.unwrap();
    }

    #[tokio::test]
    async fn exited_scripts_are_never_listed() {
        let (_tmp, store, registry, user) = setup(Duration::from_secs(5));
        store.write_script(&user, "quick.py", b"echo done\n").unwrap();
        store.write_script(&user, "slow.py", b"sleep 30\n").unwrap();

        registry.start(&user, "quick.py", StartOptions::default()).await.unwrap();
        registry.start(&user, "slow.py", StartOptions::default()).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let running = registry.list_running(&user).await;
            assert!(running.contains(&"slow.py".to_string()));
            if running == vec!["slow.py"] {
                break;
            }
            assert!(Instant::now() < deadline, "quick.py never reaped");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(matches!(
            registry.stop(&user, "quick.py").await,
            Err(StopError::NotRunning(_))
        ));

        registry.stop(&user, "slow.py").await.unwrap();
    }

    #[tokio::test]
    async fn stop_twice_reports_not_running_the_second_time() {
        let (_tmp, store, registry, user) = setup(Duration::from_secs(5));
        store.write_script(&user, "app.py", b"sleep 30\n").unwrap();
        registry.start(&user, "app.py", StartOptions::default()).await.unwrap();

        assert_eq!(registry.stop(&user, "app.py").await.unwrap(), StopOutcome::Stopped);
        assert!(matches!(
            registry.stop(&user, "app.py").await,
            Err(StopError::NotRunning(_))
        ));
        assert!(registry.list_running(&user).await.is_empty());
    }

    #[tokio::test]
    async fn stop_on_never_started_script_has_no_side_effects() {
        let (_tmp, _store, registry, user) = setup(Duration::from_secs(5));
        assert!(matches!(
            registry.stop(&user, "ghost.py").await,
            Err(StopError::NotRunning(_))
        ));
        assert_eq!(registry.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn script_ignoring_sigterm_is_force_killed() {
        let (_tmp, store, registry, user) = setup(Duration::from_millis(300));
        store.write_script(&user, "stubborn.py", IGNORES_TERM.as_bytes()).unwrap();
        let started = registry
            .start(&user, "stubborn.py", StartOptions::default())
            .await
            .unwrap();
        wait_for_log(&started.log_file, "ready").await;

        assert_eq!(
            registry.stop(&user, "stubborn.py").await.unwrap(),
            StopOutcome::ForceKilled
        );
        assert!(registry.list_running(&user).await.is_empty());
        assert_eq!(registry.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn stopping_one_key_does_not_block_another() {
        let (_tmp, store, registry, user) = setup(Duration::from_secs(2));
        store.write_script(&user, "stubborn.py", IGNORES_TERM.as_bytes()).unwrap();
        store.write_script(&user, "other.py", b"sleep 30\n").unwrap();
        let started = registry
            .start(&user, "stubborn.py", StartOptions::default())
            .await
            .unwrap();
        wait_for_log(&started.log_file, "ready").await;

        let stopping = {
            let registry = registry.clone();
            let user = user.clone();
            tokio::spawn(async move { registry.stop(&user, "stubborn.py").await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let begin = Instant::now();
        registry.start(&user, "other.py", StartOptions::default()).await.unwrap();
        assert!(begin.elapsed() < Duration::from_secs(1));

        assert_eq!(stopping.await.unwrap().unwrap(), StopOutcome::ForceKilled);
        assert_eq!(registry.list_running(&user).await, vec!["other.py"]);
        registry.stop(&user, "other.py").await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_key_races_have_a_single_winner() {
        let (_tmp, store, registry, user) = setup(Duration::from_secs(5));
        store.write_script(&user, "app.py", b"sleep 30\n").unwrap();

        let starts: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                let user = user.clone();
                tokio::spawn(async move {
                    registry.start(&user, "app.py", StartOptions::default()).await
                })
            })
            .collect();
        let mut started = 0;
        for handle in starts {
            match handle.await.unwrap() {
                Ok(_) => started += 1,
                Err(e) => assert!(matches!(e, StartError::AlreadyRunning(_)), "{e}"),
            }
        }
        assert_eq!(started, 1);
        assert_eq!(run_logs(&store, &user).len(), 1);

        let stops: Vec<_> = (0..4)
            .map(|_| {
                let registry = registry.clone();
                let user = user.clone();
                tokio::spawn(async move { registry.stop(&user, "app.py").await })
            })
            .collect();
        let listing = {
            let registry = registry.clone();
            let user = user.clone();
            tokio::spawn(async move { registry.list_running(&user).await })
        };
        let mut stopped = 0;
        for handle in stops {
            match handle.await.unwrap() {
                Ok(outcome) => {
                    assert_eq!(outcome, StopOutcome::Stopped);
                    stopped += 1;
                }
                Err(e) => assert!(matches!(e, StopError::NotRunning(_)), "{e}"),
            }
        }
        listing.await.unwrap();
        assert_eq!(stopped, 1);
        assert!(registry.list_running(&user).await.is_empty());
        assert_eq!(registry.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn when_idle_skips_live_scripts() {
        let (_tmp, store, registry, user) = setup(Duration::from_secs(5));
        store.write_script(&user, "app.py", b"sleep 30\n").unwrap();
        registry.start(&user, "app.py", StartOptions::default()).await.unwrap();

        let deleted = registry
            .when_idle(&user, "app.py", || store.delete_script(&user, "app.py"))
            .await;
        assert!(deleted.is_none());
        assert_eq!(store.list_scripts(&user).unwrap(), vec!["app.py"]);

        registry.stop(&user, "app.py").await.unwrap();
        let deleted = registry
            .when_idle(&user, "app.py", || store.delete_script(&user, "app.py"))
            .await;
        assert!(matches!(deleted, Some(Ok(()))));
        assert_eq!(registry.tracked_keys(), 0);
        assert!(matches!(
            registry.start(&user, "app.py", StartOptions::default()).await,
            Err(StartError::ScriptNotFound(_))
        ));
    }

    #[tokio::test]
    async fn users_only_see_their_own_scripts() {
        let (_tmp, store, registry, alice) = setup(Duration::from_secs(5));
        let bob = UserId::parse("2").unwrap();
        store.write_script(&alice, "app.py", b"sleep 30\n").unwrap();
        store.write_script(&bob, "app.py", b"sleep 30\n").unwrap();

        let a = registry.start(&alice, "app.py", StartOptions::default()).await.unwrap();
        let b = registry.start(&bob, "app.py", StartOptions::default()).await.unwrap();
        assert_ne!(a.log_file, b.log_file);

        registry.stop(&alice, "app.py").await.unwrap();
        assert!(registry.list_running(&alice).await.is_empty());
        assert_eq!(registry.list_running(&bob).await, vec!["app.py"]);
        registry.stop_all().await;
        assert!(registry.list_running(&bob).await.is_empty());
    }

    #[tokio::test]
    async fn sweep_reaps_without_a_status_query() {
        let (_tmp, store, registry, user) = setup(Duration::from_secs(5));
        store.write_script(&user, "quick.py", b"exit 0\n").unwrap();
        registry.start(&user, "quick.py", StartOptions::default()).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while registry.sweep() == 0 {
            assert!(Instant::now() < deadline, "sweep never reaped");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(registry.tracked_keys(), 0);
    }
}
