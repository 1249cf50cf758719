use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, broadcast};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::error::{CommandError, ConcurrencyConflict};
use crate::host_backend::{CommandSpec, HostBackend, SystemdUnitName};
use crate::preflight::{self, PreflightReport};
use crate::version::ReleaseTag;

pub const FETCH_TIMEOUT: Duration = Duration::from_secs(60);
pub const DIFF_TIMEOUT: Duration = Duration::from_secs(10);
pub const CHECKOUT_TIMEOUT: Duration = Duration::from_secs(30);
pub const INSTALL_TIMEOUT: Duration = Duration::from_secs(120);
pub const RESTART_TIMEOUT: Duration = Duration::from_secs(15);

const STATUS_CHANNEL_CAPACITY: usize = 32;
const RUN_ID_LEN: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateState {
    Idle,
    Updating,
    Restarting,
    Error,
}

/// Last observed state of the update pipeline. Every transition replaces the
/// whole record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct OperationStatus {
    pub state: UpdateState,
    pub message: String,
    pub error: Option<String>,
    /// `None` until the first transition.
    pub timestamp: Option<DateTime<Utc>>,
    pub run_id: Option<String>,
}

impl Default for OperationStatus {
    fn default() -> Self {
        Self {
            state: UpdateState::Idle,
            message: String::new(),
            error: None,
            timestamp: None,
            run_id: None,
        }
    }
}

/// Where the deployment lives and what the pipeline touches.
#[derive(Clone, Debug)]
pub struct UpdateSettings {
    pub service_unit: SystemdUnitName,
    /// Dependency manifest, relative to the working copy.
    pub manifest: String,
    pub venv_dir: PathBuf,
}

impl UpdateSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            service_unit: config.service_unit.clone(),
            manifest: config.manifest.clone(),
            venv_dir: config.venv_dir.clone(),
        }
    }

    /// Resolved against `workdir` unless `venv_dir` is absolute.
    fn venv_pip(&self, workdir: &Path) -> PathBuf {
        workdir.join(&self.venv_dir).join("bin").join("pip")
    }
}

/// Held by the task running a pipeline; dropping it frees the orchestrator
/// for the next request.
struct UpdateLockGuard {
    _permit: OwnedMutexGuard<()>,
    run_id: String,
}

impl Drop for UpdateLockGuard {
    fn drop(&mut self) {
        debug!("update lock released run_id={}", self.run_id);
    }
}

/// Moves the working copy to a release tag and restarts the service, one run
/// at a time.
pub struct UpdateOrchestrator {
    backend: Arc<dyn HostBackend>,
    clock: Arc<dyn Clock>,
    settings: UpdateSettings,
    update_lock: Arc<Mutex<()>>,
    status: RwLock<OperationStatus>,
    transitions: broadcast::Sender<OperationStatus>,
}

impl UpdateOrchestrator {
    pub fn new(backend: Arc<dyn HostBackend>, clock: Arc<dyn Clock>, settings: UpdateSettings) -> Self {
        let (transitions, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            backend,
            clock,
            settings,
            update_lock: Arc::new(Mutex::new(())),
            status: RwLock::new(OperationStatus::default()),
            transitions,
        }
    }

    pub fn status(&self) -> OperationStatus {
        match self.status.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Every status transition from now on. Slow receivers may observe
    /// `RecvError::Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<OperationStatus> {
        self.transitions.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        self.update_lock.try_lock().is_err()
    }

    /// Resolves once no run holds the update lock.
    pub async fn wait_idle(&self) {
        let _idle = self.update_lock.lock().await;
    }

    pub async fn is_git_repo(&self) -> bool {
        preflight::is_git_repo(self.backend.as_ref()).await
    }

    pub async fn preflight_check(&self) -> PreflightReport {
        preflight::run(self.backend.as_ref(), &self.settings).await
    }

    /// Start a run towards `tag` in the background. `false` means another run
    /// holds the lock; the request is dropped, not queued.
    pub fn update_to_tag(self: &Arc<Self>, tag: &ReleaseTag) -> bool {
        self.try_update_to_tag(tag).is_ok()
    }

    /// Like [`UpdateOrchestrator::update_to_tag`], but hands back the task so
    /// a foreground caller can wait for the outcome.
    pub fn try_update_to_tag(
        self: &Arc<Self>,
        tag: &ReleaseTag,
    ) -> Result<JoinHandle<()>, ConcurrencyConflict> {
        let permit = match Arc::clone(&self.update_lock).try_lock_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("update rejected tag={tag} reason=in-progress");
                return Err(ConcurrencyConflict);
            }
        };
        let run_id = nanoid::nanoid!(RUN_ID_LEN);
        info!("update accepted tag={tag} run_id={run_id}");

        let guard = UpdateLockGuard {
            _permit: permit,
            run_id: run_id.clone(),
        };
        let orchestrator = Arc::clone(self);
        let tag = tag.clone();
        Ok(tokio::spawn(async move {
            orchestrator.run_guarded(guard, tag, run_id).await;
        }))
    }

    async fn run_guarded(self: Arc<Self>, guard: UpdateLockGuard, tag: ReleaseTag, run_id: String) {
        let worker = Arc::clone(&self);
        let worker_tag = tag.clone();
        let worker_run = run_id.clone();
        let outcome =
            tokio::spawn(async move { worker.run_pipeline(&worker_tag, &worker_run).await }).await;

        let (state, message, error) = match outcome {
            Ok(Ok(())) => {
                info!("update finished tag={tag} run_id={run_id}");
                (UpdateState::Idle, format!("Updated to {tag}"), None)
            }
            Ok(Err(err)) => {
                error!("update failed tag={tag} run_id={run_id} code={} err={err}", err.code());
                (
                    UpdateState::Error,
                    format!("Update to {tag} failed: {err}"),
                    Some(err.to_string()),
                )
            }
            Err(join_err) => {
                error!("update aborted tag={tag} run_id={run_id} err={join_err}");
                (
                    UpdateState::Error,
                    format!("Update to {tag} aborted"),
                    Some(join_err.to_string()),
                )
            }
        };
        self.publish(state, message, error, &run_id, Some(guard));
    }

    async fn run_pipeline(&self, tag: &ReleaseTag, run_id: &str) -> Result<(), CommandError> {
        self.set_status(UpdateState::Updating, "Fetching tags...", None, run_id);
        let fetch = CommandSpec::new("git", FETCH_TIMEOUT).args(["fetch", "--tags", "--force"]);
        self.run_step(&fetch).await?;

        self.set_status(UpdateState::Updating, "Checking dependency manifest...", None, run_id);
        let manifest_changed = self.manifest_changed(tag).await;

        self.set_status(UpdateState::Updating, format!("Checking out {tag}..."), None, run_id);
        let checkout = CommandSpec::new("git", CHECKOUT_TIMEOUT).args(["checkout", "-f", tag.as_str()]);
        self.run_step(&checkout).await?;

        if manifest_changed {
            self.set_status(UpdateState::Updating, "Installing updated dependencies...", None, run_id);
            let pip = self.settings.venv_pip(self.backend.workdir());
            let install = CommandSpec::new(pip.to_string_lossy(), INSTALL_TIMEOUT)
                .args(["install", "-r", self.settings.manifest.as_str()]);
            self.run_step(&install).await?;
        }

        self.set_status(
            UpdateState::Restarting,
            format!("Restarting service after update to {tag}..."),
            None,
            run_id,
        );
        let restart = CommandSpec::new("sudo", RESTART_TIMEOUT).args([
            "systemctl",
            "restart",
            self.settings.service_unit.as_str(),
        ]);
        self.run_step(&restart).await
    }

    async fn run_step(&self, spec: &CommandSpec) -> Result<(), CommandError> {
        debug!("update step start cmd={}", spec.display());
        self.backend.exec(spec).await?.into_checked(spec)?;
        debug!("update step ok cmd={}", spec.display());
        Ok(())
    }

    /// A failed check counts as changed.
    async fn manifest_changed(&self, tag: &ReleaseTag) -> bool {
        let manifest = self.settings.manifest.as_str();
        let spec = CommandSpec::new("git", DIFF_TIMEOUT).args([
            "diff",
            "--name-only",
            "HEAD",
            tag.as_str(),
            "--",
            manifest,
        ]);
        match self.backend.exec(&spec).await {
            Ok(result) if result.success() => {
                let changed = result.stdout.lines().any(|line| line.trim() == manifest);
                debug!("manifest diff tag={tag} changed={changed}");
                changed
            }
            Ok(result) => {
                warn!(
                    "manifest diff failed tag={tag} exit={:?} detail={}",
                    result.exit,
                    result.diagnostic()
                );
                true
            }
            Err(err) => {
                warn!("manifest diff failed tag={tag} kind={} err={err}", err.kind());
                true
            }
        }
    }

    fn set_status(
        &self,
        state: UpdateState,
        message: impl Into<String>,
        error: Option<String>,
        run_id: &str,
    ) {
        self.publish(state, message.into(), error, run_id, None);
    }

    /// Writes and broadcasts one transition. A terminal transition hands in
    /// the lock guard, which is released before any reader can see the new
    /// state.
    fn publish(
        &self,
        state: UpdateState,
        message: String,
        error: Option<String>,
        run_id: &str,
        lock: Option<UpdateLockGuard>,
    ) {
        let status = OperationStatus {
            state,
            message,
            error,
            timestamp: Some(self.clock.now()),
            run_id: Some(run_id.to_string()),
        };
        let mut slot = match self.status.write() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = status.clone();
        drop(lock);
        // No subscribers is fine.
        let _ = self.transitions.send(status);
    }
}
