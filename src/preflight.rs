use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

use crate::host_backend::{CommandSpec, HostBackend, HostBackendError};
use crate::orchestrator::UpdateSettings;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

pub const ISSUE_GIT_MISSING: &str = "git is not installed";
pub const ISSUE_GIT_UNVERIFIED: &str = "Cannot verify git installation";
pub const ISSUE_NOT_A_REPO: &str = "Not a git repository";
pub const ISSUE_VENV_MISSING: &str = "Virtual environment (venv) not found";
pub const ISSUE_SUDO_NOT_CONFIGURED: &str = "sudo systemctl not configured (passwordless)";
pub const ISSUE_SUDO_UNAVAILABLE: &str = "Cannot run sudo systemctl";
pub const ISSUE_DIRTY_TREE: &str = "Uncommitted changes in working tree will be discarded";

/// Outcome of the pre-update diagnostics. `blocked` is set when a check that
/// makes an update impossible failed; the remaining issues are warnings.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PreflightReport {
    pub ok: bool,
    pub issues: Vec<String>,
    pub blocked: bool,
}

impl PreflightReport {
    fn blocker(message: &str) -> Self {
        Self {
            ok: false,
            issues: vec![message.to_string()],
            blocked: true,
        }
    }

    fn from_warnings(issues: Vec<String>) -> Self {
        Self {
            ok: issues.is_empty(),
            issues,
            blocked: false,
        }
    }
}

pub async fn is_git_repo(backend: &dyn HostBackend) -> bool {
    let spec = CommandSpec::new("git", PROBE_TIMEOUT).args(["rev-parse", "--is-inside-work-tree"]);
    matches!(backend.exec(&spec).await, Ok(result) if result.success())
}

/// Ordered checks; the first two stop at the first failure.
pub async fn run(backend: &dyn HostBackend, settings: &UpdateSettings) -> PreflightReport {
    let version = CommandSpec::new("git", PROBE_TIMEOUT).arg("--version");
    match backend.exec(&version).await {
        Ok(_) => {}
        Err(HostBackendError::NotFound { .. }) => {
            info!("preflight blocked reason=git-missing");
            return PreflightReport::blocker(ISSUE_GIT_MISSING);
        }
        Err(err) => {
            info!("preflight blocked reason=git-unverified kind={} err={err}", err.kind());
            return PreflightReport::blocker(ISSUE_GIT_UNVERIFIED);
        }
    }

    if !is_git_repo(backend).await {
        info!("preflight blocked reason=not-a-repo");
        return PreflightReport::blocker(ISSUE_NOT_A_REPO);
    }

    let mut issues = Vec::new();

    if !backend.is_dir(&settings.venv_dir).await {
        issues.push(ISSUE_VENV_MISSING.to_string());
    }

    if let Some(issue) = probe_restart_capability(backend, settings).await {
        issues.push(issue);
    }

    let status = CommandSpec::new("git", PROBE_TIMEOUT).args(["status", "--porcelain"]);
    match backend.exec(&status).await {
        Ok(result) if result.success() && !result.stdout.is_empty() => {
            issues.push(ISSUE_DIRTY_TREE.to_string());
        }
        Ok(_) => {}
        Err(err) => debug!("preflight dirty-tree probe skipped err={err}"),
    }

    info!("preflight finished issues={}", issues.len());
    PreflightReport::from_warnings(issues)
}

/// `systemctl is-active` exits 0 for active and 3 for inactive units; either
/// means sudo let the call through without asking for a password.
async fn probe_restart_capability(
    backend: &dyn HostBackend,
    settings: &UpdateSettings,
) -> Option<String> {
    let spec = CommandSpec::new("sudo", PROBE_TIMEOUT).args([
        "-n",
        "systemctl",
        "is-active",
        "--quiet",
        settings.service_unit.as_str(),
    ]);
    match backend.exec(&spec).await {
        Ok(result) if matches!(result.exit, Some(0) | Some(3)) => None,
        Ok(result) if result.stderr.contains("sudo") => Some(ISSUE_SUDO_NOT_CONFIGURED.to_string()),
        Ok(result) => Some(match result.exit {
            Some(code) => format!("Cannot verify restart capability (exit {code})"),
            None => "Cannot verify restart capability".to_string(),
        }),
        Err(HostBackendError::InvalidInput { reason, .. }) => {
            Some(format!("Cannot verify restart capability ({reason})"))
        }
        Err(_) => Some(ISSUE_SUDO_UNAVAILABLE.to_string()),
    }
}
