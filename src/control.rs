use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::error::ConcurrencyConflict;
use crate::host_backend::HostBackend;
use crate::orchestrator::{OperationStatus, UpdateOrchestrator};
use crate::poller::VersionPoller;
use crate::version::{self, DescribedVersion, ReleaseTag};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Status,
    Check,
    Apply,
    Rollback,
    Preflight,
}

#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    pub action: ControlAction,
    #[serde(default)]
    pub tag: Option<String>,
}

/// HTTP-shaped answer: a status code, its reason phrase and a JSON body.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ControlResponse {
    pub status: u16,
    pub reason: &'static str,
    pub body: Value,
}

impl ControlResponse {
    fn ok(body: Value) -> Self {
        Self {
            status: 200,
            reason: "OK",
            body,
        }
    }

    fn accepted(body: Value) -> Self {
        Self {
            status: 202,
            reason: "Accepted",
            body,
        }
    }

    fn bad_request(error: impl Into<String>, code: &str) -> Self {
        Self {
            status: 400,
            reason: "BadRequest",
            body: json!({ "error": error.into(), "code": code }),
        }
    }

    fn conflict(error: impl Into<String>) -> Self {
        Self {
            status: 409,
            reason: "Conflict",
            body: json!({ "error": error.into(), "code": "in-progress" }),
        }
    }

    fn internal(error: impl Into<String>) -> Self {
        Self {
            status: 500,
            reason: "InternalServerError",
            body: json!({ "error": error.into() }),
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct StatusView {
    pub current_version: String,
    pub described: Option<DescribedVersion>,
    pub latest_tag: Option<String>,
    pub available_tags: Vec<String>,
    pub update_available: bool,
    pub last_checked: Option<DateTime<Utc>>,
    pub operation: OperationStatus,
    pub update_in_progress: bool,
    pub is_git_repo: bool,
}

/// The caller-facing surface over one poller and one orchestrator.
pub struct Controller {
    poller: Arc<VersionPoller>,
    orchestrator: Arc<UpdateOrchestrator>,
    backend: Arc<dyn HostBackend>,
}

impl Controller {
    pub fn new(
        poller: Arc<VersionPoller>,
        orchestrator: Arc<UpdateOrchestrator>,
        backend: Arc<dyn HostBackend>,
    ) -> Self {
        Self {
            poller,
            orchestrator,
            backend,
        }
    }

    /// Cached poll result merged with the live operation status. Without a
    /// snapshot the current version is read from the working copy.
    pub async fn status(&self) -> StatusView {
        let snapshot = self.poller.data();
        let current_version = match &snapshot {
            Some(data) => data.current_version.clone(),
            None => version::current_version(self.backend.as_ref()).await,
        };
        let is_git_repo = self.orchestrator.is_git_repo().await;
        let (latest_tag, available_tags, update_available, last_checked) = match snapshot {
            Some(data) => (
                data.latest_tag,
                data.available_tags,
                data.update_available,
                Some(data.last_checked),
            ),
            None => (None, Vec::new(), false, None),
        };

        StatusView {
            described: DescribedVersion::parse(&current_version),
            current_version,
            latest_tag,
            available_tags,
            update_available,
            last_checked,
            operation: self.orchestrator.status(),
            update_in_progress: self.orchestrator.is_busy(),
            is_git_repo,
        }
    }

    pub fn check_now(&self) -> ControlResponse {
        self.poller.force_check();
        ControlResponse::accepted(json!({ "message": "accepted" }))
    }

    pub fn apply(&self, tag: Option<&str>) -> ControlResponse {
        self.start_update("apply", tag)
    }

    pub fn rollback(&self, tag: Option<&str>) -> ControlResponse {
        self.start_update("rollback", tag)
    }

    pub async fn preflight(&self) -> ControlResponse {
        let report = self.orchestrator.preflight_check().await;
        match serde_json::to_value(&report) {
            Ok(body) => ControlResponse::ok(body),
            Err(err) => ControlResponse::internal(err.to_string()),
        }
    }

    pub async fn handle(&self, request: ControlRequest) -> ControlResponse {
        match request.action {
            ControlAction::Status => match serde_json::to_value(self.status().await) {
                Ok(body) => ControlResponse::ok(body),
                Err(err) => ControlResponse::internal(err.to_string()),
            },
            ControlAction::Check => self.check_now(),
            ControlAction::Apply => self.apply(request.tag.as_deref()),
            ControlAction::Rollback => self.rollback(request.tag.as_deref()),
            ControlAction::Preflight => self.preflight().await,
        }
    }

    pub async fn handle_line(&self, line: &str) -> ControlResponse {
        match serde_json::from_str::<ControlRequest>(line) {
            Ok(request) => self.handle(request).await,
            Err(err) => ControlResponse::bad_request(format!("invalid json: {err}"), "invalid-request"),
        }
    }

    /// Answer one JSON request per input line with one JSON response line,
    /// until end of input. Blank lines are ignored.
    pub async fn serve<R, W>(&self, reader: R, mut writer: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let response = self.handle_line(line).await;
            debug!("control response status={}", response.status);
            let mut encoded = serde_json::to_vec(&response).map_err(std::io::Error::other)?;
            encoded.push(b'\n');
            writer.write_all(&encoded).await?;
            writer.flush().await?;
        }
        Ok(())
    }

    fn start_update(&self, action: &str, raw_tag: Option<&str>) -> ControlResponse {
        let tag = match ReleaseTag::parse(raw_tag.unwrap_or_default()) {
            Ok(tag) => tag,
            Err(err) => {
                warn!("{action} rejected code={} err={err}", err.code());
                return ControlResponse::bad_request(err.to_string(), err.code());
            }
        };
        if !self.orchestrator.update_to_tag(&tag) {
            return ControlResponse::conflict(ConcurrencyConflict.to_string());
        }
        info!("{action} started tag={tag}");
        ControlResponse::accepted(json!({
            "message": format!("Update to {tag} started"),
            "tag": tag,
        }))
    }
}
