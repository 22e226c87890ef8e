//! GitHub webhook handling.
//!
//! A push or pull request event resolves a workflow for the event's sender,
//! submits it to the task backend with the event's details in the `GITHUB_*`
//! environment, opens a check against the head revision and watches the run
//! until it completes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use policy_engine::{PolicyEngineRequest, RequestContext, RunStatus, Workflow};
use serde::{Deserialize, Serialize};

use crate::backend::TaskBackend;
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::github::{CheckHandle, CheckReporter, CheckTarget};
use crate::result_ext::ResultExt;

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub login: String,
    #[serde(default)]
    pub id: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Repository {
    pub name: String,
    pub full_name: String,
    pub owner: Account,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequestHead {
    pub sha: String,
    #[serde(rename = "ref", default)]
    pub git_ref: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PullRequest {
    #[serde(default)]
    pub number: u64,
    pub head: PullRequestHead,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeadCommit {
    pub id: String,
}

/// The subset of push and pull_request payloads the service reads.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub action: Option<String>,
    pub repository: Repository,
    pub sender: Account,
    #[serde(default)]
    pub pull_request: Option<PullRequest>,
    #[serde(rename = "ref", default)]
    pub git_ref: Option<String>,
    #[serde(default)]
    pub after: Option<String>,
    #[serde(default)]
    pub head_commit: Option<HeadCommit>,
}

impl WebhookPayload {
    /// Revision the run reports against.
    pub fn head_sha(&self) -> Option<&str> {
        self.pull_request
            .as_ref()
            .map(|pr| pr.head.sha.as_str())
            .or(self.after.as_deref())
            .or(self.head_commit.as_ref().map(|commit| commit.id.as_str()))
    }

    fn git_ref(&self) -> Option<String> {
        match &self.pull_request {
            Some(pr) => Some(format!("refs/heads/{}", pr.head.git_ref)),
            None => self.git_ref.clone(),
        }
    }
}

/// Supported trigger, parsed from `X-GitHub-Event` plus the payload action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEvent {
    Push,
    PullRequest,
}

impl WebhookEvent {
    /// `None` for events and pull request actions that do not trigger runs.
    pub fn from_header(event: &str, action: Option<&str>) -> Option<Self> {
        match (event, action) {
            ("push", _) => Some(WebhookEvent::Push),
            ("pull_request", Some("opened" | "synchronize")) => Some(WebhookEvent::PullRequest),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookEvent::Push => "push",
            WebhookEvent::PullRequest => "pull_request",
        }
    }
}

/// Result of handling a delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Pong,
    Ignored { reason: String },
    Submitted { task_id: String },
}

/// Chooses the workflow to run for an event.
#[async_trait]
pub trait WorkflowResolver: Send + Sync {
    /// `None` when nothing is configured for this event.
    async fn resolve(&self, payload: &WebhookPayload) -> AppResult<Option<Workflow>>;
}

/// Reads `<dir>/<sender-login>.yml`, falling back to `<dir>/default.yml`.
pub struct FileWorkflowResolver {
    dir: PathBuf,
}

impl FileWorkflowResolver {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn load(path: &Path) -> AppResult<Option<Workflow>> {
        match tokio::fs::read_to_string(path).await {
            Ok(text) => Workflow::from_yaml_str(&text)
                .map(Some)
                .map_err(|e| AppError::Config(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Internal(format!("{}: {e}", path.display()))),
        }
    }
}

/// Keep only characters valid in a GitHub login so the sender cannot
/// address files outside the workflows directory.
fn sanitize_login(login: &str) -> String {
    login
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect()
}

#[async_trait]
impl WorkflowResolver for FileWorkflowResolver {
    async fn resolve(&self, payload: &WebhookPayload) -> AppResult<Option<Workflow>> {
        let login = sanitize_login(&payload.sender.login);
        if !login.is_empty() {
            if let Some(workflow) = Self::load(&self.dir.join(format!("{login}.yml"))).await? {
                tracing::debug!(sender = %login, "Using sender workflow");
                return Ok(Some(workflow));
            }
        }
        Self::load(&self.dir.join("default.yml")).await
    }
}

/// Drives webhook-triggered runs.
#[derive(Clone)]
pub struct WebhookService {
    backend: Arc<dyn TaskBackend>,
    reporter: Arc<dyn CheckReporter>,
    resolver: Arc<dyn WorkflowResolver>,
    config: Arc<AppConfig>,
    poll_interval: Duration,
}

impl WebhookService {
    pub fn new(
        backend: Arc<dyn TaskBackend>,
        reporter: Arc<dyn CheckReporter>,
        resolver: Arc<dyn WorkflowResolver>,
        config: Arc<AppConfig>,
    ) -> Self {
        let poll_interval = config.status_poll_interval();
        Self {
            backend,
            reporter,
            resolver,
            config,
            poll_interval,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Handle one delivery. Check reporting and status watching continue in
    /// the background after this returns.
    pub async fn handle(&self, event: &str, payload: WebhookPayload) -> AppResult<WebhookOutcome> {
        let Some(kind) = WebhookEvent::from_header(event, payload.action.as_deref()) else {
            return Ok(WebhookOutcome::Ignored {
                reason: format!(
                    "unsupported event {event}{}",
                    payload.action.as_deref().map(|a| format!(" ({a})")).unwrap_or_default()
                ),
            });
        };

        let Some(head_sha) = payload.head_sha().map(str::to_string) else {
            return Err(AppError::BadRequest("event has no head revision".to_string()));
        };

        let Some(workflow) = self.resolver.resolve(&payload).await? else {
            tracing::info!(sender = %payload.sender.login, "No workflow configured for sender");
            return Ok(WebhookOutcome::Ignored {
                reason: "no workflow configured".to_string(),
            });
        };

        let request = self.build_request(kind, &payload, &head_sha, workflow);
        let submitted = self.backend.submit(request).await?;
        let task_id = submitted
            .id()
            .map(str::to_string)
            .ok_or_else(|| AppError::Internal("backend returned no task id".to_string()))?;

        tracing::info!(
            task_id = %task_id,
            event = kind.as_str(),
            repo = %payload.repository.full_name,
            sha = %head_sha,
            "Submitted webhook run"
        );

        let target = CheckTarget {
            owner: payload.repository.owner.login.clone(),
            repo: payload.repository.name.clone(),
            head_sha,
        };
        if let Ok(handle) = self.reporter.start(&target, &task_id).await.log("starting check") {
            let service = self.clone();
            let watched_id = task_id.clone();
            tokio::spawn(async move {
                service.watch_run(&target, &handle, &watched_id).await;
            });
        }

        Ok(WebhookOutcome::Submitted { task_id })
    }

    fn build_request(
        &self,
        kind: WebhookEvent,
        payload: &WebhookPayload,
        head_sha: &str,
        workflow: Workflow,
    ) -> PolicyEngineRequest {
        let prefix = &self.config.env_prefix;
        let mut env = BTreeMap::new();
        let mut set = |key: &str, value: String| {
            env.insert(format!("{prefix}{key}"), value);
        };
        set("EVENT_NAME", kind.as_str().to_string());
        set("REPOSITORY", payload.repository.full_name.clone());
        set("REPOSITORY_OWNER", payload.repository.owner.login.clone());
        set("ACTOR", payload.sender.login.clone());
        set("ACTOR_ID", payload.sender.id.to_string());
        set("SHA", head_sha.to_string());
        set("SERVER_URL", self.config.archive_base_url.clone());
        set("API_URL", self.config.github_api_url.clone());
        if let Some(git_ref) = payload.git_ref() {
            set("REF", git_ref);
        }

        let mut secrets = BTreeMap::new();
        if let Some(token) = &self.config.github_token {
            secrets.insert("GITHUB_TOKEN".to_string(), token.clone());
        }

        PolicyEngineRequest::new(workflow).with_context(RequestContext::new(env, secrets))
    }

    /// Poll the backend until the run is terminal or attempts run out, then
    /// report completion. A run that never finishes is reported as failed.
    pub async fn watch_run(&self, target: &CheckTarget, handle: &CheckHandle, task_id: &str) -> RunStatus {
        let mut last = RunStatus::unknown(task_id);
        for _ in 0..self.config.status_poll_max_attempts {
            tokio::time::sleep(self.poll_interval).await;
            match self.backend.status(task_id).await.log("polling webhook run") {
                Ok(status) if status.is_terminal() => {
                    last = status;
                    break;
                }
                Ok(status) => last = status,
                Err(_) => continue,
            }
        }

        if !last.is_terminal() {
            tracing::warn!(task_id = %task_id, last_status = last.kind(), "Gave up waiting for run");
            last = RunStatus::failed(task_id, "Timed out waiting for the run to complete", "");
        }

        let _ = self
            .reporter
            .finish(target, handle, &last)
            .await
            .log("reporting run completion");
        last
    }
}
