//! GitHub check-run and commit-status reporting for webhook-triggered runs.

use std::time::Duration;

use async_trait::async_trait;
use policy_engine::status::ExitStatus;
use policy_engine::{Annotation, RunStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::{AppConfig, ReportMode};
use crate::error::{AppError, AppResult};

/// The GitHub API caps annotations per check-run update.
const MAX_ANNOTATIONS: usize = 50;

/// Commit status descriptions longer than this are rejected.
const MAX_DESCRIPTION: usize = 140;

/// Revision a run reports against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckTarget {
    pub owner: String,
    pub repo: String,
    pub head_sha: String,
}

/// Handle returned when reporting starts, needed to report completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckHandle {
    CheckRun(u64),
    CommitStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Conclusion {
    Success,
    Failure,
}

/// Outcome of a finished run as seen by the check.
///
/// A run that never completed (unknown id, poll timeout, rejected input) is
/// a failure. A successful run still fails when `fail_on_error_annotations`
/// is set and it produced error annotations.
pub fn conclusion(status: &RunStatus, fail_on_error_annotations: bool) -> Conclusion {
    match status {
        RunStatus::Complete(detail) => {
            if detail.exit_status == ExitStatus::Failure
                || (fail_on_error_annotations && detail.annotations.has_errors())
            {
                Conclusion::Failure
            } else {
                Conclusion::Success
            }
        }
        _ => Conclusion::Failure,
    }
}

/// Reports run progress to source control.
#[async_trait]
pub trait CheckReporter: Send + Sync {
    /// Mark the revision as in progress.
    async fn start(&self, target: &CheckTarget, task_id: &str) -> AppResult<CheckHandle>;

    /// Mark the revision as completed with the run's final status.
    async fn finish(
        &self,
        target: &CheckTarget,
        handle: &CheckHandle,
        status: &RunStatus,
    ) -> AppResult<()>;
}

#[derive(Debug, Deserialize)]
struct CheckRunCreated {
    id: u64,
}

/// [`CheckReporter`] backed by the GitHub REST API.
#[derive(Clone)]
pub struct GitHubReporter {
    client: reqwest::Client,
    api_url: String,
    web_url: String,
    token: Option<String>,
    mode: ReportMode,
    name: String,
    fail_on_error_annotations: bool,
}

impl GitHubReporter {
    pub fn new(config: &AppConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("policy-engine/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Self {
            client,
            api_url: config.github_api_url.trim_end_matches('/').to_string(),
            web_url: config.archive_base_url.trim_end_matches('/').to_string(),
            token: config.github_token.clone(),
            mode: config.report_mode,
            name: config.check_run_name.clone(),
            fail_on_error_annotations: config.fail_on_error_annotations,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .request(method, format!("{}{}", self.api_url, path))
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28");
        if let Some(token) = &self.token {
            builder = builder.bearer_auth(token);
        }
        builder
    }

    async fn send(&self, builder: reqwest::RequestBuilder, what: &str) -> AppResult<reqwest::Response> {
        let response = builder.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::ExternalService(format!(
                "{what} failed with {status}: {body}"
            )));
        }
        Ok(response)
    }

    async fn post_commit_status(
        &self,
        target: &CheckTarget,
        state: &str,
        description: &str,
    ) -> AppResult<()> {
        let description: String = description.chars().take(MAX_DESCRIPTION).collect();
        let builder = self
            .request(
                reqwest::Method::POST,
                &format!("/repos/{}/{}/statuses/{}", target.owner, target.repo, target.head_sha),
            )
            .json(&json!({
                "state": state,
                "context": self.name,
                "description": description,
            }));
        self.send(builder, "Create commit status").await?;
        Ok(())
    }

    /// Markdown summary with one line per annotation, linking to the file
    /// and line at the reported revision when the annotation has a path.
    pub fn render_summary(&self, target: &CheckTarget, status: &RunStatus) -> String {
        let annotations: Vec<&Annotation> = match status {
            RunStatus::Complete(detail) => detail.annotations.iter().collect(),
            RunStatus::InputValidationError(issues) => {
                return issues
                    .iter()
                    .map(|issue| format!("- {issue}\n"))
                    .collect::<String>();
            }
            other => return format!("Run did not complete (last status: {})\n", other.kind()),
        };

        if annotations.is_empty() {
            return "No findings.\n".to_string();
        }

        let mut summary = String::new();
        for annotation in annotations {
            let label = if annotation.title.is_empty() {
                annotation.annotation_level.to_string()
            } else {
                annotation.title.clone()
            };
            let message = annotation.message.lines().next().unwrap_or_default();
            if annotation.path.is_empty() {
                summary.push_str(&format!("- **{label}**: {message}\n"));
            } else {
                let line = annotation.line.unwrap_or(1);
                summary.push_str(&format!(
                    "- [**{label}** {path}:{line}]({web}/{owner}/{repo}/blob/{sha}/{path}#L{line}): {message}\n",
                    path = annotation.path,
                    web = self.web_url,
                    owner = target.owner,
                    repo = target.repo,
                    sha = target.head_sha,
                ));
            }
        }
        summary
    }
}

/// Check-run API annotation; only findings with a path can be attached.
fn check_run_annotation(annotation: &Annotation) -> Option<serde_json::Value> {
    if annotation.path.is_empty() {
        return None;
    }
    let start_line = annotation.line.unwrap_or(1);
    let end_line = annotation.end_line.unwrap_or(start_line).max(start_line);
    let mut value = json!({
        "path": annotation.path,
        "start_line": start_line,
        "end_line": end_line,
        "annotation_level": annotation.annotation_level.check_run_level(),
        "message": annotation.message,
    });
    if !annotation.title.is_empty() {
        value["title"] = json!(annotation.title);
    }
    if !annotation.raw_details.is_empty() {
        value["raw_details"] = json!(annotation.raw_details);
    }
    Some(value)
}

#[async_trait]
impl CheckReporter for GitHubReporter {
    async fn start(&self, target: &CheckTarget, task_id: &str) -> AppResult<CheckHandle> {
        match self.mode {
            ReportMode::CheckRun => {
                let builder = self
                    .request(
                        reqwest::Method::POST,
                        &format!("/repos/{}/{}/check-runs", target.owner, target.repo),
                    )
                    .json(&json!({
                        "name": self.name,
                        "head_sha": target.head_sha,
                        "status": "in_progress",
                        "external_id": task_id,
                    }));
                let created: CheckRunCreated = self.send(builder, "Create check run").await?.json().await?;
                tracing::info!(
                    repo = %format!("{}/{}", target.owner, target.repo),
                    check_run_id = created.id,
                    task_id = %task_id,
                    "Created check run"
                );
                Ok(CheckHandle::CheckRun(created.id))
            }
            ReportMode::CommitStatus => {
                self.post_commit_status(target, "pending", &format!("Run {task_id} in progress"))
                    .await?;
                Ok(CheckHandle::CommitStatus)
            }
        }
    }

    async fn finish(
        &self,
        target: &CheckTarget,
        handle: &CheckHandle,
        status: &RunStatus,
    ) -> AppResult<()> {
        let conclusion = conclusion(status, self.fail_on_error_annotations);
        let title = match conclusion {
            Conclusion::Success => "Policy checks passed",
            Conclusion::Failure => "Policy checks failed",
        };

        match handle {
            CheckHandle::CheckRun(id) => {
                let annotations: Vec<serde_json::Value> = match status {
                    RunStatus::Complete(detail) => detail
                        .annotations
                        .iter()
                        .filter_map(check_run_annotation)
                        .take(MAX_ANNOTATIONS)
                        .collect(),
                    _ => Vec::new(),
                };
                let builder = self
                    .request(
                        reqwest::Method::PATCH,
                        &format!("/repos/{}/{}/check-runs/{}", target.owner, target.repo, id),
                    )
                    .json(&json!({
                        "status": "completed",
                        "conclusion": conclusion,
                        "output": {
                            "title": title,
                            "summary": self.render_summary(target, status),
                            "annotations": annotations,
                        },
                    }));
                self.send(builder, "Update check run").await?;
            }
            CheckHandle::CommitStatus => {
                let state = match conclusion {
                    Conclusion::Success => "success",
                    Conclusion::Failure => "failure",
                };
                self.post_commit_status(target, state, title).await?;
            }
        }

        tracing::info!(
            repo = %format!("{}/{}", target.owner, target.repo),
            sha = %target.head_sha,
            conclusion = ?conclusion,
            "Reported run completion"
        );
        Ok(())
    }
}
