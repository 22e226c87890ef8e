//! Workflow runner.
//!
//! Jobs run strictly in declaration order. Within a job every step is
//! attempted even after an earlier failure, so all annotations are
//! collected; a job that ends with an error aborts the remaining jobs.

use futures::future::BoxFuture;
use indexmap::IndexMap;
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;

use crate::actions::ActionCache;
use crate::annotation::{Annotation, AnnotationLevel};
use crate::config::EngineConfig;
use crate::context::{ContextStack, Scope};
use crate::error::{EngineError, EngineResult};
use crate::request::PolicyEngineRequest;
use crate::status::{CompleteDetail, ExitStatus, RunOutputs, RunStatus, StepProgress, StepStatusUpdate};
use crate::step::{StepExecutor, StepOutcome};
use crate::workflow::Workflow;

/// State shared by every level of one run, including nested composite
/// workflows.
pub struct RunSession {
    pub cache: ActionCache,
    pub cancel: CancellationToken,
    progress: Option<UnboundedSender<StepProgress>>,
}

impl RunSession {
    pub fn new(
        config: &EngineConfig,
        cancel: CancellationToken,
        progress: Option<UnboundedSender<StepProgress>>,
    ) -> EngineResult<Self> {
        Ok(Self {
            cache: ActionCache::new(config.cache_dir.as_deref(), &config.archive_base_url)?,
            cancel,
            progress,
        })
    }

    /// Send a progress event. A dropped receiver is not an error.
    pub fn report(&self, job: &str, step: &str, update: StepStatusUpdate) {
        if let Some(progress) = &self.progress {
            let _ = progress.send(StepProgress {
                job: job.to_string(),
                step: step.to_string(),
                update,
            });
        }
    }
}

/// Executes [`PolicyEngineRequest`]s.
#[derive(Debug, Clone, Default)]
pub struct Runner {
    config: EngineConfig,
}

impl Runner {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run `request` to completion.
    ///
    /// Always returns a terminal status: `complete` with `success` or
    /// `failure`, or `input_validation_error` for a workflow that does not
    /// validate.
    pub async fn execute(
        &self,
        task_id: &str,
        request: PolicyEngineRequest,
        cancel: CancellationToken,
        progress: Option<UnboundedSender<StepProgress>>,
    ) -> RunStatus {
        if let Err(e) = request.workflow.validate() {
            return match e {
                EngineError::Validation(issues) => RunStatus::InputValidationError(issues),
                other => RunStatus::failed(task_id, other.to_string(), ""),
            };
        }

        tracing::info!(task_id = %task_id, jobs = request.workflow.jobs.len(), "Starting workflow run");

        let session = match RunSession::new(&self.config, cancel, progress) {
            Ok(session) => session,
            Err(e) => return RunStatus::failed(task_id, e.to_string(), ""),
        };
        let mut stack = match ContextStack::new(&self.config, &request).await {
            Ok(stack) => stack,
            Err(e) => return RunStatus::failed(task_id, e.to_string(), ""),
        };

        let result = self
            .run_workflow(&session, &mut stack, &request.workflow, request.inputs.clone(), true)
            .await;

        let root = stack.root();
        let mut annotations = root.annotations.clone();
        let (exit_status, outputs) = match result {
            Ok(outputs) => (ExitStatus::Success, outputs),
            Err(e) => {
                let mut message = e.to_string();
                if !e.console_output().is_empty() {
                    message.push('\n');
                    message.push_str(e.console_output());
                }
                let raw_details = if stack.debug() {
                    let mut details = format!("{:#?}\n", e);
                    for record in &root.console {
                        details.push_str(&format!("==> {} <==\n{}\n", record.path, record.output));
                    }
                    details
                } else {
                    String::new()
                };
                annotations.push(
                    Annotation::new(AnnotationLevel::Error, message)
                        .with_title("Workflow run failed")
                        .with_raw_details(raw_details),
                );
                (ExitStatus::Failure, RunOutputs::new())
            }
        };

        tracing::info!(
            task_id = %task_id,
            exit_status = ?exit_status,
            annotations = annotations.len(),
            "Workflow run finished"
        );

        RunStatus::Complete(CompleteDetail {
            id: task_id.to_string(),
            exit_status,
            outputs,
            annotations,
        })
    }

    /// Run `workflow` on top of the current frame.
    ///
    /// Pushes a workflow frame with `inputs` and pops it before returning.
    /// Returns each job's step outputs, or the first job error.
    pub fn run_workflow<'a>(
        &'a self,
        session: &'a RunSession,
        stack: &'a mut ContextStack,
        workflow: &'a Workflow,
        inputs: IndexMap<String, Value>,
        report_progress: bool,
    ) -> BoxFuture<'a, EngineResult<RunOutputs>> {
        Box::pin(async move {
            let segment = workflow.name.clone().unwrap_or_else(|| "workflow".to_string());
            stack.push(Scope::Workflow, segment)?.inputs = inputs;

            let executor = StepExecutor::new(self, session, report_progress);
            let mut outputs = RunOutputs::new();
            let mut result = Ok(());

            for (job_name, job) in &workflow.jobs {
                if session.cancel.is_cancelled() {
                    stack.mark_cancelled();
                    stack.top_mut().record_error(EngineError::Cancelled);
                    result = Err(EngineError::Cancelled);
                    break;
                }

                if let Err(e) = stack.push(Scope::Job, job_name.clone()) {
                    stack.top_mut().record_error(e.clone());
                    result = Err(e);
                    break;
                }
                tracing::info!(job = %job_name, steps = job.steps.len(), "Running job");

                for (index, step) in job.steps.iter().enumerate() {
                    let outcome = executor.execute(stack, job_name, step, index).await;
                    if let StepOutcome::Failed(EngineError::Cancelled) = outcome {
                        stack.mark_cancelled();
                        break;
                    }
                    if outcome.is_failed() {
                        tracing::debug!(job = %job_name, step = index, "Continuing after step failure");
                    }
                }

                outputs.insert(job_name.clone(), stack.top().outputs_snapshot());
                let job_error = stack.top().error.clone();
                stack.pop();

                if let Some(e) = job_error {
                    tracing::warn!(job = %job_name, error = %e, "Job failed, aborting remaining jobs");
                    result = Err(e);
                    break;
                }
            }

            stack.pop();
            result.map(|()| outputs)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestContext;
    use crate::status::StepStatus;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn request(yaml: &str) -> PolicyEngineRequest {
        PolicyEngineRequest::new(Workflow::from_yaml_str(yaml).unwrap())
    }

    fn runner(dir: &std::path::Path) -> Runner {
        Runner::new(EngineConfig::default().with_temp_dir(dir))
    }

    async fn run(dir: &std::path::Path, request: PolicyEngineRequest) -> CompleteDetail {
        match runner(dir)
            .execute("t1", request, CancellationToken::new(), None)
            .await
        {
            RunStatus::Complete(detail) => detail,
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_workflow_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let detail = run(dir.path(), request("on: push\njobs: {}\n")).await;
        assert_eq!(detail.id, "t1");
        assert_eq!(detail.exit_status, ExitStatus::Success);
        assert!(detail.annotations.is_empty());
    }

    #[tokio::test]
    async fn test_outputs_flow_between_steps() {
        let dir = tempfile::tempdir().unwrap();
        let detail = run(
            dir.path(),
            request(
                r#"
jobs:
  greet:
    runs-on: ubuntu-latest
    steps:
      - id: first
        run: "echo hello=world | tee -a $GITHUB_OUTPUT"
      - id: second
        env:
          SEEN: ${{ steps.first.outputs.hello }}
        run: |
          echo "seen=$SEEN" >> $GITHUB_OUTPUT
          echo "COLOR=blue" >> $GITHUB_ENV
      - id: third
        run: echo "color=$COLOR" >> $GITHUB_OUTPUT
"#,
            ),
        )
        .await;

        assert_eq!(detail.exit_status, ExitStatus::Success);
        let job = &detail.outputs["greet"];
        assert_eq!(job["first"]["hello"], "world");
        assert_eq!(job["second"]["seen"], "world");
        assert_eq!(job["third"]["color"], "blue");
    }

    #[tokio::test]
    async fn test_failing_step_reports_console_output() {
        let dir = tempfile::tempdir().unwrap();
        let detail = run(
            dir.path(),
            request(
                r#"
jobs:
  lint:
    steps:
      - run: |
          echo "::warning file=a.txt::looks odd"
          echo "something broke"
          exit 2
      - id: after
        run: echo "ran=yes" >> $GITHUB_OUTPUT
  never:
    steps:
      - id: skipped
        run: echo "ran=yes" >> $GITHUB_OUTPUT
"#,
            ),
        )
        .await;

        assert_eq!(detail.exit_status, ExitStatus::Failure);
        let errors = detail.annotations.get(AnnotationLevel::Error);
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("something broke"));
        assert!(errors[0].raw_details.is_empty());
        assert_eq!(detail.annotations.get(AnnotationLevel::Warning)[0].path, "a.txt");
    }

    #[tokio::test]
    async fn test_best_effort_continues_within_job_only() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("marker");
        let second_job = dir.path().join("second-job");
        let yaml = format!(
            r#"
jobs:
  first:
    steps:
      - run: exit 1
      - run: touch {marker}
      - if: success()
        run: echo "should not run" && exit 1
  second:
    steps:
      - run: touch {second_job}
"#,
            marker = marker.display(),
            second_job = second_job.display(),
        );
        let detail = run(dir.path(), request(&yaml)).await;
        assert_eq!(detail.exit_status, ExitStatus::Failure);
        assert!(marker.exists());
        assert!(!second_job.exists());
        assert_eq!(detail.annotations.get(AnnotationLevel::Error).len(), 1);
    }

    #[tokio::test]
    async fn test_false_condition_has_no_effect() {
        let dir = tempfile::tempdir().unwrap();
        let detail = run(
            dir.path(),
            request(
                r#"
jobs:
  gate:
    steps:
      - id: skipped
        if: false
        run: |
          echo "::error::nope"
          echo "x=1" >> $GITHUB_OUTPUT
          exit 1
      - id: also-skipped
        if: ${{ github.actor == 'nobody' }}
        run: exit 1
"#,
            ),
        )
        .await;
        assert_eq!(detail.exit_status, ExitStatus::Success);
        assert!(detail.annotations.is_empty());
        assert!(detail.outputs["gate"].is_empty());
    }

    #[tokio::test]
    async fn test_expressions_see_env_and_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let env = BTreeMap::from([
            ("GITHUB_ACTOR".to_string(), "aliceoa".to_string()),
            ("GITHUB_ACTOR_ID".to_string(), "1234567".to_string()),
        ]);
        let request = request(
            r#"
jobs:
  commit:
    steps:
      - id: author
        with:
          repo: ${{ github.event.inputs.repo_name }}
        run: |
          echo "author=${{ github.actor }} <${{ github.actor_id }}+${{ github.actor }}@users.noreply.github.com>" >> $GITHUB_OUTPUT
          echo "repo=$INPUT_REPO" >> $GITHUB_OUTPUT
"#,
        )
        .with_inputs(IndexMap::from([(
            "repo_name".to_string(),
            Value::String("scitt".to_string()),
        )]))
        .with_context(RequestContext::new(env, BTreeMap::new()));

        let detail = run(dir.path(), request).await;
        assert_eq!(detail.exit_status, ExitStatus::Success);
        assert_eq!(
            detail.outputs["commit"]["author"]["author"],
            "aliceoa <1234567+aliceoa@users.noreply.github.com>"
        );
        assert_eq!(detail.outputs["commit"]["author"]["repo"], "scitt");
    }

    #[tokio::test]
    async fn test_unsupported_uses_is_not_implemented() {
        let dir = tempfile::tempdir().unwrap();
        let detail = run(
            dir.path(),
            request("jobs:\n  a:\n    steps:\n      - uses: ./local-action\n"),
        )
        .await;
        assert_eq!(detail.exit_status, ExitStatus::Failure);
        let message = &detail.annotations.get(AnnotationLevel::Error)[0].message;
        assert!(message.starts_with("Not implemented"), "{message}");
    }

    #[tokio::test]
    async fn test_debug_includes_raw_details() {
        let dir = tempfile::tempdir().unwrap();
        let runner = Runner::new(EngineConfig::default().with_temp_dir(dir.path()).with_debug(true));
        let status = runner
            .execute(
                "t2",
                request("jobs:\n  a:\n    steps:\n      - run: echo oops && exit 1\n"),
                CancellationToken::new(),
                None,
            )
            .await;
        let RunStatus::Complete(detail) = status else {
            panic!("expected complete");
        };
        let error = &detail.annotations.get(AnnotationLevel::Error)[0];
        assert!(error.raw_details.contains("StepExecution"));
        assert!(error.raw_details.contains("oops"));
    }

    #[tokio::test]
    async fn test_progress_updates() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let status = runner(dir.path())
            .execute(
                "t3",
                request("jobs:\n  a:\n    steps:\n      - id: s\n        run: echo k=v >> $GITHUB_OUTPUT\n      - if: false\n        run: exit 1\n"),
                CancellationToken::new(),
                Some(tx),
            )
            .await;
        assert!(status.is_terminal());

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        let statuses: Vec<_> = events.iter().map(|e| e.update.status).collect();
        assert_eq!(
            statuses,
            vec![
                StepStatus::InProgress,
                StepStatus::Complete,
                StepStatus::InProgress,
                StepStatus::Skipped
            ]
        );
        assert_eq!(events[1].update.outputs["k"], "v");
        assert_eq!(events[0].job, "a");
    }

    #[tokio::test]
    async fn test_cancellation_fails_run() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let status = runner(dir.path())
            .execute(
                "t4",
                request("jobs:\n  a:\n    steps:\n      - run: sleep 30\n  b:\n    steps:\n      - run: echo b\n"),
                cancel,
                None,
            )
            .await;
        let RunStatus::Complete(detail) = status else {
            panic!("expected complete");
        };
        assert_eq!(detail.exit_status, ExitStatus::Failure);
        assert!(detail.annotations.get(AnnotationLevel::Error)[0]
            .message
            .contains("cancelled"));
    }
}
