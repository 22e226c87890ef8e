//! Scoped execution context stack: run → workflow → job → step.
//!
//! Each frame owns a private temp directory (released on drop) and its own
//! copies of env and secrets. Step frames share their job's outputs map by
//! reference so later steps see earlier writes; job and nested workflow
//! frames start from a copy.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use indexmap::IndexMap;
use serde_json::{json, Map, Value};
use tempfile::TempDir;

use crate::annotation::Annotations;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::expression::{Bindings, JobStatus};
use crate::request::PolicyEngineRequest;

/// Step id → output key → value.
pub type StepOutputs = BTreeMap<String, BTreeMap<String, String>>;

/// Outputs map shared between a job frame and its step frames.
pub type SharedOutputs = Arc<Mutex<StepOutputs>>;

const CONSOLE_OUTPUT_FILE: &str = "console_output.txt";

/// Level of a frame in the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
    Run,
    Workflow,
    Job,
    Step,
}

/// Console output captured for one step, labelled with its frame path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleRecord {
    pub path: String,
    pub output: String,
}

/// One level of the execution context stack.
#[derive(Debug)]
pub struct Frame {
    pub scope: Scope,
    pub path: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, String>,
    pub outputs: SharedOutputs,

    /// Inputs of the workflow level this frame belongs to (`inputs` context).
    pub inputs: IndexMap<String, Value>,

    pub workspace: PathBuf,
    pub annotations: Annotations,
    pub console: Vec<ConsoleRecord>,

    /// `GITHUB_ENV` values written by a step, merged into the job env on pop.
    pub exported_env: BTreeMap<String, String>,

    pub error: Option<EngineError>,

    temp: TempDir,
}

impl Frame {
    /// Private scratch directory for this frame.
    pub fn temp_path(&self) -> &Path {
        self.temp.path()
    }

    /// File the frame's child process output is teed to.
    pub fn console_output_path(&self) -> PathBuf {
        self.temp.path().join(CONSOLE_OUTPUT_FILE)
    }

    /// `workflow/job/step` style label.
    pub fn label(&self) -> String {
        self.path.join("/")
    }

    /// Record `error` unless an earlier one is already set.
    pub fn record_error(&mut self, error: EngineError) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// Snapshot of the outputs map.
    pub fn outputs_snapshot(&self) -> StepOutputs {
        lock(&self.outputs).clone()
    }

    /// Store outputs for the step `id`, replacing earlier values.
    pub fn set_step_outputs(&self, id: &str, outputs: BTreeMap<String, String>) {
        lock(&self.outputs).insert(id.to_string(), outputs);
    }
}

fn lock(outputs: &SharedOutputs) -> MutexGuard<'_, StepOutputs> {
    outputs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The stack of frames for one run.
#[derive(Debug)]
pub struct ContextStack {
    root: Frame,
    frames: Vec<Frame>,
    temp_root: PathBuf,
    env_prefix: String,
    debug: bool,
    event_inputs: Value,
    cancelled: bool,

    // Owned so the workspace outlives every frame.
    _workspace: TempDir,
}

impl ContextStack {
    /// Create the run frame for `request`.
    ///
    /// The workspace is created under the request's `cwd`, the configured
    /// temp directory, or the system temp directory, in that order.
    pub async fn new(config: &EngineConfig, request: &PolicyEngineRequest) -> EngineResult<Self> {
        let temp_root = request
            .context
            .config
            .cwd
            .clone()
            .or_else(|| config.temp_dir.clone())
            .unwrap_or_else(std::env::temp_dir);
        tokio::fs::create_dir_all(&temp_root).await?;

        let workspace = tempfile::Builder::new()
            .prefix("workspace-")
            .tempdir_in(&temp_root)?;

        let mut env = request.context.config.env.clone();
        let runner_temp = temp_root.display().to_string();
        env.entry("RUNNER_TEMP".to_string())
            .or_insert_with(|| runner_temp.clone());
        env.entry("RUNNER_TOOL_CACHE".to_string())
            .or_insert(runner_temp);

        let root = Frame {
            scope: Scope::Run,
            path: Vec::new(),
            env,
            secrets: request.context.secrets.clone(),
            outputs: SharedOutputs::default(),
            inputs: request.inputs.clone(),
            workspace: workspace.path().to_path_buf(),
            annotations: Annotations::new(),
            console: Vec::new(),
            exported_env: BTreeMap::new(),
            error: None,
            temp: new_temp_dir(&temp_root)?,
        };

        Ok(Self {
            root,
            frames: Vec::new(),
            temp_root,
            env_prefix: config.env_prefix.clone(),
            debug: request.debug() || config.debug,
            event_inputs: serde_json::to_value(&request.inputs)?,
            cancelled: false,
            _workspace: workspace,
        })
    }

    /// Push a child of the current top frame.
    pub fn push(&mut self, scope: Scope, segment: impl Into<String>) -> EngineResult<&mut Frame> {
        let temp = new_temp_dir(&self.temp_root)?;
        let parent = self.top();

        let outputs = match scope {
            Scope::Step => Arc::clone(&parent.outputs),
            Scope::Job => Arc::new(Mutex::new(parent.outputs_snapshot())),
            Scope::Workflow | Scope::Run => SharedOutputs::default(),
        };
        let mut path = parent.path.clone();
        path.push(segment.into());

        let frame = Frame {
            scope,
            path,
            env: parent.env.clone(),
            secrets: parent.secrets.clone(),
            outputs,
            inputs: parent.inputs.clone(),
            workspace: parent.workspace.clone(),
            annotations: Annotations::new(),
            console: Vec::new(),
            exported_env: BTreeMap::new(),
            error: None,
            temp,
        };
        tracing::trace!(frame = %frame.label(), depth = self.frames.len() + 1, "Pushed frame");

        self.frames.push(frame);
        Ok(self.top_mut())
    }

    /// Pop the top frame and fold its annotations, console records and
    /// first error into the new top. The run frame is never popped.
    ///
    /// The returned frame still owns its temp directory until dropped.
    pub fn pop(&mut self) -> Option<Frame> {
        let mut frame = self.frames.pop()?;
        let parent = self.top_mut();

        parent
            .annotations
            .extend(std::mem::take(&mut frame.annotations));
        parent.console.append(&mut frame.console);

        if frame.scope == Scope::Step && !frame.exported_env.is_empty() {
            parent.env.extend(frame.exported_env.clone());
        }

        if let Some(error) = &frame.error {
            parent.record_error(error.clone());
        }

        tracing::trace!(frame = %frame.label(), "Popped frame");
        Some(frame)
    }

    pub fn top(&self) -> &Frame {
        self.frames.last().unwrap_or(&self.root)
    }

    pub fn top_mut(&mut self) -> &mut Frame {
        self.frames.last_mut().unwrap_or(&mut self.root)
    }

    pub fn root(&self) -> &Frame {
        &self.root
    }

    /// Number of frames above the run frame.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    pub fn debug(&self) -> bool {
        self.debug
    }

    pub fn mark_cancelled(&mut self) {
        self.cancelled = true;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Whether any frame on the stack has recorded an error.
    pub fn has_failed(&self) -> bool {
        self.root.error.is_some() || self.frames.iter().any(|frame| frame.error.is_some())
    }

    /// Expression bindings for the top frame.
    pub fn bindings(&self) -> Bindings {
        let frame = self.top();

        let mut github = Map::new();
        for (key, value) in &frame.env {
            if let Some(stripped) = key.strip_prefix(&self.env_prefix) {
                github.insert(stripped.to_lowercase(), Value::String(value.clone()));
            }
        }
        github.insert(
            "token".to_string(),
            Value::String(frame.secrets.get("GITHUB_TOKEN").cloned().unwrap_or_default()),
        );
        github.insert("event".to_string(), json!({ "inputs": self.event_inputs }));
        github.insert(
            "workspace".to_string(),
            Value::String(frame.workspace.display().to_string()),
        );

        let steps: Map<String, Value> = lock(&frame.outputs)
            .iter()
            .map(|(id, outputs)| (id.clone(), json!({ "outputs": outputs })))
            .collect();

        Bindings::new()
            .with_context("github", Value::Object(github))
            .with_context(
                "runner",
                json!({
                    "debug": if self.debug { "1" } else { "" },
                    "temp": frame.env.get("RUNNER_TEMP"),
                    "tool_cache": frame.env.get("RUNNER_TOOL_CACHE"),
                }),
            )
            .with_context("steps", Value::Object(steps))
            .with_context("env", json!(frame.env))
            .with_context("secrets", json!(frame.secrets))
            .with_context("inputs", json!(frame.inputs))
            .with_status(JobStatus {
                failed: self.has_failed(),
                cancelled: self.cancelled,
            })
    }
}

fn new_temp_dir(root: &Path) -> EngineResult<TempDir> {
    Ok(tempfile::Builder::new().prefix("frame-").tempdir_in(root)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::annotation::{Annotation, AnnotationLevel};
    use crate::expression::evaluate;
    use crate::request::RequestContext;
    use crate::workflow::Workflow;

    async fn stack_in(dir: &Path) -> ContextStack {
        let env = BTreeMap::from([
            ("GITHUB_ACTOR".to_string(), "aliceoa".to_string()),
            ("GITHUB_ACTOR_ID".to_string(), "1234567".to_string()),
            ("OTHER".to_string(), "x".to_string()),
        ]);
        let secrets = BTreeMap::from([("GITHUB_TOKEN".to_string(), "t0k".to_string())]);
        let request = PolicyEngineRequest::new(Workflow::default())
            .with_inputs(IndexMap::from([(
                "repo_name".to_string(),
                Value::String("scitt".to_string()),
            )]))
            .with_context(RequestContext::new(env, secrets));
        let config = EngineConfig::default().with_temp_dir(dir);
        ContextStack::new(&config, &request).await.unwrap()
    }

    #[tokio::test]
    async fn test_github_context_from_env() {
        let dir = tempfile::tempdir().unwrap();
        let stack = stack_in(dir.path()).await;
        let bindings = stack.bindings();
        assert_eq!(
            evaluate(&bindings, "${{ github.actor }} ${{ github.actor_id }} ${{ github.token }}")
                .unwrap(),
            "aliceoa 1234567 t0k"
        );
        assert_eq!(
            evaluate(&bindings, "${{ github.event.inputs.repo_name }}").unwrap(),
            "scitt"
        );
        assert_eq!(evaluate(&bindings, "${{ github.other }}").unwrap(), "");
        assert_eq!(evaluate(&bindings, "${{ env.OTHER }}").unwrap(), "x");
    }

    #[tokio::test]
    async fn test_missing_cwd_is_created() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = dir.path().join("nested").join("cwd");
        let mut request = PolicyEngineRequest::new(Workflow::default());
        request.context.config.cwd = Some(cwd.clone());

        let stack = ContextStack::new(&EngineConfig::default(), &request).await.unwrap();
        assert!(cwd.is_dir());
        assert!(stack.root().workspace.starts_with(&cwd));
    }

    #[tokio::test]
    async fn test_runner_env_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let stack = stack_in(dir.path()).await;
        assert_eq!(
            stack.root().env.get("RUNNER_TEMP").map(PathBuf::from),
            Some(dir.path().to_path_buf())
        );
        assert!(stack.root().workspace.starts_with(dir.path()));
    }

    #[tokio::test]
    async fn test_step_frames_share_job_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let mut stack = stack_in(dir.path()).await;
        stack.push(Scope::Workflow, "wf").unwrap();
        stack.push(Scope::Job, "build").unwrap();

        stack.push(Scope::Step, "first").unwrap();
        stack
            .top()
            .set_step_outputs("greet", BTreeMap::from([("hello".to_string(), "world".to_string())]));
        stack.pop();

        stack.push(Scope::Step, "second").unwrap();
        assert_eq!(
            evaluate(&stack.bindings(), "${{ steps.greet.outputs.hello }}").unwrap(),
            "world"
        );
        assert_eq!(stack.top().label(), "wf/build/second");
        stack.pop();

        let job = stack.pop().unwrap();
        assert_eq!(job.outputs_snapshot().len(), 1);

        // A new job starts from the workflow's outputs, not the previous job's.
        stack.push(Scope::Job, "test").unwrap();
        assert!(stack.top().outputs_snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_pop_folds_annotations_and_first_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut stack = stack_in(dir.path()).await;
        stack.push(Scope::Workflow, "wf").unwrap();
        stack.push(Scope::Job, "a").unwrap();
        stack.top_mut().record_error(EngineError::Expression("first".to_string()));

        let step = stack.push(Scope::Step, "s").unwrap();
        step.annotations
            .push(Annotation::new(AnnotationLevel::Warning, "careful"));
        step.record_error(EngineError::Expression("second".to_string()));
        stack.pop();

        assert_eq!(stack.top().annotations.len(), 1);
        assert!(matches!(
            &stack.top().error,
            Some(EngineError::Expression(msg)) if msg == "first"
        ));

        stack.pop();
        stack.pop();
        assert_eq!(stack.root().annotations.len(), 1);
        assert!(stack.root().error.is_some());
        assert!(stack.pop().is_none());
    }

    #[tokio::test]
    async fn test_exported_env_reaches_later_steps() {
        let dir = tempfile::tempdir().unwrap();
        let mut stack = stack_in(dir.path()).await;
        stack.push(Scope::Job, "a").unwrap();
        let step = stack.push(Scope::Step, "s").unwrap();
        step.exported_env
            .insert("COLOR".to_string(), "blue".to_string());
        stack.pop();
        stack.push(Scope::Step, "t").unwrap();
        assert_eq!(stack.top().env.get("COLOR").map(String::as_str), Some("blue"));
    }

    #[tokio::test]
    async fn test_temp_dir_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let mut stack = stack_in(dir.path()).await;
        let temp = stack.push(Scope::Step, "s").unwrap().temp_path().to_path_buf();
        assert!(temp.exists());
        drop(stack.pop());
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn test_status_reflects_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut stack = stack_in(dir.path()).await;
        stack.push(Scope::Job, "a").unwrap();
        assert!(stack.bindings().status.success());
        stack.top_mut().record_error(EngineError::Cancelled);
        assert!(stack.bindings().status.failed);
    }
}
