//! Step execution: `if:` gating, env and input projection, `run:` scripts
//! and `uses:` actions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde_json::Value;

use crate::actions::{ActionKind, ActionManifest, ActionRef};
use crate::commands::{parse_annotations, read_file_commands};
use crate::context::{ConsoleRecord, ContextStack, Scope};
use crate::error::{EngineError, EngineResult};
use crate::expression::{evaluate, evaluate_condition, evaluate_value, Bindings};
use crate::process::{run_process, shell_command, ProcessOutcome};
use crate::runner::{RunSession, Runner};
use crate::status::{StepStatus, StepStatusUpdate};
use crate::workflow::{IfCondition, Step, Workflow};

const OUTPUT_FILE: &str = "output.txt";
const ENV_FILE: &str = "env.txt";
const SCRIPT_FILE: &str = "run.sh";

/// How a step ended. Failures carry the recorded error.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Skipped,
    Succeeded,
    Failed(EngineError),
}

impl StepOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }

    fn status(&self) -> StepStatus {
        match self {
            StepOutcome::Skipped => StepStatus::Skipped,
            StepOutcome::Succeeded | StepOutcome::Failed(_) => StepStatus::Complete,
        }
    }
}

/// Runs one step inside its own frame on a [`ContextStack`].
pub struct StepExecutor<'a> {
    runner: &'a Runner,
    session: &'a RunSession,
    report_progress: bool,
}

impl<'a> StepExecutor<'a> {
    pub fn new(runner: &'a Runner, session: &'a RunSession, report_progress: bool) -> Self {
        Self {
            runner,
            session,
            report_progress,
        }
    }

    /// Push a step frame, run `step`, and pop the frame again on every path.
    ///
    /// A failure is recorded on the step frame, so it reaches the job frame
    /// through the pop.
    pub async fn execute(
        &self,
        stack: &mut ContextStack,
        job: &str,
        step: &Step,
        index: usize,
    ) -> StepOutcome {
        let label = step.display_name(index);

        if let Err(e) = stack.push(Scope::Step, label.clone()) {
            stack.top_mut().record_error(e.clone());
            return StepOutcome::Failed(e);
        }

        self.report(job, &label, StepStatus::InProgress, BTreeMap::new(), BTreeMap::new());

        let outcome = match self.run_in_frame(stack, step).await {
            Ok(true) => StepOutcome::Succeeded,
            Ok(false) => StepOutcome::Skipped,
            Err(e) => {
                tracing::warn!(step = %label, error = %e, "Step failed");
                stack.top_mut().record_error(e.clone());
                StepOutcome::Failed(e)
            }
        };

        let outputs = match &step.id {
            Some(id) => stack.top().outputs_snapshot().remove(id).unwrap_or_default(),
            None => BTreeMap::new(),
        };
        let mut metadata = BTreeMap::new();
        if let StepOutcome::Failed(e) = &outcome {
            metadata.insert("error".to_string(), e.to_string());
        }
        self.report(job, &label, outcome.status(), metadata, outputs);

        stack.pop();
        outcome
    }

    fn report(
        &self,
        job: &str,
        step: &str,
        status: StepStatus,
        metadata: BTreeMap<String, String>,
        outputs: BTreeMap<String, String>,
    ) {
        if self.report_progress {
            self.session.report(
                job,
                step,
                StepStatusUpdate {
                    status,
                    metadata,
                    outputs,
                },
            );
        }
    }

    /// Returns `Ok(false)` when the `if:` gate skipped the step.
    async fn run_in_frame(&self, stack: &mut ContextStack, step: &Step) -> EngineResult<bool> {
        step.validate().map_err(EngineError::NotImplemented)?;

        let bindings = stack.bindings();
        let should_run = match &step.if_condition {
            None => true,
            Some(IfCondition::Literal(value)) => {
                evaluate_condition(&bindings, if *value { "true" } else { "false" })?
            }
            Some(IfCondition::Expression(condition)) => evaluate_condition(&bindings, condition)?,
        };
        if !should_run {
            tracing::debug!(frame = %stack.top().label(), "Step skipped by condition");
            return Ok(false);
        }

        let step_env = evaluate_map(&bindings, &step.env)?;
        let with_inputs = evaluate_map(&bindings, &step.with_inputs)?;
        let side_channels = SideChannels::create(stack.top().temp_path(), step.id.clone()).await?;

        {
            let frame = stack.top_mut();
            frame.env.extend(step_env);
            frame.env.insert(
                "GITHUB_OUTPUT".to_string(),
                side_channels.output.display().to_string(),
            );
            frame.env.insert(
                "GITHUB_ENV".to_string(),
                side_channels.env.display().to_string(),
            );
            frame.env.insert(
                "GITHUB_WORKSPACE".to_string(),
                frame.workspace.display().to_string(),
            );
        }

        match (&step.uses, &step.run) {
            (Some(uses), None) => {
                self.run_uses(stack, uses, with_inputs, &side_channels)
                    .await?
            }
            (None, Some(run)) => {
                project_inputs(stack, &with_inputs);
                self.run_script(stack, step, run, &side_channels).await?
            }
            _ => {
                return Err(EngineError::NotImplemented(
                    "only 'uses: org/repo@version' and 'run' steps are implemented".to_string(),
                ))
            }
        }

        Ok(true)
    }

    async fn run_script(
        &self,
        stack: &mut ContextStack,
        step: &Step,
        run: &str,
        side_channels: &SideChannels,
    ) -> EngineResult<()> {
        let script = evaluate(&stack.bindings(), run)?;
        let script_path = stack.top().temp_path().join(SCRIPT_FILE);
        tokio::fs::write(&script_path, script).await?;

        let argv = shell_command(step.shell.as_deref(), &script_path);
        self.run_child(stack, &argv, side_channels).await
    }

    async fn run_uses(
        &self,
        stack: &mut ContextStack,
        uses: &str,
        with_inputs: BTreeMap<String, String>,
        side_channels: &SideChannels,
    ) -> EngineResult<()> {
        let action = ActionRef::parse(uses)?;
        let token = stack.top().secrets.get("GITHUB_TOKEN").cloned();
        let action_dir = self.session.cache.fetch(&action, token.as_deref()).await?;
        let manifest = ActionManifest::load(&action_dir).await?;
        let kind = manifest.kind()?;

        // Manifest defaults first, then the step's own `with:` values.
        let bindings = stack.bindings();
        let mut inputs = BTreeMap::new();
        for (name, input) in &manifest.inputs {
            if let Some(default) = &input.default {
                inputs.insert(name.clone(), evaluate_value(&bindings, default)?);
            }
        }
        inputs.extend(with_inputs);
        project_inputs(stack, &inputs);
        stack.top_mut().env.insert(
            "GITHUB_ACTION_PATH".to_string(),
            action_dir.display().to_string(),
        );

        tracing::info!(action = %action, kind = ?kind, "Running action");

        match kind {
            ActionKind::Node { main } => {
                let argv = vec!["node".to_string(), action_dir.join(main).display().to_string()];
                self.run_child(stack, &argv, side_channels).await
            }
            ActionKind::Composite => {
                let workflow = Workflow::composite(manifest.composite_steps()?);
                let composite_inputs: IndexMap<String, Value> = inputs
                    .into_iter()
                    .map(|(name, value)| (name, Value::String(value)))
                    .collect();

                let nested = self
                    .runner
                    .run_workflow(self.session, stack, &workflow, composite_inputs, false)
                    .await?;

                // `outputs.<name>.value` sees the nested run's step outputs.
                let steps: serde_json::Map<String, Value> = nested
                    .into_values()
                    .flatten()
                    .map(|(id, outputs)| (id, serde_json::json!({ "outputs": outputs })))
                    .collect();
                let bindings = stack.bindings().with_context("steps", Value::Object(steps));
                let mut outputs = BTreeMap::new();
                for (name, output) in &manifest.outputs {
                    if let Some(value) = &output.value {
                        outputs.insert(name.clone(), evaluate(&bindings, value)?);
                    }
                }

                side_channels.commit(stack, outputs).await
            }
        }
    }

    /// Run a child process, then apply side channels and annotations before
    /// judging the exit code.
    async fn run_child(
        &self,
        stack: &mut ContextStack,
        argv: &[String],
        side_channels: &SideChannels,
    ) -> EngineResult<()> {
        let (workspace, env, console_path) = {
            let frame = stack.top();
            (
                frame.workspace.clone(),
                frame.env.clone(),
                frame.console_output_path(),
            )
        };

        let outcome: ProcessOutcome =
            run_process(argv, &workspace, &env, &console_path, &self.session.cancel).await?;

        let frame = stack.top_mut();
        for annotation in parse_annotations(&outcome.console_output) {
            frame.annotations.push(annotation);
        }
        let label = frame.label();
        frame.console.push(ConsoleRecord {
            path: label.clone(),
            output: outcome.console_output.clone(),
        });

        side_channels.commit(stack, BTreeMap::new()).await?;

        if outcome.is_success() {
            Ok(())
        } else {
            Err(EngineError::StepExecution {
                message: format!("'{}' exited with code {}", label, outcome.exit_code),
                console_output: outcome.console_output,
            })
        }
    }
}

/// Project evaluated `with:` values as `INPUT_<NAME>` variables.
fn project_inputs(stack: &mut ContextStack, inputs: &BTreeMap<String, String>) {
    let env = &mut stack.top_mut().env;
    for (name, value) in inputs {
        env.insert(input_env_name(name), value.clone());
    }
}

/// `INPUT_<NAME>`, upper-cased with spaces as underscores.
pub fn input_env_name(name: &str) -> String {
    format!("INPUT_{}", name.replace(' ', "_").to_uppercase())
}

fn evaluate_map(
    bindings: &Bindings,
    values: &IndexMap<String, Value>,
) -> EngineResult<BTreeMap<String, String>> {
    values
        .iter()
        .map(|(key, value)| Ok((key.clone(), evaluate_value(bindings, value)?)))
        .collect()
}

/// The `GITHUB_OUTPUT` and `GITHUB_ENV` files of one step.
struct SideChannels {
    output: PathBuf,
    env: PathBuf,
    step_id: Option<String>,
}

impl SideChannels {
    async fn create(dir: &Path, step_id: Option<String>) -> EngineResult<Self> {
        let output = dir.join(OUTPUT_FILE);
        let env = dir.join(ENV_FILE);
        tokio::fs::write(&output, "").await?;
        tokio::fs::write(&env, "").await?;
        Ok(Self {
            output,
            env,
            step_id,
        })
    }

    /// Read both files and apply them to the step frame. `extra` outputs
    /// override values from the output file.
    async fn commit(
        &self,
        stack: &mut ContextStack,
        extra: BTreeMap<String, String>,
    ) -> EngineResult<()> {
        let mut outputs = read_file_commands(&self.output).await?;
        outputs.extend(extra);
        let env_updates = read_file_commands(&self.env).await?;

        let frame = stack.top_mut();
        if let Some(id) = &self.step_id {
            frame.set_step_outputs(id, outputs);
        }
        frame.env.extend(env_updates.clone());
        frame.exported_env.extend(env_updates);
        Ok(())
    }
}
