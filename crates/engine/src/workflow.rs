//! GitHub Actions workflow subset.
//!
//! Hyphenated and reserved keys (`runs-on`, `if`, `with`) are mapped onto
//! identifier-safe field names on parse and mapped back on serialize, so a
//! parse → serialize → parse round trip yields equal structures. Unknown keys
//! are rejected at every level.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult, ValidationIssue};

/// A parsed workflow document. Immutable once validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Workflow {
    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Trigger definition (`on:`), kept as written: a string, list or map.
    #[serde(rename = "on", default = "empty_list")]
    pub triggers: serde_json::Value,

    /// Jobs in declaration order.
    #[serde(default)]
    pub jobs: IndexMap<String, Job>,
}

/// A job: a runner label and an ordered list of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Job {
    /// Runner selection (`runs-on:`). Recorded but not interpreted.
    #[serde(rename = "runs-on", default = "empty_list")]
    pub runs_on: serde_json::Value,

    /// Steps in execution order.
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// A single step. Exactly one of `uses` or `run` must be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    /// Key used by later steps to reference this step's outputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Gate condition (`if:`).
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub if_condition: Option<IfCondition>,

    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Action reference, `org/repo@ref`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uses: Option<String>,

    /// Shell template or named shell for `run:` steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shell: Option<String>,

    /// Action inputs (`with:`), exported as `INPUT_<KEY>`.
    #[serde(rename = "with", default, skip_serializing_if = "IndexMap::is_empty")]
    pub with_inputs: IndexMap<String, serde_json::Value>,

    /// Step scoped environment.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub env: IndexMap<String, serde_json::Value>,

    /// Script body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
}

/// An `if:` value: YAML booleans stay literal, everything else is an
/// expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IfCondition {
    Literal(bool),
    Expression(String),
}

fn empty_list() -> serde_json::Value {
    serde_json::Value::Array(Vec::new())
}

impl Workflow {
    /// Parse a workflow from YAML (or JSON, which is valid YAML) text.
    pub fn from_yaml_str(text: &str) -> EngineResult<Self> {
        let workflow: Workflow = serde_yaml::from_str(text).map_err(|e| {
            EngineError::Validation(vec![ValidationIssue::new(
                e.to_string(),
                vec!["workflow".to_string()],
                "yaml_error",
            )])
        })?;
        workflow.validate()?;
        Ok(workflow)
    }

    /// Parse a workflow from an already-decoded document. Strings are treated
    /// as inline YAML.
    pub fn from_value(value: serde_json::Value) -> EngineResult<Self> {
        if let serde_json::Value::String(text) = value {
            return Self::from_yaml_str(&text);
        }
        let workflow: Workflow = serde_json::from_value(value).map_err(|e| {
            EngineError::Validation(vec![ValidationIssue::new(
                e.to_string(),
                vec!["workflow".to_string()],
                "value_error",
            )])
        })?;
        workflow.validate()?;
        Ok(workflow)
    }

    /// Serialize back to YAML with the original hyphenated keys.
    pub fn to_yaml_string(&self) -> EngineResult<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    /// Check structural rules serde cannot express.
    pub fn validate(&self) -> EngineResult<()> {
        let mut issues = Vec::new();

        for (job_name, job) in &self.jobs {
            for (index, step) in job.steps.iter().enumerate() {
                if let Err(msg) = step.validate() {
                    issues.push(ValidationIssue::new(
                        msg,
                        vec![
                            "workflow".to_string(),
                            "jobs".to_string(),
                            job_name.clone(),
                            "steps".to_string(),
                            index.to_string(),
                        ],
                        "value_error",
                    ));
                }
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Validation(issues))
        }
    }

    /// Build the single-job workflow used to run a composite action.
    pub fn composite(steps: Vec<Step>) -> Self {
        let mut jobs = IndexMap::new();
        jobs.insert(
            "composite".to_string(),
            Job {
                runs_on: empty_list(),
                steps,
            },
        );
        Self {
            name: None,
            triggers: empty_list(),
            jobs,
        }
    }
}

impl Default for Workflow {
    fn default() -> Self {
        Self {
            name: None,
            triggers: empty_list(),
            jobs: IndexMap::new(),
        }
    }
}

impl Step {
    /// Check that exactly one of `uses` or `run` is set.
    pub fn validate(&self) -> Result<(), String> {
        match (&self.uses, &self.run) {
            (Some(_), Some(_)) => Err("exactly one of 'uses' or 'run' must be set, got both".to_string()),
            (None, None) => Err("exactly one of 'uses' or 'run' must be set, got neither".to_string()),
            _ => Ok(()),
        }
    }

    /// Label used in logs and status updates: name, id, then `uses`/`run`.
    pub fn display_name(&self, index: usize) -> String {
        self.name
            .clone()
            .or_else(|| self.id.clone())
            .or_else(|| self.uses.as_ref().map(|u| format!("uses {}", u)))
            .unwrap_or_else(|| format!("step-{}", index))
    }
}
