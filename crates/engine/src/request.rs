//! Submitted run request.

use std::collections::BTreeMap;
use std::path::PathBuf;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{EngineError, EngineResult, ValidationIssue};
use crate::workflow::Workflow;

/// Request body accepted by `/request/create`.
///
/// `workflow` may be inline YAML/JSON text or an already structured object.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyEngineRequest {
    /// Workflow inputs, exposed as `github.event.inputs` and `inputs`.
    #[serde(default)]
    pub inputs: IndexMap<String, serde_json::Value>,

    #[serde(default, deserialize_with = "deserialize_workflow")]
    pub workflow: Workflow,

    #[serde(default)]
    pub context: RequestContext,

    /// Accepted for compatibility with older clients; the engine keeps its
    /// own execution stack and ignores this value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<serde_json::Value>,
}

/// Run context supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestContext {
    #[serde(default)]
    pub config: RunConfig,

    /// Secrets, e.g. `GITHUB_TOKEN`. Never exported to step environments
    /// unless referenced through an expression.
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
}

/// Per-run configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Initial environment for the workflow frame.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Parent directory for the run workspace, overriding the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    /// Value of `runner.debug` and detailed failure output for this run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
}

fn deserialize_workflow<'de, D>(deserializer: D) -> Result<Workflow, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Workflow::from_value(value).map_err(serde::de::Error::custom)
}

impl PolicyEngineRequest {
    /// Create a request running `workflow` with no inputs or context.
    pub fn new(workflow: Workflow) -> Self {
        Self {
            workflow,
            ..Default::default()
        }
    }

    pub fn with_inputs(mut self, inputs: IndexMap<String, serde_json::Value>) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_context(mut self, context: RequestContext) -> Self {
        self.context = context;
        self
    }

    /// Decode and validate a request body, reporting every problem with its
    /// location under `body`.
    pub fn from_json_value(mut value: serde_json::Value) -> EngineResult<Self> {
        let workflow_value = value
            .as_object_mut()
            .and_then(|object| object.remove("workflow"));

        let mut request: PolicyEngineRequest = serde_json::from_value(value).map_err(|e| {
            EngineError::Validation(vec![ValidationIssue::new(
                e.to_string(),
                vec!["body".to_string()],
                "value_error",
            )])
        })?;

        if let Some(workflow_value) = workflow_value {
            request.workflow = Workflow::from_value(workflow_value).map_err(|e| match e {
                EngineError::Validation(issues) => EngineError::Validation(
                    issues
                        .into_iter()
                        .map(|mut issue| {
                            issue.loc.insert(0, "body".to_string());
                            issue
                        })
                        .collect(),
                ),
                other => other,
            })?;
        }

        Ok(request)
    }

    /// Whether debug output was requested for this run.
    pub fn debug(&self) -> bool {
        self.context.config.debug.unwrap_or(false)
    }
}

impl RequestContext {
    /// Build a context from an initial env and secrets.
    pub fn new(env: BTreeMap<String, String>, secrets: BTreeMap<String, String>) -> Self {
        Self {
            config: RunConfig {
                env,
                ..Default::default()
            },
            secrets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_yaml_workflow() {
        let request = PolicyEngineRequest::from_json_value(serde_json::json!({
            "inputs": {"repo_name": "scitt-community/scitt-api-emulator"},
            "context": {
                "config": {"env": {"GITHUB_ACTOR": "aliceoa"}},
                "secrets": {"GITHUB_TOKEN": "t0k3n"}
            },
            "workflow": "on: push\njobs:\n  lint:\n    runs-on: ubuntu-latest\n    steps:\n    - uses: actions/checkout@v4\n"
        }))
        .unwrap();

        assert_eq!(request.workflow.jobs["lint"].steps.len(), 1);
        assert_eq!(request.context.secrets["GITHUB_TOKEN"], "t0k3n");
        assert_eq!(request.context.config.env["GITHUB_ACTOR"], "aliceoa");
        assert!(!request.debug());
    }

    #[test]
    fn test_structured_workflow_via_serde() {
        let request: PolicyEngineRequest = serde_json::from_value(serde_json::json!({
            "workflow": {"jobs": {"a": {"steps": [{"run": "true"}]}}}
        }))
        .unwrap();
        assert_eq!(request.workflow.jobs["a"].steps[0].run.as_deref(), Some("true"));

        // Serialized requests (task messages) decode back to the same value.
        let round_tripped: PolicyEngineRequest =
            serde_json::from_str(&serde_json::to_string(&request).unwrap()).unwrap();
        assert_eq!(round_tripped, request);
    }

    #[test]
    fn test_validation_locations_prefixed_with_body() {
        let err = PolicyEngineRequest::from_json_value(serde_json::json!({
            "workflow": {"jobs": {"a": {"steps": [{}]}}}
        }))
        .unwrap_err();

        match err {
            EngineError::Validation(issues) => {
                assert_eq!(issues[0].loc[0], "body");
                assert_eq!(issues[0].loc[1], "workflow");
            }
            other => panic!("unexpected error {other}"),
        }
    }

    #[test]
    fn test_unknown_top_level_key_rejected() {
        let err = PolicyEngineRequest::from_json_value(serde_json::json!({"bogus": true}))
            .unwrap_err();
        assert!(err.to_string().contains("bogus"));
    }
}
