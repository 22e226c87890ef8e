//! Run status wire types returned by submit and poll.
//!
//! Serialized as `{"status": "<kind>", "detail": {...}}` where the detail
//! shape depends on the status.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::annotation::{Annotation, AnnotationLevel, Annotations};
use crate::error::ValidationIssue;

/// Outcome of a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExitStatus {
    Success,
    Failure,
}

/// Status of a single step as reported in progress updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    InProgress,
    Complete,
    Skipped,
}

/// Progress snapshot for one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStatusUpdate {
    pub status: StepStatus,

    #[serde(default)]
    pub metadata: BTreeMap<String, String>,

    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

/// Progress for every step of one job, keyed by step label.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobStatusUpdate {
    pub steps: IndexMap<String, StepStatusUpdate>,
}

/// A progress event emitted by the runner while a run is executing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepProgress {
    pub job: String,
    pub step: String,
    pub update: StepStatusUpdate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmittedDetail {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InProgressDetail {
    pub id: String,

    #[serde(default)]
    pub status_updates: IndexMap<String, JobStatusUpdate>,
}

impl InProgressDetail {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status_updates: IndexMap::new(),
        }
    }

    /// Fold a progress event into the per-job view.
    pub fn apply(&mut self, progress: StepProgress) {
        self.status_updates
            .entry(progress.job)
            .or_default()
            .steps
            .insert(progress.step, progress.update);
    }
}

/// Step outputs of a finished run: job name → step id → key → value.
pub type RunOutputs = IndexMap<String, BTreeMap<String, BTreeMap<String, String>>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteDetail {
    pub id: String,
    pub exit_status: ExitStatus,

    #[serde(default)]
    pub outputs: RunOutputs,

    #[serde(default)]
    pub annotations: Annotations,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnknownDetail {
    pub id: String,
}

/// Status of a submitted run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum RunStatus {
    Submitted(SubmittedDetail),
    InProgress(InProgressDetail),
    Complete(CompleteDetail),
    Unknown(UnknownDetail),
    InputValidationError(Vec<ValidationIssue>),
}

impl RunStatus {
    pub fn submitted(id: impl Into<String>) -> Self {
        RunStatus::Submitted(SubmittedDetail { id: id.into() })
    }

    pub fn unknown(id: impl Into<String>) -> Self {
        RunStatus::Unknown(UnknownDetail { id: id.into() })
    }

    /// A completed failure carrying a single error annotation.
    pub fn failed(id: impl Into<String>, message: impl Into<String>, raw_details: impl Into<String>) -> Self {
        let mut annotations = Annotations::new();
        annotations.push(
            Annotation::new(AnnotationLevel::Error, message)
                .with_title("Workflow run failed")
                .with_raw_details(raw_details),
        );
        RunStatus::Complete(CompleteDetail {
            id: id.into(),
            exit_status: ExitStatus::Failure,
            outputs: RunOutputs::new(),
            annotations,
        })
    }

    /// Final status of a run cancelled before any worker started it.
    pub fn cancelled(id: impl Into<String>) -> Self {
        Self::failed(id, "Run cancelled", "")
    }

    /// Short status name as used on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            RunStatus::Submitted(_) => "submitted",
            RunStatus::InProgress(_) => "in_progress",
            RunStatus::Complete(_) => "complete",
            RunStatus::Unknown(_) => "unknown",
            RunStatus::InputValidationError(_) => "input_validation_error",
        }
    }

    /// Task id carried in the detail, if the status has one.
    pub fn id(&self) -> Option<&str> {
        match self {
            RunStatus::Submitted(d) => Some(&d.id),
            RunStatus::InProgress(d) => Some(&d.id),
            RunStatus::Complete(d) => Some(&d.id),
            RunStatus::Unknown(d) => Some(&d.id),
            RunStatus::InputValidationError(_) => None,
        }
    }

    /// Replace the id carried in the detail.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        match &mut self {
            RunStatus::Submitted(d) => d.id = id,
            RunStatus::InProgress(d) => d.id = id,
            RunStatus::Complete(d) => d.id = id,
            RunStatus::Unknown(d) => d.id = id,
            RunStatus::InputValidationError(_) => {}
        }
        self
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Complete(_) | RunStatus::InputValidationError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_submitted_wire_format() {
        let json = serde_json::to_value(RunStatus::submitted("abc")).unwrap();
        assert_eq!(json, serde_json::json!({"status": "submitted", "detail": {"id": "abc"}}));
    }

    #[test]
    fn test_validation_error_wire_format() {
        let status = RunStatus::InputValidationError(vec![ValidationIssue::new(
            "field required",
            vec!["body".to_string(), "workflow".to_string()],
            "missing",
        )]);
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "input_validation_error");
        assert_eq!(json["detail"][0]["type"], "missing");
        assert_eq!(json["detail"][0]["loc"][1], "workflow");
        assert!(status.id().is_none());
    }

    #[test]
    fn test_failed_has_error_annotation() {
        let status = RunStatus::failed("t1", "boom", "");
        match &status {
            RunStatus::Complete(detail) => {
                assert_eq!(detail.exit_status, ExitStatus::Failure);
                assert_eq!(detail.annotations.get(AnnotationLevel::Error)[0].message, "boom");
            }
            other => panic!("unexpected status {other:?}"),
        }

        let parsed: RunStatus = serde_json::from_str(&serde_json::to_string(&status).unwrap()).unwrap();
        assert_eq!(parsed, status);
        assert!(parsed.is_terminal());
    }

    #[test]
    fn test_in_progress_apply() {
        let mut detail = InProgressDetail::new("t2");
        detail.apply(StepProgress {
            job: "lint".to_string(),
            step: "checkout".to_string(),
            update: StepStatusUpdate {
                status: StepStatus::InProgress,
                metadata: BTreeMap::new(),
                outputs: BTreeMap::new(),
            },
        });
        detail.apply(StepProgress {
            job: "lint".to_string(),
            step: "checkout".to_string(),
            update: StepStatusUpdate {
                status: StepStatus::Complete,
                metadata: BTreeMap::new(),
                outputs: BTreeMap::new(),
            },
        });

        assert_eq!(detail.status_updates["lint"].steps["checkout"].status, StepStatus::Complete);
        assert_eq!(RunStatus::InProgress(detail).with_id("t3").id(), Some("t3"));
    }
}
