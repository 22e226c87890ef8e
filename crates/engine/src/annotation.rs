//! Structured log findings attached to a run.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Severity of an annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationLevel {
    Notice,
    Warning,
    Error,
}

impl AnnotationLevel {
    /// Parse a workflow command name (`notice`, `warning`, `error`).
    pub fn from_command(name: &str) -> Option<Self> {
        match name {
            "notice" => Some(AnnotationLevel::Notice),
            "warning" => Some(AnnotationLevel::Warning),
            "error" => Some(AnnotationLevel::Error),
            _ => None,
        }
    }

    /// Check run annotation level understood by the GitHub API.
    pub fn check_run_level(&self) -> &'static str {
        match self {
            AnnotationLevel::Notice => "notice",
            AnnotationLevel::Warning => "warning",
            AnnotationLevel::Error => "failure",
        }
    }
}

impl std::fmt::Display for AnnotationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AnnotationLevel::Notice => write!(f, "notice"),
            AnnotationLevel::Warning => write!(f, "warning"),
            AnnotationLevel::Error => write!(f, "error"),
        }
    }
}

/// A single finding, either emitted by a step via `::level ...::message` or
/// synthesized from a run failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    /// File the finding refers to (the `file` property).
    #[serde(default)]
    pub path: String,

    pub annotation_level: AnnotationLevel,

    #[serde(default)]
    pub title: String,

    #[serde(default)]
    pub message: String,

    #[serde(default)]
    pub raw_details: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_column: Option<u32>,
}

impl Annotation {
    /// Create an annotation with only a level and message.
    pub fn new(annotation_level: AnnotationLevel, message: impl Into<String>) -> Self {
        Self {
            path: String::new(),
            annotation_level,
            title: String::new(),
            message: message.into(),
            raw_details: String::new(),
            line: None,
            end_line: None,
            col: None,
            end_column: None,
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_raw_details(mut self, raw_details: impl Into<String>) -> Self {
        self.raw_details = raw_details.into();
        self
    }
}

/// Annotations grouped by level, serialized as
/// `{"error": [...], "warning": [...], "notice": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Annotations(BTreeMap<AnnotationLevel, Vec<Annotation>>);

impl Annotations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, annotation: Annotation) {
        self.0
            .entry(annotation.annotation_level)
            .or_default()
            .push(annotation);
    }

    /// Append every annotation of `other`, preserving order within a level.
    pub fn extend(&mut self, other: Annotations) {
        for (level, annotations) in other.0 {
            self.0.entry(level).or_default().extend(annotations);
        }
    }

    pub fn get(&self, level: AnnotationLevel) -> &[Annotation] {
        self.0.get(&level).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_errors(&self) -> bool {
        !self.get(AnnotationLevel::Error).is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(Vec::is_empty)
    }

    pub fn len(&self) -> usize {
        self.0.values().map(Vec::len).sum()
    }

    /// All annotations, most severe level first.
    pub fn iter(&self) -> impl Iterator<Item = &Annotation> {
        self.0.iter().rev().flat_map(|(_, annotations)| annotations.iter())
    }
}
