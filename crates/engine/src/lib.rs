//! Policy Engine
//!
//! GitHub Actions compatible workflow execution used as a policy engine.
//!
//! This crate provides:
//! - Workflow and request models with schema validation
//! - `${{ }}` expression evaluation over a read-only context
//! - Workflow command protocol parsing (`GITHUB_OUTPUT`, `GITHUB_ENV`, annotations)
//! - A scoped execution context stack (workflow → job → step)
//! - Step execution for `run:` and `uses: org/repo@version` steps
//! - The workflow runner producing a pollable [`RunStatus`]
//!
//! Task dispatch (in-process or distributed) lives in the control plane and
//! worker pool crates; both drive [`Runner`] the same way.

pub mod actions;
pub mod annotation;
pub mod commands;
pub mod config;
pub mod context;
pub mod error;
pub mod expression;
pub mod process;
pub mod request;
pub mod runner;
pub mod status;
pub mod step;
pub mod task;
pub mod workflow;

pub use annotation::{Annotation, AnnotationLevel, Annotations};
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult, ValidationIssue};
pub use request::{PolicyEngineRequest, RequestContext};
pub use runner::Runner;
pub use status::{ExitStatus, RunStatus};
pub use step::StepOutcome;
pub use workflow::{Job, Step, Workflow};
