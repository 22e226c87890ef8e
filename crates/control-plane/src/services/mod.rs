//! Service layer for the Policy Engine Control Plane.
//!
//! Services encapsulate business logic and coordinate
//! between handlers, the task backend and GitHub.

pub mod webhook;

pub use webhook::{FileWorkflowResolver, WebhookOutcome, WebhookPayload, WebhookService, WorkflowResolver};
