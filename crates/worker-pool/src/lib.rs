//! Policy Engine Worker Pool
//!
//! Executes workflow runs dispatched by the control plane's NATS backend.
//!
//! This crate provides:
//! - NATS JetStream subscriber for task messages
//! - Result bucket writes for in-progress and final run status
//! - Cancellation of in-flight runs via a core NATS subject

pub mod config;
pub mod nats;
pub mod worker;

pub use config::WorkerConfig;
pub use worker::Worker;
