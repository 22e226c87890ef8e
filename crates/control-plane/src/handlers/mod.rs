//! HTTP handlers for the Policy Engine Control Plane API.
//!
//! This module contains all route handlers organized by domain.

pub mod health;
pub mod request;
pub mod webhook;

pub use health::{api_health, health_check};
