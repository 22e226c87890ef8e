//! Application state for the Policy Engine Control Plane server.
//!
//! This module defines the shared application state that is
//! passed to all handlers via Axum's state management.

use std::sync::Arc;

use crate::backend::TaskBackend;
use crate::config::AppConfig;
use crate::services::WebhookService;

/// Shared application state.
///
/// This struct holds all shared resources that handlers need access to.
/// It is cloned into every handler via Axum's state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<AppConfig>,

    /// Task backend selected at startup
    pub backend: Arc<dyn TaskBackend>,

    /// Webhook ingress, when a workflows directory is configured
    pub webhooks: Option<WebhookService>,

    /// Server start time for uptime calculation
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, backend: Arc<dyn TaskBackend>) -> Self {
        Self {
            config,
            backend,
            webhooks: None,
            start_time: std::time::Instant::now(),
        }
    }

    pub fn with_webhooks(mut self, webhooks: WebhookService) -> Self {
        self.webhooks = Some(webhooks);
        self
    }

    /// Get the server uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
