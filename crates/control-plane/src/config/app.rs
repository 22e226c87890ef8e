//! Application configuration for the Policy Engine Control Plane server.

use std::path::PathBuf;
use std::time::Duration;

use policy_engine::config::{DEFAULT_ARCHIVE_BASE_URL, DEFAULT_ENV_PREFIX};
use policy_engine::task::{
    DEFAULT_CANCEL_SUBJECT, DEFAULT_RESULT_BUCKET, DEFAULT_TASK_STREAM, DEFAULT_TASK_SUBJECT,
};
use policy_engine::EngineConfig;
use serde::Deserialize;

/// Which task backend executes submitted runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Runs execute on the control plane's own runtime.
    InProcess,
    /// Runs are published to NATS JetStream and executed by workers.
    Nats,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::InProcess => "in_process",
            BackendKind::Nats => "nats",
        }
    }
}

/// How webhook-triggered runs are reported back to GitHub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportMode {
    CheckRun,
    CommitStatus,
}

/// Application configuration loaded from environment variables.
///
/// Environment variables are prefixed with `POLICY_ENGINE_`:
/// - `POLICY_ENGINE_HOST`: Server bind address (default: "0.0.0.0")
/// - `POLICY_ENGINE_PORT`: Server port (default: 8080)
/// - `POLICY_ENGINE_DEBUG`: Include error chains in failure annotations (default: false)
/// - `POLICY_ENGINE_BACKEND`: `in_process` or `nats` (default: `in_process`)
/// - `POLICY_ENGINE_GITHUB_TOKEN`: Token for check runs and action downloads
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Enable debug mode
    #[serde(default)]
    pub debug: bool,

    /// Server name for identification
    #[serde(default = "default_server_name")]
    pub server_name: String,

    /// Task backend selection
    #[serde(default = "default_backend")]
    pub backend: BackendKind,

    /// NATS URL (required for the `nats` backend)
    #[serde(default)]
    pub nats_url: Option<String>,

    #[serde(default = "default_nats_stream")]
    pub nats_stream: String,

    #[serde(default = "default_nats_subject")]
    pub nats_subject: String,

    #[serde(default = "default_nats_cancel_subject")]
    pub nats_cancel_subject: String,

    /// JetStream key-value bucket holding run status
    #[serde(default = "default_result_bucket")]
    pub result_bucket: String,

    /// Action archive cache directory
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Parent directory for run workspaces
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    #[serde(default = "default_env_prefix")]
    pub env_prefix: String,

    #[serde(default = "default_archive_base_url")]
    pub archive_base_url: String,

    #[serde(default = "default_github_api_url")]
    pub github_api_url: String,

    /// Credential used for the GitHub API and passed to runs as a secret
    #[serde(default)]
    pub github_token: Option<String>,

    #[serde(default = "default_report_mode")]
    pub report_mode: ReportMode,

    #[serde(default = "default_check_run_name")]
    pub check_run_name: String,

    /// Conclude with failure when a run produced error annotations
    #[serde(default = "default_true")]
    pub fail_on_error_annotations: bool,

    /// Directory holding `<sender>.yml` / `default.yml` webhook workflows
    #[serde(default)]
    pub webhook_workflows_dir: Option<PathBuf>,

    #[serde(default = "default_poll_interval")]
    pub status_poll_interval_secs: u64,

    #[serde(default = "default_poll_max_attempts")]
    pub status_poll_max_attempts: u32,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_server_name() -> String {
    "policy-engine-control-plane".to_string()
}

fn default_backend() -> BackendKind {
    BackendKind::InProcess
}

fn default_nats_stream() -> String {
    DEFAULT_TASK_STREAM.to_string()
}

fn default_nats_subject() -> String {
    DEFAULT_TASK_SUBJECT.to_string()
}

fn default_nats_cancel_subject() -> String {
    DEFAULT_CANCEL_SUBJECT.to_string()
}

fn default_result_bucket() -> String {
    DEFAULT_RESULT_BUCKET.to_string()
}

fn default_env_prefix() -> String {
    DEFAULT_ENV_PREFIX.to_string()
}

fn default_archive_base_url() -> String {
    DEFAULT_ARCHIVE_BASE_URL.to_string()
}

fn default_github_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_report_mode() -> ReportMode {
    ReportMode::CheckRun
}

fn default_check_run_name() -> String {
    "policy-engine".to_string()
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    5
}

fn default_poll_max_attempts() -> u32 {
    720
}

impl AppConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables are prefixed with `POLICY_ENGINE_`.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("POLICY_ENGINE_").from_env::<AppConfig>()
    }

    /// Get the server bind address as a string suitable for `TcpListener::bind`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Engine configuration for in-process runs.
    pub fn engine_config(&self) -> EngineConfig {
        let mut config = EngineConfig::default()
            .with_archive_base_url(self.archive_base_url.clone())
            .with_debug(self.debug);
        config.env_prefix = self.env_prefix.clone();
        if let Some(dir) = &self.cache_dir {
            config = config.with_cache_dir(dir);
        }
        if let Some(dir) = &self.temp_dir {
            config = config.with_temp_dir(dir);
        }
        config
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_secs(self.status_poll_interval_secs.max(1))
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            debug: false,
            server_name: default_server_name(),
            backend: default_backend(),
            nats_url: None,
            nats_stream: default_nats_stream(),
            nats_subject: default_nats_subject(),
            nats_cancel_subject: default_nats_cancel_subject(),
            result_bucket: default_result_bucket(),
            cache_dir: None,
            temp_dir: None,
            env_prefix: default_env_prefix(),
            archive_base_url: default_archive_base_url(),
            github_api_url: default_github_api_url(),
            github_token: None,
            report_mode: default_report_mode(),
            check_run_name: default_check_run_name(),
            fail_on_error_annotations: true,
            webhook_workflows_dir: None,
            status_poll_interval_secs: default_poll_interval(),
            status_poll_max_attempts: default_poll_max_attempts(),
        }
    }
}
