//! Worker configuration.

use std::path::PathBuf;

use anyhow::{Context, Result};
use policy_engine::task::{
    DEFAULT_CANCEL_SUBJECT, DEFAULT_RESULT_BUCKET, DEFAULT_TASK_STREAM, DEFAULT_TASK_SUBJECT,
};
use policy_engine::EngineConfig;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker identifier (UUID).
    pub worker_id: String,

    /// Worker pool name.
    pub pool_name: String,

    /// NATS server URL.
    pub nats_url: String,

    /// JetStream stream holding task messages.
    pub nats_stream: String,

    /// Subject task messages are published on.
    pub nats_subject: String,

    /// Durable consumer name shared by the pool.
    pub nats_consumer: String,

    /// Core subject carrying cancellation requests.
    pub nats_cancel_subject: String,

    /// Key-value bucket run status is written to.
    pub result_bucket: String,

    /// Maximum concurrent runs.
    pub max_concurrent_tasks: usize,

    /// Configuration handed to the engine for every run.
    pub engine: EngineConfig,
}

impl WorkerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which returns the value of an
    /// environment variable if set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let var = |key: &str, default: String| lookup(key).unwrap_or(default);

        let max_concurrent_tasks = match lookup("WORKER_MAX_CONCURRENT") {
            Some(value) => value
                .parse::<usize>()
                .with_context(|| format!("WORKER_MAX_CONCURRENT must be a number, got {value:?}"))?
                .max(1),
            None => defaults.max_concurrent_tasks,
        };

        let mut engine = EngineConfig::default();
        if let Some(dir) = lookup("POLICY_ENGINE_CACHE_DIR") {
            engine = engine.with_cache_dir(PathBuf::from(dir));
        }
        if let Some(dir) = lookup("POLICY_ENGINE_TEMP_DIR") {
            engine = engine.with_temp_dir(PathBuf::from(dir));
        }
        if let Some(url) = lookup("POLICY_ENGINE_ARCHIVE_BASE_URL") {
            engine = engine.with_archive_base_url(url);
        }
        if let Some(prefix) = lookup("POLICY_ENGINE_ENV_PREFIX") {
            engine.env_prefix = prefix;
        }
        if let Some(debug) = lookup("POLICY_ENGINE_DEBUG") {
            engine = engine.with_debug(matches!(debug.to_ascii_lowercase().as_str(), "1" | "true" | "yes"));
        }

        Ok(Self {
            worker_id: var("WORKER_ID", defaults.worker_id),
            pool_name: var("WORKER_POOL_NAME", defaults.pool_name),
            nats_url: var("NATS_URL", defaults.nats_url),
            nats_stream: var("NATS_STREAM", defaults.nats_stream),
            nats_subject: var("NATS_SUBJECT", defaults.nats_subject),
            nats_consumer: var("NATS_CONSUMER", defaults.nats_consumer),
            nats_cancel_subject: var("NATS_CANCEL_SUBJECT", defaults.nats_cancel_subject),
            result_bucket: var("RESULT_BUCKET", defaults.result_bucket),
            max_concurrent_tasks,
            engine,
        })
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: uuid::Uuid::new_v4().to_string(),
            pool_name: "default".to_string(),
            nats_url: "nats://localhost:4222".to_string(),
            nats_stream: DEFAULT_TASK_STREAM.to_string(),
            nats_subject: DEFAULT_TASK_SUBJECT.to_string(),
            nats_consumer: "policy-engine-workers".to_string(),
            nats_cancel_subject: DEFAULT_CANCEL_SUBJECT.to_string(),
            result_bucket: DEFAULT_RESULT_BUCKET.to_string(),
            max_concurrent_tasks: 4,
            engine: EngineConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_default() {
        let config = WorkerConfig::default();
        assert_eq!(config.pool_name, "default");
        assert_eq!(config.max_concurrent_tasks, 4);
        assert_eq!(config.nats_subject, "policy_engine.tasks");
        assert_eq!(config.result_bucket, "policy_engine_results");
    }

    #[test]
    fn test_config_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("WORKER_ID", "w-1"),
            ("NATS_URL", "nats://nats:4222"),
            ("WORKER_MAX_CONCURRENT", "8"),
            ("POLICY_ENGINE_CACHE_DIR", "/cache"),
            ("POLICY_ENGINE_DEBUG", "true"),
        ]);
        let config = WorkerConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap();

        assert_eq!(config.worker_id, "w-1");
        assert_eq!(config.nats_url, "nats://nats:4222");
        assert_eq!(config.max_concurrent_tasks, 8);
        assert_eq!(config.nats_stream, "policy_engine_tasks");
        assert_eq!(config.engine.cache_dir, Some(PathBuf::from("/cache")));
        assert!(config.engine.debug);
    }

    #[test]
    fn test_invalid_concurrency_is_error() {
        let result = WorkerConfig::from_lookup(|key| {
            (key == "WORKER_MAX_CONCURRENT").then(|| "many".to_string())
        });
        assert!(result.is_err());
    }
}
