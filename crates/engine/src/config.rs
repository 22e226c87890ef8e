//! Engine configuration.

use std::path::PathBuf;

/// Default base URL for action archive downloads.
pub const DEFAULT_ARCHIVE_BASE_URL: &str = "https://github.com";

/// Default prefix stripped from environment variables when building the
/// `github` expression context.
pub const DEFAULT_ENV_PREFIX: &str = "GITHUB_";

/// Configuration for a [`crate::Runner`].
///
/// Built by the control plane or worker from their own environment; the
/// engine itself never reads process-global configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root directory for cached action archives. When unset each run gets a
    /// private temporary cache.
    pub cache_dir: Option<PathBuf>,

    /// Parent directory for run workspaces and per-frame temp directories.
    /// Defaults to the system temp directory.
    pub temp_dir: Option<PathBuf>,

    /// Base URL used to build `org/repo/archive/...zip` download URLs.
    pub archive_base_url: String,

    /// Environment variable prefix stripped for the `github` context.
    pub env_prefix: String,

    /// Include detailed error chains in failure annotations.
    pub debug: bool,
}

impl EngineConfig {
    /// Set the action cache directory.
    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(dir.into());
        self
    }

    /// Set the temp directory root.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = Some(dir.into());
        self
    }

    /// Set the archive base URL.
    pub fn with_archive_base_url(mut self, url: impl Into<String>) -> Self {
        self.archive_base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    /// Enable or disable debug error details.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            temp_dir: None,
            archive_base_url: DEFAULT_ARCHIVE_BASE_URL.to_string(),
            env_prefix: DEFAULT_ENV_PREFIX.to_string(),
            debug: false,
        }
    }
}
