//! `uses: org/repo@version` actions: reference parsing, archive download
//! and caching, and manifest loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;

use crate::error::{EngineError, EngineResult};
use crate::workflow::Step;

const EXTRACTED_DIR: &str = "extracted";

/// Keys a composite step may carry; anything else is dropped with a warning.
const COMPOSITE_STEP_KEYS: &[&str] = &["id", "if", "name", "uses", "shell", "with", "env", "run"];

/// A parsed `org/repo@version` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRef {
    pub org: String,
    pub repo: String,
    pub version: String,
}

impl ActionRef {
    /// Parse `org/repo@version`. Any other shape is not supported.
    pub fn parse(uses: &str) -> EngineResult<Self> {
        let unsupported = || {
            EngineError::NotImplemented(format!(
                "only 'uses: org/repo@version' is implemented, got '{}'",
                uses
            ))
        };
        let (org_repo, version) = uses.trim().split_once('@').ok_or_else(unsupported)?;
        let (org, repo) = org_repo.split_once('/').ok_or_else(unsupported)?;
        if org.is_empty() || repo.is_empty() || version.is_empty() || repo.contains('/') {
            return Err(unsupported());
        }
        // Each part becomes a directory under the cache root.
        let escapes = |part: &str| {
            part.contains(['\\', '\0']) || part.split('/').any(|seg| seg == "." || seg == "..")
        };
        if escapes(org) || escapes(repo) || escapes(version) {
            return Err(unsupported());
        }
        Ok(Self {
            org: org.to_string(),
            repo: repo.to_string(),
            version: version.to_string(),
        })
    }

    pub fn org_repo(&self) -> String {
        format!("{}/{}", self.org, self.repo)
    }

    /// Archive URLs tried in order: tag, literal ref, branch.
    pub fn archive_urls(&self, base_url: &str) -> [String; 3] {
        let base = base_url.trim_end_matches('/');
        let org_repo = self.org_repo();
        [
            format!("{}/{}/archive/refs/tags/{}.zip", base, org_repo, self.version),
            format!("{}/{}/archive/{}.zip", base, org_repo, self.version),
            format!("{}/{}/archive/refs/heads/{}.zip", base, org_repo, self.version),
        ]
    }
}

impl std::fmt::Display for ActionRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}@{}", self.org, self.repo, self.version)
    }
}

/// Downloads action archives and keeps them extracted on disk.
#[derive(Debug)]
pub struct ActionCache {
    root: PathBuf,
    base_url: String,
    client: reqwest::Client,

    // Present when no cache directory was configured.
    _scratch: Option<TempDir>,
}

impl ActionCache {
    /// Cache rooted at `cache_dir`, or at a private temp directory that is
    /// removed with the cache.
    pub fn new(cache_dir: Option<&Path>, base_url: &str) -> EngineResult<Self> {
        let (root, scratch) = match cache_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                (dir.to_path_buf(), None)
            }
            None => {
                let scratch = tempfile::Builder::new().prefix("action-cache-").tempdir()?;
                (scratch.path().to_path_buf(), Some(scratch))
            }
        };

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .user_agent(concat!("policy-engine/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Ok(Self {
            root,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
            _scratch: scratch,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, action: &ActionRef) -> PathBuf {
        self.root
            .join(&action.org)
            .join(&action.repo)
            .join(action.version.replace('/', "_"))
    }

    /// Directory holding the extracted action, downloading it on first use.
    pub async fn fetch(&self, action: &ActionRef, token: Option<&str>) -> EngineResult<PathBuf> {
        let entry = self.entry_dir(action);
        let extracted = entry.join(EXTRACTED_DIR);
        if tokio::fs::try_exists(&extracted).await.unwrap_or(false) {
            tracing::debug!(action = %action, path = %extracted.display(), "Action cache hit");
            return Ok(extracted);
        }

        tokio::fs::create_dir_all(&entry).await?;
        let bytes = self.download(action, token).await?;

        // Unique scratch names so concurrent runs do not clobber each other.
        let unique = uuid::Uuid::new_v4().simple().to_string();
        let archive_path = entry.join(format!("compressed-{}.zip", unique));
        let staging = entry.join(format!("extracted_tmp-{}", unique));
        tokio::fs::write(&archive_path, &bytes).await?;

        let unpack = {
            let archive_path = archive_path.clone();
            let staging = staging.clone();
            tokio::task::spawn_blocking(move || unpack_archive(&archive_path, &staging))
        };
        let unpacked = unpack
            .await
            .map_err(|e| EngineError::Io(format!("archive extraction task failed: {}", e)))?;
        let source = match unpacked {
            Ok(source) => source,
            Err(e) => {
                let _ = tokio::fs::remove_file(&archive_path).await;
                let _ = tokio::fs::remove_dir_all(&staging).await;
                return Err(e);
            }
        };

        match tokio::fs::rename(&source, &extracted).await {
            Ok(()) => {}
            Err(_) if tokio::fs::try_exists(&extracted).await.unwrap_or(false) => {
                tracing::debug!(action = %action, "Action extracted concurrently by another run");
            }
            Err(e) => return Err(e.into()),
        }
        let _ = tokio::fs::remove_file(&archive_path).await;
        let _ = tokio::fs::remove_dir_all(&staging).await;

        tracing::info!(action = %action, path = %extracted.display(), "Action cached");
        Ok(extracted)
    }

    async fn download(&self, action: &ActionRef, token: Option<&str>) -> EngineResult<Vec<u8>> {
        let mut last_error = String::from("no archive URL attempted");

        for url in action.archive_urls(&self.base_url) {
            let mut request = self.client.get(&url);
            if let Some(token) = token.filter(|t| !t.is_empty()) {
                request = request.bearer_auth(token);
            }

            match request.send().await {
                Ok(response) if response.status().is_success() => {
                    tracing::debug!(action = %action, url = %url, "Downloading action archive");
                    return response
                        .bytes()
                        .await
                        .map(|b| b.to_vec())
                        .map_err(|e| EngineError::Download {
                            reference: action.to_string(),
                            message: e.to_string(),
                        });
                }
                Ok(response) => {
                    last_error = format!("{} returned {}", url, response.status());
                }
                Err(e) => {
                    last_error = format!("{}: {}", url, e);
                }
            }
            tracing::debug!(action = %action, error = %last_error, "Archive URL did not resolve");
        }

        Err(EngineError::Download {
            reference: action.to_string(),
            message: last_error,
        })
    }
}

/// Extract `archive` into `staging` and return the directory holding the
/// action: the archive's single top-level directory, or `staging` itself.
fn unpack_archive(archive: &Path, staging: &Path) -> EngineResult<PathBuf> {
    std::fs::create_dir_all(staging)?;
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;
    zip.extract(staging)?;

    let entries = std::fs::read_dir(staging)?.collect::<Result<Vec<_>, _>>()?;
    if let [only] = entries.as_slice() {
        if only.file_type()?.is_dir() {
            return Ok(only.path());
        }
    }
    Ok(staging.to_path_buf())
}

/// An action input declaration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionInput {
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub required: Option<bool>,

    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

/// An action output declaration. Composite actions give a `value`
/// expression.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionOutput {
    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub value: Option<String>,
}

/// The `runs:` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionRuns {
    pub using: String,

    #[serde(default)]
    pub main: Option<String>,

    #[serde(default)]
    pub steps: Vec<serde_json::Value>,
}

/// Parsed `action.yml`. Unknown keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionManifest {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default)]
    pub inputs: IndexMap<String, ActionInput>,

    #[serde(default)]
    pub outputs: IndexMap<String, ActionOutput>,

    pub runs: ActionRuns,
}

/// What kind of action a manifest declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionKind {
    /// JavaScript action run with `node <main>`.
    Node { main: String },
    Composite,
}

impl ActionManifest {
    /// Load `action.yml` or `action.yaml` from an extracted action.
    pub async fn load(action_dir: &Path) -> EngineResult<Self> {
        let mut entries = tokio::fs::read_dir(action_dir).await?;
        let mut manifest_path = None;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if name == "action.yml" || name == "action.yaml" {
                manifest_path = Some(entry.path());
                break;
            }
        }

        let path = manifest_path.ok_or_else(|| {
            EngineError::Manifest(format!("no action.yml in {}", action_dir.display()))
        })?;
        let text = tokio::fs::read_to_string(&path).await?;
        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> EngineResult<Self> {
        serde_yaml::from_str(text).map_err(|e| EngineError::Manifest(e.to_string()))
    }

    /// Classify the `runs.using` value.
    pub fn kind(&self) -> EngineResult<ActionKind> {
        let using = self.runs.using.trim();
        if using.starts_with("node") {
            let main = self.runs.main.clone().ok_or_else(|| {
                EngineError::Manifest(format!("'{}' action without runs.main", using))
            })?;
            Ok(ActionKind::Node { main })
        } else if using == "composite" {
            Ok(ActionKind::Composite)
        } else {
            Err(EngineError::NotImplemented(format!(
                "only node and composite actions are implemented, got '{}'",
                using
            )))
        }
    }

    /// The composite `runs.steps` as workflow steps.
    pub fn composite_steps(&self) -> EngineResult<Vec<Step>> {
        self.runs
            .steps
            .iter()
            .enumerate()
            .map(|(index, raw)| {
                let mut raw = raw.clone();
                if let Some(object) = raw.as_object_mut() {
                    object.retain(|key, _| {
                        let known = COMPOSITE_STEP_KEYS.contains(&key.as_str());
                        if !known {
                            tracing::warn!(step = index, key = %key, "Ignoring unsupported composite step key");
                        }
                        known
                    });
                }
                let step: Step = serde_json::from_value(raw).map_err(|e| {
                    EngineError::Manifest(format!("composite step {}: {}", index, e))
                })?;
                step.validate()
                    .map_err(|msg| EngineError::Manifest(format!("composite step {}: {}", index, msg)))?;
                Ok(step)
            })
            .collect()
    }
}
