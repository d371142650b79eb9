//! Remote model hosts: list a repository's files and build download URLs.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{DownloadSettings, SourceKind};
use crate::error::{ConfigError, FetchError};
use crate::http_client;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Lowercase hex sha256 when the host publishes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl RemoteFile {
    pub fn basename(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

#[async_trait::async_trait]
pub trait ModelSource: Send + Sync {
    fn id(&self) -> &'static str;

    async fn list_files(&self, repo: &str) -> Result<Vec<RemoteFile>, FetchError>;

    fn download_url(&self, repo: &str, path: &str) -> String;
}

pub type SharedSource = Arc<dyn ModelSource>;

/// Case-insensitive match on the full path first, then on the basename.
pub fn match_file<'a>(files: &'a [RemoteFile], wanted: &str) -> Option<&'a RemoteFile> {
    files
        .iter()
        .find(|f| f.path.eq_ignore_ascii_case(wanted))
        .or_else(|| {
            let wanted_base = wanted.rsplit('/').next().unwrap_or(wanted);
            files
                .iter()
                .find(|f| f.basename().eq_ignore_ascii_case(wanted_base))
        })
}

pub fn source_for(settings: &DownloadSettings) -> Result<SharedSource, ConfigError> {
    let client = http_client::client_with_timeout(settings.request_timeout)?;
    let base = settings.source_base_url.clone();
    Ok(match settings.source {
        SourceKind::ModelScope => Arc::new(ModelScopeSource::new(base, client)),
        SourceKind::HuggingFace => Arc::new(HuggingFaceSource::new(base, client)),
    })
}

async fn get_listing(
    client: &reqwest::Client,
    url: &str,
    repo: &str,
) -> Result<Value, FetchError> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| FetchError::NetworkFailure(e.to_string()))?;
    let status = resp.status();
    if matches!(status.as_u16(), 401 | 403 | 404) {
        return Err(FetchError::NotFound {
            repo: repo.to_string(),
            pattern: String::new(),
        });
    }
    if !status.is_success() {
        return Err(FetchError::NetworkFailure(format!(
            "listing {repo} returned {status}"
        )));
    }
    resp.json::<Value>()
        .await
        .map_err(|e| FetchError::NetworkFailure(format!("listing {repo}: {e}")))
}

fn normalize_sha(raw: Option<&str>) -> Option<String> {
    let s = raw?.trim().trim_start_matches("sha256:").to_ascii_lowercase();
    (s.len() == 64 && s.chars().all(|c| c.is_ascii_hexdigit())).then_some(s)
}

pub struct ModelScopeSource {
    base_url: String,
    client: reqwest::Client,
}

impl ModelScopeSource {
    pub fn new(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait::async_trait]
impl ModelSource for ModelScopeSource {
    fn id(&self) -> &'static str {
        "modelscope"
    }

    async fn list_files(&self, repo: &str) -> Result<Vec<RemoteFile>, FetchError> {
        let url = format!(
            "{}/api/v1/models/{}/repo/files?Recursive=true",
            self.base_url, repo
        );
        let body = get_listing(&self.client, &url, repo).await?;
        let files = body
            .pointer("/Data/Files")
            .and_then(Value::as_array)
            .ok_or_else(|| FetchError::NetworkFailure(format!("listing {repo}: no Data.Files")))?;
        Ok(files
            .iter()
            .filter(|f| f.get("Type").and_then(Value::as_str) != Some("tree"))
            .filter_map(|f| {
                let path = f
                    .get("Path")
                    .or_else(|| f.get("Name"))
                    .and_then(Value::as_str)?;
                Some(RemoteFile {
                    path: path.to_string(),
                    size: f.get("Size").and_then(Value::as_u64),
                    sha256: normalize_sha(f.get("Sha256").and_then(Value::as_str)),
                })
            })
            .collect())
    }

    fn download_url(&self, repo: &str, path: &str) -> String {
        format!("{}/models/{}/resolve/master/{}", self.base_url, repo, path)
    }
}

pub struct HuggingFaceSource {
    base_url: String,
    client: reqwest::Client,
}

impl HuggingFaceSource {
    pub fn new(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }
}

#[async_trait::async_trait]
impl ModelSource for HuggingFaceSource {
    fn id(&self) -> &'static str {
        "huggingface"
    }

    async fn list_files(&self, repo: &str) -> Result<Vec<RemoteFile>, FetchError> {
        let url = format!(
            "{}/api/models/{}/tree/main?recursive=true",
            self.base_url, repo
        );
        let body = get_listing(&self.client, &url, repo).await?;
        let files = body
            .as_array()
            .ok_or_else(|| FetchError::NetworkFailure(format!("listing {repo}: not an array")))?;
        Ok(files
            .iter()
            .filter(|f| f.get("type").and_then(Value::as_str) == Some("file"))
            .filter_map(|f| {
                let path = f.get("path").and_then(Value::as_str)?;
                let lfs = f.get("lfs");
                Some(RemoteFile {
                    path: path.to_string(),
                    size: lfs
                        .and_then(|l| l.get("size"))
                        .or_else(|| f.get("size"))
                        .and_then(Value::as_u64),
                    sha256: normalize_sha(lfs.and_then(|l| l.get("oid")).and_then(Value::as_str)),
                })
            })
            .collect())
    }

    fn download_url(&self, repo: &str, path: &str) -> String {
        format!("{}/{}/resolve/main/{}", self.base_url, repo, path)
    }
}
