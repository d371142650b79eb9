//! Artifact Fetcher: resolve a hosted file, stream it to a temporary path,
//! verify it, and only then rename it to its canonical location.

use std::path::{Path, PathBuf};
use std::time::Instant;

use futures_util::StreamExt;
use quarry_events::Bus;
use quarry_topics::TOPIC_PROGRESS;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::catalog::QUANT_PLACEHOLDER;
use crate::config::DownloadSettings;
use crate::error::{ConfigError, FetchError};
use crate::http_client;
use crate::retry::retry_with_backoff;
use crate::sources::{match_file, RemoteFile, SharedSource};
use crate::util::safe_component;

const PROGRESS_EMIT_BYTES: u64 = 5 * 1024 * 1024; // 5 MiB
const PROGRESS_EMIT_INTERVAL: std::time::Duration = std::time::Duration::from_millis(750);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchedArtifact {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
    pub remote_path: String,
    /// The canonical file was already present and matched the remote metadata.
    pub reused: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchProgress<'a> {
    pub repo: &'a str,
    pub file: &'a str,
    pub status: &'a str,
    pub downloaded: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percent: Option<f64>,
}

pub struct ArtifactFetcher {
    models_dir: PathBuf,
    source: SharedSource,
    client: reqwest::Client,
    settings: DownloadSettings,
    bus: Bus,
}

impl ArtifactFetcher {
    pub fn new(
        models_dir: impl Into<PathBuf>,
        source: SharedSource,
        settings: DownloadSettings,
        bus: Bus,
    ) -> Result<Self, ConfigError> {
        Ok(Self::with_client(
            models_dir,
            source,
            settings,
            bus,
            http_client::streaming_client()?,
        ))
    }

    pub fn with_client(
        models_dir: impl Into<PathBuf>,
        source: SharedSource,
        settings: DownloadSettings,
        bus: Bus,
        client: reqwest::Client,
    ) -> Self {
        Self {
            models_dir: models_dir.into(),
            source,
            client,
            settings,
            bus,
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.models_dir.join("tmp")
    }

    /// `{models_dir}/{repo with '/' replaced by '_'}/{basename}`.
    pub fn canonical_path(&self, repo: &str, remote_path: &str) -> PathBuf {
        let base = remote_path.rsplit('/').next().unwrap_or(remote_path);
        self.models_dir
            .join(safe_component(&repo.replace('/', "_")))
            .join(safe_component(base))
    }

    fn tmp_path(&self, repo: &str, remote_path: &str) -> PathBuf {
        let name = format!("{}_{}", repo, remote_path);
        self.tmp_dir()
            .join(format!("{}.part", safe_component(&name.replace('/', "_"))))
    }

    /// Fetch the file matching `file_pattern` with `quantization` substituted.
    ///
    /// Transient network failures restart the transfer from zero, bounded by
    /// the configured retry policy. Every failure path removes the temporary
    /// file; the canonical path only ever holds a verified artifact.
    pub async fn fetch(
        &self,
        repo: &str,
        file_pattern: &str,
        quantization: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchedArtifact, FetchError> {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        let wanted = file_pattern.replace(QUANT_PLACEHOLDER, quantization);
        let listing = retry_with_backoff(
            &self.settings.retry,
            "list remote files",
            FetchError::is_transient,
            || self.source.list_files(repo),
        )
        .await
        .map_err(|err| match err {
            FetchError::NotFound { .. } => FetchError::NotFound {
                repo: repo.to_string(),
                pattern: wanted.clone(),
            },
            other => other,
        })?;
        let remote = match_file(&listing, &wanted)
            .cloned()
            .ok_or_else(|| FetchError::NotFound {
                repo: repo.to_string(),
                pattern: wanted.clone(),
            })?;
        let canonical = self.canonical_path(repo, &remote.path);

        if let Some(existing) = self.reuse_existing(&canonical, &remote).await? {
            info!(repo, path = %canonical.display(), "artifact already present, skipping transfer");
            self.publish_progress(repo, &remote.path, "reused", existing.bytes, Some(existing.bytes));
            return Ok(existing);
        }

        let url = self.source.download_url(repo, &remote.path);
        let fetched = retry_with_backoff(
            &self.settings.retry,
            "artifact transfer",
            FetchError::is_transient,
            || self.transfer_once(repo, &remote, &url, &canonical, cancel),
        )
        .await?;
        info!(
            repo,
            path = %fetched.path.display(),
            bytes = fetched.bytes,
            "artifact fetched"
        );
        Ok(fetched)
    }

    async fn reuse_existing(
        &self,
        canonical: &Path,
        remote: &RemoteFile,
    ) -> Result<Option<FetchedArtifact>, FetchError> {
        let meta = match fs::metadata(canonical).await {
            Ok(m) if m.is_file() => m,
            _ => return Ok(None),
        };
        if meta.len() == 0 || remote.size.is_some_and(|s| s != meta.len()) {
            debug!(path = %canonical.display(), "existing artifact differs in size; replacing");
            return Ok(None);
        }
        let sha256 = hash_file(canonical.to_path_buf()).await?;
        if remote
            .sha256
            .as_deref()
            .is_some_and(|want| !want.eq_ignore_ascii_case(&sha256))
        {
            debug!(path = %canonical.display(), "existing artifact differs in checksum; replacing");
            return Ok(None);
        }
        Ok(Some(FetchedArtifact {
            path: canonical.to_path_buf(),
            sha256,
            bytes: meta.len(),
            remote_path: remote.path.clone(),
            reused: true,
        }))
    }

    fn check_disk(&self, needed: Option<u64>) -> Result<(), FetchError> {
        let reserve = self.settings.disk_reserve_bytes;
        if reserve == 0 && needed.is_none() {
            return Ok(());
        }
        let Ok(avail) = fs2::available_space(&self.models_dir) else {
            return Ok(());
        };
        if avail <= reserve {
            return Err(FetchError::DiskFull(format!(
                "available disk {avail} <= reserve {reserve}"
            )));
        }
        if let Some(total) = needed {
            if avail.saturating_sub(reserve) < total {
                return Err(FetchError::DiskFull(format!(
                    "need {total} + reserve {reserve}, only {avail} available"
                )));
            }
        }
        Ok(())
    }

    fn publish_progress(
        &self,
        repo: &str,
        file: &str,
        status: &str,
        downloaded: u64,
        total: Option<u64>,
    ) {
        let percent = total
            .filter(|t| *t > 0)
            .map(|t| ((downloaded as f64) / (t as f64) * 100.0).min(100.0));
        self.bus.publish(
            TOPIC_PROGRESS,
            &FetchProgress {
                repo,
                file,
                status,
                downloaded,
                total,
                percent,
            },
        );
    }

    async fn transfer_once(
        &self,
        repo: &str,
        remote: &RemoteFile,
        url: &str,
        canonical: &Path,
        cancel: &CancellationToken,
    ) -> Result<FetchedArtifact, FetchError> {
        let tmp_path = self.tmp_path(repo, &remote.path);
        let result = self
            .transfer_to_tmp(repo, remote, url, &tmp_path, cancel)
            .await;
        let (sha256, bytes) = match result {
            Ok(done) => done,
            Err(err) => {
                remove_partial(&tmp_path).await;
                return Err(err);
            }
        };
        if let Err(err) = promote(&tmp_path, canonical).await {
            error!(path = %canonical.display(), %err, "artifact rename failed");
            remove_partial(&tmp_path).await;
            return Err(FetchError::from_io(&err));
        }
        self.publish_progress(repo, &remote.path, "complete", bytes, Some(bytes));
        Ok(FetchedArtifact {
            path: canonical.to_path_buf(),
            sha256,
            bytes,
            remote_path: remote.path.clone(),
            reused: false,
        })
    }

    async fn transfer_to_tmp(
        &self,
        repo: &str,
        remote: &RemoteFile,
        url: &str,
        tmp_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(String, u64), FetchError> {
        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        let io_err = |e: std::io::Error| FetchError::from_io(&e);
        fs::create_dir_all(self.tmp_dir()).await.map_err(io_err)?;
        // A previous failed attempt never resumes.
        remove_partial(tmp_path).await;
        self.check_disk(remote.size)?;

        let resp = tokio::select! {
            resp = self.client.get(url).send() => resp.map_err(|e| FetchError::from_http(&e))?,
            _ = cancel.cancelled() => return Err(FetchError::Cancelled),
        };
        let resp = resp.error_for_status().map_err(|e| match FetchError::from_http(&e) {
            FetchError::NotFound { .. } => FetchError::NotFound {
                repo: repo.to_string(),
                pattern: remote.path.clone(),
            },
            other => other,
        })?;
        let total = remote.size.or(resp.content_length());
        if remote.size.is_none() {
            self.check_disk(total)?;
        }

        let file = fs::File::create(tmp_path).await.map_err(io_err)?;
        let mut file = tokio::io::BufWriter::with_capacity(1 << 20, file);
        let mut stream = resp.bytes_stream();
        let mut hasher = Sha256::new();
        let mut downloaded: u64 = 0;
        let mut last_emit_bytes: u64 = 0;
        let mut last_emit_at = Instant::now();
        let idle_timeout = self.settings.idle_timeout;

        loop {
            let next = if let Some(idle) = idle_timeout {
                tokio::select! {
                    chunk = stream.next() => chunk,
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                    _ = tokio::time::sleep(idle) => {
                        warn!(repo, "artifact transfer idle-timeout after {:?}", idle);
                        return Err(FetchError::NetworkFailure(format!(
                            "no data received for {} seconds",
                            idle.as_secs()
                        )));
                    }
                }
            } else {
                tokio::select! {
                    chunk = stream.next() => chunk,
                    _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                }
            };
            let Some(next) = next else {
                break;
            };
            let chunk = next.map_err(|e| {
                error!(repo, "artifact chunk error: {e}");
                FetchError::NetworkFailure(e.to_string())
            })?;
            file.write_all(&chunk).await.map_err(io_err)?;
            hasher.update(&chunk);
            downloaded = downloaded.saturating_add(chunk.len() as u64);

            if self.settings.disk_reserve_bytes > 0 {
                self.check_disk(None)?;
            }
            if downloaded.saturating_sub(last_emit_bytes) >= PROGRESS_EMIT_BYTES
                || last_emit_at.elapsed() >= PROGRESS_EMIT_INTERVAL
            {
                self.publish_progress(repo, &remote.path, "downloading", downloaded, total);
                last_emit_bytes = downloaded;
                last_emit_at = Instant::now();
            }
        }

        file.flush().await.map_err(io_err)?;
        file.get_mut().sync_all().await.map_err(io_err)?;
        drop(file);

        if downloaded == 0 {
            return Err(FetchError::ChecksumMismatch {
                check: "non_empty",
                expected: "at least 1 byte".into(),
                actual: "0 bytes".into(),
            });
        }
        if let Some(expected) = remote.size {
            if expected != downloaded {
                return Err(FetchError::ChecksumMismatch {
                    check: "size",
                    expected: expected.to_string(),
                    actual: downloaded.to_string(),
                });
            }
        }
        let sha256 = hex::encode(hasher.finalize());
        if let Some(expected) = remote.sha256.as_deref() {
            if !expected.eq_ignore_ascii_case(&sha256) {
                return Err(FetchError::ChecksumMismatch {
                    check: "sha256",
                    expected: expected.to_string(),
                    actual: sha256,
                });
            }
        }
        Ok((sha256, downloaded))
    }
}

async fn promote(tmp_path: &Path, canonical: &Path) -> std::io::Result<()> {
    if let Some(parent) = canonical.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::rename(tmp_path, canonical).await
}

async fn remove_partial(tmp_path: &Path) {
    match fs::remove_file(tmp_path).await {
        Ok(()) => debug!(path = %tmp_path.display(), "removed partial artifact"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %tmp_path.display(), %err, "partial artifact cleanup failed"),
    }
}

/// Streaming sha256 of a file, off the async runtime.
pub async fn hash_file(path: PathBuf) -> Result<String, FetchError> {
    tokio::task::spawn_blocking(move || -> std::io::Result<String> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| FetchError::Io(e.to_string()))?
    .map_err(|e| FetchError::from_io(&e))
}
