//! Capability interface of the local inference service that artifacts are
//! registered with. Any backend that can report health, list names and
//! import a weight file under a name can stand behind [`InferenceService`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    #[default]
    Unknown,
    Ready,
    Degraded,
    Offline,
}

impl ServiceState {
    pub fn display_label(&self) -> &'static str {
        match self {
            ServiceState::Unknown => "Unknown",
            ServiceState::Ready => "Ready",
            ServiceState::Degraded => "Degraded",
            ServiceState::Offline => "Offline",
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub endpoint: String,
    pub state: ServiceState,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    pub checked_at: DateTime<Utc>,
}

impl ServiceStatus {
    pub fn new(endpoint: impl Into<String>, state: ServiceState) -> Self {
        let summary = state.display_label().to_string();
        Self {
            endpoint: endpoint.into(),
            state,
            summary,
            version: None,
            latency_ms: None,
            checked_at: Utc::now(),
        }
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = summary.into();
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_latency_ms(mut self, ms: f64) -> Self {
        self.latency_ms = Some(ms);
        self
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, ServiceState::Ready | ServiceState::Degraded)
    }
}

/// A name registered inside the service namespace.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceModel {
    pub name: String,
    /// Service-side manifest digest, if reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// sha256 of the weight file the name was created from, if the service exposes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_digest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

impl ServiceModel {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            digest: None,
            source_digest: None,
            size: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImportRequest {
    pub name: String,
    pub artifact_path: PathBuf,
    /// Lowercase hex sha256 of the artifact.
    pub sha256: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, Value>,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("service timed out: {0}")]
    Timeout(String),
    #[error("service rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unexpected response: {0}")]
    Protocol(String),
    #[error("io error: {0}")]
    Io(String),
}

impl ServiceError {
    /// Failures worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            ServiceError::Unavailable(_) | ServiceError::Timeout(_) => true,
            ServiceError::Rejected { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

#[async_trait::async_trait]
pub trait InferenceService: Send + Sync {
    fn id(&self) -> &str;

    async fn health(&self) -> Result<ServiceStatus, ServiceError>;

    async fn list(&self) -> Result<Vec<ServiceModel>, ServiceError>;

    /// Details for one name; `Ok(None)` when the name is not registered.
    async fn describe(&self, name: &str) -> Result<Option<ServiceModel>, ServiceError>;

    async fn import(&self, req: &ImportRequest) -> Result<(), ServiceError>;

    async fn remove(&self, name: &str) -> Result<(), ServiceError>;
}

pub type SharedService = Arc<dyn InferenceService>;

/// Canonical form used to compare names: ASCII-lowercase, without a `:latest` tag.
pub fn normalize_model_name(name: &str) -> String {
    let trimmed = name.trim();
    let base = match trimmed.rsplit_once(':') {
        Some((stem, tag)) if tag.eq_ignore_ascii_case("latest") => stem,
        _ => trimmed,
    };
    base.to_ascii_lowercase()
}

pub fn same_model_name(a: &str, b: &str) -> bool {
    normalize_model_name(a) == normalize_model_name(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_compare_without_latest_tag() {
        assert!(same_model_name("Qwen3-8B-Q4_K_M:latest", "qwen3-8b-q4_k_m"));
        assert!(same_model_name("a:LATEST", "A"));
        assert!(!same_model_name("a:v2", "a"));
        assert_eq!(normalize_model_name(" m:v2 "), "m:v2");
    }

    #[test]
    fn transient_errors_are_retryable() {
        assert!(ServiceError::Unavailable("x".into()).is_transient());
        assert!(ServiceError::Timeout("x".into()).is_transient());
        assert!(ServiceError::Rejected {
            status: 503,
            message: String::new()
        }
        .is_transient());
        assert!(!ServiceError::Rejected {
            status: 400,
            message: String::new()
        }
        .is_transient());
        assert!(!ServiceError::Protocol("x".into()).is_transient());
    }

    #[test]
    fn status_serializes_snake_case_state() {
        let status = ServiceStatus::new("http://127.0.0.1:11434", ServiceState::Ready)
            .with_version("0.5.1")
            .with_latency_ms(3.5);
        let v = serde_json::to_value(&status).unwrap();
        assert_eq!(v["state"], "ready");
        assert_eq!(v["version"], "0.5.1");
        assert!(status.is_ready());
        assert!(!ServiceStatus::new("x", ServiceState::Offline).is_ready());
    }
}
