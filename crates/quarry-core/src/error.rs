use std::path::PathBuf;

use quarry_kernel::StoreError;
use serde::Serialize;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("no hosted file matches {pattern} in {repo}")]
    NotFound { repo: String, pattern: String },
    #[error("network failure: {0}")]
    NetworkFailure(String),
    #[error("disk full: {0}")]
    DiskFull(String),
    #[error("{check} mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        check: &'static str,
        expected: String,
        actual: String,
    },
    #[error("fetch cancelled")]
    Cancelled,
    #[error("io error: {0}")]
    Io(String),
}

impl FetchError {
    /// Only network failures are retried; integrity and disk errors surface immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::NetworkFailure(_))
    }

    pub fn from_io(err: &std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::StorageFull {
            FetchError::DiskFull(err.to_string())
        } else {
            FetchError::Io(err.to_string())
        }
    }

    pub fn from_http(err: &reqwest::Error) -> Self {
        if err.status() == Some(reqwest::StatusCode::NOT_FOUND) {
            let url = err.url().map(|u| u.to_string()).unwrap_or_default();
            return FetchError::NotFound {
                repo: url,
                pattern: String::new(),
            };
        }
        FetchError::NetworkFailure(err.to_string())
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    #[error("inference service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("import failed: {0}")]
    ImportFailed(String),
    #[error("name {name} is owned by different content ({existing_digest})")]
    NameConflict {
        name: String,
        existing_digest: String,
    },
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AcquireError {
    #[error("model not in catalog: {0}")]
    NotFound(String),
    #[error("quantization {quantization} not offered for {model_id}")]
    UnsupportedQuantization {
        model_id: String,
        quantization: String,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Register(#[from] RegisterError),
    #[error("store failure during {stage}: {message}")]
    Store { stage: &'static str, message: String },
    #[error("acquisition cancelled")]
    Cancelled,
    #[error("in-flight acquisition ended without an outcome")]
    Abandoned,
}

impl AcquireError {
    pub fn store(stage: &'static str, err: StoreError) -> Self {
        AcquireError::Store {
            stage,
            message: err.to_string(),
        }
    }

    /// Stable slug for rendering an actionable message.
    pub fn kind(&self) -> &'static str {
        match self {
            AcquireError::NotFound(_) => "not_found",
            AcquireError::UnsupportedQuantization { .. } => "unsupported_quantization",
            AcquireError::Fetch(FetchError::NotFound { .. }) => "artifact_not_found",
            AcquireError::Fetch(FetchError::NetworkFailure(_)) => "network",
            AcquireError::Fetch(FetchError::DiskFull(_)) => "disk_full",
            AcquireError::Fetch(FetchError::ChecksumMismatch { .. }) => "checksum_mismatch",
            AcquireError::Fetch(FetchError::Cancelled) | AcquireError::Cancelled => "cancelled",
            AcquireError::Fetch(FetchError::Io(_)) => "io",
            AcquireError::Register(RegisterError::ServiceUnavailable(_)) => "service_unavailable",
            AcquireError::Register(RegisterError::ImportFailed(_)) => "import_failed",
            AcquireError::Register(RegisterError::NameConflict { .. }) => "name_conflict",
            AcquireError::Store { .. } => "store",
            AcquireError::Abandoned => "abandoned",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CatalogError {
    #[error("model not in catalog: {0}")]
    NotFound(String),
    #[error("catalog read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("catalog parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("catalog entry {id}: {reason}")]
    Invalid { id: String, reason: String },
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("config read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("config parse: {0}")]
    Parse(String),
    #[error("config invalid: {}", .0.join(", "))]
    Invalid(Vec<String>),
    #[error("environment override {key}={value} is not valid")]
    Env { key: &'static str, value: String },
    #[error("http client: {0}")]
    Http(String),
}

#[derive(thiserror::Error, Debug)]
pub enum MigrationError {
    #[error("backup failed: {0}")]
    Backup(String),
    #[error("no backup available")]
    NoBackup,
    #[error("backup not found: {0}")]
    BackupNotFound(PathBuf),
    #[error("restore failed: {0}")]
    Restore(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// One legacy entry that was skipped during migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SkippedEntry {
    pub source: String,
    pub reason: String,
}
