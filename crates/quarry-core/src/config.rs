//! Schema-validated TOML configuration with a `QUARRY_*` environment overlay.

use std::path::{Path, PathBuf};
use std::time::Duration;

use jsonschema::{validator_for, Validator};
use once_cell::sync::OnceCell;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::retry::RetryConfig;
use crate::util::env_nonempty;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    ModelScope,
    HuggingFace,
}

impl SourceKind {
    pub fn default_base_url(&self) -> &'static str {
        match self {
            SourceKind::ModelScope => "https://modelscope.cn",
            SourceKind::HuggingFace => "https://huggingface.co",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "modelscope" | "ms" => Some(SourceKind::ModelScope),
            "huggingface" | "hf" => Some(SourceKind::HuggingFace),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct PathsConfig {
    /// Root for all state; relative entries below are joined onto it.
    #[serde(default)]
    pub base_dir: Option<String>,
    #[serde(default)]
    pub models_dir: Option<String>,
    #[serde(default)]
    pub db_dir: Option<String>,
    #[serde(default)]
    pub backup_dir: Option<String>,
    #[serde(default)]
    pub legacy_history_dir: Option<String>,
    #[serde(default)]
    pub legacy_records_file: Option<String>,
    #[serde(default)]
    pub legacy_personas_file: Option<String>,
    #[serde(default)]
    pub catalog_file: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct DownloadConfig {
    #[serde(default)]
    pub source: Option<SourceKind>,
    /// Override the model host, e.g. a mirror.
    #[serde(default)]
    pub source_base_url: Option<String>,
    /// Concurrent artifact transfers across different models.
    #[serde(default)]
    #[schemars(range(min = 1, max = 64))]
    pub max_parallel: Option<u32>,
    /// Retries after the first attempt for transient network failures.
    #[serde(default)]
    #[schemars(range(max = 20))]
    pub retries: Option<u32>,
    #[serde(default)]
    pub retry_backoff_ms: Option<u64>,
    #[serde(default)]
    pub retry_max_backoff_ms: Option<u64>,
    /// Abort a transfer after this many seconds without data (0 disables).
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
    #[serde(default)]
    pub disk_reserve_mb: Option<u64>,
    /// Timeout for listing requests; transfers are bounded by the idle timeout.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct ServiceConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub health_timeout_secs: Option<u64>,
    #[serde(default)]
    #[schemars(range(min = 1, max = 50))]
    pub health_retries: Option<u32>,
    #[serde(default)]
    pub health_backoff_ms: Option<u64>,
    #[serde(default)]
    pub import_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, JsonSchema)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub download: DownloadConfig,
    #[serde(default)]
    pub service: ServiceConfig,
}

fn config_validator() -> Result<&'static Validator, ConfigError> {
    static VALIDATOR: OnceCell<Validator> = OnceCell::new();
    VALIDATOR.get_or_try_init(|| {
        let schema = config_schema_json()?;
        validator_for(&schema).map_err(|e| ConfigError::Invalid(vec![e.to_string()]))
    })
}

/// JSON schema describing the configuration file.
pub fn config_schema_json() -> Result<serde_json::Value, ConfigError> {
    let schema = schemars::schema_for!(Config);
    serde_json::to_value(&schema).map_err(|e| ConfigError::Parse(e.to_string()))
}

pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    let raw: toml::Value = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let json_value = serde_json::to_value(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
    let violations: Vec<String> = config_validator()?
        .iter_errors(&json_value)
        .map(|e| e.to_string())
        .collect();
    if !violations.is_empty() {
        return Err(ConfigError::Invalid(violations));
    }
    toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
}

pub fn load_config(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content)
}

/// Resolve a file shipped next to the binary or in the workspace.
///
/// Search order (first existing wins): `QUARRY_CONFIG_DIR`, the executable's
/// directory and its parent, the workspace root during development, the
/// current directory.
pub fn resolve_config_path(rel: &str) -> Option<PathBuf> {
    let rel_path = Path::new(rel);
    if rel_path.is_absolute() {
        return rel_path.exists().then(|| rel_path.to_path_buf());
    }
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(dir) = env_nonempty("QUARRY_CONFIG_DIR") {
        candidates.push(PathBuf::from(dir));
    }
    if let Ok(exe_path) = std::env::current_exe() {
        if let Some(exe_dir) = exe_path.parent() {
            candidates.push(exe_dir.to_path_buf());
            if let Some(parent) = exe_dir.parent() {
                candidates.push(parent.to_path_buf());
            }
        }
    }
    candidates.push(Path::new(env!("CARGO_MANIFEST_DIR")).join("../../"));
    if let Ok(cwd) = std::env::current_dir() {
        candidates.push(cwd);
    }
    candidates
        .into_iter()
        .map(|base| base.join(rel))
        .find(|p| p.exists())
}

#[derive(Debug, Clone, Serialize)]
pub struct EffectivePaths {
    pub base_dir: PathBuf,
    pub models_dir: PathBuf,
    pub db_dir: PathBuf,
    pub backup_dir: PathBuf,
    pub legacy_history_dir: PathBuf,
    pub legacy_records_file: PathBuf,
    pub legacy_personas_file: PathBuf,
    pub catalog_file: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DownloadSettings {
    pub source: SourceKind,
    pub source_base_url: String,
    pub max_parallel: usize,
    pub retry: RetryConfig,
    pub idle_timeout: Option<Duration>,
    pub disk_reserve_bytes: u64,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub base_url: String,
    pub health_timeout: Duration,
    pub health_retry: RetryConfig,
    pub import_timeout: Duration,
}

/// Fully resolved settings: file values, then environment, then defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    pub config_path: Option<PathBuf>,
    pub paths: EffectivePaths,
    pub download: DownloadSettings,
    pub service: ServiceSettings,
}

fn default_base_dir() -> PathBuf {
    directories::ProjectDirs::from("org", "quarry", "quarry")
        .map(|p| p.data_local_dir().to_path_buf())
        .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".quarry")))
        .unwrap_or_else(|| PathBuf::from(".quarry"))
}

fn env_parse<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env_nonempty(key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Env { key, value: raw }),
    }
}

fn under(base: &Path, raw: Option<&String>, default: &str) -> PathBuf {
    match raw {
        Some(p) if Path::new(p).is_absolute() => PathBuf::from(p),
        Some(p) => base.join(p),
        None => base.join(default),
    }
}

impl Settings {
    /// Load from `explicit`, else `QUARRY_CONFIG`, else `configs/default.toml`
    /// if one can be found. A missing default file means built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| env_nonempty("QUARRY_CONFIG").map(PathBuf::from))
            .or_else(|| resolve_config_path("configs/default.toml"));
        let cfg = match &path {
            Some(p) => load_config(p)?,
            None => Config::default(),
        };
        Self::resolve(cfg, path)
    }

    pub fn resolve(cfg: Config, config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let base_dir = env_nonempty("QUARRY_BASE_DIR")
            .or(cfg.paths.base_dir.clone())
            .map(PathBuf::from)
            .unwrap_or_else(default_base_dir);
        let models_override = env_nonempty("QUARRY_MODELS_DIR");
        let catalog_file = match cfg.paths.catalog_file.as_ref() {
            Some(_) => under(&base_dir, cfg.paths.catalog_file.as_ref(), "models.json"),
            None => resolve_config_path("configs/catalog.json")
                .unwrap_or_else(|| base_dir.join("models.json")),
        };
        let paths = EffectivePaths {
            models_dir: under(
                &base_dir,
                models_override.as_ref().or(cfg.paths.models_dir.as_ref()),
                "models",
            ),
            db_dir: under(&base_dir, cfg.paths.db_dir.as_ref(), "db"),
            backup_dir: under(&base_dir, cfg.paths.backup_dir.as_ref(), "backup_json"),
            legacy_history_dir: under(&base_dir, cfg.paths.legacy_history_dir.as_ref(), "history"),
            legacy_records_file: under(
                &base_dir,
                cfg.paths.legacy_records_file.as_ref(),
                "download_records.json",
            ),
            legacy_personas_file: under(
                &base_dir,
                cfg.paths.legacy_personas_file.as_ref(),
                "personas.json",
            ),
            catalog_file,
            base_dir,
        };

        let d = &cfg.download;
        let source = match env_nonempty("QUARRY_SOURCE") {
            Some(raw) => SourceKind::parse(&raw).ok_or(ConfigError::Env {
                key: "QUARRY_SOURCE",
                value: raw,
            })?,
            None => d.source.unwrap_or_default(),
        };
        let max_parallel = env_parse::<usize>("QUARRY_DL_MAX_PARALLEL")?
            .or(d.max_parallel.map(|v| v as usize))
            .unwrap_or(2)
            .max(1);
        let retries = env_parse::<u32>("QUARRY_DL_RETRIES")?
            .or(d.retries)
            .unwrap_or(3);
        let backoff_ms = env_parse::<u64>("QUARRY_DL_RETRY_BACKOFF_MS")?
            .or(d.retry_backoff_ms)
            .unwrap_or(500)
            .clamp(1, 60_000);
        let max_backoff_ms = d.retry_max_backoff_ms.unwrap_or(30_000).max(backoff_ms);
        let idle_secs = env_parse::<u64>("QUARRY_DL_IDLE_TIMEOUT_SECS")?
            .or(d.idle_timeout_secs)
            .unwrap_or(300);
        let reserve_mb = env_parse::<u64>("QUARRY_DISK_RESERVE_MB")?
            .or(d.disk_reserve_mb)
            .unwrap_or(256);
        let download = DownloadSettings {
            source,
            source_base_url: d
                .source_base_url
                .clone()
                .unwrap_or_else(|| source.default_base_url().to_string())
                .trim_end_matches('/')
                .to_string(),
            max_parallel,
            retry: RetryConfig {
                max_attempts: retries.saturating_add(1),
                initial_delay: Duration::from_millis(backoff_ms),
                max_delay: Duration::from_millis(max_backoff_ms),
                backoff_multiplier: 2.0,
                jitter: true,
            },
            idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            disk_reserve_bytes: reserve_mb.saturating_mul(1024 * 1024),
            request_timeout: Duration::from_secs(d.request_timeout_secs.unwrap_or(60).max(1)),
        };

        let s = &cfg.service;
        let health_retries = env_parse::<u32>("QUARRY_HEALTH_RETRIES")?
            .or(s.health_retries)
            .unwrap_or(5)
            .max(1);
        let health_timeout_secs = env_parse::<u64>("QUARRY_HEALTH_TIMEOUT_SECS")?
            .or(s.health_timeout_secs)
            .unwrap_or(20)
            .max(1);
        let health_backoff_ms = s.health_backoff_ms.unwrap_or(250).max(1);
        let service = ServiceSettings {
            base_url: env_nonempty("QUARRY_SERVICE_URL")
                .or(s.base_url.clone())
                .unwrap_or_else(|| "http://127.0.0.1:11434".into())
                .trim_end_matches('/')
                .to_string(),
            health_timeout: Duration::from_secs(health_timeout_secs),
            health_retry: RetryConfig {
                max_attempts: health_retries,
                initial_delay: Duration::from_millis(health_backoff_ms),
                max_delay: Duration::from_secs(health_timeout_secs),
                backoff_multiplier: 2.0,
                jitter: true,
            },
            import_timeout: Duration::from_secs(s.import_timeout_secs.unwrap_or(600).max(1)),
        };

        Ok(Self {
            config_path,
            paths,
            download,
            service,
        })
    }

    /// Summary for `quarry paths`.
    pub fn effective_json(&self) -> serde_json::Value {
        serde_json::json!({
            "config": self.config_path.as_ref().map(|p| p.display().to_string()),
            "paths": self.paths,
            "download": {
                "source": self.download.source,
                "source_base_url": self.download.source_base_url,
                "max_parallel": self.download.max_parallel,
                "retries": self.download.retry.max_attempts.saturating_sub(1),
                "idle_timeout_secs": self.download.idle_timeout.map(|d| d.as_secs()),
                "disk_reserve_mb": self.download.disk_reserve_bytes / (1024 * 1024),
            },
            "service": {
                "base_url": self.service.base_url,
                "health_timeout_secs": self.service.health_timeout.as_secs(),
                "health_retries": self.service.health_retry.max_attempts,
            }
        })
    }
}
