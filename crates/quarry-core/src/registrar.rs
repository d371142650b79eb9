//! Service Registrar: import fetched artifacts into the inference service
//! namespace and confirm the service can see them.
//!
//! Name conflicts resolve deterministically. The desired name is reused when
//! the service reports it was built from the same sha256. Otherwise the
//! artifact goes under `{stem}-{sha8}:latest`, checked the same way; a second
//! clash with different content is a [`RegisterError::NameConflict`].

use std::path::Path;

use quarry_events::Bus;
use quarry_runtime::{
    same_model_name, ImportRequest, ServiceError, ServiceModel, ServiceStatus, SharedService,
};
use quarry_topics::{TOPIC_SERVICE_HEALTH, TOPIC_SERVICE_REGISTERED};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::ServiceSettings;
use crate::error::RegisterError;
use crate::ollama::{chat_template, default_parameters};
use crate::retry::{retry_with_backoff, RetryConfig};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegisteredName {
    pub name: String,
    /// An existing registration with identical content was kept.
    pub reused: bool,
    /// The desired name was taken and the checksum-suffixed name was used.
    pub disambiguated: bool,
}

/// `{stem}-{first 8 hex of sha256}:latest`, keeping the stem's spelling.
pub fn disambiguated_name(desired: &str, sha256: &str) -> String {
    let trimmed = desired.trim();
    let stem = match trimmed.rsplit_once(':') {
        Some((stem, tag)) if tag.eq_ignore_ascii_case("latest") => stem,
        _ => trimmed,
    };
    let short: String = sha256.chars().take(8).collect::<String>().to_ascii_lowercase();
    format!("{stem}-{short}:latest")
}

fn unavailable_or(err: ServiceError, wrap: fn(String) -> RegisterError) -> RegisterError {
    if err.is_transient() {
        RegisterError::ServiceUnavailable(err.to_string())
    } else {
        wrap(err.to_string())
    }
}

pub struct Registrar {
    service: SharedService,
    /// Backoff for transient service errors on health, describe and import.
    retry: RetryConfig,
    bus: Bus,
}

impl Registrar {
    pub fn new(service: SharedService, settings: &ServiceSettings, bus: Bus) -> Self {
        Self::with_retry(service, settings.health_retry.clone(), bus)
    }

    pub fn with_retry(service: SharedService, retry: RetryConfig, bus: Bus) -> Self {
        Self {
            service,
            retry,
            bus,
        }
    }

    /// Health probe with bounded exponential backoff.
    pub async fn ensure_available(&self) -> Result<ServiceStatus, RegisterError> {
        let result = retry_with_backoff(
            &self.retry,
            "service health",
            ServiceError::is_transient,
            || async {
                let status = self.service.health().await?;
                if status.is_ready() {
                    Ok(status)
                } else {
                    Err(ServiceError::Unavailable(status.summary.clone()))
                }
            },
        )
        .await;
        match result {
            Ok(status) => {
                self.bus.publish(TOPIC_SERVICE_HEALTH, &status);
                Ok(status)
            }
            Err(err) => {
                warn!(service = self.service.id(), %err, "inference service unavailable");
                Err(RegisterError::ServiceUnavailable(err.to_string()))
            }
        }
    }

    pub async fn list(&self) -> Result<Vec<ServiceModel>, RegisterError> {
        self.service
            .list()
            .await
            .map_err(|e| RegisterError::ServiceUnavailable(e.to_string()))
    }

    pub async fn is_registered(&self, name: &str) -> Result<bool, RegisterError> {
        Ok(self
            .list()
            .await?
            .iter()
            .any(|m| same_model_name(&m.name, name)))
    }

    pub async fn register(
        &self,
        artifact_path: &Path,
        sha256: &str,
        desired_name: &str,
    ) -> Result<RegisteredName, RegisterError> {
        self.ensure_available().await?;
        let candidates = [
            desired_name.to_string(),
            disambiguated_name(desired_name, sha256),
        ];
        let mut last_conflict = None;
        for (idx, candidate) in candidates.iter().enumerate() {
            let existing = retry_with_backoff(
                &self.retry,
                "service describe",
                ServiceError::is_transient,
                || self.service.describe(candidate),
            )
            .await
            .map_err(|e| unavailable_or(e, RegisterError::ImportFailed))?;
            let registered = match existing {
                None => {
                    self.import(artifact_path, sha256, candidate).await?;
                    RegisteredName {
                        name: candidate.clone(),
                        reused: false,
                        disambiguated: idx > 0,
                    }
                }
                Some(model)
                    if model
                        .source_digest
                        .as_deref()
                        .is_some_and(|d| d.eq_ignore_ascii_case(sha256)) =>
                {
                    info!(name = %candidate, "service already holds identical content");
                    RegisteredName {
                        name: candidate.clone(),
                        reused: true,
                        disambiguated: idx > 0,
                    }
                }
                Some(model) => {
                    let existing_digest = model.source_digest.unwrap_or_else(|| "unknown".into());
                    warn!(
                        name = %candidate,
                        existing_digest = %existing_digest,
                        "service name owned by different content"
                    );
                    last_conflict = Some(RegisterError::NameConflict {
                        name: candidate.clone(),
                        existing_digest,
                    });
                    continue;
                }
            };
            self.verify(&registered.name).await?;
            self.bus.publish(TOPIC_SERVICE_REGISTERED, &registered);
            return Ok(registered);
        }
        Err(last_conflict.unwrap_or_else(|| {
            RegisterError::NameConflict {
                name: desired_name.to_string(),
                existing_digest: "unknown".into(),
            }
        }))
    }

    async fn import(&self, artifact_path: &Path, sha256: &str, name: &str) -> Result<(), RegisterError> {
        let req = ImportRequest {
            name: name.to_string(),
            artifact_path: artifact_path.to_path_buf(),
            sha256: sha256.to_ascii_lowercase(),
            template: Some(chat_template(name).to_string()),
            parameters: default_parameters(name),
        };
        info!(name, path = %artifact_path.display(), "importing artifact into service");
        retry_with_backoff(&self.retry, "service import", ServiceError::is_transient, || {
            self.service.import(&req)
        })
        .await
        .map_err(|e| unavailable_or(e, RegisterError::ImportFailed))
    }

    /// The import only counts once the service lists the name.
    async fn verify(&self, name: &str) -> Result<(), RegisterError> {
        let listed = self
            .service
            .list()
            .await
            .map_err(|e| RegisterError::ImportFailed(format!("verification query failed: {e}")))?;
        if listed.iter().any(|m| same_model_name(&m.name, name)) {
            Ok(())
        } else {
            Err(RegisterError::ImportFailed(format!(
                "{name} not listed by the service after import"
            )))
        }
    }

    /// Remove a name from the service; an absent name is not an error.
    pub async fn unregister(&self, name: &str) -> Result<(), RegisterError> {
        match self.service.remove(name).await {
            Ok(()) | Err(ServiceError::NotFound(_)) => Ok(()),
            Err(err) => Err(unavailable_or(err, RegisterError::ImportFailed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_mock_service::MockService;
    use std::sync::Arc;
    use std::time::Duration;

    fn sha(c: char) -> String {
        std::iter::repeat(c).take(64).collect()
    }

    fn fast_retry(attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    fn registrar(svc: Arc<MockService>) -> Registrar {
        Registrar::with_retry(svc, fast_retry(3), Bus::new(16))
    }

    #[test]
    fn disambiguation_is_deterministic() {
        assert_eq!(
            disambiguated_name("Qwen3-8B-Q4_K_M:latest", &sha('A')),
            "Qwen3-8B-Q4_K_M-aaaaaaaa:latest"
        );
        assert_eq!(disambiguated_name("m", &sha('1')), "m-11111111:latest");
    }

    #[tokio::test]
    async fn fresh_name_is_imported_and_verified() {
        let svc = Arc::new(MockService::new());
        let reg = registrar(svc.clone());
        let got = reg
            .register(Path::new("/m/a.gguf"), &sha('a'), "ModelA-Q4_K_M:latest")
            .await
            .unwrap();
        assert_eq!(got.name, "ModelA-Q4_K_M:latest");
        assert!(!got.reused && !got.disambiguated);
        assert_eq!(svc.import_count(), 1);
        let req = &svc.imports()[0];
        assert!(req.template.as_deref().unwrap_or_default().contains("<|im_start|>"));
        assert!(reg.is_registered("modela-q4_k_m").await.unwrap());
    }

    #[tokio::test]
    async fn identical_content_is_reused_without_import() {
        let svc = Arc::new(MockService::new().with_model("ModelA-Q4_K_M:latest", Some(&sha('a'))));
        let got = registrar(svc.clone())
            .register(Path::new("/m/a.gguf"), &sha('a'), "modela-q4_k_m")
            .await
            .unwrap();
        assert!(got.reused);
        assert_eq!(svc.import_count(), 0);
    }

    #[tokio::test]
    async fn different_content_gets_suffixed_name_and_converges() {
        let svc = Arc::new(MockService::new().with_model("ModelA-Q4_K_M:latest", Some(&sha('b'))));
        let reg = registrar(svc.clone());
        let first = reg
            .register(Path::new("/m/a.gguf"), &sha('a'), "ModelA-Q4_K_M:latest")
            .await
            .unwrap();
        assert_eq!(first.name, "ModelA-Q4_K_M-aaaaaaaa:latest");
        assert!(first.disambiguated);
        let second = reg
            .register(Path::new("/m/a.gguf"), &sha('a'), "ModelA-Q4_K_M:latest")
            .await
            .unwrap();
        assert_eq!(second.name, first.name);
        assert!(second.reused);
        assert_eq!(svc.import_count(), 1);
    }

    #[tokio::test]
    async fn double_clash_is_name_conflict() {
        let svc = Arc::new(
            MockService::new()
                .with_model("m:latest", Some(&sha('b')))
                .with_model("m-aaaaaaaa:latest", Some(&sha('c'))),
        );
        let err = registrar(svc.clone())
            .register(Path::new("/m/a.gguf"), &sha('a'), "m:latest")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            RegisterError::NameConflict {
                name: "m-aaaaaaaa:latest".into(),
                existing_digest: sha('c'),
            }
        );
        assert_eq!(svc.import_count(), 0);
    }

    #[tokio::test]
    async fn health_retries_then_gives_up() {
        let svc = Arc::new(MockService::new());
        svc.fail_health(2);
        let reg = registrar(svc.clone());
        reg.ensure_available().await.unwrap();
        assert_eq!(svc.health_calls(), 3);

        svc.set_offline(true);
        let err = reg
            .register(Path::new("/m/a.gguf"), &sha('a'), "m")
            .await
            .unwrap_err();
        assert!(matches!(err, RegisterError::ServiceUnavailable(_)));
        assert_eq!(svc.health_calls(), 6);
        assert_eq!(svc.import_count(), 0);
    }

    #[tokio::test]
    async fn unverified_import_is_import_failed() {
        let svc = Arc::new(MockService::new());
        svc.hide_imports(true);
        let err = registrar(svc.clone())
            .register(Path::new("/m/a.gguf"), &sha('a'), "ghost")
            .await
            .unwrap_err();
        assert!(matches!(err, RegisterError::ImportFailed(_)), "{err}");
        assert_eq!(svc.import_count(), 1);
    }

    #[tokio::test]
    async fn rejected_import_is_import_failed() {
        let svc = Arc::new(MockService::new());
        svc.fail_imports_with(Some(ServiceError::Rejected {
            status: 400,
            message: "bad gguf".into(),
        }));
        let err = registrar(svc)
            .register(Path::new("/m/a.gguf"), &sha('a'), "m")
            .await
            .unwrap_err();
        assert!(matches!(err, RegisterError::ImportFailed(ref m) if m.contains("bad gguf")));
    }

    #[tokio::test]
    async fn transient_import_errors_are_retried() {
        let svc = Arc::new(MockService::new());
        svc.fail_imports(2);
        let got = registrar(svc.clone())
            .register(Path::new("/m/a.gguf"), &sha('a'), "m:latest")
            .await
            .unwrap();
        assert_eq!(got.name, "m:latest");
        assert_eq!(svc.import_count(), 3);
        assert_eq!(svc.names(), vec!["m:latest".to_string()]);
    }

    #[tokio::test]
    async fn persistent_outage_during_import_gives_up_after_max_attempts() {
        let svc = Arc::new(MockService::new());
        svc.fail_imports_with(Some(ServiceError::Unavailable("blip".into())));
        let err = registrar(svc.clone())
            .register(Path::new("/m/a.gguf"), &sha('a'), "m")
            .await
            .unwrap_err();
        assert!(matches!(err, RegisterError::ServiceUnavailable(_)), "{err}");
        assert_eq!(svc.import_count(), 3);
    }

    #[tokio::test]
    async fn unregister_tolerates_missing_names() {
        let svc = Arc::new(MockService::new().with_model("m:latest", None));
        let reg = registrar(svc.clone());
        reg.unregister("m").await.unwrap();
        reg.unregister("m").await.unwrap();
        assert!(svc.names().is_empty());
    }
}
