use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use quarry_runtime::{
    normalize_model_name, ImportRequest, InferenceService, ServiceError, ServiceModel,
    ServiceState, ServiceStatus,
};

/// In-memory service namespace with knobs for outages and broken imports.
#[derive(Default)]
pub struct MockService {
    models: Mutex<BTreeMap<String, ServiceModel>>,
    imports: Mutex<Vec<ImportRequest>>,
    health_calls: AtomicUsize,
    failing_health: AtomicUsize,
    failing_imports: AtomicUsize,
    offline: Mutex<bool>,
    hide_imports: Mutex<bool>,
    import_error: Mutex<Option<ServiceError>>,
    import_delay: Mutex<Option<Duration>>,
}

impl MockService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-register a name as if it had been imported from `source_digest`.
    pub fn with_model(self, name: &str, source_digest: Option<&str>) -> Self {
        self.models.lock().insert(
            normalize_model_name(name),
            ServiceModel {
                name: name.to_string(),
                digest: None,
                source_digest: source_digest.map(str::to_string),
                size: None,
            },
        );
        self
    }

    /// Fail the next `n` health probes before becoming ready.
    pub fn fail_health(&self, n: usize) {
        self.failing_health.store(n, Ordering::SeqCst);
    }

    pub fn set_offline(&self, offline: bool) {
        *self.offline.lock() = offline;
    }

    /// Accept imports without making the name visible afterwards.
    pub fn hide_imports(&self, hide: bool) {
        *self.hide_imports.lock() = hide;
    }

    /// Answer the next `n` imports with a transient outage.
    pub fn fail_imports(&self, n: usize) {
        self.failing_imports.store(n, Ordering::SeqCst);
    }

    pub fn fail_imports_with(&self, err: Option<ServiceError>) {
        *self.import_error.lock() = err;
    }

    pub fn set_import_delay(&self, delay: Option<Duration>) {
        *self.import_delay.lock() = delay;
    }

    pub fn import_count(&self) -> usize {
        self.imports.lock().len()
    }

    pub fn imports(&self) -> Vec<ImportRequest> {
        self.imports.lock().clone()
    }

    pub fn health_calls(&self) -> usize {
        self.health_calls.load(Ordering::SeqCst)
    }

    pub fn names(&self) -> Vec<String> {
        self.models.lock().values().map(|m| m.name.clone()).collect()
    }

    fn check_online(&self) -> Result<(), ServiceError> {
        if *self.offline.lock() {
            return Err(ServiceError::Unavailable("mock service offline".into()));
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl InferenceService for MockService {
    fn id(&self) -> &str {
        "mock.service"
    }

    async fn health(&self) -> Result<ServiceStatus, ServiceError> {
        self.health_calls.fetch_add(1, Ordering::SeqCst);
        self.check_online()?;
        let failing = self.failing_health.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_health.store(failing - 1, Ordering::SeqCst);
            return Err(ServiceError::Unavailable("mock service starting".into()));
        }
        Ok(ServiceStatus::new("mock://service", ServiceState::Ready)
            .with_summary("Mock service ready")
            .with_version("mock"))
    }

    async fn list(&self) -> Result<Vec<ServiceModel>, ServiceError> {
        self.check_online()?;
        Ok(self.models.lock().values().cloned().collect())
    }

    async fn describe(&self, name: &str) -> Result<Option<ServiceModel>, ServiceError> {
        self.check_online()?;
        Ok(self.models.lock().get(&normalize_model_name(name)).cloned())
    }

    async fn import(&self, req: &ImportRequest) -> Result<(), ServiceError> {
        self.check_online()?;
        let delay = *self.import_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.imports.lock().push(req.clone());
        let failing = self.failing_imports.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_imports.store(failing - 1, Ordering::SeqCst);
            return Err(ServiceError::Unavailable("mock import interrupted".into()));
        }
        if let Some(err) = self.import_error.lock().clone() {
            return Err(err);
        }
        if *self.hide_imports.lock() {
            tracing::debug!(name = %req.name, "mock import accepted but hidden");
            return Ok(());
        }
        self.models.lock().insert(
            normalize_model_name(&req.name),
            ServiceModel {
                name: req.name.clone(),
                digest: Some(format!("sha256:{}", req.sha256)),
                source_digest: Some(req.sha256.clone()),
                size: std::fs::metadata(&req.artifact_path).ok().map(|m| m.len()),
            },
        );
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), ServiceError> {
        self.check_online()?;
        match self.models.lock().remove(&normalize_model_name(name)) {
            Some(_) => Ok(()),
            None => Err(ServiceError::NotFound(name.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str) -> ImportRequest {
        ImportRequest {
            name: name.to_string(),
            artifact_path: "/nonexistent/model.gguf".into(),
            sha256: "ab".repeat(32),
            template: None,
            parameters: Default::default(),
        }
    }

    #[tokio::test]
    async fn import_then_list_and_remove() {
        let svc = MockService::new();
        svc.import(&request("m-q4_k_m:latest")).await.unwrap();
        assert_eq!(svc.import_count(), 1);
        let found = svc.describe("M-Q4_K_M").await.unwrap().unwrap();
        assert_eq!(found.source_digest.as_deref(), Some("ab".repeat(32).as_str()));
        assert_eq!(svc.list().await.unwrap().len(), 1);
        svc.remove("m-q4_k_m").await.unwrap();
        assert!(matches!(
            svc.remove("m-q4_k_m").await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn health_recovers_after_failures() {
        let svc = MockService::new();
        svc.fail_health(2);
        assert!(svc.health().await.is_err());
        assert!(svc.health().await.is_err());
        assert!(svc.health().await.unwrap().is_ready());
        assert_eq!(svc.health_calls(), 3);
    }

    #[tokio::test]
    async fn failing_imports_recover() {
        let svc = MockService::new();
        svc.fail_imports(1);
        assert!(svc.import(&request("m")).await.unwrap_err().is_transient());
        svc.import(&request("m")).await.unwrap();
        assert_eq!(svc.import_count(), 2);
        assert_eq!(svc.names(), vec!["m".to_string()]);
    }

    #[tokio::test]
    async fn hidden_imports_are_not_listed() {
        let svc = MockService::new();
        svc.hide_imports(true);
        svc.import(&request("ghost")).await.unwrap();
        assert!(svc.describe("ghost").await.unwrap().is_none());
        svc.set_offline(true);
        assert!(svc.list().await.is_err());
    }
}
