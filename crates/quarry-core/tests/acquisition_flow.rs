use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use httpmock::prelude::*;
use quarry_core::config::{DownloadSettings, SourceKind};
use quarry_core::sources::ModelScopeSource;
use quarry_core::{
    AcquireError, AcquireState, AcquisitionRequest, ArtifactFetcher, Catalog, FetchError,
    Orchestrator, Registrar, RetryConfig,
};
use quarry_events::Bus;
use quarry_kernel::Store;
use quarry_mock_service::MockService;
use quarry_topics::TOPIC_ACQUIRE_STATE;
use serde_json::json;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

const REPO: &str = "vendor/modelA";
const Q4_BODY: &[u8] = b"modelA weights at four bits";
const Q8_BODY: &[u8] = b"modelA weights at eight bits, somewhat larger";

const CATALOG: &str = r#"{
  "text": {
    "vendor": [
      {"id": "vendor/modelA", "name": "ModelA", "params": "7B", "params_b": 7.0,
       "ctx": 8192, "lang": ["en"], "quantizations": ["Q4_K_M", "Q8_0"],
       "file_pattern": "modelA-{quant}.gguf"}
    ]
  }
}"#;

fn sha_of(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn fast_retry(attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts: attempts,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

struct Harness {
    _dir: tempfile::TempDir,
    server: MockServer,
    service: Arc<MockService>,
    store: Store,
    bus: Bus,
    orchestrator: Arc<Orchestrator>,
    models_dir: PathBuf,
}

impl Harness {
    async fn new(disk_reserve_bytes: u64) -> Self {
        Self::with_parallel(disk_reserve_bytes, 2).await
    }

    async fn with_parallel(disk_reserve_bytes: u64, max_parallel: usize) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let models_dir = dir.path().join("models");
        let server = MockServer::start_async().await;
        let bus = Bus::new(512);
        let store = Store::open(&dir.path().join("db")).unwrap();
        let service = Arc::new(MockService::new());

        let settings = DownloadSettings {
            source: SourceKind::ModelScope,
            source_base_url: server.base_url(),
            max_parallel,
            retry: fast_retry(2),
            idle_timeout: Some(Duration::from_secs(30)),
            disk_reserve_bytes,
            request_timeout: Duration::from_secs(10),
        };
        let source = Arc::new(ModelScopeSource::new(server.base_url(), reqwest::Client::new()));
        let fetcher = ArtifactFetcher::with_client(
            &models_dir,
            source,
            settings,
            bus.clone(),
            reqwest::Client::new(),
        );
        let registrar = Registrar::with_retry(service.clone(), fast_retry(3), bus.clone());
        let orchestrator = Orchestrator::new(
            Arc::new(Catalog::from_json(CATALOG).unwrap()),
            store.clone(),
            Arc::new(fetcher),
            Arc::new(registrar),
            bus.clone(),
            max_parallel,
        );
        Self {
            _dir: dir,
            server,
            service,
            store,
            bus,
            orchestrator: Arc::new(orchestrator),
            models_dir,
        }
    }

    async fn mock_listing(&self) {
        self.server
            .mock_async(|when, then| {
                when.method(GET)
                    .path(format!("/api/v1/models/{REPO}/repo/files"));
                then.status(200).json_body(json!({
                    "Data": {"Files": [
                        {"Path": "README.md", "Size": 10, "Type": "blob"},
                        {"Path": "modelA-Q4_K_M.gguf", "Size": Q4_BODY.len(),
                         "Sha256": sha_of(Q4_BODY), "Type": "blob"},
                        {"Path": "modelA-Q8_0.gguf", "Size": Q8_BODY.len(),
                         "Sha256": sha_of(Q8_BODY), "Type": "blob"}
                    ]}
                }));
            })
            .await;
    }

    async fn mock_download(&self, file: &str, body: &'static [u8], delay: Option<Duration>) -> httpmock::Mock<'_> {
        let path = format!("/models/{REPO}/resolve/master/{file}");
        self.server
            .mock_async(|when, then| {
                when.method(GET).path(path);
                let then = then.status(200).body(body);
                if let Some(delay) = delay {
                    then.delay(delay);
                }
            })
            .await
    }

    fn canonical(&self, file: &str) -> PathBuf {
        self.models_dir.join("vendor_modelA").join(file)
    }
}

fn tmp_is_empty(models_dir: &Path) -> bool {
    std::fs::read_dir(models_dir.join("tmp"))
        .map(|mut d| d.next().is_none())
        .unwrap_or(true)
}

fn drain_states(events: &mut tokio::sync::broadcast::Receiver<quarry_events::Envelope>) -> Vec<String> {
    let mut states = Vec::new();
    while let Ok(env) = events.try_recv() {
        if env.kind == TOPIC_ACQUIRE_STATE {
            states.push(env.payload["state"].as_str().unwrap_or_default().to_string());
        }
    }
    states
}

#[tokio::test]
async fn two_quantizations_of_one_model() {
    let h = Harness::new(0).await;
    h.mock_listing().await;
    let q4 = h.mock_download("modelA-Q4_K_M.gguf", Q4_BODY, None).await;
    let q8 = h.mock_download("modelA-Q8_0.gguf", Q8_BODY, None).await;

    let first = h
        .orchestrator
        .acquire(AcquisitionRequest::exact("vendor/modelA", "Q4_K_M"))
        .await
        .unwrap();
    assert_eq!(first.state, AcquireState::Done);
    assert_eq!(first.key, "modela-q4_k_m");
    assert_eq!(first.record.service_name, "ModelA-Q4_K_M:latest");
    assert_eq!(first.record.artifact_path, h.canonical("modelA-Q4_K_M.gguf"));
    assert_eq!(first.record.sha256.as_deref(), Some(sha_of(Q4_BODY).as_str()));
    assert_eq!(first.record.bytes, Some(Q4_BODY.len() as u64));

    // the display name resolves to the same entry
    let second = h
        .orchestrator
        .acquire(AcquisitionRequest::exact("ModelA", "q8_0"))
        .await
        .unwrap();
    assert_eq!(second.state, AcquireState::Done);
    assert_eq!(second.key, "modela-q8_0");
    assert_eq!(second.record.service_name, "ModelA-Q8_0:latest");

    q4.assert_async().await;
    q8.assert_async().await;
    assert_eq!(h.store.list().unwrap().len(), 2);
    let mut names = h.service.names();
    names.sort();
    assert_eq!(names, vec!["ModelA-Q4_K_M:latest", "ModelA-Q8_0:latest"]);
    assert_eq!(std::fs::read(h.canonical("modelA-Q8_0.gguf")).unwrap(), Q8_BODY);
    assert!(tmp_is_empty(&h.models_dir));
}

#[tokio::test]
async fn repeat_acquire_is_already_done() {
    let h = Harness::new(0).await;
    h.mock_listing().await;
    let dl = h.mock_download("modelA-Q4_K_M.gguf", Q4_BODY, None).await;
    let req = AcquisitionRequest::exact("vendor/modelA", "Q4_K_M");

    let first = h.orchestrator.acquire(req.clone()).await.unwrap();
    let again = h.orchestrator.acquire(req).await.unwrap();

    assert_eq!(again.state, AcquireState::AlreadyDone);
    assert_eq!(again.record, first.record);
    assert_eq!(dl.hits_async().await, 1);
    assert_eq!(h.service.import_count(), 1);
}

#[tokio::test]
async fn missing_artifact_is_fetched_again_and_registration_reused() {
    let h = Harness::new(0).await;
    h.mock_listing().await;
    let dl = h.mock_download("modelA-Q4_K_M.gguf", Q4_BODY, None).await;
    let req = AcquisitionRequest::exact("vendor/modelA", "Q4_K_M");

    h.orchestrator.acquire(req.clone()).await.unwrap();
    std::fs::remove_file(h.canonical("modelA-Q4_K_M.gguf")).unwrap();

    let again = h.orchestrator.acquire(req).await.unwrap();
    assert_eq!(again.state, AcquireState::Done);
    assert_eq!(dl.hits_async().await, 2);
    // same digest under the same name: no second import
    assert_eq!(h.service.import_count(), 1);
    assert!(h.store.find("modela-q4_k_m").unwrap().unwrap().file_exists);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_callers_share_one_flight() {
    let h = Harness::new(0).await;
    h.mock_listing().await;
    let dl = h
        .mock_download("modelA-Q4_K_M.gguf", Q4_BODY, Some(Duration::from_millis(300)))
        .await;

    let mut events = h.bus.subscribe();
    let req = AcquisitionRequest::exact("vendor/modelA", "Q4_K_M");
    let (a, b) = tokio::join!(
        h.orchestrator.acquire(req.clone()),
        h.orchestrator.acquire(req.clone())
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!(a, b);
    assert_eq!(a.state, AcquireState::Done);
    assert_eq!(dl.hits_async().await, 1);
    assert_eq!(h.service.import_count(), 1);
    assert_eq!(h.store.list().unwrap().len(), 1);
    // the attached caller publishes no transitions of its own
    let states = drain_states(&mut events);
    assert_eq!(states.iter().filter(|s| *s == "REQUESTED").count(), 1);
    assert_eq!(states.iter().filter(|s| *s == "DONE").count(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelled_follower_detaches_without_stopping_the_leader() {
    let h = Harness::new(0).await;
    h.mock_listing().await;
    let dl = h
        .mock_download("modelA-Q4_K_M.gguf", Q4_BODY, Some(Duration::from_secs(2)))
        .await;
    let req = AcquisitionRequest::exact("vendor/modelA", "Q4_K_M");

    let orch = Arc::clone(&h.orchestrator);
    let leader_req = req.clone();
    let leader = tokio::spawn(async move { orch.acquire(leader_req).await });
    tokio::time::sleep(Duration::from_millis(200)).await;

    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let started = std::time::Instant::now();
    let err = h
        .orchestrator
        .acquire_with_cancel(req, cancelled)
        .await
        .unwrap_err();
    assert!(matches!(err, AcquireError::Cancelled), "{err}");
    assert!(started.elapsed() < Duration::from_secs(1));

    let outcome = leader.await.unwrap().unwrap();
    assert_eq!(outcome.state, AcquireState::Done);
    assert_eq!(dl.hits_async().await, 1);
    assert!(h.store.find("modela-q4_k_m").unwrap().is_some());
}

#[tokio::test]
async fn cancel_mid_transfer_commits_nothing() {
    let h = Harness::new(0).await;
    h.mock_listing().await;
    h.mock_download("modelA-Q4_K_M.gguf", Q4_BODY, Some(Duration::from_secs(5)))
        .await;
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });

    let err = h
        .orchestrator
        .acquire_with_cancel(AcquisitionRequest::exact("vendor/modelA", "Q4_K_M"), token)
        .await
        .unwrap_err();
    assert!(matches!(err, AcquireError::Cancelled), "{err}");
    assert_eq!(err.kind(), "cancelled");
    assert!(h.store.list().unwrap().is_empty());
    assert!(!h.canonical("modelA-Q4_K_M.gguf").exists());
    assert!(tmp_is_empty(&h.models_dir));
    assert_eq!(h.service.import_count(), 0);
}

#[tokio::test]
async fn cancel_after_registration_still_commits() {
    let h = Harness::new(0).await;
    h.mock_listing().await;
    h.mock_download("modelA-Q4_K_M.gguf", Q4_BODY, None).await;
    h.service.set_import_delay(Some(Duration::from_millis(300)));

    let token = CancellationToken::new();
    let trigger = token.clone();
    let mut events = h.bus.subscribe();
    tokio::spawn(async move {
        while let Ok(env) = events.recv().await {
            if env.kind == TOPIC_ACQUIRE_STATE && env.payload["state"] == "REGISTERING" {
                trigger.cancel();
                break;
            }
        }
    });

    let outcome = h
        .orchestrator
        .acquire_with_cancel(AcquisitionRequest::exact("vendor/modelA", "Q4_K_M"), token.clone())
        .await
        .unwrap();
    assert!(token.is_cancelled());
    assert_eq!(outcome.state, AcquireState::Done);
    let rec = h.store.find("modela-q4_k_m").unwrap().unwrap();
    assert_eq!(h.service.names(), vec![rec.service_name]);
}

#[tokio::test]
async fn fetches_beyond_max_parallel_wait_for_a_slot() {
    let h = Harness::with_parallel(0, 1).await;
    h.mock_listing().await;
    let delay = Duration::from_millis(400);
    let q4 = h.mock_download("modelA-Q4_K_M.gguf", Q4_BODY, Some(delay)).await;
    let q8 = h.mock_download("modelA-Q8_0.gguf", Q8_BODY, Some(delay)).await;

    let started = std::time::Instant::now();
    let (a, b) = tokio::join!(
        h.orchestrator.acquire(AcquisitionRequest::exact("vendor/modelA", "Q4_K_M")),
        h.orchestrator.acquire(AcquisitionRequest::exact("vendor/modelA", "Q8_0"))
    );
    let elapsed = started.elapsed();
    assert_eq!(a.unwrap().state, AcquireState::Done);
    assert_eq!(b.unwrap().state, AcquireState::Done);
    // one slot: the second transfer starts only after the first finishes
    assert!(elapsed >= delay * 2, "transfers overlapped: {elapsed:?}");
    q4.assert_async().await;
    q8.assert_async().await;
    assert_eq!(h.store.list().unwrap().len(), 2);
}

#[tokio::test]
async fn unverified_registration_writes_no_record() {
    let h = Harness::new(0).await;
    h.mock_listing().await;
    h.mock_download("modelA-Q4_K_M.gguf", Q4_BODY, None).await;
    h.service.hide_imports(true);

    let err = h
        .orchestrator
        .acquire(AcquisitionRequest::exact("vendor/modelA", "Q4_K_M"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "import_failed");
    assert_eq!(h.service.import_count(), 1);
    assert!(h.store.find("modela-q4_k_m").unwrap().is_none());
}

#[tokio::test]
async fn transient_import_failure_is_retried_to_success() {
    let h = Harness::new(0).await;
    h.mock_listing().await;
    h.mock_download("modelA-Q4_K_M.gguf", Q4_BODY, None).await;
    h.service.fail_imports(2);

    let outcome = h
        .orchestrator
        .acquire(AcquisitionRequest::exact("vendor/modelA", "Q4_K_M"))
        .await
        .unwrap();
    assert_eq!(outcome.state, AcquireState::Done);
    assert_eq!(h.service.import_count(), 3);
    assert!(h.store.find("modela-q4_k_m").unwrap().is_some());
}

#[tokio::test]
async fn disk_full_leaves_no_record_and_no_file() {
    let h = Harness::new(u64::MAX).await;
    h.mock_listing().await;
    let dl = h.mock_download("modelA-Q4_K_M.gguf", Q4_BODY, None).await;
    let mut events = h.bus.subscribe();

    let err = h
        .orchestrator
        .acquire(AcquisitionRequest::exact("vendor/modelA", "Q4_K_M"))
        .await
        .unwrap_err();
    assert!(matches!(err, AcquireError::Fetch(FetchError::DiskFull(_))), "{err}");
    assert_eq!(err.kind(), "disk_full");
    assert_eq!(dl.hits_async().await, 0);
    assert!(h.store.find("modela-q4_k_m").unwrap().is_none());
    assert!(!h.canonical("modelA-Q4_K_M.gguf").exists());
    assert!(h.service.names().is_empty());

    assert_eq!(
        drain_states(&mut events),
        vec!["REQUESTED", "CHECKING_RECORD", "FETCHING", "FAILED"]
    );
}

#[tokio::test]
async fn unknown_model_and_quantization_are_rejected_early() {
    let h = Harness::new(0).await;
    let err = h
        .orchestrator
        .acquire(AcquisitionRequest::exact("vendor/nope", "Q4_K_M"))
        .await
        .unwrap_err();
    assert!(matches!(err, AcquireError::NotFound(_)));

    let err = h
        .orchestrator
        .acquire(AcquisitionRequest::exact("vendor/modelA", "Q2_K"))
        .await
        .unwrap_err();
    assert!(matches!(err, AcquireError::UnsupportedQuantization { .. }));
}

#[tokio::test]
async fn service_outage_fails_without_commit() {
    let h = Harness::new(0).await;
    h.mock_listing().await;
    h.mock_download("modelA-Q4_K_M.gguf", Q4_BODY, None).await;
    h.service.set_offline(true);

    let err = h
        .orchestrator
        .acquire(AcquisitionRequest::exact("vendor/modelA", "Q4_K_M"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "service_unavailable");
    assert!(h.store.find("modela-q4_k_m").unwrap().is_none());
    // the verified artifact stays for the next attempt
    assert!(h.canonical("modelA-Q4_K_M.gguf").is_file());
}

#[tokio::test]
async fn committed_record_matches_service_and_disk() {
    let h = Harness::new(0).await;
    h.mock_listing().await;
    h.mock_download("modelA-Q4_K_M.gguf", Q4_BODY, None).await;
    h.orchestrator
        .acquire(AcquisitionRequest::exact("vendor/modelA", "Q4_K_M"))
        .await
        .unwrap();

    for rec in h.store.list().unwrap() {
        assert!(rec.artifact_path.is_file());
        assert!(h
            .orchestrator
            .registrar()
            .is_registered(&rec.service_name)
            .await
            .unwrap());
    }
}

#[tokio::test]
async fn remove_deletes_file_name_and_record() {
    let h = Harness::new(0).await;
    h.mock_listing().await;
    h.mock_download("modelA-Q4_K_M.gguf", Q4_BODY, None).await;
    h.orchestrator
        .acquire(AcquisitionRequest::exact("vendor/modelA", "Q4_K_M"))
        .await
        .unwrap();

    let removal = h.orchestrator.remove("modela-q4_k_m").await.unwrap();
    assert!(removal.file_removed);
    assert!(removal.unregistered);
    assert!(h.store.find("modela-q4_k_m").unwrap().is_none());
    assert!(h.service.names().is_empty());
    assert!(!h.models_dir.join("vendor_modelA").exists());

    assert!(matches!(
        h.orchestrator.remove("modela-q4_k_m").await,
        Err(AcquireError::NotFound(_))
    ));
}

#[tokio::test]
async fn verify_flags_missing_artifacts() {
    let h = Harness::new(0).await;
    h.mock_listing().await;
    h.mock_download("modelA-Q4_K_M.gguf", Q4_BODY, None).await;
    h.orchestrator
        .acquire(AcquisitionRequest::exact("vendor/modelA", "Q4_K_M"))
        .await
        .unwrap();
    std::fs::remove_file(h.canonical("modelA-Q4_K_M.gguf")).unwrap();

    let verified = h.orchestrator.verify_records().await.unwrap();
    assert_eq!(verified.len(), 1);
    assert!(!verified[0].file_exists);
    assert!(!h.store.find("modela-q4_k_m").unwrap().unwrap().file_exists);
}
