//! Acquisition Orchestrator.
//!
//! Per `(model, quantization)` key the request moves through
//! `REQUESTED -> CHECKING_RECORD -> {ALREADY_DONE | FETCHING} -> FETCHED ->
//! REGISTERING -> {DONE | FAILED}`. Each transition is published on
//! [`TOPIC_ACQUIRE_STATE`]. The download record is written only after the
//! service confirms registration, and that write is the commit point.
//!
//! Only the leader of a key publishes transitions. A cancel is honoured up to
//! the start of registration; once the service holds the name the record is
//! committed.

use std::path::Path;
use std::sync::Arc;

use quarry_events::Bus;
use quarry_kernel::{DownloadRecord, Store, StoreError};
use quarry_topics::{
    TOPIC_ACQUIRE_COMPLETED, TOPIC_ACQUIRE_FAILED, TOPIC_ACQUIRE_STATE, TOPIC_RECORDS_CHANGED,
    TOPIC_RECORDS_VERIFIED,
};
use serde::Serialize;
use serde_json::json;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::catalog::{Catalog, CatalogEntry};
use crate::error::{AcquireError, FetchError};
use crate::fetcher::{ArtifactFetcher, FetchedArtifact};
use crate::hardware::{resolve_quantization, CapabilityReport, QuantizationChoice};
use crate::registrar::Registrar;
use crate::singleflight::Singleflight;
use crate::util::now_rfc3339;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AcquireState {
    Requested,
    CheckingRecord,
    AlreadyDone,
    Fetching,
    Fetched,
    Registering,
    Done,
    Failed,
}

impl AcquireState {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcquireState::Requested => "REQUESTED",
            AcquireState::CheckingRecord => "CHECKING_RECORD",
            AcquireState::AlreadyDone => "ALREADY_DONE",
            AcquireState::Fetching => "FETCHING",
            AcquireState::Fetched => "FETCHED",
            AcquireState::Registering => "REGISTERING",
            AcquireState::Done => "DONE",
            AcquireState::Failed => "FAILED",
        }
    }
}

/// Target model (catalog id or display name) and quantization policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionRequest {
    pub model: String,
    pub quantization: QuantizationChoice,
}

impl AcquisitionRequest {
    pub fn new(model: impl Into<String>, quantization: QuantizationChoice) -> Self {
        Self {
            model: model.into(),
            quantization,
        }
    }

    pub fn exact(model: impl Into<String>, quantization: impl Into<String>) -> Self {
        Self::new(model, QuantizationChoice::Exact(quantization.into()))
    }

    pub fn best_available(model: impl Into<String>) -> Self {
        Self::new(model, QuantizationChoice::BestAvailable)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AcquisitionOutcome {
    pub key: String,
    /// `ALREADY_DONE` or `DONE`.
    pub state: AcquireState,
    pub record: DownloadRecord,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Removal {
    pub key: String,
    pub file_removed: bool,
    pub unregistered: bool,
}

#[derive(Serialize)]
struct StateEvent<'a> {
    key: &'a str,
    model_id: &'a str,
    quantization: &'a str,
    state: AcquireState,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_kind: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

struct Job<'a> {
    entry: &'a CatalogEntry,
    quantization: &'a str,
    key: &'a str,
}

type SharedOutcome = Result<AcquisitionOutcome, AcquireError>;

pub struct Orchestrator {
    catalog: Arc<Catalog>,
    store: Store,
    fetcher: Arc<ArtifactFetcher>,
    registrar: Arc<Registrar>,
    bus: Bus,
    flights: Singleflight<SharedOutcome>,
    fetch_slots: Arc<Semaphore>,
    hardware: Option<CapabilityReport>,
}

impl Orchestrator {
    pub fn new(
        catalog: Arc<Catalog>,
        store: Store,
        fetcher: Arc<ArtifactFetcher>,
        registrar: Arc<Registrar>,
        bus: Bus,
        max_parallel: usize,
    ) -> Self {
        Self {
            catalog,
            store,
            fetcher,
            registrar,
            bus,
            flights: Singleflight::new(),
            fetch_slots: Arc::new(Semaphore::new(max_parallel.max(1))),
            hardware: None,
        }
    }

    /// Hardware report used for best-available quantization.
    pub fn with_hardware(mut self, report: Option<CapabilityReport>) -> Self {
        self.hardware = report;
        self
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn registrar(&self) -> &Arc<Registrar> {
        &self.registrar
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub async fn acquire(&self, req: AcquisitionRequest) -> SharedOutcome {
        self.acquire_with_cancel(req, CancellationToken::new()).await
    }

    /// Cancelling the token stops the attempt at the next suspension point.
    /// Concurrent callers attached to the same key share that outcome; a
    /// follower that cancels detaches without affecting the leader.
    pub async fn acquire_with_cancel(
        &self,
        req: AcquisitionRequest,
        cancel: CancellationToken,
    ) -> SharedOutcome {
        let entry = self
            .catalog
            .resolve(&req.model)
            .map_err(|_| AcquireError::NotFound(req.model.clone()))?;
        let quantization = resolve_quantization(
            &entry.quantizations,
            entry.params_b,
            &req.quantization,
            self.hardware.as_ref(),
        )
        .ok_or_else(|| AcquireError::UnsupportedQuantization {
            model_id: entry.id.clone(),
            quantization: match &req.quantization {
                QuantizationChoice::Exact(label) => label.clone(),
                QuantizationChoice::BestAvailable => "best".into(),
            },
        })?;
        let key = entry.record_key(&quantization);
        let job = Job {
            entry: &entry,
            quantization: &quantization,
            key: &key,
        };
        let mut flight = self.flights.begin(&key);
        if !flight.is_leader() {
            info!(key = %key, "attaching to in-flight acquisition");
            return tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!(key = %key, "follower cancelled; leaving the flight");
                    Err(AcquireError::Cancelled)
                }
                out = flight.wait() => out.unwrap_or(Err(AcquireError::Abandoned)),
            };
        }
        self.publish_state(&job, AcquireState::Requested, None);

        let result = self.run(&job, &cancel).await;
        flight.complete(result.clone());
        match &result {
            Ok(outcome) => {
                self.bus.publish(TOPIC_ACQUIRE_COMPLETED, outcome);
            }
            Err(err) => {
                error!(
                    key = %key,
                    model_id = %entry.id,
                    quantization = %quantization,
                    stage = stage_of(err),
                    kind = err.kind(),
                    error = %err,
                    "acquisition failed"
                );
                self.publish_state(&job, AcquireState::Failed, Some(err));
                self.bus.publish(
                    TOPIC_ACQUIRE_FAILED,
                    &json!({"key": key, "kind": err.kind(), "error": err.to_string()}),
                );
            }
        }
        result
    }

    async fn run(&self, job: &Job<'_>, cancel: &CancellationToken) -> SharedOutcome {
        self.publish_state(job, AcquireState::CheckingRecord, None);
        if let Some(record) = self.check_record(job.key).await? {
            self.publish_state(job, AcquireState::AlreadyDone, None);
            return Ok(AcquisitionOutcome {
                key: job.key.to_string(),
                state: AcquireState::AlreadyDone,
                record,
            });
        }

        self.publish_state(job, AcquireState::Fetching, None);
        let fetched = self.fetch(job, cancel).await?;
        self.publish_state(job, AcquireState::Fetched, None);
        if cancel.is_cancelled() {
            return Err(AcquireError::Cancelled);
        }

        self.publish_state(job, AcquireState::Registering, None);
        let registered = self
            .registrar
            .register(&fetched.path, &fetched.sha256, &job.entry.service_name(job.quantization))
            .await?;
        // The service already holds the name; commit so it is not orphaned.
        if cancel.is_cancelled() {
            info!(key = job.key, "cancel arrived after registration; committing anyway");
        }

        let record = DownloadRecord {
            key: job.key.to_string(),
            model_name: job.entry.name.clone(),
            service_name: registered.name,
            artifact_path: fetched.path,
            quantization: job.quantization.to_string(),
            model_id: Some(job.entry.id.clone()),
            sha256: Some(fetched.sha256),
            bytes: Some(fetched.bytes),
            downloaded_at: now_rfc3339(),
            file_exists: true,
        };
        self.store
            .put_async(&record)
            .await
            .map_err(|e| AcquireError::store("commit", e))?;
        self.bus.publish(
            TOPIC_RECORDS_CHANGED,
            &json!({"key": job.key, "action": "put"}),
        );
        self.publish_state(job, AcquireState::Done, None);
        info!(key = job.key, service_name = %record.service_name, "acquisition committed");
        Ok(AcquisitionOutcome {
            key: job.key.to_string(),
            state: AcquireState::Done,
            record,
        })
    }

    /// A record counts only when its flag is set and a fresh stat agrees.
    async fn check_record(&self, key: &str) -> Result<Option<DownloadRecord>, AcquireError> {
        let stored = self
            .store
            .find_async(key)
            .await
            .map_err(|e| AcquireError::store("check_record", e))?;
        match stored {
            Some(rec) if rec.file_exists => {
                let fresh = self
                    .store
                    .recheck_existence_async(key)
                    .await
                    .map_err(|e| AcquireError::store("check_record", e))?;
                Ok(fresh.filter(|r| r.file_exists))
            }
            _ => Ok(None),
        }
    }

    async fn fetch(
        &self,
        job: &Job<'_>,
        cancel: &CancellationToken,
    ) -> Result<FetchedArtifact, AcquireError> {
        let _permit = tokio::select! {
            permit = Arc::clone(&self.fetch_slots).acquire_owned() => {
                permit.map_err(|_| AcquireError::Cancelled)?
            }
            _ = cancel.cancelled() => return Err(AcquireError::Cancelled),
        };
        self.fetcher
            .fetch(&job.entry.id, &job.entry.file_pattern, job.quantization, cancel)
            .await
            .map_err(|err| match err {
                FetchError::Cancelled => AcquireError::Cancelled,
                other => AcquireError::Fetch(other),
            })
    }

    fn publish_state(&self, job: &Job<'_>, state: AcquireState, err: Option<&AcquireError>) {
        self.bus.publish(
            TOPIC_ACQUIRE_STATE,
            &StateEvent {
                key: job.key,
                model_id: &job.entry.id,
                quantization: job.quantization,
                state,
                error_kind: err.map(AcquireError::kind),
                error: err.map(ToString::to_string),
            },
        );
    }

    /// Delete the artifact, unregister its service name (best-effort), then
    /// drop the record.
    pub async fn remove(&self, key: &str) -> Result<Removal, AcquireError> {
        let record = self
            .store
            .find_async(key)
            .await
            .map_err(|e| AcquireError::store("remove", e))?
            .ok_or_else(|| AcquireError::NotFound(key.to_string()))?;
        let file_removed = remove_artifact(&record.artifact_path, self.fetcher.models_dir()).await;
        let unregistered = match self.registrar.unregister(&record.service_name).await {
            Ok(()) => true,
            Err(err) => {
                warn!(key, service_name = %record.service_name, %err, "unregister failed; continuing");
                false
            }
        };
        self.store
            .delete_async(key)
            .await
            .map_err(|e| AcquireError::store("remove", e))?;
        self.bus.publish(
            TOPIC_RECORDS_CHANGED,
            &json!({"key": key, "action": "delete"}),
        );
        info!(key, file_removed, unregistered, "download record removed");
        Ok(Removal {
            key: key.to_string(),
            file_removed,
            unregistered,
        })
    }

    /// Re-stat every record's artifact and persist changed existence flags.
    pub async fn verify_records(&self) -> Result<Vec<DownloadRecord>, StoreError> {
        let mut verified = Vec::new();
        for rec in self.store.list_async().await? {
            if let Some(fresh) = self.store.recheck_existence_async(&rec.key).await? {
                verified.push(fresh);
            }
        }
        let missing = verified.iter().filter(|r| !r.file_exists).count();
        self.bus.publish(
            TOPIC_RECORDS_VERIFIED,
            &json!({"total": verified.len(), "missing": missing}),
        );
        Ok(verified)
    }
}

fn stage_of(err: &AcquireError) -> &'static str {
    match err {
        AcquireError::NotFound(_) | AcquireError::UnsupportedQuantization { .. } => "resolve",
        AcquireError::Fetch(_) => "fetch",
        AcquireError::Register(_) => "register",
        AcquireError::Store { stage, .. } => *stage,
        AcquireError::Cancelled => "cancelled",
        AcquireError::Abandoned => "attach",
    }
}

/// Remove the file, then its directory if that is now empty and lies under `models_dir`.
async fn remove_artifact(path: &Path, models_dir: &Path) -> bool {
    let removed = match tokio::fs::remove_file(path).await {
        Ok(()) => true,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
        Err(err) => {
            warn!(path = %path.display(), %err, "artifact delete failed");
            false
        }
    };
    if let Some(dir) = path.parent() {
        if dir != models_dir && dir.starts_with(models_dir) {
            // remove_dir refuses non-empty directories, which keeps sibling quantizations.
            let _ = tokio::fs::remove_dir(dir).await;
        }
    }
    removed
}
