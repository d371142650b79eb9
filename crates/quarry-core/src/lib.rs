//! Model acquisition engine: catalog lookup, artifact download, service
//! registration and the legacy JSON migration, glued together by the
//! [`Orchestrator`].

pub mod catalog;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod hardware;
pub mod http_client;
pub mod migration;
pub mod ollama;
pub mod orchestrator;
pub mod registrar;
pub mod retry;
pub mod singleflight;
pub mod sources;
pub mod util;

#[cfg(test)]
mod test_support;

pub use catalog::{Catalog, CatalogEntry, CatalogFilter};
pub use config::{config_schema_json, load_config, Config, EffectivePaths, Settings};
pub use error::{
    AcquireError, CatalogError, ConfigError, FetchError, MigrationError, RegisterError,
    SkippedEntry,
};
pub use fetcher::{ArtifactFetcher, FetchedArtifact};
pub use hardware::{CapabilityReport, QuantizationChoice};
pub use migration::{BackupInfo, MigrationEngine, MigrationReport, MigrationStatus};
pub use ollama::OllamaService;
pub use orchestrator::{AcquireState, AcquisitionOutcome, AcquisitionRequest, Orchestrator, Removal};
pub use registrar::{RegisteredName, Registrar};
pub use retry::RetryConfig;
pub use sources::{ModelSource, RemoteFile, SharedSource};
