use std::sync::Arc;

use anyhow::{Context, Result};
use quarry_core::sources::source_for;
use quarry_core::{
    ArtifactFetcher, CapabilityReport, Catalog, MigrationEngine, OllamaService, Orchestrator,
    Registrar, Settings,
};
use quarry_events::Bus;
use quarry_kernel::Store;

/// Components wired from one resolved [`Settings`].
pub struct Engine {
    pub settings: Settings,
    pub store: Store,
    pub bus: Bus,
}

impl Engine {
    pub fn open(settings: Settings) -> Result<Self> {
        let store = Store::open(&settings.paths.db_dir).with_context(|| {
            format!("opening store in {}", settings.paths.db_dir.display())
        })?;
        Ok(Self {
            settings,
            store,
            bus: Bus::default(),
        })
    }

    pub fn catalog(&self) -> Result<Arc<Catalog>> {
        let path = &self.settings.paths.catalog_file;
        let catalog =
            Catalog::load(path).with_context(|| format!("loading catalog {}", path.display()))?;
        Ok(Arc::new(catalog))
    }

    pub fn registrar(&self) -> Result<Arc<Registrar>> {
        let svc = &self.settings.service;
        let service = OllamaService::new(&svc.base_url, svc.health_timeout, svc.import_timeout)
            .context("building inference service client")?;
        Ok(Arc::new(Registrar::new(Arc::new(service), svc, self.bus.clone())))
    }

    pub fn orchestrator(
        &self,
        catalog: Arc<Catalog>,
        hardware: Option<CapabilityReport>,
    ) -> Result<Orchestrator> {
        let dl = &self.settings.download;
        let source = source_for(dl).context("building model source client")?;
        let fetcher = ArtifactFetcher::new(
            &self.settings.paths.models_dir,
            source,
            dl.clone(),
            self.bus.clone(),
        )
        .context("building download client")?;
        Ok(Orchestrator::new(
            catalog,
            self.store.clone(),
            Arc::new(fetcher),
            self.registrar()?,
            self.bus.clone(),
            dl.max_parallel,
        )
        .with_hardware(hardware))
    }

    pub fn migration(&self) -> MigrationEngine {
        MigrationEngine::new(self.store.clone(), &self.settings.paths, self.bus.clone())
    }
}
