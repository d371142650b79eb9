//! Read-mostly description of acquirable models.
//!
//! The data file nests entries as `category -> subcategory -> [entry]`. A
//! [`Catalog`] holds an immutable snapshot behind an `Arc`; [`Catalog::reload`]
//! parses a complete replacement and swaps it in, so readers never observe a
//! partially updated set.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::CatalogError;
use crate::hardware::CapabilityReport;

pub const QUANT_PLACEHOLDER: &str = "{quant}";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CatalogEntry {
    pub id: String,
    pub category: String,
    pub subcategory: String,
    pub name: String,
    pub params: String,
    pub params_b: f64,
    pub ctx: u64,
    pub lang: BTreeSet<String>,
    pub distilled: bool,
    pub quantizations: Vec<String>,
    pub file_pattern: String,
}

impl CatalogEntry {
    pub fn filename_for(&self, quantization: &str) -> String {
        self.file_pattern.replace(QUANT_PLACEHOLDER, quantization)
    }

    /// Name the artifact is registered under in the inference service.
    pub fn service_name(&self, quantization: &str) -> String {
        format!("{}-{}:latest", self.name.trim().replace(' ', "-"), quantization)
    }

    pub fn record_key(&self, quantization: &str) -> String {
        quarry_kernel::record_key(&self.name, quantization)
    }
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    id: String,
    name: String,
    #[serde(default)]
    params: String,
    #[serde(default)]
    params_b: f64,
    #[serde(default)]
    ctx: u64,
    #[serde(default)]
    lang: Vec<String>,
    #[serde(default)]
    distilled: bool,
    #[serde(default)]
    quantizations: Vec<String>,
    #[serde(default)]
    file_pattern: String,
}

type RawCatalog = BTreeMap<String, BTreeMap<String, Vec<RawEntry>>>;

#[derive(Debug, Default)]
struct Snapshot {
    /// Sorted by `params_b` ascending, then id.
    entries: Vec<CatalogEntry>,
    tree: BTreeMap<String, BTreeSet<String>>,
}

impl Snapshot {
    fn parse(json: &str) -> Result<Self, CatalogError> {
        let raw: RawCatalog = serde_json::from_str(json)?;
        let mut seen = HashSet::new();
        let mut entries = Vec::new();
        let mut tree: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (category, subs) in raw {
            let slot = tree.entry(category.clone()).or_default();
            for (subcategory, models) in subs {
                slot.insert(subcategory.clone());
                for m in models {
                    let id = m.id.trim().to_string();
                    if id.is_empty() {
                        return Err(CatalogError::Invalid {
                            id: m.name,
                            reason: "missing id".into(),
                        });
                    }
                    if !seen.insert(id.clone()) {
                        return Err(CatalogError::Invalid {
                            id,
                            reason: "duplicate id".into(),
                        });
                    }
                    if !m.params_b.is_finite() || m.params_b < 0.0 {
                        return Err(CatalogError::Invalid {
                            id,
                            reason: format!("bad params_b {}", m.params_b),
                        });
                    }
                    entries.push(CatalogEntry {
                        id,
                        category: category.clone(),
                        subcategory: subcategory.clone(),
                        name: m.name,
                        params: m.params,
                        params_b: m.params_b,
                        ctx: m.ctx,
                        lang: m.lang.into_iter().map(|l| l.to_ascii_lowercase()).collect(),
                        distilled: m.distilled,
                        quantizations: m.quantizations,
                        file_pattern: m.file_pattern,
                    });
                }
            }
        }
        entries.sort_by(|a, b| a.params_b.total_cmp(&b.params_b).then_with(|| a.id.cmp(&b.id)));
        Ok(Self { entries, tree })
    }
}

#[derive(Debug, Clone, Default)]
pub struct CatalogFilter {
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub max_params_b: Option<f64>,
    pub min_context: Option<u64>,
    pub language: Option<String>,
    pub hardware: Option<CapabilityReport>,
}

impl CatalogFilter {
    fn ceiling(&self) -> Option<f64> {
        let hw = self.hardware.as_ref().map(CapabilityReport::max_params_b);
        match (self.max_params_b, hw) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn matches(&self, entry: &CatalogEntry, ceiling: Option<f64>) -> bool {
        if let Some(cat) = &self.category {
            if !entry.category.eq_ignore_ascii_case(cat) {
                return false;
            }
        }
        if let Some(sub) = &self.subcategory {
            if !entry.subcategory.eq_ignore_ascii_case(sub) {
                return false;
            }
        }
        if let Some(max) = ceiling {
            if entry.params_b > max {
                return false;
            }
        }
        if let Some(min) = self.min_context {
            if entry.ctx < min {
                return false;
            }
        }
        if let Some(lang) = &self.language {
            if !entry.lang.contains(&lang.to_ascii_lowercase()) {
                return false;
            }
        }
        true
    }
}

/// Lazy, restartable walk over one catalog snapshot. Clone to restart.
#[derive(Debug, Clone)]
pub struct CatalogIter {
    snapshot: Arc<Snapshot>,
    filter: CatalogFilter,
    ceiling: Option<f64>,
    pos: usize,
}

impl Iterator for CatalogIter {
    type Item = CatalogEntry;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(entry) = self.snapshot.entries.get(self.pos) {
            self.pos += 1;
            if self.filter.matches(entry, self.ceiling) {
                return Some(entry.clone());
            }
        }
        None
    }
}

#[derive(Debug, Default)]
pub struct Catalog {
    snapshot: RwLock<Arc<Snapshot>>,
}

impl Catalog {
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        Ok(Self {
            snapshot: RwLock::new(Arc::new(Snapshot::parse(json)?)),
        })
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        Self::from_json(&read_catalog(path)?)
    }

    /// Parse `path` completely, then swap it in. On error the current data stays.
    pub fn reload(&self, path: &Path) -> Result<usize, CatalogError> {
        let fresh = Snapshot::parse(&read_catalog(path)?)?;
        let count = fresh.entries.len();
        *self.snapshot.write() = Arc::new(fresh);
        tracing::info!(path = %path.display(), entries = count, "catalog reloaded");
        Ok(count)
    }

    fn current(&self) -> Arc<Snapshot> {
        Arc::clone(&self.snapshot.read())
    }

    pub fn len(&self) -> usize {
        self.current().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lookup(&self, model_id: &str) -> Result<CatalogEntry, CatalogError> {
        self.current()
            .entries
            .iter()
            .find(|e| e.id == model_id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(model_id.to_string()))
    }

    /// Exact display-name match first, then case-insensitive.
    pub fn lookup_by_name(&self, name: &str) -> Result<CatalogEntry, CatalogError> {
        let snap = self.current();
        snap.entries
            .iter()
            .find(|e| e.name == name)
            .or_else(|| snap.entries.iter().find(|e| e.name.eq_ignore_ascii_case(name)))
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(name.to_string()))
    }

    /// Accepts either a remote id or a display name.
    pub fn resolve(&self, id_or_name: &str) -> Result<CatalogEntry, CatalogError> {
        self.lookup(id_or_name)
            .or_else(|_| self.lookup_by_name(id_or_name))
    }

    pub fn categories(&self) -> Vec<String> {
        self.current().tree.keys().cloned().collect()
    }

    pub fn subcategories(&self, category: &str) -> Vec<String> {
        self.current()
            .tree
            .get(category)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Entries matching `filter`, ordered by parameter size ascending.
    pub fn list(&self, filter: CatalogFilter) -> CatalogIter {
        let ceiling = filter.ceiling();
        CatalogIter {
            snapshot: self.current(),
            filter,
            ceiling,
            pos: 0,
        }
    }
}

fn read_catalog(path: &Path) -> Result<String, CatalogError> {
    std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    })
}
