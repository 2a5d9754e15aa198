//! Scenario catalog
//!
//! YAML files in the scenarios directory, parsed once at startup and served
//! read-only after that. A missing directory is an empty catalog; a file that
//! fails to parse is fatal, matching the template loader.

use std::collections::BTreeMap;
use std::path::Path;

use cks_model::Scenario;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("scenario directory '{0}': {1}")]
    Io(String, #[source] std::io::Error),
    #[error("scenario file '{0}': {1}")]
    Parse(String, #[source] serde_yaml::Error),
    #[error("duplicate scenario id '{0}'")]
    Duplicate(String),
}

pub struct ScenarioCatalog {
    scenarios: BTreeMap<String, Scenario>,
}

impl ScenarioCatalog {
    pub fn load(dir: &Path) -> Result<Self, CatalogError> {
        let mut scenarios = BTreeMap::new();

        if !dir.exists() {
            warn!(dir = %dir.display(), "scenario directory missing, catalog is empty");
            return Ok(ScenarioCatalog { scenarios });
        }

        let entries =
            std::fs::read_dir(dir).map_err(|e| CatalogError::Io(dir.display().to_string(), e))?;
        for entry in entries {
            let entry = entry.map_err(|e| CatalogError::Io(dir.display().to_string(), e))?;
            let path = entry.path();
            let is_yaml = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e == "yaml" || e == "yml");
            if !is_yaml {
                continue;
            }

            let body = std::fs::read_to_string(&path)
                .map_err(|e| CatalogError::Io(path.display().to_string(), e))?;
            let scenario: Scenario = serde_yaml::from_str(&body)
                .map_err(|e| CatalogError::Parse(path.display().to_string(), e))?;

            if scenarios.contains_key(&scenario.id) {
                return Err(CatalogError::Duplicate(scenario.id));
            }
            scenarios.insert(scenario.id.clone(), scenario);
        }

        info!(dir = %dir.display(), count = scenarios.len(), "loaded scenario catalog");
        Ok(ScenarioCatalog { scenarios })
    }

    /// Build a catalog from already-parsed scenarios (used by integration
    /// tests and embedded setups).
    pub fn from_scenarios(scenarios: Vec<Scenario>) -> Self {
        ScenarioCatalog {
            scenarios: scenarios.into_iter().map(|s| (s.id.clone(), s)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&Scenario> {
        self.scenarios.get(id)
    }

    pub fn list(&self) -> impl Iterator<Item = &Scenario> {
        self.scenarios.values()
    }

    pub fn categories(&self) -> Vec<String> {
        let mut cats: Vec<String> = self
            .scenarios
            .values()
            .map(|s| s.category.clone())
            .filter(|c| !c.is_empty())
            .collect();
        cats.sort();
        cats.dedup();
        cats
    }
}
