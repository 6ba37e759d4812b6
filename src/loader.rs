//! Engine configuration and scenario discovery.
//!
//! Scenario files are JSON documents named `test_<name>.<suffix>.json`
//! (suffix defaults to `http`). Loading a file resolves its references,
//! deserializes the model, and runs validation; any failure is fatal
//! for that scenario.

use crate::error::{Error, Result};
use crate::model::Scenario;
use crate::resolver::RefResolver;
use anyhow::Context as _;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Recognized engine options with their defaults.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Scenario file suffix: `test_<name>.<suffix>.json`.
    pub suffix: String,
    /// Upward `..` segments a `$ref` may traverse.
    pub ref_parent_traversal_depth: usize,
    /// Element budget for expression comprehensions.
    pub max_comprehension_length: usize,
    /// Joined onto relative request URLs.
    pub base_url: Option<String>,
    /// Directory all file references are confined to; defaults to the
    /// scenario file's directory.
    pub root_path: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            suffix: "http".to_string(),
            ref_parent_traversal_depth: 3,
            max_comprehension_length: 50_000,
            base_url: None,
            root_path: None,
        }
    }
}

/// Finds and loads scenario files from configured search paths.
#[derive(Debug)]
pub struct ScenarioLoader {
    pub config: EngineConfig,
    pub search_paths: Vec<PathBuf>,
}

impl ScenarioLoader {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            search_paths: Vec::new(),
        }
    }

    pub fn add_path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Load a single scenario file: resolve references, deserialize,
    /// validate.
    pub fn load_scenario<P: AsRef<Path>>(&self, path: P) -> Result<Scenario> {
        let path = path.as_ref();
        info!("loading scenario from {}", path.display());
        let name = self
            .scenario_name(path)
            .unwrap_or_else(|| path.display().to_string());

        self.load_inner(path, &name).map_err(|e| Error::Scenario {
            scenario: name,
            source: Box::new(e),
        })
    }

    fn load_inner(&self, path: &Path, name: &str) -> Result<Scenario> {
        let root = match &self.config.root_path {
            Some(root) => root.clone(),
            None => path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        };

        let mut resolver = RefResolver::new(root, self.config.ref_parent_traversal_depth);
        let document = resolver.resolve_file(path)?;

        let mut scenario = Scenario::from_value(document)?;
        scenario.name = name.to_string();
        scenario.source_dir = path.parent().map(Path::to_path_buf);
        debug!("loaded scenario '{}'", scenario.name);
        Ok(scenario)
    }

    /// Load every scenario file in a directory (non-recursive).
    pub fn load_scenarios_from_dir<P: AsRef<Path>>(&self, dir: P) -> Result<Vec<Scenario>> {
        let dir = dir.as_ref();
        info!("loading scenarios from directory: {}", dir.display());

        let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read directory: {}", dir.display()))
            .map_err(|e| Error::path(e.to_string()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| path.is_file() && self.is_scenario_file(path))
            .collect();
        entries.sort();

        let mut scenarios = Vec::new();
        for path in entries {
            scenarios.push(self.load_scenario(&path)?);
        }
        info!("loaded {} scenarios from {}", scenarios.len(), dir.display());
        Ok(scenarios)
    }

    /// Load scenarios from every search path that exists.
    pub fn load_all_scenarios(&self) -> Result<Vec<Scenario>> {
        let mut all = Vec::new();
        for path in &self.search_paths {
            if path.exists() && path.is_dir() {
                all.append(&mut self.load_scenarios_from_dir(path)?);
            }
        }
        info!("loaded {} scenarios in total", all.len());
        Ok(all)
    }

    /// `test_<name>.<suffix>.json` with the configured suffix?
    pub fn is_scenario_file(&self, path: &Path) -> bool {
        self.scenario_name(path).is_some()
    }

    /// Extract `<name>` from `test_<name>.<suffix>.json`.
    pub fn scenario_name(&self, path: &Path) -> Option<String> {
        let file_name = path.file_name()?.to_str()?;
        let stem = file_name.strip_prefix("test_")?;
        let stem = stem.strip_suffix(".json")?;
        let name = stem.strip_suffix(&format!(".{}", self.config.suffix))?;
        (!name.is_empty()).then(|| name.to_string())
    }
}
