use anyhow::{Context, Result};
use procflow_core::storage::{InMemoryStore, RedbIndexStore};
use procflow_core::{DefinitionDraft, EngineConfig, WorkflowEngine};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    /// Directory of JSON definition drafts registered at startup
    #[serde(default)]
    pub definitions_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    #[default]
    Memory,
    Redb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    #[serde(default = "default_index_path")]
    pub path: PathBuf,
}

fn default_index_path() -> PathBuf {
    PathBuf::from("data/procflow.redb")
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_index_path(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path) -> Result<Self> {
        // Load config file if it exists, otherwise use defaults
        if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")
        } else {
            tracing::info!(
                "Configuration file {} not found, using defaults",
                config_path.display()
            );
            Ok(Self::default())
        }
    }

    /// Read every `*.json` draft in the definitions directory, sorted by file name
    pub fn seed_drafts(&self) -> Result<Vec<DefinitionDraft>> {
        let Some(dir) = &self.definitions_dir else {
            return Ok(Vec::new());
        };

        let mut paths = Vec::new();
        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read definitions directory {}", dir.display()))?
        {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                paths.push(path);
            }
        }
        paths.sort();

        paths
            .iter()
            .map(|path| {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                serde_json::from_str(&content)
                    .with_context(|| format!("Failed to parse definition {}", path.display()))
            })
            .collect()
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let builder = WorkflowEngine::builder().config(config.engine.clone());
        let engine = match config.storage.backend {
            StorageBackend::Memory => {
                let store = Arc::new(InMemoryStore::new());
                builder
                    .definition_repository(store.clone())
                    .execution_repository(store)
                    .build()
            }
            StorageBackend::Redb => {
                let store = Arc::new(
                    RedbIndexStore::new(config.storage.path.clone())
                        .context("Failed to open index store")?,
                );
                builder
                    .definition_repository(store.clone())
                    .execution_repository(store)
                    .build()
            }
        };

        for draft in config.seed_drafts()? {
            let name = draft.name.clone();
            let definition = engine
                .create_definition(draft)
                .with_context(|| format!("Failed to register seeded definition {}", name))?;
            tracing::info!("Seeded workflow definition {} ({})", definition.name, definition.id);
        }

        Ok(Self {
            engine: Arc::new(engine),
        })
    }
}
