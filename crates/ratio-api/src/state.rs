//! Application state wiring the engine to its collaborators.

use std::path::PathBuf;
use std::sync::Arc;

use ratio_core::Runtime;
use ratio_infra::config::{load_engine_config, resolve_data_dir};
use ratio_infra::executor::LoopbackExecutor;
use ratio_infra::loader::FsDefinitionLoader;
use ratio_infra::storage::LocalFileStore;

/// Runtime pinned to the infra implementations.
pub type ConcreteRuntime = Runtime<LoopbackExecutor, FsDefinitionLoader>;

/// Shared state for command handlers.
pub struct AppState {
    pub runtime: ConcreteRuntime,
    /// Separate loader for static commands, so `validate` never reports a
    /// cached copy.
    pub loader: FsDefinitionLoader,
}

impl AppState {
    /// Resolve directories, load `config.toml`, and build the runtime.
    ///
    /// Files live under `{data_dir}/files`. Definitions resolve against
    /// `root`, or the current directory when none is given.
    pub async fn init(data_dir: Option<PathBuf>, root: Option<PathBuf>) -> anyhow::Result<Self> {
        let data_dir = data_dir.unwrap_or_else(resolve_data_dir);
        let root = match root {
            Some(root) => root,
            None => std::env::current_dir()?,
        };
        let config = load_engine_config(&data_dir).await;
        tracing::debug!(
            data_dir = %data_dir.display(),
            root = %root.display(),
            "engine state initialized"
        );

        let store = LocalFileStore::new(data_dir.join("files"));
        let runtime = Runtime::with_store(
            LoopbackExecutor::new(),
            FsDefinitionLoader::new(&root),
            config,
            Some(Arc::new(store)),
        )?;

        Ok(Self {
            runtime,
            loader: FsDefinitionLoader::new(root),
        })
    }
}

/// Normalize a user-supplied definition path to the loader's absolute form.
pub fn definition_path(definition: &str) -> String {
    if definition.starts_with('/') {
        definition.to_string()
    } else {
        format!("/{}", definition.trim_start_matches("./"))
    }
}
