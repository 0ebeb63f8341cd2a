//! Filesystem definition loader.
//!
//! Implements `DefinitionLoader` from `ratio-core`. Definition paths are
//! absolute within a root directory (`/tools/echo.json` resolves to
//! `{root}/tools/echo.json`). The parser is picked by extension, every
//! loaded definition is validated, and results are cached for the lifetime
//! of the loader.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use ratio_core::definition::{self, DefinitionLoader};
use ratio_core::error::EngineError;
use ratio_types::definition::Definition;

/// Document format of a definition file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Json,
    Yaml,
}

impl DocumentFormat {
    /// Detect the format from a file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        match ext.as_str() {
            "json" => Some(DocumentFormat::Json),
            "yaml" | "yml" => Some(DocumentFormat::Yaml),
            _ => None,
        }
    }

    pub fn parse(&self, text: &str) -> Result<Definition, EngineError> {
        match self {
            DocumentFormat::Json => definition::parse_json(text),
            DocumentFormat::Yaml => definition::parse_yaml(text),
        }
    }
}

/// Loads definitions from a directory tree.
pub struct FsDefinitionLoader {
    root: PathBuf,
    cache: DashMap<String, Arc<Definition>>,
}

impl FsDefinitionLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            cache: DashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a definition path onto the root, refusing `..` components.
    pub fn resolve(&self, path: &str) -> Result<PathBuf, EngineError> {
        let relative = Path::new(path.trim_start_matches('/'));
        if relative.as_os_str().is_empty() {
            return Err(EngineError::InvalidDefinition("empty definition path".to_string()));
        }
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(EngineError::InvalidDefinition(format!(
                "definition path '{path}' escapes the definition root"
            )));
        }
        Ok(self.root.join(relative))
    }

    /// Read, parse, and validate a definition file without caching it.
    pub async fn read(&self, path: &str) -> Result<Definition, EngineError> {
        let file = self.resolve(path)?;
        let format = DocumentFormat::from_path(&file).ok_or_else(|| {
            EngineError::InvalidDefinition(format!(
                "'{path}' must have a .json, .yaml, or .yml extension"
            ))
        })?;

        let text = tokio::fs::read_to_string(&file).await.map_err(|err| {
            EngineError::InvalidDefinition(format!("failed to read '{path}': {err}"))
        })?;
        let parsed = format
            .parse(&text)
            .map_err(|err| EngineError::InvalidDefinition(format!("'{path}': {err}")))?;
        definition::validate(&parsed)?;
        Ok(parsed)
    }

    /// Drop every cached definition.
    pub fn clear_cache(&self) {
        self.cache.clear();
    }
}

impl DefinitionLoader for FsDefinitionLoader {
    async fn load(&self, path: &str) -> Result<Arc<Definition>, EngineError> {
        if let Some(cached) = self.cache.get(path) {
            return Ok(Arc::clone(cached.value()));
        }
        let loaded = Arc::new(self.read(path).await?);
        tracing::debug!(path, composite = loaded.is_composite(), "definition loaded");
        self.cache.insert(path.to_string(), Arc::clone(&loaded));
        Ok(loaded)
    }
}
