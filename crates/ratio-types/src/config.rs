//! Engine configuration types.
//!
//! `EngineConfig` represents `config.toml` in the data directory. Every field
//! has a default, so an empty file is valid.

use serde::{Deserialize, Serialize};

/// Limits and sizing for the execution runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum depth of nested composite instances below a top-level run.
    #[serde(default = "default_max_nesting_depth")]
    pub max_nesting_depth: u32,

    /// Capacity of the broadcast channel behind the event bus.
    #[serde(default = "default_event_bus_capacity")]
    pub event_bus_capacity: usize,

    /// Upper bound on entries returned by `list_files`.
    #[serde(default = "default_list_files_limit")]
    pub list_files_limit: usize,

    /// Upper bound on paths accepted by `read_files`.
    #[serde(default = "default_read_files_limit")]
    pub read_files_limit: usize,

    /// Upper bound on children produced by one parallel fan-out.
    #[serde(default = "default_max_parallel_children")]
    pub max_parallel_children: usize,
}

fn default_max_nesting_depth() -> u32 {
    32
}

fn default_event_bus_capacity() -> usize {
    256
}

fn default_list_files_limit() -> usize {
    50
}

fn default_read_files_limit() -> usize {
    5
}

fn default_max_parallel_children() -> usize {
    1000
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_nesting_depth: default_max_nesting_depth(),
            event_bus_capacity: default_event_bus_capacity(),
            list_files_limit: default_list_files_limit(),
            read_files_limit: default_read_files_limit(),
            max_parallel_children: default_max_parallel_children(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_config_default_values() {
        let config = EngineConfig::default();
        assert_eq!(config.max_nesting_depth, 32);
        assert_eq!(config.list_files_limit, 50);
        assert_eq!(config.read_files_limit, 5);
    }

    #[test]
    fn test_engine_config_deserialize_with_defaults() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_engine_config_deserialize_with_values() {
        let config: EngineConfig = toml::from_str(
            r#"
max_nesting_depth = 4
list_files_limit = 10
"#,
        )
        .unwrap();
        assert_eq!(config.max_nesting_depth, 4);
        assert_eq!(config.list_files_limit, 10);
        assert_eq!(config.event_bus_capacity, 256);
    }
}
