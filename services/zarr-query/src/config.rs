//! Query tool configuration.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use storage::StoreConfig;
use zarr_processor::ProcessorConfig;

/// Top-level configuration: where the data lives and how it is read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Object store and root group location
    pub store: StoreConfig,

    /// Cache, fetch and batching settings
    pub processor: ProcessorConfig,
}

impl QueryConfig {
    /// Parse a YAML document with `store:` and `processor:` sections.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        serde_yaml::from_str(raw).context("invalid configuration document")
    }

    /// Load configuration from an optional YAML file, then apply `ZARR_*`
    /// environment variables on top.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                Self::from_yaml_str(&raw)
                    .with_context(|| format!("failed to parse {}", path.display()))?
            }
            None => Self::default(),
        };
        Ok(base.with_env_overrides())
    }

    pub fn with_env_overrides(self) -> Self {
        Self {
            store: self.store.merge(StoreConfig::from_env()),
            processor: self.processor.with_env_overrides(),
        }
    }
}
