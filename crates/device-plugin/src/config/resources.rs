//! Device classes to advertise, loaded from YAML.

use std::collections::HashSet;
use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use thiserror::Error;

use crate::domain::resource::AddressingMode;
use crate::domain::resource::ResourceClass;
use crate::infrastructure::inventory_client::InventoryEndpoints;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read resource config {path}")]
    Read { path: String },
    #[error("Failed to parse resource config {path}")]
    Parse { path: String },
    #[error("Invalid resource config: {message}")]
    Invalid { message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResourceEntry {
    pub resource_name: String,
    #[serde(default)]
    pub addressing: AddressingMode,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ResourceConfig {
    #[serde(default, rename = "resource_device_plugin")]
    pub resources: Vec<ResourceEntry>,
    #[serde(default)]
    pub inventory: InventoryEndpoints,
}

impl ResourceConfig {
    pub fn from_yaml(content: &str) -> Result<Self, Report<ConfigError>> {
        let config: Self = serde_yaml::from_str(content).change_context(ConfigError::Parse {
            path: "<inline>".to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: &Path) -> Result<Self, Report<ConfigError>> {
        let display = path.display().to_string();
        let content = tokio::fs::read_to_string(path)
            .await
            .change_context(ConfigError::Read {
                path: display.clone(),
            })?;
        let config: Self = serde_yaml::from_str(&content)
            .change_context(ConfigError::Parse { path: display })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Report<ConfigError>> {
        let mut seen = HashSet::new();
        for entry in &self.resources {
            let name = entry.resource_name.trim();
            if name.is_empty() || name.contains('/') {
                return Err(Report::new(ConfigError::Invalid {
                    message: format!("bad resource name '{}'", entry.resource_name),
                }));
            }
            if !seen.insert(name) {
                return Err(Report::new(ConfigError::Invalid {
                    message: format!("resource '{name}' listed twice"),
                }));
            }
        }
        Ok(())
    }

    /// Resource classes under `vendor`, in file order.
    pub fn classes(&self, vendor: &str) -> Vec<ResourceClass> {
        self.resources
            .iter()
            .map(|entry| ResourceClass::new(vendor, entry.resource_name.trim(), entry.addressing))
            .collect()
    }
}
