//! Plugins as handed over by the (external) plugin loader.

use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use super::definition::PackageManagerDefinition;
use super::registry::ComponentRegistry;
use super::version::VersionRange;
use crate::error::ComponentCollisionError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginMetadata {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PluginMetadata {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: None,
            description: None,
        }
    }
}

/// A plugin and the package-manager definitions it provides, in order.
#[derive(Clone)]
pub struct Plugin {
    pub metadata: Arc<PluginMetadata>,
    pub definitions: Vec<Arc<dyn PackageManagerDefinition>>,
}

impl Plugin {
    pub fn new(metadata: PluginMetadata) -> Self {
        Self {
            metadata: Arc::new(metadata),
            definitions: Vec::new(),
        }
    }

    pub fn with_definition(mut self, definition: Arc<dyn PackageManagerDefinition>) -> Self {
        self.definitions.push(definition);
        self
    }
}

#[derive(Error, Debug)]
pub enum PluginLoadError {
    #[error(transparent)]
    Collision(#[from] ComponentCollisionError),

    #[error("Plugin {plugin_id:?} provides an invalid package manager {name:?}: {reason}")]
    InvalidDefinition {
        plugin_id: String,
        name: String,
        reason: String,
    },
}

fn validate(plugin_id: &str, definition: &dyn PackageManagerDefinition) -> Result<(), PluginLoadError> {
    let invalid = |reason: String| PluginLoadError::InvalidDefinition {
        plugin_id: plugin_id.to_string(),
        name: definition.name().to_string(),
        reason,
    };

    if definition.name().trim().is_empty() {
        return Err(invalid("empty name".to_string()));
    }
    if definition.bin().trim().is_empty() {
        return Err(invalid("empty bin".to_string()));
    }
    VersionRange::parse(definition.supported_version_range())
        .map_err(|e| invalid(e.to_string()))?;
    Ok(())
}

/// Validate every definition and register it, in plugin order.
///
/// Runs once at startup; any collision aborts loading before resolution can
/// begin.
pub fn load_plugins(plugins: &[Plugin], registry: &ComponentRegistry) -> Result<(), PluginLoadError> {
    for plugin in plugins {
        for definition in &plugin.definitions {
            validate(&plugin.metadata.id, definition.as_ref())?;
            registry.register(definition, &plugin.metadata)?;
        }
    }
    Ok(())
}
