use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use super::definition::PackageManagerDefinition;
use super::plugin::PluginMetadata;
use super::registry::ComponentId;
use super::spec::PackageManagerSpec;

/// A definition bound to a concrete version and executable.
#[derive(Clone, Serialize)]
pub struct PackageManagerEnvelope {
    pub id: ComponentId,
    #[serde(skip)]
    pub definition: Arc<dyn PackageManagerDefinition>,
    pub plugin: Arc<PluginMetadata>,
    pub spec: Arc<PackageManagerSpec>,
}

impl PackageManagerEnvelope {
    pub fn new(
        id: ComponentId,
        definition: Arc<dyn PackageManagerDefinition>,
        plugin: Arc<PluginMetadata>,
        spec: PackageManagerSpec,
    ) -> Self {
        Self {
            id,
            definition,
            plugin,
            spec: Arc::new(spec),
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin.id
    }

    /// Whether the bound spec has the same `{name, version}` as `other`.
    pub fn same_identity(&self, other: &PackageManagerEnvelope) -> bool {
        self.spec.same_identity(&other.spec)
    }
}

impl fmt::Debug for PackageManagerEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PackageManagerEnvelope")
            .field("id", &self.id)
            .field("plugin", &self.plugin.id)
            .field("spec", &self.spec)
            .finish()
    }
}

impl fmt::Display for PackageManagerEnvelope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.spec, self.id)
    }
}
