//! Identity side table for plugin-supplied definitions.
//!
//! Definitions are keyed by the address of their `Arc` allocation, so two
//! structurally identical definitions from different plugins stay distinct and
//! nothing has to be written onto the definition itself. The registry holds its
//! own `Arc` clone, which keeps the address from being reused while registered.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;

use super::definition::PackageManagerDefinition;
use super::plugin::PluginMetadata;
use crate::error::ComponentCollisionError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ComponentId(String);

impl ComponentId {
    fn new(plugin_id: &str, name: &str) -> Self {
        Self(format!("{}/{}", plugin_id, name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentEntry {
    pub id: ComponentId,
    pub plugin: Arc<PluginMetadata>,
}

impl ComponentEntry {
    pub fn plugin_id(&self) -> &str {
        &self.plugin.id
    }
}

struct Slot {
    entry: ComponentEntry,
    _definition: Arc<dyn PackageManagerDefinition>,
}

#[derive(Default)]
struct Inner {
    by_identity: HashMap<usize, Slot>,
    names: HashSet<(String, String)>,
}

#[derive(Default)]
pub struct ComponentRegistry {
    inner: RwLock<Inner>,
}

fn identity(definition: &Arc<dyn PackageManagerDefinition>) -> usize {
    Arc::as_ptr(definition) as *const () as usize
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `definition` as owned by `plugin`.
    ///
    /// Registering the same object again returns its existing id. A different
    /// object under an already used `(plugin, name)` pair is a collision.
    pub fn register(
        &self,
        definition: &Arc<dyn PackageManagerDefinition>,
        plugin: &Arc<PluginMetadata>,
    ) -> Result<ComponentId, ComponentCollisionError> {
        let key = identity(definition);
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(slot) = inner.by_identity.get(&key) {
            return Ok(slot.entry.id.clone());
        }

        let name_key = (plugin.id.clone(), definition.name().to_string());
        if inner.names.contains(&name_key) {
            return Err(ComponentCollisionError {
                plugin_id: name_key.0,
                name: name_key.1,
            });
        }

        let id = ComponentId::new(&plugin.id, definition.name());
        inner.names.insert(name_key);
        inner.by_identity.insert(
            key,
            Slot {
                entry: ComponentEntry {
                    id: id.clone(),
                    plugin: Arc::clone(plugin),
                },
                _definition: Arc::clone(definition),
            },
        );

        crate::ui::debug(
            "pkg_manager.registry.register",
            &format!("Registered package manager component {}", id),
        );
        Ok(id)
    }

    /// Identity lookup; structurally equal but distinct objects do not match.
    pub fn lookup(&self, definition: &Arc<dyn PackageManagerDefinition>) -> Option<ComponentEntry> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .by_identity
            .get(&identity(definition))
            .map(|slot| slot.entry.clone())
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_identity
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentRegistry")
            .field("components", &self.len())
            .finish()
    }
}
