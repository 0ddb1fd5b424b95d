//! Instance registry: where connectivity facts come from.

use crate::types::{ConnectivityFacts, InstanceId};
use std::collections::BTreeMap;

/// Source of connectivity facts for managed instances.
pub trait InstanceRegistry: Send + Sync {
    /// Facts for `instance`, or `None` if the instance is unknown.
    fn facts(&self, instance: &InstanceId) -> Option<ConnectivityFacts>;
}

/// Registry backed by a fixed table, typically loaded from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    instances: BTreeMap<InstanceId, ConnectivityFacts>,
}

impl StaticRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an instance.
    pub fn insert(&mut self, id: impl Into<InstanceId>, facts: ConnectivityFacts) {
        self.instances.insert(id.into(), facts);
    }

    /// Known instance ids, sorted.
    pub fn ids(&self) -> impl Iterator<Item = &InstanceId> {
        self.instances.keys()
    }

    /// Number of known instances.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

impl FromIterator<(InstanceId, ConnectivityFacts)> for StaticRegistry {
    fn from_iter<T: IntoIterator<Item = (InstanceId, ConnectivityFacts)>>(iter: T) -> Self {
        Self {
            instances: iter.into_iter().collect(),
        }
    }
}

impl InstanceRegistry for StaticRegistry {
    fn facts(&self, instance: &InstanceId) -> Option<ConnectivityFacts> {
        self.instances.get(instance).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_registry_lookup() {
        let mut registry = StaticRegistry::new();
        registry.insert(
            "ws-1",
            ConnectivityFacts {
                address: Some("10.0.0.4".into()),
                ..Default::default()
            },
        );

        assert_eq!(registry.len(), 1);
        let facts = registry.facts(&InstanceId::new("ws-1")).unwrap();
        assert_eq!(facts.address.as_deref(), Some("10.0.0.4"));
        assert!(registry.facts(&InstanceId::new("ws-2")).is_none());
    }
}
