use std::{collections::HashMap, sync::Arc};

use crate::{Destination, Target};

struct Registered {
    generation: u64,
    target: Arc<dyn Target>,
}

/// Targets by name, each tagged with the generation it was registered in so
/// that the closure of a replaced target can't remove its successor.
#[derive(Default)]
pub(crate) struct TargetRegistry {
    entries: HashMap<Arc<str>, Registered>,
    next_generation: u64,
}

impl TargetRegistry {
    /// Register `target` under `name`, replacing any previous one. Returns
    /// the registration's generation.
    pub fn insert(&mut self, name: Arc<str>, target: Arc<dyn Target>) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.entries.insert(name, Registered { generation, target });
        generation
    }

    pub fn remove(&mut self, name: &str) -> bool {
        self.entries.remove(name).is_some()
    }

    /// Remove `name` only if it still holds the given registration.
    pub fn remove_generation(&mut self, name: &str, generation: u64) -> bool {
        if self
            .entries
            .get(name)
            .is_some_and(|entry| entry.generation == generation)
        {
            self.entries.remove(name);
            true
        } else {
            false
        }
    }

    /// Targets an envelope with `destination` should be forwarded to.
    pub fn resolve(&self, destination: &Destination) -> Vec<(Arc<str>, Arc<dyn Target>)> {
        match destination {
            Destination::Broadcast => self
                .entries
                .iter()
                .map(|(name, entry)| (name.clone(), entry.target.clone()))
                .collect(),
            Destination::Named(name) => self
                .entries
                .get_key_value(name.as_str())
                .map(|(name, entry)| vec![(name.clone(), entry.target.clone())])
                .unwrap_or_default(),
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.keys().map(|n| n.to_string()).collect();
        names.sort();
        names
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ChannelTarget, Envelope};

    fn target() -> Arc<dyn Target> {
        let (target, _rx) = ChannelTarget::<Envelope>::channel();
        Arc::new(target)
    }

    #[test]
    fn test_resolve() {
        let mut registry = TargetRegistry::default();
        registry.insert(Arc::from("workbench"), target());
        registry.insert(Arc::from("dialer"), target());

        assert_eq!(registry.resolve(&Destination::Broadcast).len(), 2);
        let named = registry.resolve(&Destination::named("dialer"));
        assert_eq!(named.len(), 1);
        assert_eq!(&*named[0].0, "dialer");
        assert!(registry.resolve(&Destination::named("partner:auto")).is_empty());
    }

    #[test]
    fn test_stale_generation_does_not_remove_successor() {
        let mut registry = TargetRegistry::default();
        let first = registry.insert(Arc::from("workbench"), target());
        let second = registry.insert(Arc::from("workbench"), target());

        assert!(!registry.remove_generation("workbench", first));
        assert_eq!(registry.names(), vec!["workbench".to_string()]);
        assert!(registry.remove_generation("workbench", second));
        assert!(registry.names().is_empty());
    }
}
