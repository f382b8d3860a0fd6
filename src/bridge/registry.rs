//! Identifier-keyed ownership tables
//!
//! A registry owns the authoritative `Arc` of every live entity of one kind.
//! An entity is dead as soon as it leaves its registry, whoever else still
//! holds a clone. Registration is first-write-wins.
//!
//! Ids are caller-supplied; reusing an id while the old entity is still
//! registered is a caller error that the registry only reports.

use super::{BridgeError, EntityKind};
use log::{debug, warn};
use parking_lot::RwLock;
use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;

pub struct Registry<K, V> {
    kind: EntityKind,
    entries: RwLock<HashMap<K, Arc<V>>>,
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash + Clone + Display,
{
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Insert `value` under `id` unless the id is taken. Returns whether the
    /// value was inserted.
    pub fn register(&self, id: K, value: Arc<V>) -> bool {
        let mut entries = self.entries.write();
        if entries.contains_key(&id) {
            debug!("{} {} already registered, keeping existing entry", self.kind, id);
            return false;
        }
        entries.insert(id, value);
        true
    }

    /// Like `register`, but hands back whichever value ends up registered
    /// and whether it was the one supplied.
    pub fn register_or_get(&self, id: K, value: Arc<V>) -> (Arc<V>, bool) {
        let mut entries = self.entries.write();
        if let Some(existing) = entries.get(&id) {
            return (existing.clone(), false);
        }
        entries.insert(id, value.clone());
        (value, true)
    }

    /// Look up an id, logging when it is absent
    pub fn get<Q>(&self, id: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + Display + ?Sized,
    {
        let value = self.entries.read().get(id).cloned();
        if value.is_none() {
            warn!("{} {} does not exist", self.kind, id);
        }
        value
    }

    /// Look up an id without logging a miss
    pub fn peek<Q>(&self, id: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.entries.read().get(id).cloned()
    }

    /// Look up an id, reporting a miss as `NotFound`
    pub fn lookup<Q>(&self, id: &Q) -> Result<Arc<V>, BridgeError>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + Display + ?Sized,
    {
        self.get(id).ok_or_else(|| BridgeError::not_found(self.kind, id))
    }

    pub fn contains<Q>(&self, id: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.entries.read().contains_key(id)
    }

    /// Idempotent delete
    pub fn remove<Q>(&self, id: &Q) -> Option<Arc<V>>
    where
        K: Borrow<Q>,
        Q: Eq + Hash + ?Sized,
    {
        self.entries.write().remove(id)
    }

    /// Remove and return every entry
    pub fn drain(&self) -> Vec<(K, Arc<V>)> {
        self.entries.write().drain().collect()
    }

    pub fn ids(&self) -> Vec<K> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn values(&self) -> Vec<Arc<V>> {
        self.entries.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_registration_wins() {
        let registry: Registry<u32, &'static str> = Registry::new(EntityKind::Connection);
        assert!(registry.register(1, Arc::new("a")));
        assert!(!registry.register(1, Arc::new("b")));
        assert_eq!(*registry.get(&1).unwrap(), "a");
    }

    #[test]
    fn test_register_or_get_returns_winner() {
        let registry: Registry<String, u8> = Registry::new(EntityKind::Track);
        let (first, inserted) = registry.register_or_get("t".to_string(), Arc::new(1));
        assert!(inserted);
        let (second, inserted) = registry.register_or_get("t".to_string(), Arc::new(2));
        assert!(!inserted);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_lookup_missing_is_not_found() {
        let registry: Registry<u32, ()> = Registry::new(EntityKind::Renderer);
        let err = registry.lookup(&3).unwrap_err();
        assert_eq!(err, BridgeError::not_found(EntityKind::Renderer, 3));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry: Registry<u32, ()> = Registry::new(EntityKind::Connection);
        registry.register(1, Arc::new(()));
        assert!(registry.remove(&1).is_some());
        assert!(registry.remove(&1).is_none());
        assert!(registry.is_empty());
    }
}
