//! Filter rule store
//!
//! Read-mostly map from (syscall_nr, cgroup_id) to a block rule. The
//! interception path only ever calls [`RuleStore::lookup`]; inserts and
//! removals come from the configuration side.
//!
//! Values are `Copy` and returned by value, so a reader holds the read lock
//! for exactly one hash lookup and can never see half of an entry.

use std::collections::HashMap;

use heimdall_common::{FilterKey, FilterRule, MAX_FILTER_ENTRIES};
use parking_lot::RwLock;
use thiserror::Error;

/// Errors returned to the configuration actor.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Inserting a new key would exceed the store's bound
    #[error("filter store is full ({capacity} rules)")]
    CapacityExceeded { capacity: usize },
}

/// Bounded, concurrently readable rule table.
#[derive(Debug)]
pub struct RuleStore {
    rules: RwLock<HashMap<FilterKey, FilterRule>>,
    capacity: usize,
}

impl RuleStore {
    /// Create a store with the same bound as the kernel filter map.
    pub fn new() -> Self {
        Self::with_capacity(MAX_FILTER_ENTRIES as usize)
    }

    /// Create a store holding at most `capacity` rules.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rules: RwLock::new(HashMap::with_capacity(capacity)),
            capacity,
        }
    }

    /// Find the rule for a key. This is the only call made while intercepting.
    #[inline]
    pub fn lookup(&self, key: &FilterKey) -> Option<FilterRule> {
        self.rules.read().get(key).copied()
    }

    /// Insert or overwrite a rule.
    ///
    /// Overwriting an existing key always succeeds, so inserting the same
    /// (key, rule) twice is the same as inserting it once.
    pub fn insert(&self, key: FilterKey, rule: FilterRule) -> Result<(), StoreError> {
        let mut rules = self.rules.write();
        if rules.len() >= self.capacity && !rules.contains_key(&key) {
            return Err(StoreError::CapacityExceeded {
                capacity: self.capacity,
            });
        }
        rules.insert(key, rule);
        Ok(())
    }

    /// Remove a rule, returning it if it was present.
    pub fn remove(&self, key: &FilterKey) -> Option<FilterRule> {
        self.rules.write().remove(key)
    }

    pub fn contains(&self, key: &FilterKey) -> bool {
        self.rules.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Snapshot of the installed keys, sorted.
    pub fn keys(&self) -> Vec<FilterKey> {
        let mut keys: Vec<_> = self.rules.read().keys().copied().collect();
        keys.sort();
        keys
    }

    pub fn clear(&self) {
        self.rules.write().clear();
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}
