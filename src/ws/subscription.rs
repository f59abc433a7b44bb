//! Per-connection subscription manager.
//!
//! Tracks which collections a WebSocket client follows and filters applied
//! changes server-side.

use std::collections::HashSet;

use crate::domain::Collection;

/// Collection subscriptions of a single WebSocket connection.
#[derive(Debug, Default)]
pub struct SubscriptionManager {
    /// Subscribed collections. Ignored while `subscribe_all` is set.
    collections: HashSet<Collection>,
    /// Whether the client follows every collection (wildcard `"*"`).
    subscribe_all: bool,
}

impl SubscriptionManager {
    /// Creates a new empty subscription manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds collections to the subscription set.
    pub fn subscribe(&mut self, collections: &[Collection], wildcard: bool) {
        if wildcard {
            self.subscribe_all = true;
        }
        self.collections.extend(collections.iter().copied());
    }

    /// Removes collections from the subscription set. `wildcard` clears
    /// the wildcard too.
    pub fn unsubscribe(&mut self, collections: &[Collection], wildcard: bool) {
        if wildcard {
            self.subscribe_all = false;
            self.collections.clear();
        }
        for collection in collections {
            self.collections.remove(collection);
        }
    }

    /// Returns `true` if changes to `collection` should be forwarded.
    #[must_use]
    pub fn matches(&self, collection: Collection) -> bool {
        self.subscribe_all || self.collections.contains(&collection)
    }

    /// Returns the number of explicitly subscribed collections.
    #[must_use]
    pub fn count(&self) -> usize {
        self.collections.len()
    }

    /// Returns `true` if the wildcard subscription is active.
    #[must_use]
    pub fn is_subscribed_all(&self) -> bool {
        self.subscribe_all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_matches_nothing() {
        let mgr = SubscriptionManager::new();
        assert!(!mgr.matches(Collection::Players));
    }

    #[test]
    fn subscribe_specific_collection() {
        let mut mgr = SubscriptionManager::new();
        mgr.subscribe(&[Collection::ChatMessages], false);
        assert!(mgr.matches(Collection::ChatMessages));
        assert!(!mgr.matches(Collection::Players));
    }

    #[test]
    fn wildcard_matches_everything() {
        let mut mgr = SubscriptionManager::new();
        mgr.subscribe(&[], true);
        assert!(Collection::ALL.iter().all(|c| mgr.matches(*c)));
    }

    #[test]
    fn unsubscribe_removes_collection() {
        let mut mgr = SubscriptionManager::new();
        mgr.subscribe(&[Collection::Teams, Collection::Players], false);
        mgr.unsubscribe(&[Collection::Teams], false);
        assert!(!mgr.matches(Collection::Teams));
        assert_eq!(mgr.count(), 1);
    }

    #[test]
    fn wildcard_unsubscribe_clears_everything() {
        let mut mgr = SubscriptionManager::new();
        mgr.subscribe(&[Collection::Teams], true);
        mgr.unsubscribe(&[], true);
        assert!(!mgr.matches(Collection::Teams));
        assert!(!mgr.is_subscribed_all());
    }
}
