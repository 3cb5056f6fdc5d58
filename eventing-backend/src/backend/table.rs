use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use eventing_core::SubscriptionSubjectIdentifier;

use super::worker::DispatchWorker;

/// Settings a live subscriber was created with, compared on every sync.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubscriberSettings {
    /// Backend subject the subscriber filters on.
    pub subject: String,
    pub max_in_flight: u32,
    pub ack_wait: Duration,
}

/// A live subscriber, one per identifier.
#[derive(Clone)]
pub struct Subscriber {
    pub settings: SubscriberSettings,
    /// Connection generation the subscriber was created in.
    pub generation: u64,
    /// Set when the connection was lost; stale subscribers are rebuilt by the next sync.
    pub stale: bool,
    pub worker: Arc<DispatchWorker>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("settings", &self.settings)
            .field("generation", &self.generation)
            .field("stale", &self.stale)
            .finish()
    }
}

/// Subscribers a backend instance has actually applied, keyed by identifier.
///
/// Reconciliation of one subscription only touches identifiers scoped to its namespace
/// and name, so concurrent syncs of different subscriptions never write the same key.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionTable {
    entries: Arc<DashMap<SubscriptionSubjectIdentifier, Subscriber>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &SubscriptionSubjectIdentifier) -> Option<Subscriber> {
        self.entries.get(id).map(|entry| entry.clone())
    }

    pub fn insert(&self, id: SubscriptionSubjectIdentifier, subscriber: Subscriber) {
        self.entries.insert(id, subscriber);
    }

    pub fn remove(&self, id: &SubscriptionSubjectIdentifier) -> Option<Subscriber> {
        self.entries.remove(id).map(|(_, subscriber)| subscriber)
    }

    pub fn contains(&self, id: &SubscriptionSubjectIdentifier) -> bool {
        self.entries.contains_key(id)
    }

    /// Identifiers owned by the subscription `namespace/name`.
    pub fn keys_for(&self, namespace: &str, name: &str) -> Vec<SubscriptionSubjectIdentifier> {
        let mut keys: Vec<_> = self
            .entries
            .iter()
            .filter(|entry| entry.key().belongs_to(namespace, name))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn keys(&self) -> Vec<SubscriptionSubjectIdentifier> {
        let mut keys: Vec<_> = self.entries.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    pub fn mark_all_stale(&self) -> usize {
        let mut marked = 0;
        for mut entry in self.entries.iter_mut() {
            if !entry.stale {
                entry.stale = true;
                marked += 1;
            }
        }
        marked
    }

    pub fn is_stale(&self, id: &SubscriptionSubjectIdentifier) -> Option<bool> {
        self.entries.get(id).map(|entry| entry.stale)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
