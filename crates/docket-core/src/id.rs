use parking_lot::Mutex;
use std::collections::HashMap;

/// Hands out document identities.
pub trait IdGenerator: Send + Sync {
    /// Called exactly once per new entity that has no id yet.
    fn next_id(&self, collection: &str) -> i64;

    /// Make sure ids handed out for `collection` are above `max_id`.
    fn seed(&self, collection: &str, max_id: i64);

    /// Whether `collection` was seeded by this generator. The store seeds
    /// unseeded collections from storage before asking for an id.
    fn is_seeded(&self, collection: &str) -> bool;
}

/// Per-collection in-process counter.
#[derive(Debug, Default)]
pub struct DefaultIdGenerator {
    last: Mutex<HashMap<String, i64>>,
}

impl DefaultIdGenerator {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for DefaultIdGenerator {
    fn next_id(&self, collection: &str) -> i64 {
        let mut last = self.last.lock();
        let id = last.entry(collection.to_string()).or_insert(0);
        *id += 1;
        *id
    }

    fn seed(&self, collection: &str, max_id: i64) {
        let mut last = self.last.lock();
        let id = last.entry(collection.to_string()).or_insert(0);
        *id = (*id).max(max_id);
    }

    fn is_seeded(&self, collection: &str) -> bool {
        self.last.lock().contains_key(collection)
    }
}
