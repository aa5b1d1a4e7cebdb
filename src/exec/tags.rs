//! Run-time tag map shared between a VU and whoever samples it.

use std::collections::HashMap;

use parking_lot::RwLock;

/// Concurrent string-to-string tag lookup. Samples never read it in place:
/// they take a [`TagMap::clone_map`] snapshot and mutate that freely, so the
/// lock is held only for the copy.
#[derive(Default)]
pub struct TagMap {
    m: RwLock<HashMap<String, String>>,
}

impl TagMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing map, e.g. the merged run/scenario tags.
    pub fn from_map(m: HashMap<String, String>) -> Self {
        Self { m: RwLock::new(m) }
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.m.write().insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.m.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.m.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.m.read().is_empty()
    }

    pub fn delete(&self, key: &str) {
        self.m.write().remove(key);
    }

    /// Snapshot of the whole map, taken under the read lock.
    pub fn clone_map(&self) -> HashMap<String, String> {
        self.m.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_get_delete() {
        let tags = TagMap::new();
        assert!(tags.is_empty());
        tags.set("region", "eu-west");
        assert_eq!(tags.get("region"), Some("eu-west".to_string()));
        assert_eq!(tags.len(), 1);
        tags.delete("region");
        assert_eq!(tags.get("region"), None);
        assert!(tags.is_empty());
    }

    #[test]
    fn test_clone_is_a_snapshot() {
        let tags = TagMap::from_map(HashMap::from([("env".to_string(), "prod".to_string())]));
        let mut snapshot = tags.clone_map();
        snapshot.insert("mutated".to_string(), "yes".to_string());
        snapshot.insert("env".to_string(), "staging".to_string());

        // Mutating the snapshot leaves the original untouched.
        assert_eq!(tags.get("env"), Some("prod".to_string()));
        assert_eq!(tags.get("mutated"), None);
        assert_eq!(tags.len(), 1);
    }

    #[test]
    fn test_concurrent_writers() {
        use std::sync::Arc;
        let tags = Arc::new(TagMap::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let tags = Arc::clone(&tags);
                std::thread::spawn(move || {
                    for j in 0..100 {
                        tags.set(format!("k{i}-{j}"), "v");
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(tags.len(), 800);
    }
}
