//! Per-node content storage: a flat key/value map keyed by [`Hash`].

use fnv::FnvHashMap;

use crate::hash::Hash;

/// Local storage unit a DHT node keeps for segments it has been asked to
/// provide or was directly told to store.
#[derive(Debug, Default)]
pub struct KeyValueStore {
    storage: FnvHashMap<u64, String>,
}

impl KeyValueStore {
    pub fn new() -> Self {
        KeyValueStore::default()
    }

    pub fn add(&mut self, key: Hash, value: String) {
        self.storage.insert(key.value(), value);
    }

    pub fn remove(&mut self, key: Hash) -> Option<String> {
        self.storage.remove(&key.value())
    }

    /// Returns the stored value, or an empty string with `ok = false` if
    /// nothing is stored for `key`.
    pub fn read(&self, key: Hash) -> (String, bool) {
        match self.storage.get(&key.value()) {
            Some(value) => (value.clone(), true),
            None => (String::new(), false),
        }
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_value() {
        let mut store = KeyValueStore::new();
        let key = Hash::of_bytes(b"segment");
        store.add(key, "payload".to_string());
        assert_eq!(store.read(key), ("payload".to_string(), true));
    }

    #[test]
    fn missing_key_reads_empty_and_not_ok() {
        let store = KeyValueStore::new();
        let key = Hash::of_bytes(b"missing");
        assert_eq!(store.read(key), (String::new(), false));
    }

    #[test]
    fn remove_drops_the_value() {
        let mut store = KeyValueStore::new();
        let key = Hash::of_bytes(b"segment");
        store.add(key, "payload".to_string());
        assert_eq!(store.remove(key), Some("payload".to_string()));
        assert_eq!(store.read(key), (String::new(), false));
    }
}
