//! Retained message store (C4): flat topic -> payload map.
//!
//! No persistence across restarts; this is an in-memory map for the
//! life of the broker, matching the stated non-goal.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::topic::Matcher;

#[derive(Debug, Clone)]
pub struct Retained {
    pub payload: Bytes,
}

/// Thread-adjacent store: all mutation happens synchronously inside a
/// connection handler callback, so a simple `RwLock` never gets held
/// across an `.await`.
#[derive(Default)]
pub struct RetainedStore {
    by_topic: RwLock<HashMap<String, Retained>>,
}

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a retained payload. An empty payload clears any existing
    /// entry instead of storing an empty message.
    pub fn set(&self, topic: &str, payload: Bytes) {
        if payload.is_empty() {
            self.by_topic.write().remove(topic);
        } else {
            self.by_topic.write().insert(topic.to_string(), Retained { payload });
        }
    }

    pub fn remove(&self, topic: &str) {
        self.by_topic.write().remove(topic);
    }

    /// Literal lookup for a non-wildcard subscribe filter.
    pub fn get(&self, topic: &str) -> Option<Retained> {
        self.by_topic.read().get(topic).cloned()
    }

    /// Scan every retained topic against a compiled wildcard matcher,
    /// used when a subscribe filter contains `+`/`#`.
    pub fn matching(&self, matcher: &Matcher) -> Vec<(String, Retained)> {
        self.by_topic
            .read()
            .iter()
            .filter(|(topic, _)| matcher.matches(topic))
            .map(|(t, r)| (t.clone(), r.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_get() {
        let store = RetainedStore::new();
        store.set("/a/b", Bytes::from_static(b"apa"));
        assert_eq!(&store.get("/a/b").unwrap().payload[..], b"apa");
    }

    #[test]
    fn empty_payload_clears() {
        let store = RetainedStore::new();
        store.set("/a/b", Bytes::from_static(b"apa"));
        store.set("/a/b", Bytes::new());
        assert!(store.get("/a/b").is_none());
    }

    #[test]
    fn replace_keeps_latest_only() {
        let store = RetainedStore::new();
        store.set("/a/b", Bytes::from_static(b"first"));
        store.set("/a/b", Bytes::from_static(b"second"));
        assert_eq!(&store.get("/a/b").unwrap().payload[..], b"second");
    }

    #[test]
    fn wildcard_scan_finds_matches() {
        let store = RetainedStore::new();
        store.set("sport/tennis/player1", Bytes::from_static(b"ping"));
        store.set("sport/football/teamA", Bytes::from_static(b"goal"));
        let matcher = Matcher::compile("sport/+/player1").unwrap();
        let found = store.matching(&matcher);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "sport/tennis/player1");
    }
}
