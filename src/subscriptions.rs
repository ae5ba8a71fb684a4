//! Subscription index (C3): literal topics in a map, wildcard filters in
//! a linear list of compiled matchers.
//!
//! Two collections rather than one unified trie — grounded in the
//! broker's own `_subscribers` / `_wildcard_subscribers` split: a flat
//! map gives O(1) dispatch for the literal-topic common case, and the
//! wildcard list is scanned only for published topics (never for every
//! subscribe).

use std::collections::HashMap;
use std::sync::Arc;

use crate::topic::{self, Matcher};

/// Anything that can receive a matched subscription. The broker's
/// session type implements this; tests use a lighter stand-in.
pub trait Subscriber: Send + Sync {
    /// Stable identity used to dedupe and to remove a subscriber's
    /// entries without tearing down the whole index.
    fn id(&self) -> &str;
}

struct WildcardEntry<S> {
    filter: String,
    matcher: Matcher,
    subscriber: Arc<S>,
}

/// Two-collection subscription index, generic over the subscriber type
/// so it can be unit-tested without a real session/connection.
pub struct SubscriptionIndex<S: Subscriber> {
    literal: HashMap<String, Vec<Arc<S>>>,
    wildcards: Vec<WildcardEntry<S>>,
}

impl<S: Subscriber> Default for SubscriptionIndex<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: Subscriber> SubscriptionIndex<S> {
    pub fn new() -> Self {
        Self {
            literal: HashMap::new(),
            wildcards: Vec::new(),
        }
    }

    /// Insert `subscriber` under `filter`. Idempotent: a second
    /// subscribe to the same `(filter, subscriber)` pair is a no-op,
    /// matching the broker's own "not already subscribed" guard.
    pub fn subscribe(&mut self, filter: &str, subscriber: Arc<S>) {
        if let Some(matcher) = Matcher::compile(filter) {
            if self
                .wildcards
                .iter()
                .any(|e| e.filter == filter && e.subscriber.id() == subscriber.id())
            {
                return;
            }
            self.wildcards.push(WildcardEntry {
                filter: filter.to_string(),
                matcher,
                subscriber,
            });
        } else {
            let entry = self.literal.entry(filter.to_string()).or_default();
            if !entry.iter().any(|s| s.id() == subscriber.id()) {
                entry.push(subscriber);
            }
        }
    }

    /// Remove `subscriber_id`'s subscription to `filter`. Returns true
    /// if a subscription existed and was removed. Wildcard filters are
    /// matched by exact filter-string equality against the subscriber's
    /// own registered filter, not by running the compiled matcher
    /// against other subscribers' filters.
    pub fn unsubscribe(&mut self, filter: &str, subscriber_id: &str) -> bool {
        if topic::is_wildcard(filter) {
            let before = self.wildcards.len();
            self.wildcards
                .retain(|e| !(e.filter == filter && e.subscriber.id() == subscriber_id));
            self.wildcards.len() < before
        } else if let Some(entry) = self.literal.get_mut(filter) {
            let before = entry.len();
            entry.retain(|s| s.id() != subscriber_id);
            let removed = entry.len() < before;
            if entry.is_empty() {
                self.literal.remove(filter);
            }
            removed
        } else {
            false
        }
    }

    /// Remove every subscription belonging to `subscriber_id` (clean
    /// start, or the subscriber disconnecting with expiry 0).
    pub fn remove_subscriber(&mut self, subscriber_id: &str) {
        self.literal.retain(|_, subs| {
            subs.retain(|s| s.id() != subscriber_id);
            !subs.is_empty()
        });
        self.wildcards.retain(|e| e.subscriber.id() != subscriber_id);
    }

    /// All live subscribers whose filter matches `topic`, literal first
    /// then wildcard, each appearing at most once.
    pub fn matching(&self, topic: &str) -> Vec<Arc<S>> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        if let Some(subs) = self.literal.get(topic) {
            for s in subs {
                if seen.insert(s.id().to_string()) {
                    out.push(Arc::clone(s));
                }
            }
        }
        for entry in &self.wildcards {
            if entry.matcher.matches(topic) && seen.insert(entry.subscriber.id().to_string()) {
                out.push(Arc::clone(&entry.subscriber));
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Sub(String);
    impl Subscriber for Sub {
        fn id(&self) -> &str {
            &self.0
        }
    }

    #[test]
    fn literal_dispatch() {
        let mut idx: SubscriptionIndex<Sub> = SubscriptionIndex::new();
        let a = Arc::new(Sub("a".into()));
        idx.subscribe("/a/b", Arc::clone(&a));
        assert_eq!(idx.matching("/a/b").len(), 1);
        assert!(idx.matching("/a/c").is_empty());
    }

    #[test]
    fn wildcard_dispatch() {
        let mut idx: SubscriptionIndex<Sub> = SubscriptionIndex::new();
        let a = Arc::new(Sub("a".into()));
        idx.subscribe("sport/+/player1", Arc::clone(&a));
        assert_eq!(idx.matching("sport/tennis/player1").len(), 1);
        assert!(idx.matching("sport/tennis/player1/ranking").is_empty());
    }

    #[test]
    fn subscribe_is_idempotent() {
        let mut idx: SubscriptionIndex<Sub> = SubscriptionIndex::new();
        let a = Arc::new(Sub("a".into()));
        idx.subscribe("/a/b", Arc::clone(&a));
        idx.subscribe("/a/b", Arc::clone(&a));
        assert_eq!(idx.matching("/a/b").len(), 1);
    }

    #[test]
    fn wildcard_unsubscribe_by_filter_identity() {
        let mut idx: SubscriptionIndex<Sub> = SubscriptionIndex::new();
        let a = Arc::new(Sub("a".into()));
        idx.subscribe("#", Arc::clone(&a));
        assert!(idx.unsubscribe("#", "a"));
        assert!(idx.matching("anything").is_empty());
    }

    #[test]
    fn remove_subscriber_clears_both_collections() {
        let mut idx: SubscriptionIndex<Sub> = SubscriptionIndex::new();
        let a = Arc::new(Sub("a".into()));
        idx.subscribe("/a/b", Arc::clone(&a));
        idx.subscribe("#", Arc::clone(&a));
        idx.remove_subscriber("a");
        assert!(idx.matching("/a/b").is_empty());
        assert!(idx.matching("anything").is_empty());
    }

    #[test]
    fn two_subscribers_each_receive_once() {
        let mut idx: SubscriptionIndex<Sub> = SubscriptionIndex::new();
        let a = Arc::new(Sub("a".into()));
        let b = Arc::new(Sub("b".into()));
        idx.subscribe("/a/b", Arc::clone(&a));
        idx.subscribe("/a/b", Arc::clone(&b));
        assert_eq!(idx.matching("/a/b").len(), 2);
    }
}
