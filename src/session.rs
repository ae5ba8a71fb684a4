//! Session registry (C5): per-client-id state that outlives a single
//! TCP connection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::packet::{Packet, QoS};
use crate::subscriptions::{Subscriber, SubscriptionIndex};
use crate::varint::MAX_VALUE;

/// A pre-registered publish the broker performs on this session's
/// behalf when its connection ends abnormally.
#[derive(Debug, Clone)]
pub struct Will {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

/// Something a connection handler's outbound channel carries: either a
/// packet to write, or a signal that this connection has been
/// superseded by a newer CONNECT for the same client id and must close.
#[derive(Debug, Clone)]
pub enum Outgoing {
    Packet(Packet),
    TakenOver,
}

/// Outbound channel to a live connection handler. `None` when the
/// session is not currently bound to any connection.
pub type Outbox = mpsc::Sender<Outgoing>;

struct SessionState {
    literal_subscriptions: HashSet<String>,
    wildcard_subscriptions: HashSet<String>,
    will: Option<Will>,
    max_packet_size: u32,
    expiry_interval: u32,
    outbox: Option<Outbox>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            literal_subscriptions: HashSet::new(),
            wildcard_subscriptions: HashSet::new(),
            will: None,
            max_packet_size: MAX_VALUE,
            expiry_interval: 0,
            outbox: None,
        }
    }
}

/// A broker-side session, keyed by client id. Shared by `Arc` between
/// the registry and every `SubscriptionIndex` entry it appears in.
pub struct Session {
    client_id: String,
    state: Mutex<SessionState>,
}

impl Subscriber for Session {
    fn id(&self) -> &str {
        &self.client_id
    }
}

impl Session {
    fn new(client_id: String) -> Arc<Self> {
        Arc::new(Self {
            client_id,
            state: Mutex::new(SessionState::default()),
        })
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Bind `outbox` as this session's live connection, returning
    /// whichever outbox was previously bound (if any) so the caller can
    /// signal that connection to close — at most one live connection
    /// per session; a new CONNECT takes the session over from the old
    /// one.
    pub fn bind(&self, outbox: Outbox) -> Option<Outbox> {
        self.state.lock().outbox.replace(outbox)
    }

    pub fn detach(&self) {
        self.state.lock().outbox = None;
    }

    pub fn is_bound(&self) -> bool {
        self.state.lock().outbox.is_some()
    }

    pub fn outbox(&self) -> Option<Outbox> {
        self.state.lock().outbox.clone()
    }

    pub fn set_max_packet_size(&self, size: u32) {
        self.state.lock().max_packet_size = size;
    }

    pub fn max_packet_size(&self) -> u32 {
        self.state.lock().max_packet_size
    }

    pub fn set_expiry_interval(&self, seconds: u32) {
        self.state.lock().expiry_interval = seconds;
    }

    pub fn expiry_interval(&self) -> u32 {
        self.state.lock().expiry_interval
    }

    pub fn set_will(&self, will: Option<Will>) {
        self.state.lock().will = will;
    }

    pub fn take_will(&self) -> Option<Will> {
        self.state.lock().will.clone()
    }

    /// Record that this session now owns `filter`, for session-side
    /// dedup and for `clear_subscriptions`. Returns false if it was
    /// already tracked (caller should not re-insert into the broker's
    /// index either).
    pub fn track_subscription(&self, filter: &str, wildcard: bool) -> bool {
        let mut state = self.state.lock();
        if wildcard {
            state.wildcard_subscriptions.insert(filter.to_string())
        } else {
            state.literal_subscriptions.insert(filter.to_string())
        }
    }

    pub fn untrack_subscription(&self, filter: &str, wildcard: bool) -> bool {
        let mut state = self.state.lock();
        if wildcard {
            state.wildcard_subscriptions.remove(filter)
        } else {
            state.literal_subscriptions.remove(filter)
        }
    }

    pub fn clear_subscriptions(&self) -> (Vec<String>, Vec<String>) {
        let mut state = self.state.lock();
        (
            state.literal_subscriptions.drain().collect(),
            state.wildcard_subscriptions.drain().collect(),
        )
    }

    fn reset(&self) {
        let mut state = self.state.lock();
        *state = SessionState::default();
    }
}

impl Clone for Will {
    fn clone(&self) -> Self {
        Will {
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            qos: self.qos,
            retain: self.retain,
        }
    }
}

/// Outcome of processing a CONNECT against the registry.
pub struct ConnectOutcome {
    pub session: Arc<Session>,
    pub session_present: bool,
}

/// Map from client id to session, owned by the broker for the life of
/// `serve`. All mutation happens from connection-handler callbacks on
/// the broker's task set, so a plain mutex guarding the map is never
/// held across an `.await`.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get-or-create a session for `client_id`, applying clean-start
    /// semantics. When clean-start clears an existing session, its
    /// previously tracked filters are returned so the caller can remove
    /// them from the subscription index too.
    pub fn connect(
        &self,
        client_id: &str,
        clean_start: bool,
    ) -> (ConnectOutcome, Vec<String>, Vec<String>) {
        let mut sessions = self.sessions.lock();
        match sessions.get(client_id) {
            Some(existing) if clean_start => {
                let (literal, wildcard) = existing.clear_subscriptions();
                existing.reset();
                (
                    ConnectOutcome {
                        session: Arc::clone(existing),
                        session_present: false,
                    },
                    literal,
                    wildcard,
                )
            }
            Some(existing) => (
                ConnectOutcome {
                    session: Arc::clone(existing),
                    session_present: true,
                },
                Vec::new(),
                Vec::new(),
            ),
            None => {
                let session = Session::new(client_id.to_string());
                sessions.insert(client_id.to_string(), Arc::clone(&session));
                (
                    ConnectOutcome {
                        session,
                        session_present: false,
                    },
                    Vec::new(),
                    Vec::new(),
                )
            }
        }
    }

    /// Called when a connection ends. Detaches the session and removes
    /// it from the registry if its expiry interval is 0.
    pub fn disconnected(&self, session: &Arc<Session>) {
        session.detach();
        if session.expiry_interval() == 0 {
            self.sessions.lock().remove(session.client_id());
        }
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(client_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_connect_has_no_session_present() {
        let registry = SessionRegistry::new();
        let (outcome, _, _) = registry.connect("client-1", true);
        assert!(!outcome.session_present);
    }

    #[test]
    fn reconnect_without_clean_start_resumes() {
        let registry = SessionRegistry::new();
        let (first, _, _) = registry.connect("client-1", false);
        first.session.track_subscription("/a/b", false);
        let (second, literal, wildcard) = registry.connect("client-1", false);
        assert!(second.session_present);
        assert!(literal.is_empty() && wildcard.is_empty());
        assert!(Arc::ptr_eq(&first.session, &second.session));
    }

    #[test]
    fn clean_start_clears_prior_subscriptions() {
        let registry = SessionRegistry::new();
        let (first, _, _) = registry.connect("client-1", false);
        first.session.track_subscription("/a/b", false);
        first.session.track_subscription("#", true);
        let (second, literal, wildcard) = registry.connect("client-1", true);
        assert!(!second.session_present);
        assert_eq!(literal, vec!["/a/b".to_string()]);
        assert_eq!(wildcard, vec!["#".to_string()]);
    }

    #[test]
    fn disconnect_with_zero_expiry_removes_session() {
        let registry = SessionRegistry::new();
        let (outcome, _, _) = registry.connect("client-1", true);
        registry.disconnected(&outcome.session);
        assert!(registry.get("client-1").is_none());
    }

    #[test]
    fn disconnect_with_nonzero_expiry_keeps_session() {
        let registry = SessionRegistry::new();
        let (outcome, _, _) = registry.connect("client-1", true);
        outcome.session.set_expiry_interval(3600);
        registry.disconnected(&outcome.session);
        assert!(registry.get("client-1").is_some());
    }

    #[test]
    fn bind_returns_previously_bound_outbox() {
        let registry = SessionRegistry::new();
        let (outcome, _, _) = registry.connect("client-1", true);
        let (first_tx, _first_rx) = mpsc::channel(1);
        assert!(outcome.session.bind(first_tx).is_none());

        let (second_tx, _second_rx) = mpsc::channel(1);
        let previous = outcome.session.bind(second_tx);
        assert!(previous.is_some());
    }
}

pub type Index = SubscriptionIndex<Session>;
