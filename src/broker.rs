//! MQTT 5.0 broker (mqtt0d): listener and fan-out (C7).
//!
//! Accepts connections on a TCP (optionally TLS-wrapped) endpoint and
//! hands each one to a fresh connection handler running as its own
//! task. Publishes traverse the shared subscription index to deliver
//! to each matching session's bound connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{self, Shared};
use crate::error::{Error, Result};
use crate::packet::{Publish, QoS};
use crate::varint::MAX_VALUE;

#[cfg(feature = "tls")]
use crate::transport::tls::ServerTlsConfig;

/// One address the broker binds and accepts on, plain or TLS-wrapped.
/// The broker may hold several of these at once (§6: "may listen on
/// multiple endpoints simultaneously"), e.g. a plaintext endpoint on
/// 1883 alongside a TLS endpoint on 8883.
#[derive(Clone)]
enum Endpoint {
    Plain(String),
    #[cfg(feature = "tls")]
    Tls(String, ServerTlsConfig),
}

impl Endpoint {
    fn addr(&self) -> &str {
        match self {
            Endpoint::Plain(addr) => addr,
            #[cfg(feature = "tls")]
            Endpoint::Tls(addr, _) => addr,
        }
    }
}

/// Broker configuration.
#[derive(Clone)]
pub struct BrokerConfig {
    endpoints: Vec<Endpoint>,
    /// Cap advertised to clients via `MaximumPacketSize`; also enforced
    /// when writing outbound packets.
    pub max_packet_size: u32,
}

impl BrokerConfig {
    /// Create a new broker config listening on a single plain-TCP `addr`.
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            endpoints: vec![Endpoint::Plain(addr.into())],
            max_packet_size: MAX_VALUE,
        }
    }

    pub fn with_max_packet_size(mut self, max_packet_size: u32) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    /// Listen on an additional plain-TCP address alongside whatever
    /// endpoints are already configured.
    pub fn with_plain_endpoint(mut self, addr: impl Into<String>) -> Self {
        self.endpoints.push(Endpoint::Plain(addr.into()));
        self
    }

    /// Listen on an additional TLS-wrapped address.
    #[cfg(feature = "tls")]
    pub fn with_tls_endpoint(mut self, addr: impl Into<String>, tls: ServerTlsConfig) -> Self {
        self.endpoints.push(Endpoint::Tls(addr.into(), tls));
        self
    }
}

/// Builder for [`Broker`].
pub struct BrokerBuilder {
    config: BrokerConfig,
}

impl BrokerBuilder {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    /// Add a TLS-wrapped endpoint at `addr`, on top of whatever plain
    /// endpoints `config` already names.
    #[cfg(feature = "tls")]
    pub fn tls(mut self, addr: impl Into<String>, tls: ServerTlsConfig) -> Self {
        self.config = self.config.with_tls_endpoint(addr, tls);
        self
    }

    pub fn build(self) -> Broker {
        Broker {
            shared: Arc::new(Shared::with_max_packet_size(self.config.max_packet_size)),
            config: self.config,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
            handlers: Arc::new(parking_lot::Mutex::new(Vec::new())),
            bound_addrs: parking_lot::Mutex::new(Vec::new()),
        }
    }
}

/// A running (or not-yet-started) MQTT 5 broker.
///
/// Owns the subscription index, retained store, and session registry
/// for the life of [`Broker::serve`]. Accepted connections are mutated
/// only from their own handler task; the shared tables are guarded by
/// `parking_lot` locks taken for the duration of a single synchronous
/// mutation and never held across an `.await`.
pub struct Broker {
    config: BrokerConfig,
    shared: Arc<Shared>,
    running: Arc<AtomicBool>,
    /// Woken by `stop`/`shutdown` to unblock every `accept_loop` that is
    /// parked in `listener.accept().await` — an `AtomicBool` alone is
    /// not enough, since nothing re-polls it while a loop is suspended
    /// there.
    shutdown_notify: Arc<Notify>,
    /// Connection-handler task handles, pushed to as each is spawned
    /// (not collected after the fact — `accept_loop` runs until
    /// cancelled and never returns on its own).
    handlers: Arc<parking_lot::Mutex<Vec<JoinHandle<()>>>>,
    /// Resolved local address of each endpoint, filled in as `serve`
    /// binds them. Lets an embedder (or a test using an ephemeral
    /// `:0` port) discover the actual port after calling `serve`.
    bound_addrs: parking_lot::Mutex<Vec<std::net::SocketAddr>>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        BrokerBuilder::new(config).build()
    }

    pub fn builder(config: BrokerConfig) -> BrokerBuilder {
        BrokerBuilder::new(config)
    }

    /// Bind every configured endpoint and accept connections on all of
    /// them concurrently until the broker is stopped via [`Broker::stop`]
    /// or [`Broker::shutdown`]. Each accepted connection runs its own
    /// handler task; stopping the broker does not forcibly cancel
    /// handlers already in flight — use `shutdown` for that.
    pub async fn serve(&self) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(Error::AlreadyRunning);
        }

        let mut listeners = Vec::with_capacity(self.config.endpoints.len());
        for endpoint in &self.config.endpoints {
            let listener = TcpListener::bind(endpoint.addr()).await?;
            let local_addr = listener.local_addr()?;
            info!(addr = %local_addr, "mqtt broker listening");
            self.bound_addrs.lock().push(local_addr);
            listeners.push((listener, endpoint.clone()));
        }

        let mut accept_tasks = Vec::with_capacity(listeners.len());
        for (listener, endpoint) in listeners {
            let shared = Arc::clone(&self.shared);
            let handlers = Arc::clone(&self.handlers);
            let notify = Arc::clone(&self.shutdown_notify);
            accept_tasks.push(tokio::spawn(accept_loop(listener, endpoint, shared, handlers, notify)));
        }

        for task in accept_tasks {
            let _ = task.await;
        }
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Addresses the broker is actually bound to, once [`Broker::serve`]
    /// has started. Empty before `serve` binds its listeners (useful for
    /// tests that bind an ephemeral `:0` port and need the real one).
    pub fn local_addrs(&self) -> Vec<std::net::SocketAddr> {
        self.bound_addrs.lock().clone()
    }

    /// Convenience for the common single-endpoint case.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.bound_addrs.lock().first().copied()
    }

    /// Stop accepting new connections on every endpoint. Connections
    /// already accepted run to completion; call [`Broker::shutdown`] to
    /// also cancel them. Unblocks every `accept_loop` parked in
    /// `listener.accept().await`, so a task awaiting [`Broker::serve`]
    /// returns promptly.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
    }

    /// Stop accepting new connections and cancel every handler task
    /// still in flight.
    pub fn shutdown(&self) {
        self.stop();
        for handle in self.handlers.lock().drain(..) {
            handle.abort();
        }
    }

    /// Publish `payload` on `topic` as a broker-originated message,
    /// walking the subscription index the same way an incoming PUBLISH
    /// would. Available to embedders that want to inject messages
    /// without a client connection of their own.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) {
        let publish = Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: topic.to_string(),
            packet_id: None,
            properties: Default::default(),
            payload: payload.into(),
        };
        self.shared.dispatch(topic, &publish);
    }
}

/// Accept loop for a single bound endpoint. Runs until `notify` fires
/// (from `Broker::stop`/`shutdown`), racing the next `accept()` against
/// it so a blocked `accept().await` is interrupted rather than leaving
/// this task — and thus `Broker::serve`'s await on it — stuck forever.
/// Each spawned handler's `JoinHandle` is pushed into the broker's
/// shared `handlers` list as soon as it exists, so `shutdown` can abort
/// it even while this loop is still running.
async fn accept_loop(
    listener: TcpListener,
    endpoint: Endpoint,
    shared: Arc<Shared>,
    handlers: Arc<parking_lot::Mutex<Vec<JoinHandle<()>>>>,
    notify: Arc<Notify>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            biased;
            _ = notify.notified() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            },
        };
        debug!(%peer, addr = endpoint.addr(), "accepted connection");
        let shared = Arc::clone(&shared);

        let handle = match endpoint.clone() {
            #[cfg(feature = "tls")]
            Endpoint::Tls(_, tls) => tokio::spawn(async move {
                match tls.accept(stream).await {
                    Ok(tls_stream) => connection::run(tls_stream, shared).await,
                    Err(e) => warn!(%peer, error = %e, "tls handshake failed"),
                }
            }),
            Endpoint::Plain(_) => tokio::spawn(async move {
                connection::run(stream, shared).await;
            }),
        };
        handlers.lock().push(handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_config_defaults_max_packet_size() {
        let config = BrokerConfig::new("127.0.0.1:1883");
        assert_eq!(config.max_packet_size, MAX_VALUE);
    }

    #[test]
    fn broker_builder_produces_stopped_broker() {
        let broker = Broker::new(BrokerConfig::new("127.0.0.1:0"));
        assert!(!broker.running.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn serve_twice_is_rejected() {
        let broker = Arc::new(Broker::new(BrokerConfig::new("127.0.0.1:0")));
        let b2 = Arc::clone(&broker);
        let handle = tokio::spawn(async move { b2.serve().await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let err = broker.serve().await.unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning));
        broker.shutdown();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn serve_binds_every_configured_endpoint() {
        let config = BrokerConfig::new("127.0.0.1:0").with_plain_endpoint("127.0.0.1:0");
        let broker = Arc::new(Broker::new(config));
        let b2 = Arc::clone(&broker);
        let handle = tokio::spawn(async move { b2.serve().await });

        let mut addrs = Vec::new();
        for _ in 0..50 {
            addrs = broker.local_addrs();
            if addrs.len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(addrs.len(), 2);
        assert_ne!(addrs[0].port(), addrs[1].port());

        broker.shutdown();
        let _ = handle.await;
    }
}
