//! MQTT 5.0 client runtime (mqtt0c) (C8).
//!
//! Maintains a connect/reconnect loop with backoff, a keep-alive
//! pinger, a pending-transaction table keyed by packet identifier, a
//! `receive_maximum`-bounded QoS1/QoS2 acknowledgement chain, and
//! topic-alias bookkeeping for outbound publishes. A background
//! monitor task watches the connection once it is established and
//! transparently reconnects (honoring `connect_delays`) and
//! resubscribes if it is ever lost.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::codec;
use crate::error::{Error, Result};
use crate::packet::{
    Connect, ConnAck, Disconnect, Packet, PubRel, Publish, QoS, Subscribe, SubscribeOptions, Unsubscribe, Will,
};
use crate::properties::{Properties, PropertyId, PropertyValue};
use crate::reason::{DisconnectReasonCode, PubrelReasonCode};
use crate::transport::Transport;
use crate::types::Message;

#[cfg(feature = "tls")]
use crate::transport::tls::TlsConfig;

/// Client-side configuration, built up fluently before [`Client::connect`]
/// or [`Client::start`].
#[derive(Clone)]
pub struct ClientConfig {
    pub addr: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<Bytes>,
    pub will: Option<(String, Bytes, bool)>,
    pub keep_alive_s: u16,
    pub response_timeout: Duration,
    pub resume_session: bool,
    pub session_expiry_interval: u32,
    pub max_packet_size: Option<u32>,
    pub subscriptions: Vec<String>,
    pub topic_aliases: Vec<String>,
    pub topic_alias_maximum: u16,
    pub connect_delays: Vec<Duration>,
    #[cfg(feature = "tls")]
    pub tls: Option<TlsConfig>,
}

impl ClientConfig {
    /// Create a config for `client_id` connecting to `addr`. If
    /// `client_id` is empty, a `mqttools-<14-hex>` id is generated.
    pub fn new(addr: impl Into<String>, client_id: impl Into<String>) -> Self {
        let client_id = client_id.into();
        let client_id = if client_id.is_empty() { generate_client_id() } else { client_id };
        Self {
            addr: addr.into(),
            client_id,
            username: None,
            password: None,
            will: None,
            keep_alive_s: 0,
            response_timeout: Duration::from_secs(10),
            resume_session: false,
            session_expiry_interval: 0,
            max_packet_size: None,
            subscriptions: Vec::new(),
            topic_aliases: Vec::new(),
            topic_alias_maximum: 0,
            connect_delays: Vec::new(),
            #[cfg(feature = "tls")]
            tls: None,
        }
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<Bytes>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn with_will(mut self, topic: impl Into<String>, payload: impl Into<Bytes>, retain: bool) -> Self {
        self.will = Some((topic.into(), payload.into(), retain));
        self
    }

    pub fn with_keep_alive(mut self, seconds: u16) -> Self {
        self.keep_alive_s = seconds;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Ask the broker to resume the session for this client id instead
    /// of starting clean. `clean_start` is `!resume_session` on the
    /// wire.
    pub fn with_resume_session(mut self, resume: bool) -> Self {
        self.resume_session = resume;
        self
    }

    pub fn with_session_expiry(mut self, seconds: u32) -> Self {
        self.session_expiry_interval = seconds;
        self
    }

    /// Advertise a maximum packet size the broker must respect for
    /// outbound packets on this connection.
    pub fn with_max_packet_size(mut self, max_packet_size: u32) -> Self {
        self.max_packet_size = Some(max_packet_size);
        self
    }

    pub fn with_subscriptions(mut self, filters: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.subscriptions = filters.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_topic_aliases(mut self, topics: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.topic_aliases = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_topic_alias_maximum(mut self, max: u16) -> Self {
        self.topic_alias_maximum = max;
        self
    }

    /// Delays between reconnect attempts, used both by [`Client::start`]
    /// for the initial connect and by the background monitor task for
    /// any later reconnect. The last value is reused once the list is
    /// exhausted; an empty list disables retry entirely.
    pub fn with_connect_delays(mut self, delays: impl IntoIterator<Item = Duration>) -> Self {
        self.connect_delays = delays.into_iter().collect();
        self
    }

    #[cfg(feature = "tls")]
    pub fn with_tls(mut self, tls: TlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }
}

fn generate_client_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    format!("mqttools-{:014x}", nanos as u64 & 0xFFFFFFFFFFFFF)
}

type Writer = WriteHalf<Transport>;

struct PendingTable {
    next_id: AtomicU16,
    waiters: SyncMutex<HashMap<u16, oneshot::Sender<Packet>>>,
}

impl PendingTable {
    fn new() -> Self {
        Self { next_id: AtomicU16::new(1), waiters: SyncMutex::new(HashMap::new()) }
    }

    /// Allocate the next free packet identifier, wrapping 1..=65535 and
    /// skipping any id still awaiting a response.
    fn allocate(&self) -> u16 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let id = if id == 0 {
                self.next_id.store(2, Ordering::SeqCst);
                1
            } else {
                id
            };
            if !self.waiters.lock().contains_key(&id) {
                return id;
            }
        }
    }

    fn register(&self, id: u16) -> oneshot::Receiver<Packet> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(id, tx);
        rx
    }

    fn resolve(&self, id: u16, packet: Packet) {
        if let Some(tx) = self.waiters.lock().remove(&id) {
            let _ = tx.send(packet);
        }
    }

    fn cancel(&self, id: u16) {
        self.waiters.lock().remove(&id);
    }
}

/// State shared between the `Client` handle and its reader, keep-alive,
/// and monitor tasks. Held behind an `Arc` so the monitor task can
/// rebuild the connection (writer, reader task, keep-alive task) in
/// place across a reconnect without the caller's `Client` handle
/// changing identity.
struct Inner {
    config: ClientConfig,
    writer: AsyncMutex<Writer>,
    pending: PendingTable,
    aliases: SyncMutex<HashMap<String, u16>>,
    next_alias: AtomicU16,
    /// Whether the client as a whole should still be connected. Cleared
    /// by `Client::disconnect`, or by the monitor task once
    /// `connect_delays` is exhausted after a drop; left set across a
    /// transient loss the monitor is still retrying.
    running: AtomicBool,
    incoming_tx: mpsc::Sender<Message>,
    reader_task: SyncMutex<JoinHandle<()>>,
    keepalive_task: SyncMutex<Option<JoinHandle<()>>>,
    session_present: AtomicBool,
    /// Bounds the number of in-flight QoS1/2 publishes, seeded from the
    /// CONNACK `ReceiveMaximum` property (default 65535 if absent).
    receive_maximum: Semaphore,
    /// Filters currently subscribed, in subscribe order, so the
    /// monitor task can re-issue them after a reconnect.
    subscribed: SyncMutex<Vec<String>>,
}

/// A connected MQTT 5 client. Holds the write half of the transport,
/// the pending-transaction table, and per-connection topic-alias state;
/// the read half is driven by a spawned reader task that forwards
/// incoming PUBLISHes to [`Client::recv`] and resolves pending
/// transactions from SUBACK/UNSUBACK/PUBACK/PUBREC/PUBCOMP. A background
/// monitor task reconnects and resubscribes if the connection drops.
pub struct Client {
    inner: Arc<Inner>,
    incoming: AsyncMutex<mpsc::Receiver<Message>>,
    monitor_task: JoinHandle<()>,
}

impl Client {
    /// Connect once, with no retry on the initial attempt. See
    /// [`Client::start`] for a variant that also retries the initial
    /// connect. Both spawn the background monitor task that reconnects
    /// a subsequently lost connection.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        let (reader, writer, connack) = dial(&config).await?;

        let receive_maximum = connack.properties.get_u16(PropertyId::ReceiveMaximum).unwrap_or(65535);
        let (tx, rx) = mpsc::channel(64);

        let inner = Arc::new(Inner {
            config: config.clone(),
            writer: AsyncMutex::new(writer),
            pending: PendingTable::new(),
            aliases: SyncMutex::new(HashMap::new()),
            next_alias: AtomicU16::new(1),
            running: AtomicBool::new(true),
            incoming_tx: tx,
            // Placeholder, replaced immediately below once the real
            // reader task can be spawned with an `Arc<Inner>` to drive.
            reader_task: SyncMutex::new(tokio::spawn(async {})),
            keepalive_task: SyncMutex::new(None),
            session_present: AtomicBool::new(connack.session_present),
            receive_maximum: Semaphore::new(receive_maximum as usize),
            subscribed: SyncMutex::new(Vec::new()),
        });

        let reader_task = tokio::spawn(reader_loop(Arc::clone(&inner), reader));
        *inner.reader_task.lock() = reader_task;

        if config.keep_alive_s > 0 {
            let period = keepalive_period(config.keep_alive_s, config.response_timeout);
            *inner.keepalive_task.lock() = Some(tokio::spawn(keepalive_loop(Arc::clone(&inner), period)));
        }

        let monitor_task = tokio::spawn(monitor_loop(Arc::clone(&inner)));

        let client = Self { inner, incoming: AsyncMutex::new(rx), monitor_task };

        if config.resume_session && !client.session_present() {
            for filter in &config.subscriptions {
                let _ = client.subscribe(&[(filter.clone(), SubscribeOptions::default())]).await;
            }
            return Err(Error::SessionResumeError);
        }

        for filter in &config.subscriptions {
            client.subscribe(&[(filter.clone(), SubscribeOptions::default())]).await?;
        }

        Ok(client)
    }

    /// Connect, retrying according to `config.connect_delays` on
    /// connection-refused, timeout, or subscribe failure. The last
    /// delay in the list is reused once the list is exhausted; an empty
    /// list means "no retry".
    pub async fn start(config: ClientConfig) -> Result<Self> {
        let mut attempt = 0usize;
        loop {
            match Self::connect(config.clone()).await {
                Ok(client) => return Ok(client),
                Err(Error::ConnectionRefused(_)) | Err(Error::Timeout(_)) | Err(Error::SubscribeFailed(_)) => {
                    let Some(delay) = config.connect_delays.get(attempt).or_else(|| config.connect_delays.last())
                    else {
                        return Self::connect(config).await;
                    };
                    warn!(attempt, ?delay, "reconnect attempt failed, retrying");
                    tokio::time::sleep(*delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn client_id(&self) -> &str {
        &self.inner.config.client_id
    }

    pub fn session_present(&self) -> bool {
        self.inner.session_present.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Publish `payload` on `topic` at the given QoS. If `topic` is one
    /// of the configured `topic_aliases` and has not yet been used on
    /// this connection, the first publish sends the full topic string
    /// and registers the alias; subsequent publishes send an empty
    /// topic with the `TopicAlias` property instead.
    ///
    /// QoS 0 returns as soon as the packet is written. QoS 1 waits for
    /// PUBACK; QoS 2 drives the PUBREC -> PUBREL -> PUBCOMP chain. Both
    /// non-zero QoS levels first acquire a permit from the
    /// `receive_maximum` semaphore, bounding in-flight publishes to
    /// what the broker advertised in CONNACK.
    pub async fn publish(&self, topic: &str, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> Result<()> {
        Self::do_publish(&self.inner, topic, payload.into(), qos, retain).await
    }

    async fn do_publish(inner: &Arc<Inner>, topic: &str, payload: Bytes, qos: QoS, retain: bool) -> Result<()> {
        let mut properties = Properties::new();
        let wire_topic = if inner.config.topic_aliases.iter().any(|t| t == topic) {
            let mut aliases = inner.aliases.lock();
            if let Some(&alias) = aliases.get(topic) {
                properties.push(PropertyId::TopicAlias, PropertyValue::TwoByteInt(alias));
                String::new()
            } else {
                let alias = inner.next_alias.fetch_add(1, Ordering::SeqCst);
                aliases.insert(topic.to_string(), alias);
                properties.push(PropertyId::TopicAlias, PropertyValue::TwoByteInt(alias));
                topic.to_string()
            }
        } else {
            topic.to_string()
        };

        if qos == QoS::AtMostOnce {
            let publish = Packet::Publish(Publish {
                dup: false,
                qos,
                retain,
                topic: wire_topic,
                packet_id: None,
                properties,
                payload,
            });
            return codec::write_packet(&mut *inner.writer.lock().await, &publish).await;
        }

        let _permit = inner.receive_maximum.acquire().await.map_err(|_| Error::ConnectionClosed)?;
        let packet_id = inner.pending.allocate();
        let rx = inner.pending.register(packet_id);
        let publish = Packet::Publish(Publish {
            dup: false,
            qos,
            retain,
            topic: wire_topic,
            packet_id: Some(packet_id),
            properties,
            payload,
        });
        codec::write_packet(&mut *inner.writer.lock().await, &publish).await?;

        let first = match wait_for(inner, packet_id, rx, "PUBACK/PUBREC").await {
            Ok(p) => p,
            Err(e) => {
                inner.pending.cancel(packet_id);
                return Err(e);
            }
        };

        match (qos, first) {
            (QoS::AtLeastOnce, Packet::PubAck(ack)) => {
                if ack.reason.is_success() {
                    Ok(())
                } else {
                    Err(Error::PublishFailed(format!("{:?}", ack.reason)))
                }
            }
            (QoS::ExactlyOnce, Packet::PubRec(rec)) => {
                if !rec.reason.is_success() {
                    return Err(Error::PublishFailed(format!("{:?}", rec.reason)));
                }
                let rx2 = inner.pending.register(packet_id);
                let pubrel = Packet::PubRel(PubRel {
                    packet_id,
                    reason: PubrelReasonCode::Success,
                    properties: Properties::new(),
                });
                codec::write_packet(&mut *inner.writer.lock().await, &pubrel).await?;
                let second = match wait_for(inner, packet_id, rx2, "PUBCOMP").await {
                    Ok(p) => p,
                    Err(e) => {
                        inner.pending.cancel(packet_id);
                        return Err(e);
                    }
                };
                match second {
                    Packet::PubComp(comp) if comp.reason.is_success() => Ok(()),
                    Packet::PubComp(comp) => Err(Error::PublishFailed(format!("{:?}", comp.reason))),
                    other => Err(Error::UnexpectedPacket {
                        expected: "PUBCOMP".into(),
                        got: format!("{:?}", other.packet_type()),
                    }),
                }
            }
            (_, other) => Err(Error::UnexpectedPacket {
                expected: "PUBACK/PUBREC".into(),
                got: format!("{:?}", other.packet_type()),
            }),
        }
    }

    /// Subscribe to every `(filter, options)` pair in one SUBSCRIBE,
    /// failing if any reason code is not success. Successful filters
    /// are tracked so the monitor task can resubscribe after a
    /// reconnect.
    pub async fn subscribe(&self, filters: &[(String, SubscribeOptions)]) -> Result<()> {
        Self::do_subscribe(&self.inner, filters).await
    }

    async fn do_subscribe(inner: &Arc<Inner>, filters: &[(String, SubscribeOptions)]) -> Result<()> {
        let packet_id = inner.pending.allocate();
        let rx = inner.pending.register(packet_id);
        let subscribe = Packet::Subscribe(Subscribe {
            packet_id,
            properties: Properties::new(),
            filters: filters.to_vec(),
        });
        codec::write_packet(&mut *inner.writer.lock().await, &subscribe).await?;

        let reply = match tokio::time::timeout(inner.config.response_timeout, rx).await {
            Ok(Ok(packet)) => packet,
            Ok(Err(_)) => return Err(Error::ConnectionClosed),
            Err(_) => {
                inner.pending.cancel(packet_id);
                return Err(Error::Timeout("SUBACK".into()));
            }
        };
        let Packet::SubAck(suback) = reply else {
            return Err(Error::Protocol("expected SUBACK".into()));
        };
        if let Some(reason) = suback.reasons.iter().find(|r| !r.is_success()) {
            return Err(Error::SubscribeFailed(*reason));
        }

        let mut subscribed = inner.subscribed.lock();
        for (filter, _) in filters {
            if !subscribed.iter().any(|f| f == filter) {
                subscribed.push(filter.clone());
            }
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, filters: &[String]) -> Result<()> {
        let packet_id = self.inner.pending.allocate();
        let rx = self.inner.pending.register(packet_id);
        let unsubscribe = Packet::Unsubscribe(Unsubscribe {
            packet_id,
            properties: Properties::new(),
            filters: filters.to_vec(),
        });
        codec::write_packet(&mut *self.inner.writer.lock().await, &unsubscribe).await?;

        let reply = match tokio::time::timeout(self.inner.config.response_timeout, rx).await {
            Ok(Ok(packet)) => packet,
            Ok(Err(_)) => return Err(Error::ConnectionClosed),
            Err(_) => {
                self.inner.pending.cancel(packet_id);
                return Err(Error::Timeout("UNSUBACK".into()));
            }
        };
        let Packet::UnsubAck(unsuback) = reply else {
            return Err(Error::Protocol("expected UNSUBACK".into()));
        };
        if let Some(reason) = unsuback.reasons.iter().find(|r| !r.is_success()) {
            return Err(Error::Protocol(format!("unsubscribe failed: {reason:?}")));
        }

        self.inner.subscribed.lock().retain(|f| !filters.contains(f));
        Ok(())
    }

    /// Await the next received application message. Returns
    /// `Err(ConnectionClosed)` once the reader task has shut down for
    /// good (the client is no longer running and won't reconnect) and
    /// no further messages will arrive.
    pub async fn recv(&self) -> Result<Message> {
        self.incoming.lock().await.recv().await.ok_or(Error::ConnectionClosed)
    }

    pub async fn recv_timeout(&self, timeout: Duration) -> Result<Message> {
        tokio::time::timeout(timeout, self.recv()).await.map_err(|_| Error::Timeout("message".into()))?
    }

    /// Send a normal DISCONNECT and stop every background task,
    /// including the monitor task, so a deliberate disconnect is never
    /// mistaken for a lost connection to reconnect from.
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.running.store(false, Ordering::SeqCst);
        let disconnect = Packet::Disconnect(Disconnect {
            reason: DisconnectReasonCode::NormalDisconnection,
            properties: Properties::new(),
        });
        {
            let mut writer = self.inner.writer.lock().await;
            let _ = codec::write_packet(&mut *writer, &disconnect).await;
            let _ = writer.shutdown().await;
        }
        self.monitor_task.abort();
        self.inner.reader_task.lock().abort();
        if let Some(task) = &*self.inner.keepalive_task.lock() {
            task.abort();
        }
        Ok(())
    }
}

async fn wrap_transport(config: &ClientConfig, stream: TcpStream) -> Result<Transport> {
    #[cfg(feature = "tls")]
    if let Some(tls) = &config.tls {
        let host = config.addr.rsplit_once(':').map(|(h, _)| h).unwrap_or(&config.addr);
        let tls_stream = tls.connect(stream, host).await?;
        return Ok(Transport::Tls(Box::new(tls_stream)));
    }
    let _ = config;
    Ok(Transport::Tcp(stream))
}

fn build_connect(config: &ClientConfig) -> Packet {
    let mut properties = Properties::new();
    if config.session_expiry_interval > 0 {
        properties.push(PropertyId::SessionExpiryInterval, PropertyValue::FourByteInt(config.session_expiry_interval));
    }
    if config.topic_alias_maximum > 0 {
        properties.push(PropertyId::TopicAliasMaximum, PropertyValue::TwoByteInt(config.topic_alias_maximum));
    }
    if let Some(max_packet_size) = config.max_packet_size {
        properties.push(PropertyId::MaximumPacketSize, PropertyValue::FourByteInt(max_packet_size));
    }

    let will = config.will.as_ref().map(|(topic, payload, retain)| Will {
        topic: topic.clone(),
        payload: payload.clone(),
        qos: QoS::AtMostOnce,
        retain: *retain,
        properties: Properties::new(),
    });

    Packet::Connect(Connect {
        clean_start: !config.resume_session,
        keep_alive: config.keep_alive_s,
        client_id: config.client_id.clone(),
        will,
        user_name: config.username.clone(),
        password: config.password.clone(),
        properties,
    })
}

/// Open a fresh TCP (optionally TLS-wrapped) connection to
/// `config.addr`, send CONNECT, and wait for a successful CONNACK
/// within `config.response_timeout`. Used for the initial connect and
/// for every reconnect attempt the monitor task makes.
async fn dial(config: &ClientConfig) -> Result<(ReadHalf<Transport>, Writer, ConnAck)> {
    let stream = TcpStream::connect(&config.addr).await?;
    let transport = wrap_transport(config, stream).await?;
    let (mut reader, mut writer) = tokio::io::split(transport);

    let connect_packet = build_connect(config);
    codec::write_packet(&mut writer, &connect_packet).await?;

    let mut read_buf = bytes::BytesMut::new();
    let connack = tokio::time::timeout(config.response_timeout, codec::read_packet(&mut reader, &mut read_buf))
        .await
        .map_err(|_| Error::Timeout("CONNACK".into()))??;

    let connack = match connack {
        Packet::ConnAck(c) => c,
        other => {
            return Err(Error::UnexpectedPacket {
                expected: "CONNACK".into(),
                got: format!("{:?}", other.packet_type()),
            })
        }
    };
    if !connack.reason.is_success() {
        return Err(Error::ConnectionRefused(connack.reason));
    }
    Ok((reader, writer, connack))
}

/// Await `rx` up to `config.response_timeout`, cancelling the pending
/// entry for `packet_id` on timeout so it cannot be resolved late by a
/// stray reply.
async fn wait_for(inner: &Arc<Inner>, packet_id: u16, rx: oneshot::Receiver<Packet>, what: &str) -> Result<Packet> {
    match tokio::time::timeout(inner.config.response_timeout, rx).await {
        Ok(Ok(packet)) => Ok(packet),
        Ok(Err(_)) => Err(Error::ConnectionClosed),
        Err(_) => {
            inner.pending.cancel(packet_id);
            Err(Error::Timeout(what.into()))
        }
    }
}

async fn reader_loop(inner: Arc<Inner>, mut reader: ReadHalf<Transport>) {
    let mut read_buf = bytes::BytesMut::new();
    loop {
        let packet = match codec::read_packet(&mut reader, &mut read_buf).await {
            Ok(p) => p,
            Err(e) => {
                debug!(error = ?e, "client reader stopped");
                return;
            }
        };
        match packet {
            Packet::Publish(publish) => {
                let message = Message::from_publish(&publish);
                if inner.incoming_tx.send(message).await.is_err() {
                    return;
                }
            }
            Packet::SubAck(ref s) => inner.pending.resolve(s.packet_id, packet),
            Packet::UnsubAck(ref u) => inner.pending.resolve(u.packet_id, packet),
            Packet::PubAck(ref p) => inner.pending.resolve(p.packet_id, packet),
            Packet::PubRec(ref p) => inner.pending.resolve(p.packet_id, packet),
            Packet::PubComp(ref p) => inner.pending.resolve(p.packet_id, packet),
            Packet::PingResp => trace!("received PINGRESP"),
            Packet::Disconnect(d) => {
                debug!(reason = ?d.reason, "broker sent DISCONNECT");
                return;
            }
            _ => {}
        }
    }
}

/// Background pinger: sends PINGREQ every `period` seconds. PINGRESP
/// handling happens in the reader loop; a broker that never answers is
/// caught by the next operation's own response-timeout rather than by
/// this task.
async fn keepalive_loop(inner: Arc<Inner>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // first tick fires immediately
    loop {
        interval.tick().await;
        if !inner.running.load(Ordering::SeqCst) {
            return;
        }
        let mut writer = inner.writer.lock().await;
        if codec::write_packet(&mut *writer, &Packet::PingReq).await.is_err() {
            return;
        }
    }
}

/// Watches the connection once it is established: once the reader task
/// has exited (EOF, malformed packet, or a DISCONNECT from the broker)
/// while the client is still meant to be running, reconnects honoring
/// `connect_delays` and re-issues SUBSCRIBE for every previously
/// subscribed filter, in subscribe order.
async fn monitor_loop(inner: Arc<Inner>) {
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        if !inner.running.load(Ordering::SeqCst) {
            return;
        }
        if inner.reader_task.lock().is_finished() {
            warn!(client_id = %inner.config.client_id, "connection lost, reconnecting");
            if reconnect(&inner).await.is_err() {
                warn!(client_id = %inner.config.client_id, "reconnect exhausted connect_delays, giving up");
                inner.running.store(false, Ordering::SeqCst);
                return;
            }
        }
    }
}

/// Redial `inner.config.addr`, retrying per `connect_delays` on
/// connection-refused/timeout/IO errors, then rewire the writer and
/// reader/keep-alive tasks and resubscribe to every tracked filter.
async fn reconnect(inner: &Arc<Inner>) -> Result<()> {
    let mut attempt = 0usize;
    let (reader, writer, connack) = loop {
        match dial(&inner.config).await {
            Ok(parts) => break parts,
            Err(Error::ConnectionRefused(_)) | Err(Error::Timeout(_)) | Err(Error::Io(_)) => {
                let Some(delay) =
                    inner.config.connect_delays.get(attempt).or_else(|| inner.config.connect_delays.last())
                else {
                    return Err(Error::ConnectionClosed);
                };
                warn!(attempt, ?delay, "reconnect attempt failed, retrying");
                tokio::time::sleep(*delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    };

    *inner.writer.lock().await = writer;
    inner.session_present.store(connack.session_present, Ordering::SeqCst);

    let new_reader_task = tokio::spawn(reader_loop(Arc::clone(inner), reader));
    std::mem::replace(&mut *inner.reader_task.lock(), new_reader_task).abort();

    if inner.config.keep_alive_s > 0 {
        let period = keepalive_period(inner.config.keep_alive_s, inner.config.response_timeout);
        let new_keepalive = tokio::spawn(keepalive_loop(Arc::clone(inner), period));
        if let Some(old) = inner.keepalive_task.lock().replace(new_keepalive) {
            old.abort();
        }
    }

    let filters: Vec<String> = inner.subscribed.lock().clone();
    for filter in filters {
        Client::do_subscribe(inner, &[(filter, SubscribeOptions::default())]).await?;
    }
    Ok(())
}

/// `max(1, keep_alive_s - response_timeout - 1)`: ping early enough
/// that a lost PINGRESP is still detectable within the keep-alive
/// window, not naively every `keep_alive_s` seconds.
pub(crate) fn keepalive_period(keep_alive_s: u16, response_timeout: Duration) -> Duration {
    let period = (keep_alive_s as i64) - (response_timeout.as_secs() as i64) - 1;
    Duration::from_secs(period.max(1) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_generates_id_when_empty() {
        let config = ClientConfig::new("127.0.0.1:1883", "");
        assert!(config.client_id.starts_with("mqttools-"));
    }

    #[test]
    fn client_config_keeps_explicit_id() {
        let config = ClientConfig::new("127.0.0.1:1883", "explicit");
        assert_eq!(config.client_id, "explicit");
    }

    #[test]
    fn keepalive_period_leaves_room_for_response_timeout() {
        let period = keepalive_period(60, Duration::from_secs(10));
        assert_eq!(period, Duration::from_secs(49));
    }

    #[test]
    fn keepalive_period_floors_at_one_second() {
        let period = keepalive_period(5, Duration::from_secs(10));
        assert_eq!(period, Duration::from_secs(1));
    }

    #[test]
    fn pending_table_allocates_distinct_ids() {
        let table = PendingTable::new();
        let a = table.allocate();
        let _rx = table.register(a);
        let b = table.allocate();
        assert_ne!(a, b);
    }
}
