//! Connection handler (C6): the per-TCP-connection state machine.
//!
//! Drives the framed reader, dispatches decoded packets into the
//! subscription index, retained store, and session registry, and emits
//! replies through the wire codec. One instance runs per accepted
//! connection, as its own cooperative task.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::codec;
use crate::error::{Error, Result};
use crate::packet::{ConnAck, Connect, Disconnect, Packet, Publish, SubAck, Unsubscribe, UnsubAck};
use crate::properties::PropertyId;
use crate::reason::{ConnectReasonCode, DisconnectReasonCode, SubackReasonCode, UnsubackReasonCode};
use crate::retained::RetainedStore;
use crate::session::{Outgoing, Session, SessionRegistry, Will};
use crate::subscriptions::SubscriptionIndex;
use crate::topic::{self, Matcher};

/// State the handler occupies. Only `Connected` accepts most packet
/// kinds; `Awaiting-CONNECT` accepts exactly one packet before moving
/// on, and `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingConnect,
    Connected,
    Closed,
}

/// How the connection's main loop exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// An explicit DISCONNECT was received.
    Clean,
    /// EOF, a write failure, or a protocol/malformed-packet error.
    Abnormal,
    /// A later CONNECT for the same client id took the session over;
    /// that connection now owns the session's disconnect bookkeeping.
    TakenOver,
}

/// Shared broker-level tables a connection handler dispatches into.
/// Cloned (cheaply, by `Arc`) into every handler task.
pub struct Shared {
    pub subscriptions: parking_lot::Mutex<SubscriptionIndex<Session>>,
    pub retained: RetainedStore,
    pub sessions: SessionRegistry,
    /// The broker's own advertised packet-size cap, sent as the
    /// `MaximumPacketSize` CONNACK property. Distinct from a session's
    /// outbound cap on `Session`, which is adopted from the client's
    /// own CONNECT property instead.
    pub max_packet_size: u32,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            subscriptions: parking_lot::Mutex::new(SubscriptionIndex::new()),
            retained: RetainedStore::new(),
            sessions: SessionRegistry::new(),
            max_packet_size: crate::varint::MAX_VALUE,
        }
    }
}

impl Shared {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_packet_size(max_packet_size: u32) -> Self {
        Self { max_packet_size, ..Self::default() }
    }

    /// Walk the subscription index and write `payload` to every live
    /// subscriber of `topic`. Used both by PUBLISH fan-out and by the
    /// broker's programmatic `Broker::publish`.
    pub fn dispatch(&self, topic: &str, publish: &Publish) {
        let subscribers = self.subscriptions.lock().matching(topic);
        for session in subscribers {
            if let Some(outbox) = session.outbox() {
                let _ = outbox.try_send(Outgoing::Packet(Packet::Publish(publish.clone())));
            }
        }
    }
}

/// Drives one accepted connection to completion. Consumes the stream;
/// returns once the connection is closed (cleanly or abnormally).
pub async fn run<S>(stream: S, shared: Arc<Shared>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut read_buf = BytesMut::new();
    let (tx, mut rx) = mpsc::channel::<Outgoing>(64);

    let mut state = State::AwaitingConnect;
    let mut session: Option<Arc<Session>> = None;

    // Only an explicit DISCONNECT packet counts as a clean close; a
    // socket that goes away (EOF, write failure, protocol error) is
    // abnormal and must dispatch the session's will, per the network
    // losing connection without DISCONNECT (§4.6). A `TakenOver` exit
    // means a later CONNECT for the same client id rebound the session
    // out from under this connection — the new connection now owns the
    // session's lifecycle entirely, so this one must not touch it.
    let exit = 'outer: loop {
        tokio::select! {
            biased;

            outbound = rx.recv() => {
                let packet = match outbound {
                    None => continue,
                    Some(Outgoing::TakenOver) => {
                        let _ = send_disconnect(&mut writer, DisconnectReasonCode::SessionTakenOver).await;
                        break 'outer Exit::TakenOver;
                    }
                    Some(Outgoing::Packet(packet)) => packet,
                };
                if let Some(s) = &session {
                    if let Ok(len) = codec::encoded_len(&packet) {
                        if len as u32 > s.max_packet_size() {
                            warn!(client_id = s.client_id(), len, "dropping outbound packet over MaximumPacketSize");
                            continue;
                        }
                    }
                }
                if codec::write_packet(&mut writer, &packet).await.is_err() {
                    break 'outer Exit::Abnormal;
                }
            }

            read = codec::read_packet(&mut reader, &mut read_buf) => {
                let packet = match read {
                    Ok(p) => p,
                    Err(Error::ConnectionClosed) => break 'outer Exit::Abnormal,
                    Err(e) => {
                        let reason = e.disconnect_reason();
                        let _ = send_disconnect(&mut writer, reason).await;
                        break 'outer Exit::Abnormal;
                    }
                };

                match handle_packet(packet, state, &mut session, &shared, &tx, &mut writer).await {
                    Ok(Some(next)) => state = next,
                    Ok(None) => {}
                    Err(e) => {
                        let reason = e.disconnect_reason();
                        let _ = send_disconnect(&mut writer, reason).await;
                        break 'outer Exit::Abnormal;
                    }
                }

                if state == State::Closed {
                    break 'outer Exit::Clean;
                }
            }
        }
    };

    if let (Some(session), false) = (&session, matches!(exit, Exit::TakenOver)) {
        if matches!(exit, Exit::Abnormal) {
            dispatch_will(session, &shared);
        }
        shared.sessions.disconnected(session);
        if session.expiry_interval() == 0 {
            shared.subscriptions.lock().remove_subscriber(session.client_id());
        }
    }
    let _ = writer.shutdown().await;
}

async fn send_disconnect<W: AsyncWrite + Unpin>(writer: &mut W, reason: DisconnectReasonCode) -> Result<()> {
    let packet = Packet::Disconnect(Disconnect { reason, properties: Default::default() });
    codec::write_packet(writer, &packet).await
}

fn dispatch_will(session: &Arc<Session>, shared: &Shared) {
    let Some(will) = session.take_will() else { return };
    debug!(client_id = session.client_id(), topic = %will.topic, "dispatching will on abnormal disconnect");
    publish_with_retain(shared, &will.topic, will.payload.clone(), will.retain);
}

fn publish_with_retain(shared: &Shared, topic: &str, payload: Bytes, retain: bool) {
    if retain {
        shared.retained.set(topic, payload.clone());
    }
    let publish = Publish {
        dup: false,
        qos: crate::packet::QoS::AtMostOnce,
        retain,
        topic: topic.to_string(),
        packet_id: None,
        properties: Default::default(),
        payload,
    };
    shared.dispatch(topic, &publish);
}

/// Dispatch a single decoded packet. Returns the state to transition
/// to, or `None` to stay put.
async fn handle_packet<W: AsyncWrite + Unpin>(
    packet: Packet,
    state: State,
    session: &mut Option<Arc<Session>>,
    shared: &Arc<Shared>,
    tx: &mpsc::Sender<Outgoing>,
    writer: &mut W,
) -> Result<Option<State>> {
    match (state, &packet) {
        (State::AwaitingConnect, Packet::Connect(_)) => {}
        (State::AwaitingConnect, _) => {
            return Err(Error::Protocol("expected CONNECT as first packet".into()));
        }
        (
            State::Connected,
            Packet::Publish(_)
            | Packet::Subscribe(_)
            | Packet::Unsubscribe(_)
            | Packet::PingReq
            | Packet::Disconnect(_),
        ) => {}
        (State::Connected, _) => {
            return Err(Error::Protocol(format!("{:?} not accepted while connected", packet.packet_type())));
        }
        (State::Closed, _) => return Ok(None),
    }

    match packet {
        Packet::Connect(connect) => {
            let s = handle_connect(connect, session, shared, tx, writer).await?;
            Ok(Some(s))
        }
        Packet::Publish(publish) => {
            handle_publish(publish, shared)?;
            Ok(None)
        }
        Packet::Subscribe(subscribe) => {
            handle_subscribe(subscribe, session, shared, writer).await?;
            Ok(None)
        }
        Packet::Unsubscribe(unsubscribe) => {
            handle_unsubscribe(unsubscribe, session, shared, writer).await?;
            Ok(None)
        }
        Packet::PingReq => {
            codec::write_packet(writer, &Packet::PingResp).await?;
            Ok(None)
        }
        Packet::Disconnect(_) => Ok(Some(State::Closed)),
        Packet::Auth(_) => Err(Error::Protocol("AUTH not accepted: no authentication method was offered".into())),
        other => Err(Error::Protocol(format!("{:?} not accepted", other.packet_type()))),
    }
}

async fn handle_connect<W: AsyncWrite + Unpin>(
    connect: Connect,
    session_slot: &mut Option<Arc<Session>>,
    shared: &Arc<Shared>,
    tx: &mpsc::Sender<Outgoing>,
    writer: &mut W,
) -> Result<State> {
    let reason = if connect.properties.contains(PropertyId::AuthenticationMethod) {
        ConnectReasonCode::BadAuthenticationMethod
    } else if connect.user_name.is_some() || connect.password.is_some() {
        ConnectReasonCode::BadUserNameOrPassword
    } else {
        ConnectReasonCode::Success
    };

    if reason != ConnectReasonCode::Success {
        let mut props = crate::properties::Properties::new();
        props.push(PropertyId::MaximumQoS, crate::properties::PropertyValue::Byte(0));
        let connack = Packet::ConnAck(ConnAck { session_present: false, reason, properties: props });
        codec::write_packet(writer, &connack).await?;
        return Ok(State::Closed);
    }

    let (outcome, cleared_literal, cleared_wildcard) =
        shared.sessions.connect(&connect.client_id, connect.clean_start);
    {
        let mut index = shared.subscriptions.lock();
        for filter in cleared_literal.iter().chain(cleared_wildcard.iter()) {
            index.unsubscribe(filter, &connect.client_id);
        }
    }

    let session = outcome.session;
    if let Some(size) = connect.properties.get_u32(PropertyId::MaximumPacketSize) {
        session.set_max_packet_size(size);
    }
    if let Some(expiry) = connect.properties.get_u32(PropertyId::SessionExpiryInterval) {
        session.set_expiry_interval(expiry);
    }
    if let Some(will) = connect.will {
        session.set_will(Some(Will {
            topic: will.topic,
            payload: will.payload,
            qos: will.qos,
            retain: will.retain,
        }));
    } else {
        session.set_will(None);
    }
    // At most one live connection per session: a new CONNECT for a
    // client id with an already-bound session displaces the old one.
    if let Some(previous) = session.bind(tx.clone()) {
        let _ = previous.try_send(Outgoing::TakenOver);
    }

    let mut props = crate::properties::Properties::new();
    props.push(PropertyId::MaximumQoS, crate::properties::PropertyValue::Byte(0));
    props.push(PropertyId::WildcardSubscriptionAvailable, crate::properties::PropertyValue::Byte(0));
    props.push(PropertyId::SharedSubscriptionAvailable, crate::properties::PropertyValue::Byte(0));
    if shared.max_packet_size < crate::varint::MAX_VALUE {
        props.push(PropertyId::MaximumPacketSize, crate::properties::PropertyValue::FourByteInt(shared.max_packet_size));
    }

    let connack = Packet::ConnAck(ConnAck {
        session_present: outcome.session_present,
        reason: ConnectReasonCode::Success,
        properties: props,
    });
    codec::write_packet(writer, &connack).await?;
    trace!(client_id = session.client_id(), "CONNECT accepted");
    *session_slot = Some(session);
    Ok(State::Connected)
}

fn handle_publish(publish: Publish, shared: &Arc<Shared>) -> Result<()> {
    if topic::is_wildcard(&publish.topic) {
        return Err(Error::Malformed("PUBLISH topic may not contain wildcards".into()));
    }
    if !matches!(publish.qos, crate::packet::QoS::AtMostOnce) {
        return Err(Error::Protocol("this broker advertises MaximumQoS=0".into()));
    }
    if publish.retain {
        shared.retained.set(&publish.topic, publish.payload.clone());
    }
    shared.dispatch(&publish.topic, &publish);
    Ok(())
}

async fn handle_subscribe<W: AsyncWrite + Unpin>(
    subscribe: crate::packet::Subscribe,
    session: &Option<Arc<Session>>,
    shared: &Arc<Shared>,
    writer: &mut W,
) -> Result<()> {
    let Some(session) = session else {
        return Err(Error::Protocol("SUBSCRIBE before CONNECT".into()));
    };

    let mut reasons = Vec::with_capacity(subscribe.filters.len());
    let mut accepted: Vec<String> = Vec::new();
    for (filter, _options) in &subscribe.filters {
        let is_wildcard = topic::is_wildcard(filter);
        session.track_subscription(filter, is_wildcard);
        shared.subscriptions.lock().subscribe(filter, Arc::clone(session));
        accepted.push(filter.clone());
        reasons.push(SubackReasonCode::GrantedQoS0);
    }

    let suback = Packet::SubAck(SubAck {
        packet_id: subscribe.packet_id,
        properties: Default::default(),
        reasons,
    });
    codec::write_packet(writer, &suback).await?;

    for filter in accepted {
        let retained = if let Some(matcher) = Matcher::compile(&filter) {
            shared.retained.matching(&matcher)
        } else {
            shared.retained.get(&filter).into_iter().map(|r| (filter.clone(), r)).collect()
        };
        for (topic_name, retained) in retained {
            let publish = Packet::Publish(Publish {
                dup: false,
                qos: crate::packet::QoS::AtMostOnce,
                retain: true,
                topic: topic_name,
                packet_id: None,
                properties: Default::default(),
                payload: retained.payload,
            });
            codec::write_packet(writer, &publish).await?;
        }
    }
    Ok(())
}

async fn handle_unsubscribe<W: AsyncWrite + Unpin>(
    unsubscribe: Unsubscribe,
    session: &Option<Arc<Session>>,
    shared: &Arc<Shared>,
    writer: &mut W,
) -> Result<()> {
    let Some(session) = session else {
        return Err(Error::Protocol("UNSUBSCRIBE before CONNECT".into()));
    };

    let mut reasons = Vec::with_capacity(unsubscribe.filters.len());
    for filter in &unsubscribe.filters {
        let is_wildcard = topic::is_wildcard(filter);
        let existed = session.untrack_subscription(filter, is_wildcard);
        shared.subscriptions.lock().unsubscribe(filter, session.client_id());
        reasons.push(if existed {
            UnsubackReasonCode::Success
        } else {
            UnsubackReasonCode::NoSubscriptionExisted
        });
    }

    let unsuback = Packet::UnsubAck(UnsubAck {
        packet_id: unsubscribe.packet_id,
        properties: Default::default(),
        reasons,
    });
    codec::write_packet(writer, &unsuback).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    async fn handshake(stream: &mut (impl AsyncRead + AsyncWrite + Unpin)) {
        let connect = Packet::Connect(Connect {
            clean_start: true,
            keep_alive: 0,
            client_id: "t".into(),
            will: None,
            user_name: None,
            password: None,
            properties: Default::default(),
        });
        codec::write_packet(stream, &connect).await.unwrap();
    }

    #[tokio::test]
    async fn connect_then_pingreq_gets_pingresp() {
        let (client, server) = duplex(4096);
        let shared = Arc::new(Shared::new());
        let handle = tokio::spawn(run(server, shared));

        let mut client = client;
        handshake(&mut client).await;
        let mut read_buf = BytesMut::new();
        let connack = codec::read_packet(&mut client, &mut read_buf).await.unwrap();
        assert!(matches!(connack, Packet::ConnAck(ref c) if c.reason == ConnectReasonCode::Success));

        codec::write_packet(&mut client, &Packet::PingReq).await.unwrap();
        let pong = codec::read_packet(&mut client, &mut read_buf).await.unwrap();
        assert!(matches!(pong, Packet::PingResp));

        codec::write_packet(
            &mut client,
            &Packet::Disconnect(Disconnect { reason: DisconnectReasonCode::NormalDisconnection, properties: Default::default() }),
        )
        .await
        .unwrap();
        drop(client);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn connect_with_credentials_is_rejected() {
        let (mut client, server) = duplex(4096);
        let shared = Arc::new(Shared::new());
        let handle = tokio::spawn(run(server, shared));

        let connect = Packet::Connect(Connect {
            clean_start: true,
            keep_alive: 0,
            client_id: "t".into(),
            will: None,
            user_name: Some("alice".into()),
            password: None,
            properties: Default::default(),
        });
        codec::write_packet(&mut client, &connect).await.unwrap();
        let mut read_buf = BytesMut::new();
        let connack = codec::read_packet(&mut client, &mut read_buf).await.unwrap();
        match connack {
            Packet::ConnAck(c) => assert_eq!(c.reason, ConnectReasonCode::BadUserNameOrPassword),
            other => panic!("unexpected {other:?}"),
        }
        let _ = handle.await;
    }

    /// Client sends `10 10 00 04 4d 51 54 54 05 02 00 00 00 00 03 62 61
    /// 72` (CONNECT, client-id="bar"); broker replies `20 09 00 00 06 24
    /// 00 28 00 2a 00` (CONNACK, success, MaxQoS=0); client sends `e0 02
    /// 00 00` (DISCONNECT normal); broker closes.
    #[tokio::test]
    async fn plain_connect_scenario_round_trips_exemplar_bytes() {
        let (mut client, server) = duplex(4096);
        let shared = Arc::new(Shared::new());
        let handle = tokio::spawn(run(server, shared));

        let connect_bytes: &[u8] =
            &[0x10, 0x10, 0x00, 0x04, 0x4d, 0x51, 0x54, 0x54, 0x05, 0x02, 0x00, 0x00, 0x00, 0x00, 0x03, 0x62, 0x61, 0x72];
        client.write_all(connect_bytes).await.unwrap();

        let mut connack_bytes = [0u8; 11];
        client.read_exact(&mut connack_bytes).await.unwrap();
        assert_eq!(connack_bytes, [0x20, 0x09, 0x00, 0x00, 0x06, 0x24, 0x00, 0x28, 0x00, 0x2a, 0x00]);

        let disconnect_bytes: &[u8] = &[0xe0, 0x02, 0x00, 0x00];
        client.write_all(disconnect_bytes).await.unwrap();
        drop(client);
        let _ = handle.await;
    }

    /// A second CONNECT for the same client id takes the session over:
    /// the first connection is sent a DISCONNECT with
    /// `SessionTakenOver` and its handler task exits without touching
    /// the session (no will dispatch, no registry removal), since the
    /// new connection now owns it.
    #[tokio::test]
    async fn second_connect_with_same_client_id_takes_over_the_session() {
        let shared = Arc::new(Shared::new());

        let (mut first_client, first_server) = duplex(4096);
        let first_handle = tokio::spawn(run(first_server, Arc::clone(&shared)));
        handshake(&mut first_client).await;
        let mut read_buf = BytesMut::new();
        let connack = codec::read_packet(&mut first_client, &mut read_buf).await.unwrap();
        assert!(matches!(connack, Packet::ConnAck(ref c) if !c.session_present));

        let (mut second_client, second_server) = duplex(4096);
        let second_handle = tokio::spawn(run(second_server, Arc::clone(&shared)));
        codec::write_packet(
            &mut second_client,
            &Packet::Connect(Connect {
                clean_start: false,
                keep_alive: 0,
                client_id: "t".into(),
                will: None,
                user_name: None,
                password: None,
                properties: Default::default(),
            }),
        )
        .await
        .unwrap();
        let mut second_buf = BytesMut::new();
        let second_connack = codec::read_packet(&mut second_client, &mut second_buf).await.unwrap();
        assert!(matches!(second_connack, Packet::ConnAck(ref c) if c.session_present));

        let taken_over = codec::read_packet(&mut first_client, &mut read_buf).await.unwrap();
        match taken_over {
            Packet::Disconnect(d) => assert_eq!(d.reason, DisconnectReasonCode::SessionTakenOver),
            other => panic!("unexpected {other:?}"),
        }
        let _ = first_handle.await;

        let session = shared.sessions.get("t").unwrap();
        assert!(session.is_bound());

        drop(second_client);
        let _ = second_handle.await;
    }
}
