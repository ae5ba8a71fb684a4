//! Error types for mqtt5.

use std::io;

use crate::reason::{ConnectReasonCode, DisconnectReasonCode};

/// Result type alias for mqtt5.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for mqtt5 operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The byte stream does not form a valid MQTT 5 packet.
    ///
    /// Maps to `DisconnectReasonCode::MalformedPacket` (0x81) at the
    /// connection boundary.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// A packet was well-formed but invalid for the connection's current
    /// state (wrong order, forbidden type, QoS above what was negotiated).
    ///
    /// Maps to `DisconnectReasonCode::ProtocolError` (0x82).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Connection refused by broker (carries the CONNACK reason).
    #[error("connection refused: {0:?}")]
    ConnectionRefused(ConnectReasonCode),

    /// Authentication failed (credentials or auth-method present; this
    /// broker accepts neither).
    #[error("authentication failed")]
    AuthenticationFailed,

    /// Connection closed by peer (clean EOF, no MQTT-level reason given).
    #[error("connection closed")]
    ConnectionClosed,

    /// Broker sent DISCONNECT with a non-normal reason.
    #[error("disconnected by peer: {0:?}")]
    Disconnected(DisconnectReasonCode),

    /// Unexpected packet received.
    #[error("unexpected packet: expected {expected}, got {got}")]
    UnexpectedPacket { expected: String, got: String },

    /// A request was not acknowledged within `response_timeout`.
    #[error("timeout waiting for {0}")]
    Timeout(String),

    /// SUBSCRIBE was rejected by the broker.
    #[error("subscribe failed: {0:?}")]
    SubscribeFailed(crate::reason::SubackReasonCode),

    /// A QoS 1/2 PUBLISH was not acknowledged with a success reason
    /// (PUBACK, PUBREC, or PUBCOMP).
    #[error("publish failed: {0}")]
    PublishFailed(String),

    /// Client asked to resume a session but the broker reported none.
    #[error("session could not be resumed")]
    SessionResumeError,

    /// Invalid configuration supplied by the embedder.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Broker is already running.
    #[error("broker already running")]
    AlreadyRunning,

    /// Broker is shutting down.
    #[error("broker shutting down")]
    ShuttingDown,
}

impl Error {
    /// The DISCONNECT reason code this error should be reported with, if any.
    pub fn disconnect_reason(&self) -> DisconnectReasonCode {
        match self {
            Error::Malformed(_) => DisconnectReasonCode::MalformedPacket,
            Error::Protocol(_) => DisconnectReasonCode::ProtocolError,
            _ => DisconnectReasonCode::UnspecifiedError,
        }
    }
}
