//! MQTT 5.0 broker and client.
//!
//! This crate provides a broker that speaks MQTT 5.0 at QoS 0 (it
//! advertises `MaximumQoS = 0` in CONNACK and rejects any higher QoS
//! from a publisher), plus a client runtime capable of the full QoS
//! 0/1/2 range for talking to third-party brokers, including the
//! PUBACK/PUBREC/PUBREL/PUBCOMP acknowledgement chain and automatic
//! reconnect/resubscribe.
//!
//! ## Components
//!
//! - [`Broker`]: listener, session registry, subscription index, and
//!   retained-message store (mqtt5d)
//! - [`Client`]: connect/reconnect loop, keep-alive pinger, pending-
//!   transaction table, and QoS1/2 acknowledgement chain (mqtt5c)
//!
//! ## Example
//!
//! ```no_run
//! use mqtt5::{Broker, BrokerConfig, Client, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> mqtt5::Result<()> {
//!     let broker = Broker::new(BrokerConfig::new("127.0.0.1:1883"));
//!     let broker_handle = broker;
//!     tokio::spawn(async move { broker_handle.serve().await });
//!
//!     let client = Client::connect(
//!         ClientConfig::new("127.0.0.1:1883", "client-1")
//!             .with_subscriptions(["test/topic"]),
//!     )
//!     .await?;
//!
//!     client.publish("test/topic", &b"hello"[..], mqtt5::QoS::AtMostOnce, false).await?;
//!     let msg = client.recv().await?;
//!     println!("received: {:?}", msg);
//!
//!     Ok(())
//! }
//! ```

mod broker;
mod client;
/// Low-level wire codec: exposed for benchmarking and for embedders that
/// want to build packets directly rather than through [`Client`]/[`Broker`].
pub mod codec;
mod connection;
mod error;
pub mod packet;
pub mod properties;
pub mod reason;
mod retained;
mod session;
mod subscriptions;
mod topic;
pub mod transport;
mod types;
pub mod varint;

pub use broker::{Broker, BrokerBuilder, BrokerConfig};
pub use client::{Client, ClientConfig};
pub use error::{Error, Result};
pub use packet::QoS;
pub use transport::TransportType;
pub use types::Message;

#[cfg(feature = "tls")]
pub use transport::tls::{ServerTlsConfig, TlsConfig};
