//! roost-client - async MQTT 3.1.1 / 5.0 client.
//!
//! A [`Client`] holds one logical session against one or more brokers
//! over TCP or TLS: automatic reconnect with exponential backoff, QoS
//! 0/1/2 delivery, version compromise (MQTT 5 down to 3.1.1), pluggable
//! session persistence and topic routing.
//!
//! ```no_run
//! use std::sync::Arc;
//! use roost_client::{Client, ClientConfig};
//! use roost_core::{Publish, QoS};
//!
//! # async fn run() -> roost_client::Result<()> {
//! let client = Client::new(
//!     ClientConfig::new()
//!         .server("localhost:1883")
//!         .client_id("sensor-17")
//!         .clean_session(true)
//!         .keepalive(30, 1.5)
//!         .auto_reconnect(true),
//! )?;
//!
//! client.handle("commands/sensor-17", Arc::new(|_topic, _qos, payload| {
//!     println!("command: {payload:?}");
//! }));
//! client.connect(Some(Arc::new(|server, code, err| {
//!     println!("{server}: code {code}, err {err:?}");
//! })));
//!
//! client.subscribe(&[roost_core::Topic::new("commands/sensor-17", QoS::AtLeastOnce)]).await;
//! client.publish(Publish::new("reports/sensor-17", QoS::AtLeastOnce, "online")).await;
//!
//! client.wait().await;
//! # Ok(())
//! # }
//! ```

mod backoff;
mod client;
mod config;
mod conn;
mod error;
mod notify;
mod packet_id;
mod persist;
mod router;
mod tls;

pub use client::{
    Client, ConnHandler, NetHandler, PersistHandler, PubHandler, SubHandler, UnsubHandler,
    CODE_LOCAL_FAILURE,
};
pub use config::{ClientConfig, Server};
pub use error::{ClientError, Result};
pub use persist::{
    recv_key, send_key, FilePersist, MemPersist, NonePersist, PersistError, PersistStore, Strategy,
};
pub use router::{topic_matches_filter, FilterRouter, TextRouter, TopicHandler, TopicRouter};

// The packet vocabulary callers need to publish and subscribe.
pub use roost_core::{Publish, QoS, Topic, Will};
