//! The device-facing side: a mutual-TLS MQTT 3.1.1 listener whose lifecycle
//! events are observed through [`hooks::Hooks`].

pub mod broker;
pub mod hooks;
pub mod ingest;
pub mod logging_hook;
pub mod tls;
pub mod topics;

pub use rumqttc::mqttbytes::v4::{Connect, Publish};
pub use rumqttc::mqttbytes::QoS;

pub use broker::{Broker, BrokerConfig};
pub use hooks::{ClientInfo, DisconnectReason, Hook, HookKind, Hooks, HooksBuilder};
pub use ingest::{IngestConfig, IngestHook, IngestStatus};
pub use logging_hook::LoggingHook;
