//! Broker lifecycle hooks.
//!
//! Observers implement [`Hook`], declare the [`HookKind`]s they want through
//! [`Hook::provides`], and are registered once through [`HooksBuilder`]. The
//! resulting [`Hooks`] table is immutable and is shared by every connection
//! task; each event is delivered to its subscribers in registration order on
//! the task of the connection that raised it.

use crate::errors::{Error, Result};
use async_trait::async_trait;
use rumqttc::mqttbytes::v4::{Connect, Publish};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    OnConnectAuthenticate,
    OnAuthPacket,
    OnConnect,
    OnDisconnect,
    OnPublish,
    OnPublished,
}

/// The connection an event belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientInfo {
    pub id: String,
    pub remote_addr: SocketAddr,
    pub username: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The client sent DISCONNECT
    ClientDisconnect,
    KeepAliveTimeout,
    /// Another connection claimed the same client id
    TakenOver,
    ServerShutdown,
    ConnectionClosed,
    ProtocolError(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ClientDisconnect => f.write_str("client disconnected"),
            DisconnectReason::KeepAliveTimeout => f.write_str("keep-alive timeout"),
            DisconnectReason::TakenOver => f.write_str("session taken over"),
            DisconnectReason::ServerShutdown => f.write_str("server shutting down"),
            DisconnectReason::ConnectionClosed => f.write_str("connection closed"),
            DisconnectReason::ProtocolError(message) => write!(f, "protocol error: {}", message),
        }
    }
}

/// A broker observer. Every method has a passthrough default, so a hook only
/// overrides the events it lists in [`Hook::provides`].
#[async_trait]
pub trait Hook: Send + Sync {
    /// Unique name, used in logs
    fn id(&self) -> &str;

    fn provides(&self) -> &'static [HookKind];

    /// Returning `false` refuses the session.
    async fn on_connect_authenticate(&self, _client: &ClientInfo, _connect: &Connect) -> bool {
        true
    }

    /// Sees the CONNECT credentials before authentication and may rewrite
    /// or reject them.
    async fn on_auth_packet(&self, _client: &ClientInfo, connect: Connect) -> Result<Connect> {
        Ok(connect)
    }

    /// Called once the session is authenticated; an error refuses it.
    async fn on_connect(&self, _client: &ClientInfo, _connect: &Connect) -> Result<()> {
        Ok(())
    }

    async fn on_disconnect(&self, _client: &ClientInfo, _reason: &DisconnectReason) {}

    /// Called before a message is routed. May rewrite it; an error rejects it.
    async fn on_publish(&self, _client: &ClientInfo, publish: Publish) -> Result<Publish> {
        Ok(publish)
    }

    /// Called after a message has been accepted and routed.
    async fn on_published(&self, _client: &ClientInfo, _publish: &Publish) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
pub struct HooksBuilder {
    hooks: Vec<Arc<dyn Hook>>,
    ids: HashSet<String>,
}

impl HooksBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a hook after the ones already added.
    ///
    /// Fails when the hook subscribes to nothing or reuses an id.
    pub fn add(mut self, hook: impl Hook + 'static) -> Result<Self> {
        let id = hook.id().to_string();

        if hook.provides().is_empty() {
            return Err(Error::Configuration(format!(
                "hook {} does not subscribe to any event",
                id
            )));
        }
        if !self.ids.insert(id.clone()) {
            return Err(Error::Configuration(format!("hook {} registered twice", id)));
        }

        self.hooks.push(Arc::new(hook));
        Ok(self)
    }

    pub fn build(self) -> Hooks {
        let mut by_kind: HashMap<HookKind, Vec<Arc<dyn Hook>>> = HashMap::new();
        for hook in &self.hooks {
            for kind in hook.provides() {
                let subscribers = by_kind.entry(*kind).or_default();
                if !subscribers.iter().any(|h| h.id() == hook.id()) {
                    subscribers.push(Arc::clone(hook));
                }
            }
        }

        Hooks { by_kind }
    }
}

/// Immutable dispatch table built at start-up
#[derive(Clone, Default)]
pub struct Hooks {
    by_kind: HashMap<HookKind, Vec<Arc<dyn Hook>>>,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (kind, hooks) in &self.by_kind {
            let ids: Vec<&str> = hooks.iter().map(|h| h.id()).collect();
            map.entry(kind, &ids);
        }
        map.finish()
    }
}

impl Hooks {
    pub fn builder() -> HooksBuilder {
        HooksBuilder::new()
    }

    pub fn provides(&self, kind: HookKind) -> bool {
        self.by_kind.get(&kind).is_some_and(|hooks| !hooks.is_empty())
    }

    fn subscribers(&self, kind: HookKind) -> &[Arc<dyn Hook>] {
        self.by_kind.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every subscriber must approve; the first refusal wins. No subscribers
    /// means the session is allowed.
    pub async fn on_connect_authenticate(&self, client: &ClientInfo, connect: &Connect) -> bool {
        for hook in self.subscribers(HookKind::OnConnectAuthenticate) {
            if !hook.on_connect_authenticate(client, connect).await {
                warn!(hook = hook.id(), client = %client.id, "Connection refused by hook");
                return false;
            }
        }
        true
    }

    pub async fn on_auth_packet(&self, client: &ClientInfo, mut connect: Connect) -> Result<Connect> {
        for hook in self.subscribers(HookKind::OnAuthPacket) {
            connect = hook.on_auth_packet(client, connect).await?;
        }
        Ok(connect)
    }

    pub async fn on_connect(&self, client: &ClientInfo, connect: &Connect) -> Result<()> {
        for hook in self.subscribers(HookKind::OnConnect) {
            hook.on_connect(client, connect).await?;
        }
        Ok(())
    }

    pub async fn on_disconnect(&self, client: &ClientInfo, reason: &DisconnectReason) {
        for hook in self.subscribers(HookKind::OnDisconnect) {
            hook.on_disconnect(client, reason).await;
        }
    }

    /// Threads the message through every subscriber. The first error aborts
    /// the chain and is returned to the caller.
    pub async fn on_publish(&self, client: &ClientInfo, mut publish: Publish) -> Result<Publish> {
        for hook in self.subscribers(HookKind::OnPublish) {
            publish = hook.on_publish(client, publish).await?;
        }
        Ok(publish)
    }

    /// Errors are logged and the remaining subscribers still run.
    pub async fn on_published(&self, client: &ClientInfo, publish: &Publish) {
        for hook in self.subscribers(HookKind::OnPublished) {
            if let Err(e) = hook.on_published(client, publish).await {
                warn!(
                    hook = hook.id(),
                    client = %client.id,
                    topic = %publish.topic,
                    "Hook failed after publish: {}",
                    e
                );
            }
        }
    }
}
