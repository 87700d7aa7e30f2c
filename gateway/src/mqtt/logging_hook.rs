use crate::errors::Result;
use crate::mqtt::hooks::{ClientInfo, DisconnectReason, Hook, HookKind};
use async_trait::async_trait;
use rumqttc::mqttbytes::v4::{Connect, Publish};
use tracing::{debug, info};

/// Diagnostic observer: traces the connection lifecycle and every publish.
/// Never alters or rejects anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHook;

#[async_trait]
impl Hook for LoggingHook {
    fn id(&self) -> &str {
        "logging"
    }

    fn provides(&self) -> &'static [HookKind] {
        &[
            HookKind::OnConnectAuthenticate,
            HookKind::OnAuthPacket,
            HookKind::OnConnect,
            HookKind::OnDisconnect,
            HookKind::OnPublish,
        ]
    }

    async fn on_connect_authenticate(&self, client: &ClientInfo, connect: &Connect) -> bool {
        debug!(
            client = %client.id,
            remote_addr = %client.remote_addr,
            username = client.username.as_deref().unwrap_or(""),
            protocol = ?connect.protocol,
            "Authenticating client"
        );
        true
    }

    async fn on_auth_packet(&self, client: &ClientInfo, connect: Connect) -> Result<Connect> {
        debug!(
            client = %client.id,
            has_username = connect.login.as_ref().is_some_and(|l| !l.username.is_empty()),
            has_password = connect.login.as_ref().is_some_and(|l| !l.password.is_empty()),
            "Auth packet"
        );
        Ok(connect)
    }

    async fn on_connect(&self, client: &ClientInfo, connect: &Connect) -> Result<()> {
        info!(
            client = %client.id,
            remote_addr = %client.remote_addr,
            keep_alive = connect.keep_alive,
            clean_session = connect.clean_session,
            "Client connected"
        );
        Ok(())
    }

    async fn on_disconnect(&self, client: &ClientInfo, reason: &DisconnectReason) {
        info!(client = %client.id, %reason, "Client disconnected");
    }

    async fn on_publish(&self, client: &ClientInfo, publish: Publish) -> Result<Publish> {
        debug!(
            client = %client.id,
            topic = %publish.topic,
            qos = publish.qos as u8,
            retain = publish.retain,
            bytes = publish.payload.len(),
            "Message received"
        );
        Ok(publish)
    }
}
