use crate::errors::{Error, Result};
use crate::metrics::{
    CONNECTED_CLIENTS, CONNECTIONS_ACCEPTED_TOTAL, CONNECTIONS_REFUSED_TOTAL, MESSAGES_TOTAL,
};
use crate::mqtt::hooks::{ClientInfo, DisconnectReason, Hooks};
use crate::mqtt::tls::load_server_config;
use crate::mqtt::topics::{matches, valid_filter, valid_topic};
use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use rumqttc::mqttbytes::v4::{
    self, ConnAck, Connect, ConnectReturnCode, Packet, PingResp, PubAck, PubComp, PubRec, Publish,
    SubAck, SubscribeReasonCode, UnsubAck,
};
use rumqttc::mqttbytes::{self, Protocol, QoS};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Messages buffered per subscriber before deliveries are dropped
const CLIENT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub address: String,
    pub port: u16,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
    pub max_packet_size: usize,
}

/// A message on its way to a subscriber
#[derive(Debug, Clone)]
pub struct Delivery {
    pub topic: String,
    pub payload: Bytes,
}

struct Subscriber {
    tx: mpsc::Sender<Delivery>,
    kick: CancellationToken,
    filters: HashSet<String>,
}

/// Connected clients by client id, with their subscriptions
#[derive(Default)]
pub struct Router {
    clients: RwLock<HashMap<String, Subscriber>>,
}

impl Router {
    /// Adds a client, disconnecting any previous connection with the same id.
    fn register(&self, client_id: &str, tx: mpsc::Sender<Delivery>, kick: CancellationToken) {
        let previous = self.clients.write().insert(
            client_id.to_string(),
            Subscriber {
                tx,
                kick,
                filters: HashSet::new(),
            },
        );

        if let Some(previous) = previous {
            debug!(client = client_id, "Taking over existing session");
            previous.kick.cancel();
        }
    }

    /// Removes the client only if `tx` still belongs to the registered
    /// connection, so a connection that was taken over cannot remove its
    /// successor.
    fn remove(&self, client_id: &str, tx: &mpsc::Sender<Delivery>) {
        let mut clients = self.clients.write();
        if clients
            .get(client_id)
            .is_some_and(|current| current.tx.same_channel(tx))
        {
            clients.remove(client_id);
        }
    }

    fn subscribe(&self, client_id: &str, filter: &str) {
        if let Some(subscriber) = self.clients.write().get_mut(client_id) {
            subscriber.filters.insert(filter.to_string());
        }
    }

    fn unsubscribe(&self, client_id: &str, filter: &str) {
        if let Some(subscriber) = self.clients.write().get_mut(client_id) {
            subscriber.filters.remove(filter);
        }
    }

    /// Queues the message for every client with a matching filter and
    /// returns how many were reached. A full queue drops the delivery.
    pub fn route(&self, topic: &str, payload: &Bytes) -> usize {
        let clients = self.clients.read();
        let mut delivered = 0;

        for (client_id, subscriber) in clients.iter() {
            if !subscriber.filters.iter().any(|filter| matches(filter, topic)) {
                continue;
            }

            let delivery = Delivery {
                topic: topic.to_string(),
                payload: payload.clone(),
            };
            match subscriber.tx.try_send(delivery) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(client = %client_id, topic, "Subscriber queue full, dropping message");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        delivered
    }
}

/// State shared by every connection task
pub struct Shared {
    hooks: Hooks,
    router: Router,
    max_packet_size: usize,
}

impl Shared {
    pub fn new(hooks: Hooks, max_packet_size: usize) -> Self {
        Self {
            hooks,
            router: Router::default(),
            max_packet_size,
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    /// Runs one client connection over an already-established transport
    /// until it ends or `shutdown` fires.
    pub async fn serve<S>(self: Arc<Self>, stream: S, remote_addr: SocketAddr, shutdown: CancellationToken) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let mut conn = Connection::new(stream, self.max_packet_size);

        let mut connect = match timeout(CONNECT_TIMEOUT, conn.read_packet()).await {
            Ok(Ok(Some(Packet::Connect(connect)))) => connect,
            Ok(Ok(Some(_))) => {
                CONNECTIONS_REFUSED_TOTAL.inc();
                return Err(Error::Protocol("first packet was not CONNECT".to_string()));
            }
            Ok(Ok(None)) => {
                CONNECTIONS_REFUSED_TOTAL.inc();
                return Ok(());
            }
            Ok(Err(Error::Packet(
                e @ (mqttbytes::Error::InvalidProtocol | mqttbytes::Error::InvalidProtocolLevel(_)),
            ))) => {
                CONNECTIONS_REFUSED_TOTAL.inc();
                conn.refuse(ConnectReturnCode::RefusedProtocolVersion).await?;
                return Err(Error::Packet(e));
            }
            Ok(Err(e)) => {
                CONNECTIONS_REFUSED_TOTAL.inc();
                return Err(e);
            }
            Err(_) => {
                CONNECTIONS_REFUSED_TOTAL.inc();
                return Err(Error::Protocol("timed out waiting for CONNECT".to_string()));
            }
        };

        if connect.protocol != Protocol::V4 {
            CONNECTIONS_REFUSED_TOTAL.inc();
            conn.refuse(ConnectReturnCode::RefusedProtocolVersion).await?;
            return Err(Error::Protocol(format!(
                "unsupported protocol {:?}",
                connect.protocol
            )));
        }

        if connect.client_id.is_empty() {
            if !connect.clean_session {
                CONNECTIONS_REFUSED_TOTAL.inc();
                conn.refuse(ConnectReturnCode::BadClientId).await?;
                return Err(Error::Protocol(
                    "empty client id requires a clean session".to_string(),
                ));
            }
            connect.client_id = format!("auto-{}", uuid::Uuid::new_v4());
        }

        let mut client = ClientInfo {
            id: connect.client_id.clone(),
            remote_addr,
            username: username(&connect),
        };

        let connect = match self.hooks.on_auth_packet(&client, connect).await {
            Ok(connect) => connect,
            Err(e) => {
                CONNECTIONS_REFUSED_TOTAL.inc();
                conn.refuse(ConnectReturnCode::NotAuthorized).await?;
                return Err(Error::Authorization(format!("auth packet rejected: {}", e)));
            }
        };
        client.username = username(&connect);

        if !self.hooks.on_connect_authenticate(&client, &connect).await {
            CONNECTIONS_REFUSED_TOTAL.inc();
            conn.refuse(ConnectReturnCode::NotAuthorized).await?;
            return Err(Error::Authorization(format!("client {} not authorized", client.id)));
        }

        if let Err(e) = self.hooks.on_connect(&client, &connect).await {
            CONNECTIONS_REFUSED_TOTAL.inc();
            conn.refuse(ConnectReturnCode::NotAuthorized).await?;
            return Err(Error::Authorization(format!("connect rejected: {}", e)));
        }

        let (tx, rx) = mpsc::channel(CLIENT_QUEUE_CAPACITY);
        let kick = CancellationToken::new();
        self.router.register(&client.id, tx.clone(), kick.clone());
        CONNECTIONS_ACCEPTED_TOTAL.inc();
        CONNECTED_CLIENTS.inc();

        let connack = ConnAck::new(ConnectReturnCode::Success, false);
        let reason = match conn.write(Packet::ConnAck(connack)).await {
            Ok(()) => {
                self.run_session(&mut conn, &client, connect.keep_alive, rx, kick, shutdown)
                    .await
            }
            Err(e) => {
                debug!(client = %client.id, "Failed to send CONNACK: {}", e);
                DisconnectReason::ConnectionClosed
            }
        };

        self.router.remove(&client.id, &tx);
        CONNECTED_CLIENTS.dec();
        self.hooks.on_disconnect(&client, &reason).await;
        conn.close().await;

        Ok(())
    }

    async fn run_session<S>(
        &self,
        conn: &mut Connection<S>,
        client: &ClientInfo,
        keep_alive: u16,
        mut rx: mpsc::Receiver<Delivery>,
        kick: CancellationToken,
        shutdown: CancellationToken,
    ) -> DisconnectReason
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        // A client that stays silent for 1.5 keep-alive periods is gone.
        let grace = (keep_alive > 0).then(|| Duration::from_millis(u64::from(keep_alive) * 1500));
        let mut deadline = grace.map(|grace| Instant::now() + grace);
        let mut awaiting_release: HashSet<u16> = HashSet::new();

        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => return DisconnectReason::ServerShutdown,
                _ = kick.cancelled() => return DisconnectReason::TakenOver,
                _ = expire(deadline) => {
                    warn!(client = %client.id, keep_alive, "Keep-alive expired");
                    return DisconnectReason::KeepAliveTimeout;
                }
                delivery = rx.recv() => Event::Deliver(delivery),
                packet = conn.read_packet() => Event::Packet(packet),
            };

            let packet = match event {
                Event::Deliver(Some(delivery)) => {
                    let publish = Publish::from_bytes(delivery.topic, QoS::AtMostOnce, delivery.payload);
                    if let Err(e) = conn.write(Packet::Publish(publish)).await {
                        debug!(client = %client.id, "Delivery failed: {}", e);
                        return DisconnectReason::ConnectionClosed;
                    }
                    continue;
                }
                Event::Deliver(None) => return DisconnectReason::TakenOver,
                Event::Packet(Ok(Some(packet))) => packet,
                Event::Packet(Ok(None)) => return DisconnectReason::ConnectionClosed,
                Event::Packet(Err(Error::Packet(e))) => {
                    warn!(client = %client.id, "Malformed packet: {}", e);
                    return DisconnectReason::ProtocolError(e.to_string());
                }
                Event::Packet(Err(e)) => {
                    debug!(client = %client.id, "Read failed: {}", e);
                    return DisconnectReason::ConnectionClosed;
                }
            };

            deadline = grace.map(|grace| Instant::now() + grace);

            match self.handle_packet(conn, client, packet, &mut awaiting_release).await {
                Ok(None) => {}
                Ok(Some(reason)) => return reason,
                Err(e) => {
                    debug!(client = %client.id, "Write failed: {}", e);
                    return DisconnectReason::ConnectionClosed;
                }
            }
        }
    }

    /// Handles one packet of an established session. `Some` ends the session.
    async fn handle_packet<S>(
        &self,
        conn: &mut Connection<S>,
        client: &ClientInfo,
        packet: Packet,
        awaiting_release: &mut HashSet<u16>,
    ) -> Result<Option<DisconnectReason>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        match packet {
            Packet::Publish(publish) => {
                MESSAGES_TOTAL.inc();

                if !valid_topic(&publish.topic) {
                    return Ok(Some(DisconnectReason::ProtocolError(format!(
                        "invalid topic name {:?}",
                        publish.topic
                    ))));
                }

                let (qos, pkid) = (publish.qos, publish.pkid);
                if qos == QoS::ExactlyOnce && awaiting_release.contains(&pkid) {
                    trace!(client = %client.id, pkid, "Duplicate QoS 2 publish");
                    conn.write(Packet::PubRec(PubRec::new(pkid))).await?;
                    return Ok(None);
                }

                let publish = match self.hooks.on_publish(client, publish).await {
                    Ok(publish) => publish,
                    Err(e) => {
                        warn!(client = %client.id, "Publish rejected: {}", e);
                        return Ok(Some(DisconnectReason::ProtocolError(format!(
                            "publish rejected: {}",
                            e
                        ))));
                    }
                };

                let delivered = self.router.route(&publish.topic, &publish.payload);
                trace!(client = %client.id, topic = %publish.topic, delivered, "Routed");

                match qos {
                    QoS::AtMostOnce => {}
                    QoS::AtLeastOnce => conn.write(Packet::PubAck(PubAck::new(pkid))).await?,
                    QoS::ExactlyOnce => {
                        awaiting_release.insert(pkid);
                        conn.write(Packet::PubRec(PubRec::new(pkid))).await?;
                    }
                }

                self.hooks.on_published(client, &publish).await;
            }
            Packet::PubRel(release) => {
                awaiting_release.remove(&release.pkid);
                conn.write(Packet::PubComp(PubComp::new(release.pkid))).await?;
            }
            Packet::PubAck(_) | Packet::PubRec(_) | Packet::PubComp(_) => {
                // Deliveries are QoS 0; nothing is awaiting these.
                trace!(client = %client.id, "Ignoring unexpected acknowledgement");
            }
            Packet::Subscribe(subscribe) => {
                let return_codes = subscribe
                    .filters
                    .iter()
                    .map(|filter| {
                        if valid_filter(&filter.path) {
                            self.router.subscribe(&client.id, &filter.path);
                            debug!(client = %client.id, filter = %filter.path, "Subscribed");
                            SubscribeReasonCode::Success(QoS::AtMostOnce)
                        } else {
                            warn!(client = %client.id, filter = %filter.path, "Rejected subscription");
                            SubscribeReasonCode::Failure
                        }
                    })
                    .collect();
                conn.write(Packet::SubAck(SubAck::new(subscribe.pkid, return_codes)))
                    .await?;
            }
            Packet::Unsubscribe(unsubscribe) => {
                for filter in &unsubscribe.topics {
                    self.router.unsubscribe(&client.id, filter);
                }
                conn.write(Packet::UnsubAck(UnsubAck::new(unsubscribe.pkid)))
                    .await?;
            }
            Packet::PingReq => conn.write(Packet::PingResp).await?,
            Packet::Disconnect => return Ok(Some(DisconnectReason::ClientDisconnect)),
            Packet::Connect(_) => {
                return Ok(Some(DisconnectReason::ProtocolError(
                    "second CONNECT on an established session".to_string(),
                )))
            }
            Packet::ConnAck(_) | Packet::SubAck(_) | Packet::UnsubAck(_) | Packet::PingResp => {
                return Ok(Some(DisconnectReason::ProtocolError(
                    "client sent a broker-only packet".to_string(),
                )))
            }
        }

        Ok(None)
    }
}

/// Login name from CONNECT, if the client sent one
fn username(connect: &Connect) -> Option<String> {
    connect
        .login
        .as_ref()
        .map(|login| login.username.clone())
        .filter(|username| !username.is_empty())
}

enum Event {
    Deliver(Option<Delivery>),
    Packet(Result<Option<Packet>>),
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Serializes a packet the broker sends to clients.
fn encode(packet: &Packet, out: &mut BytesMut) -> Result<()> {
    match packet {
        Packet::ConnAck(connack) => connack.write(out)?,
        Packet::Publish(publish) => publish.write(out)?,
        Packet::PubAck(puback) => puback.write(out)?,
        Packet::PubRec(pubrec) => pubrec.write(out)?,
        Packet::PubComp(pubcomp) => pubcomp.write(out)?,
        Packet::SubAck(suback) => suback.write(out)?,
        Packet::UnsubAck(unsuback) => unsuback.write(out)?,
        Packet::PingResp => PingResp.write(out)?,
        other => {
            return Err(Error::Protocol(format!(
                "{:?} is never sent by the broker",
                other
            )))
        }
    };
    Ok(())
}

/// Framed MQTT stream
struct Connection<S> {
    stream: S,
    read_buf: BytesMut,
    write_buf: BytesMut,
    max_packet_size: usize,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn new(stream: S, max_packet_size: usize) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(4096),
            max_packet_size,
        }
    }

    /// Next packet, or `None` once the peer has closed the stream.
    ///
    /// Cancel safe: bytes already read stay in the buffer.
    async fn read_packet(&mut self) -> Result<Option<Packet>> {
        loop {
            match v4::read(&mut self.read_buf, self.max_packet_size) {
                Ok(packet) => return Ok(Some(packet)),
                Err(mqttbytes::Error::InsufficientBytes(_)) => {}
                Err(e) => return Err(e.into()),
            }
            if self.stream.read_buf(&mut self.read_buf).await? == 0 {
                return Ok(None);
            }
        }
    }

    async fn write(&mut self, packet: Packet) -> Result<()> {
        self.write_buf.clear();
        encode(&packet, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn refuse(&mut self, code: ConnectReturnCode) -> Result<()> {
        self.write(Packet::ConnAck(ConnAck::new(code, false))).await?;
        self.close().await;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// The mutual-TLS MQTT listener
pub struct Broker {
    listener: TcpListener,
    acceptor: TlsAcceptor,
    shared: Arc<Shared>,
}

impl Broker {
    /// Loads the TLS material and binds the listener. Fails before anything
    /// is served if the certificates are unusable.
    pub async fn bind(config: &BrokerConfig, hooks: Hooks) -> Result<Self> {
        let tls = load_server_config(&config.cert_path, &config.key_path, &config.ca_path)?;
        let addr = format!("{}:{}", config.address, config.port);
        let listener = TcpListener::bind(&addr).await.map_err(|e| {
            Error::Configuration(format!("cannot bind MQTT listener to {}: {}", addr, e))
        })?;

        info!("MQTT listener bound to {}", listener.local_addr()?);

        Ok(Self {
            listener,
            acceptor: TlsAcceptor::from(tls),
            shared: Arc::new(Shared::new(hooks, config.max_packet_size)),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shared(&self) -> Arc<Shared> {
        Arc::clone(&self.shared)
    }

    /// Accepts connections until `shutdown` fires, then waits for every
    /// connection task to finish.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let tracker = TaskTracker::new();

        loop {
            let (tcp, remote_addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Failed to accept MQTT connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
            };

            let acceptor = self.acceptor.clone();
            let shared = Arc::clone(&self.shared);
            let token = shutdown.child_token();

            tracker.spawn(async move {
                let stream = match timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        CONNECTIONS_REFUSED_TOTAL.inc();
                        warn!(%remote_addr, "TLS handshake failed: {}", e);
                        return;
                    }
                    Err(_) => {
                        CONNECTIONS_REFUSED_TOTAL.inc();
                        warn!(%remote_addr, "TLS handshake timed out");
                        return;
                    }
                };

                if let Err(e) = shared.serve(stream, remote_addr, token).await {
                    debug!(%remote_addr, "Connection ended: {}", e);
                }
            });
        }

        info!("MQTT listener stopped, closing {} connections", tracker.len());
        tracker.close();
        tracker.wait().await;

        Ok(())
    }
}
