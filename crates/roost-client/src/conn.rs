//! Per-connection state machine.
//!
//! A [`Connection`] owns one TCP or TLS socket and drives one dial,
//! handshake and session against a single server. Three tasks cooperate
//! over the socket:
//!
//! - the **receiver** decodes inbound frames, routing PINGRESP to the
//!   keepalive task and everything else to the logic dispatch;
//! - the **sender** serializes the client-wide outbound queue and the
//!   per-connection logic queue onto the socket, flushing after every
//!   packet;
//! - the **keepalive** task pings at 3/4 of the keepalive interval and
//!   closes the connection when no PINGRESP arrives in time.
//!
//! Every blocking wait composes a cancellation branch; the per-connection
//! token cascades shutdown between the tasks, and the client-wide token
//! above it ends the session without reconnecting.

use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{
    AsyncRead, AsyncWrite, AsyncWriteExt, BufWriter, ReadBuf, ReadHalf, WriteHalf,
};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::client::TlsStream;
use tokio_util::sync::CancellationToken;

use roost_core::{
    encode_packet, reason_code, Ack, Connack, Connect, Disconnect, Packet, ProtocolVersion,
    Publish, QoS,
};

use crate::client::{notify_conn, ConnHandler, Shared, CODE_LOCAL_FAILURE};
use crate::config::Server;
use crate::error::ClientError;
use crate::notify::{notify_net, notify_persist, notify_pub, notify_sub, notify_unsub};
use crate::persist::{recv_key, send_key};
use crate::tls;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// A plain TCP or TLS wrapped stream.
enum AsyncStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            AsyncStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            AsyncStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            AsyncStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Plain(s) => Pin::new(s).poll_flush(cx),
            AsyncStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            AsyncStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Connection lifecycle, logged on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Dialing,
    Handshaking,
    Active,
    Draining,
    Closed,
}

/// Why a connection attempt or session ended; drives the supervise loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionEnd {
    /// TCP/TLS establishment failed; backoff and retry when allowed.
    Dial,
    /// The handshake was rejected or timed out; no automatic retry.
    Handshake,
    /// The broker rejected MQTT 5 and compromise is on; retry at 3.1.1.
    Downgrade,
    /// The socket was lost after the session was active.
    Lost,
    /// The client is shutting down.
    Closing,
}

/// Verdict of the logic dispatch for one inbound packet.
enum Flow {
    Continue,
    Close,
}

pub(crate) struct Connection {
    shared: Arc<Shared>,
    server: Server,
    version: ProtocolVersion,
}

impl Connection {
    pub(crate) fn new(shared: Arc<Shared>, server: Server, version: ProtocolVersion) -> Self {
        Self {
            shared,
            server,
            version,
        }
    }

    fn enter(&self, state: &mut State, next: State) {
        log::debug!(
            "connection to {} moves {:?} -> {:?}",
            self.server.addr,
            state,
            next
        );
        *state = next;
    }

    /// Run one dial + handshake + session against this server.
    pub(crate) async fn run(&self, handler: &Option<ConnHandler>) -> SessionEnd {
        let mut state = State::Dialing;
        let cfg = &self.shared.cfg;

        let stream = match self.dial().await {
            Ok(stream) => stream,
            Err(err) => {
                log::error!("dial {} failed: {err}", self.server.addr);
                notify_conn(handler, &self.server.addr, CODE_LOCAL_FAILURE, Some(err));
                return SessionEnd::Dial;
            }
        };
        if self.shared.cancel.is_cancelled() {
            return SessionEnd::Closing;
        }
        self.enter(&mut state, State::Handshaking);

        let (reader, writer) = tokio::io::split(stream);
        let conn_cancel = self.shared.cancel.child_token();
        let (inbound_tx, mut inbound_rx) = mpsc::channel::<Packet>(1);
        let (keepalive_tx, keepalive_rx) = mpsc::channel::<()>(1);
        let (logic_tx, logic_rx) = mpsc::channel::<Packet>(8);
        // Latch keeping the client-wide queue out of the sender until the
        // handshake is done: CONNECT must be the first packet on the wire.
        let wire_open = CancellationToken::new();

        let sender = tokio::spawn(sender_task(
            Arc::clone(&self.shared),
            writer,
            logic_rx,
            conn_cancel.clone(),
            wire_open.clone(),
            self.version,
        ));
        let receiver = tokio::spawn(receiver_task(
            Arc::clone(&self.shared),
            reader,
            inbound_tx,
            keepalive_tx,
            logic_tx.clone(),
            conn_cancel.clone(),
            self.version,
            self.server.addr.clone(),
        ));

        if logic_tx
            .send(Packet::Connect(self.connect_packet()))
            .await
            .is_err()
        {
            teardown(&conn_cancel, sender, receiver, None).await;
            return SessionEnd::Lost;
        }

        enum Handshake {
            Ack(Connack),
            Interrupted,
            Timeout,
            Closing,
        }

        let handshake = tokio::select! {
            _ = self.shared.cancel.cancelled() => Handshake::Closing,
            _ = tokio::time::sleep(cfg.dial_timeout) => Handshake::Timeout,
            pkt = inbound_rx.recv() => match pkt {
                Some(Packet::Connack(ack)) => Handshake::Ack(ack),
                Some(other) => {
                    log::error!(
                        "{} sent {:?} before CONNACK",
                        self.server.addr,
                        other.packet_type()
                    );
                    Handshake::Interrupted
                }
                None => Handshake::Interrupted,
            },
        };

        let ack = match handshake {
            Handshake::Closing => {
                teardown(&conn_cancel, sender, receiver, None).await;
                return SessionEnd::Closing;
            }
            Handshake::Timeout => {
                notify_conn(
                    handler,
                    &self.server.addr,
                    CODE_LOCAL_FAILURE,
                    Some(ClientError::Timeout),
                );
                teardown(&conn_cancel, sender, receiver, None).await;
                return SessionEnd::Handshake;
            }
            Handshake::Interrupted => {
                notify_conn(
                    handler,
                    &self.server.addr,
                    CODE_LOCAL_FAILURE,
                    Some(ClientError::Handshake {
                        server: self.server.addr.clone(),
                        code: CODE_LOCAL_FAILURE,
                    }),
                );
                teardown(&conn_cancel, sender, receiver, None).await;
                return SessionEnd::Handshake;
            }
            Handshake::Ack(ack) => ack,
        };

        if ack.code != reason_code::SUCCESS {
            teardown(&conn_cancel, sender, receiver, None).await;
            if self.version == ProtocolVersion::V5
                && cfg.compromise
                && ack.code == reason_code::UNSUPPORTED_PROTOCOL_VERSION
            {
                log::warn!(
                    "{} rejected MQTT 5, compromising to 3.1.1",
                    self.server.addr
                );
                return SessionEnd::Downgrade;
            }
            notify_conn(handler, &self.server.addr, ack.code, None);
            return SessionEnd::Handshake;
        }

        log::info!(
            "connected to {} (session_present={})",
            self.server.addr,
            ack.session_present
        );
        self.enter(&mut state, State::Active);
        wire_open.cancel();
        notify_conn(handler, &self.server.addr, reason_code::SUCCESS, None);

        let keepalive = if cfg.keep_alive > 0 {
            Some(tokio::spawn(keepalive_task(
                logic_tx.clone(),
                keepalive_rx,
                conn_cancel.clone(),
                Duration::from_secs(u64::from(cfg.keep_alive)),
                cfg.keepalive_factor,
                self.server.addr.clone(),
            )))
        } else {
            drop(keepalive_rx);
            None
        };

        self.resume_session(&logic_tx).await;

        let end = loop {
            tokio::select! {
                _ = self.shared.cancel.cancelled() => break SessionEnd::Closing,
                _ = conn_cancel.cancelled() => break SessionEnd::Lost,
                pkt = inbound_rx.recv() => match pkt {
                    None => break SessionEnd::Lost,
                    Some(pkt) => match self.dispatch(pkt, &logic_tx).await {
                        Flow::Continue => {}
                        Flow::Close => break SessionEnd::Lost,
                    },
                },
            }
        };

        if end == SessionEnd::Closing {
            self.enter(&mut state, State::Draining);
        }
        drop(logic_tx);
        teardown(&conn_cancel, sender, receiver, keepalive).await;
        self.enter(&mut state, State::Closed);
        end
    }

    async fn dial(&self) -> Result<AsyncStream, ClientError> {
        let cfg = &self.shared.cfg;

        let tcp = tokio::time::timeout(cfg.dial_timeout, TcpStream::connect(&self.server.addr))
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|e| ClientError::Dial {
                server: self.server.addr.clone(),
                reason: e.to_string(),
            })?;
        tcp.set_nodelay(true)?;

        if !self.server.secure {
            return Ok(AsyncStream::Plain(tcp));
        }

        let connector = tls::connector(&cfg.tls)?;
        let name = tls::server_name(&self.server.addr, &cfg.tls)?;
        let stream = tokio::time::timeout(cfg.dial_timeout, connector.connect(name, tcp))
            .await
            .map_err(|_| ClientError::Timeout)?
            .map_err(|e| ClientError::Tls(e.to_string()))?;
        Ok(AsyncStream::Tls(Box::new(stream)))
    }

    fn connect_packet(&self) -> Connect {
        let cfg = &self.shared.cfg;
        Connect {
            clean_session: cfg.clean_session,
            keep_alive: cfg.keep_alive,
            client_id: cfg.client_id.clone(),
            will: cfg.will.clone(),
            username: cfg.username.clone(),
            password: cfg.password.as_ref().map(|p| p.as_bytes().to_vec()),
            properties: None,
        }
    }

    /// Replay persisted outbound exchanges onto a fresh connection, in
    /// identifier order: unacknowledged publishes go out again with DUP
    /// set, half-finished QoS 2 exchanges continue from PUBREL.
    async fn resume_session(&self, logic_tx: &mpsc::Sender<Packet>) {
        let mut entries: Vec<(u16, Packet)> = Vec::new();
        self.shared.cfg.persist.range(&mut |key, packet| {
            if let Some(id) = key.strip_prefix('S').and_then(|s| s.parse::<u16>().ok()) {
                entries.push((id, packet.clone()));
            }
            true
        });
        entries.sort_by_key(|(id, _)| *id);

        for (id, packet) in entries {
            match packet {
                Packet::Publish(mut publish) => {
                    publish.dup = true;
                    publish.packet_id = Some(id);
                    self.shared
                        .id_gen
                        .restore(id, Packet::Publish(publish.clone()));
                    log::debug!("resuming publish id={id} topic={}", publish.topic);
                    let _ = logic_tx.send(Packet::Publish(publish)).await;
                }
                Packet::Pubrel(ack) => {
                    self.shared.id_gen.restore(id, Packet::Pubrel(ack.clone()));
                    log::debug!("resuming pubrel id={id}");
                    let _ = logic_tx.send(Packet::Pubrel(ack)).await;
                }
                _ => {}
            }
        }
    }

    /// Main logic dispatch for one inbound packet.
    async fn dispatch(&self, packet: Packet, logic_tx: &mpsc::Sender<Packet>) -> Flow {
        let shared = &self.shared;
        match packet {
            Packet::Suback(suback) => {
                if let Some(Packet::Subscribe(origin)) = shared.id_gen.peek(suback.packet_id) {
                    let result: Vec<(String, u8)> = origin
                        .topics
                        .iter()
                        .enumerate()
                        .map(|(i, topic)| {
                            (
                                topic.name.clone(),
                                suback
                                    .codes
                                    .get(i)
                                    .copied()
                                    .unwrap_or(reason_code::SUB_FAIL),
                            )
                        })
                        .collect();
                    log::debug!("subscribed: {result:?}");
                    notify_sub(&shared.notify_tx, result, None);
                    shared.id_gen.release(suback.packet_id);
                    notify_persist(
                        &shared.notify_tx,
                        shared
                            .cfg
                            .persist
                            .delete(&send_key(suback.packet_id))
                            .map_err(Into::into),
                    );
                }
            }
            Packet::Unsuback(unsuback) => {
                if let Some(Packet::Unsubscribe(origin)) = shared.id_gen.peek(unsuback.packet_id) {
                    log::debug!("unsubscribed: {:?}", origin.filters);
                    notify_unsub(&shared.notify_tx, origin.filters, None);
                    shared.id_gen.release(unsuback.packet_id);
                    notify_persist(
                        &shared.notify_tx,
                        shared
                            .cfg
                            .persist
                            .delete(&send_key(unsuback.packet_id))
                            .map_err(Into::into),
                    );
                }
            }
            Packet::Publish(publish) => self.handle_inbound_publish(publish, logic_tx).await,
            Packet::Puback(ack) => {
                if let Some(Packet::Publish(origin)) = shared.id_gen.peek(ack.packet_id) {
                    if origin.qos == QoS::AtLeastOnce {
                        notify_pub(&shared.notify_tx, origin.topic, None);
                        shared.id_gen.release(ack.packet_id);
                        notify_persist(
                            &shared.notify_tx,
                            shared
                                .cfg
                                .persist
                                .delete(&send_key(ack.packet_id))
                                .map_err(Into::into),
                        );
                    }
                }
            }
            Packet::Pubrec(ack) => {
                if let Some(Packet::Publish(origin)) = shared.id_gen.peek(ack.packet_id) {
                    if origin.qos == QoS::ExactlyOnce {
                        // The id stays reserved until PUBCOMP.
                        let _ = logic_tx.send(Packet::Pubrel(Ack::new(ack.packet_id))).await;
                    }
                }
            }
            Packet::Pubrel(ack) => {
                let id = ack.packet_id;
                let _ = logic_tx.send(Packet::Pubcomp(Ack::new(id))).await;
                // The release marker completes the inbound exchange and
                // lets the broker reuse the id for a new message.
                notify_persist(
                    &shared.notify_tx,
                    shared
                        .cfg
                        .persist
                        .store(&recv_key(id), Packet::Pubrel(ack))
                        .map_err(Into::into),
                );
            }
            Packet::Pubcomp(ack) => match shared.id_gen.peek(ack.packet_id) {
                Some(Packet::Publish(origin)) if origin.qos == QoS::ExactlyOnce => {
                    notify_pub(&shared.notify_tx, origin.topic, None);
                    shared.id_gen.release(ack.packet_id);
                    notify_persist(
                        &shared.notify_tx,
                        shared
                            .cfg
                            .persist
                            .delete(&send_key(ack.packet_id))
                            .map_err(Into::into),
                    );
                }
                Some(Packet::Pubrel(_)) => {
                    // Exchange resumed from persistence; the origin topic
                    // is gone, so only close out the identifier.
                    shared.id_gen.release(ack.packet_id);
                    notify_persist(
                        &shared.notify_tx,
                        shared
                            .cfg
                            .persist
                            .delete(&send_key(ack.packet_id))
                            .map_err(Into::into),
                    );
                }
                _ => {}
            },
            Packet::Disconnect(d) => {
                log::warn!(
                    "{} sent DISCONNECT (code {:#04x})",
                    self.server.addr,
                    d.reason_code
                );
                return Flow::Close;
            }
            Packet::Connack(_) => {
                // Only meaningful during the handshake.
            }
            other => {
                log::trace!("ignoring {:?}", other.packet_type());
            }
        }
        Flow::Continue
    }

    async fn handle_inbound_publish(&self, publish: Publish, logic_tx: &mpsc::Sender<Packet>) {
        let shared = &self.shared;
        log::trace!(
            "received publish topic={} qos={:?} id={:?}",
            publish.topic,
            publish.qos,
            publish.packet_id
        );

        match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => {
                let _ = shared.deliver_tx.send(publish).await;
            }
            (QoS::AtLeastOnce, Some(id)) => {
                let _ = shared.deliver_tx.send(publish.clone()).await;
                let _ = logic_tx.send(Packet::Puback(Ack::new(id))).await;
                notify_persist(
                    &shared.notify_tx,
                    shared
                        .cfg
                        .persist
                        .store(&recv_key(id), Packet::Publish(publish))
                        .map_err(Into::into),
                );
            }
            (QoS::ExactlyOnce, Some(id)) => {
                // A stored PUBLISH under this id means the exchange is
                // still open and this frame is a retransmission.
                let open = matches!(
                    shared.cfg.persist.load(&recv_key(id)),
                    Some(Packet::Publish(_))
                );
                if !open {
                    let _ = shared.deliver_tx.send(publish.clone()).await;
                }
                let _ = logic_tx.send(Packet::Pubrec(Ack::new(id))).await;
                notify_persist(
                    &shared.notify_tx,
                    shared
                        .cfg
                        .persist
                        .store(&recv_key(id), Packet::Publish(publish))
                        .map_err(Into::into),
                );
            }
            _ => {
                // QoS > 0 without an id is rejected by the codec already.
            }
        }
    }
}

async fn teardown(
    conn_cancel: &CancellationToken,
    sender: JoinHandle<()>,
    receiver: JoinHandle<()>,
    keepalive: Option<JoinHandle<()>>,
) {
    conn_cancel.cancel();
    let _ = sender.await;
    let _ = receiver.await;
    if let Some(keepalive) = keepalive {
        let _ = keepalive.await;
    }
}

/// Serialize packets from the client-wide outbound queue and the
/// per-connection logic queue onto the socket.
async fn sender_task(
    shared: Arc<Shared>,
    writer: WriteHalf<AsyncStream>,
    mut logic_rx: mpsc::Receiver<Packet>,
    conn_cancel: CancellationToken,
    wire_open: CancellationToken,
    version: ProtocolVersion,
) {
    let mut writer = BufWriter::new(writer);
    let mut frame = Vec::with_capacity(READ_BUFFER_SIZE);

    loop {
        let (packet, from_app) = tokio::select! {
            _ = conn_cancel.cancelled() => break,
            pkt = logic_rx.recv() => match pkt {
                Some(pkt) => (pkt, false),
                None => break,
            },
            pkt = async {
                // Application packets wait behind the handshake latch.
                wire_open.cancelled().await;
                let mut rx = shared.send_rx.lock().await;
                rx.recv().await
            } => match pkt {
                Some(pkt) => (pkt, true),
                None => break,
            },
        };

        frame.clear();
        if let Err(err) = encode_packet(&packet, version, &mut frame) {
            log::error!("encode error: {err}");
            break;
        }
        if let Err(err) = writer.write_all(&frame).await {
            log::error!("write error: {err}");
            break;
        }
        if let Err(err) = writer.flush().await {
            log::error!("flush error: {err}");
            break;
        }

        match (&packet, from_app) {
            (Packet::Publish(publish), true) if publish.qos == QoS::AtMostOnce => {
                notify_pub(&shared.notify_tx, publish.topic.clone(), None);
            }
            (Packet::Disconnect(_), true) => {
                // Graceful shutdown: the DISCONNECT is on the wire, now
                // tear the whole client down.
                log::debug!("disconnect flushed, draining");
                let _ = writer.shutdown().await;
                shared.cancel.cancel();
                break;
            }
            (Packet::Disconnect(_), false) => {
                // Logic path disconnect closes this socket only.
                let _ = writer.shutdown().await;
                break;
            }
            (Packet::Pubrel(ack), false) => {
                // Crash recovery resumes from PUBREL rather than
                // re-publishing.
                notify_persist(
                    &shared.notify_tx,
                    shared
                        .cfg
                        .persist
                        .store(&send_key(ack.packet_id), packet.clone())
                        .map_err(Into::into),
                );
            }
            (Packet::Puback(ack), false) | (Packet::Pubcomp(ack), false) => {
                notify_persist(
                    &shared.notify_tx,
                    shared
                        .cfg
                        .persist
                        .delete(&send_key(ack.packet_id))
                        .map_err(Into::into),
                );
            }
            _ => {}
        }
    }

    conn_cancel.cancel();
}

/// Decode inbound frames, routing PINGRESP to the keepalive channel and
/// everything else to the logic dispatch.
#[allow(clippy::too_many_arguments)]
async fn receiver_task(
    shared: Arc<Shared>,
    mut reader: ReadHalf<AsyncStream>,
    inbound_tx: mpsc::Sender<Packet>,
    keepalive_tx: mpsc::Sender<()>,
    logic_tx: mpsc::Sender<Packet>,
    conn_cancel: CancellationToken,
    version: ProtocolVersion,
    server: String,
) {
    use tokio::io::AsyncReadExt;

    let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

    'session: loop {
        // Drain every complete frame already buffered.
        loop {
            match roost_core::decode_packet(&buf, version) {
                Ok(Some((packet, consumed))) => {
                    buf.advance(consumed);
                    if matches!(packet, Packet::Pingresp) {
                        let _ = keepalive_tx.try_send(());
                    } else {
                        tokio::select! {
                            _ = conn_cancel.cancelled() => break 'session,
                            sent = inbound_tx.send(packet) => {
                                if sent.is_err() {
                                    break 'session;
                                }
                            }
                        }
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    log::error!("decode error from {server}: {err}");
                    if version.is_v5() {
                        // Answer a malformed frame with a reasoned
                        // DISCONNECT before dropping the socket.
                        let disconnect = Disconnect {
                            reason_code: reason_code::MALFORMED_PACKET,
                            properties: None,
                        };
                        tokio::select! {
                            _ = conn_cancel.cancelled() => {}
                            _ = logic_tx.send(Packet::Disconnect(disconnect)) => {}
                        }
                    }
                    notify_net(&shared.notify_tx, server.clone(), ClientError::Codec(err));
                    break 'session;
                }
            }
        }

        tokio::select! {
            _ = conn_cancel.cancelled() => break,
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => {
                    if !shared.cancel.is_cancelled() {
                        log::error!("connection to {server} closed by peer");
                        notify_net(
                            &shared.notify_tx,
                            server.clone(),
                            ClientError::Io(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "connection closed by peer",
                            )),
                        );
                    }
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    if !shared.cancel.is_cancelled() {
                        log::error!("read error from {server}: {err}");
                        notify_net(&shared.notify_tx, server.clone(), ClientError::Io(err));
                    }
                    break;
                }
            },
        }
    }

    // Dropping the senders closes the inbound and keepalive channels,
    // which cascades shutdown to the logic loop and keepalive task.
    conn_cancel.cancel();
}

/// Send PINGREQ at 3/4 of the keepalive interval and wait for PINGRESP
/// within keepalive x factor.
async fn keepalive_task(
    logic_tx: mpsc::Sender<Packet>,
    mut keepalive_rx: mpsc::Receiver<()>,
    conn_cancel: CancellationToken,
    keep_alive: Duration,
    factor: f64,
    server: String,
) {
    let mut ticker = tokio::time::interval(keep_alive * 3 / 4);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    let timeout = keep_alive.mul_f64(factor);

    loop {
        tokio::select! {
            _ = conn_cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        if logic_tx.send(Packet::Pingreq).await.is_err() {
            return;
        }
        log::trace!("ping {server}");

        tokio::select! {
            _ = conn_cancel.cancelled() => return,
            signal = keepalive_rx.recv() => {
                if signal.is_none() {
                    return;
                }
            }
            _ = tokio::time::sleep(timeout) => {
                log::warn!("keepalive timeout for {server}");
                conn_cancel.cancel();
                return;
            }
        }
    }
}
