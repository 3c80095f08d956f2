//! See [`Client`].

use core::mem;

use ahash::AHashMap;
use bytes::Bytes;
use tracing::{debug, trace, warn};
use web_time::{Duration, Instant};

use riptide_proto::{
    ack::RecvOutcome,
    header::{Header, HeaderTag},
    msg::{Message, MessagePool, ReadError, SendMode},
};

use crate::{
    config::PeerConfig,
    connection::{ClientId, Connection, ConnectionState},
    event::{ClientEvent, DisconnectReason},
    transport::{Transport, TransportEvent},
};

/// Callback invoked for one registered user message id.
///
/// Receives the client itself (so replies can be sent from inside the
/// handler) and the message with its read cursor positioned after the
/// message id. Read errors returned from the handler are logged and
/// swallowed.
pub type ClientHandler<T> = Box<dyn FnMut(&mut Client<T>, &mut Message) -> Result<(), ReadError>>;

/// Client-role peer: owns a transport and the single [`Connection`] to a
/// server.
///
/// Call [`Client::connect`], then drive [`Client::tick`] at a regular
/// cadence. The tick sends the periodic `connect` retries while the
/// handshake is in flight and the heartbeats once connected, alongside all
/// the reliability work.
pub struct Client<T: Transport> {
    transport: T,
    pool: MessagePool,
    config: PeerConfig,
    conn: Option<Connection<T::Endpoint>>,
    handlers: AHashMap<u16, ClientHandler<T>>,
    events: Vec<ClientEvent>,
    /// Time of the tick currently being processed; sends between ticks reuse
    /// the last tick's instant.
    now: Instant,
    connect_attempts: u8,
    last_connect_at: Instant,
    last_heartbeat_at: Instant,
    next_ping_id: u8,
    ping_sent: Option<(u8, Instant)>,
}

impl<T: Transport> Client<T> {
    /// Creates an idle client over an already bound transport.
    pub fn new(transport: T, config: PeerConfig, now: Instant) -> Self {
        Self {
            transport,
            pool: MessagePool::new(config.max_message_size),
            config,
            conn: None,
            handlers: AHashMap::new(),
            events: Vec::new(),
            now,
            connect_attempts: 0,
            last_connect_at: now,
            last_heartbeat_at: now,
            next_ping_id: 0,
            ping_sent: None,
        }
    }

    /// Starts the handshake towards a server endpoint.
    ///
    /// The first `connect` datagram goes out immediately; further attempts
    /// are sent from [`Client::tick`] every heartbeat interval, up to
    /// [`PeerConfig::max_connect_attempts`] in total, after which a
    /// [`ClientEvent::ConnectFailed`] is raised. Ignored if a connection is
    /// already underway.
    pub fn connect(&mut self, server: T::Endpoint) {
        if self.conn.as_ref().is_some_and(Connection::is_active) {
            warn!("connect() on an already active client");
            return;
        }
        debug!(?server, "connecting");
        let mut conn = Connection::new(server, ConnectionState::Connecting, &self.config, self.now);
        let knock = self.pool.acquire(HeaderTag::Connect);
        conn.send(knock, &mut self.pool, self.now);
        self.conn = Some(conn);
        self.connect_attempts = 1;
        self.last_connect_at = self.now;
        self.flush();
    }

    /// Gracefully leaves the server: a best-effort one-shot `disconnect`
    /// notice, then immediate local teardown.
    pub fn disconnect(&mut self) {
        let Some(conn) = self.conn.as_mut().filter(|conn| conn.is_active()) else {
            return;
        };
        let notice = self.pool.acquire(HeaderTag::Disconnect);
        let datagram = notice.as_bytes().to_vec();
        self.pool.release(notice);
        if let Err(err) = self.transport.send(&datagram, conn.endpoint()) {
            debug!(%err, "disconnect notice failed");
        }
        self.teardown(DisconnectReason::Disconnected);
    }

    /// Registers the handler for a user message id, replacing any previous
    /// one.
    pub fn on_message(
        &mut self,
        msg_id: u16,
        handler: impl FnMut(&mut Self, &mut Message) -> Result<(), ReadError> + 'static,
    ) {
        self.handlers.insert(msg_id, Box::new(handler));
    }

    /// Gets the owned transport.
    pub const fn transport(&self) -> &T {
        &self.transport
    }

    /// Gets the owned transport mutably, e.g. to recondition it in tests.
    pub const fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Acquires a pooled message for sending under the given mode, with the
    /// message id already written.
    pub fn message(&mut self, mode: SendMode, msg_id: u16) -> Message {
        let mut msg = self.pool.acquire(mode.tag());
        if let Err(err) = msg.write(&msg_id) {
            // unreachable with a legal message capacity
            warn!(%err, "message id does not fit");
        }
        msg
    }

    /// Sends a message to the server. A no-op (the message is recycled) if
    /// not connected.
    pub fn send(&mut self, msg: Message) {
        let Some(conn) = self.conn.as_mut().filter(|conn| conn.is_active()) else {
            trace!("dropping send while not connected");
            self.pool.release(msg);
            return;
        };
        conn.send(msg, &mut self.pool, self.now);
    }

    /// The id the server assigned in its `welcome`, or [`ClientId::NONE`]
    /// before the handshake completes.
    #[must_use]
    pub fn id(&self) -> ClientId {
        self.conn.as_ref().map_or(ClientId::NONE, Connection::id)
    }

    /// Lifecycle state of the connection to the server.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.conn
            .as_ref()
            .map_or(ConnectionState::NotConnected, Connection::state)
    }

    /// Gets whether the handshake has completed.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Current smoothed RTT estimate, fed by heartbeat echoes and reliable
    /// acks.
    #[must_use]
    pub fn rtt(&self) -> Option<Duration> {
        self.conn.as_ref().map(|conn| conn.rtt().get())
    }

    /// Runs one tick at `now`: drains the transport, advances the handshake
    /// or sends heartbeats, dispatches user messages, then flushes
    /// everything queued for the wire. Returns the lifecycle events raised
    /// during the tick.
    pub fn tick(&mut self, now: Instant) -> Vec<ClientEvent> {
        self.now = now;

        while let Some(event) = self.transport.poll() {
            match event {
                TransportEvent::Recv { datagram, from } => self.handle_datagram(&datagram, from),
                TransportEvent::Error { error, .. } => {
                    warn!(err = %error, "transport receive error");
                    if self.conn.as_ref().is_some_and(Connection::is_active) {
                        self.teardown(DisconnectReason::TransportError);
                    }
                }
            }
        }

        match self.state() {
            ConnectionState::Connecting => self.drive_connect(now),
            ConnectionState::Connected => {
                if self.conn.as_ref().is_some_and(|conn| conn.timed_out(now)) {
                    self.teardown(DisconnectReason::TimedOut);
                } else {
                    self.drive_heartbeat(now);
                }
            }
            ConnectionState::Pending | ConnectionState::NotConnected => {}
        }

        if let Some(conn) = self.conn.as_mut().filter(|conn| conn.is_active()) {
            conn.flush_retransmits(now);
        }
        self.flush();
        if self.conn.as_ref().is_some_and(|conn| !conn.is_active()) {
            self.conn = None;
        }
        mem::take(&mut self.events)
    }

    fn drive_connect(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_connect_at) < self.config.heartbeat_interval {
            return;
        }
        if self.connect_attempts >= self.config.max_connect_attempts {
            debug!(
                attempts = self.connect_attempts,
                "connect attempts exhausted"
            );
            if let Some(conn) = self.conn.as_mut() {
                conn.teardown();
            }
            self.events.push(ClientEvent::ConnectFailed);
            return;
        }
        self.connect_attempts += 1;
        self.last_connect_at = now;
        let knock = self.pool.acquire(HeaderTag::Connect);
        if let Some(conn) = self.conn.as_mut() {
            conn.send(knock, &mut self.pool, now);
        }
    }

    fn drive_heartbeat(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_heartbeat_at) < self.config.heartbeat_interval {
            return;
        }
        self.last_heartbeat_at = now;
        let ping_id = self.next_ping_id;
        self.next_ping_id = self.next_ping_id.wrapping_add(1);
        // an unanswered probe is simply forgotten when the next one goes out
        self.ping_sent = Some((ping_id, now));

        let mut probe = self.pool.acquire(HeaderTag::Heartbeat);
        if let Err(err) = probe.write(&ping_id) {
            warn!(%err, "failed to build heartbeat");
        }
        if let Some(conn) = self.conn.as_mut() {
            conn.send(probe, &mut self.pool, now);
        }
    }

    fn handle_datagram(&mut self, datagram: &Bytes, from: T::Endpoint) {
        let Some(conn) = self.conn.as_mut().filter(|conn| conn.is_active()) else {
            return;
        };
        if conn.endpoint() != from {
            trace!(?from, "dropping datagram from unexpected endpoint");
            return;
        }
        let header = match Header::decode(datagram) {
            Ok(header) => header,
            Err(err) => {
                trace!(%err, "dropping undecodable datagram");
                return;
            }
        };
        match header.tag {
            HeaderTag::Welcome => self.on_welcome(&header, datagram),
            HeaderTag::Heartbeat => self.on_heartbeat_echo(datagram),
            HeaderTag::Ack | HeaderTag::AckExtra => self.on_ack(&header, datagram),
            HeaderTag::Unreliable | HeaderTag::Reliable => self.on_user(&header, datagram),
            HeaderTag::ClientConnected | HeaderTag::ClientDisconnected => {
                self.on_peer_notice(&header, datagram);
            }
            HeaderTag::Disconnect => {
                debug!("server sent disconnect");
                self.teardown(DisconnectReason::Disconnected);
            }
            HeaderTag::Connect => trace!("dropping server-bound tag"),
        }
    }

    fn on_welcome(&mut self, header: &Header, datagram: &Bytes) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        conn.note_recv(self.now);
        let Some(wire_seq) = header.wire_seq else {
            return;
        };
        if conn.accept_tracked(wire_seq, &mut self.pool, self.now) != RecvOutcome::Fresh {
            return;
        }
        let Ok(mut msg) = self.pool.acquire_from(header.tag, datagram) else {
            return;
        };
        let id = msg.read::<u16>();
        self.pool.release(msg);
        let Ok(id) = id else {
            trace!("welcome without id");
            return;
        };
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        if conn.state() != ConnectionState::Connecting {
            return;
        }
        conn.set_id(ClientId(id));
        conn.set_state(ConnectionState::Connected);
        debug!(id, "connected");
        // heartbeats start a full interval from now
        self.last_heartbeat_at = self.now;
        self.events.push(ClientEvent::Connected);

        // reliable echo carrying our id completes the server's side
        let mut echo = self.pool.acquire(HeaderTag::Welcome);
        if let Err(err) = echo.write(&id) {
            warn!(%err, "failed to build welcome echo");
        }
        if let Some(conn) = self.conn.as_mut() {
            conn.send(echo, &mut self.pool, self.now);
        }
    }

    fn on_heartbeat_echo(&mut self, datagram: &Bytes) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        conn.note_recv(self.now);
        let Ok(mut msg) = self.pool.acquire_from(HeaderTag::Heartbeat, datagram) else {
            return;
        };
        let ping_id = msg.read::<u8>();
        self.pool.release(msg);
        let Ok(ping_id) = ping_id else {
            return;
        };
        if let Some((sent_id, sent_at)) = self.ping_sent.take_if(|(id, _)| *id == ping_id) {
            let sample = self.now.saturating_duration_since(sent_at);
            trace!(sent_id, ?sample, "heartbeat rtt sample");
            if let Some(conn) = self.conn.as_mut() {
                conn.record_rtt_sample(sample);
            }
        }
    }

    fn on_ack(&mut self, header: &Header, datagram: &Bytes) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        conn.note_recv(self.now);
        let Some(wire_seq) = header.wire_seq else {
            return;
        };
        let Ok(mut msg) = self.pool.acquire_from(header.tag, datagram) else {
            return;
        };
        let extra = header.tag == HeaderTag::AckExtra;
        if let Some(conn) = self.conn.as_mut() {
            if let Err(err) = conn.handle_ack(wire_seq, &mut msg, extra, self.now) {
                trace!(%err, "malformed ack");
            }
        }
        self.pool.release(msg);
    }

    fn on_user(&mut self, header: &Header, datagram: &Bytes) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        conn.note_recv(self.now);
        if conn.state() != ConnectionState::Connected {
            // don't ack or record: a retransmission after the handshake
            // completes must still be deliverable
            trace!("dropping user message before handshake completion");
            return;
        }
        if let Some(wire_seq) = header.wire_seq {
            if conn.accept_tracked(wire_seq, &mut self.pool, self.now) != RecvOutcome::Fresh {
                return;
            }
        }
        let Ok(mut msg) = self.pool.acquire_from(header.tag, datagram) else {
            warn!("oversized datagram");
            return;
        };
        self.dispatch(&mut msg);
        self.pool.release(msg);
    }

    fn on_peer_notice(&mut self, header: &Header, datagram: &Bytes) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        conn.note_recv(self.now);
        let Some(wire_seq) = header.wire_seq else {
            return;
        };
        if conn.accept_tracked(wire_seq, &mut self.pool, self.now) != RecvOutcome::Fresh {
            return;
        }
        let Ok(mut msg) = self.pool.acquire_from(header.tag, datagram) else {
            return;
        };
        let peer_id = msg.read::<u16>();
        self.pool.release(msg);
        let Ok(peer_id) = peer_id else {
            trace!("peer notice without id");
            return;
        };
        let client_id = ClientId(peer_id);
        self.events.push(match header.tag {
            HeaderTag::ClientConnected => ClientEvent::PeerConnected { client_id },
            _ => ClientEvent::PeerDisconnected { client_id },
        });
    }

    fn dispatch(&mut self, msg: &mut Message) {
        let msg_id = match msg.read::<u16>() {
            Ok(msg_id) => msg_id,
            Err(err) => {
                warn!(%err, "user message without message id");
                return;
            }
        };
        let mut handlers = mem::take(&mut self.handlers);
        if let Some(handler) = handlers.get_mut(&msg_id) {
            if let Err(err) = handler(self, msg) {
                warn!(%err, msg_id, "message handler failed");
            }
        } else {
            warn!(msg_id, "no handler registered for message id");
        }
        // keep anything registered from inside a handler
        let registered = mem::replace(&mut self.handlers, handlers);
        self.handlers.extend(registered);
    }

    fn teardown(&mut self, reason: DisconnectReason) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        let ep = conn.endpoint();
        conn.teardown();
        self.transport.close(ep);
        debug!(%reason, "disconnected");
        self.events.push(ClientEvent::Disconnected { reason });
    }

    fn flush(&mut self) {
        let Some(conn) = self.conn.as_mut() else {
            return;
        };
        let ep = conn.endpoint();
        for datagram in conn.drain_outgoing() {
            if let Err(err) = self.transport.send(&datagram, ep) {
                // swallowed: retransmission covers reliable traffic
                debug!(%err, "transport send failed");
            }
        }
    }
}
