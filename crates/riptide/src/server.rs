//! See [`Server`].

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
    event::{DisconnectReason, ServerEvent},
    transport::{Transport, TransportEvent},
};

/// Callback invoked for one registered user message id.
///
/// Receives the server itself (so replies and broadcasts can be sent from
/// inside the handler), the id of the sending client, and the message with
/// its read cursor positioned after the message id. Read errors returned
/// from the handler are logged and swallowed.
pub type ServerHandler<T> =
    Box<dyn FnMut(&mut Server<T>, ClientId, &mut Message) -> Result<(), ReadError>>;

/// Server-role peer: owns a transport and one [`Connection`] per remote
/// endpoint that has knocked with a `connect`.
///
/// Drive it by calling [`Server::tick`] at a regular cadence. Everything
/// happens inside that call: inbound datagrams are drained from the
/// transport, handshakes progress, user messages are dispatched to
/// registered handlers, retransmissions and timeouts fire, and queued
/// outbound datagrams are flushed.
pub struct Server<T: Transport> {
    transport: T,
    pool: MessagePool,
    config: PeerConfig,
    connections: AHashMap<T::Endpoint, Connection<T::Endpoint>>,
    by_id: AHashMap<ClientId, T::Endpoint>,
    handlers: AHashMap<u16, ServerHandler<T>>,
    next_id: u16,
    events: Vec<ServerEvent>,
    /// Time of the tick currently being processed; sends between ticks reuse
    /// the last tick's instant.
    now: Instant,
}

impl<T: Transport> Server<T> {
    /// Creates a server over an already bound transport.
    pub fn new(transport: T, config: PeerConfig, now: Instant) -> Self {
        Self {
            transport,
            pool: MessagePool::new(config.max_message_size),
            config,
            connections: AHashMap::new(),
            by_id: AHashMap::new(),
            handlers: AHashMap::new(),
            next_id: 1,
            events: Vec::new(),
            now,
        }
    }

    /// Registers the handler for a user message id, replacing any previous
    /// one.
    pub fn on_message(
        &mut self,
        msg_id: u16,
        handler: impl FnMut(&mut Self, ClientId, &mut Message) -> Result<(), ReadError> + 'static,
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

    /// Sends a message to one client. A no-op (the message is recycled) if
    /// the id is unknown or no longer connected.
    pub fn send(&mut self, msg: Message, to: ClientId) {
        let Some(conn) = self.by_id.get(&to).and_then(|ep| self.connections.get_mut(ep)) else {
            trace!(%to, "dropping send to unknown client");
            self.pool.release(msg);
            return;
        };
        conn.send(msg, &mut self.pool, self.now);
    }

    /// Sends one message to every fully connected client.
    ///
    /// The payload is sealed once; reliable copies still get their own
    /// per-connection sequence number.
    pub fn send_to_all(&mut self, msg: Message) {
        let tracked = msg.header().is_tracked();
        let datagram = msg.as_bytes().to_vec();
        self.pool.release(msg);
        for conn in self.connections.values_mut() {
            if conn.state() == ConnectionState::Connected {
                conn.send_sealed(tracked, datagram.clone(), self.now);
            }
        }
    }

    /// Number of fully connected clients.
    #[must_use]
    pub fn client_count(&self) -> usize {
        self.connections
            .values()
            .filter(|conn| conn.state() == ConnectionState::Connected)
            .count()
    }

    /// Ids of all fully connected clients, in no particular order.
    pub fn client_ids(&self) -> impl Iterator<Item = ClientId> + '_ {
        self.connections
            .values()
            .filter(|conn| conn.state() == ConnectionState::Connected)
            .map(Connection::id)
    }

    /// Current smoothed RTT estimate for one client.
    #[must_use]
    pub fn client_rtt(&self, id: ClientId) -> Option<Duration> {
        self.by_id
            .get(&id)
            .and_then(|ep| self.connections.get(ep))
            .map(|conn| conn.rtt().get())
    }

    /// Disconnects one client: a best-effort `disconnect` notice goes out
    /// immediately, the connection is torn down, and the departure is
    /// broadcast to everyone else.
    pub fn disconnect_client(&mut self, id: ClientId) {
        let Some(&ep) = self.by_id.get(&id) else {
            return;
        };
        let notice = self.pool.acquire(HeaderTag::Disconnect);
        let datagram = notice.as_bytes().to_vec();
        self.pool.release(notice);
        if let Err(err) = self.transport.send(&datagram, ep) {
            debug!(%err, "disconnect notice failed");
        }
        self.drop_connection(ep, DisconnectReason::Disconnected);
    }

    /// Disconnects every client and shuts the transport down. The server is
    /// inert afterwards.
    pub fn stop(&mut self) {
        let ids = self.connections.values().map(Connection::id).collect::<Vec<_>>();
        for id in ids {
            self.disconnect_client(id);
        }
        self.transport.shutdown();
    }

    /// Runs one tick at `now`: drains the transport, advances handshakes and
    /// reliability state, dispatches user messages, then flushes everything
    /// queued for the wire. Returns the lifecycle events raised during the
    /// tick.
    pub fn tick(&mut self, now: Instant) -> Vec<ServerEvent> {
        self.now = now;

        while let Some(event) = self.transport.poll() {
            match event {
                TransportEvent::Recv { datagram, from } => self.handle_datagram(&datagram, from),
                TransportEvent::Error { endpoint, error } => {
                    warn!(err = %error, "transport receive error");
                    self.handle_transport_error(endpoint);
                }
            }
        }

        let mut timed_out = Vec::new();
        for conn in self.connections.values_mut() {
            if !conn.is_active() {
                continue;
            }
            if conn.timed_out(now) {
                timed_out.push(conn.endpoint());
                continue;
            }
            conn.flush_retransmits(now);
        }
        for ep in timed_out {
            self.drop_connection(ep, DisconnectReason::TimedOut);
        }

        self.flush();
        self.purge();
        mem::take(&mut self.events)
    }

    fn handle_datagram(&mut self, datagram: &Bytes, from: T::Endpoint) {
        let header = match Header::decode(datagram) {
            Ok(header) => header,
            Err(err) => {
                trace!(%err, ?from, "dropping undecodable datagram");
                return;
            }
        };
        match header.tag {
            HeaderTag::Connect => self.on_connect(from),
            HeaderTag::Disconnect => {
                if self.connections.get(&from).is_some_and(Connection::is_active) {
                    self.drop_connection(from, DisconnectReason::Disconnected);
                }
            }
            HeaderTag::Heartbeat => self.on_heartbeat(datagram, from),
            HeaderTag::Ack | HeaderTag::AckExtra => self.on_ack(&header, datagram, from),
            HeaderTag::Unreliable | HeaderTag::Reliable => {
                self.on_user(&header, datagram, from);
            }
            HeaderTag::Welcome => self.on_welcome_echo(&header, datagram, from),
            HeaderTag::ClientConnected | HeaderTag::ClientDisconnected => {
                trace!(?from, "dropping client-bound tag");
            }
        }
    }

    fn on_connect(&mut self, from: T::Endpoint) {
        if let Some(conn) = self.connections.get_mut(&from) {
            // retransmitted connect; the reliable welcome already covers a
            // lost reply
            conn.note_recv(self.now);
            return;
        }
        let Some(id) = self.alloc_id() else {
            warn!(?from, "connection id space exhausted, refusing connect");
            return;
        };
        debug!(?from, %id, "new connection pending");
        let mut conn = Connection::new(from, ConnectionState::Pending, &self.config, self.now);
        conn.set_id(id);

        let mut welcome = self.pool.acquire(HeaderTag::Welcome);
        if let Err(err) = welcome.write(&id.0) {
            warn!(%err, "failed to build welcome");
        }
        conn.send(welcome, &mut self.pool, self.now);

        self.connections.insert(from, conn);
        self.by_id.insert(id, from);
    }

    fn on_heartbeat(&mut self, datagram: &Bytes, from: T::Endpoint) {
        let Some(conn) = self.connections.get_mut(&from).filter(|c| c.is_active()) else {
            return;
        };
        conn.note_recv(self.now);
        let Ok(mut probe) = self.pool.acquire_from(HeaderTag::Heartbeat, datagram) else {
            return;
        };
        let ping_id = probe.read::<u8>();
        self.pool.release(probe);
        let Ok(ping_id) = ping_id else {
            trace!(?from, "heartbeat without ping id");
            return;
        };

        // echo the probe so the client can sample its RTT
        let mut echo = self.pool.acquire(HeaderTag::Heartbeat);
        if let Err(err) = echo.write(&ping_id) {
            warn!(%err, "failed to build heartbeat echo");
        }
        if let Some(conn) = self.connections.get_mut(&from) {
            conn.send(echo, &mut self.pool, self.now);
        }
    }

    fn on_ack(&mut self, header: &Header, datagram: &Bytes, from: T::Endpoint) {
        let Some(conn) = self.connections.get_mut(&from).filter(|c| c.is_active()) else {
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
        if let Err(err) = conn.handle_ack(wire_seq, &mut msg, extra, self.now) {
            trace!(%err, ?from, "malformed ack");
        }
        self.pool.release(msg);
    }

    fn on_user(&mut self, header: &Header, datagram: &Bytes, from: T::Endpoint) {
        let Some(conn) = self.connections.get_mut(&from).filter(|c| c.is_active()) else {
            trace!(?from, "dropping user message from unknown endpoint");
            return;
        };
        conn.note_recv(self.now);
        if conn.state() != ConnectionState::Connected {
            // don't ack or record: a retransmission after the handshake
            // completes must still be deliverable
            trace!(?from, "dropping user message before handshake completion");
            return;
        }
        if let Some(wire_seq) = header.wire_seq {
            if conn.accept_tracked(wire_seq, &mut self.pool, self.now) != RecvOutcome::Fresh {
                return;
            }
        }
        let from_id = conn.id();
        let Ok(mut msg) = self.pool.acquire_from(header.tag, datagram) else {
            warn!(?from, "oversized datagram");
            return;
        };
        self.dispatch(from_id, &mut msg);
        self.pool.release(msg);
    }

    fn on_welcome_echo(&mut self, header: &Header, datagram: &Bytes, from: T::Endpoint) {
        let Some(conn) = self.connections.get_mut(&from).filter(|c| c.is_active()) else {
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
        let echoed = msg.read::<u16>();
        self.pool.release(msg);
        let id = conn.id();
        match echoed {
            Ok(echoed) if echoed == id.0 => {}
            other => {
                trace!(?from, ?other, "welcome echo with wrong id");
                return;
            }
        }
        if conn.state() != ConnectionState::Pending {
            return;
        }
        conn.set_state(ConnectionState::Connected);
        debug!(%id, "client connected");
        self.events.push(ServerEvent::ClientConnected { client_id: id });
        self.broadcast_about(HeaderTag::ClientConnected, id);
    }

    /// Tells every other connected client about `subject` joining or
    /// leaving.
    fn broadcast_about(&mut self, tag: HeaderTag, subject: ClientId) {
        let mut msg = self.pool.acquire(tag);
        if let Err(err) = msg.write(&subject.0) {
            warn!(%err, "failed to build broadcast");
        }
        let datagram = msg.as_bytes().to_vec();
        self.pool.release(msg);
        for conn in self.connections.values_mut() {
            if conn.state() == ConnectionState::Connected && conn.id() != subject {
                conn.send_sealed(true, datagram.clone(), self.now);
            }
        }
    }

    fn drop_connection(&mut self, ep: T::Endpoint, reason: DisconnectReason) {
        let Some(conn) = self.connections.get_mut(&ep) else {
            return;
        };
        let id = conn.id();
        let was_connected = conn.state() == ConnectionState::Connected;
        conn.teardown();
        self.transport.close(ep);
        debug!(%id, %reason, "client disconnected");
        self.events.push(ServerEvent::ClientDisconnected {
            client_id: id,
            reason,
        });
        if was_connected {
            self.broadcast_about(HeaderTag::ClientDisconnected, id);
        }
    }

    fn handle_transport_error(&mut self, endpoint: Option<T::Endpoint>) {
        match endpoint {
            Some(ep) => {
                if self.connections.get(&ep).is_some_and(Connection::is_active) {
                    self.drop_connection(ep, DisconnectReason::TransportError);
                }
            }
            None => {
                let eps = self
                    .connections
                    .values()
                    .filter(|conn| conn.is_active())
                    .map(Connection::endpoint)
                    .collect::<Vec<_>>();
                for ep in eps {
                    self.drop_connection(ep, DisconnectReason::TransportError);
                }
            }
        }
    }

    fn dispatch(&mut self, from: ClientId, msg: &mut Message) {
        let msg_id = match msg.read::<u16>() {
            Ok(msg_id) => msg_id,
            Err(err) => {
                warn!(%err, %from, "user message without message id");
                return;
            }
        };
        let mut handlers = mem::take(&mut self.handlers);
        if let Some(handler) = handlers.get_mut(&msg_id) {
            if let Err(err) = handler(self, from, msg) {
                warn!(%err, msg_id, "message handler failed");
            }
        } else {
            warn!(msg_id, "no handler registered for message id");
        }
        // keep anything registered from inside a handler
        let registered = mem::replace(&mut self.handlers, handlers);
        self.handlers.extend(registered);
    }

    fn flush(&mut self) {
        for conn in self.connections.values_mut() {
            let ep = conn.endpoint();
            for datagram in conn.drain_outgoing() {
                if let Err(err) = self.transport.send(&datagram, ep) {
                    // swallowed: retransmission covers reliable traffic
                    debug!(%err, "transport send failed");
                }
            }
        }
    }

    fn purge(&mut self) {
        self.connections.retain(|_, conn| conn.is_active());
        let connections = &self.connections;
        self.by_id.retain(|_, ep| connections.contains_key(ep));
    }

    fn alloc_id(&mut self) -> Option<ClientId> {
        // wrapping scan for the next free id, skipping the reserved 0
        for _ in 0..u16::MAX {
            let candidate = ClientId(self.next_id);
            self.next_id = self.next_id.checked_add(1).map_or(1, |next| next);
            if candidate != ClientId::NONE && !self.by_id.contains_key(&candidate) {
                return Some(candidate);
            }
        }
        None
    }
}
