//! Per-remote-endpoint connection state.

use core::fmt::{self, Display};
use std::collections::VecDeque;

use bytes::Bytes;
use tracing::{error, trace};
use web_time::{Duration, Instant};

use riptide_proto::{
    ack::{self, Acknowledge, RecvOutcome},
    header::{Header, HeaderTag},
    msg::{Message, MessagePool, ReadError, WriteError},
    reliable::PendingStore,
    rtt::RttEstimator,
    seq::Seq,
};

use crate::config::PeerConfig;

/// Server-assigned identity of a connection, unique per server.
///
/// [`ClientId::NONE`] (wire value 0) is reserved for "no identity": a client
/// which has not completed its handshake yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ClientId(pub u16);

impl ClientId {
    /// The reserved "no identity" value.
    pub const NONE: Self = Self(0);
}

impl Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a [`Connection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Client side: `connect` sent, no `welcome` yet.
    Connecting,
    /// Server side: `welcome` sent, its echo not received yet.
    Pending,
    /// Handshake complete on this side.
    Connected,
    /// Terminal. A connection never leaves this state, and holds no pending
    /// messages in it.
    NotConnected,
}

/// State for one remote endpoint: lifecycle, reliability tracking, and the
/// outgoing datagram queue.
///
/// A connection holds no reference to the peer that owns it; everything it
/// wants to put on the wire accumulates in its outgoing queue, which the
/// owning peer drains to the transport each tick. Role-specific behaviour
/// (handshakes, heartbeats, dispatch) lives in the peer; this type only
/// knows how to move datagrams reliably.
#[derive(Debug)]
pub(crate) struct Connection<E> {
    endpoint: E,
    id: ClientId,
    state: ConnectionState,
    /// Next outgoing reliable sequence. Starts at 1; sequence 0 is never the
    /// first assigned, mirroring the [`ClientId::NONE`] reservation.
    next_seq: Seq,
    acks: Acknowledge,
    pending: PendingStore,
    /// Reliable datagrams waiting for the send window to open. Sequences are
    /// assigned at dispatch, not enqueue, so `next_seq` never runs further
    /// than the window width ahead of the oldest unacknowledged sequence.
    queued: VecDeque<Vec<u8>>,
    rtt: RttEstimator,
    last_recv_at: Instant,
    timeout: Duration,
    max_send_attempts: u8,
    outgoing: Vec<Bytes>,
}

impl<E: Copy> Connection<E> {
    pub fn new(endpoint: E, state: ConnectionState, config: &PeerConfig, now: Instant) -> Self {
        Self {
            endpoint,
            id: ClientId::NONE,
            state,
            next_seq: Seq(1),
            acks: Acknowledge::new(),
            pending: PendingStore::new(),
            queued: VecDeque::new(),
            rtt: RttEstimator::default(),
            last_recv_at: now,
            timeout: config.timeout,
            max_send_attempts: config.max_send_attempts,
            outgoing: Vec::new(),
        }
    }

    pub const fn endpoint(&self) -> E {
        self.endpoint
    }

    pub const fn id(&self) -> ClientId {
        self.id
    }

    pub const fn set_id(&mut self, id: ClientId) {
        self.id = id;
    }

    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    pub const fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
    }

    pub fn is_active(&self) -> bool {
        self.state != ConnectionState::NotConnected
    }

    pub const fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub fn record_rtt_sample(&mut self, sample: Duration) {
        self.rtt.update(sample);
    }

    /// Marks that *something* arrived from this endpoint, deferring the
    /// timeout.
    pub const fn note_recv(&mut self, now: Instant) {
        self.last_recv_at = now;
    }

    pub fn timed_out(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_recv_at) > self.timeout
    }

    /// Seals a message into its wire bytes and queues it for sending,
    /// returning the buffer to the pool.
    ///
    /// Tracked messages go through the reliability layer; everything else is
    /// fire-and-forget. A no-op on a [`ConnectionState::NotConnected`]
    /// connection.
    pub fn send(&mut self, msg: Message, pool: &mut MessagePool, now: Instant) {
        let tracked = msg.header().is_tracked();
        let datagram = msg.as_bytes().to_vec();
        pool.release(msg);
        self.send_sealed(tracked, datagram, now);
    }

    /// Queues already sealed wire bytes, e.g. one copy of a broadcast.
    pub fn send_sealed(&mut self, tracked: bool, datagram: Vec<u8>, now: Instant) {
        if !self.is_active() {
            trace!("dropping send on dead connection");
            return;
        }
        if tracked {
            if self.pending.can_accept(self.next_seq) {
                self.dispatch_reliable(datagram, now);
            } else {
                self.queued.push_back(datagram);
            }
        } else {
            self.outgoing.push(Bytes::from(datagram));
        }
    }

    /// Assigns the next sequence to a reliable datagram and puts it in
    /// flight.
    fn dispatch_reliable(&mut self, mut datagram: Vec<u8>, now: Instant) {
        let seq = self.next_seq.get_inc();
        Header::patch_seq(&mut datagram, seq);
        let datagram = Bytes::from(datagram);
        self.pending
            .insert(seq, datagram.clone(), now, self.max_send_attempts);
        self.outgoing.push(datagram);
    }

    /// Runs the receive side of the reliability layer for a tracked datagram
    /// carrying the 12-bit `wire_seq`: reconstructs the full sequence,
    /// acknowledges it (also for duplicates, repairing lost acks), and
    /// classifies it for delivery.
    pub fn accept_tracked(
        &mut self,
        wire_seq: u16,
        pool: &mut MessagePool,
        now: Instant,
    ) -> RecvOutcome {
        self.note_recv(now);
        let seq = Seq::from_wire(wire_seq, self.acks.reference());
        let outcome = self.acks.record(seq);
        self.emit_ack(seq, pool);
        if outcome != RecvOutcome::Fresh {
            trace!(?seq, ?outcome, "suppressing tracked datagram");
        }
        outcome
    }

    fn emit_ack(&mut self, just_received: Seq, pool: &mut MessagePool) {
        let Some(last_recv) = self.acks.last_recv() else {
            return;
        };
        let newest = last_recv == just_received;
        let tag = if newest {
            HeaderTag::Ack
        } else {
            HeaderTag::AckExtra
        };
        let mut msg = pool.acquire(tag);
        let res: Result<(), WriteError> = (|| {
            msg.write(&self.acks.ack_bits())?;
            if !newest {
                msg.write(&just_received.0)?;
            }
            Ok(())
        })();
        if let Err(err) = res {
            // unreachable with a legal message capacity
            error!(%err, "failed to build ack");
            pool.release(msg);
            return;
        }
        let mut datagram = msg.as_bytes().to_vec();
        pool.release(msg);
        Header::patch_seq(&mut datagram, last_recv);
        self.outgoing.push(Bytes::from(datagram));
    }

    /// Processes an inbound `ack`/`ackExtra` payload.
    ///
    /// The header's `wire_seq` names the peer's newest received sequence,
    /// reconstructed against the newest sequence we have assigned. Every
    /// covered sequence leaves the pending table; the first ack of the
    /// directly targeted sequence doubles as an RTT sample.
    pub fn handle_ack(
        &mut self,
        wire_seq: u16,
        msg: &mut Message,
        extra: bool,
        now: Instant,
    ) -> Result<(), ReadError> {
        let ack_bits = msg.read::<u16>()?;
        let newest_sent = self.next_seq - Seq(1);
        let acked_last = Seq::from_wire(wire_seq, newest_sent);
        let direct = if extra {
            Seq(msg.read::<u16>()?)
        } else {
            acked_last
        };

        if let Some(first_sent_at) = self.pending.ack(direct) {
            self.rtt.update(now.saturating_duration_since(first_sent_at));
        }
        self.pending.ack(acked_last);
        for k in 0..ack::WINDOW {
            if ack_bits & (1 << k) != 0 {
                self.pending.ack(acked_last - Seq(k + 1));
            }
        }

        // acks may have moved the window base: put waiting sends in flight
        self.dispatch_queued(now);
        Ok(())
    }

    /// Dispatches waiting reliable sends for as long as their sequences stay
    /// within the window.
    fn dispatch_queued(&mut self, now: Instant) {
        while self.pending.can_accept(self.next_seq) {
            let Some(datagram) = self.queued.pop_front() else {
                break;
            };
            self.dispatch_reliable(datagram, now);
        }
    }

    /// Re-queues every pending reliable datagram whose retransmission is
    /// due, on the schedule derived from the RTT estimate.
    pub fn flush_retransmits(&mut self, now: Instant) {
        let rto = self.rtt.rto();
        for (seq, datagram) in self.pending.due(now, rto) {
            trace!(?seq, "retransmitting");
            self.outgoing.push(datagram);
        }
        // an exhausted entry also moves the window base forward
        self.dispatch_queued(now);
    }

    /// Takes everything queued for the wire.
    pub fn drain_outgoing(&mut self) -> Vec<Bytes> {
        core::mem::take(&mut self.outgoing)
    }

    /// Test hook: jumps the outgoing sequence counter, e.g. right up to the
    /// wrap.
    #[cfg(test)]
    pub fn force_next_seq(&mut self, seq: Seq) {
        self.next_seq = seq;
    }

    #[cfg(test)]
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Transitions to the terminal state and releases all buffered traffic.
    pub fn teardown(&mut self) {
        self.state = ConnectionState::NotConnected;
        self.pending.clear();
        self.queued.clear();
        self.outgoing.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW_STEP: Duration = Duration::from_millis(10);

    fn conn(now: Instant) -> (Connection<u8>, MessagePool) {
        let config = PeerConfig::default();
        (
            Connection::new(0, ConnectionState::Connected, &config, now),
            MessagePool::new(config.max_message_size),
        )
    }

    fn reliable_msg(pool: &mut MessagePool) -> Message {
        let mut msg = pool.acquire(HeaderTag::Reliable);
        msg.write(&42_u16).unwrap();
        msg
    }

    #[test]
    fn reliable_seqs_start_at_one_and_increase() {
        let now = Instant::now();
        let (mut conn, mut pool) = conn(now);

        for expected in 1..=3_u16 {
            let msg = reliable_msg(&mut pool);
            conn.send(msg, &mut pool, now);
            let out = conn.drain_outgoing();
            assert_eq!(1, out.len());
            let header = Header::decode(&out[0]).unwrap();
            assert_eq!(Some(Seq(expected).to_wire()), header.wire_seq);
        }
    }

    #[test]
    fn window_overflow_queues_until_acked() {
        let now = Instant::now();
        let (mut conn, mut pool) = conn(now);

        for _ in 0..20 {
            let msg = reliable_msg(&mut pool);
            conn.send(msg, &mut pool, now);
        }
        // only the window's worth went on the wire
        assert_eq!(16, conn.drain_outgoing().len());

        // ack seq 1: one queued datagram is released
        let mut ack = pool.acquire(HeaderTag::Ack);
        ack.write(&0_u16).unwrap();
        let mut ack = roundtrip(ack, &mut pool, Seq(1));
        conn.handle_ack(Seq(1).to_wire(), &mut ack, false, now + NOW_STEP)
            .unwrap();
        let out = conn.drain_outgoing();
        assert_eq!(1, out.len());
        assert_eq!(
            Some(Seq(17).to_wire()),
            Header::decode(&out[0]).unwrap().wire_seq
        );
    }

    /// Seals `msg`, patches `seq` in, and reopens it as a received message
    /// with the read cursor at the payload.
    fn roundtrip(msg: Message, pool: &mut MessagePool, seq: Seq) -> Message {
        let mut datagram = msg.as_bytes().to_vec();
        pool.release(msg);
        Header::patch_seq(&mut datagram, seq);
        let header = Header::decode(&datagram).unwrap();
        pool.acquire_from(header.tag, &datagram).unwrap()
    }

    #[test]
    fn retransmits_on_rto_until_acked() {
        let now = Instant::now();
        let (mut conn, mut pool) = conn(now);
        let msg = reliable_msg(&mut pool);
        conn.send(msg, &mut pool, now);
        let first = conn.drain_outgoing();
        assert_eq!(1, first.len());

        let rto = conn.rtt().rto();
        conn.flush_retransmits(now + rto);
        let second = conn.drain_outgoing();
        assert_eq!(1, second.len());
        assert_eq!(first[0], second[0]);

        // ack it; nothing further goes out
        let mut ack = pool.acquire(HeaderTag::Ack);
        ack.write(&0_u16).unwrap();
        let mut ack = roundtrip(ack, &mut pool, Seq(1));
        conn.handle_ack(Seq(1).to_wire(), &mut ack, false, now + rto * 2)
            .unwrap();
        conn.flush_retransmits(now + rto * 4);
        assert!(conn.drain_outgoing().is_empty());
    }

    #[test]
    fn accept_tracked_acks_and_suppresses_duplicates() {
        let now = Instant::now();
        let (mut conn, mut pool) = conn(now);

        assert_eq!(
            RecvOutcome::Fresh,
            conn.accept_tracked(Seq(1).to_wire(), &mut pool, now)
        );
        assert_eq!(
            RecvOutcome::Duplicate,
            conn.accept_tracked(Seq(1).to_wire(), &mut pool, now)
        );
        // two acks went out, one per receipt
        let out = conn.drain_outgoing();
        assert_eq!(2, out.len());
        for datagram in &out {
            let header = Header::decode(datagram).unwrap();
            assert_eq!(HeaderTag::Ack, header.tag);
            assert_eq!(Some(Seq(1).to_wire()), header.wire_seq);
        }
    }

    #[test]
    fn out_of_order_receipt_acks_with_extra() {
        let now = Instant::now();
        let (mut conn, mut pool) = conn(now);

        conn.accept_tracked(Seq(2).to_wire(), &mut pool, now);
        conn.drain_outgoing();
        assert_eq!(
            RecvOutcome::Fresh,
            conn.accept_tracked(Seq(1).to_wire(), &mut pool, now)
        );
        let out = conn.drain_outgoing();
        assert_eq!(1, out.len());
        let header = Header::decode(&out[0]).unwrap();
        assert_eq!(HeaderTag::AckExtra, header.tag);
        // the seq field still names the newest received sequence
        assert_eq!(Some(Seq(2).to_wire()), header.wire_seq);
    }

    /// A lost low sequence must pin the send window: if fresh sequences kept
    /// flowing past the hole, the eventual retransmission would fall outside
    /// the receiver's ack window and be misread as stale.
    #[test]
    fn hole_in_window_blocks_new_seqs() {
        let now = Instant::now();
        let (mut conn, mut pool) = conn(now);
        for _ in 0..20 {
            let msg = reliable_msg(&mut pool);
            conn.send(msg, &mut pool, now);
        }
        assert_eq!(16, conn.drain_outgoing().len());

        // seqs 2..=16 are acked; seq 1 was lost and stays pending
        let mut ack = pool.acquire(HeaderTag::Ack);
        ack.write(&0b0011_1111_1111_1111_u16).unwrap();
        let mut ack = roundtrip(ack, &mut pool, Seq(16));
        conn.handle_ack(Seq(16).to_wire(), &mut ack, false, now + NOW_STEP)
            .unwrap();
        assert_eq!(1, conn.pending_len());
        // every fresh sequence would outrun the window anchored at seq 1
        assert!(conn.drain_outgoing().is_empty());

        // the hole fills; the queue drains up to the new window base
        let mut ack = pool.acquire(HeaderTag::Ack);
        ack.write(&(1_u16 << 14)).unwrap();
        let mut ack = roundtrip(ack, &mut pool, Seq(16));
        conn.handle_ack(Seq(16).to_wire(), &mut ack, false, now + NOW_STEP * 2)
            .unwrap();
        let out = conn.drain_outgoing();
        assert_eq!(4, out.len());
        assert_eq!(
            Some(Seq(17).to_wire()),
            Header::decode(&out[0]).unwrap().wire_seq
        );
        assert_eq!(4, conn.pending_len());
    }

    /// One sender, one receiver, a lossless link, and 20 reliable messages
    /// starting at sequence 65530: everything must arrive exactly once and
    /// be acknowledged across the 16-bit wrap.
    #[test]
    fn reliable_delivery_across_seq_wrap() {
        let start = Instant::now();
        let config = PeerConfig::default();
        let mut pool = MessagePool::new(config.max_message_size);
        let mut alice = Connection::new(0_u8, ConnectionState::Connected, &config, start);
        let mut bob = Connection::new(1_u8, ConnectionState::Connected, &config, start);
        alice.force_next_seq(Seq(65530));

        for n in 0..20_u16 {
            let mut msg = pool.acquire(HeaderTag::Reliable);
            msg.write(&n).unwrap();
            alice.send(msg, &mut pool, start);
        }

        let mut delivered = std::collections::BTreeSet::new();
        let mut now = start;
        for _ in 0..100 {
            now += NOW_STEP;
            for datagram in alice.drain_outgoing() {
                let header = Header::decode(&datagram).unwrap();
                assert_eq!(HeaderTag::Reliable, header.tag);
                let wire_seq = header.wire_seq.unwrap();
                if bob.accept_tracked(wire_seq, &mut pool, now) == RecvOutcome::Fresh {
                    let mut msg = pool.acquire_from(header.tag, &datagram).unwrap();
                    delivered.insert(msg.read::<u16>().unwrap());
                    pool.release(msg);
                }
            }
            for datagram in bob.drain_outgoing() {
                let header = Header::decode(&datagram).unwrap();
                let wire_seq = header.wire_seq.unwrap();
                let mut msg = pool.acquire_from(header.tag, &datagram).unwrap();
                alice
                    .handle_ack(wire_seq, &mut msg, header.tag == HeaderTag::AckExtra, now)
                    .unwrap();
                pool.release(msg);
            }
            alice.flush_retransmits(now);
            if delivered.len() == 20 && alice.pending_len() == 0 {
                break;
            }
        }

        assert_eq!((0..20_u16).collect::<Vec<_>>(), delivered.into_iter().collect::<Vec<_>>());
        assert_eq!(0, alice.pending_len());
    }

    #[test]
    fn teardown_makes_sends_noops() {
        let now = Instant::now();
        let (mut conn, mut pool) = conn(now);
        conn.teardown();
        assert_eq!(ConnectionState::NotConnected, conn.state());
        let msg = reliable_msg(&mut pool);
        conn.send(msg, &mut pool, now);
        assert!(conn.drain_outgoing().is_empty());
    }
}
