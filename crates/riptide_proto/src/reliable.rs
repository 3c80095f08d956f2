//! See [`PendingStore`].

use ahash::AHashMap;
use bytes::Bytes;
use web_time::{Duration, Instant};

use crate::{ack, seq::Seq};

/// Sender-side table of reliable datagrams which have been sent but not yet
/// acknowledged.
///
/// # Insertion policy
///
/// When the connection seals and sends a reliable datagram, its bytes go in
/// here under the assigned sequence, keyed with the send time and the
/// remaining send attempts. The sealed [`Bytes`] are reference-counted, so
/// keeping them for retransmission costs no copy.
///
/// # Removal policy
///
/// An entry leaves the table when a matching acknowledgement arrives
/// ([`PendingStore::ack`]), when its attempts are exhausted
/// ([`PendingStore::due`]), or when the connection is torn down
/// ([`PendingStore::clear`]).
///
/// Every entry stays within [`ack::WINDOW`] sequences of the oldest
/// unacknowledged one ([`PendingStore::can_accept`]); the connection queues
/// further reliable sends until acks or exhaustion move that base forward.
/// The bound is on sequence *span*, not entry count: selective acks can
/// leave a hole behind a run of acknowledged sequences, and a fresh
/// sequence assigned past the hole's window would be unrepresentable in the
/// peer's ack bitfield once the hole finally arrives - the peer would
/// misread the retransmission as stale and never deliver it.
#[derive(Debug, Default)]
pub struct PendingStore {
    entries: AHashMap<Seq, Pending>,
}

#[derive(Debug)]
struct Pending {
    datagram: Bytes,
    first_sent_at: Instant,
    last_sent_at: Instant,
    /// Wire sends left after the ones already made.
    attempts_left: u8,
}

impl PendingStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of unacknowledged datagrams in flight.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Gets whether nothing is awaiting acknowledgement.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Oldest sequence still awaiting acknowledgement, the base of the
    /// sliding window.
    #[must_use]
    pub fn oldest(&self) -> Option<Seq> {
        self.entries.keys().copied().min()
    }

    /// Gets whether `seq` may be put in flight without the window
    /// outgrowing the peer's ack bitfield.
    ///
    /// Holds while `seq` is within [`ack::WINDOW`] of the oldest
    /// unacknowledged sequence; an empty table accepts anything.
    #[must_use]
    pub fn can_accept(&self, seq: Seq) -> bool {
        self.oldest()
            .is_none_or(|oldest| i32::from(oldest.dist_to(seq)) < i32::from(ack::WINDOW))
    }

    /// Tracks a just-sent datagram.
    ///
    /// `max_attempts` counts total wire sends, including the one the caller
    /// just made.
    pub fn insert(&mut self, seq: Seq, datagram: Bytes, now: Instant, max_attempts: u8) {
        debug_assert!(self.can_accept(seq));
        self.entries.insert(
            seq,
            Pending {
                datagram,
                first_sent_at: now,
                last_sent_at: now,
                attempts_left: max_attempts.saturating_sub(1),
            },
        );
    }

    /// Removes an acknowledged sequence.
    ///
    /// Returns the instant the datagram was first sent if it was still
    /// pending: its first acknowledgement, suitable as an RTT sample.
    /// Duplicate acks return [`None`].
    pub fn ack(&mut self, seq: Seq) -> Option<Instant> {
        self.entries.remove(&seq).map(|entry| entry.first_sent_at)
    }

    /// Collects the datagrams due for retransmission at `now`, given the
    /// current retransmission timeout.
    ///
    /// Each returned datagram counts as sent: its attempt budget shrinks by
    /// one and its last-sent time moves to `now`. Entries with no attempts
    /// left are dropped from the table instead - delivery becomes the
    /// application's problem (its own timeout/heartbeat logic), not an
    /// error.
    pub fn due(&mut self, now: Instant, rto: Duration) -> Vec<(Seq, Bytes)> {
        let mut resend = Vec::new();
        self.entries.retain(|seq, entry| {
            if now < entry.last_sent_at + rto {
                return true;
            }
            if entry.attempts_left == 0 {
                tracing::debug!(?seq, "reliable delivery exhausted, dropping");
                return false;
            }
            entry.attempts_left -= 1;
            entry.last_sent_at = now;
            resend.push((*seq, entry.datagram.clone()));
            true
        });
        resend
    }

    /// Drops every entry, releasing the retransmission buffers.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
