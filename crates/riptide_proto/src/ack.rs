//! See [`Acknowledge`].

use arbitrary::Arbitrary;

use crate::seq::Seq;

/// Width of the acknowledgement window, in sequence numbers.
///
/// This bounds both the receive-side bitfield and the number of unacked
/// reliable datagrams a sender may have in flight.
pub const WINDOW: u16 = 16;

/// Receive-side record of which reliable datagrams have arrived.
///
/// This uses a variation of the strategy described in
/// [*Gaffer On Games*, Packet Level Acks](https://gafferongames.com/post/reliable_ordered_messages/#packet-levelacks),
/// storing two pieces of info:
/// * the newest accepted sequence number (`last_recv`)
/// * a bitfield of which sequences before `last_recv` have been received
///   (`ack_bits`)
///
/// If bit `k` of `ack_bits` is set, then the datagram with sequence
/// `last_recv - k - 1` has been received. `last_recv` itself is implied
/// received and has no bit. For example,
///
/// ```text
/// last_recv: 40
///  ack_bits: 0b0000000000001001
///                         ^  ^
///                         |  +- seq 39 (40 - 0 - 1) received
///                         +---- seq 36 (40 - 3 - 1) received
/// ```
///
/// Both pieces travel in every `ack`/`ackExtra` datagram, so each delivery is
/// acknowledged redundantly across the following [`WINDOW`] acks.
///
/// A freshly created window has received nothing, and [`Acknowledge::last_recv`]
/// is [`None`] until the first [`Acknowledge::record`]. Without this state, a
/// sender starting near the top of the sequence space (which the wire format
/// must survive - see [`Seq::from_wire`]) would have its first datagrams
/// misread as history behind sequence 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Arbitrary)]
pub struct Acknowledge {
    last_recv: Seq,
    ack_bits: u16,
    any_recv: bool,
}

/// How [`Acknowledge::record`] classified an incoming sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// First sighting; the payload must be delivered.
    Fresh,
    /// Already delivered; the payload must be dropped.
    Duplicate,
    /// Further back than the window can represent; the payload must be
    /// dropped.
    Stale,
}

impl Acknowledge {
    /// Creates a new value with no datagrams received.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Gets the newest accepted sequence number, or [`None`] if nothing has
    /// been received yet.
    #[must_use]
    pub const fn last_recv(&self) -> Option<Seq> {
        if self.any_recv { Some(self.last_recv) } else { None }
    }

    /// Gets the received-sequence bitfield below [`Self::last_recv`].
    #[must_use]
    pub const fn ack_bits(&self) -> u16 {
        self.ack_bits
    }

    /// Gets the sequence number to reconstruct incoming 12-bit wire fields
    /// against.
    ///
    /// Before anything has been received this is sequence 0, which covers
    /// senders starting anywhere within half a wire window of 0.
    #[must_use]
    pub const fn reference(&self) -> Seq {
        self.last_recv
    }

    /// Records an incoming sequence number and classifies it.
    ///
    /// A sequence newer than `last_recv` shifts the window forward; a
    /// sequence up to [`WINDOW`] behind fills in its bit if it was missing;
    /// anything older cannot be represented and is [`RecvOutcome::Stale`].
    ///
    /// # Example
    ///
    /// ```
    /// # use riptide_proto::{ack::{Acknowledge, RecvOutcome}, seq::Seq};
    /// let mut acks = Acknowledge::new();
    /// assert_eq!(RecvOutcome::Fresh, acks.record(Seq(1)));
    /// assert_eq!(RecvOutcome::Fresh, acks.record(Seq(2)));
    /// assert_eq!(RecvOutcome::Duplicate, acks.record(Seq(2)));
    /// // late arrival of a sequence we skipped over
    /// assert_eq!(RecvOutcome::Fresh, acks.record(Seq(4)));
    /// assert_eq!(RecvOutcome::Fresh, acks.record(Seq(3)));
    /// assert_eq!(RecvOutcome::Duplicate, acks.record(Seq(3)));
    /// ```
    pub fn record(&mut self, seq: Seq) -> RecvOutcome {
        if !self.any_recv {
            self.any_recv = true;
            self.last_recv = seq;
            self.ack_bits = 0;
            return RecvOutcome::Fresh;
        }

        let delta = i32::from(self.last_recv.dist_to(seq));
        if delta > 0 {
            // `seq` is the new newest; everything slides back by `delta`,
            // and the old `last_recv` gains the bit at `delta - 1`
            #[allow(clippy::cast_sign_loss)]
            let shift = delta as u32;
            self.ack_bits = self.ack_bits.checked_shl(shift).unwrap_or(0);
            if shift <= u32::from(WINDOW) {
                self.ack_bits |= 1 << (shift - 1);
            }
            self.last_recv = seq;
            RecvOutcome::Fresh
        } else if delta == 0 {
            RecvOutcome::Duplicate
        } else if -delta <= i32::from(WINDOW) {
            #[allow(clippy::cast_sign_loss)]
            let bit = 1u16 << ((-delta - 1) as u32);
            if self.ack_bits & bit == 0 {
                self.ack_bits |= bit;
                RecvOutcome::Fresh
            } else {
                RecvOutcome::Duplicate
            }
        } else {
            RecvOutcome::Stale
        }
    }

    /// Gets whether `seq` is covered as received by this window.
    ///
    /// Sequences older than the window always report `false`, even though
    /// they may well have been received once.
    #[must_use]
    pub fn is_acked(&self, seq: Seq) -> bool {
        if !self.any_recv {
            return false;
        }
        let delta = i32::from(self.last_recv.dist_to(seq));
        if delta == 0 {
            true
        } else if delta < 0 && -delta <= i32::from(WINDOW) {
            #[allow(clippy::cast_sign_loss)]
            let bit = 1u16 << ((-delta - 1) as u32);
            self.ack_bits & bit != 0
        } else {
            false
        }
    }

    /// Converts this into an iterator over all sequences it covers, newest
    /// first, starting with `last_recv` itself.
    pub fn seqs(self) -> impl Iterator<Item = Seq> {
        self.last_recv()
            .into_iter()
            .chain((0..WINDOW).filter_map(move |k| {
                if self.ack_bits & (1 << k) == 0 {
                    None
                } else {
                    Some(self.last_recv - Seq(k + 1))
                }
            }))
    }
}
