//! See [`Seq`].

use core::{
    cmp::Ordering,
    ops::{Add, AddAssign, Sub, SubAssign},
};

use arbitrary::Arbitrary;

/// Sequence number identifying a reliable datagram sent across a network.
///
/// The number is stored internally as a [`u16`], which will wrap around
/// quickly under a realistic send rate. Users of a sequence number must take
/// this into account, and use the custom [`Seq::cmp`] implementation, which
/// considers wraparound.
///
/// # Wraparound
///
/// The sequence number can be visualized as an infinite number line, where
/// [`u16::MAX`] is right before `0`, `0` is before `1`, etc.:
///
/// ```text
///     65534  65535    0      1      2
/// ... --|------|------|------|------|-- ...
/// ```
///
/// [Addition](Add) and [subtraction](Sub) always wrap.
///
/// See <https://gafferongames.com/post/reliability_ordering_and_congestion_avoidance_over_udp/>,
/// *Handling Sequence Number Wrap-Around*.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Arbitrary)]
pub struct Seq(pub u16);

/// Number of bits of a [`Seq`] which actually travel in a datagram header.
///
/// See [`Seq::from_wire`].
pub const WIRE_BITS: u32 = 12;

/// Bitmask covering the [`WIRE_BITS`] low bits of a [`Seq`].
pub const WIRE_MASK: u16 = (1 << WIRE_BITS) - 1;

const HALF_WINDOW: i32 = 1 << (WIRE_BITS - 1);

impl Seq {
    /// Sequence number with value [`u16::MAX`].
    pub const MAX: Self = Self(u16::MAX);

    /// Returns the current value and increments `self`, wrapping.
    #[must_use]
    pub fn get_inc(&mut self) -> Self {
        let cur = *self;
        self.0 = self.0.wrapping_add(1);
        cur
    }

    /// Gets a signed count of the sequence numbers "elapsed" between `self`
    /// and `rhs`.
    ///
    /// This is effectively `rhs - self`, but taking wraparound into account
    /// and therefore returning a signed value along the smallest path around
    /// the number circle.
    ///
    /// # Example
    ///
    /// ```
    /// # use riptide_proto::seq::Seq;
    /// assert_eq!(Seq(0).dist_to(Seq(5)), 5);
    /// assert_eq!(Seq(5).dist_to(Seq(0)), -5);
    /// assert_eq!(Seq::MAX.dist_to(Seq(0)), 1);
    /// assert_eq!(Seq(0).dist_to(Seq::MAX), -1);
    /// ```
    #[must_use]
    pub const fn dist_to(self, rhs: Self) -> i16 {
        #[allow(clippy::cast_possible_wrap)] // that's exactly what we want
        (rhs.0.wrapping_sub(self.0) as i16)
    }

    /// Gets the [`WIRE_BITS`] low bits of this sequence number, as they are
    /// packed into a datagram header.
    #[must_use]
    pub const fn to_wire(self) -> u16 {
        self.0 & WIRE_MASK
    }

    /// Reconstructs a full sequence number from the [`WIRE_BITS`]-bit wire
    /// field `wire`, given a `reference` sequence number known out-of-band.
    ///
    /// The result is the unique value congruent to `wire` modulo
    /// 2^[`WIRE_BITS`] which lies in `[reference - 2048, reference + 2048)`.
    /// Receivers use their last received sequence as the reference for
    /// incoming reliable datagrams, and their newest assigned outgoing
    /// sequence as the reference for incoming acknowledgements.
    ///
    /// # Example
    ///
    /// ```
    /// # use riptide_proto::seq::Seq;
    /// let reference = Seq(0x1234);
    /// assert_eq!(Seq::from_wire(Seq(0x1235).to_wire(), reference), Seq(0x1235));
    /// // a wire value "behind" the reference resolves below it
    /// assert_eq!(Seq::from_wire(Seq(0x0FFF).to_wire(), Seq(0x1001)), Seq(0x0FFF));
    /// // reconstruction carries across the u16 wrap
    /// assert_eq!(Seq::from_wire(Seq(3).to_wire(), Seq(0xFFFE)), Seq(3));
    /// ```
    #[must_use]
    pub const fn from_wire(wire: u16, reference: Self) -> Self {
        debug_assert!(wire <= WIRE_MASK);
        let delta = wire as i32 - (reference.0 & WIRE_MASK) as i32;
        let delta = if delta >= HALF_WINDOW {
            delta - (1 << WIRE_BITS)
        } else if delta < -HALF_WINDOW {
            delta + (1 << WIRE_BITS)
        } else {
            delta
        };
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Self(reference.0.wrapping_add(delta as u16))
    }
}

impl Ord for Seq {
    /// Logically compares `self` to `other` in a way that respects wraparound
    /// of sequence numbers, treating e.g. `0 cmp 1` as [`Less`] (as expected),
    /// but `0 cmp 65535` as [`Greater`].
    ///
    /// If the two values compared have a real difference equal to or larger
    /// than `u16::MAX / 2`, no guarantees are upheld.
    ///
    /// [`Greater`]: Ordering::Greater
    /// [`Less`]: Ordering::Less
    fn cmp(&self, other: &Self) -> Ordering {
        // Variant of `slotmap`'s generation comparison function, adapted to
        // u16s and Ordering.
        let s1 = self.0;
        let s2 = other.0;
        #[allow(clippy::cast_possible_wrap)] // that's exactly what we want
        (s1 as i16).wrapping_sub(s2 as i16).cmp(&0)
    }
}

impl PartialOrd for Seq {
    /// See [`Seq::cmp`].
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Add<Seq> for Seq {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0.wrapping_add(rhs.0))
    }
}

impl AddAssign for Seq {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub<Seq> for Seq {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0.wrapping_sub(rhs.0))
    }
}

impl SubAssign for Seq {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl From<u16> for Seq {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increasing_wraparound() {
        assert!(Seq(0) < Seq(1));
        assert!(Seq(1) < Seq(2));
        assert!(Seq(u16::MAX - 1) < Seq(u16::MAX));

        assert!(Seq(u16::MAX) < Seq(0));
        assert!(Seq(u16::MAX) < Seq(1));
        assert!(Seq(u16::MAX - 3) < Seq(2));

        // we explicitly don't test what happens when the difference is around
        // u16::MAX / 2, because we guarantee no behaviour there
    }

    #[test]
    fn get_inc_wraps() {
        let mut seq = Seq(u16::MAX);
        assert_eq!(Seq(u16::MAX), seq.get_inc());
        assert_eq!(Seq(0), seq.get_inc());
        assert_eq!(Seq(1), seq);
    }

    #[test]
    fn wire_round_trip_near_reference() {
        for reference in [0u16, 1, 2047, 2048, 4095, 4096, 30000, 65535] {
            let reference = Seq(reference);
            for offset in -2048i32..2048 {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let seq = Seq(reference.0.wrapping_add(offset as u16));
                assert_eq!(seq, Seq::from_wire(seq.to_wire(), reference));
            }
        }
    }

    #[test]
    fn wire_window_edges() {
        let reference = Seq(10_000);
        // exactly reference - 2048 is inside the window..
        let low = reference - Seq(2048);
        assert_eq!(low, Seq::from_wire(low.to_wire(), reference));
        // ..while reference + 2048 shares its wire value and wins instead
        let high = reference + Seq(2048);
        assert_eq!(low.to_wire(), high.to_wire());
        assert_eq!(low, Seq::from_wire(high.to_wire(), reference));
    }
}
