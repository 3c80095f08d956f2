//! Datagram header codec.
//!
//! Every datagram starts with a 4-bit [`HeaderTag`]. Tags which carry a
//! sequence number ([`HeaderTag::carries_seq`]) follow it with the 12 low
//! bits of the sequence ([`crate::seq::WIRE_BITS`]); the receiver
//! reconstructs the full 16 bits via [`Seq::from_wire`]. The payload is
//! bit-packed immediately after, so a sequenced datagram reserves 16 bits of
//! prefix and an unsequenced one reserves 4.
//!
//! ```text
//! [tttt][ssss][ssssssss][payload bits...]
//!  tag   seq low bits    (sequenced tags only)
//! ```

use arbitrary::Arbitrary;

use crate::seq::Seq;

/// Kind of datagram, occupying the first 4 bits of the wire.
///
/// The discriminants are stable wire values; changing them breaks protocol
/// compatibility. Values 10 through 15 are reserved, and datagrams carrying
/// them are dropped on receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Arbitrary)]
#[repr(u8)]
pub enum HeaderTag {
    /// User payload, fire-and-forget.
    Unreliable = 0,
    /// Acknowledges the newest received sequence plus the window bitfield.
    Ack = 1,
    /// Acknowledges a specific (non-newest) sequence plus the window
    /// bitfield.
    AckExtra = 2,
    /// Client requests a connection.
    Connect = 3,
    /// Keepalive and RTT probe.
    Heartbeat = 4,
    /// Graceful teardown notice.
    Disconnect = 5,
    /// User payload, tracked by the reliability layer.
    Reliable = 6,
    /// Handshake reply carrying the assigned client id, and its echo.
    Welcome = 7,
    /// Server notification that another client finished connecting.
    ClientConnected = 8,
    /// Server notification that another client disconnected.
    ClientDisconnected = 9,
}

/// Number of bits a [`HeaderTag`] occupies on the wire.
pub const TAG_BITS: u32 = 4;

/// Failed to decode a datagram header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeaderError {
    /// Datagram is shorter than its header.
    #[error("datagram too short for header")]
    TooShort,
    /// The 4-bit tag value is reserved.
    #[error("reserved header tag `{0}`")]
    ReservedTag(u8),
}

impl HeaderTag {
    /// Converts a raw 4-bit wire value into a tag.
    ///
    /// # Errors
    ///
    /// Errors if the value is reserved.
    pub const fn from_raw(value: u8) -> Result<Self, HeaderError> {
        match value {
            0 => Ok(Self::Unreliable),
            1 => Ok(Self::Ack),
            2 => Ok(Self::AckExtra),
            3 => Ok(Self::Connect),
            4 => Ok(Self::Heartbeat),
            5 => Ok(Self::Disconnect),
            6 => Ok(Self::Reliable),
            7 => Ok(Self::Welcome),
            8 => Ok(Self::ClientConnected),
            9 => Ok(Self::ClientDisconnected),
            _ => Err(HeaderError::ReservedTag(value)),
        }
    }

    /// Gets whether datagrams with this tag carry a 12-bit sequence field
    /// after the tag.
    #[must_use]
    pub const fn carries_seq(self) -> bool {
        matches!(
            self,
            Self::Ack
                | Self::AckExtra
                | Self::Reliable
                | Self::Welcome
                | Self::ClientConnected
                | Self::ClientDisconnected
        )
    }

    /// Gets whether datagrams with this tag are tracked by the reliability
    /// layer - assigned a fresh sequence on send, retransmitted until acked,
    /// and deduplicated on receive.
    ///
    /// [`Ack`](Self::Ack) and [`AckExtra`](Self::AckExtra) carry a sequence
    /// field but are not themselves tracked.
    #[must_use]
    pub const fn is_tracked(self) -> bool {
        matches!(
            self,
            Self::Reliable | Self::Welcome | Self::ClientConnected | Self::ClientDisconnected
        )
    }

    /// Number of prefix bits this tag reserves at the front of a datagram,
    /// before the payload.
    #[must_use]
    pub const fn prefix_bits(self) -> usize {
        if self.carries_seq() {
            (TAG_BITS + crate::seq::WIRE_BITS) as usize
        } else {
            TAG_BITS as usize
        }
    }
}

/// Decoded prefix of a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Datagram kind.
    pub tag: HeaderTag,
    /// Raw 12-bit sequence field, present iff [`HeaderTag::carries_seq`].
    ///
    /// This is the wire value; reconstruct the full sequence with
    /// [`Seq::from_wire`] against the appropriate reference.
    pub wire_seq: Option<u16>,
}

impl Header {
    /// Decodes the prefix of a datagram.
    ///
    /// # Errors
    ///
    /// Errors if the datagram is too short or its tag is reserved.
    pub fn decode(datagram: &[u8]) -> Result<Self, HeaderError> {
        let first = *datagram.first().ok_or(HeaderError::TooShort)?;
        let tag = HeaderTag::from_raw(first & 0x0F)?;
        let wire_seq = if tag.carries_seq() {
            let second = *datagram.get(1).ok_or(HeaderError::TooShort)?;
            Some(u16::from(first >> 4) | (u16::from(second) << 4))
        } else {
            None
        };
        Ok(Self { tag, wire_seq })
    }

    /// Writes a sequence number into the 12-bit field of an already encoded
    /// datagram.
    ///
    /// The datagram must start with a tag for which
    /// [`HeaderTag::carries_seq`] holds, with its sequence bits still
    /// reserved.
    pub fn patch_seq(datagram: &mut [u8], seq: Seq) {
        debug_assert!(datagram.len() >= 2);
        let wire = seq.to_wire();
        #[allow(clippy::cast_possible_truncation)]
        {
            datagram[0] = (datagram[0] & 0x0F) | (((wire & 0x0F) as u8) << 4);
            datagram[1] = (wire >> 4) as u8;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trip() {
        for raw in 0u8..10 {
            let tag = HeaderTag::from_raw(raw).unwrap();
            assert_eq!(raw, tag as u8);
        }
        for raw in 10u8..16 {
            assert_eq!(Err(HeaderError::ReservedTag(raw)), HeaderTag::from_raw(raw));
        }
    }

    #[test]
    fn decode_unsequenced() {
        let datagram = [HeaderTag::Connect as u8];
        let header = Header::decode(&datagram).unwrap();
        assert_eq!(HeaderTag::Connect, header.tag);
        assert_eq!(None, header.wire_seq);
    }

    #[test]
    fn patch_and_decode_sequenced() {
        let mut datagram = [HeaderTag::Reliable as u8, 0, 0xAB];
        Header::patch_seq(&mut datagram, Seq(0x0FED));
        let header = Header::decode(&datagram).unwrap();
        assert_eq!(HeaderTag::Reliable, header.tag);
        assert_eq!(Some(0x0FED), header.wire_seq);
        // payload bits after the prefix are untouched
        assert_eq!(0xAB, datagram[2]);
    }

    #[test]
    fn patch_masks_to_wire_bits() {
        let mut datagram = [HeaderTag::Ack as u8, 0];
        Header::patch_seq(&mut datagram, Seq(0xFFFF));
        let header = Header::decode(&datagram).unwrap();
        assert_eq!(Some(0x0FFF), header.wire_seq);
    }

    #[test]
    fn too_short() {
        assert_eq!(Err(HeaderError::TooShort), Header::decode(&[]));
        assert_eq!(
            Err(HeaderError::TooShort),
            Header::decode(&[HeaderTag::Reliable as u8])
        );
    }
}
