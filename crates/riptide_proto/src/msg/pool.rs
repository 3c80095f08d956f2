//! See [`MessagePool`].

use crate::header::HeaderTag;

use super::{DatagramTooLarge, MIN_SIZE, Message};

/// Recycles [`Message`] buffers to avoid per-message allocation on the send
/// and receive hot paths.
///
/// Each peer owns one pool, shared by all of its connections; there is
/// deliberately no process-global pool, so multiple independent peers can
/// coexist. The pool is only ever touched from the peer's tick thread.
#[derive(Debug)]
pub struct MessagePool {
    free: Vec<Box<[u8]>>,
    capacity: usize,
}

impl MessagePool {
    /// Creates a pool handing out messages of the given byte capacity.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is less than [`MIN_SIZE`].
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= MIN_SIZE);
        Self {
            free: Vec::new(),
            capacity,
        }
    }

    /// Gets the byte capacity of messages handed out by this pool.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffers currently waiting for reuse.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.free.len()
    }

    /// Acquires a fresh outbound message under the given header tag.
    ///
    /// Reuses a pooled buffer if one is idle, zeroing it and resetting both
    /// cursors past the header prefix.
    pub fn acquire(&mut self, header: HeaderTag) -> Message {
        match self.free.pop() {
            Some(buf) => {
                let mut msg = Message {
                    buf,
                    header,
                    write_bit: 0,
                    read_bit: 0,
                };
                msg.reset(header);
                msg
            }
            None => Message::new(header, self.capacity),
        }
    }

    /// Acquires a message wrapping a received datagram for reading.
    ///
    /// # Errors
    ///
    /// Errors if the datagram is longer than this pool's message capacity;
    /// such datagrams cannot have been produced by a compatible sender and
    /// must be dropped.
    pub fn acquire_from(
        &mut self,
        header: HeaderTag,
        datagram: &[u8],
    ) -> Result<Message, DatagramTooLarge> {
        match self.free.pop() {
            Some(buf) => {
                let mut msg = Message {
                    buf,
                    header,
                    write_bit: 0,
                    read_bit: 0,
                };
                if let Err(err) = msg.reset_from(header, datagram) {
                    self.free.push(msg.into_buf());
                    return Err(err);
                }
                Ok(msg)
            }
            None => Message::from_datagram(header, datagram, self.capacity),
        }
    }

    /// Returns a message's buffer to the pool for reuse.
    pub fn release(&mut self, msg: Message) {
        let buf = msg.into_buf();
        // buffers from a differently sized pool would corrupt cursor math
        if buf.len() == self.capacity {
            self.free.push(buf);
        }
    }
}
