//! See [`Transport`].

use core::{fmt::Debug, hash::Hash};

use bytes::Bytes;

/// Capability set the peer layer consumes from a concrete datagram
/// transport.
///
/// A transport moves opaque datagrams between this peer and remote
/// endpoints. It performs no reliability work of its own: loss, duplication
/// and reordering are all handled above it. Binding happens in the concrete
/// transport's constructor, which is also where bind failures surface.
///
/// Implementations may run background I/O threads, but must then deposit
/// received datagrams into an internal queue which [`Transport::poll`]
/// drains; the peer only ever calls into a transport from its tick thread.
pub trait Transport {
    /// Address of a remote peer on this transport.
    type Endpoint: Copy + Eq + Hash + Debug;

    /// Error produced by this transport's socket layer.
    ///
    /// Send errors are logged and swallowed by the peer (the reliability
    /// layer covers the loss); receive errors surface through
    /// [`TransportEvent::Error`] and tear the affected connections down.
    type Error: core::error::Error;

    /// Sends one datagram to an endpoint, without blocking.
    ///
    /// # Errors
    ///
    /// Errors if the datagram could not be handed to the socket layer.
    fn send(&mut self, datagram: &[u8], to: Self::Endpoint) -> Result<(), Self::Error>;

    /// Takes the next queued inbound event, if any.
    fn poll(&mut self) -> Option<TransportEvent<Self::Endpoint, Self::Error>>;

    /// Releases any per-endpoint resources held for `endpoint`.
    fn close(&mut self, endpoint: Self::Endpoint);

    /// Closes the underlying socket, invalidating all endpoints.
    fn shutdown(&mut self);
}

/// Inbound event produced by a [`Transport`].
#[derive(Debug)]
pub enum TransportEvent<E, Err> {
    /// A datagram arrived.
    Recv {
        /// Contents, exactly as long as the wire datagram.
        datagram: Bytes,
        /// Source endpoint.
        from: E,
    },
    /// The socket layer failed while receiving.
    Error {
        /// The endpoint the failure is scoped to, or [`None`] if the whole
        /// socket is dead.
        endpoint: Option<E>,
        /// The underlying failure.
        error: Err,
    },
}
