//! Lifecycle events drained from [`Server::tick`](crate::Server::tick) and
//! [`Client::tick`](crate::Client::tick).

use crate::connection::ClientId;

/// Why a connection stopped being usable.
///
/// Emitted exactly once per connection, in a
/// [`ServerEvent::ClientDisconnected`] or [`ClientEvent::Disconnected`]; by
/// the time the event is observed the connection is already in its terminal
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DisconnectReason {
    /// Nothing was received within the configured timeout.
    #[error("timed out")]
    TimedOut,
    /// The remote side sent a graceful `disconnect` notice, or this side
    /// disconnected locally.
    #[error("disconnected")]
    Disconnected,
    /// The transport failed underneath the connection.
    #[error("transport error")]
    TransportError,
}

/// Event raised by a [`Server`](crate::Server).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    /// A client completed the handshake and is now fully connected.
    ClientConnected {
        /// Id assigned to the new client.
        client_id: ClientId,
    },
    /// A connected or still-handshaking client went away.
    ClientDisconnected {
        /// Id of the client, assigned when its `connect` arrived.
        client_id: ClientId,
        /// Why.
        reason: DisconnectReason,
    },
}

/// Event raised by a [`Client`](crate::Client).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// The handshake completed; [`Client::id`](crate::Client::id) is now
    /// assigned.
    Connected,
    /// Every connect attempt went unanswered; the client is back in its
    /// terminal disconnected state.
    ConnectFailed,
    /// The connection to the server is gone.
    Disconnected {
        /// Why.
        reason: DisconnectReason,
    },
    /// The server reported that another client finished connecting.
    PeerConnected {
        /// Id of that client.
        client_id: ClientId,
    },
    /// The server reported that another client disconnected.
    PeerDisconnected {
        /// Id of that client.
        client_id: ClientId,
    },
}
