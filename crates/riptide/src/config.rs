//! See [`PeerConfig`].

use web_time::Duration;

use riptide_proto::msg;

/// Tuning knobs shared by [`Server`](crate::Server) and
/// [`Client`](crate::Client).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Capacity of a single message, and therefore the upper bound on one
    /// datagram's payload plus header.
    ///
    /// Both sides of a connection must agree on this value. The default,
    /// [`msg::MAX_SIZE`], keeps datagrams under the IPv6 minimum MTU.
    pub max_message_size: usize,
    /// How often a connected client sends a heartbeat, which doubles as the
    /// RTT probe.
    pub heartbeat_interval: Duration,
    /// How long a connection may go without receiving anything before it is
    /// torn down as [`DisconnectReason::TimedOut`](crate::DisconnectReason::TimedOut).
    pub timeout: Duration,
    /// Total wire sends granted to one reliable message, the first included.
    /// A message unacknowledged after all of them is silently dropped.
    pub max_send_attempts: u8,
    /// How many `connect` datagrams a client sends before giving up with
    /// [`ClientEvent::ConnectFailed`](crate::ClientEvent::ConnectFailed).
    pub max_connect_attempts: u8,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            max_message_size: msg::MAX_SIZE,
            heartbeat_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(5),
            max_send_attempts: 15,
            max_connect_attempts: 5,
        }
    }
}
