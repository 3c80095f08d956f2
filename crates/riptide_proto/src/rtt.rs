//! See [`RttEstimator`].

use web_time::Duration;

/// Computes a round-trip time estimation for a connection, and derives the
/// retransmission timeout from it.
///
/// Samples are fed in from two sources: the first acknowledgement of a
/// reliable datagram, and heartbeat echoes. Smoothing follows the classic
/// Jacobson/Karels scheme with gains of 1/8 for the mean and 1/4 for the
/// variance.
#[derive(Debug, Clone)]
pub struct RttEstimator {
    latest: Duration,
    smoothed: Duration,
    var: Duration,
    min: Duration,
}

/// Lower bound of [`RttEstimator::rto`].
///
/// Keeps a connection with a tiny measured RTT (e.g. over an in-memory
/// transport) from retransmitting before the peer has had a realistic chance
/// to ack.
pub const RTO_FLOOR: Duration = Duration::from_millis(50);

/// Default initial RTT assumed before any samples have been provided.
pub const DEFAULT_INITIAL_RTT: Duration = Duration::from_millis(333);

impl RttEstimator {
    /// Creates a new estimator from a given initial RTT.
    #[must_use]
    pub fn new(initial_rtt: Duration) -> Self {
        Self {
            latest: initial_rtt,
            smoothed: initial_rtt,
            var: initial_rtt / 2,
            min: initial_rtt,
        }
    }

    /// Gets the current best RTT estimation.
    #[must_use]
    pub const fn get(&self) -> Duration {
        self.smoothed
    }

    /// Gets the most recent RTT sample.
    #[must_use]
    pub const fn latest(&self) -> Duration {
        self.latest
    }

    /// Gets the smallest RTT sample registered so far.
    #[must_use]
    pub const fn min(&self) -> Duration {
        self.min
    }

    /// Computes how long after (re)sending a reliable datagram its next
    /// retransmission is due: `max(50 ms, smoothed + 4 * var)`.
    #[must_use]
    pub fn rto(&self) -> Duration {
        (self.smoothed + self.var * 4).max(RTO_FLOOR)
    }

    /// Adds an RTT sample to this estimation.
    pub fn update(&mut self, rtt: Duration) {
        self.latest = rtt;
        self.min = self.min.min(rtt);

        let var_sample = if self.smoothed > rtt {
            self.smoothed - rtt
        } else {
            rtt - self.smoothed
        };
        self.var = (3 * self.var + var_sample) / 4;
        self.smoothed = (7 * self.smoothed + rtt) / 8;
    }
}

impl Default for RttEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_RTT)
    }
}
