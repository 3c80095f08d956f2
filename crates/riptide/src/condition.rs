//! Transport conditioner which randomly drops and delays inbound datagrams.
//!
//! **This is for testing purposes only!** A useful strategy for testing
//! networking code is to induce artificial packet loss and delay and watch
//! how the layers above cope; wrapping both ends of a link in a
//! [`ConditionedTransport`] simulates loss on both legs.
//!
//! Conditioning applies to the smallest unit the transport contract exposes,
//! the individual inbound datagram; outgoing datagrams pass through
//! untouched. Whether a datagram is dropped is random, driven by an owned,
//! seedable RNG so that statistical scenarios replay exactly.

use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Normal};
use web_time::{Duration, Instant};

use crate::transport::{Transport, TransportEvent};

/// Configuration for a [`ConditionedTransport`].
///
/// Delay randomness follows a normal distribution with mean `delay_mean`
/// and standard deviation `delay_std_dev`, in seconds; samples at or below
/// zero deliver immediately.
#[derive(Debug, Clone, Default)]
pub struct ConditionerConfig {
    /// Chance of an inbound datagram being dropped, in `0.0..=1.0`.
    ///
    /// Values outside the range are clamped.
    pub loss_rate: f32,
    /// Mean delay applied to inbound datagrams, in seconds.
    pub delay_mean: f32,
    /// Standard deviation of the delay, in seconds. Must be finite.
    pub delay_std_dev: f32,
}

/// Wraps a [`Transport`], conditioning its inbound datagrams with loss and
/// delay.
///
/// See the [module-level documentation](self).
pub struct ConditionedTransport<T: Transport> {
    inner: T,
    loss_rate: f32,
    delay_distr: Normal<f32>,
    rng: StdRng,
    delayed: Vec<Delayed<T::Endpoint, T::Error>>,
}

#[derive(Debug)]
struct Delayed<E, Err> {
    event: TransportEvent<E, Err>,
    deliver_at: Instant,
}

impl<T: Transport> ConditionedTransport<T> {
    /// Wraps `inner`, seeding the conditioner's RNG for reproducible runs.
    ///
    /// # Panics
    ///
    /// Panics if `config.delay_std_dev` is not finite.
    pub fn new(inner: T, config: &ConditionerConfig, seed: u64) -> Self {
        let delay_distr = Normal::new(config.delay_mean, config.delay_std_dev)
            .expect("should be a valid normal distribution");
        Self {
            inner,
            loss_rate: config.loss_rate.clamp(0.0, 1.0),
            delay_distr,
            rng: StdRng::seed_from_u64(seed),
            delayed: Vec::new(),
        }
    }

    /// Gets a reference to the wrapped transport.
    pub const fn inner(&self) -> &T {
        &self.inner
    }

    /// Swaps in new loss and delay parameters, keeping the RNG state.
    ///
    /// # Panics
    ///
    /// Panics if `config.delay_std_dev` is not finite.
    pub fn set_config(&mut self, config: &ConditionerConfig) {
        self.loss_rate = config.loss_rate.clamp(0.0, 1.0);
        self.delay_distr = Normal::new(config.delay_mean, config.delay_std_dev)
            .expect("should be a valid normal distribution");
    }

    fn condition(
        &mut self,
        event: TransportEvent<T::Endpoint, T::Error>,
    ) -> Option<TransportEvent<T::Endpoint, T::Error>> {
        // never drop or delay error events, only datagrams
        if matches!(event, TransportEvent::Error { .. }) {
            return Some(event);
        }
        if self.rng.r#gen::<f32>() < self.loss_rate {
            return None;
        }
        let delay_sec = self.delay_distr.sample(&mut self.rng);
        if delay_sec <= 0.0 {
            return Some(event);
        }
        self.delayed.push(Delayed {
            event,
            deliver_at: Instant::now() + Duration::from_secs_f32(delay_sec),
        });
        None
    }

    fn pop_ready(&mut self) -> Option<TransportEvent<T::Endpoint, T::Error>> {
        let now = Instant::now();
        let ready = self
            .delayed
            .iter()
            .position(|delayed| now >= delayed.deliver_at)?;
        Some(self.delayed.swap_remove(ready).event)
    }
}

impl<T: Transport> Transport for ConditionedTransport<T> {
    type Endpoint = T::Endpoint;
    type Error = T::Error;

    fn send(&mut self, datagram: &[u8], to: Self::Endpoint) -> Result<(), Self::Error> {
        self.inner.send(datagram, to)
    }

    fn poll(&mut self) -> Option<TransportEvent<Self::Endpoint, Self::Error>> {
        if let Some(event) = self.pop_ready() {
            return Some(event);
        }
        while let Some(event) = self.inner.poll() {
            if let Some(event) = self.condition(event) {
                return Some(event);
            }
        }
        None
    }

    fn close(&mut self, endpoint: Self::Endpoint) {
        self.inner.close(endpoint);
    }

    fn shutdown(&mut self) {
        self.inner.shutdown();
    }
}
