//! Loss and corruption injection around any transport

use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::FaultConfig;
use crate::transport::LinkTransport;
use crate::RadioError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultCounters {
    pub dropped: u64,
    pub corrupted: u64,
}

/// Wraps a transport; outgoing frames are silently dropped or get one byte
/// mangled with the configured probabilities.
pub struct FaultInjector<T> {
    inner: T,
    drop_probability: f64,
    corrupt_probability: f64,
    rng: StdRng,
    counters: FaultCounters,
}

impl<T: LinkTransport> FaultInjector<T> {
    pub fn new(inner: T, config: &FaultConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            inner,
            drop_probability: config.drop_probability.clamp(0.0, 1.0),
            corrupt_probability: config.corrupt_probability.clamp(0.0, 1.0),
            rng,
            counters: FaultCounters::default(),
        }
    }

    pub fn counters(&self) -> FaultCounters {
        self.counters
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

#[async_trait]
impl<T: LinkTransport> LinkTransport for FaultInjector<T> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), RadioError> {
        if self.rng.random_bool(self.drop_probability) {
            self.counters.dropped += 1;
            debug!(target: "link", "fault: dropped {}-byte frame", bytes.len());
            return Ok(());
        }

        if !bytes.is_empty() && self.rng.random_bool(self.corrupt_probability) {
            let mut mangled = bytes.to_vec();
            let idx = self.rng.random_range(0..mangled.len());
            let mask: u8 = self.rng.random_range(1..=u8::MAX);
            mangled[idx] ^= mask;
            self.counters.corrupted += 1;
            debug!(target: "link", "fault: byte {} xor 0x{:02X}", idx, mask);
            return self.inner.send(&mangled).await;
        }

        self.inner.send(bytes).await
    }

    async fn receive(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        self.inner.receive(timeout).await
    }

    fn signal_strength(&self) -> Option<i16> {
        self.inner.signal_strength()
    }
}
