//! Synthetic radio link standing in for the remote units

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use tokio::time::{sleep, sleep_until, Instant};

use crate::config::SyntheticConfig;
use crate::framing::{Command, FrameCodec};
use crate::status::{encode_status_payload, StatusFlags, TargetState};
use crate::transport::LinkTransport;
use crate::RadioError;

const MIN_LATENCY: Duration = Duration::from_millis(5);

/// Counters describing what the synthetic units did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyntheticStats {
    pub replies_delivered: u64,
    pub replies_late: u64,
    pub requests_ignored: u64,
}

#[derive(Debug, Clone, Copy)]
struct SimulatedUnit {
    state: TargetState,
    battery: u8,
}

struct PendingReply {
    deliver_at: Instant,
    bytes: Vec<u8>,
    signal: i16,
}

/// Answers every well-formed request with a plausible reply after a randomized
/// delay. A reply that would land after the receive timeout is lost.
pub struct SyntheticTransport {
    config: SyntheticConfig,
    codec: FrameCodec,
    rng: StdRng,
    latency: Option<Normal<f64>>,
    units: HashMap<u8, SimulatedUnit>,
    pending: Option<PendingReply>,
    last_signal: Option<i16>,
    stats: SyntheticStats,
}

impl SyntheticTransport {
    pub fn new(config: SyntheticConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let latency = Normal::new(config.latency_ms as f64, config.jitter_ms as f64).ok();

        Self {
            config,
            codec: FrameCodec,
            rng,
            latency,
            units: HashMap::new(),
            pending: None,
            last_signal: None,
            stats: SyntheticStats::default(),
        }
    }

    pub fn stats(&self) -> SyntheticStats {
        self.stats
    }

    /// Current simulated state of a unit, if it has been addressed yet.
    pub fn unit_state(&self, address: u8) -> Option<TargetState> {
        self.units.get(&address).map(|u| u.state)
    }

    fn sample_latency(&mut self) -> Duration {
        let ms = match &self.latency {
            Some(normal) => normal.sample(&mut self.rng),
            None => self.config.latency_ms as f64,
        };
        Duration::from_millis(ms.max(0.0) as u64).max(MIN_LATENCY)
    }

    fn status_payload(&mut self, address: u8) -> [u8; 4] {
        let flip_one_in = self.config.state_flip_one_in.max(1);
        let rng = &mut self.rng;
        let unit = self.units.entry(address).or_insert_with(|| SimulatedUnit {
            state: if rng.random_bool(0.5) {
                TargetState::Present
            } else {
                TargetState::Absent
            },
            battery: rng.random_range(60..=100),
        });

        if rng.random_ratio(1, flip_one_in) {
            unit.state = match unit.state {
                TargetState::Present => TargetState::Absent,
                _ => TargetState::Present,
            };
            debug!(target: "sim", "unit {} now {:?}", address, unit.state);
        }
        if rng.random_bool(0.5) {
            unit.battery = unit.battery.saturating_sub(1).max(5);
        }

        let mut flags = 0;
        if unit.battery < 20 {
            flags |= StatusFlags::LOW_BATTERY;
        }
        let signal: i8 = rng.random_range(-100..=-40);
        encode_status_payload(unit.state, unit.battery, signal, StatusFlags(flags))
    }
}

#[async_trait]
impl LinkTransport for SyntheticTransport {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), RadioError> {
        self.pending = None;

        let request = match self.codec.decode(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(target: "sim", "ignoring undecodable request: {}", e);
                self.stats.requests_ignored += 1;
                return Ok(());
            }
        };

        let (payload, signal) = match request.command() {
            Some(Command::Ping) => (b"OK".to_vec(), self.rng.random_range(-70..=-40)),
            Some(Command::GetStatus) => {
                let payload = self.status_payload(request.address);
                (payload.to_vec(), i16::from(payload[2] as i8))
            }
            Some(Command::SetMode) => (b"ACK".to_vec(), self.rng.random_range(-90..=-40)),
            None => {
                debug!(target: "sim", "ignoring unknown command 0x{:02X}", request.command);
                self.stats.requests_ignored += 1;
                return Ok(());
            }
        };

        let bytes = self.codec.encode(request.command, request.address, &payload)?;
        let delay = self.sample_latency();
        trace!(target: "sim", "reply to {} in {:?}: {:02X?}", request.address, delay, bytes);

        self.pending = Some(PendingReply {
            deliver_at: Instant::now() + delay,
            bytes,
            signal,
        });
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        match self.pending.take() {
            Some(reply) if reply.deliver_at <= deadline => {
                sleep_until(reply.deliver_at).await;
                self.last_signal = Some(reply.signal);
                self.stats.replies_delivered += 1;
                Some(reply.bytes)
            }
            Some(_) => {
                sleep(timeout).await;
                self.stats.replies_late += 1;
                None
            }
            None => {
                sleep(timeout).await;
                None
            }
        }
    }

    fn signal_strength(&self) -> Option<i16> {
        self.last_signal
    }
}
