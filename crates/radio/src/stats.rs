//! Link-quality accounting

use std::fmt;

use serde::{Deserialize, Serialize};

const SIGNAL_WEIGHT: f64 = 0.1;

/// Snapshot of the link counters handed to readers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkStats {
    pub tx_count: u64,
    pub rx_count: u64,
    pub tx_errors: u64,
    pub rx_errors: u64,
    pub timeouts: u64,
    /// Exponential moving average of the reply signal strength, dBm.
    pub avg_signal: f64,
}

impl LinkStats {
    /// `100 * (1 - errors / (tx + rx))`, or 100 before any traffic.
    pub fn success_rate(&self) -> f64 {
        let total = self.tx_count + self.rx_count;
        if total == 0 {
            return 100.0;
        }
        let errors = self.tx_errors + self.rx_errors;
        100.0 * (1.0 - errors as f64 / total as f64)
    }

    pub fn errors(&self) -> u64 {
        self.tx_errors + self.rx_errors
    }
}

impl fmt::Display for LinkStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "TX:{} RX:{} Err:{} TO:{} RSSI:{:.1} Rate:{:.1}%",
            self.tx_count,
            self.rx_count,
            self.errors(),
            self.timeouts,
            self.avg_signal,
            self.success_rate()
        )
    }
}

/// Accumulates counters from the exchange engine's attempt loop.
#[derive(Debug, Default)]
pub struct StatsCollector {
    stats: LinkStats,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tx(&mut self, ok: bool) {
        self.stats.tx_count += 1;
        if !ok {
            self.stats.tx_errors += 1;
        }
    }

    /// A reply arrived and decoded. The signal average only moves when the
    /// reply carried a sample.
    pub fn record_rx_ok(&mut self, signal: Option<i16>) {
        self.stats.rx_count += 1;
        if let Some(sample) = signal {
            self.stats.avg_signal =
                self.stats.avg_signal * (1.0 - SIGNAL_WEIGHT) + f64::from(sample) * SIGNAL_WEIGHT;
        }
    }

    /// Bytes arrived but were not a usable reply.
    pub fn record_rx_error(&mut self) {
        self.stats.rx_count += 1;
        self.stats.rx_errors += 1;
    }

    pub fn record_timeout(&mut self) {
        self.stats.timeouts += 1;
    }

    pub fn success_rate(&self) -> f64 {
        self.stats.success_rate()
    }

    pub fn snapshot(&self) -> LinkStats {
        self.stats.clone()
    }

    pub fn reset(&mut self) {
        self.stats = LinkStats::default();
    }
}
