//! Simulation scenarios for exercising the radio link end to end

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use colored::Colorize;
use dtd_radio::{
    Command, FrameCodec, LinkConfig, LinkStats, LinkTransport, RadioError, RadioLink, SyntheticTransport,
};
use log::debug;
use serde::Serialize;
use tokio::time::Instant;

/// Upper bound on drain cycles in the queue scenario.
const MAX_DRAIN_CYCLES: usize = 50;

#[derive(Debug, Clone, Serialize)]
pub struct PollReport {
    pub cycles: usize,
    /// `(address, cycles the unit answered)`, in poll order.
    pub answered: Vec<(u8, usize)>,
    pub stats: LinkStats,
    pub elapsed_ms: u64,
}

impl PollReport {
    pub fn answered_by(&self, address: u8) -> Option<usize> {
        self.answered.iter().find(|(a, _)| *a == address).map(|(_, n)| *n)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueReport {
    pub offered: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub evicted: u64,
    pub executed: usize,
    pub answered: usize,
    /// Executed commands came out best priority first.
    pub in_priority_order: bool,
    pub drain_cycles: usize,
}

/// Transport wrapper that never lets requests reach one address.
pub struct SilentUnit<T> {
    inner: T,
    address: u8,
    codec: FrameCodec,
    swallowed: u64,
}

impl<T: LinkTransport> SilentUnit<T> {
    pub fn new(inner: T, address: u8) -> Self {
        Self {
            inner,
            address,
            codec: FrameCodec,
            swallowed: 0,
        }
    }

    pub fn swallowed(&self) -> u64 {
        self.swallowed
    }
}

#[async_trait]
impl<T: LinkTransport> LinkTransport for SilentUnit<T> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), RadioError> {
        let to_silent = self
            .codec
            .decode(bytes)
            .map(|frame| frame.address == self.address)
            .unwrap_or(false);
        if to_silent {
            self.swallowed += 1;
            return Ok(());
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

async fn run_cycles(link: &RadioLink, cycles: usize) -> Result<PollReport> {
    let addresses = link.config().allowed_addresses.clone();
    let mut answered: Vec<(u8, usize)> = addresses.iter().map(|&a| (a, 0)).collect();
    let start = Instant::now();

    for cycle in 1..=cycles {
        let snapshot = link.poll_once().await;
        let polled: Vec<u8> = snapshot.iter().map(|s| s.address).collect();
        if polled != addresses {
            bail!("cycle {}: snapshot covers {:?}, expected {:?}", cycle, polled, addresses);
        }

        for (status, slot) in snapshot.iter().zip(answered.iter_mut()) {
            if status.is_known() {
                slot.1 += 1;
            }
        }
        debug!(target: "sim", "cycle {} done at {:?}", cycle, start.elapsed());
    }

    Ok(PollReport {
        cycles,
        answered,
        stats: link.get_stats().await,
        elapsed_ms: start.elapsed().as_millis() as u64,
    })
}

fn print_poll_report(report: &PollReport) {
    for (address, n) in &report.answered {
        let line = format!("  unit {:>2}: answered {}/{}", address, n, report.cycles);
        if *n == report.cycles {
            println!("{}", line.green());
        } else if *n == 0 {
            println!("{}", line.red());
        } else {
            println!("{}", line.yellow());
        }
    }
    println!("  {} in {} ms", report.stats, report.elapsed_ms);
}

/// Polls every configured unit `cycles` times and checks each snapshot is
/// complete and in configured order.
pub async fn poll_cycle_test(config: LinkConfig, cycles: usize) -> Result<PollReport> {
    println!("\n=== Poll Cycle Test ===");
    println!("units {:?}, {} cycles", config.allowed_addresses, cycles);

    let link = RadioLink::connect(config).await?;
    println!("link mode: {}", link.mode());

    let report = run_cycles(&link, cycles).await?;
    print_poll_report(&report);
    Ok(report)
}

/// Silences one unit completely and checks the others keep answering.
pub async fn fault_isolation_test(config: LinkConfig, silent: u8, cycles: usize) -> Result<PollReport> {
    println!("\n=== Fault Isolation Test ===");
    println!("unit {} silenced, {} cycles", silent, cycles);

    let transport = SilentUnit::new(SyntheticTransport::new(config.synthetic.clone()), silent);
    let link = RadioLink::with_transport(config, Box::new(transport))?;

    let report = run_cycles(&link, cycles).await?;
    print_poll_report(&report);

    if report.answered_by(silent).unwrap_or(0) > 0 {
        bail!("silenced unit {} answered", silent);
    }
    let others: usize = report
        .answered
        .iter()
        .filter(|(a, _)| *a != silent)
        .map(|(_, n)| n)
        .sum();
    println!(
        "  other units answered {} times while unit {} was down",
        others, silent
    );
    Ok(report)
}

/// Offers three times the queue capacity, then polls until the queue has
/// drained through the gaps between status requests.
pub async fn queue_pressure_test(config: LinkConfig) -> Result<QueueReport> {
    println!("\n=== Queue Pressure Test ===");

    let addresses = config.allowed_addresses.clone();
    let offered = config.queue_capacity * 3;
    let (link, mut outcomes) = RadioLink::connect(config).await?.with_outcomes();

    let mut accepted = 0;
    let mut rejected = 0;
    for i in 0..offered {
        let address = addresses[i % addresses.len()];
        let priority = (i % 10) as u8;
        let (command, payload) = if i % 2 == 0 {
            (Command::Ping, vec![])
        } else {
            (Command::SetMode, vec![(i % 3) as u8])
        };
        if link.enqueue_command(command, address, priority, payload).await? {
            accepted += 1;
        } else {
            rejected += 1;
        }
    }
    let evicted = link.queue_counters().await.evicted;
    println!(
        "offered {}, accepted {}, rejected {}, evicted {}",
        offered, accepted, rejected, evicted
    );

    let mut drain_cycles = 0;
    while link.pending_commands().await > 0 {
        if drain_cycles == MAX_DRAIN_CYCLES {
            bail!("queue still holds {} commands", link.pending_commands().await);
        }
        link.poll_once().await;
        drain_cycles += 1;
    }

    let mut executed = 0;
    let mut answered = 0;
    let mut last_priority = 0;
    let mut in_priority_order = true;
    while let Ok(outcome) = outcomes.try_recv() {
        executed += 1;
        if matches!(outcome.reply, Ok(Some(_))) {
            answered += 1;
        }
        in_priority_order &= outcome.command.priority >= last_priority;
        last_priority = outcome.command.priority;
    }

    if executed as u64 != accepted as u64 - evicted {
        bail!(
            "executed {} commands, expected {}",
            executed,
            accepted as u64 - evicted
        );
    }

    let report = QueueReport {
        offered,
        accepted,
        rejected,
        evicted,
        executed,
        answered,
        in_priority_order,
        drain_cycles,
    };
    let summary = format!(
        "  executed {} ({} answered) over {} cycles, priority order {}",
        executed,
        answered,
        drain_cycles,
        if in_priority_order { "kept" } else { "broken" }
    );
    if in_priority_order {
        println!("{}", summary.green());
    } else {
        println!("{}", summary.red());
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SimulationPresets;

    #[tokio::test(start_paused = true)]
    async fn test_poll_cycles_under_good_conditions() {
        let report = poll_cycle_test(SimulationPresets::good_conditions(), 3).await.unwrap();
        assert_eq!(report.answered.len(), 5);
        assert!(report.answered.iter().all(|(_, n)| *n == 3));
        assert_eq!(report.stats.timeouts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silenced_unit_is_isolated() {
        let report = fault_isolation_test(SimulationPresets::good_conditions(), 3, 2)
            .await
            .unwrap();
        assert_eq!(report.answered_by(3), Some(0));
        for address in [1, 2, 4, 5] {
            assert_eq!(report.answered_by(address), Some(2));
        }
        // three timed-out attempts per cycle for the silent unit
        assert_eq!(report.stats.timeouts, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_drains_in_priority_order() {
        let report = queue_pressure_test(SimulationPresets::good_conditions()).await.unwrap();
        assert_eq!(report.offered, 30);
        assert_eq!(report.accepted + report.rejected, 30);
        assert_eq!(report.executed as u64, report.accepted as u64 - report.evicted);
        assert_eq!(report.executed, 10);
        assert_eq!(report.answered, 10);
        assert!(report.in_priority_order);
        // four gaps per five-unit cycle
        assert_eq!(report.drain_cycles, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_unit_counts_swallowed_requests() {
        let inner = SyntheticTransport::new(SimulationPresets::good_conditions().synthetic);
        let mut link = SilentUnit::new(inner, 2);
        let codec = FrameCodec;

        link.send(&codec.encode(Command::Ping.code(), 2, &[]).unwrap()).await.unwrap();
        assert!(link.receive(Duration::from_millis(500)).await.is_none());

        link.send(&codec.encode(Command::Ping.code(), 1, &[]).unwrap()).await.unwrap();
        assert!(link.receive(Duration::from_millis(500)).await.is_some());
        assert_eq!(link.swallowed(), 1);
    }
}
