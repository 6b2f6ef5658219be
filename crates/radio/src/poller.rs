//! Periodic status polling of every configured unit

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex};
use tokio::time::{sleep_until, Instant};

use crate::exchange::ExchangeEngine;
use crate::framing::Command;
use crate::queue::{CommandOutcome, CommandQueue};
use crate::stats::LinkStats;
use crate::status::TargetStatus;

/// Drives the exchange engine over all units once per period, serving queued
/// commands in the gaps.
pub struct Poller {
    engine: Arc<ExchangeEngine>,
    queue: Arc<Mutex<CommandQueue>>,
    outcomes: Option<mpsc::UnboundedSender<CommandOutcome>>,
    addresses: Vec<u8>,
    period: Duration,
    cycles: AtomicU64,
    commands_served: AtomicU64,
}

impl Poller {
    pub fn new(
        engine: Arc<ExchangeEngine>,
        queue: Arc<Mutex<CommandQueue>>,
        addresses: Vec<u8>,
        period: Duration,
    ) -> Self {
        Self {
            engine,
            queue,
            outcomes: None,
            addresses,
            period,
            cycles: AtomicU64::new(0),
            commands_served: AtomicU64::new(0),
        }
    }

    /// Every executed queued command is also reported on this channel.
    pub fn with_outcomes(mut self, tx: mpsc::UnboundedSender<CommandOutcome>) -> Self {
        self.outcomes = Some(tx);
        self
    }

    pub fn addresses(&self) -> &[u8] {
        &self.addresses
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    pub fn commands_served(&self) -> u64 {
        self.commands_served.load(Ordering::Relaxed)
    }

    /// One status per configured address, in configured order. A unit that
    /// does not answer becomes `Unknown`; it never stops the cycle.
    pub async fn poll_once(&self) -> Vec<TargetStatus> {
        let started = Instant::now();
        let mut snapshot = Vec::with_capacity(self.addresses.len());

        for (i, &address) in self.addresses.iter().enumerate() {
            if i > 0 {
                tokio::task::yield_now().await;
                self.serve_one_command().await;
            }

            let status = match self.engine.exchange_with_retry(Command::GetStatus, address, &[]).await {
                Ok(Some(frame)) => TargetStatus::from_reply(address, &frame),
                Ok(None) => TargetStatus::unknown(address),
                Err(e) => {
                    warn!(target: "poller", "unit {} skipped: {}", address, e);
                    TargetStatus::unknown(address)
                }
            };
            snapshot.push(status);
        }

        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let known = snapshot.iter().filter(|s| s.is_known()).count();
        debug!(
            target: "poller",
            "cycle {}: {}/{} units answered in {:?}",
            cycle,
            known,
            snapshot.len(),
            started.elapsed()
        );
        snapshot
    }

    /// Executes the highest-priority queued command, if any. Returns whether
    /// one was served.
    pub async fn serve_one_command(&self) -> bool {
        // the queue lock is released before the exchange starts
        let Some(cmd) = self.queue.lock().await.dequeue() else {
            return false;
        };

        let reply = self
            .engine
            .exchange_with_retry(cmd.command, cmd.address, &cmd.payload)
            .await;
        match &reply {
            Ok(Some(_)) => debug!(target: "poller", "{:?} to unit {} done", cmd.command, cmd.address),
            Ok(None) => warn!(target: "poller", "{:?} to unit {} got no reply", cmd.command, cmd.address),
            Err(e) => warn!(target: "poller", "{:?} to unit {} refused: {}", cmd.command, cmd.address, e),
        }
        self.commands_served.fetch_add(1, Ordering::Relaxed);

        if let Some(tx) = &self.outcomes {
            if tx.send(CommandOutcome { command: cmd, reply }).is_err() {
                debug!(target: "poller", "outcome receiver dropped");
            }
        }
        true
    }

    /// Polls once per period until `on_snapshot` breaks. The time left in a
    /// period is spent draining queued commands, one exchange at a time.
    pub async fn run<F>(&self, mut on_snapshot: F)
    where
        F: FnMut(&[TargetStatus], &LinkStats) -> ControlFlow<()> + Send,
    {
        info!(
            target: "poller",
            "polling {} units every {:?}",
            self.addresses.len(),
            self.period
        );
        let mut next_cycle = Instant::now();

        loop {
            next_cycle += self.period;

            let snapshot = self.poll_once().await;
            let stats = self.engine.stats().lock().await.snapshot();
            if on_snapshot(&snapshot, &stats).is_break() {
                info!(target: "poller", "polling stopped after {} cycles", self.cycles());
                return;
            }

            while Instant::now() < next_cycle {
                if !self.serve_one_command().await {
                    break;
                }
            }

            let now = Instant::now();
            if now > next_cycle {
                warn!(
                    target: "poller",
                    "cycle overran its period by {:?}",
                    now - next_cycle
                );
                next_cycle = now;
            } else {
                sleep_until(next_cycle).await;
            }
        }
    }
}
