//! Radio link facade: transport selection, polling and queued commands

use std::fmt;
use std::ops::ControlFlow;
use std::sync::Arc;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use crate::config::LinkConfig;
use crate::exchange::ExchangeEngine;
use crate::fault::FaultInjector;
use crate::framing::{Command, FrameError, MAX_PAYLOAD_LEN};
use crate::poller::Poller;
use crate::queue::{CommandOutcome, CommandQueue, CommandSender, QueueCounters};
use crate::serial::SerialTransport;
use crate::simulated::SyntheticTransport;
use crate::stats::{LinkStats, StatsCollector};
use crate::status::TargetStatus;
use crate::transport::LinkTransport;
use crate::RadioError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkMode {
    Hardware,
    Synthetic,
    /// Hardware was wanted but not found; running on the synthetic link.
    Degraded,
}

impl fmt::Display for LinkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkMode::Hardware => write!(f, "hardware"),
            LinkMode::Synthetic => write!(f, "synthetic"),
            LinkMode::Degraded => write!(f, "degraded (synthetic)"),
        }
    }
}

/// Entry point for callers: owns the engine, the command queue and the poller
/// for one radio link.
pub struct RadioLink {
    config: LinkConfig,
    mode: LinkMode,
    engine: Arc<ExchangeEngine>,
    queue: Arc<Mutex<CommandQueue>>,
    stats: Arc<Mutex<StatsCollector>>,
    poller: Poller,
}

impl RadioLink {
    /// Picks the transport the config asks for. Without a working radio the
    /// link degrades to the synthetic transport unless hardware is required.
    pub async fn connect(config: LinkConfig) -> Result<Self, RadioError> {
        Self::check(&config)?;

        let (transport, mode): (Box<dyn LinkTransport>, LinkMode) = if config.simulate {
            info!(target: "link", "using synthetic link");
            (
                Box::new(SyntheticTransport::new(config.synthetic.clone())),
                LinkMode::Synthetic,
            )
        } else {
            match Self::open_hardware(&config).await {
                Some(transport) => (transport, LinkMode::Hardware),
                None if config.hardware_required => {
                    error!(target: "link", "radio hardware required but not detected");
                    return Err(RadioError::HardwareRequired);
                }
                None => {
                    error!(target: "link", "radio hardware not detected, falling back to synthetic link");
                    (
                        Box::new(SyntheticTransport::new(config.synthetic.clone())),
                        LinkMode::Degraded,
                    )
                }
            }
        };

        Ok(Self::assemble(config, transport, mode))
    }

    /// Builds a link over a caller-supplied transport.
    pub fn with_transport(config: LinkConfig, transport: Box<dyn LinkTransport>) -> Result<Self, RadioError> {
        Self::check(&config)?;
        let mode = if config.simulate {
            LinkMode::Synthetic
        } else {
            LinkMode::Hardware
        };
        Ok(Self::assemble(config, transport, mode))
    }

    /// Outcomes of executed queued commands are delivered on the returned
    /// receiver.
    pub fn with_outcomes(mut self) -> (Self, mpsc::UnboundedReceiver<CommandOutcome>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.poller = self.poller.with_outcomes(tx);
        (self, rx)
    }

    fn check(config: &LinkConfig) -> Result<(), RadioError> {
        if config.allowed_addresses.is_empty() {
            return Err(RadioError::NoTargets);
        }
        config.validate()?;
        Ok(())
    }

    async fn open_hardware(config: &LinkConfig) -> Option<Box<dyn LinkTransport>> {
        let Some(serial) = &config.serial else {
            warn!(target: "link", "no serial port configured");
            return None;
        };

        let mut transport = match SerialTransport::open(serial) {
            Ok(transport) => transport,
            Err(e) => {
                warn!(target: "link", "{}", e);
                return None;
            }
        };

        if transport.check_presence().await {
            Some(Box::new(transport))
        } else {
            warn!(target: "link", "no radio module answering on {}", transport.port_name());
            None
        }
    }

    fn assemble(config: LinkConfig, transport: Box<dyn LinkTransport>, mode: LinkMode) -> Self {
        let transport: Box<dyn LinkTransport> = match &config.faults {
            Some(faults) => {
                warn!(
                    target: "link",
                    "fault injection on: drop {:.2}, corrupt {:.2}",
                    faults.drop_probability, faults.corrupt_probability
                );
                Box::new(FaultInjector::new(transport, faults))
            }
            None => transport,
        };

        let stats = Arc::new(Mutex::new(StatsCollector::new()));
        let engine = Arc::new(ExchangeEngine::new(
            transport,
            config.retry.clone(),
            config.allow_list(),
            stats.clone(),
        ));
        let queue = Arc::new(Mutex::new(CommandQueue::new(config.queue_capacity)));
        let poller = Poller::new(
            engine.clone(),
            queue.clone(),
            config.allowed_addresses.clone(),
            config.poll_period(),
        );

        info!(
            target: "link",
            "link up ({}): units {:?}, period {:?}",
            mode,
            config.allowed_addresses,
            config.poll_period()
        );

        Self {
            config,
            mode,
            engine,
            queue,
            stats,
            poller,
        }
    }

    pub fn mode(&self) -> LinkMode {
        self.mode
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// One status per configured unit, in configured order.
    pub async fn poll_once(&self) -> Vec<TargetStatus> {
        self.poller.poll_once().await
    }

    /// Queues a command for the gaps between status polls. Returns `Ok(false)`
    /// when the queue is full and the command did not outrank anything queued.
    pub async fn enqueue_command(
        &self,
        command: Command,
        address: u8,
        priority: u8,
        payload: Vec<u8>,
    ) -> Result<bool, RadioError> {
        if !self.engine.is_allowed(address) {
            return Err(RadioError::AddressNotAllowed(address));
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge(payload.len()).into());
        }
        self.queue.lock().await.enqueue(command, address, priority, payload)
    }

    /// Producer handle for tasks outside the polling path. Commands queued
    /// through it are checked against the allow-list when they execute.
    pub fn command_sender(&self) -> CommandSender {
        CommandSender::new(self.queue.clone())
    }

    pub async fn pending_commands(&self) -> usize {
        self.queue.lock().await.len()
    }

    pub async fn queue_counters(&self) -> QueueCounters {
        self.queue.lock().await.counters()
    }

    /// Status of a single unit right now, outside the poll cycle.
    pub async fn request_status(&self, address: u8) -> Result<TargetStatus, RadioError> {
        let reply = self
            .engine
            .exchange_with_retry(Command::GetStatus, address, &[])
            .await?;
        Ok(match reply {
            Some(frame) => TargetStatus::from_reply(address, &frame),
            None => TargetStatus::unknown(address),
        })
    }

    pub async fn ping(&self, address: u8) -> Result<bool, RadioError> {
        let reply = self.engine.exchange_with_retry(Command::Ping, address, &[]).await?;
        Ok(reply.is_some())
    }

    /// Probes the radio module itself.
    pub async fn check_presence(&self) -> bool {
        self.engine.check_presence().await
    }

    pub async fn get_stats(&self) -> LinkStats {
        self.stats.lock().await.snapshot()
    }

    pub async fn reset_stats(&self) {
        self.stats.lock().await.reset();
        info!(target: "link", "statistics reset");
    }

    /// Periodic poll loop; see [`Poller::run`].
    pub async fn run<F>(&self, on_snapshot: F)
    where
        F: FnMut(&[TargetStatus], &LinkStats) -> ControlFlow<()> + Send,
    {
        self.poller.run(on_snapshot).await
    }
}
