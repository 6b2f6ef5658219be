//! radio exchange engine for DTD sensor units

use thiserror::Error;

pub mod config;
pub mod exchange;
pub mod fault;
pub mod framing;
pub mod link;
pub mod poller;
pub mod queue;
pub mod serial;
pub mod simulated;
pub mod stats;
pub mod status;
pub mod transport;

pub use config::{ConfigError, FaultConfig, LinkConfig, RetryPolicy, SerialConfig, SyntheticConfig};
pub use exchange::ExchangeEngine;
pub use fault::FaultInjector;
pub use framing::{Command, Frame, FrameAssembler, FrameCodec, FrameError};
pub use link::{LinkMode, RadioLink};
pub use poller::Poller;
pub use queue::{CommandOutcome, CommandQueue, CommandSender, QueueCounters, QueuedCommand};
pub use serial::SerialTransport;
pub use simulated::SyntheticTransport;
pub use stats::{LinkStats, StatsCollector};
pub use status::{StatusFlags, TargetState, TargetStatus};
pub use transport::LinkTransport;

#[derive(Debug, Error)]
pub enum RadioError {
    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Address {0} is not in the allow-list")]
    AddressNotAllowed(u8),

    #[error("Radio transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Priority {0} outside 0..=9")]
    InvalidPriority(u8),

    #[error("No target addresses configured")]
    NoTargets,

    #[error("Radio hardware required but not detected")]
    HardwareRequired,
}
