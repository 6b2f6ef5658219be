//! Byte-level link abstraction shared by the serial radio and the synthetic link

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};

use crate::framing::{Command, FrameCodec, MODULE_ADDRESS};
use crate::RadioError;

pub const PROBE_ATTEMPTS: u32 = 3;
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(300);
pub const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// Half-duplex link carrying whole frames.
///
/// Implementations are driven by one exchange at a time; the engine never
/// calls `send` while a previous `receive` is pending.
#[async_trait]
pub trait LinkTransport: Send {
    /// Short name used in log lines.
    fn name(&self) -> &'static str;

    async fn send(&mut self, bytes: &[u8]) -> Result<(), RadioError>;

    /// Waits up to `timeout` for one frame's worth of bytes. `None` is a
    /// timeout, which is an ordinary outcome.
    async fn receive(&mut self, timeout: Duration) -> Option<Vec<u8>>;

    /// Signal strength of the most recent reply, when the medium reports it.
    fn signal_strength(&self) -> Option<i16> {
        None
    }

    /// Pings the radio module up to [`PROBE_ATTEMPTS`] times.
    async fn check_presence(&mut self) -> bool {
        let codec = FrameCodec;
        let probe = match codec.encode(Command::Ping.code(), MODULE_ADDRESS, &[]) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };

        for attempt in 1..=PROBE_ATTEMPTS {
            if let Err(e) = self.send(&probe).await {
                warn!(target: "link", "{}: presence probe {} not sent: {}", self.name(), attempt, e);
            } else if let Some(bytes) = self.receive(PROBE_TIMEOUT).await {
                match codec.decode(&bytes) {
                    Ok(frame) if frame.is_reply_to(Command::Ping, MODULE_ADDRESS) && frame.payload == b"OK" => {
                        info!(target: "link", "{}: radio module detected", self.name());
                        return true;
                    }
                    Ok(frame) => debug!(target: "link", "{}: unexpected probe reply {:?}", self.name(), frame),
                    Err(e) => debug!(target: "link", "{}: probe reply rejected: {}", self.name(), e),
                }
            }

            if attempt < PROBE_ATTEMPTS {
                tokio::time::sleep(PROBE_INTERVAL).await;
            }
        }

        false
    }
}

#[async_trait]
impl<T: LinkTransport + ?Sized> LinkTransport for Box<T> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), RadioError> {
        (**self).send(bytes).await
    }

    async fn receive(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        (**self).receive(timeout).await
    }

    fn signal_strength(&self) -> Option<i16> {
        (**self).signal_strength()
    }

    async fn check_presence(&mut self) -> bool {
        (**self).check_presence().await
    }
}
