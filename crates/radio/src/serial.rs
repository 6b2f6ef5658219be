//! GT38 433 MHz serial radio module
//!
//! Needs the `serial` cargo feature; without it `open` reports the device as
//! unavailable so the link falls back to the synthetic transport.

use std::time::Duration;

use async_trait::async_trait;
use log::{info, trace, warn};
use tokio::time::Instant;

use crate::config::SerialConfig;
use crate::framing::FrameAssembler;
use crate::transport::LinkTransport;
use crate::RadioError;

/// Idle wait between serial polls while a reply is outstanding.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

pub struct SerialTransport {
    config: SerialConfig,
    #[cfg(feature = "serial")]
    port: Box<dyn serialport::SerialPort>,
    assembler: FrameAssembler,
}

impl SerialTransport {
    #[cfg(feature = "serial")]
    pub fn open(config: &SerialConfig) -> Result<Self, RadioError> {
        info!(target: "link", "opening {} at {} baud", config.port, config.baud_rate);

        let port = serialport::new(&config.port, config.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None)
            .timeout(POLL_INTERVAL)
            .open()
            .map_err(|e| RadioError::TransportUnavailable(format!("{}: {}", config.port, e)))?;

        if let Err(e) = port.clear(serialport::ClearBuffer::All) {
            warn!(target: "link", "could not flush {}: {}", config.port, e);
        }

        Ok(Self {
            config: config.clone(),
            port,
            assembler: FrameAssembler::new(),
        })
    }

    #[cfg(not(feature = "serial"))]
    pub fn open(config: &SerialConfig) -> Result<Self, RadioError> {
        info!(target: "link", "serial support not compiled in, {} unavailable", config.port);
        Err(RadioError::TransportUnavailable(format!(
            "{}: built without the `serial` feature",
            config.port
        )))
    }

    pub fn port_name(&self) -> &str {
        &self.config.port
    }

    #[cfg(feature = "serial")]
    fn read_available(&mut self) -> Result<usize, RadioError> {
        use std::io::Read;

        let available = self
            .port
            .bytes_to_read()
            .map_err(|e| RadioError::TransportUnavailable(e.to_string()))? as usize;
        if available == 0 {
            return Ok(0);
        }

        let mut chunk = [0u8; 64];
        let want = available.min(chunk.len());
        match self.port.read(&mut chunk[..want]) {
            Ok(n) => {
                trace!(target: "link", "rx {:02X?}", &chunk[..n]);
                self.assembler.push(&chunk[..n]);
                Ok(n)
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(RadioError::TransportUnavailable(e.to_string())),
        }
    }

    #[cfg(not(feature = "serial"))]
    fn read_available(&mut self) -> Result<usize, RadioError> {
        Err(RadioError::TransportUnavailable(self.config.port.clone()))
    }

    #[cfg(feature = "serial")]
    fn write_frame(&mut self, bytes: &[u8]) -> Result<(), RadioError> {
        use std::io::Write;

        self.port
            .write_all(bytes)
            .and_then(|_| self.port.flush())
            .map_err(|e| RadioError::TransportUnavailable(format!("{}: {}", self.config.port, e)))
    }

    #[cfg(not(feature = "serial"))]
    fn write_frame(&mut self, _bytes: &[u8]) -> Result<(), RadioError> {
        Err(RadioError::TransportUnavailable(self.config.port.clone()))
    }
}

#[async_trait]
impl LinkTransport for SerialTransport {
    fn name(&self) -> &'static str {
        "gt38"
    }

    async fn send(&mut self, bytes: &[u8]) -> Result<(), RadioError> {
        // stale bytes from an earlier, timed-out exchange must not be taken as this reply
        self.assembler.clear();
        trace!(target: "link", "tx {:02X?}", bytes);
        self.write_frame(bytes)
    }

    async fn receive(&mut self, timeout: Duration) -> Option<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self.assembler.next_frame() {
                return Some(frame);
            }
            if Instant::now() >= deadline {
                return None;
            }
            match self.read_available() {
                Ok(0) => tokio::time::sleep(POLL_INTERVAL).await,
                Ok(_) => {}
                Err(e) => {
                    warn!(target: "link", "{}: read failed: {}", self.config.port, e);
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(feature = "serial"))]
    #[test]
    fn test_open_without_feature_is_unavailable() {
        let result = SerialTransport::open(&SerialConfig::new("/dev/ttyUSB0"));
        assert!(matches!(result, Err(RadioError::TransportUnavailable(_))));
    }

    #[cfg(feature = "serial")]
    #[test]
    fn test_open_missing_device_is_unavailable() {
        let result = SerialTransport::open(&SerialConfig::new("/dev/does-not-exist-dtd"));
        assert!(matches!(result, Err(RadioError::TransportUnavailable(_))));
    }
}
