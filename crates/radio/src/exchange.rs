//! One logical request/response over the shared link, with retries.
//!
//! Each attempt walks `Idle -> Sent -> AwaitingReply` and ends in one of
//! `DecodedOk`, `TimedOut`, `DecodeFailed` (or `SendFailed` when the device
//! refused the bytes). Anything but `DecodedOk` either starts the next attempt
//! or, after the last one, ends the exchange with `None`.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, trace, warn};
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::config::RetryPolicy;
use crate::framing::{Command, Frame, FrameCodec};
use crate::stats::StatsCollector;
use crate::transport::LinkTransport;
use crate::RadioError;

#[derive(Debug)]
enum AttemptOutcome {
    DecodedOk(Frame),
    TimedOut,
    DecodeFailed(String),
    SendFailed(RadioError),
}

/// Owns the transport behind a single-slot guard: while one exchange holds
/// the slot, any other caller waits for it to finish.
pub struct ExchangeEngine {
    slot: Mutex<Box<dyn LinkTransport>>,
    codec: FrameCodec,
    policy: RetryPolicy,
    allow_list: BTreeSet<u8>,
    stats: Arc<Mutex<StatsCollector>>,
}

impl ExchangeEngine {
    pub fn new(
        transport: Box<dyn LinkTransport>,
        policy: RetryPolicy,
        allow_list: BTreeSet<u8>,
        stats: Arc<Mutex<StatsCollector>>,
    ) -> Self {
        Self {
            slot: Mutex::new(transport),
            codec: FrameCodec,
            policy,
            allow_list,
            stats,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn is_allowed(&self, address: u8) -> bool {
        self.allow_list.contains(&address)
    }

    pub fn stats(&self) -> Arc<Mutex<StatsCollector>> {
        self.stats.clone()
    }

    pub async fn transport_name(&self) -> &'static str {
        self.slot.lock().await.name()
    }

    /// Checks the address and payload, then runs up to `max_retries`
    /// attempts. `Ok(None)` means no valid reply within the retry budget;
    /// errors are reserved for requests that retrying cannot fix.
    pub async fn exchange_with_retry(
        &self,
        command: Command,
        address: u8,
        payload: &[u8],
    ) -> Result<Option<Frame>, RadioError> {
        if !self.is_allowed(address) {
            warn!(target: "radio", "rejected {:?} to unit {}: not in allow-list", command, address);
            return Err(RadioError::AddressNotAllowed(address));
        }
        let request = self.codec.encode(command.code(), address, payload)?;

        let mut transport = self.slot.lock().await;
        let max = self.policy.max_retries;
        let mut timeouts = 0;

        for attempt in 0..max {
            let timeout = self.policy.timeout_for(attempt);
            match self.attempt(&mut transport, &request, command, address, timeout).await {
                AttemptOutcome::DecodedOk(frame) => {
                    if attempt > 0 {
                        debug!(target: "radio", "unit {} answered on attempt {}/{}", address, attempt + 1, max);
                    }
                    return Ok(Some(frame));
                }
                AttemptOutcome::TimedOut => {
                    timeouts += 1;
                    debug!(
                        target: "radio",
                        "attempt {}/{} to unit {} timed out after {:?}",
                        attempt + 1, max, address, timeout
                    );
                }
                AttemptOutcome::DecodeFailed(reason) => {
                    debug!(target: "radio", "attempt {}/{} to unit {} bad reply: {}", attempt + 1, max, address, reason);
                }
                AttemptOutcome::SendFailed(e) => {
                    debug!(target: "radio", "attempt {}/{} to unit {} not sent: {}", attempt + 1, max, address, e);
                }
            }

            if attempt + 1 < max {
                if let Some(backoff) = self.policy.backoff_for(attempt) {
                    sleep(backoff).await;
                }
            }
        }

        if timeouts == max {
            warn!(target: "radio", "unit {} silent: {} consecutive timeouts", address, timeouts);
        }
        warn!(target: "radio", "no reply from unit {} after {} attempts", address, max);
        Ok(None)
    }

    async fn attempt(
        &self,
        transport: &mut Box<dyn LinkTransport>,
        request: &[u8],
        command: Command,
        address: u8,
        timeout: Duration,
    ) -> AttemptOutcome {
        // Idle -> Sent
        if let Err(e) = transport.send(request).await {
            self.stats.lock().await.record_tx(false);
            return AttemptOutcome::SendFailed(e);
        }
        self.stats.lock().await.record_tx(true);

        // Sent -> AwaitingReply
        let Some(bytes) = transport.receive(timeout).await else {
            self.stats.lock().await.record_timeout();
            return AttemptOutcome::TimedOut;
        };
        trace!(target: "radio", "reply from unit {}: {:02X?}", address, bytes);

        let outcome = match self.codec.decode(&bytes) {
            Ok(frame) if frame.is_reply_to(command, address) => AttemptOutcome::DecodedOk(frame),
            Ok(frame) => AttemptOutcome::DecodeFailed(format!(
                "expected {:?} from unit {}, got command 0x{:02X} from unit {}",
                command, address, frame.command, frame.address
            )),
            Err(e) => AttemptOutcome::DecodeFailed(e.to_string()),
        };

        let mut stats = self.stats.lock().await;
        match &outcome {
            AttemptOutcome::DecodedOk(frame) => {
                stats.record_rx_ok(transport.signal_strength().or_else(|| payload_signal(frame)));
            }
            _ => stats.record_rx_error(),
        }
        outcome
    }

    /// Runs the transport's presence probe under the exchange slot.
    pub async fn check_presence(&self) -> bool {
        self.slot.lock().await.check_presence().await
    }
}

/// Signal byte of a status reply, used when the medium reports none.
fn payload_signal(frame: &Frame) -> Option<i16> {
    if frame.command() != Some(Command::GetStatus) {
        return None;
    }
    frame.payload.get(2).map(|&b| i16::from(b as i8))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::FrameError;
    use crate::transport::testing::{Reply, ScriptedTransport};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    fn engine(transport: impl LinkTransport + 'static, policy: RetryPolicy) -> ExchangeEngine {
        ExchangeEngine::new(
            Box::new(transport),
            policy,
            [1, 2, 3].into_iter().collect(),
            Arc::new(Mutex::new(StatsCollector::new())),
        )
    }

    async fn stats(engine: &ExchangeEngine) -> crate::LinkStats {
        engine.stats().lock().await.snapshot()
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_growth_when_unit_is_silent() {
        let transport = ScriptedTransport::silent();
        let log = transport.log();
        let policy = RetryPolicy {
            max_retries: 3,
            timeout_base_ms: 500,
            timeout_multiplier: 1.5,
            backoff_enabled: true,
            backoff_ms: 100,
        };
        let engine = engine(transport, policy);

        let start = Instant::now();
        let result = engine.exchange_with_retry(Command::GetStatus, 2, &[]).await.unwrap();
        assert!(result.is_none());

        let timeouts: Vec<u128> = log.lock().unwrap().timeouts.iter().map(|t| t.as_millis()).collect();
        assert_eq!(timeouts, vec![500, 750, 1125]);
        // backoff after attempts 1 and 2 only; the scripted link answers instantly
        assert_eq!(start.elapsed(), Duration::from_millis(300));

        let stats = stats(&engine).await;
        assert_eq!(stats.timeouts, 3);
        assert_eq!(stats.tx_count, 3);
        assert_eq!(stats.rx_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_delay_between_attempts_without_backoff() {
        let transport = ScriptedTransport::silent();
        let log = transport.log();
        let policy = RetryPolicy {
            backoff_enabled: false,
            ..Default::default()
        };
        let engine = engine(transport, policy);

        let start = Instant::now();
        assert!(engine.exchange_with_retry(Command::GetStatus, 1, &[]).await.unwrap().is_none());
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(log.lock().unwrap().sent.len(), 3);
        assert_eq!(stats(&engine).await.timeouts, 3);
    }

    #[tokio::test]
    async fn test_first_attempt_success() {
        let transport = ScriptedTransport::new(Reply::Answer(vec![1, 90, (-60i8) as u8, 0]));
        let engine = engine(transport, RetryPolicy::default());

        let frame = engine
            .exchange_with_retry(Command::GetStatus, 1, &[])
            .await
            .unwrap()
            .unwrap();
        assert!(frame.is_reply_to(Command::GetStatus, 1));

        let stats = stats(&engine).await;
        assert_eq!((stats.tx_count, stats.rx_count, stats.timeouts), (1, 1, 0));
        assert!((stats.avg_signal - -6.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_corrupt_reply() {
        let mut garbage = FrameCodec.encode(Command::GetStatus.code(), 3, &[1]).unwrap();
        garbage[5] ^= 0x10;
        let transport = ScriptedTransport::silent()
            .script(3, vec![Reply::Bytes(garbage), Reply::Answer(vec![2])]);
        let engine = engine(transport, RetryPolicy::default());

        let frame = engine.exchange_with_retry(Command::GetStatus, 3, &[]).await.unwrap();
        assert_eq!(frame.unwrap().payload, vec![2]);

        let stats = stats(&engine).await;
        assert_eq!(stats.tx_count, 2);
        assert_eq!(stats.rx_count, 2);
        assert_eq!(stats.rx_errors, 1);
        assert_eq!(stats.timeouts, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_from_wrong_unit_is_retried() {
        let stray = FrameCodec.encode(Command::GetStatus.code(), 9, &[1]).unwrap();
        let transport = ScriptedTransport::silent()
            .script(2, vec![Reply::Bytes(stray), Reply::Answer(vec![1])]);
        let engine = engine(transport, RetryPolicy::default());

        let frame = engine.exchange_with_retry(Command::GetStatus, 2, &[]).await.unwrap().unwrap();
        assert_eq!(frame.address, 2);
        assert_eq!(stats(&engine).await.rx_errors, 1);
    }

    #[tokio::test]
    async fn test_address_not_allowed_sends_nothing() {
        let transport = ScriptedTransport::new(Reply::Answer(vec![1]));
        let log = transport.log();
        let engine = engine(transport, RetryPolicy::default());

        let result = engine.exchange_with_retry(Command::GetStatus, 7, &[]).await;
        assert!(matches!(result, Err(RadioError::AddressNotAllowed(7))));
        assert!(log.lock().unwrap().sent.is_empty());
        assert_eq!(stats(&engine).await, crate::LinkStats::default());
    }

    #[tokio::test]
    async fn test_payload_too_large_sends_nothing() {
        let transport = ScriptedTransport::new(Reply::Answer(vec![1]));
        let log = transport.log();
        let engine = engine(transport, RetryPolicy::default());

        let result = engine.exchange_with_retry(Command::SetMode, 1, &[0; 12]).await;
        assert!(matches!(
            result,
            Err(RadioError::Frame(FrameError::PayloadTooLarge(12)))
        ));
        assert!(log.lock().unwrap().sent.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failures_are_retried_then_give_up() {
        let mut transport = ScriptedTransport::new(Reply::Answer(vec![1]));
        transport.fail_send = true;
        let engine = engine(transport, RetryPolicy::default());

        let reply = tokio_test::assert_ok!(engine.exchange_with_retry(Command::Ping, 1, &[]).await);
        assert!(reply.is_none());

        let stats = stats(&engine).await;
        assert_eq!(stats.tx_count, 3);
        assert_eq!(stats.tx_errors, 3);
        assert_eq!(stats.timeouts, 0);
    }

    struct SlowLink {
        in_flight: Arc<AtomicUsize>,
        max_seen: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl LinkTransport for SlowLink {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn send(&mut self, _bytes: &[u8]) -> Result<(), RadioError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            Ok(())
        }

        async fn receive(&mut self, timeout: Duration) -> Option<Vec<u8>> {
            sleep(timeout).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            None
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_exchanges_never_overlap() {
        let max_seen = Arc::new(AtomicUsize::new(0));
        let link = SlowLink {
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_seen: max_seen.clone(),
        };
        let engine = Arc::new(engine(link, RetryPolicy::default()));

        let handles: Vec<_> = (1..=3u8)
            .map(|address| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.exchange_with_retry(Command::GetStatus, address, &[]).await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().unwrap().is_none());
        }

        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
        assert_eq!(stats(&engine).await.timeouts, 9);
    }
}
