use crate::error::{StoreError, StoreResult};
use crate::generator::ReadingGenerator;
use crate::reading::{format_timestamp, SensorReading};
use crate::store::DocumentStore;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Bounded exponential backoff for retryable store failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt - 1)`, capped.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2_u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

#[derive(Debug)]
pub struct IngestStats {
    pub sent: AtomicU64,
    pub failed: AtomicU64,
    pub retries: AtomicU64,
    pub last_send_unix_ms: AtomicU64,
    pub average_send_micros: AtomicU64,
    pub last_error: Mutex<Option<String>>,
}

impl Default for IngestStats {
    fn default() -> Self {
        Self::new()
    }
}

impl IngestStats {
    pub fn new() -> Self {
        Self {
            sent: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            last_send_unix_ms: AtomicU64::new(0),
            average_send_micros: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    fn record_sent(&self, elapsed: Duration) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now().timestamp_millis().max(0) as u64;
        self.last_send_unix_ms.store(now, Ordering::Relaxed);
        let micros = elapsed.as_micros().min(u128::from(u64::MAX)) as u64;
        let prev = self.average_send_micros.load(Ordering::Relaxed);
        let avg = if prev == 0 { micros } else { (prev + micros) / 2 };
        self.average_send_micros.store(avg, Ordering::Relaxed);
        self.clear_error();
    }

    pub fn record_error(&self, err: impl Into<String>) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = Some(err.into());
        }
    }

    pub fn clear_error(&self) {
        if let Ok(mut guard) = self.last_error.lock() {
            *guard = None;
        }
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|guard| guard.clone())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendOutcome {
    pub inserted_id: String,
    pub attempts: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    LimitReached,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IngestSummary {
    pub cycles: u64,
    pub sent: u64,
    pub failed: u64,
    pub stopped_by: StopReason,
}

/// Periodic writer: one generated reading per cycle, one insert per reading.
pub struct IngestionService<S> {
    store: S,
    generator: ReadingGenerator,
    retry: RetryPolicy,
    interval: Duration,
    stats: Arc<IngestStats>,
}

impl<S: DocumentStore> IngestionService<S> {
    pub fn new(store: S, interval: Duration, retry: RetryPolicy) -> Self {
        Self {
            store,
            generator: ReadingGenerator::new(),
            retry,
            interval,
            stats: Arc::new(IngestStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// Inserts one reading. Connection and timeout failures are retried with backoff up to
    /// the policy's limit; anything else fails immediately.
    pub async fn send(&self, reading: &SensorReading) -> StoreResult<SendOutcome> {
        self.send_until(reading, &CancellationToken::new()).await
    }

    /// Like [`IngestionService::send`], but once `cancel` fires no further attempt is
    /// started. An attempt already in progress still completes; its error is returned as is.
    pub async fn send_until(
        &self,
        reading: &SensorReading,
        cancel: &CancellationToken,
    ) -> StoreResult<SendOutcome> {
        let started = Instant::now();
        let mut attempts = 0_u32;
        loop {
            attempts += 1;
            match self.store.insert_reading(reading).await {
                Ok(inserted_id) => {
                    let elapsed = started.elapsed();
                    self.stats.record_sent(elapsed);
                    tracing::debug!(
                        device = %reading.device_id(),
                        kind = %reading.kind(),
                        id = %inserted_id,
                        attempts,
                        elapsed_ms = elapsed.as_millis() as u64,
                        "reading stored"
                    );
                    return Ok(SendOutcome {
                        inserted_id,
                        attempts,
                        elapsed,
                    });
                }
                Err(err)
                    if err.is_retryable()
                        && attempts <= self.retry.max_retries
                        && !cancel.is_cancelled() =>
                {
                    let delay = self.retry.delay_for(attempts);
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        device = %reading.device_id(),
                        kind = %reading.kind(),
                        timestamp = %format_timestamp(reading.timestamp()),
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "insert failed; retrying"
                    );
                    let interrupted = tokio::select! {
                        _ = cancel.cancelled() => true,
                        _ = tokio::time::sleep(delay) => false,
                    };
                    if interrupted {
                        tracing::info!(
                            device = %reading.device_id(),
                            attempt = attempts,
                            "shutdown requested; abandoning retries"
                        );
                        self.record_failure(reading, attempts, &err);
                        return Err(err);
                    }
                }
                Err(err) => {
                    self.record_failure(reading, attempts, &err);
                    return Err(err);
                }
            }
        }
    }

    fn record_failure(&self, reading: &SensorReading, attempts: u32, err: &StoreError) {
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        self.stats.record_error(err.to_string());
        tracing::error!(
            device = %reading.device_id(),
            kind = %reading.kind(),
            timestamp = %format_timestamp(reading.timestamp()),
            operation = err.operation(),
            error_kind = err.kind(),
            attempts,
            error = %err,
            "failed to store reading"
        );
    }

    /// Generates and sends one reading per interval until `cancel` fires or `max_readings`
    /// have been attempted. Cancellation is checked between cycles, during the wait and
    /// during retry backoff; a write already in progress always runs to completion.
    pub async fn run(&self, cancel: CancellationToken, max_readings: Option<u64>) -> IngestSummary {
        let mut rng = StdRng::from_entropy();
        let mut cycles = 0_u64;
        let mut sent = 0_u64;
        let mut failed = 0_u64;

        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            max_readings,
            "ingestion loop started"
        );

        let stopped_by = loop {
            if cancel.is_cancelled() {
                break StopReason::Cancelled;
            }
            if max_readings.is_some_and(|max| cycles >= max) {
                break StopReason::LimitReached;
            }

            let reading = self.generator.generate(&mut rng, None);
            cycles += 1;
            match self.send_until(&reading, &cancel).await {
                Ok(outcome) => {
                    sent += 1;
                    tracing::info!(
                        cycle = cycles,
                        device = %reading.device_id(),
                        kind = %reading.kind(),
                        location = %reading.location(),
                        temperature = reading.temperature(),
                        unit = reading.unit().symbol(),
                        id = %outcome.inserted_id,
                        "sent reading"
                    );
                }
                Err(_) => failed += 1,
            }

            if max_readings.is_some_and(|max| cycles >= max) {
                break StopReason::LimitReached;
            }
            tokio::select! {
                _ = cancel.cancelled() => break StopReason::Cancelled,
                _ = tokio::time::sleep(self.interval) => {}
            }
        };

        tracing::info!(cycles, sent, failed, reason = ?stopped_by, "ingestion loop stopped");
        IngestSummary {
            cycles,
            sent,
            failed,
            stopped_by,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::DocumentStore;
    use crate::test_support::{connection_refused, seeded_rng, FlakyStore};

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1_000),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay_for(64), Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let store = FlakyStore::new(|call| (call < 2).then(connection_refused));
        let service = IngestionService::new(store.clone(), Duration::from_millis(1), fast_retry(3));
        let reading = ReadingGenerator::new().generate(&mut seeded_rng(), None);

        let outcome = service.send(&reading).await.unwrap();
        assert_eq!(outcome.attempts, 3);
        assert_eq!(store.insert_calls(), 3);
        assert_eq!(store.inner().len(), 1);
        let stats = service.stats();
        assert_eq!(stats.retries.load(Ordering::Relaxed), 2);
        assert_eq!(stats.sent.load(Ordering::Relaxed), 1);
        assert!(stats.last_error().is_none());
    }

    #[tokio::test]
    async fn write_errors_are_not_retried() {
        let store = FlakyStore::new(|_| Some(StoreError::write("insert_one", "document too large")));
        let service = IngestionService::new(store.clone(), Duration::from_millis(1), fast_retry(3));
        let reading = ReadingGenerator::new().generate(&mut seeded_rng(), None);

        let err = service.send(&reading).await.unwrap_err();
        assert_eq!(err.kind(), "write");
        assert_eq!(store.insert_calls(), 1);
        assert_eq!(service.stats().failed.load(Ordering::Relaxed), 1);
        assert!(service
            .stats()
            .last_error()
            .is_some_and(|msg| msg.contains("document too large")));
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let store = FlakyStore::new(|_| Some(connection_refused()));
        let service = IngestionService::new(store.clone(), Duration::from_millis(1), fast_retry(2));
        let reading = ReadingGenerator::new().generate(&mut seeded_rng(), None);

        assert!(service.send(&reading).await.unwrap_err().is_retryable());
        assert_eq!(store.insert_calls(), 3);
    }

    #[tokio::test]
    async fn failed_sends_do_not_stop_the_loop() {
        let store = FlakyStore::new(|call| (call % 2 == 0).then(connection_refused));
        let service = IngestionService::new(store.clone(), Duration::from_millis(2), RetryPolicy::none());

        let summary = service.run(CancellationToken::new(), Some(6)).await;
        assert_eq!(summary.cycles, 6);
        assert_eq!(summary.sent, 3);
        assert_eq!(summary.failed, 3);
        assert_eq!(summary.stopped_by, StopReason::LimitReached);
        assert_eq!(store.inner().len(), 3);
    }

    #[tokio::test]
    async fn cancellation_waits_for_the_in_flight_write() {
        let store = FlakyStore::reliable().with_insert_delay(Duration::from_millis(50));
        let service = Arc::new(IngestionService::new(
            store.clone(),
            Duration::from_secs(60),
            RetryPolicy::none(),
        ));
        let cancel = CancellationToken::new();

        let handle = {
            let service = service.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { service.run(cancel, None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let summary = handle.await.unwrap();
        assert_eq!(summary.stopped_by, StopReason::Cancelled);
        assert_eq!(summary.cycles, 1);
        assert_eq!(summary.sent, 1);
        assert_eq!(store.inner().len(), 1);
        assert_eq!(store.find_recent(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancellation_cuts_retry_backoff_short() {
        let store = FlakyStore::new(|_| Some(connection_refused()));
        let retry = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(1),
        };
        let service = Arc::new(IngestionService::new(store.clone(), Duration::from_secs(60), retry));
        let cancel = CancellationToken::new();

        let started = Instant::now();
        let handle = {
            let service = service.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { service.run(cancel, None).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();

        let summary = handle.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1), "{:?}", started.elapsed());
        assert_eq!(store.insert_calls(), 1);
        assert_eq!(summary.cycles, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.stopped_by, StopReason::Cancelled);
        assert_eq!(service.stats().retries.load(Ordering::Relaxed), 1);
        assert!(service.stats().last_error().is_some());
    }

    #[tokio::test]
    async fn cancelled_token_prevents_any_retry() {
        let store = FlakyStore::new(|_| Some(connection_refused()));
        let service = IngestionService::new(store.clone(), Duration::from_millis(1), fast_retry(3));
        let reading = ReadingGenerator::new().generate(&mut seeded_rng(), None);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = service.send_until(&reading, &cancel).await.unwrap_err();
        assert_eq!(err.kind(), "connection");
        assert_eq!(store.insert_calls(), 1);
    }

    #[tokio::test]
    async fn pre_cancelled_loop_sends_nothing() {
        let store = FlakyStore::reliable();
        let service = IngestionService::new(store.clone(), Duration::from_millis(1), RetryPolicy::none());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = service.run(cancel, Some(10)).await;
        assert_eq!(summary.cycles, 0);
        assert_eq!(store.insert_calls(), 0);
    }
}
