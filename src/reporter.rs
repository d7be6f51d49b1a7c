//! Background reporter - drains the batch queue and delivers reports
//!
//! The reporter owns the only slow path in the engine. It runs on a
//! dedicated thread (a current-thread tokio runtime spawned by the
//! instrumenter), woken by a fixed interval or by the queue's high-water
//! nudge. Draining swaps the queue buffer first; all network I/O happens
//! on the already-swapped batch so producers never wait on the collector.
//!
//! Delivery of one batch: Draining -> Sending -> Idle on success,
//! Sending -> Backoff -> Sending on a retryable failure, and the batch is
//! discarded (and counted) once attempts are exhausted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::AgentConfig;
use crate::endpoint;
use crate::metrics::{BATCHES_FAILED, BATCHES_SENT, REPORT_SEND_DURATION, SEND_RETRIES};
use crate::queue::BatchQueue;
use crate::transport::{Collector, ReportPayload};

/// Background delivery loop. Generic over the collector so tests can
/// inject capturing or failing transports.
pub struct Reporter<C: Collector> {
    queue: Arc<BatchQueue>,
    collector: C,
    interval: Duration,
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    shutdown_flush_timeout: Duration,
    sent_batches: AtomicU64,
    failed_batches: AtomicU64,
}

impl<C: Collector> Reporter<C> {
    pub fn new(queue: Arc<BatchQueue>, collector: C, config: &AgentConfig) -> Self {
        Self {
            queue,
            collector,
            interval: config.report_interval,
            max_attempts: config.max_send_attempts.max(1),
            base_delay: config.retry_base_delay,
            max_delay: config.retry_max_delay,
            shutdown_flush_timeout: config.shutdown_flush_timeout,
            sent_batches: AtomicU64::new(0),
            failed_batches: AtomicU64::new(0),
        }
    }

    /// Batches delivered successfully.
    pub fn sent_batches(&self) -> u64 {
        self.sent_batches.load(Ordering::Relaxed)
    }

    /// Batches discarded after exhausting send attempts.
    pub fn failed_batches(&self) -> u64 {
        self.failed_batches.load(Ordering::Relaxed)
    }

    /// Run until the shutdown signal flips, then make one final
    /// drain-and-send bounded by the shutdown flush timeout.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately; consume it
        // so the loop starts in its waiting state.
        interval.tick().await;

        debug!(interval_ms = self.interval.as_millis() as u64, "reporter running");

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.queue.wakeup().notified() => {}
                _ = shutdown.changed() => break,
            }
            self.flush().await;
        }

        // Best-effort final flush; never holds up process shutdown.
        if tokio::time::timeout(self.shutdown_flush_timeout, self.flush())
            .await
            .is_err()
        {
            warn!("final flush exceeded shutdown deadline, remaining traces lost");
        }
        info!(
            sent = self.sent_batches(),
            failed = self.failed_batches(),
            dropped_traces = self.queue.dropped_count(),
            "reporter stopped"
        );
    }

    /// Drain the queue and deliver whatever accumulated. The swap happens
    /// before any I/O, so concurrent producers are never blocked.
    pub async fn flush(&self) {
        let batch = self.queue.drain();
        if batch.is_empty() {
            return;
        }

        let groups = endpoint::group(batch.into_traces());
        let report = ReportPayload::build(&groups);
        self.deliver(report).await;
    }

    async fn deliver(&self, report: ReportPayload) {
        let traces = report.trace_count();
        let timer = REPORT_SEND_DURATION.start_timer();
        let mut delay = self.base_delay;

        for attempt in 1..=self.max_attempts {
            match self.collector.send(&report).await {
                Ok(()) => {
                    self.sent_batches.fetch_add(1, Ordering::Relaxed);
                    BATCHES_SENT.inc();
                    debug!(traces, attempt, "report delivered");
                    timer.observe_duration();
                    return;
                }
                Err(e) if attempt < self.max_attempts => {
                    SEND_RETRIES.inc();
                    warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "send failed, backing off");
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(self.max_delay);
                }
                Err(e) => {
                    self.failed_batches.fetch_add(1, Ordering::Relaxed);
                    BATCHES_FAILED.inc();
                    warn!(error = %e, traces, attempts = self.max_attempts, "send attempts exhausted, batch dropped");
                }
            }
        }
        timer.observe_duration();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OverflowPolicy;
    use crate::endpoint::EndpointKey;
    use crate::trace::{Span, Trace};
    use crate::transport::TransportError;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// Collector that fails the first `failures` sends, then captures.
    struct FlakyCollector {
        failures: AtomicU64,
        delivered: Mutex<Vec<ReportPayload>>,
    }

    impl FlakyCollector {
        fn new(failures: u64) -> Self {
            Self {
                failures: AtomicU64::new(failures),
                delivered: Mutex::new(Vec::new()),
            }
        }

        fn delivered_reports(&self) -> usize {
            self.delivered.lock().unwrap().len()
        }
    }

    impl Collector for Arc<FlakyCollector> {
        async fn send(&self, report: &ReportPayload) -> Result<(), TransportError> {
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.fetch_sub(1, Ordering::SeqCst);
                return Err(TransportError::Status(503));
            }
            self.delivered.lock().unwrap().push(report.clone());
            Ok(())
        }
    }

    fn queue_with(traces: usize) -> Arc<BatchQueue> {
        let queue = Arc::new(BatchQueue::new(100, 50, OverflowPolicy::DropOldest));
        for i in 0..traces {
            let mut root = Span::new("app.request", Some(format!("t{i}")), Duration::ZERO);
            root.duration = Duration::from_millis(1);
            let trace =
                Trace::build(Uuid::now_v7(), EndpointKey::unnamed(), vec![root]).unwrap();
            queue.record(trace);
        }
        queue
    }

    fn fast_config() -> AgentConfig {
        AgentConfig {
            report_interval: Duration::from_millis(10),
            max_send_attempts: 3,
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(4),
            shutdown_flush_timeout: Duration::from_millis(500),
            ..AgentConfig::default()
        }
    }

    #[tokio::test]
    async fn test_flush_delivers_batch() {
        let queue = queue_with(3);
        let collector = Arc::new(FlakyCollector::new(0));
        let reporter = Reporter::new(Arc::clone(&queue), Arc::clone(&collector), &fast_config());

        reporter.flush().await;

        assert_eq!(reporter.sent_batches(), 1);
        assert_eq!(collector.delivered_reports(), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_flush_skips_empty_queue() {
        let queue = queue_with(0);
        let collector = Arc::new(FlakyCollector::new(0));
        let reporter = Reporter::new(queue, Arc::clone(&collector), &fast_config());

        reporter.flush().await;

        assert_eq!(reporter.sent_batches(), 0);
        assert_eq!(collector.delivered_reports(), 0);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let queue = queue_with(1);
        let collector = Arc::new(FlakyCollector::new(2));
        let reporter = Reporter::new(queue, Arc::clone(&collector), &fast_config());

        reporter.flush().await;

        // Two failures, third attempt lands.
        assert_eq!(reporter.sent_batches(), 1);
        assert_eq!(reporter.failed_batches(), 0);
        assert_eq!(collector.delivered_reports(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_attempts_drop_batch_once() {
        let queue = queue_with(5);
        let collector = Arc::new(FlakyCollector::new(u64::MAX));
        let reporter = Reporter::new(Arc::clone(&queue), Arc::clone(&collector), &fast_config());

        reporter.flush().await;

        assert_eq!(reporter.sent_batches(), 0);
        assert_eq!(reporter.failed_batches(), 1);
        assert_eq!(collector.delivered_reports(), 0);
        // The lost batch does not corrupt the queue for later batches.
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_run_flushes_on_shutdown() {
        let queue = queue_with(2);
        let collector = Arc::new(FlakyCollector::new(0));
        let reporter = Reporter::new(Arc::clone(&queue), Arc::clone(&collector), &fast_config());

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(reporter.run(rx));

        tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(collector.delivered_reports(), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_run_wakes_on_high_water() {
        let config = AgentConfig {
            // Interval far beyond the test; only the nudge can wake it.
            report_interval: Duration::from_secs(3600),
            ..fast_config()
        };
        let queue = Arc::new(BatchQueue::new(100, 2, OverflowPolicy::DropOldest));
        let collector = Arc::new(FlakyCollector::new(0));
        let reporter = Reporter::new(Arc::clone(&queue), Arc::clone(&collector), &config);

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(reporter.run(rx));
        tokio::time::sleep(Duration::from_millis(20)).await;

        for i in 0..3 {
            let mut root = Span::new("app.request", Some(format!("t{i}")), Duration::ZERO);
            root.duration = Duration::from_millis(1);
            let trace =
                Trace::build(Uuid::now_v7(), EndpointKey::unnamed(), vec![root]).unwrap();
            queue.record(trace);
        }

        // The high-water nudge wakes the reporter long before the interval.
        for _ in 0..100 {
            if collector.delivered_reports() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(collector.delivered_reports(), 1);

        tx.send(true).unwrap();
        task.await.unwrap();
    }
}
