//! Instrumenter - process-wide entry point for all probe calls
//!
//! One engine exists per process, installed by `traceline::start` and torn
//! down by `traceline::stop`. Every probe entry point is a graceful no-op
//! when the engine is not running: instrumentation must never raise into
//! host code.
//!
//! The fast path (`start_span`/`finish_span`) touches only the calling
//! thread's own context; the global registry is consulted when an
//! operation begins and never again until the next one.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use lazy_static::lazy_static;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::clock::{Clock, MonotonicClock};
use crate::config::AgentConfig;
use crate::context::{ActiveContext, FinishResult};
use crate::metrics::{self, INSTRUMENTATION_MISUSE, STALE_CONTEXTS_DISCARDED};
use crate::queue::BatchQueue;
use crate::reporter::Reporter;
use crate::trace::SpanHandle;
use crate::transport::{Collector, HttpCollector};

lazy_static! {
    static ref AGENT: RwLock<Option<Arc<Instrumenter>>> = RwLock::new(None);
}

thread_local! {
    /// The calling thread's current operation, if any. One logical
    /// operation maps to exactly one context; contexts are never shared
    /// across threads.
    static CURRENT: RefCell<Option<Bound>> = const { RefCell::new(None) };
}

/// A context bound to the engine it will report through. Capturing the
/// engine here keeps `finish_span` and `end_operation` off the global
/// registry entirely.
struct Bound {
    ctx: ActiveContext,
    engine: Arc<EngineShared>,
}

/// State shared between probe threads and the reporter.
struct EngineShared {
    config: AgentConfig,
    clock: Arc<dyn Clock>,
    queue: Arc<BatchQueue>,
    operation_seq: AtomicU64,
    misuse: AtomicU64,
    stale_discarded: AtomicU64,
}

impl EngineShared {
    /// Report one recovered misuse event. Misuse is logged and counted,
    /// never raised.
    fn misuse(&self, what: &str) {
        self.misuse.fetch_add(1, Ordering::Relaxed);
        INSTRUMENTATION_MISUSE.inc();
        warn!(what, "instrumentation misuse recovered");
    }

    /// Build the trace from a completed context and enqueue it. O(spans)
    /// classification plus one O(1) queue insert; everything slower
    /// happens on the reporter thread.
    fn handoff(&self, ctx: ActiveContext) {
        let implicit = ctx.implicit;
        let operation_id = ctx.operation_id();
        match ctx.finalize() {
            Some(trace) => {
                debug!(
                    operation_id = %operation_id,
                    endpoint = %trace.endpoint,
                    spans = trace.spans.len(),
                    implicit,
                    "trace completed"
                );
                self.queue.record(trace);
            }
            None => self.misuse("operation finished without a valid span tree"),
        }
    }
}

/// Identifies a logical operation begun with `begin_operation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperationHandle {
    operation_seq: u64,
    root: SpanHandle,
}

/// How a logical operation ended, passed to `end_operation`.
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    /// The operation failed; adds the "error" segment
    pub error: bool,
    /// Response format tag (e.g. "json"); becomes a segment
    pub format: Option<String>,
}

impl Outcome {
    pub fn success() -> Self {
        Self::default()
    }

    pub fn failure() -> Self {
        Self {
            error: true,
            format: None,
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }
}

/// The engine: configuration, queue, and the background reporter thread.
pub struct Instrumenter {
    shared: Arc<EngineShared>,
    shutdown: watch::Sender<bool>,
    reporter_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Instrumenter {
    /// Launch with the HTTP collector and real clock.
    pub fn launch(config: AgentConfig) -> Self {
        let collector = HttpCollector::new(&config);
        Self::launch_with(config, collector, Arc::new(MonotonicClock::new()))
    }

    /// Launch with a custom collector and clock. The reporter starts on
    /// its own thread immediately.
    pub fn launch_with<C: Collector>(
        config: AgentConfig,
        collector: C,
        clock: Arc<dyn Clock>,
    ) -> Self {
        metrics::init();

        let queue = Arc::new(BatchQueue::new(
            config.queue_capacity,
            config.high_water_mark,
            config.overflow_policy,
        ));
        let shared = Arc::new(EngineShared {
            clock,
            queue: Arc::clone(&queue),
            operation_seq: AtomicU64::new(1),
            misuse: AtomicU64::new(0),
            stale_discarded: AtomicU64::new(0),
            config,
        });

        let reporter = Reporter::new(queue, collector, &shared.config);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let thread = std::thread::Builder::new()
            .name("traceline-reporter".to_string())
            .spawn(move || {
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime.block_on(reporter.run(shutdown_rx)),
                    Err(e) => warn!(error = %e, "failed to build reporter runtime"),
                }
            });

        let reporter_thread = match thread {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "failed to spawn reporter thread");
                None
            }
        };

        Self {
            shared,
            shutdown,
            reporter_thread: Mutex::new(reporter_thread),
        }
    }

    /// Declare a new logical operation on the calling thread and open its
    /// root span. An operation already open on this thread is discarded
    /// first: as leaked if it outlived the defensive cap, as misuse
    /// otherwise.
    pub fn begin_operation(&self, root_category: &str, name: Option<&str>) -> OperationHandle {
        let now = self.shared.clock.now();

        CURRENT.with(|slot| {
            let mut slot = slot.borrow_mut();

            if let Some(stale) = slot.take() {
                if stale.ctx.age(now) > stale.engine.config.max_operation_duration {
                    stale.engine.stale_discarded.fetch_add(1, Ordering::Relaxed);
                    STALE_CONTEXTS_DISCARDED.inc();
                    warn!(
                        operation_id = %stale.ctx.operation_id(),
                        open_spans = stale.ctx.open_spans(),
                        "discarding context that exceeded the max open duration"
                    );
                } else {
                    stale
                        .engine
                        .misuse("operation began while a previous one was still open");
                }
            }

            let seq = self.shared.operation_seq.fetch_add(1, Ordering::Relaxed);
            let mut ctx = ActiveContext::new(seq, name.map(str::to_string), now);
            let root = ctx.start_span(root_category, None, now);

            *slot = Some(Bound {
                ctx,
                engine: Arc::clone(&self.shared),
            });

            OperationHandle {
                operation_seq: seq,
                root,
            }
        })
    }

    /// Signal the reporter, wait for its final flush, and join the thread.
    /// Idempotent; the final flush is bounded by the shutdown timeout.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handle = self
            .reporter_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Recovered misuse events since launch.
    pub fn misuse_count(&self) -> u64 {
        self.shared.misuse.load(Ordering::Relaxed)
    }

    /// Contexts discarded by the defensive max-open-duration cap.
    pub fn stale_discarded_count(&self) -> u64 {
        self.shared.stale_discarded.load(Ordering::Relaxed)
    }

    /// Traces lost to queue overflow.
    pub fn dropped_trace_count(&self) -> u64 {
        self.shared.queue.dropped_count()
    }
}

impl Drop for Instrumenter {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Global lifecycle
// ─────────────────────────────────────────────────────────────────────────────

/// Install the process-wide engine with the HTTP collector. Returns false
/// (and launches nothing) when one is already running.
pub fn start(config: AgentConfig) -> bool {
    let mut agent = AGENT.write().unwrap_or_else(|e| e.into_inner());
    if agent.is_some() {
        debug!("traceline already started, ignoring");
        return false;
    }
    *agent = Some(Arc::new(Instrumenter::launch(config)));
    true
}

/// Install a pre-built engine (custom collector/clock).
pub fn install(instrumenter: Arc<Instrumenter>) -> bool {
    let mut agent = AGENT.write().unwrap_or_else(|e| e.into_inner());
    if agent.is_some() {
        debug!("traceline already started, ignoring");
        return false;
    }
    *agent = Some(instrumenter);
    true
}

/// Stop the process-wide engine: final flush, reporter thread joined.
/// No-op when not started.
pub fn stop() {
    let instrumenter = {
        let mut agent = AGENT.write().unwrap_or_else(|e| e.into_inner());
        agent.take()
    };
    if let Some(instrumenter) = instrumenter {
        instrumenter.shutdown();
    }
}

fn agent() -> Option<Arc<Instrumenter>> {
    AGENT.read().unwrap_or_else(|e| e.into_inner()).clone()
}

// ─────────────────────────────────────────────────────────────────────────────
// Probe API
// ─────────────────────────────────────────────────────────────────────────────

/// Declare a logical operation against the installed engine. None when
/// the engine is not running.
pub fn begin_operation(root_category: &str, name: Option<&str>) -> Option<OperationHandle> {
    agent().map(|a| a.begin_operation(root_category, name))
}

/// Close the operation's root span, apply the outcome, and hand the
/// finished trace to the queue. Mismatched or stale handles are recovered
/// as misuse.
pub fn end_operation(handle: OperationHandle, outcome: Outcome) {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        let Some(bound) = slot.as_mut() else {
            warn!("end_operation with no active operation");
            return;
        };
        if bound.ctx.operation_seq() != handle.operation_seq {
            bound.engine.misuse("end_operation handle from another operation");
            return;
        }

        if outcome.error {
            bound.ctx.set_operation_error();
            bound.ctx.set_error(handle.root);
        }
        if let Some(format) = outcome.format {
            bound.ctx.add_segment(format);
        }

        let now = bound.engine.clock.now();
        match bound.ctx.finish_span(handle.root, now) {
            FinishResult::Closed { abnormal, .. } => {
                if abnormal > 0 {
                    bound
                        .engine
                        .misuse("operation ended with spans still open");
                }
                if let Some(bound) = slot.take() {
                    bound.engine.handoff(bound.ctx);
                }
            }
            FinishResult::UnknownHandle => {
                bound.engine.misuse("end_operation on an already-closed root");
            }
        }
    });
}

/// Open a span as a child of the innermost open span on this thread.
///
/// With no active operation this is a no-op returning None, unless the
/// engine was configured with `implicit_operations`, in which case an
/// anonymous operation is begun whose root is this span.
pub fn start_span(category: &str, title: Option<&str>) -> Option<SpanHandle> {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();

        if let Some(bound) = slot.as_mut() {
            let now = bound.engine.clock.now();
            return Some(bound.ctx.start_span(category, title, now));
        }

        // Slow path: no context on this thread.
        let Some(instrumenter) = agent() else {
            debug!(category, "span started before traceline::start, ignoring");
            return None;
        };
        if !instrumenter.shared.config.implicit_operations {
            instrumenter
                .shared
                .misuse("span started with no active operation");
            return None;
        }

        let shared = Arc::clone(&instrumenter.shared);
        let now = shared.clock.now();
        let seq = shared.operation_seq.fetch_add(1, Ordering::Relaxed);
        let mut ctx = ActiveContext::new(seq, None, now);
        ctx.implicit = true;
        let handle = ctx.start_span(category, title, now);
        *slot = Some(Bound {
            ctx,
            engine: shared,
        });

        Some(handle)
    })
}

/// Close a span. Closing a span that is not innermost also closes every
/// span above it (counted as misuse) so the stack is always restored.
/// Closing the root emits the trace.
pub fn finish_span(handle: SpanHandle) {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        let Some(bound) = slot.as_mut() else {
            warn!("finish_span with no active operation");
            return;
        };

        let now = bound.engine.clock.now();
        match bound.ctx.finish_span(handle, now) {
            FinishResult::Closed {
                abnormal,
                root_closed,
            } => {
                if abnormal > 0 {
                    bound.engine.misuse("finish_span closed spans out of order");
                }
                if root_closed {
                    if let Some(bound) = slot.take() {
                        bound.engine.handoff(bound.ctx);
                    }
                }
            }
            FinishResult::UnknownHandle => {
                bound.engine.misuse("finish_span on an unknown or closed span");
            }
        }
    });
}

/// Flag a span as failed. The flag propagates to its ancestors as each
/// one closes, so the chain up to the root reflects the failure.
pub fn set_error(handle: SpanHandle) {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        let Some(bound) = slot.as_mut() else {
            return;
        };
        if !bound.ctx.set_error(handle) {
            bound.engine.misuse("set_error on an unknown span");
        }
    });
}

/// Contribute a segment tag (e.g. "json", a queue name) to the current
/// operation's endpoint classification.
pub fn add_segment(segment: &str) {
    with_current(|ctx| ctx.add_segment(segment));
}

/// Contribute a named sub-operation to the current operation's endpoint
/// name.
pub fn name_operation(name: &str) {
    with_current(|ctx| ctx.name_operation(name));
}

fn with_current(f: impl FnOnce(&mut ActiveContext)) {
    CURRENT.with(|slot| {
        if let Some(bound) = slot.borrow_mut().as_mut() {
            f(&mut bound.ctx);
        }
    });
}

/// Closes the guarded span on every exit path, including unwinding. An
/// unwinding exit flags the span first so the failure reaches the root.
struct SpanGuard {
    handle: Option<SpanHandle>,
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if std::thread::panicking() {
                set_error(handle);
            }
            finish_span(handle);
        }
    }
}

/// Run `f` inside a span. The span is finished on every exit path; a
/// panic marks the span chain as failed and propagates unchanged.
pub fn instrument<R>(category: &str, title: Option<&str>, f: impl FnOnce() -> R) -> R {
    let _guard = SpanGuard {
        handle: start_span(category, title),
    };
    f()
}

/// Run a fallible block inside a span. `Err` marks the span chain as
/// failed and is returned to the caller unchanged.
pub fn try_instrument<T, E>(
    category: &str,
    title: Option<&str>,
    f: impl FnOnce() -> Result<T, E>,
) -> Result<T, E> {
    let guard = SpanGuard {
        handle: start_span(category, title),
    };
    let result = f();
    if result.is_err() {
        if let Some(handle) = guard.handle {
            set_error(handle);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::transport::{ReportPayload, TransportError};
    use std::time::Duration;

    lazy_static! {
        /// Serializes the tests that install or depend on the absence of
        /// the global engine.
        static ref GLOBAL_LOCK: Mutex<()> = Mutex::new(());
    }

    /// Collector that swallows everything; these tests inspect the queue
    /// through the engine instead of driving delivery.
    struct NullCollector;

    impl Collector for NullCollector {
        async fn send(&self, _report: &ReportPayload) -> Result<(), TransportError> {
            Ok(())
        }
    }

    fn test_engine(config: AgentConfig) -> (Arc<Instrumenter>, ManualClock) {
        let clock = ManualClock::new();
        let engine = Arc::new(Instrumenter::launch_with(
            AgentConfig {
                // Keep the reporter asleep so the queue is inspectable.
                report_interval: Duration::from_secs(3600),
                high_water_mark: usize::MAX / 2,
                ..config
            },
            NullCollector,
            Arc::new(clock.clone()),
        ));
        (engine, clock)
    }

    fn drain_endpoints(engine: &Arc<Instrumenter>) -> Vec<(String, String, usize)> {
        crate::endpoint::group(engine.shared.queue.drain().into_traces())
            .into_iter()
            .map(|g| (g.key.name, g.key.segments, g.traces.len()))
            .collect()
    }

    #[test]
    fn test_operation_produces_one_trace() {
        let (engine, clock) = test_engine(AgentConfig::default());

        let op = engine.begin_operation("app.rack.request", Some("users/index"));
        clock.advance(Duration::from_millis(5));
        let span = start_span("db.sql.query", Some("SELECT FROM users")).unwrap();
        clock.advance(Duration::from_millis(10));
        finish_span(span);
        end_operation(op, Outcome::success().with_format("json"));

        let endpoints = drain_endpoints(&engine);
        assert_eq!(endpoints, vec![("users/index".to_string(), "json".to_string(), 1)]);
        assert_eq!(engine.misuse_count(), 0);

        engine.shutdown();
    }

    #[test]
    fn test_error_outcome_adds_segment() {
        let (engine, _clock) = test_engine(AgentConfig::default());

        let op = engine.begin_operation("app.worker", Some("MyWorker"));
        end_operation(op, Outcome::failure());

        let endpoints = drain_endpoints(&engine);
        assert_eq!(endpoints, vec![("MyWorker".to_string(), "error".to_string(), 1)]);

        engine.shutdown();
    }

    #[test]
    fn test_instrument_guard_closes_on_panic() {
        let (engine, _clock) = test_engine(AgentConfig::default());

        let op = engine.begin_operation("app.request", Some("boom"));
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            instrument("app.explode", None, || panic!("host failure"));
        }));
        assert!(result.is_err());
        end_operation(op, Outcome::success());

        // The panicked span was closed and its error reached the root.
        let endpoints = drain_endpoints(&engine);
        assert_eq!(endpoints, vec![("boom".to_string(), "error".to_string(), 1)]);

        engine.shutdown();
    }

    #[test]
    fn test_try_instrument_propagates_error_unchanged() {
        let (engine, _clock) = test_engine(AgentConfig::default());

        let op = engine.begin_operation("app.request", None);
        let result: Result<(), &str> =
            try_instrument("app.step", None, || Err("host error"));
        assert_eq!(result, Err("host error"));
        end_operation(op, Outcome::success());

        let endpoints = drain_endpoints(&engine);
        assert_eq!(endpoints[0].1, "error");

        engine.shutdown();
    }

    #[test]
    fn test_unbalanced_finish_recovered() {
        let (engine, _clock) = test_engine(AgentConfig::default());

        let op = engine.begin_operation("app.request", None);
        let outer = start_span("app.outer", None).unwrap();
        let _inner = start_span("app.inner", None).unwrap();

        // Finishing outer force-closes inner: misuse, not a crash.
        finish_span(outer);
        assert_eq!(engine.misuse_count(), 1);

        end_operation(op, Outcome::success());
        assert_eq!(drain_endpoints(&engine).len(), 1);

        engine.shutdown();
    }

    #[test]
    fn test_span_without_operation_is_noop() {
        let _global = GLOBAL_LOCK.lock().unwrap();
        let (engine, _clock) = test_engine(AgentConfig::default());

        // No begin_operation on this thread, and no global install either.
        assert!(start_span("app.orphan", None).is_none());
        // Unknown-handle finish on an empty thread just logs.
        finish_span(SpanHandle {
            operation_seq: 42,
            index: 0,
        });

        assert!(engine.shared.queue.is_empty());
        engine.shutdown();
    }

    #[test]
    fn test_stale_context_discarded_by_cap() {
        let (engine, clock) = test_engine(AgentConfig {
            max_operation_duration: Duration::from_secs(10),
            ..AgentConfig::default()
        });

        let _op = engine.begin_operation("app.request", Some("leaked"));
        clock.advance(Duration::from_secs(11));

        // The next operation on this thread reclaims the leaked context.
        let op = engine.begin_operation("app.request", Some("fresh"));
        assert_eq!(engine.stale_discarded_count(), 1);
        assert_eq!(engine.misuse_count(), 0);

        end_operation(op, Outcome::success());
        let endpoints = drain_endpoints(&engine);
        assert_eq!(endpoints, vec![("fresh".to_string(), String::new(), 1)]);

        engine.shutdown();
    }

    #[test]
    fn test_overlapping_begin_counts_misuse() {
        let (engine, _clock) = test_engine(AgentConfig::default());

        let _first = engine.begin_operation("app.request", Some("first"));
        let second = engine.begin_operation("app.request", Some("second"));
        assert_eq!(engine.misuse_count(), 1);

        end_operation(second, Outcome::success());
        let endpoints = drain_endpoints(&engine);
        assert_eq!(endpoints, vec![("second".to_string(), String::new(), 1)]);

        engine.shutdown();
    }

    #[test]
    fn test_implicit_operation_from_bare_span() {
        let _global = GLOBAL_LOCK.lock().unwrap();
        let (engine, clock) = test_engine(AgentConfig {
            implicit_operations: true,
            ..AgentConfig::default()
        });

        // Implicit operations go through the installed engine.
        assert!(install(Arc::clone(&engine)));

        let span = start_span("app.task", None).unwrap();
        clock.advance(Duration::from_millis(3));
        finish_span(span);

        let endpoints = drain_endpoints(&engine);
        assert_eq!(endpoints, vec![("[anonymous]".to_string(), String::new(), 1)]);

        stop();
    }
}
