//! Batch Queue - bounded, thread-safe buffer of traces awaiting report
//!
//! Producers are host request threads; the consumer is the background
//! reporter. Inserts are O(1) and never block on a full queue: overflow is
//! resolved by the configured drop/sample policy. Draining swaps the
//! accumulation buffer under a short lock that is never held across I/O.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::config::OverflowPolicy;
use crate::metrics::{QUEUE_DEPTH, TRACES_DROPPED, TRACES_RECORDED};
use crate::trace::Trace;

/// Immutable snapshot of everything accumulated since the last drain.
#[derive(Debug)]
pub struct Batch {
    traces: Vec<Trace>,
}

impl Batch {
    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn into_traces(self) -> Vec<Trace> {
        self.traces
    }
}

struct Inner {
    buf: VecDeque<Trace>,
    /// Overflow events observed, drives the Sample admission cycle
    overflow_seen: u64,
}

/// Bounded accumulation buffer between the instrumenter and the reporter.
pub struct BatchQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    high_water: usize,
    policy: OverflowPolicy,
    /// Nudges the reporter when occupancy crosses the high-water mark
    wakeup: Notify,
    dropped: AtomicU64,
}

impl BatchQueue {
    pub fn new(capacity: usize, high_water: usize, policy: OverflowPolicy) -> Self {
        Self {
            inner: Mutex::new(Inner {
                buf: VecDeque::with_capacity(capacity.min(1024)),
                overflow_seen: 0,
            }),
            capacity: capacity.max(1),
            high_water: high_water.max(1),
            policy,
            wakeup: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append a trace. Returns false when the trace was shed by the
    /// overflow policy. Never blocks beyond the short buffer lock.
    pub fn record(&self, trace: Trace) -> bool {
        let (accepted, overflowed, depth) = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

            if inner.buf.len() < self.capacity {
                inner.buf.push_back(trace);
                (true, false, inner.buf.len())
            } else {
                inner.overflow_seen += 1;
                let accepted = match self.policy {
                    OverflowPolicy::DropOldest => {
                        inner.buf.pop_front();
                        inner.buf.push_back(trace);
                        true
                    }
                    OverflowPolicy::Sample(n) => {
                        let admit = n <= 1 || inner.overflow_seen % u64::from(n) == 1;
                        if admit {
                            inner.buf.pop_front();
                            inner.buf.push_back(trace);
                        }
                        admit
                    }
                };
                (accepted, true, inner.buf.len())
            }
        };

        // Each overflow event loses exactly one trace: either the evicted
        // one or the rejected one.
        if overflowed {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            TRACES_DROPPED.inc();
        }
        if accepted {
            TRACES_RECORDED.inc();
        }
        QUEUE_DEPTH.set(depth as f64);

        if depth >= self.high_water {
            self.wakeup.notify_one();
        }

        accepted
    }

    /// Swap the accumulation buffer for a fresh one and return the old one.
    /// Safe against concurrent `record` calls: a trace lands either in this
    /// batch or the next, never both, never neither.
    pub fn drain(&self) -> Batch {
        let traces = {
            let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut inner.buf)
        };
        QUEUE_DEPTH.set(0.0);

        Batch {
            traces: traces.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total traces lost to overflow since startup.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Awaited by the reporter alongside its interval timer.
    pub fn wakeup(&self) -> &Notify {
        &self.wakeup
    }
}
