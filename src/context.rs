//! Active Context - per-operation stack of open spans
//!
//! One ActiveContext exists per concurrently-executing logical operation
//! and is only ever touched by the execution unit that owns it, so none of
//! its methods take a lock. Time is passed in as clock readings so the
//! context itself stays a pure state machine.
//!
//! The stack invariant: while any span is open, the stack holds its index
//! and the indices of all its open ancestors, top-of-stack innermost.
//! Every exit path of `finish_span` restores this invariant, including
//! out-of-order finishes from abnormal control flow.

use std::time::Duration;

use uuid::Uuid;

use crate::endpoint;
use crate::trace::{Span, SpanHandle, Trace};

/// Result of closing a span, consumed by the instrumenter.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FinishResult {
    /// The span (and possibly spans leaked above it) closed.
    Closed {
        /// Spans above the target that were force-closed to restore the
        /// stack invariant
        abnormal: usize,
        /// True when this pop emptied the stack, i.e. the root finished
        root_closed: bool,
    },
    /// The handle belongs to another operation or was already closed.
    UnknownHandle,
}

/// Mutable per-operation state: the open-span stack plus the metadata the
/// endpoint classification needs once the trace completes.
pub struct ActiveContext {
    operation_id: Uuid,
    operation_seq: u64,
    /// Clock reading when the operation began; span offsets are relative
    opened_at: Duration,
    /// Sub-operation names contributed by probes
    names: Vec<String>,
    /// Probe-declared segments (response format, queue name, ...)
    segments: Vec<String>,
    /// Set by an error outcome at `end_operation`
    error: bool,
    /// All spans created so far, in creation order
    spans: Vec<Span>,
    /// Indices of currently open spans, innermost last
    stack: Vec<usize>,
    /// True when this operation was implicitly begun by a bare span start
    pub(crate) implicit: bool,
}

impl ActiveContext {
    pub(crate) fn new(operation_seq: u64, name: Option<String>, now: Duration) -> Self {
        let mut names = Vec::new();
        if let Some(name) = name {
            names.push(name);
        }

        Self {
            operation_id: Uuid::now_v7(),
            operation_seq,
            opened_at: now,
            names,
            segments: Vec::new(),
            error: false,
            spans: Vec::new(),
            stack: Vec::new(),
            implicit: false,
        }
    }

    pub fn operation_id(&self) -> Uuid {
        self.operation_id
    }

    pub(crate) fn operation_seq(&self) -> u64 {
        self.operation_seq
    }

    /// How long this operation has been open.
    pub(crate) fn age(&self, now: Duration) -> Duration {
        now.saturating_sub(self.opened_at)
    }

    pub(crate) fn open_spans(&self) -> usize {
        self.stack.len()
    }

    /// Contribute a named sub-operation to the endpoint name.
    pub(crate) fn name_operation(&mut self, name: impl Into<String>) {
        self.names.push(name.into());
    }

    /// Contribute a segment tag (e.g. "json") to the endpoint key.
    pub(crate) fn add_segment(&mut self, segment: impl Into<String>) {
        self.segments.push(segment.into());
    }

    pub(crate) fn set_operation_error(&mut self) {
        self.error = true;
    }

    /// Open a span as a child of the current innermost span (or as root).
    pub(crate) fn start_span(
        &mut self,
        category: &str,
        title: Option<&str>,
        now: Duration,
    ) -> SpanHandle {
        let start = now.saturating_sub(self.opened_at);
        let mut span = Span::new(category, title.map(str::to_string), start);
        span.parent = self.stack.last().copied();

        let index = self.spans.len();
        self.spans.push(span);
        self.stack.push(index);

        SpanHandle {
            operation_seq: self.operation_seq,
            index,
        }
    }

    /// Flag a span; the flag propagates to its parent when it closes.
    pub(crate) fn set_error(&mut self, handle: SpanHandle) -> bool {
        if handle.operation_seq != self.operation_seq {
            return false;
        }
        match self.spans.get_mut(handle.index) {
            Some(span) => {
                span.error = true;
                true
            }
            None => false,
        }
    }

    /// Close the span. If it is not the innermost open span, every span
    /// above it is force-closed first so the stack invariant holds on
    /// abnormal control-flow exits.
    pub(crate) fn finish_span(&mut self, handle: SpanHandle, now: Duration) -> FinishResult {
        if handle.operation_seq != self.operation_seq {
            return FinishResult::UnknownHandle;
        }
        let Some(position) = self.stack.iter().position(|&i| i == handle.index) else {
            return FinishResult::UnknownHandle;
        };

        let abnormal = self.stack.len() - position - 1;
        while self.stack.len() > position {
            if let Some(index) = self.stack.pop() {
                self.close_at(index, now);
            }
        }

        FinishResult::Closed {
            abnormal,
            root_closed: self.stack.is_empty(),
        }
    }

    fn close_at(&mut self, index: usize, now: Duration) {
        let offset = now.saturating_sub(self.opened_at);
        let span = &mut self.spans[index];
        span.duration = offset.saturating_sub(span.start);
        let propagate = span.error;
        if propagate {
            if let Some(parent) = span.parent {
                self.spans[parent].error = true;
            }
        }
    }

    /// Consume the context and build the immutable trace. Returns None for
    /// a degenerate context (no spans, or a broken tree shape).
    pub(crate) fn finalize(self) -> Option<Trace> {
        let error = self.error || self.spans.iter().any(|s| s.error);
        let key = endpoint::classify(self.names, self.segments, error);
        Trace::build(self.operation_id, key, self.spans)
    }

    /// Endpoint key this context would classify to right now. The real
    /// computation happens once, in `finalize`.
    #[cfg(test)]
    pub(crate) fn current_key(&self) -> endpoint::EndpointKey {
        let error = self.error || self.spans.iter().any(|s| s.error);
        endpoint::classify(self.names.clone(), self.segments.clone(), error)
    }
}
