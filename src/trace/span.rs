//! Span - one timed unit of instrumented work
//!
//! Spans are built mutably inside an ActiveContext between start and
//! finish, then frozen into a Trace when the root span closes. After that
//! they are never touched again.

use std::time::Duration;

/// A finished or in-flight span inside one trace.
///
/// Parents are referenced by index into the owning trace's span sequence,
/// never by pointer; every non-root span's parent index is smaller than
/// its own.
#[derive(Debug, Clone)]
pub struct Span {
    /// Dotted taxonomy category (e.g. "app.inside", "db.sql.query")
    pub category: String,
    /// Optional human-readable title (e.g. "SELECT FROM species")
    pub title: Option<String>,
    /// Offset from the start of the trace
    pub start: Duration,
    /// Time between start and finish; zero while the span is open
    pub duration: Duration,
    /// Index of the parent span, None for the root
    pub parent: Option<usize>,
    /// Set when the protected block failed or `set_error` was called
    pub error: bool,
}

impl Span {
    pub fn new(category: impl Into<String>, title: Option<String>, start: Duration) -> Self {
        Self {
            category: category.into(),
            title,
            start,
            duration: Duration::ZERO,
            parent: None,
            error: false,
        }
    }

    /// End of the span's interval, relative to the trace start.
    pub fn end(&self) -> Duration {
        self.start + self.duration
    }

    /// Whether `other`'s interval is fully contained in this span's.
    pub fn contains(&self, other: &Span) -> bool {
        other.start >= self.start && other.end() <= self.end()
    }
}

/// Opaque reference to an open span, returned by `start_span` and consumed
/// by `finish_span`/`set_error`. The operation sequence number guards
/// against handles leaking across operations on the same thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpanHandle {
    pub(crate) operation_seq: u64,
    pub(crate) index: usize,
}
