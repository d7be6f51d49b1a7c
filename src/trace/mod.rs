//! Trace - the immutable span tree for one logical operation
//!
//! A trace is produced exactly once, when the root span of an operation
//! finishes. It is serialized as a flat sequence of spans in creation
//! order (root first) with parent indices.

pub mod span;

pub use span::{Span, SpanHandle};

use std::time::Duration;

use uuid::Uuid;

use crate::endpoint::EndpointKey;

/// Finished span tree plus the classification computed from it.
#[derive(Debug, Clone)]
pub struct Trace {
    /// Operation id assigned at `begin_operation`
    pub operation_id: Uuid,
    /// Endpoint bucket this trace classified into
    pub endpoint: EndpointKey,
    /// Spans in creation order; index 0 is the root
    pub spans: Vec<Span>,
    /// Duration of the root span
    pub duration: Duration,
}

impl Trace {
    /// Assemble a trace from finished spans. Returns None when the span
    /// sequence violates the tree shape (no spans, a non-zero-index root,
    /// or a parent index pointing forward); callers log and drop those
    /// rather than reporting a malformed tree.
    pub(crate) fn build(operation_id: Uuid, endpoint: EndpointKey, spans: Vec<Span>) -> Option<Self> {
        let root = spans.first()?;
        if root.parent.is_some() {
            return None;
        }

        for (index, span) in spans.iter().enumerate().skip(1) {
            match span.parent {
                Some(parent) if parent < index => {}
                _ => return None,
            }
        }

        let duration = root.duration;
        Some(Self {
            operation_id,
            endpoint,
            spans,
            duration,
        })
    }

    /// The root span. Traces always hold at least one span.
    pub fn root(&self) -> &Span {
        &self.spans[0]
    }

    /// Whether any span carries the error flag.
    pub fn has_error(&self) -> bool {
        self.spans.iter().any(|s| s.error)
    }
}
