//! Endpoint classification and per-batch grouping
//!
//! A finished trace is bucketed by (name, segment set). The name comes
//! from the operation names declared by probes; the segments summarize
//! trace outcome/shape ("error", "json", a queue name). Both halves are
//! computed deterministically so the same operation always lands in the
//! same bucket.

use std::collections::BTreeSet;
use std::collections::HashMap;

use crate::trace::Trace;

/// Name used when no probe supplied an operation name. Always sorts ahead
/// of named sub-operations in a combined endpoint name.
pub const ANONYMOUS: &str = "[anonymous]";

/// Segment added when any span in the trace is error-flagged.
pub const ERROR_SEGMENT: &str = "error";

/// Joins multiple sub-operation names and multiple segments.
const JOIN: &str = "+";

/// Aggregation bucket identity: derived name plus the sorted, deduplicated,
/// `+`-joined segment string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub name: String,
    pub segments: String,
}

impl EndpointKey {
    /// Key for a trace with no names and no segments.
    pub fn unnamed() -> Self {
        Self {
            name: ANONYMOUS.to_string(),
            segments: String::new(),
        }
    }
}

impl std::fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.segments.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}<{}>", self.name, self.segments)
        }
    }
}

/// Compute the endpoint bucket for a finished operation.
///
/// `names` are the sub-operation names probes declared (empty entries count
/// as anonymous); `segments` are the probe-declared tags plus the response
/// format; `error` marks a trace containing at least one error span.
pub fn classify<I, S>(names: I, segments: S, error: bool) -> EndpointKey
where
    I: IntoIterator<Item = String>,
    S: IntoIterator<Item = String>,
{
    let mut anonymous = false;
    let mut named = BTreeSet::new();
    for name in names {
        if name.is_empty() || name == ANONYMOUS {
            anonymous = true;
        } else {
            named.insert(name);
        }
    }

    // The anonymous literal goes first, then named entries in sorted order.
    let mut parts = Vec::with_capacity(named.len() + 1);
    if anonymous || named.is_empty() {
        parts.push(ANONYMOUS.to_string());
    }
    parts.extend(named);
    let name = parts.join(JOIN);

    let mut tags: BTreeSet<String> = segments.into_iter().filter(|s| !s.is_empty()).collect();
    if error {
        tags.insert(ERROR_SEGMENT.to_string());
    }
    let segments = tags.into_iter().collect::<Vec<_>>().join(JOIN);

    EndpointKey { name, segments }
}

/// Traces for one endpoint within a report batch, in arrival order.
#[derive(Debug)]
pub struct EndpointGroup {
    pub key: EndpointKey,
    pub traces: Vec<Trace>,
}

/// Group drained traces by endpoint, preserving the arrival order of both
/// the endpoints (first appearance) and the traces within each.
pub fn group(traces: Vec<Trace>) -> Vec<EndpointGroup> {
    let mut groups: Vec<EndpointGroup> = Vec::new();
    let mut index: HashMap<EndpointKey, usize> = HashMap::new();

    for trace in traces {
        match index.get(&trace.endpoint) {
            Some(&at) => groups[at].traces.push(trace),
            None => {
                let key = trace.endpoint.clone();
                index.insert(key.clone(), groups.len());
                groups.push(EndpointGroup {
                    key,
                    traces: vec![trace],
                });
            }
        }
    }

    groups
}
