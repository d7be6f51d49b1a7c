//! traceline - in-process tracing and reporting engine
//!
//! Captures nested units of work (spans) from framework probes, assembles
//! them into per-operation traces, groups finished traces into endpoints,
//! and ships them to a remote collector from a background thread - without
//! blocking the host program, and shedding load instead of crashing when
//! the output pipeline backs up.
//!
//! # Modules
//!
//! - `instrumenter` - process-wide entry point and the probe API
//! - `context` - per-operation stack of open spans
//! - `trace` - immutable span-tree data model
//! - `endpoint` - endpoint naming and segment classification
//! - `queue` - bounded trace buffer between probes and the reporter
//! - `reporter` - background drain/send loop with retry and backoff
//! - `transport` - collector seam and HTTP delivery
//! - `config` - agent configuration
//! - `metrics` - Prometheus metrics for the agent's own health
//!
//! # Quick Start
//!
//! ```ignore
//! use traceline::{AgentConfig, Outcome};
//!
//! traceline::start(AgentConfig::from_env());
//!
//! // Inside a request handler (normally driven by a framework probe):
//! let op = traceline::begin_operation("app.rack.request", Some("users/show")).unwrap();
//! traceline::instrument("db.sql.query", Some("SELECT FROM users"), || {
//!     // host work
//! });
//! traceline::end_operation(op, Outcome::success().with_format("json"));
//!
//! traceline::stop();
//! ```

pub mod clock;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod instrumenter;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod reporter;
pub mod trace;
pub mod transport;

// Re-export the probe-facing surface at the crate root for convenience
pub use config::{AgentConfig, OverflowPolicy};
pub use instrumenter::{
    add_segment, begin_operation, end_operation, finish_span, install, instrument, name_operation,
    set_error, start, start_span, stop, try_instrument, Instrumenter, OperationHandle, Outcome,
};
pub use logging::init_logging;
pub use trace::{Span, SpanHandle, Trace};
