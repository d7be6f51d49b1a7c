//! Report delivery to the collector
//!
//! The reporter hands a finished batch to a `Collector`. The production
//! implementation POSTs JSON over HTTP; tests inject capturing or failing
//! collectors through the same seam.

use serde::Serialize;

use crate::config::AgentConfig;
use crate::endpoint::EndpointGroup;

/// Error type for report delivery
#[derive(Debug)]
pub enum TransportError {
    /// Connection-level failure (DNS, refused, timeout)
    Http(String),
    /// Collector answered with a non-success status
    Status(u16),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Http(msg) => write!(f, "transport error: {}", msg),
            TransportError::Status(code) => write!(f, "collector returned status {}", code),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        TransportError::Http(e.to_string())
    }
}

/// One span on the wire. Offsets and durations are microseconds relative
/// to the trace start.
#[derive(Serialize, Debug, Clone)]
pub struct SpanPayload {
    pub category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<usize>,
    pub start_us: u64,
    pub duration_us: u64,
    pub error: bool,
}

/// One trace on the wire: spans in creation order, root first.
#[derive(Serialize, Debug, Clone)]
pub struct TracePayload {
    pub operation_id: String,
    pub duration_us: u64,
    pub spans: Vec<SpanPayload>,
}

/// One endpoint bucket on the wire.
#[derive(Serialize, Debug, Clone)]
pub struct EndpointPayload {
    pub name: String,
    pub segments: String,
    pub traces: Vec<TracePayload>,
}

/// The unit handed to the collector in one delivery.
#[derive(Serialize, Debug, Clone)]
pub struct ReportPayload {
    /// Wall-clock time the report was assembled, microseconds since epoch
    pub reported_at_us: u64,
    pub endpoints: Vec<EndpointPayload>,
}

impl ReportPayload {
    pub fn build(groups: &[EndpointGroup]) -> Self {
        let reported_at_us = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);

        let endpoints = groups
            .iter()
            .map(|group| EndpointPayload {
                name: group.key.name.clone(),
                segments: group.key.segments.clone(),
                traces: group
                    .traces
                    .iter()
                    .map(|trace| TracePayload {
                        operation_id: trace.operation_id.to_string(),
                        duration_us: trace.duration.as_micros() as u64,
                        spans: trace
                            .spans
                            .iter()
                            .map(|span| SpanPayload {
                                category: span.category.clone(),
                                title: span.title.clone(),
                                parent: span.parent,
                                start_us: span.start.as_micros() as u64,
                                duration_us: span.duration.as_micros() as u64,
                                error: span.error,
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();

        Self {
            reported_at_us,
            endpoints,
        }
    }

    /// Traces across all endpoints.
    pub fn trace_count(&self) -> usize {
        self.endpoints.iter().map(|e| e.traces.len()).sum()
    }
}

/// Destination for report batches.
pub trait Collector: Send + Sync + 'static {
    fn send(
        &self,
        report: &ReportPayload,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;
}

impl<C: Collector + ?Sized> Collector for std::sync::Arc<C> {
    fn send(
        &self,
        report: &ReportPayload,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send {
        (**self).send(report)
    }
}

/// Production collector: JSON POST to `{base_url}/report`.
#[derive(Clone)]
pub struct HttpCollector {
    client: reqwest::Client,
    endpoint: String,
    auth_token: Option<String>,
}

impl HttpCollector {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: format!("{}/report", config.collector_url.trim_end_matches('/')),
            auth_token: config.auth_token.clone(),
        }
    }
}

impl Collector for HttpCollector {
    async fn send(&self, report: &ReportPayload) -> Result<(), TransportError> {
        let mut request = self.client.post(&self.endpoint).json(report);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status(status.as_u16()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointKey;
    use crate::trace::{Span, Trace};
    use std::time::Duration;
    use uuid::Uuid;

    #[test]
    fn test_report_payload_shape() {
        let mut root = Span::new("app.outer", None, Duration::ZERO);
        root.duration = Duration::from_millis(100);
        let mut inner = Span::new("app.inner", Some("work".to_string()), Duration::from_millis(30));
        inner.duration = Duration::from_millis(40);
        inner.parent = Some(0);

        let key = EndpointKey {
            name: "index".to_string(),
            segments: "json".to_string(),
        };
        let trace = Trace::build(Uuid::now_v7(), key.clone(), vec![root, inner]).unwrap();

        let groups = crate::endpoint::group(vec![trace]);
        let report = ReportPayload::build(&groups);
        assert_eq!(report.trace_count(), 1);

        let value = serde_json::to_value(&report).unwrap();
        let endpoint = &value["endpoints"][0];
        assert_eq!(endpoint["name"], "index");
        assert_eq!(endpoint["segments"], "json");

        let spans = endpoint["traces"][0]["spans"].as_array().unwrap();
        assert_eq!(spans.len(), 2);
        // Root has neither parent nor title keys.
        assert!(spans[0].get("parent").is_none());
        assert!(spans[0].get("title").is_none());
        assert_eq!(spans[0]["start_us"], 0);
        assert_eq!(spans[0]["duration_us"], 100_000);
        assert_eq!(spans[1]["parent"], 0);
        assert_eq!(spans[1]["title"], "work");
        assert_eq!(spans[1]["start_us"], 30_000);
        assert_eq!(spans[1]["duration_us"], 40_000);
        assert_eq!(spans[1]["error"], false);
    }

    #[test]
    fn test_http_collector_endpoint() {
        let config = AgentConfig {
            collector_url: "http://collector.example:9441/".to_string(),
            ..AgentConfig::default()
        };
        let collector = HttpCollector::new(&config);
        assert_eq!(collector.endpoint, "http://collector.example:9441/report");
    }
}
