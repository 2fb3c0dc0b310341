//! HTTP metric source.
//!
//! Queries a metrics endpoint over plain HTTP/1 and expects a JSON body
//! of the form `{"count": <u64>, "aggregate": <f64>}`. Every request has
//! a bounded timeout so a slow backend cannot stall a bake loop.

use std::time::Duration;

use http_body_util::BodyExt;
use hyper_util::rt::TokioIo;
use tracing::debug;

use gantry_state::MetricSample;

use crate::source::{MetricSource, MetricSourceError, QueryFuture};

/// A `MetricSource` backed by an HTTP endpoint.
pub struct HttpMetricSource {
    /// Backend address (ip:port).
    address: String,
    /// Query path, e.g. `/metrics/window`.
    path: String,
    /// Per-request timeout.
    timeout: Duration,
}

impl HttpMetricSource {
    pub fn new(address: impl Into<String>, path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            path: path.into(),
            timeout,
        }
    }

    async fn fetch(&self, metric_ref: &str, start: u64, end: u64) -> Result<MetricSample, MetricSourceError> {
        let uri = format!(
            "http://{}{}?metric={}&start={}&end={}",
            self.address, self.path, metric_ref, start, end
        );

        let stream = tokio::net::TcpStream::connect(&self.address)
            .await
            .map_err(|e| MetricSourceError::Query(format!("connect {}: {e}", self.address)))?;

        let io = TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| MetricSourceError::Query(format!("handshake: {e}")))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", &self.address)
            .header("user-agent", "gantry-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .map_err(|e| MetricSourceError::Query(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| MetricSourceError::Query(format!("request: {e}")))?;

        if !resp.status().is_success() {
            return Err(MetricSourceError::Query(format!(
                "metric endpoint returned {}",
                resp.status()
            )));
        }

        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| MetricSourceError::Query(format!("body: {e}")))?
            .to_bytes();

        let sample: MetricSample = serde_json::from_slice(&body)
            .map_err(|e| MetricSourceError::Decode(e.to_string()))?;

        debug!(%uri, count = sample.count, aggregate = sample.aggregate, "metric window fetched");
        Ok(sample)
    }
}

impl MetricSource for HttpMetricSource {
    fn query<'a>(&'a self, metric_ref: &'a str, window_start: u64, window_end: u64) -> QueryFuture<'a> {
        Box::pin(async move {
            match tokio::time::timeout(self.timeout, self.fetch(metric_ref, window_start, window_end))
                .await
            {
                Ok(result) => result,
                Err(_) => {
                    debug!(metric = %metric_ref, "metric query timed out");
                    Err(MetricSourceError::Timeout)
                }
            }
        })
    }
}
