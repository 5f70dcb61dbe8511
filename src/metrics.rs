//! Prometheus metrics
//!
//! A process-global registry with request counters and latencies,
//! exposed in text format on the dedicated metrics listener.

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Instant;

use axum::extract::Request;
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::Error;

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static HTTP_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();
static HTTP_REQUEST_DURATION_SECONDS: OnceLock<HistogramVec> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(Registry::new)
}

fn http_requests_total() -> &'static IntCounterVec {
    HTTP_REQUESTS_TOTAL.get_or_init(|| {
        let counter = IntCounterVec::new(
            Opts::new(
                "git_auth_proxy_http_requests_total",
                "Total number of proxied HTTP requests",
            ),
            &["method", "status"],
        )
        .expect("metric can be created");
        registry()
            .register(Box::new(counter.clone()))
            .expect("collector can be registered");
        counter
    })
}

fn http_request_duration_seconds() -> &'static HistogramVec {
    HTTP_REQUEST_DURATION_SECONDS.get_or_init(|| {
        let histogram = HistogramVec::new(
            HistogramOpts::new(
                "git_auth_proxy_http_request_duration_seconds",
                "Proxied HTTP request duration in seconds",
            ),
            &["method", "status"],
        )
        .expect("metric can be created");
        registry()
            .register(Box::new(histogram.clone()))
            .expect("collector can be registered");
        histogram
    })
}

/// Record request count and duration for every proxied request.
pub async fn track_http(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let start = Instant::now();
    let response = next.run(req).await;
    let status = response.status().as_u16().to_string();
    http_requests_total().with_label_values(&[&method, &status]).inc();
    http_request_duration_seconds()
        .with_label_values(&[&method, &status])
        .observe(start.elapsed().as_secs_f64());
    response
}

/// Render all registered metrics in Prometheus text format.
pub fn render() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&registry().gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Build the metrics router.
pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        render(),
    )
}

/// Bind the metrics listener and serve until the shutdown token is cancelled.
pub async fn serve(addr: SocketAddr, shutdown: CancellationToken) -> Result<(), Error> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::internal(format!("could not bind {addr}: {e}")))?;
    info!(%addr, "metrics listener started");
    axum::serve(listener, metrics_router())
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| Error::internal(format!("metrics server failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_requests_show_up_in_rendered_output() {
        http_requests_total().with_label_values(&["GET", "200"]).inc();
        let rendered = render();
        assert!(rendered.contains("git_auth_proxy_http_requests_total"));
    }
}
