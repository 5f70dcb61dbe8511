//! Proxy HTTP server
//!
//! One listener runs every request through the rewriting pipeline:
//! extract the opaque token, authorize the escaped path, rewrite the
//! request for its upstream, and forward it. Health probes are served
//! directly.

pub mod credentials;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::TryStreamExt;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::Authorizer;
use crate::error::Error;

/// Whether a header must not be forwarded across the proxy hop.
///
/// Content length and transfer encoding are re-framed by the forwarding
/// client and the responding server.
fn is_hop_header(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "content-length"
    )
}

/// Shared state of the proxy listener
pub struct ProxyState {
    /// The immutable authorization registry
    pub authorizer: Arc<Authorizer>,
    /// Pooled client used for all upstream requests
    pub http: reqwest::Client,
}

impl ProxyState {
    /// Create the proxy state with a connection pool for upstreams.
    pub fn new(authorizer: Arc<Authorizer>) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| Error::internal(format!("could not build http client: {e}")))?;
        Ok(Self { authorizer, http })
    }
}

/// Build the proxy router.
///
/// `GET /readyz` and `GET /healthz` answer directly; every other request
/// falls through to the rewriting pipeline.
pub fn proxy_router(state: Arc<ProxyState>) -> Router {
    // Non-GET requests to the probe paths still belong to the pipeline
    Router::new()
        .route("/readyz", get(health_handler).fallback(proxy_handler))
        .route("/healthz", get(health_handler).fallback(proxy_handler))
        .fallback(proxy_handler)
        .layer(axum::middleware::from_fn(crate::metrics::track_http))
        .with_state(state)
}

/// Bind the listener and serve until the shutdown token is cancelled.
pub async fn serve(
    addr: SocketAddr,
    state: Arc<ProxyState>,
    shutdown: CancellationToken,
) -> Result<(), Error> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| Error::internal(format!("could not bind {addr}: {e}")))?;
    info!(%addr, "git proxy listening");
    axum::serve(listener, proxy_router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .map_err(|e| Error::internal(format!("proxy server failed: {e}")))
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn proxy_handler(State(state): State<Arc<ProxyState>>, req: Request) -> Response {
    let path = req.uri().path().to_string();
    match run_pipeline(&state, req).await {
        Ok(response) => response,
        Err(err) => {
            match &err {
                Error::CredentialMissing => {
                    debug!(%path, "request without client credential");
                }
                Error::InvalidToken | Error::NotPermitted(_) => {
                    warn!(%path, error = %err, "received unauthorized request");
                }
                _ => {
                    error!(%path, error = %err, "request pipeline failed");
                }
            }
            error_response(&err)
        }
    }
}

async fn run_pipeline(state: &ProxyState, req: Request) -> Result<Response, Error> {
    let token = credentials::token_from_headers(req.headers())?;
    // Match against the escaped path so encoded characters in project and
    // repository names compare literally.
    state.authorizer.is_permitted(req.uri().path(), &token)?;
    let (req, upstream) = state.authorizer.update_request(req, &token).await?;
    info!(path = %req.uri().path(), %upstream, "authenticated request");
    forward(&state.http, &upstream, req).await
}

async fn forward(
    client: &reqwest::Client,
    upstream: &str,
    req: Request,
) -> Result<Response, Error> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{upstream}{path_and_query}");

    let mut builder = client.request(req.method().clone(), &url);
    for (name, value) in req.headers() {
        if name == header::HOST || is_hop_header(name) {
            continue;
        }
        builder = builder.header(name, value);
    }
    if request_has_body(&req) {
        builder = builder.body(reqwest::Body::wrap_stream(req.into_body().into_data_stream()));
    }

    let upstream_response = builder
        .send()
        .await
        .map_err(|e| Error::upstream(format!("could not reach {upstream}: {e}")))?;

    let mut response = Response::builder().status(upstream_response.status());
    for (name, value) in upstream_response.headers() {
        if is_hop_header(name) {
            continue;
        }
        response = response.header(name, value);
    }
    let body_stream = upstream_response.bytes_stream().map_err(std::io::Error::other);
    response
        .body(Body::from_stream(body_stream))
        .map_err(|e| Error::internal(format!("could not build response: {e}")))
}

fn request_has_body(req: &Request) -> bool {
    if req.headers().contains_key(header::TRANSFER_ENCODING) {
        return true;
    }
    req.headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .is_some_and(|len| len > 0)
}

fn error_response(err: &Error) -> Response {
    match err {
        Error::CredentialMissing => (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"Restricted\"")],
            "missing client credentials",
        )
            .into_response(),
        Error::InvalidToken | Error::NotPermitted(_) => {
            (StatusCode::FORBIDDEN, "user not permitted").into_response()
        }
        Error::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream unavailable").into_response(),
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal server error").into_response(),
    }
}
