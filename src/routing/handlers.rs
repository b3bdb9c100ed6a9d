//! # Routing Handlers Module
//!
//! Handlers behind the admission layer.
//!
//! ## Forwarding
//!
//! Every request not matched by a local route is proxied to the configured
//! upstream. Method, path, query, body and end-to-end headers are passed on;
//! hop-by-hop headers and `Host` are dropped. A request id is attached as
//! `X-Request-Id` when the caller did not send one.
//!
//! ## Error Handling
//!
//! - Unreadable request body (400 `INVALID_REQUEST_BODY`)
//! - Upstream unreachable or failed mid-response (502 `UPSTREAM_UNAVAILABLE`)

use crate::AppState;
use axum::Json;
use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use tokio::time::Instant;
use tracing::{error, info};

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

///////////////////////////////////////////////////////////////////////////////
//****                       Public Functions                            ****//
///////////////////////////////////////////////////////////////////////////////

pub async fn health() -> &'static str {
    "OK"
}

/// Current admission counters and registry sizes
pub async fn admission_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.admission.stats())
}

/// Proxy a request to the upstream service
pub async fn forward_request(State(state): State<AppState>, request: Request) -> Response {
    let start = Instant::now();
    let (parts, body) = request.into_parts();

    let request_id = parts
        .headers
        .get(&X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", state.upstream_url.trim_end_matches('/'), path_and_query);

    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            error!(request_id = %request_id, error = %e, "Failed to read request body");
            return error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_REQUEST_BODY",
                &format!("Failed to read request body: {}", e),
            );
        }
    };

    let mut headers = forwardable_headers(&parts.headers);
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }

    info!(
        request_id = %request_id,
        method = %parts.method,
        upstream = %url,
        "Routing to upstream"
    );

    let upstream = match state
        .http_client
        .request(parts.method.clone(), &url)
        .headers(headers)
        .body(body)
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            error!(
                request_id = %request_id,
                upstream = %url,
                error = %e,
                "Upstream request failed"
            );
            return error_response(
                StatusCode::BAD_GATEWAY,
                "UPSTREAM_UNAVAILABLE",
                &format!("Upstream request failed: {}", e),
            );
        }
    };

    let status = upstream.status();
    let response_headers = forwardable_headers(upstream.headers());
    let response_body = match upstream.bytes().await {
        Ok(body) => body,
        Err(e) => {
            error!(request_id = %request_id, error = %e, "Failed to read upstream response body");
            return error_response(
                StatusCode::BAD_GATEWAY,
                "UPSTREAM_UNAVAILABLE",
                &format!("Failed to read upstream response body: {}", e),
            );
        }
    };

    info!(
        request_id = %request_id,
        response_status = status.as_u16(),
        response_size_bytes = response_body.len(),
        duration_ms = start.elapsed().as_millis() as u64,
        "Request completed"
    );

    let mut response = Response::new(Body::from(response_body));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}

///////////////////////////////////////////////////////////////////////////////
//****                        Private Functions                          ****//
///////////////////////////////////////////////////////////////////////////////

fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// End-to-end headers minus `Host` and `Content-Length`, which the client recomputes
fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        if is_hop_by_hop(name) || name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        forwarded.append(name.clone(), value.clone());
    }
    forwarded
}

fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (status, Json(json!({ "code": code, "message": message }))).into_response()
}

///////////////////////////////////////////////////////////////////////////////
//****                              Tests                                ****//
///////////////////////////////////////////////////////////////////////////////
