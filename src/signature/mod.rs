//! # Signature Module
//!
//! Derives a deterministic fingerprint for an inbound request. The fingerprint is
//! the deduplication key used by the coordinator: two requests that are logically
//! the same operation produce the same signature, any difference in the inputs
//! below produces a different one.
//!
//! ## Inputs
//!
//! - HTTP method
//! - URL path
//! - Query pairs, sorted by `(key, value)`
//! - Allow-listed headers, matched case-insensitively and sorted by name
//! - Raw body bytes, for methods that may carry a body. `compute_with_body` hashes
//!   the body whatever the method, for callers that deduplicate GET and friends.
//!
//! ## Body handling
//!
//! Reading the body to hash it consumes the stream, so `compute` buffers it and
//! rebuilds the request with the same bytes before handing it back. Two cases
//! flag the signature as degraded, which falls back to method, path, query and
//! headers:
//!
//! - The body exceeds the buffering limit. The chunks read so far are replayed
//!   ahead of the unread remainder, so the handler still gets the whole body.
//! - The body stream fails. The rebuilt request carries a body that yields the
//!   same read error, so the downstream handler observes the original fault.

use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::header::CONTENT_LENGTH;
use axum::http::{HeaderMap, HeaderName, Method};
use bytes::BytesMut;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::fmt::Display;
use std::io;
use tracing::{debug, warn};

enum BufferedBody {
    Complete(Bytes),
    /// Larger than the signing limit; carries the full body for the handler
    Oversized(Body),
    Failed(SignatureError),
}

/// Default limit on the body bytes buffered for signing (10MB)
pub const DEFAULT_MAX_SIGNATURE_BODY_BYTES: usize = 10 * 1024 * 1024;

// Field separators fed into the hasher so that adjacent fields cannot run into each other.
const FIELD_SEP: &[u8] = &[0x1f];
const RECORD_SEP: &[u8] = &[0x1e];

///////////////////////////////////////////////////////////////////////////////
//****                         Public Structs                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Hex encoded SHA-256 digest of a request
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct RequestSignature(String);

impl RequestSignature {
    pub fn as_str(&self) -> &str {
        &self.0
    }

}

impl Display for RequestSignature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Outcome of signing a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputedSignature {
    pub signature: RequestSignature,
    /// Set when the body could not be read and was left out of the digest
    pub degraded: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("failed to read request body: {0}")]
    BodyRead(String),
}

/// Computes request signatures over a configured header allow-list
#[derive(Debug, Clone)]
pub struct SignatureComputer {
    header_allow_list: Vec<HeaderName>,
    max_body_bytes: usize,
}

impl SignatureComputer {
    pub fn new(header_allow_list: Vec<HeaderName>, max_body_bytes: usize) -> Self {
        // HeaderName is always lowercase, so sorting here gives the case-insensitive order.
        let mut header_allow_list = header_allow_list;
        header_allow_list.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        header_allow_list.dedup();

        Self {
            header_allow_list,
            max_body_bytes,
        }
    }

    /// Sign a request, buffering its body and returning the request with the body restored.
    /// Bodies of methods outside `method_may_carry_body` are left unread.
    pub async fn compute(&self, request: Request) -> (Request, ComputedSignature) {
        let include_body = method_may_carry_body(request.method());
        self.sign(request, include_body).await
    }

    /// Sign a request including its body whatever the method
    pub async fn compute_with_body(&self, request: Request) -> (Request, ComputedSignature) {
        self.sign(request, true).await
    }

    async fn sign(&self, request: Request, include_body: bool) -> (Request, ComputedSignature) {
        let (parts, body) = request.into_parts();

        if !include_body {
            let signature = self.compute_parts(&parts.method, &parts.uri, &parts.headers, None);
            return (
                Request::from_parts(parts, body),
                ComputedSignature {
                    signature,
                    degraded: false,
                },
            );
        }

        let body = match self.read_body(&parts.headers, body).await {
            BufferedBody::Complete(bytes) => {
                let signature =
                    self.compute_parts(&parts.method, &parts.uri, &parts.headers, Some(&bytes));
                return (
                    Request::from_parts(parts, Body::from(bytes)),
                    ComputedSignature {
                        signature,
                        degraded: false,
                    },
                );
            }
            BufferedBody::Oversized(body) => {
                debug!(
                    method = %parts.method,
                    path = %parts.uri.path(),
                    limit = self.max_body_bytes,
                    "Body exceeds signing limit, deduplication will be skipped"
                );
                body
            }
            BufferedBody::Failed(e) => {
                warn!(
                    method = %parts.method,
                    path = %parts.uri.path(),
                    error = %e,
                    "Signing without body, deduplication will be skipped"
                );
                failed_body(e)
            }
        };

        let signature = self.compute_parts(&parts.method, &parts.uri, &parts.headers, None);
        (
            Request::from_parts(parts, body),
            ComputedSignature {
                signature,
                degraded: true,
            },
        )
    }

    /// Hash the signature inputs. Pure and deterministic.
    pub fn compute_parts(
        &self,
        method: &Method,
        uri: &axum::http::Uri,
        headers: &HeaderMap,
        body: Option<&[u8]>,
    ) -> RequestSignature {
        let mut hasher = Sha256::new();

        hasher.update(method.as_str().as_bytes());
        hasher.update(RECORD_SEP);
        hasher.update(uri.path().as_bytes());
        hasher.update(RECORD_SEP);

        for (key, value) in sorted_query_pairs(uri.query()) {
            hasher.update(key.as_bytes());
            hasher.update(FIELD_SEP);
            hasher.update(value.as_bytes());
            hasher.update(FIELD_SEP);
        }
        hasher.update(RECORD_SEP);

        for name in &self.header_allow_list {
            hasher.update(name.as_str().as_bytes());
            let mut values = headers.get_all(name).iter().peekable();
            if values.peek().is_none() {
                // absent and empty must not collide
                hasher.update(b"\x00absent");
            }
            for value in values {
                hasher.update(FIELD_SEP);
                hasher.update(value.as_bytes());
            }
            hasher.update(FIELD_SEP);
        }
        hasher.update(RECORD_SEP);

        if let Some(body) = body {
            hasher.update((body.len() as u64).to_be_bytes());
            hasher.update(body);
        }

        RequestSignature(hex::encode(hasher.finalize()))
    }

    async fn read_body(&self, headers: &HeaderMap, body: Body) -> BufferedBody {
        let declared = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<usize>().ok());
        if declared.is_some_and(|len| len > self.max_body_bytes) {
            return BufferedBody::Oversized(body);
        }

        let mut stream = body.into_data_stream();
        let mut chunks: Vec<Bytes> = Vec::new();
        let mut total = 0usize;

        while let Some(chunk) = stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => return BufferedBody::Failed(SignatureError::BodyRead(e.to_string())),
            };
            total += chunk.len();
            chunks.push(chunk);

            if total > self.max_body_bytes {
                let replay = futures::stream::iter(chunks.into_iter().map(Ok::<Bytes, axum::Error>));
                return BufferedBody::Oversized(Body::from_stream(replay.chain(stream)));
            }
        }

        if chunks.len() == 1 {
            return BufferedBody::Complete(chunks.swap_remove(0));
        }
        let mut buffer = BytesMut::with_capacity(total);
        for chunk in chunks {
            buffer.extend_from_slice(&chunk);
        }
        BufferedBody::Complete(buffer.freeze())
    }
}

impl Default for SignatureComputer {
    fn default() -> Self {
        Self::new(
            default_signature_headers(),
            DEFAULT_MAX_SIGNATURE_BODY_BYTES,
        )
    }
}

///////////////////////////////////////////////////////////////////////////////
//****                       Public Functions                            ****//
///////////////////////////////////////////////////////////////////////////////

/// Headers that take part in the signature unless configured otherwise
pub fn default_signature_headers() -> Vec<HeaderName> {
    vec![
        axum::http::header::CONTENT_TYPE,
        axum::http::header::ACCEPT,
        HeaderName::from_static("x-api-key"),
    ]
}

/// Methods whose body is part of the signature
pub fn method_may_carry_body(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    )
}

///////////////////////////////////////////////////////////////////////////////
//****                        Private Functions                          ****//
///////////////////////////////////////////////////////////////////////////////

fn sorted_query_pairs(query: Option<&str>) -> Vec<(&str, &str)> {
    let mut pairs: Vec<(&str, &str)> = query
        .unwrap_or("")
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
        .collect();
    pairs.sort_unstable();
    pairs
}

/// A body that replays the read error to whoever consumes it next
fn failed_body(error: SignatureError) -> Body {
    let message = error.to_string();
    Body::from_stream(futures::stream::once(async move {
        Err::<Bytes, io::Error>(io::Error::other(message))
    }))
}

///////////////////////////////////////////////////////////////////////////////
//****                              Tests                                ****//
///////////////////////////////////////////////////////////////////////////////
