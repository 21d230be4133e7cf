//! Single-host reverse-proxy forwarder
//!
//! Once the dispatcher has authenticated a request and resolved its
//! upstream, the forwarder rewrites the outbound URL onto the upstream's
//! scheme/host, stamps `X-Forwarded-Host` with the inbound host, forces a
//! no-cache policy, and streams the upstream response straight back.

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, Request, Response};
use tracing::debug;
use url::Url;

use crate::error::AuthError;

/// Hop-by-hop headers never copied through in either direction
const HOP_BY_HOP_HEADERS: &[HeaderName] = &[
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// `Cache-Control` forced onto every forwarded request
const FORWARD_CACHE_CONTROL: &str = "no-cache, no-store, no-transform, must-revalidate, max-age=0";

/// Reverse-proxy forwarder over a shared HTTP client
pub struct Forwarder {
    client: reqwest::Client,
}

impl Forwarder {
    /// Build a forwarder with its own connection pool.
    ///
    /// No request timeout is set: long-lived streaming responses (logs,
    /// notebooks, dashboards) are the norm for proxied workloads.
    pub fn new() -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| AuthError::Proxy(e.to_string()))?;
        Ok(Self { client })
    }

    /// Forward `req` to `upstream`, streaming the response body back.
    ///
    /// `inbound_host` is the `Host` the client used, preserved in
    /// `X-Forwarded-Host`; the outbound request's own host is the
    /// upstream's.
    pub async fn forward(
        &self,
        upstream: &str,
        inbound_host: &str,
        req: Request<Body>,
    ) -> Result<Response<Body>, AuthError> {
        let upstream: Url = upstream
            .parse()
            .map_err(|e| AuthError::Proxy(format!("invalid upstream url: {}", e)))?;

        let (parts, body) = req.into_parts();

        let mut url = upstream.clone();
        url.set_path(&join_paths(upstream.path(), parts.uri.path()));
        url.set_query(parts.uri.query());

        let mut headers = filter_headers(&parts.headers);
        headers.remove(header::HOST);
        headers.insert(
            HeaderName::from_static("x-forwarded-host"),
            inbound_host
                .parse()
                .map_err(|_| AuthError::Proxy("invalid inbound host".to_string()))?,
        );
        headers.insert(
            header::CACHE_CONTROL,
            header::HeaderValue::from_static(FORWARD_CACHE_CONTROL),
        );

        debug!(url = %url, method = %parts.method, "Proxying to upstream");

        let upstream_response = self
            .client
            .request(parts.method, url)
            .headers(headers)
            .body(reqwest::Body::wrap_stream(body.into_data_stream()))
            .send()
            .await
            .map_err(|e| AuthError::Proxy(e.to_string()))?;

        let status = upstream_response.status();
        let response_headers = filter_headers(upstream_response.headers());

        let mut response = Response::builder()
            .status(status)
            .body(Body::from_stream(upstream_response.bytes_stream()))
            .map_err(|e| AuthError::Proxy(e.to_string()))?;
        *response.headers_mut() = response_headers;

        Ok(response)
    }
}

/// Copy a header map, dropping hop-by-hop headers and anything the
/// `Connection` header names.
fn filter_headers(headers: &HeaderMap) -> HeaderMap {
    let connection_named: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .collect();

    let mut filtered = HeaderMap::new();
    for (name, value) in headers {
        if HOP_BY_HOP_HEADERS.contains(name) {
            continue;
        }
        if connection_named.iter().any(|n| n == name.as_str()) {
            continue;
        }
        filtered.append(name.clone(), value.clone());
    }
    filtered
}

/// Join the upstream base path with the request path, avoiding duplicate or
/// missing slashes.
fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}
