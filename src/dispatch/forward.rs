//! HTTP reverse-proxy transport.
//!
//! Copies the inbound request to the chosen instance and hands the upstream
//! response back. Connection-level headers are not forwarded in either
//! direction.

use std::net::SocketAddr;

use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, Uri},
    response::IntoResponse,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use url::Url;

use crate::dispatch::ForwardError;
use crate::registry::Instance;

/// Upper bound on a buffered upstream body (cacheable routes).
pub const MAX_BUFFERED_BODY: usize = 8 * 1024 * 1024;

const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");

/// A buffered 2xx answer of a cacheable route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub content_type: Option<HeaderValue>,
    pub body: Bytes,
}

impl CachedResponse {
    /// Cache entry layout: a big-endian `u16` content-type length, the
    /// content type, then the body. A zero length means no content type.
    pub fn encode(&self) -> Bytes {
        let content_type = self
            .content_type
            .as_ref()
            .map(|v| v.as_bytes())
            .filter(|v| v.len() <= u16::MAX as usize)
            .unwrap_or_default();

        let mut buf = BytesMut::with_capacity(2 + content_type.len() + self.body.len());
        buf.put_u16(content_type.len() as u16);
        buf.put_slice(content_type);
        buf.put_slice(&self.body);
        buf.freeze()
    }

    /// Inverse of [`CachedResponse::encode`]. An entry too short for its
    /// header is served as a bare body.
    pub fn decode(raw: Bytes) -> Self {
        let bare = |body: Bytes| Self { content_type: None, body };
        if raw.len() < 2 {
            return bare(raw);
        }

        let mut header = raw.clone();
        let len = header.get_u16() as usize;
        if header.len() < len {
            return bare(raw);
        }
        let content_type = (len > 0)
            .then(|| HeaderValue::from_bytes(&header[..len]).ok())
            .flatten();
        Self {
            content_type,
            body: raw.slice(2 + len..),
        }
    }
}

impl IntoResponse for CachedResponse {
    fn into_response(self) -> axum::response::Response {
        let mut response = (StatusCode::OK, self.body).into_response();
        if let Some(content_type) = self.content_type {
            response.headers_mut().insert(header::CONTENT_TYPE, content_type);
        }
        response
    }
}

/// Pooled HTTP/1.1 client for proxied calls.
#[derive(Debug, Clone)]
pub struct HttpForwarder {
    client: Client<HttpConnector, Body>,
}

impl Default for HttpForwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpForwarder {
    pub fn new() -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        Self {
            client: Client::builder(TokioExecutor::new()).build(connector),
        }
    }

    /// Point `request` at `instance`, preserving its path and query.
    pub fn prepare(
        request: Request<Body>,
        instance: &Instance,
        client_addr: Option<SocketAddr>,
    ) -> Result<Request<Body>, ForwardError> {
        let (mut parts, body) = request.into_parts();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        parts.uri = target_uri(instance, path_and_query)?;

        strip_hop_by_hop(&mut parts.headers);
        if let Some(host) = parts.headers.remove(header::HOST) {
            parts.headers.insert(X_FORWARDED_HOST, host);
        }
        if let Some(addr) = client_addr {
            append_forwarded_for(&mut parts.headers, addr);
        }

        Ok(Request::from_parts(parts, body))
    }

    /// Send a prepared request and return the streamed upstream response.
    pub async fn forward(&self, request: Request<Body>) -> Result<Response<Body>, ForwardError> {
        let authority = request
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_default();

        let response = self.client.request(request).await.map_err(|e| {
            if e.is_connect() {
                ForwardError::ConnectionRefused(authority)
            } else {
                ForwardError::Transport(e.to_string())
            }
        })?;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, Body::new(body)))
    }

    /// Send a prepared request and buffer a 2xx body with its content type.
    /// Other statuses come back as [`ForwardError::Upstream`] so they are
    /// never cached.
    pub async fn fetch_cacheable(&self, request: Request<Body>) -> Result<CachedResponse, ForwardError> {
        let response = self.forward(request).await?;
        let status = response.status();
        let content_type = response.headers().get(header::CONTENT_TYPE).cloned();
        let body = axum::body::to_bytes(response.into_body(), MAX_BUFFERED_BODY)
            .await
            .map_err(|e| ForwardError::Transport(format!("failed to read upstream body: {e}")))?;

        if status.is_success() {
            Ok(CachedResponse { content_type, body })
        } else {
            Err(ForwardError::Upstream {
                status: status.as_u16(),
                body,
            })
        }
    }
}

/// Build the upstream URI for `instance`, whose address is a base URL such as
/// `http://10.0.0.4:8080`.
pub fn target_uri(instance: &Instance, path_and_query: &str) -> Result<Uri, ForwardError> {
    let invalid = |reason: String| ForwardError::InvalidTarget(format!("{}: {reason}", instance.address));

    let base = Url::parse(&instance.address).map_err(|e| invalid(e.to_string()))?;
    if base.scheme() != "http" {
        return Err(invalid(format!("unsupported scheme {}", base.scheme())));
    }
    let host = base
        .host_str()
        .ok_or_else(|| invalid("missing host".to_string()))?;
    let port = base.port_or_known_default().unwrap_or(80);

    Uri::builder()
        .scheme("http")
        .authority(format!("{host}:{port}"))
        .path_and_query(path_and_query)
        .build()
        .map_err(|e| invalid(e.to_string()))
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    // Headers listed in Connection are hop-by-hop too
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, addr: SocketAddr) {
    let ip = addr.ip().to_string();
    let value = match headers.get(&X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {ip}"),
        None => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_path_and_query() {
        let uri = target_uri(&Instance::healthy("http://10.0.0.4:8080"), "/orders/7?full=1").unwrap();
        assert_eq!(uri.to_string(), "http://10.0.0.4:8080/orders/7?full=1");

        let uri = target_uri(&Instance::healthy("http://backend"), "/").unwrap();
        assert_eq!(uri.authority().unwrap().as_str(), "backend:80");
    }

    #[test]
    fn rejects_unusable_addresses() {
        assert!(matches!(
            target_uri(&Instance::healthy("not a url"), "/"),
            Err(ForwardError::InvalidTarget(_))
        ));
        assert!(matches!(
            target_uri(&Instance::healthy("https://secure:443"), "/"),
            Err(ForwardError::InvalidTarget(_))
        ));
    }

    #[test]
    fn prepare_rewrites_headers() {
        let request = Request::builder()
            .uri("/service1/items?page=2")
            .header(header::HOST, "gateway.local")
            .header(header::CONNECTION, "keep-alive, x-session-hop")
            .header("x-session-hop", "1")
            .header("x-forwarded-for", "203.0.113.9")
            .header("x-request-id", "abc")
            .body(Body::empty())
            .unwrap();

        let client: SocketAddr = "198.51.100.2:5000".parse().unwrap();
        let prepared = HttpForwarder::prepare(request, &Instance::healthy("http://127.0.0.1:9001"), Some(client)).unwrap();
        let headers = prepared.headers();

        assert_eq!(prepared.uri().to_string(), "http://127.0.0.1:9001/service1/items?page=2");
        assert!(headers.get(header::CONNECTION).is_none());
        assert!(headers.get("x-session-hop").is_none());
        assert!(headers.get(header::HOST).is_none());
        assert_eq!(headers["x-forwarded-host"], "gateway.local");
        assert_eq!(headers["x-forwarded-for"], "203.0.113.9, 198.51.100.2");
        assert_eq!(headers["x-request-id"], "abc");
    }

    #[test]
    fn cached_response_keeps_content_type() {
        let entry = CachedResponse {
            content_type: Some(HeaderValue::from_static("application/json")),
            body: Bytes::from_static(b"{\"id\":1}"),
        };
        assert_eq!(CachedResponse::decode(entry.encode()), entry);

        let untyped = CachedResponse { content_type: None, body: Bytes::from_static(b"raw") };
        assert_eq!(CachedResponse::decode(untyped.encode()), untyped);

        let short = CachedResponse::decode(Bytes::from_static(b"x"));
        assert_eq!(short.body, Bytes::from_static(b"x"));
        assert!(short.content_type.is_none());
    }

    #[test]
    fn cached_response_restores_header() {
        let response = CachedResponse {
            content_type: Some(HeaderValue::from_static("text/plain; charset=utf-8")),
            body: Bytes::from_static(b"hi"),
        }
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/plain; charset=utf-8");
    }

    #[tokio::test]
    async fn refused_connection_is_classified() {
        // Bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let forwarder = HttpForwarder::new();
        let request = Request::builder()
            .uri(format!("http://{addr}/"))
            .body(Body::empty())
            .unwrap();
        assert_eq!(
            forwarder.forward(request).await.unwrap_err(),
            ForwardError::ConnectionRefused(addr.to_string())
        );
    }
}
