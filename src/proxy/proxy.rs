// ────────────────────────────────
// src/proxy/proxy.rs
// Forwards one buffered request to a peer and relays its answer.
// ────────────────────────────────

use hyper::body::Bytes;
use hyper::client::HttpConnector;
use hyper::header::{HeaderMap, HeaderValue, CONNECTION};
use hyper::http::{request, response};
use hyper::{Body, Client, Request, Response, StatusCode, Uri};
use std::net::SocketAddr;
use std::time::Duration;

use super::body::{BodyEnd, CountingBody};
use super::peer::Peer;

/// Upper bound on connecting and receiving response headers, and on the
/// silence between two chunks of a response body.
pub const DEFAULT_PROXY_TIMEOUT: Duration = Duration::from_secs(30);

const X_FORWARDED_FOR: &str = "x-forwarded-for";

const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("Host Not Match")]
    HostNotMatch,

    #[error("Peer Not Found")]
    PeerNotFound,

    #[error("Bad Gateway: {0}")]
    BadGateway(String),

    #[error("Gateway Timeout")]
    Timeout,

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Payload Too Large")]
    PayloadTooLarge,
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::HostNotMatch => StatusCode::FORBIDDEN,
            ProxyError::PeerNotFound => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ProxyError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        }
    }

    /// Body written to the client. Transport details stay in the logs.
    pub fn message(&self) -> &'static str {
        match self {
            ProxyError::HostNotMatch => "Host Not Match",
            ProxyError::PeerNotFound => "Peer Not Found",
            ProxyError::BadGateway(_) => "Bad Gateway",
            ProxyError::Timeout => "Gateway Timeout",
            ProxyError::BadRequest(_) => "Bad Request",
            ProxyError::PayloadTooLarge => "Payload Too Large",
        }
    }

    /// Whether the failure is charged to the peer that was contacted.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, ProxyError::BadGateway(_) | ProxyError::Timeout)
    }
}

// Convert ProxyError to Hyper Response for error handling
impl From<ProxyError> for Response<Body> {
    fn from(err: ProxyError) -> Self {
        let mut response = Response::new(Body::from(err.message()));
        *response.status_mut() = err.status_code();
        response
    }
}

/// A peer's response head, with the body still arriving.
#[derive(Debug)]
pub struct ProxiedResponse {
    pub parts: response::Parts,
    pub body: Body,
}

impl ProxiedResponse {
    pub fn status(&self) -> StatusCode {
        self.parts.status
    }

    /// Builds the client response. The body is streamed through and
    /// `on_end` learns how it ended.
    pub fn into_response<F>(mut self, idle_timeout: Duration, on_end: F) -> Response<Body>
    where
        F: FnOnce(BodyEnd) + Send + Sync + 'static,
    {
        strip_hop_by_hop(&mut self.parts.headers);
        let body = CountingBody::new(self.body, idle_timeout, on_end).into_body();
        Response::from_parts(self.parts, body)
    }
}

pub struct Proxy {
    client: Client<HttpConnector>,
    timeout: Duration,
}

impl Proxy {
    pub fn new(timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(timeout));
        connector.set_nodelay(true);

        Self {
            client: Client::builder().build(connector),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn forward(
        &self,
        peer: &Peer,
        parts: &request::Parts,
        body: Bytes,
        client_addr: Option<SocketAddr>,
    ) -> Result<ProxiedResponse, ProxyError> {
        let request = build_upstream_request(peer, parts, body, client_addr)?;

        match tokio::time::timeout(self.timeout, self.client.request(request)).await {
            Ok(Ok(response)) => {
                let (parts, body) = response.into_parts();
                Ok(ProxiedResponse { parts, body })
            }
            Ok(Err(err)) => Err(ProxyError::BadGateway(err.to_string())),
            Err(_) => Err(ProxyError::Timeout),
        }
    }
}

fn build_upstream_request(
    peer: &Peer,
    parts: &request::Parts,
    body: Bytes,
    client_addr: Option<SocketAddr>,
) -> Result<Request<Body>, ProxyError> {
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri: Uri = format!("http://{}{}", peer.address, path).parse().map_err(|e| {
        ProxyError::BadGateway(format!("invalid peer address {}: {}", peer.address, e))
    })?;

    let mut headers = parts.headers.clone();
    strip_hop_by_hop(&mut headers);
    if let Some(addr) = client_addr {
        append_forwarded_for(&mut headers, addr);
    }

    let mut request = Request::new(Body::from(body));
    *request.method_mut() = parts.method.clone();
    *request.uri_mut() = uri;
    *request.headers_mut() = headers;
    Ok(request)
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in HOP_BY_HOP.iter().copied().chain(listed.iter().map(String::as_str)) {
        headers.remove(name);
    }
}

fn append_forwarded_for(headers: &mut HeaderMap, addr: SocketAddr) {
    let ip = addr.ip().to_string();
    let value = match headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{}, {}", existing, ip),
        None => ip,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::HealthPolicy;
    use hyper::Method;

    fn parts_for(uri: &str, headers: &[(&str, &str)]) -> request::Parts {
        let mut builder = Request::builder().method(Method::POST).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn test_error_responses() {
        let response: Response<Body> = ProxyError::PeerNotFound.into();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let response: Response<Body> = ProxyError::HostNotMatch.into();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response: Response<Body> = ProxyError::PayloadTooLarge.into();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        assert!(ProxyError::Timeout.is_transport_failure());
        assert!(ProxyError::BadGateway("refused".into()).is_transport_failure());
        assert!(!ProxyError::PeerNotFound.is_transport_failure());
        assert_eq!(ProxyError::BadGateway("refused".into()).message(), "Bad Gateway");
    }

    #[test]
    fn test_upstream_request_rewrites_target() {
        let peer = Peer::new("10.1.1.1:8080", 1, HealthPolicy::default());
        let parts = parts_for(
            "/api/items?page=2",
            &[
                ("host", "example.com"),
                ("connection", "keep-alive, x-debug"),
                ("x-debug", "1"),
                ("x-forwarded-for", "192.0.2.7"),
                ("content-type", "application/json"),
            ],
        );
        let client: SocketAddr = "203.0.113.9:55000".parse().unwrap();

        let body = Bytes::from_static(b"{}");
        let request = build_upstream_request(&peer, &parts, body, Some(client)).unwrap();

        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.uri(), "http://10.1.1.1:8080/api/items?page=2");
        assert_eq!(request.headers()["host"], "example.com");
        assert_eq!(request.headers()["content-type"], "application/json");
        assert_eq!(request.headers()["x-forwarded-for"], "192.0.2.7, 203.0.113.9");
        assert!(request.headers().get("connection").is_none());
        assert!(request.headers().get("x-debug").is_none());
    }

    #[tokio::test]
    async fn test_forward_to_closed_port_is_bad_gateway() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let peer = Peer::new(format!("127.0.0.1:{}", port), 1, HealthPolicy::default());
        let proxy = Proxy::new(Duration::from_secs(2));

        let result = proxy
            .forward(&peer, &parts_for("/", &[]), Bytes::new(), None)
            .await;
        assert!(matches!(result, Err(ProxyError::BadGateway(_))));
    }

    /// Answers the first request with chunked headers at once, then one
    /// byte per `delay`.
    async fn trickling_peer(delay: Duration) -> SocketAddr {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 2048];
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ntransfer-encoding: chunked\r\n\r\n")
                .await
                .unwrap();
            for byte in ["a", "b", "c", "d"] {
                tokio::time::sleep(delay).await;
                let chunk = format!("1\r\n{}\r\n", byte);
                stream.write_all(chunk.as_bytes()).await.unwrap();
            }
            stream.write_all(b"0\r\n\r\n").await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_timeout_covers_headers_not_body() {
        let addr = trickling_peer(Duration::from_millis(200)).await;
        let peer = Peer::new(addr.to_string(), 1, HealthPolicy::default());
        let proxy = Proxy::new(Duration::from_millis(500));

        let response = proxy
            .forward(&peer, &parts_for("/", &[]), Bytes::new(), None)
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let (tx, rx) = tokio::sync::oneshot::channel();
        let response = response.into_response(proxy.timeout(), move |end| {
            let _ = tx.send(end);
        });
        let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
        assert_eq!(&body[..], b"abcd");
        assert_eq!(rx.await.unwrap(), BodyEnd::Complete(4));
    }

    #[tokio::test]
    async fn test_silent_peer_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(stream);
        });

        let peer = Peer::new(addr.to_string(), 1, HealthPolicy::default());
        let proxy = Proxy::new(Duration::from_millis(200));
        let result = proxy
            .forward(&peer, &parts_for("/", &[]), Bytes::new(), None)
            .await;
        assert!(matches!(result, Err(ProxyError::Timeout)));
    }
}
