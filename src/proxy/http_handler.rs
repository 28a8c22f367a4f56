use std::fmt::Display;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Body;
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use tracing::{debug, error, warn};

use crate::config::settings::ServerConfig;
use crate::protection::gate::{GateDecision, RequestGate};

/// Headers never copied to the upstream request.
const SKIP_HEADERS: &[&str] = &[
    "host",
    "x-forwarded-for",
    "x-real-ip",
    "x-forwarded-proto",
    "x-forwarded-host",
    "x-forwarded-port",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "upgrade",
];

/// Gates each inbound request and forwards admitted ones upstream.
pub struct HttpHandler {
    gate: Arc<RequestGate>,
    upstream_addr: String,
    upstream_timeout: Duration,
    upstream_client: HyperClient<HttpConnector, Full<Bytes>>,
}

impl HttpHandler {
    pub fn new(gate: Arc<RequestGate>, config: &ServerConfig) -> Self {
        let upstream_client = HyperClient::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(128)
            .build_http();

        Self {
            gate,
            upstream_addr: config.upstream.clone(),
            upstream_timeout: Duration::from_millis(config.upstream_timeout_ms),
            upstream_client,
        }
    }

    /// Process a single inbound HTTP request end-to-end.
    pub async fn handle<B>(&self, req: Request<B>, peer: IpAddr) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes>,
        B::Error: Display,
    {
        let path = req.uri().path().to_string();
        let client_ip = self.gate.client_address(req.headers(), peer);

        debug!(client_ip = %client_ip, method = %req.method(), path = %path, "Incoming request");

        if self.gate.admit(client_ip, &path).await.is_forbidden() {
            return forbidden();
        }

        match tokio::time::timeout(self.upstream_timeout, self.forward_to_backend(req, client_ip)).await {
            Ok(resp) => resp,
            Err(_) => {
                warn!(upstream = %self.upstream_addr, path = %path, "Upstream request timed out");
                plain(StatusCode::GATEWAY_TIMEOUT, "Gateway Timeout")
            }
        }
    }

    // -----------------------------------------------------------------------
    // Backend forwarding (connection-pooled via hyper client)
    // -----------------------------------------------------------------------

    async fn forward_to_backend<B>(&self, req: Request<B>, client_ip: IpAddr) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes>,
        B::Error: Display,
    {
        let (parts, body) = req.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = format!("http://{}{}", self.upstream_addr, path_and_query);

        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                warn!("Failed to read request body: {}", err);
                return plain(StatusCode::BAD_REQUEST, "Bad Request");
            }
        };

        let mut builder = Request::builder().method(parts.method).uri(&uri);

        if let Some(host) = parts.headers.get("host") {
            builder = builder.header("Host", host);
        }
        builder = builder.header("X-Forwarded-For", client_ip.to_string());
        builder = builder.header("X-Real-IP", client_ip.to_string());

        for (name, value) in parts.headers.iter() {
            if !is_forwardable(name) {
                continue;
            }
            builder = builder.header(name, value);
        }

        let upstream_req = match builder.body(Full::new(body)) {
            Ok(r) => r,
            Err(err) => {
                error!("Failed to build upstream request: {}", err);
                return bad_gateway();
            }
        };

        let upstream_resp = match self.upstream_client.request(upstream_req).await {
            Ok(r) => r,
            Err(err) => {
                error!(upstream = %self.upstream_addr, error = %err, "Backend request failed");
                return bad_gateway();
            }
        };

        let (parts, incoming_body) = upstream_resp.into_parts();
        let body_bytes = match incoming_body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(err) => {
                error!("Failed to read backend response body: {}", err);
                return bad_gateway();
            }
        };

        Response::from_parts(parts, Full::new(body_bytes))
    }
}

fn is_forwardable(name: &HeaderName) -> bool {
    !SKIP_HEADERS.contains(&name.as_str())
}

// ---------------------------------------------------------------------------
// Canned responses
// ---------------------------------------------------------------------------

fn plain(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

/// Return a `502 Bad Gateway` response.
pub fn bad_gateway() -> Response<Full<Bytes>> {
    plain(StatusCode::BAD_GATEWAY, "Bad Gateway")
}

/// Response for denylisted clients.
pub fn forbidden() -> Response<Full<Bytes>> {
    let mut resp = plain(StatusCode::FORBIDDEN, "Forbidden");
    resp.headers_mut()
        .insert("Cache-Control", HeaderValue::from_static("no-store"));
    resp
}
