//! Forwarding to the media server
//!
//! Plain requests go through a pooled hyper client. HTTP upgrades (the
//! media server's session WebSocket) are tunnelled over a raw TCP
//! connection once the backend answers `101 Switching Protocols`.

use crate::error::{ForwardError, ProxyBody};
use crate::gate::Forwarder;
use async_trait::async_trait;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode, Uri, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

/// Headers that only apply to a single connection
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
];

const UPGRADE_RESPONSE_LIMIT: usize = 16 * 1024;

/// Connection pool settings for the forwarding client
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(hyper::header::UPGRADE);
}

/// Point `req` at `target` (host:port), keeping method, path, query and body
pub fn rewrite_request<B>(req: Request<B>, target: &str) -> Result<Request<B>, ForwardError> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let uri = Uri::try_from(format!("http://{}{}", target, path))
        .map_err(|e| ForwardError::RequestBuild(e.to_string()))?;

    let (mut parts, body) = req.into_parts();
    parts.uri = uri;
    // The pooled client only speaks HTTP/1 to the backend
    parts.version = Version::HTTP_11;
    strip_hop_by_hop(&mut parts.headers);
    let host = HeaderValue::from_str(target).map_err(|e| ForwardError::RequestBuild(e.to_string()))?;
    parts.headers.insert(hyper::header::HOST, host);

    Ok(Request::from_parts(parts, body))
}

/// `Connection: upgrade` together with an `Upgrade` header
pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

/// Raw HTTP/1.1 request used to open the upgraded connection
pub fn build_upgrade_request<B>(req: &Request<B>, target: &str) -> Vec<u8> {
    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let mut request = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            request.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    request.push_str(&format!("host: {}\r\n\r\n", target));

    request.into_bytes()
}

/// Status, headers and the offset where the body (or tunnel data) starts
pub fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>, usize)> {
    let header_end = data.windows(4).position(|w| w == b"\r\n\r\n")? + 4;
    let head = std::str::from_utf8(&data[..header_end]).ok()?;
    let mut lines = head.lines();

    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    let _version = parts.next()?;
    let status = StatusCode::from_u16(parts.next()?.parse().ok()?).ok()?;

    let headers = lines
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
        .collect();

    Some((status, headers, header_end))
}

/// Backend answer to an upgrade request
#[derive(Debug)]
pub struct UpgradeHandshake {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    /// Bytes the backend sent after the response head
    pub early_data: Vec<u8>,
}

/// Write `raw_request` and read until the end of the response head
pub async fn upgrade_handshake<S>(stream: &mut S, raw_request: &[u8]) -> Result<UpgradeHandshake, ForwardError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream
        .write_all(raw_request)
        .await
        .map_err(|e| ForwardError::Upgrade(format!("write: {}", e)))?;

    let mut buf = Vec::with_capacity(4096);
    loop {
        let mut chunk = [0u8; 4096];
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| ForwardError::Upgrade(format!("read: {}", e)))?;
        if n == 0 {
            return Err(ForwardError::Upgrade("backend closed connection".into()));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some((status, headers, head_len)) = parse_upgrade_response(&buf) {
            let early_data = buf.split_off(head_len);
            return Ok(UpgradeHandshake {
                status,
                headers,
                early_data,
            });
        }
        if buf.len() > UPGRADE_RESPONSE_LIMIT {
            return Err(ForwardError::Upgrade("response head too large".into()));
        }
    }
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// Forwards requests to a single `host:port`
pub struct HttpForwarder {
    client: Client<HttpConnector, Incoming>,
    target: String,
    request_timeout: Duration,
}

impl HttpForwarder {
    pub fn new(target: impl Into<String>, pool: PoolConfig, request_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(pool.max_idle_per_host)
            .pool_idle_timeout(pool.idle_timeout)
            .build(connector);

        let target = target.into();
        debug!(
            target = %target,
            max_idle = pool.max_idle_per_host,
            idle_timeout_secs = pool.idle_timeout.as_secs(),
            "Forwarding client initialized"
        );

        Self {
            client,
            target,
            request_timeout,
        }
    }

    async fn forward_upgrade(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>, ForwardError> {
        let upgrade_type = req
            .headers()
            .get(hyper::header::UPGRADE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_lowercase())
            .unwrap_or_else(|| "unknown".to_string());
        debug!(target = %self.target, upgrade_type, "Handling upgrade request");

        let raw_request = build_upgrade_request(&req, &self.target);
        // Connect and handshake share the request timeout; the tunnel itself is unbounded
        let handshake = async {
            let mut backend = TcpStream::connect(&self.target)
                .await
                .map_err(|e| ForwardError::Upgrade(format!("connect: {}", e)))?;
            let handshake = upgrade_handshake(&mut backend, &raw_request).await?;
            Ok::<_, ForwardError>((backend, handshake))
        };
        let (backend, handshake) = tokio::time::timeout(self.request_timeout, handshake)
            .await
            .map_err(|_| {
                warn!(target = %self.target, "Backend did not answer upgrade request in time");
                ForwardError::Timeout(self.request_timeout.as_secs())
            })??;
        let UpgradeHandshake {
            status,
            headers,
            early_data,
        } = handshake;

        if status != StatusCode::SWITCHING_PROTOCOLS {
            warn!(target = %self.target, status = %status, "Backend rejected upgrade request");
            let mut response = Response::builder().status(status);
            for (name, value) in &headers {
                if let Ok(hv) = HeaderValue::from_str(value) {
                    response = response.header(name.as_str(), hv);
                }
            }
            return response
                .body(empty_body())
                .map_err(|e| ForwardError::Upgrade(e.to_string()));
        }

        info!(target = %self.target, upgrade_type, "Upgrade successful");

        let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        for (name, value) in &headers {
            let lower = name.to_lowercase();
            if lower == "content-length" || lower == "transfer-encoding" {
                continue;
            }
            if let Ok(hv) = HeaderValue::from_str(value) {
                response = response.header(name.as_str(), hv);
            }
        }
        let response = response
            .body(empty_body())
            .map_err(|e| ForwardError::Upgrade(e.to_string()))?;

        let target = self.target.clone();
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => tunnel(upgraded, backend, early_data, &target).await,
                Err(e) => error!(target = %target, error = %e, "Failed to upgrade client connection"),
            }
        });

        Ok(response)
    }
}

async fn tunnel(client: Upgraded, mut backend: TcpStream, early_data: Vec<u8>, target: &str) {
    let mut client_io = TokioIo::new(client);
    if !early_data.is_empty() {
        if let Err(e) = client_io.write_all(&early_data).await {
            debug!(target, error = %e, "Upgraded connection closed before early data was delivered");
            return;
        }
    }

    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
        Ok((client_to_backend, backend_to_client)) => {
            debug!(target, client_to_backend, backend_to_client, "Upgraded connection closed normally");
        }
        Err(e) => {
            debug!(target, error = %e, "Upgraded connection closed with error");
        }
    }
}

#[async_trait]
impl Forwarder<Incoming> for HttpForwarder {
    async fn forward(&self, req: Request<Incoming>) -> Result<Response<ProxyBody>, ForwardError> {
        if is_upgrade_request(&req) {
            return self.forward_upgrade(req).await;
        }

        let backend_req = rewrite_request(req, &self.target)?;
        let response = tokio::time::timeout(self.request_timeout, self.client.request(backend_req))
            .await
            .map_err(|_| ForwardError::Timeout(self.request_timeout.as_secs()))??;

        let (mut parts, body) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        Ok(Response::from_parts(parts, body.boxed()))
    }
}
