use crate::error::{empty_response, ProxyBody};
use crate::gate::{Forwarder, RequestGate};
use hyper::body::Incoming;
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};
use uuid::Uuid;

/// Liveness endpoint of the gateway itself
pub const PING_PATH: &str = "/ping";

/// Header name for request ID
const X_REQUEST_ID: &str = "x-request-id";
/// Header name for forwarded-for
const X_FORWARDED_FOR: &str = "x-forwarded-for";
/// Header name for forwarded host
const X_FORWARDED_HOST: &str = "x-forwarded-host";
/// Header name for forwarded proto
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// The gateway's HTTP front end
pub struct ProxyServer {
    bind_addr: SocketAddr,
    gate: Arc<RequestGate>,
    forwarder: Arc<dyn Forwarder<Incoming>>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        gate: Arc<RequestGate>,
        forwarder: Arc<dyn Forwarder<Incoming>>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            gate,
            forwarder,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already-bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let gate = Arc::clone(&self.gate);
                            let forwarder = Arc::clone(&self.forwarder);

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, gate, forwarder).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    gate: Arc<RequestGate>,
    forwarder: Arc<dyn Forwarder<Incoming>>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let gate = Arc::clone(&gate);
        let forwarder = Arc::clone(&forwarder);
        async move { handle_request(req, gate, forwarder, addr).await }
    });

    // HTTP/1.1 connections can still use WebSocket upgrades
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Client as reported by an upstream proxy, else the peer address
fn client_of<B>(req: &Request<B>, peer: SocketAddr) -> String {
    req.headers()
        .get(X_FORWARDED_FOR)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| peer.ip().to_string())
}

fn log_request<B>(req: &Request<B>, peer: SocketAddr) {
    let user_agent = req
        .headers()
        .get(hyper::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    info!(
        client = %client_of(req, peer),
        method = %req.method(),
        user_agent,
        path = req.uri().path(),
        "Request"
    );
}

/// Set X-Request-ID and X-Forwarded-* before the request leaves the gateway
pub fn add_proxy_headers<B>(req: &mut Request<B>, peer: SocketAddr) -> String {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let peer_ip = peer.ip().to_string();
    let forwarded_for = match req.headers().get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{}, {}", prior, peer_ip),
        None => peer_ip,
    };
    let headers = req.headers_mut();

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        headers.insert(X_REQUEST_ID, value);
    }
    // Extend the chain from an upstream proxy with our own peer
    if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
        headers.insert(X_FORWARDED_FOR, value);
    }
    if let Some(host) = headers.get(hyper::header::HOST).cloned() {
        headers.insert(X_FORWARDED_HOST, host);
    }
    if !headers.contains_key(X_FORWARDED_PROTO) {
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));
    }

    request_id
}

async fn handle_request(
    mut req: Request<Incoming>,
    gate: Arc<RequestGate>,
    forwarder: Arc<dyn Forwarder<Incoming>>,
    peer: SocketAddr,
) -> Result<Response<ProxyBody>, Infallible> {
    log_request(&req, peer);

    if req.uri().path() == PING_PATH {
        return Ok(empty_response(StatusCode::OK));
    }

    let request_id = add_proxy_headers(&mut req, peer);
    debug!(method = %req.method(), uri = %req.uri(), request_id, "Incoming request");

    Ok(gate.handle(req, forwarder.as_ref()).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> SocketAddr {
        "192.168.1.50:51234".parse().unwrap()
    }

    #[test]
    fn test_proxy_headers_from_peer() {
        let mut req = Request::builder()
            .uri("/web/index.html")
            .header("host", "media.example.com")
            .body(())
            .unwrap();

        let request_id = add_proxy_headers(&mut req, peer());

        let headers = req.headers();
        assert_eq!(headers.get(X_REQUEST_ID).unwrap(), request_id.as_str());
        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "192.168.1.50");
        assert_eq!(headers.get(X_FORWARDED_HOST).unwrap(), "media.example.com");
        assert_eq!(headers.get(X_FORWARDED_PROTO).unwrap(), "http");
    }

    #[test]
    fn test_proxy_headers_extend_upstream_values() {
        let mut req = Request::builder()
            .uri("/")
            .header(X_REQUEST_ID, "req-1")
            .header(X_FORWARDED_FOR, "203.0.113.9")
            .header(X_FORWARDED_PROTO, "https")
            .body(())
            .unwrap();

        let request_id = add_proxy_headers(&mut req, peer());

        assert_eq!(request_id, "req-1");
        assert_eq!(
            req.headers().get(X_FORWARDED_FOR).unwrap(),
            "203.0.113.9, 192.168.1.50"
        );
        assert_eq!(req.headers().get(X_FORWARDED_PROTO).unwrap(), "https");
    }

    #[test]
    fn test_client_falls_back_to_peer() {
        let req = Request::builder().uri("/").body(()).unwrap();
        assert_eq!(client_of(&req, peer()), "192.168.1.50");
    }
}
