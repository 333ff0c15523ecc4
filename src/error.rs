//! Error types and error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Body type for every response the gateway produces
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Failures while sending a wake signal
#[derive(Debug, thiserror::Error)]
pub enum WakeError {
    #[error("invalid MAC address '{address}': {reason}")]
    InvalidMac { address: String, reason: String },
    #[error("invalid broadcast address '{0}'")]
    InvalidBroadcast(String),
    #[error("failed to open wake socket: {0}")]
    Socket(#[source] std::io::Error),
    #[error("failed to send magic packet: {0}")]
    Send(#[source] std::io::Error),
}

/// Failures while talking to the backend's session API
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("session API request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("session API returned {0}")]
    Status(reqwest::StatusCode),
}

/// Failures while forwarding a request to the backend
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("client error: {0}")]
    Client(#[from] hyper_util::client::legacy::Error),
    #[error("request build error: {0}")]
    RequestBuild(String),
    #[error("backend did not respond within {0} seconds")]
    Timeout(u64),
    #[error("upgrade failed: {0}")]
    Upgrade(String),
}

impl ForwardError {
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            ForwardError::Client(_) | ForwardError::Upgrade(_) => ProxyErrorCode::ConnectionFailed,
            ForwardError::RequestBuild(_) => ProxyErrorCode::InternalError,
            ForwardError::Timeout(_) => ProxyErrorCode::RequestTimeout,
        }
    }
}

/// Error codes for gateway errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Backend did not answer the forwarded request in time
    RequestTimeout,
    /// Failed to connect to backend
    ConnectionFailed,
    /// Internal gateway error
    InternalError,
}

impl ProxyErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Value for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

/// Plain-text response with the given status
pub fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header("Content-Type", "text/plain; charset=utf-8")
        .body(Full::new(body.into()).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static header")
}

pub fn empty_response(status: StatusCode) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .body(Empty::<Bytes>::new().map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(ProxyErrorCode::RequestTimeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(ProxyErrorCode::ConnectionFailed.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(ProxyErrorCode::InternalError.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(ProxyErrorCode::ConnectionFailed, "Failed to connect to backend");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"CONNECTION_FAILED\""));
        assert!(json.contains("\"message\":\"Failed to connect to backend\""));
        assert!(json.contains("\"status\":502"));
    }

    #[test]
    fn test_json_error_response_headers() {
        let response = json_error_response(ProxyErrorCode::RequestTimeout, "Request timed out");

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(response.headers().get("Content-Type").unwrap(), "application/json");
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "REQUEST_TIMEOUT");
    }

    #[test]
    fn test_forward_error_codes() {
        assert_eq!(ForwardError::Timeout(30).code(), ProxyErrorCode::RequestTimeout);
        assert_eq!(
            ForwardError::RequestBuild("bad uri".into()).code(),
            ProxyErrorCode::InternalError
        );
        assert_eq!(
            ForwardError::Upgrade("closed".into()).code(),
            ProxyErrorCode::ConnectionFailed
        );
    }

    #[test]
    fn test_wake_error_messages() {
        let err = WakeError::InvalidMac {
            address: "zz:zz".into(),
            reason: "bad digit".into(),
        };
        assert_eq!(err.to_string(), "invalid MAC address 'zz:zz': bad digit");
    }

    #[test]
    fn test_text_and_empty_responses() {
        let response = text_response(StatusCode::OK, "hello");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "text/plain; charset=utf-8"
        );

        let response = empty_response(StatusCode::OK);
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("Content-Type").is_none());
    }
}
