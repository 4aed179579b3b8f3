//! Forwarding to the OpenAI-compatible backend.
//!
//! Single backend, no retries: whatever the backend answers (including
//! non-2xx) is relayed with its status and body intact. Only failures to get
//! an answer at all are synthesized (502 unreachable, 504 timeout).

use crate::config::{Policy, ProxyConfig};
use crate::error::{GatewayError, ProxyError};
use crate::pipeline::{RequestTrace, Stage};
use crate::streaming::{relay_stream, RelayGuard};
use actix_web::http::header::{HeaderMap as InboundHeaders, HeaderName, HeaderValue};
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use bytes::Bytes;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use std::time::Duration;
use tracing::{debug, error};

/// Request headers never forwarded: hop-by-hop and framing headers (the
/// client recomputes them), plus `accept-encoding` so the backend answers
/// uncompressed and bodies relay byte for byte.
const HOP_BY_HOP_REQUEST_HEADERS: &[&str] = &[
    "host",
    "content-length",
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
    "accept-encoding",
];

/// Response headers the server recomputes for the client connection.
const FRAMING_RESPONSE_HEADERS: &[&str] = &[
    "content-length",
    "transfer-encoding",
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "te",
    "trailer",
    "upgrade",
];

/// Longest backend error body written to logs.
const ERROR_LOG_PREVIEW: usize = 500;

/// True if an inbound request header should reach the backend.
pub fn is_forwarded_request_header(name: &str, policy: &Policy) -> bool {
    !HOP_BY_HOP_REQUEST_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
        && !policy.is_blocked_header(name)
}

/// True if a backend response header should reach the client.
pub fn is_relayed_response_header(name: &str) -> bool {
    !FRAMING_RESPONSE_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("text/event-stream"))
}

/// Client for the configured backend. Cheap to share across requests.
#[derive(Debug, Clone)]
pub struct Gateway {
    client: reqwest::Client,
    base_url: String,
    connect_timeout: Duration,
    request_timeout: Duration,
    stream_idle_timeout: Duration,
}

impl Gateway {
    pub fn new(config: &ProxyConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()
            .map_err(GatewayError::Client)?;

        Ok(Self {
            client,
            base_url: config.backend_url_trimmed(),
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
            stream_idle_timeout: config.stream_idle_timeout(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url_for(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base_url, path_and_query)
    }

    /// Filter inbound headers for forwarding. `json_body` forces
    /// `content-type: application/json` for rewritten bodies.
    pub fn outbound_headers(
        &self,
        inbound: &InboundHeaders,
        policy: &Policy,
        json_body: bool,
    ) -> HeaderMap {
        let mut out = HeaderMap::new();
        for (name, value) in inbound.iter() {
            if !is_forwarded_request_header(name.as_str(), policy) {
                continue;
            }
            if json_body && name.as_str().eq_ignore_ascii_case("content-type") {
                continue;
            }
            if let (Ok(n), Ok(v)) = (
                reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
                reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                out.append(n, v);
            }
        }
        if json_body {
            out.insert(
                CONTENT_TYPE,
                reqwest::header::HeaderValue::from_static("application/json"),
            );
        }
        out
    }

    /// Send a request and wait for the response head.
    pub async fn send(
        &self,
        method: reqwest::Method,
        path_and_query: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, GatewayError> {
        let url = self.url_for(path_and_query);
        debug!(%url, %method, "forwarding to backend");

        let request = self
            .client
            .request(method, &url)
            .headers(headers)
            .body(body)
            .send();

        match tokio::time::timeout(self.request_timeout, request).await {
            Err(_) => Err(GatewayError::Timeout(self.request_timeout)),
            Ok(Err(e)) if e.is_timeout() => Err(GatewayError::Timeout(self.connect_timeout)),
            Ok(Err(e)) => {
                error!(error = %e, %url, "backend request failed");
                Err(GatewayError::Unreachable(e))
            }
            Ok(Ok(response)) => Ok(response),
        }
    }

    /// Relay a backend response to the client.
    ///
    /// Successful responses stream when the client asked for `stream` or the
    /// backend answers with `text/event-stream`; everything else (including
    /// every non-2xx answer) is buffered and relayed verbatim.
    pub async fn relay(
        &self,
        upstream: reqwest::Response,
        stream: bool,
        mut trace: RequestTrace,
    ) -> Result<HttpResponse, ProxyError> {
        trace.advance(Stage::Forwarded);

        let upstream_status = upstream.status();
        let status =
            StatusCode::from_u16(upstream_status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);

        let mut builder = HttpResponse::build(status);
        for (name, value) in upstream.headers() {
            if !is_relayed_response_header(name.as_str()) {
                continue;
            }
            if let (Ok(n), Ok(v)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                builder.append_header((n, v));
            }
        }

        if upstream_status.is_success() && (stream || is_event_stream(upstream.headers())) {
            trace.advance(Stage::Streaming);
            let body = relay_stream(
                upstream.bytes_stream(),
                self.stream_idle_timeout,
                RelayGuard::new(trace),
            );
            return Ok(builder.streaming(body));
        }

        let body = match tokio::time::timeout(self.request_timeout, upstream.bytes()).await {
            Ok(Ok(body)) => body,
            Ok(Err(e)) => {
                let err = ProxyError::from(GatewayError::Read(e));
                trace.fail(&err);
                return Err(err);
            }
            Err(_) => {
                let err = ProxyError::from(GatewayError::Timeout(self.request_timeout));
                trace.fail(&err);
                return Err(err);
            }
        };

        if !upstream_status.is_success() {
            let preview: String = String::from_utf8_lossy(&body)
                .chars()
                .take(ERROR_LOG_PREVIEW)
                .collect();
            error!(
                request_id = %trace.request_id(),
                status = %upstream_status,
                body = %preview,
                "backend error"
            );
        }

        trace.advance(Stage::Complete);
        trace.advance(Stage::Relayed);
        Ok(builder.body(body))
    }
}

/// Convert an actix method to the client's method type.
pub fn outbound_method(method: &actix_web::http::Method) -> reqwest::Method {
    reqwest::Method::from_bytes(method.as_str().as_bytes()).unwrap_or(reqwest::Method::POST)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn request_header_filtering() {
        let policy = Policy::default();
        assert!(is_forwarded_request_header("authorization", &policy));
        assert!(is_forwarded_request_header("x-request-id", &policy));
        assert!(!is_forwarded_request_header("anthropic-beta", &policy));
        assert!(!is_forwarded_request_header("Host", &policy));
        assert!(!is_forwarded_request_header("content-length", &policy));
        assert!(!is_forwarded_request_header("Accept-Encoding", &policy));
    }

    #[test]
    fn response_header_filtering() {
        assert!(is_relayed_response_header("content-type"));
        assert!(is_relayed_response_header("x-litellm-model-id"));
        assert!(!is_relayed_response_header("Transfer-Encoding"));
        assert!(!is_relayed_response_header("content-length"));
    }

    #[test]
    fn outbound_headers_keep_bearer_and_force_json() {
        let gateway = Gateway::new(&ProxyConfig::default()).unwrap();
        let req = TestRequest::post()
            .insert_header(("authorization", "Bearer sk-test"))
            .insert_header(("anthropic-beta", "prompt-caching-2024-07-31"))
            .insert_header(("content-type", "text/plain"))
            .insert_header(("x-trace", "1"))
            .to_http_request();

        let headers = gateway.outbound_headers(req.headers(), &Policy::default(), true);

        assert_eq!(headers.get("authorization").unwrap(), "Bearer sk-test");
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        assert_eq!(headers.get("x-trace").unwrap(), "1");
        assert!(headers.get("anthropic-beta").is_none());
    }

    #[test]
    fn urls_join_without_double_slash() {
        let config = ProxyConfig {
            backend_url: "http://relay:4000/".into(),
            ..ProxyConfig::default()
        };
        let gateway = Gateway::new(&config).unwrap();
        assert_eq!(
            gateway.url_for("/v1/chat/completions"),
            "http://relay:4000/v1/chat/completions"
        );
    }
}
