//! Admission request handling for the line protocol.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::ratelimit::{Decision, Dispatcher, IdentityKey};

/// One admission request.
///
/// `key` is used verbatim when present; otherwise the identity is derived
/// from `addr`, and failing that from the connection's peer address.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdmissionRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<u64>,
}

impl AdmissionRequest {
    fn identity(&self, peer: SocketAddr) -> IdentityKey {
        match (&self.key, &self.addr) {
            (Some(key), _) => IdentityKey::raw(key.clone()),
            (None, Some(addr)) => IdentityKey::from_addr(addr),
            (None, None) => IdentityKey::from(peer),
        }
    }
}

/// Answer to an [`AdmissionRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdmissionResponse {
    pub admitted: bool,

    /// HTTP status a fronting proxy should use
    pub status: u16,

    /// Omitted when there is no hint or the key is blocked indefinitely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_rate: Option<f64>,
}

impl From<&Decision> for AdmissionResponse {
    fn from(decision: &Decision) -> Self {
        Self {
            admitted: decision.admitted,
            status: decision.status_code(),
            retry_after_ms: decision
                .retry_after
                .and_then(|d| u64::try_from(d.as_millis()).ok()),
            current_rate: decision.current_rate,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

/// Turns request lines into response lines against a shared dispatcher.
pub struct AdmissionService {
    dispatcher: Arc<Dispatcher>,
}

impl AdmissionService {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Decide on a parsed request.
    #[instrument(skip(self, request), fields(peer = %peer))]
    pub async fn admit(&self, request: &AdmissionRequest, peer: SocketAddr) -> AdmissionResponse {
        let key = request.identity(peer);
        let cost = request.cost.unwrap_or(1);
        let decision = self.dispatcher.admit(key.as_str(), cost).await;

        debug!(
            key = %key,
            cost = cost,
            admitted = decision.admitted,
            "Admission decision made"
        );
        AdmissionResponse::from(&decision)
    }

    /// Handle one request line and produce the response line, without the
    /// trailing newline. Malformed input yields an `{"error": ...}` object.
    pub async fn handle_line(&self, line: &str, peer: SocketAddr) -> String {
        let request = match serde_json::from_str::<AdmissionRequest>(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Malformed admission request");
                return encode(&ErrorResponse {
                    error: format!("invalid request: {e}"),
                });
            }
        };

        let response = self.admit(&request, peer).await;
        encode(&response)
    }
}

fn encode<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value)
        .unwrap_or_else(|e| format!(r#"{{"error":"cannot encode response: {e}"}}"#))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Algorithm, FailurePolicy, SlidingLogLimiter};
    use std::time::Duration;

    fn peer() -> SocketAddr {
        "192.168.1.7:40000".parse().unwrap()
    }

    fn service(limit: u64) -> AdmissionService {
        let limiter = Arc::new(SlidingLogLimiter::new(Duration::from_secs(60), limit).unwrap());
        AdmissionService::new(Arc::new(Dispatcher::new(limiter, FailurePolicy::Open)))
    }

    #[tokio::test]
    async fn test_addr_request_admitted() {
        let service = service(1);

        let line = service.handle_line(r#"{"addr":"10.0.0.1:5555"}"#, peer()).await;
        let response: AdmissionResponse = serde_json::from_str(&line).unwrap();

        assert!(response.admitted);
        assert_eq!(response.status, 200);
        assert_eq!(response.current_rate, Some(1.0));
    }

    #[tokio::test]
    async fn test_over_limit_is_429_with_retry_hint() {
        let service = service(1);

        service.handle_line(r#"{"key":"tenant-a"}"#, peer()).await;
        let line = service.handle_line(r#"{"key":"tenant-a"}"#, peer()).await;
        let response: AdmissionResponse = serde_json::from_str(&line).unwrap();

        assert!(!response.admitted);
        assert_eq!(response.status, 429);
        assert!(response.retry_after_ms.unwrap() > 59_000);
    }

    #[tokio::test]
    async fn test_key_wins_over_addr() {
        let service = service(1);

        let first = AdmissionRequest {
            key: Some("tenant-a".to_string()),
            addr: Some("10.0.0.1:1".to_string()),
            cost: None,
        };
        let second = AdmissionRequest {
            key: None,
            addr: Some("10.0.0.1:2".to_string()),
            cost: None,
        };

        assert!(service.admit(&first, peer()).await.admitted);
        // 10.0.0.1 has not been charged yet
        assert!(service.admit(&second, peer()).await.admitted);
    }

    #[tokio::test]
    async fn test_empty_request_uses_peer() {
        let service = service(1);

        assert!(service.handle_line("{}", peer()).await.contains("\"admitted\":true"));
        let request = AdmissionRequest {
            addr: Some("192.168.1.7:1".to_string()),
            ..AdmissionRequest::default()
        };
        assert!(!service.admit(&request, peer()).await.admitted);
    }

    #[tokio::test]
    async fn test_cost_is_charged() {
        let service = service(3);

        let line = service.handle_line(r#"{"key":"k","cost":3}"#, peer()).await;
        assert!(line.contains("\"admitted\":true"));
        let line = service.handle_line(r#"{"key":"k","cost":1}"#, peer()).await;
        assert!(line.contains("\"admitted\":false"));
    }

    #[tokio::test]
    async fn test_malformed_line_returns_error() {
        let service = service(1);

        for line in ["not json", r#"{"cost":"many"}"#, r#"{"user":"x"}"#] {
            let response: serde_json::Value =
                serde_json::from_str(&service.handle_line(line, peer()).await).unwrap();
            assert!(response.get("error").is_some(), "no error for {line}");
        }
    }

    #[tokio::test]
    async fn test_unbounded_block_omits_retry() {
        let config = crate::config::RateLimitingConfig {
            algorithm: Algorithm::SlidingWindow,
            limit: 0,
            ..Default::default()
        };
        let dispatcher = Dispatcher::from_config(&config).unwrap();
        let service = AdmissionService::new(Arc::new(dispatcher));

        let line = service.handle_line(r#"{"key":"k"}"#, peer()).await;
        let response: AdmissionResponse = serde_json::from_str(&line).unwrap();

        assert_eq!(response.status, 429);
        assert_eq!(response.retry_after_ms, None);
    }
}
