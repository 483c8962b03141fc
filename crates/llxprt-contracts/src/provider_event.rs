// The event stream a ProviderDriver emits, and the error categories that
// drive LoadBalancer retry/failover decisions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A partial vendor-streamed piece of a tool call, addressed by index.
/// Name uses last-write-wins; args use string concatenation (see
/// ToolCallAssembler, spec §4.4).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFragment {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub args_delta: Option<String>,
}

/// Token usage reported by a completed call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub candidates_tokens: u64,
}

impl Usage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.candidates_tokens
    }
}

/// Events emitted during streaming (spec §4.3): `{ content |
/// tool_call_fragment | usage | finish{reason} | error }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProviderEvent {
    Content { text: String },
    ToolCallFragment(ToolCallFragment),
    Usage(Usage),
    Finish { reason: String },
    Error { message: String, category: Option<ProviderErrorCategory> },
}

/// Error category, used by the LoadBalancer to decide retry/failover
/// behavior (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderErrorCategory {
    /// HTTP 429 — retryable with exponential backoff, triggers bucket
    /// failover.
    RateLimit,
    /// HTTP 402 — instant bucket failover, no retry on this bucket.
    Quota,
    /// HTTP 401/403 — one retry to allow token refresh, then bucket
    /// failover.
    Authentication,
    /// HTTP 5xx — retryable with backoff, no bucket failover.
    Server,
    /// Transient I/O — retryable with backoff, no bucket failover.
    Network,
    /// HTTP 400/404 — not retryable.
    Client,
}

impl ProviderErrorCategory {
    pub fn from_status(status: u16) -> Self {
        match status {
            429 => ProviderErrorCategory::RateLimit,
            402 => ProviderErrorCategory::Quota,
            401 | 403 => ProviderErrorCategory::Authentication,
            500..=599 => ProviderErrorCategory::Server,
            _ => ProviderErrorCategory::Client,
        }
    }

    pub fn is_retryable(self) -> bool {
        !matches!(self, ProviderErrorCategory::Client)
    }

    pub fn triggers_bucket_failover(self) -> bool {
        matches!(
            self,
            ProviderErrorCategory::RateLimit
                | ProviderErrorCategory::Quota
                | ProviderErrorCategory::Authentication
        )
    }
}

/// The lenient-decode fallback for tool-call args the vendor streamed as
/// malformed/partial JSON: wrap the raw string rather than fail.
pub fn lenient_decode_args(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::json!({ "value": raw }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_categorization() {
        assert_eq!(
            ProviderErrorCategory::from_status(429),
            ProviderErrorCategory::RateLimit
        );
        assert_eq!(
            ProviderErrorCategory::from_status(402),
            ProviderErrorCategory::Quota
        );
        assert_eq!(
            ProviderErrorCategory::from_status(401),
            ProviderErrorCategory::Authentication
        );
        assert_eq!(
            ProviderErrorCategory::from_status(503),
            ProviderErrorCategory::Server
        );
        assert_eq!(
            ProviderErrorCategory::from_status(400),
            ProviderErrorCategory::Client
        );
    }

    #[test]
    fn client_errors_are_not_retryable() {
        assert!(!ProviderErrorCategory::Client.is_retryable());
        assert!(ProviderErrorCategory::Server.is_retryable());
    }

    #[test]
    fn lenient_decode_falls_back_to_raw_wrapper() {
        let value = lenient_decode_args("{not json");
        assert_eq!(value, serde_json::json!({ "value": "{not json" }));
        let value = lenient_decode_args(r#"{"a":1}"#);
        assert_eq!(value, serde_json::json!({ "a": 1 }));
    }
}
