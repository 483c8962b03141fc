// ProviderDriver trait (spec §4.3): the seam between the orchestration
// core and a vendor wire protocol. Each provider crate (llxprt-openai,
// llxprt-anthropic, llxprt-google) implements this for its own HTTP
// client. Grounded on the teacher's `LlmProvider` trait in
// `everruns-core/src/openai.rs` — a stateless, clonable handle around a
// `reqwest::Client` that turns a request into a lazily-polled stream.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use llxprt_contracts::ProviderEvent;

use crate::cancellation::CancellationToken;
use crate::error::Result;
use crate::normalizer::NormalizedRequest;

pub type EventStream = Pin<Box<dyn Stream<Item = Result<ProviderEvent>> + Send>>;

/// Per-call execution context a driver needs but which the normalized
/// request itself does not carry: credentials, the target model id, and
/// a token to observe for mid-flight cancellation.
#[derive(Debug, Clone)]
pub struct RuntimeContext {
    pub provider_key: String,
    pub model_id: String,
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub oauth_token: Option<String>,
}

impl RuntimeContext {
    pub fn new(provider_key: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            provider_key: provider_key.into(),
            model_id: model_id.into(),
            api_key: None,
            base_url: None,
            oauth_token: None,
        }
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_oauth_token(mut self, token: impl Into<String>) -> Self {
        self.oauth_token = Some(token.into());
        self
    }

    /// Every field a driver needs for this call, with a human-readable
    /// description of what's missing and how to fix it — feeds directly
    /// into `CoreError::MissingRuntimeContext`.
    pub fn missing_fields(&self, requires_api_key: bool) -> Vec<String> {
        let mut missing = Vec::new();
        if requires_api_key && self.api_key.is_none() && self.oauth_token.is_none() {
            missing.push("api_key".to_string());
        }
        missing
    }
}

/// A provider-specific chat-completion backend. Implementors are
/// stateless and cheap to clone: each call builds its own HTTP request
/// from scratch rather than retaining per-call state on `self`, so the
/// same driver instance is safe to share across concurrent turns and
/// across load-balancer backends.
#[async_trait]
pub trait ProviderDriver: Send + Sync {
    /// A stable identifier for this backend, used in load-balancer
    /// attempt lists and `CoreError::LoadBalancerExhausted`.
    fn name(&self) -> &str;

    /// Begin a chat completion. Returns a lazily-polled event stream;
    /// no network I/O happens before the stream is first polled. The
    /// stream ends after a `Finish` event or the first `Err`.
    async fn generate_chat_completion(
        &self,
        request: NormalizedRequest,
        context: RuntimeContext,
        cancellation: CancellationToken,
    ) -> Result<EventStream>;

    /// Whether this driver requires `RuntimeContext::api_key` (or
    /// `oauth_token`) to be set. Used by the router to fail fast with
    /// `MissingRuntimeContext` before attempting a call.
    fn requires_api_key(&self) -> bool {
        true
    }
}

/// Looks up a `ProviderDriver` by key. Implemented by whatever wires the
/// concrete provider crates together (the CLI binary or embedding
/// application), not by this crate — `llxprt-core` only defines the
/// contract.
pub trait DriverRegistry: Send + Sync {
    fn get(&self, provider_key: &str) -> Option<&(dyn ProviderDriver)>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_reports_api_key_when_neither_credential_is_set() {
        let ctx = RuntimeContext::new("openai", "gpt-4o");
        assert_eq!(ctx.missing_fields(true), vec!["api_key".to_string()]);
    }

    #[test]
    fn missing_fields_is_satisfied_by_oauth_token() {
        let ctx = RuntimeContext::new("anthropic", "claude-opus").with_oauth_token("tok");
        assert!(ctx.missing_fields(true).is_empty());
    }

    #[test]
    fn missing_fields_empty_when_provider_does_not_require_a_key() {
        let ctx = RuntimeContext::new("local", "llama");
        assert!(ctx.missing_fields(false).is_empty());
    }
}
