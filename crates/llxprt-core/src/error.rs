// Error taxonomy for the provider-orchestration core (spec §7).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("profile invalid: {0}")]
    ProfileInvalid(#[from] llxprt_contracts::ProfileError),

    #[error("authentication required: {0}")]
    AuthenticationRequired(String),

    #[error("rate limited: {0}")]
    RateLimit(String),

    #[error("quota exceeded: {0}")]
    Quota(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("client error: {0}")]
    Client(String),

    #[error("tool execution error: {0}")]
    ToolExecution(String),

    #[error("policy rejected execution: {0}")]
    PolicyRejection(String),

    #[error("loop detected: {0}")]
    LoopDetected(String),

    #[error("load balancer exhausted, attempted: {attempted:?}")]
    LoadBalancerExhausted { attempted: Vec<String> },

    #[error(
        "missing runtime context for provider '{provider_key}': missing {missing_fields:?} ({requirement}); {remediation}"
    )]
    MissingRuntimeContext {
        provider_key: String,
        missing_fields: Vec<String>,
        requirement: String,
        remediation: String,
    },

    #[error("scheduler timeout: {0}")]
    SchedulerTimeout(String),

    #[error("cancelled by user")]
    CancelledByUser,

    #[error("recorder inactive")]
    RecorderInactive,

    #[error("validation error: key '{key}' expected {expected}")]
    Validation { key: String, expected: String },

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl CoreError {
    pub fn config(msg: impl Into<String>) -> Self {
        CoreError::Config(msg.into())
    }

    pub fn validation(key: impl Into<String>, expected: impl Into<String>) -> Self {
        CoreError::Validation {
            key: key.into(),
            expected: expected.into(),
        }
    }

    /// Whether this error should ever surface to the caller directly, or
    /// is instead folded into a `tool_response`/retry by its consumer.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CoreError::MissingRuntimeContext { .. } | CoreError::Internal(_)
        )
    }
}

impl From<llxprt_contracts::ProviderErrorCategory> for CoreError {
    fn from(category: llxprt_contracts::ProviderErrorCategory) -> Self {
        use llxprt_contracts::ProviderErrorCategory::*;
        match category {
            RateLimit => CoreError::RateLimit("upstream returned 429".into()),
            Quota => CoreError::Quota("upstream returned 402".into()),
            Authentication => CoreError::AuthenticationRequired("upstream returned 401/403".into()),
            Server => CoreError::Server("upstream returned 5xx".into()),
            Network => CoreError::Network("transient I/O failure".into()),
            Client => CoreError::Client("upstream returned 400/404".into()),
        }
    }
}
