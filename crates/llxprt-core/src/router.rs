// ProviderRouter (spec §4.2 + §6): given a loaded `Profile`, dispatches
// to either a single driver (standard profile) or a `LoadBalancer`
// across the profile's sub-profiles (loadbalancer profile). Grounded on
// the teacher's driver-selection switch in `everruns-core`'s agent loop
// construction, generalized here to read the policy out of the profile
// rather than out of a hardcoded match.

use std::collections::HashMap;
use std::sync::Arc;

use llxprt_contracts::Profile;

use crate::driver::{DriverRegistry, EventStream, ProviderDriver, RuntimeContext};
use crate::cancellation::CancellationToken;
use crate::error::{CoreError, Result};
use crate::loadbalancer::{BackendError, LoadBalancer, RetryPolicy};
use crate::normalizer::NormalizedRequest;

pub struct ProviderRouter<'a> {
    registry: &'a dyn DriverRegistry,
}

impl<'a> ProviderRouter<'a> {
    pub fn new(registry: &'a dyn DriverRegistry) -> Self {
        Self { registry }
    }

    /// Dispatch one turn. For a standard profile this is a single driver
    /// call with no retry beyond what the driver itself does; for a
    /// loadbalancer profile it runs the full failover/retry loop across
    /// sub-profiles.
    pub async fn dispatch(
        &self,
        profile: &Profile,
        request: NormalizedRequest,
        credentials: &HashMap<String, RuntimeContext>,
        cancellation: CancellationToken,
    ) -> Result<EventStream> {
        if !profile.is_loadbalancer() {
            let driver = self
                .registry
                .get(&profile.provider)
                .ok_or_else(|| CoreError::config(format!("unknown provider: {}", profile.provider)))?;
            let context = credentials
                .get(&profile.provider)
                .cloned()
                .unwrap_or_else(|| RuntimeContext::new(&profile.provider, &profile.model));
            self.check_context(driver, &context)?;
            return driver
                .generate_chat_completion(request, context, cancellation)
                .await;
        }

        let sub_profiles = profile
            .profiles
            .clone()
            .ok_or_else(|| CoreError::config("loadbalancer profile missing sub-profiles"))?;
        let policy = profile
            .policy
            .ok_or_else(|| CoreError::config("loadbalancer profile missing policy"))?;

        let lb = Arc::new(LoadBalancer::new(policy, sub_profiles, RetryPolicy::default()));
        let registry = self.registry;
        let request = Arc::new(request);

        lb.run_with_failover(|backend| {
            let request = request.clone();
            let cancellation = cancellation.clone();
            async move {
                let driver = registry
                    .get(&backend.provider_name)
                    .ok_or_else(|| BackendError::NonRetryable(CoreError::config(format!(
                        "unknown provider: {}",
                        backend.provider_name
                    ))))?;
                let mut context = RuntimeContext::new(&backend.provider_name, &backend.model_id);
                if let Some(base_url) = &backend.base_url {
                    context = context.with_base_url(base_url.clone());
                }
                if let Some(token) = &backend.auth_token {
                    context = context.with_api_key(token.clone());
                }
                driver
                    .generate_chat_completion((*request).clone(), context, cancellation.clone())
                    .await
                    .map_err(|err| classify_for_retry(err))
            }
        })
        .await
    }

    fn check_context(&self, driver: &dyn ProviderDriver, context: &RuntimeContext) -> Result<()> {
        let missing = context.missing_fields(driver.requires_api_key());
        if missing.is_empty() {
            return Ok(());
        }
        Err(CoreError::MissingRuntimeContext {
            provider_key: context.provider_key.clone(),
            missing_fields: missing,
            requirement: "provider driver requires authentication".to_string(),
            remediation: format!(
                "set an API key or OAuth token for provider '{}'",
                context.provider_key
            ),
        })
    }
}

fn classify_for_retry(err: CoreError) -> BackendError {
    match &err {
        CoreError::RateLimit(_) | CoreError::Server(_) | CoreError::Network(_) => {
            BackendError::Retryable(err)
        }
        _ => BackendError::NonRetryable(err),
    }
}
