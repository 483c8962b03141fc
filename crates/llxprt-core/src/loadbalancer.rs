// LoadBalancer (spec §4.2): picks a backend profile, retries with
// exponential backoff on retryable failures, and fails over to the next
// backend when the active one is unusable. Grounded on
// `durable/src/reliability/retry.rs`'s `RetryPolicy` (max_attempts,
// initial_interval, max_interval, backoff_coefficient, jitter,
// non_retryable_errors) — the same shape, reused here per-backend rather
// than per-workflow-activity.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use llxprt_contracts::{LoadBalancerPolicy, SubProfile};
use rand::Rng;
use tracing::{info, warn};

use crate::error::CoreError;
use crate::tpm_tracker::TpmTracker;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_interval: Duration,
    pub max_interval: Duration,
    pub backoff_coefficient: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_interval: Duration::from_millis(500),
            max_interval: Duration::from_secs(30),
            backoff_coefficient: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Backoff before attempt number `attempt` (1-indexed: the delay
    /// before the *second* attempt is `delay_for(2)`).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.backoff_coefficient.powi((attempt.saturating_sub(1)) as i32);
        let base = self.initial_interval.as_secs_f64() * exp;
        let capped = base.min(self.max_interval.as_secs_f64());
        let with_jitter = if self.jitter {
            let mut rng = rand::thread_rng();
            capped * rng.gen_range(0.5..1.0)
        } else {
            capped
        };
        Duration::from_secs_f64(with_jitter.max(0.0))
    }
}

/// Which failover policy governs how backends are picked and rotated.
pub struct LoadBalancer {
    policy: LoadBalancerPolicy,
    backends: Vec<SubProfile>,
    retry: RetryPolicy,
    tpm_threshold: Option<f64>,
    cursor: AtomicUsize,
    tpm: TpmTracker,
}

impl LoadBalancer {
    pub fn new(policy: LoadBalancerPolicy, backends: Vec<SubProfile>, retry: RetryPolicy) -> Self {
        Self {
            policy,
            backends,
            retry,
            tpm_threshold: None,
            cursor: AtomicUsize::new(0),
            tpm: TpmTracker::new(),
        }
    }

    pub fn with_tpm_threshold(mut self, threshold: f64) -> Self {
        self.tpm_threshold = Some(threshold);
        self
    }

    /// Ordered list of backends to try this turn, starting from whichever
    /// the policy currently favors.
    pub fn attempt_order(&self) -> Vec<&SubProfile> {
        if self.backends.is_empty() {
            return Vec::new();
        }
        match self.policy {
            LoadBalancerPolicy::Roundrobin => {
                let start = self.cursor.fetch_add(1, Ordering::SeqCst) % self.backends.len();
                self.backends
                    .iter()
                    .cycle()
                    .skip(start)
                    .take(self.backends.len())
                    .collect()
            }
            LoadBalancerPolicy::Failover | LoadBalancerPolicy::Bucket => self.backends.iter().collect(),
            LoadBalancerPolicy::TpmThreshold => {
                let threshold = self.tpm_threshold.unwrap_or(f64::MAX);
                let mut ordered: Vec<&SubProfile> = self
                    .backends
                    .iter()
                    .filter(|b| self.tpm.observed_tpm(&b.name) >= threshold)
                    .collect();
                if ordered.is_empty() {
                    ordered = self.backends.iter().collect();
                }
                ordered
            }
        }
    }

    pub fn record_usage(&self, backend_name: &str, minute_epoch: i64, tokens: u64) {
        self.tpm.record(backend_name, minute_epoch, tokens);
    }

    /// Run `attempt` against each backend in turn, with per-backend retry
    /// under `self.retry`, until one succeeds. `attempt` decides itself
    /// whether a given error is retryable by returning it; non-retryable
    /// errors (category `Client`, or any error this policy is configured
    /// to not retry) should be returned wrapped so the caller can match.
    pub async fn run_with_failover<T, F, Fut>(&self, mut attempt: F) -> Result<T, CoreError>
    where
        F: FnMut(&SubProfile) -> Fut,
        Fut: std::future::Future<Output = Result<T, BackendError>>,
    {
        let order = self.attempt_order();
        let mut attempted = Vec::new();

        for backend in order {
            attempted.push(backend.name.clone());
            let mut last_err = None;

            for attempt_no in 1..=self.retry.max_attempts {
                match attempt(backend).await {
                    Ok(value) => return Ok(value),
                    Err(BackendError::NonRetryable(err)) => {
                        warn!(backend = %backend.name, error = %err, "backend failed, non-retryable");
                        last_err = Some(err);
                        break;
                    }
                    Err(BackendError::Retryable(err)) => {
                        warn!(backend = %backend.name, attempt = attempt_no, error = %err, "backend attempt failed");
                        last_err = Some(err);
                        if attempt_no < self.retry.max_attempts {
                            tokio::time::sleep(self.retry.delay_for(attempt_no + 1)).await;
                        }
                    }
                }
            }

            if let Some(err) = last_err {
                if err.triggers_bucket_failover() && matches!(self.policy, LoadBalancerPolicy::Bucket) {
                    info!(backend = %backend.name, "bucket policy: moving to next backend");
                }
            }
        }

        Err(CoreError::LoadBalancerExhausted { attempted })
    }
}

#[derive(Debug)]
pub enum BackendError {
    Retryable(CoreError),
    NonRetryable(CoreError),
}

trait TriggersBucketFailover {
    fn triggers_bucket_failover(&self) -> bool;
}

impl TriggersBucketFailover for CoreError {
    fn triggers_bucket_failover(&self) -> bool {
        matches!(
            self,
            CoreError::RateLimit(_) | CoreError::Quota(_) | CoreError::AuthenticationRequired(_)
        )
    }
}
