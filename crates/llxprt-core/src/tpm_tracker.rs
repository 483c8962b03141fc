// Per-backend wrapper around `llxprt_contracts::TpmBucket`, keyed by
// backend name, for the `tpm_threshold` load-balancer policy.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::Utc;
use llxprt_contracts::TpmBucket;

fn current_minute_epoch() -> i64 {
    Utc::now().timestamp() / 60
}

#[derive(Default)]
pub struct TpmTracker {
    buckets: Mutex<HashMap<String, TpmBucket>>,
}

impl TpmTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, backend_name: &str, minute_epoch: i64, tokens: u64) {
        let mut buckets = self.buckets.lock().expect("tpm tracker mutex poisoned");
        buckets
            .entry(backend_name.to_string())
            .or_default()
            .add(minute_epoch, tokens);
    }

    pub fn observed_tpm(&self, backend_name: &str) -> f64 {
        let mut buckets = self.buckets.lock().expect("tpm tracker mutex poisoned");
        buckets
            .entry(backend_name.to_string())
            .or_default()
            .observed_tpm(current_minute_epoch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unseen_backend_reports_zero_tpm() {
        let tracker = TpmTracker::new();
        assert_eq!(tracker.observed_tpm("never-used"), 0.0);
    }

    #[test]
    fn recorded_usage_is_observable_for_the_right_backend() {
        let tracker = TpmTracker::new();
        let now = current_minute_epoch();
        tracker.record("a", now, 100);
        assert!(tracker.observed_tpm("a") > 0.0);
        assert_eq!(tracker.observed_tpm("b"), 0.0);
    }
}
