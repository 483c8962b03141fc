// ConfirmationBus (spec §4.6): a correlation-id keyed pub/sub that lets a
// UI answer a pending tool-call approval without the scheduler knowing
// anything about how the answer is delivered. Grounded on the teacher's
// `EventEmitter` fan-out pattern in `everruns-core` (broadcast-style,
// subscriber-owned receivers) adapted to a request/response shape with
// `tokio::sync::oneshot` per correlation id instead of a shared broadcast
// channel, since each confirmation has exactly one deciding subscriber.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use llxprt_contracts::{ConfirmationOutcome, ToolCallRequest};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, oneshot, Mutex};
use uuid::Uuid;

use crate::error::{CoreError, Result};

/// Hard ceiling on concurrently pending confirmations (spec §4.6). Past
/// this, `request_confirmation` fails fast rather than growing the wait
/// table unbounded — a stuck UI should not let the scheduler leak memory.
pub const MAX_PENDING_CONFIRMATIONS: usize = 50;

/// Hard ceiling on concurrent bus subscribers (spec §4.6), independent
/// of `MAX_PENDING_CONFIRMATIONS` — this bounds observer growth, not
/// the wait table.
pub const MAX_LISTENERS: usize = 50;

/// Backlog each subscriber can fall behind before missing a message.
/// Sized generously for a single-session bus; a subscriber that falls
/// this far behind has a bigger problem than a dropped notification.
const BROADCAST_CAPACITY: usize = 256;

/// The bus's typed message model (spec §4.6). Every message carries a
/// `correlationId` so a subscriber can line up a response with the
/// request it answers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConfirmationMessage {
    ToolConfirmationRequest {
        correlation_id: String,
        tool_call: ToolCallRequest,
        server_name: Option<String>,
    },
    ToolConfirmationResponse {
        correlation_id: String,
        outcome: ConfirmationOutcome,
        payload: Option<serde_json::Value>,
        confirmed: bool,
    },
    ToolPolicyRejection {
        correlation_id: String,
        tool_call: ToolCallRequest,
        reason: String,
    },
    BucketAuthConfirmationRequest {
        correlation_id: String,
        provider: String,
        bucket: String,
        bucket_index: usize,
        total_buckets: usize,
    },
    BucketAuthConfirmationResponse {
        correlation_id: String,
        provider: String,
        bucket: String,
        bucket_index: usize,
        total_buckets: usize,
        confirmed: bool,
    },
}

#[derive(Debug, Default)]
struct Inner {
    waiters: HashMap<String, oneshot::Sender<ConfirmationOutcome>>,
}

/// Shared by the scheduler (which calls `request_confirmation`/`resolve`)
/// and whatever surface presents the prompt to a human. Cheap to clone;
/// all clones share the same wait table and broadcast channel.
#[derive(Clone)]
pub struct ConfirmationBus {
    inner: Arc<Mutex<Inner>>,
    messages: broadcast::Sender<ConfirmationMessage>,
    listeners: Arc<AtomicUsize>,
}

impl ConfirmationBus {
    pub fn new() -> Self {
        let (messages, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            messages,
            listeners: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Register a new pending confirmation and return the receiver half.
    /// Fails with `PolicyRejection` if the pending-confirmation ceiling is
    /// already at capacity.
    pub async fn register(
        &self,
        correlation_id: impl Into<String>,
    ) -> Result<oneshot::Receiver<ConfirmationOutcome>> {
        let mut inner = self.inner.lock().await;
        if inner.waiters.len() >= MAX_PENDING_CONFIRMATIONS {
            return Err(CoreError::PolicyRejection(format!(
                "too many pending confirmations (max {MAX_PENDING_CONFIRMATIONS})"
            )));
        }
        let (tx, rx) = oneshot::channel();
        inner.waiters.insert(correlation_id.into(), tx);
        Ok(rx)
    }

    /// Register a confirmation wait for `call` and publish its
    /// `TOOL_CONFIRMATION_REQUEST` so any subscriber sees it in publish
    /// order. Returns the correlation id (for matching a later
    /// `resolve`) and the receiver half.
    pub async fn request_confirmation(
        &self,
        call: &ToolCallRequest,
        server_name: Option<String>,
    ) -> Result<(String, oneshot::Receiver<ConfirmationOutcome>)> {
        let correlation_id = Uuid::now_v7().to_string();
        let rx = self.register(&correlation_id).await?;
        self.publish(ConfirmationMessage::ToolConfirmationRequest {
            correlation_id: correlation_id.clone(),
            tool_call: call.clone(),
            server_name,
        });
        Ok((correlation_id, rx))
    }

    /// Deliver a human's decision for a pending correlation id, and
    /// publish the matching `TOOL_CONFIRMATION_RESPONSE`. A resolve for
    /// an unknown or already-resolved id still publishes (an observer
    /// may care) but is a no-op against the wait table: the waiter may
    /// have timed out and been dropped already.
    pub async fn resolve(&self, correlation_id: &str, outcome: ConfirmationOutcome) {
        let mut inner = self.inner.lock().await;
        if let Some(tx) = inner.waiters.remove(correlation_id) {
            let _ = tx.send(outcome);
        }
        drop(inner);
        self.publish(ConfirmationMessage::ToolConfirmationResponse {
            correlation_id: correlation_id.to_string(),
            outcome,
            payload: None,
            confirmed: !outcome.cancels_execution(),
        });
    }

    /// Publish a policy-engine `DENY` so subscribers can surface why a
    /// call never reached execution.
    pub fn reject(&self, call: &ToolCallRequest, reason: impl Into<String>) {
        self.publish(ConfirmationMessage::ToolPolicyRejection {
            correlation_id: Uuid::now_v7().to_string(),
            tool_call: call.clone(),
            reason: reason.into(),
        });
    }

    /// Subscribe to every message published on the bus, in publish
    /// order. Fails once `MAX_LISTENERS` observers are already
    /// subscribed.
    pub fn subscribe(&self) -> Result<broadcast::Receiver<ConfirmationMessage>> {
        if self.listeners.fetch_add(1, Ordering::SeqCst) >= MAX_LISTENERS {
            self.listeners.fetch_sub(1, Ordering::SeqCst);
            return Err(CoreError::PolicyRejection(format!(
                "too many confirmation bus listeners (max {MAX_LISTENERS})"
            )));
        }
        Ok(self.messages.subscribe())
    }

    /// Broadcast one message to every current subscriber. A message with
    /// no subscribers still succeeds — `register`/`resolve` don't depend
    /// on this broadcast, only observers that want a live feed do.
    pub fn publish(&self, message: ConfirmationMessage) {
        let _ = self.messages.send(message);
    }

    /// Number of confirmations currently awaiting a decision.
    pub async fn pending_count(&self) -> usize {
        self.inner.lock().await.waiters.len()
    }
}

impl Default for ConfirmationBus {
    fn default() -> Self {
        Self::new()
    }
}
