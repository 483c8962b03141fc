// ToolScheduler (spec §4.5): drives one tool call through
// scheduled -> awaiting_approval -> executing -> {success,error,cancelled}.
// Grounded on the teacher's tool-execution state machine referenced from
// `everruns-core/src/tool_types.rs` (ToolCallState) plus the confirmation
// wait pattern sketched in the orphaned `loop.rs` reference file, rebuilt
// here against `ConfirmationBus` rather than the teacher's direct
// in-process channel so a UI can sit on either side of a process
// boundary.

use std::sync::Arc;
use std::time::Duration;

use llxprt_contracts::{
    Block, ConfirmationOutcome, Message, Speaker, ToolCallRequest, ToolCallState,
};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::cancellation::CancellationToken;
use crate::confirmation::ConfirmationBus;
use crate::error::{CoreError, Result};

/// How long a call may sit in `awaiting_approval` before the scheduler
/// synthesizes a cancellation (spec §4.5).
pub const APPROVAL_TIMEOUT: Duration = Duration::from_secs(300);

/// A single tool's outcome once the scheduler is done driving it.
#[derive(Debug, Clone)]
pub struct ToolCallOutcome {
    pub call_id: String,
    pub state: ToolCallState,
    pub response: Message,
}

/// Whether a call needs a human confirmation before executing, decided
/// by the PolicyEngine layer above the scheduler (not modeled in this
/// crate — callers pass the verdict in). `Deny` corresponds to the
/// PolicyEngine's `DENY` outcome: the call never reaches `executing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalRequirement {
    AutoApprove,
    RequireConfirmation,
    Deny,
}

/// Observer hooks fired as a call transitions state and as a batch
/// progresses, e.g. to stream `tool_call_state` events to a UI. Passed
/// by value into `run`/`run_schedule` — spec §4.5 calls for a fresh
/// observer per schedule rather than a shared `&mut`, so a caller can
/// cheaply construct one closed over the UI channel for just this
/// invocation.
pub trait SchedulerObserver: Send {
    fn on_state_change(&mut self, call_id: &str, state: ToolCallState) {
        let _ = (call_id, state);
    }

    /// Fires as the batch's outcomes change, with the outcomes collected
    /// so far (spec §4.5 `onToolCallsUpdate`).
    fn on_tool_calls_update(&mut self, batch: &[ToolCallOutcome]) {
        let _ = batch;
    }

    /// Fires exactly once per schedule, with every call's final outcome
    /// (spec §4.5 `onAllToolCallsComplete`).
    fn on_all_tool_calls_complete(&mut self, batch: &[ToolCallOutcome]) {
        let _ = batch;
    }

    /// Editor a `ModifyWithEditor` confirmation should open, if the
    /// observer's surface has one configured.
    fn preferred_editor(&self) -> Option<&str> {
        None
    }
}

/// No-op observer for callers that don't need state notifications.
pub struct NullObserver;
impl SchedulerObserver for NullObserver {}

/// Executes one approved tool call. Implemented by whatever owns the
/// actual tool registry; the scheduler only knows how to drive state.
#[async_trait::async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, call: &ToolCallRequest, cancellation: &CancellationToken) -> Result<serde_json::Value>;
}

/// Records a `ProceedAlways` confirmation so the PolicyEngine stops
/// asking for this tool. Implemented by whatever owns the policy cache;
/// the scheduler only knows to call it.
pub trait PolicyCache: Send + Sync {
    fn allow_always(&self, tool_name: &str);
}

/// No-op cache for callers that don't persist `ProceedAlways` decisions.
pub struct NullPolicyCache;
impl PolicyCache for NullPolicyCache {
    fn allow_always(&self, _tool_name: &str) {}
}

pub struct ToolScheduler {
    confirmations: ConfirmationBus,
    executor: Arc<dyn ToolExecutor>,
    policy_cache: Arc<dyn PolicyCache>,
}

impl ToolScheduler {
    pub fn new(confirmations: ConfirmationBus, executor: Arc<dyn ToolExecutor>) -> Self {
        Self {
            confirmations,
            executor,
            policy_cache: Arc::new(NullPolicyCache),
        }
    }

    pub fn with_policy_cache(mut self, policy_cache: Arc<dyn PolicyCache>) -> Self {
        self.policy_cache = policy_cache;
        self
    }

    /// Drive one call through the full state machine. `observer` receives
    /// every transition; `cancellation` is checked before confirmation,
    /// during the approval wait, and is passed through to the executor.
    pub async fn run(
        &self,
        call: ToolCallRequest,
        approval: ApprovalRequirement,
        cancellation: CancellationToken,
        mut observer: impl SchedulerObserver,
    ) -> ToolCallOutcome {
        self.drive(call, approval, cancellation, &mut observer).await
    }

    /// Drive a whole batch of calls, firing `onToolCallsUpdate` as each
    /// one settles and `onAllToolCallsComplete` exactly once at the end
    /// (spec §4.5). Calls run sequentially against a single scheduler;
    /// callers that want concurrent execution race their own `run_schedule`
    /// calls against independent schedulers.
    pub async fn run_schedule(
        &self,
        calls: Vec<(ToolCallRequest, ApprovalRequirement)>,
        cancellation: CancellationToken,
        mut observer: impl SchedulerObserver,
    ) -> Vec<ToolCallOutcome> {
        let mut batch = Vec::with_capacity(calls.len());
        for (call, approval) in calls {
            let outcome = self.drive(call, approval, cancellation.clone(), &mut observer).await;
            batch.push(outcome);
            observer.on_tool_calls_update(&batch);
        }
        observer.on_all_tool_calls_complete(&batch);
        batch
    }

    async fn drive(
        &self,
        call: ToolCallRequest,
        approval: ApprovalRequirement,
        cancellation: CancellationToken,
        observer: &mut impl SchedulerObserver,
    ) -> ToolCallOutcome {
        observer.on_state_change(&call.call_id, ToolCallState::Scheduled);

        if approval == ApprovalRequirement::Deny {
            observer.on_state_change(&call.call_id, ToolCallState::Error);
            warn!(call_id = %call.call_id, tool = %call.name, "tool call denied by policy");
            self.confirmations.reject(&call, "policy");
            return ToolCallOutcome {
                call_id: call.call_id.clone(),
                state: ToolCallState::Error,
                response: tool_response_message(&call, None, Some("policy".to_string())),
            };
        }

        if cancellation.is_cancelled() {
            return self.cancelled(call, observer);
        }

        if approval == ApprovalRequirement::RequireConfirmation {
            observer.on_state_change(&call.call_id, ToolCallState::AwaitingApproval);
            match self.await_confirmation(&call, &cancellation).await {
                Ok(outcome) if outcome.cancels_execution() => return self.cancelled(call, observer),
                Ok(ConfirmationOutcome::ProceedAlways) => self.policy_cache.allow_always(&call.name),
                Ok(_) => {}
                Err(_) => return self.cancelled(call, observer),
            }
        }

        if cancellation.is_cancelled() {
            return self.cancelled(call, observer);
        }

        observer.on_state_change(&call.call_id, ToolCallState::Executing);
        match self.executor.execute(&call, &cancellation).await {
            Ok(result) => {
                observer.on_state_change(&call.call_id, ToolCallState::Success);
                info!(call_id = %call.call_id, tool = %call.name, "tool call succeeded");
                ToolCallOutcome {
                    call_id: call.call_id.clone(),
                    state: ToolCallState::Success,
                    response: tool_response_message(&call, Some(result), None),
                }
            }
            Err(err) => {
                observer.on_state_change(&call.call_id, ToolCallState::Error);
                warn!(call_id = %call.call_id, tool = %call.name, error = %err, "tool call failed");
                ToolCallOutcome {
                    call_id: call.call_id.clone(),
                    state: ToolCallState::Error,
                    response: tool_response_message(&call, None, Some(err.to_string())),
                }
            }
        }
    }

    async fn await_confirmation(
        &self,
        call: &ToolCallRequest,
        cancellation: &CancellationToken,
    ) -> Result<ConfirmationOutcome> {
        let (_correlation_id, rx) = self.confirmations.request_confirmation(call, None).await?;

        tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(CoreError::CancelledByUser),
            result = timeout(APPROVAL_TIMEOUT, rx) => {
                match result {
                    Ok(Ok(outcome)) => Ok(outcome),
                    Ok(Err(_)) => Err(CoreError::CancelledByUser),
                    Err(_) => Err(CoreError::SchedulerTimeout(format!(
                        "no confirmation decision for {} within {:?}",
                        call.call_id, APPROVAL_TIMEOUT
                    ))),
                }
            }
        }
    }

    fn cancelled(&self, call: ToolCallRequest, observer: &mut impl SchedulerObserver) -> ToolCallOutcome {
        observer.on_state_change(&call.call_id, ToolCallState::Cancelled);
        ToolCallOutcome {
            call_id: call.call_id.clone(),
            state: ToolCallState::Cancelled,
            response: tool_response_message(
                &call,
                Some(serde_json::Value::String("Tool execution cancelled by user".to_string())),
                None,
            ),
        }
    }
}

fn tool_response_message(
    call: &ToolCallRequest,
    result: Option<serde_json::Value>,
    error: Option<String>,
) -> Message {
    Message::new(
        Speaker::Tool,
        vec![Block::ToolResponse {
            call_id: call.call_id.clone(),
            tool_name: call.name.clone(),
            result,
            error,
        }],
    )
}
