//! Provider-orchestration core: request normalization, provider
//! dispatch, load balancing, tool call assembly/scheduling, loop
//! detection, session recording, and profile storage.

pub mod assembler;
pub mod cancellation;
pub mod confirmation;
pub mod driver;
pub mod error;
pub mod loadbalancer;
pub mod loop_detector;
pub mod normalizer;
pub mod profile_store;
pub mod recorder;
pub mod router;
pub mod scheduler;
pub mod tpm_tracker;

pub use assembler::ToolCallAssembler;
pub use cancellation::CancellationToken;
pub use confirmation::{ConfirmationBus, ConfirmationMessage, MAX_LISTENERS, MAX_PENDING_CONFIRMATIONS};
pub use driver::{DriverRegistry, EventStream, ProviderDriver, RuntimeContext};
pub use error::{CoreError, Result};
pub use loadbalancer::{BackendError, LoadBalancer, RetryPolicy};
pub use loop_detector::{LoopDetector, LoopSignal};
pub use normalizer::{NormalizedRequest, NormalizedSettings, ProviderKind, RequestNormalizer, ThinkingConfig};
pub use profile_store::ProfileStore;
pub use recorder::SessionRecorder;
pub use router::ProviderRouter;
pub use scheduler::{
    ApprovalRequirement, NullObserver, NullPolicyCache, PolicyCache, SchedulerObserver, ToolCallOutcome,
    ToolExecutor, ToolScheduler, APPROVAL_TIMEOUT,
};
pub use tpm_tracker::TpmTracker;
