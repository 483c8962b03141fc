// Data model for the llxprt provider-orchestration core.
//
// This crate carries only types: no network I/O, no filesystem access.
// llxprt-core and the provider driver crates (llxprt-openai,
// llxprt-anthropic, llxprt-google) all depend on it so that a
// `llxprt_contracts::ToolCall` built by one driver means the same thing to
// the scheduler that consumes it.

pub mod content;
pub mod journal;
pub mod profile;
pub mod provider_event;
pub mod tool;
pub mod tpm;

pub use content::{Block, Message, Speaker, ThinkingSourceField};
pub use journal::{JournalLine, JournalLineType};
pub use profile::{
    LoadBalancerPolicy, Profile, ProfileError, ProfileType, SubProfile, PROFILE_VERSION,
};
pub use provider_event::{
    lenient_decode_args, ProviderErrorCategory, ProviderEvent, ToolCallFragment, Usage,
};
pub use tool::{
    ConfirmationOutcome, ToolCallRequest, ToolCallState, ToolDefinition,
};
pub use tpm::TpmBucket;
