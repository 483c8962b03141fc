// Tool call records and the scheduler's state machine.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A caller-supplied tool schema, provider-agnostic. Each `ProviderDriver`
/// converts this into its own native descriptor (OpenAI function,
/// Anthropic input_schema, Google functionDeclaration).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A tool call as assembled from streamed fragments, ready to schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRequest {
    /// Unique within a turn; re-emission with the same id is a duplicate.
    pub call_id: String,
    pub name: String,
    pub args: Value,
    pub is_client_initiated: bool,
    pub prompt_id: String,
    pub agent_id: String,
}

/// Lifecycle of a scheduled tool call.
///
/// `awaiting_approval` is only entered when the PolicyEngine returns
/// `ASK_USER`. Terminal states (`Success`, `Error`, `Cancelled`) are
/// immutable once reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallState {
    Scheduled,
    AwaitingApproval,
    Executing,
    Success,
    Error,
    Cancelled,
}

impl ToolCallState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ToolCallState::Success | ToolCallState::Error | ToolCallState::Cancelled
        )
    }
}

/// Outcome carried by a confirmation response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationOutcome {
    ProceedOnce,
    ProceedAlways,
    Cancel,
    ModifyWithEditor,
}

impl ConfirmationOutcome {
    /// `Cancel` and `ModifyWithEditor` map to the `cancelled` terminal
    /// state; the other two proceed to execution.
    pub fn cancels_execution(self) -> bool {
        matches!(
            self,
            ConfirmationOutcome::Cancel | ConfirmationOutcome::ModifyWithEditor
        )
    }
}
