// Normalized conversation content.
//
// A `Message` carries a `Speaker` and an ordered sequence of `Block`s. This
// is the shape the RequestNormalizer produces and the ToolCallAssembler /
// SessionRecorder consume; provider drivers translate it to and from their
// own wire format at the edge.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    Human,
    Ai,
    Tool,
}

/// Which raw field a thinking block was promoted from. Needed because
/// OpenAI-compatible reasoning models use `reasoning_content` while
/// Anthropic uses `thinking`; history replay must round-trip through the
/// same field the originating vendor expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingSourceField {
    Thinking,
    ReasoningContent,
}

/// A single content block within a message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Text {
        text: String,
    },
    Thinking {
        thought: String,
        source_field: ThinkingSourceField,
        #[serde(skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    /// A redacted thinking block substituted for a stripped one that
    /// preceded a tool_call — see the thinking-preservation invariant.
    RedactedThinking {
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<String>,
    },
    ToolCall {
        /// Core-owned history id, `hist_tool_<suffix>`.
        id: String,
        name: String,
        parameters: Value,
    },
    ToolResponse {
        call_id: String,
        tool_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Block {
    pub fn text(text: impl Into<String>) -> Self {
        Block::Text { text: text.into() }
    }

    /// Whether this block is a `tool_call`, used by history scans that
    /// enforce the orphaned-thinking and tool_response invariants.
    pub fn is_tool_call(&self) -> bool {
        matches!(self, Block::ToolCall { .. })
    }

    pub fn is_thinking(&self) -> bool {
        matches!(self, Block::Thinking { .. })
    }

    pub fn tool_call_id(&self) -> Option<&str> {
        match self {
            Block::ToolCall { id, .. } => Some(id),
            _ => None,
        }
    }

    pub fn tool_response_call_id(&self) -> Option<&str> {
        match self {
            Block::ToolResponse { call_id, .. } => Some(call_id),
            _ => None,
        }
    }
}

/// A normalized message in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub speaker: Speaker,
    pub blocks: Vec<Block>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(speaker: Speaker, blocks: Vec<Block>) -> Self {
        Self {
            speaker,
            blocks,
            created_at: Utc::now(),
        }
    }

    pub fn human(text: impl Into<String>) -> Self {
        Self::new(Speaker::Human, vec![Block::text(text)])
    }

    /// Every `tool_call` block emitted in this message.
    pub fn tool_calls(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|b| b.is_tool_call())
    }

    /// Whether this message contains a `thinking` block immediately
    /// preceding (in block order) at least one `tool_call` block — the
    /// "orphaned thinking" condition that must survive history trims.
    pub fn has_orphaned_thinking_before_tool_call(&self) -> bool {
        let mut saw_thinking = false;
        for block in &self.blocks {
            match block {
                Block::Thinking { .. } => saw_thinking = true,
                Block::ToolCall { .. } => {
                    if saw_thinking {
                        return true;
                    }
                }
                _ => {}
            }
        }
        false
    }
}
