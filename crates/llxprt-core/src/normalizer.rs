// RequestNormalizer (spec §4.1).
//
// Accepts the caller's message plus prior history and produces a
// `NormalizedRequest`. Alias resolution, setting separation, and
// provider-specific filtering happen here; converting the normalized,
// still-generic `ToolDefinition` list into a vendor's native tool-call
// descriptor is left to the `ProviderDriver` that ends up consuming the
// request, since it alone owns the wire types (mirrors the teacher's
// `OpenAIProtocolLlmProvider::convert_tools`, which lives with the driver,
// not with a shared normalizer).

use std::collections::HashMap;
use std::sync::OnceLock;

use llxprt_contracts::{Block, Message, ThinkingSourceField, ToolDefinition};
use serde_json::Value;

use crate::error::{CoreError, Result};

/// Which vendor wire protocol the normalized request targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Google,
    Custom,
}

/// Keys that belong to provider configuration, not to any setting bucket.
/// Filtered out of every bucket during normalization.
const PROVIDER_CONFIG_KEYS: &[&str] = &["apiKey", "baseUrl", "model", "toolFormat"];

/// Every accepted spelling, normalized to its canonical key.
fn alias_table() -> &'static HashMap<&'static str, &'static str> {
    static TABLE: OnceLock<HashMap<&'static str, &'static str>> = OnceLock::new();
    TABLE.get_or_init(|| {
        HashMap::from([
            ("max-tokens", "max_tokens"),
            ("max_tokens", "max_tokens"),
            ("maxTokens", "max_tokens"),
            ("api-key", "apiKey"),
            ("apiKey", "apiKey"),
            ("api_key", "apiKey"),
            ("disabled-tools", "tools.disabled"),
            ("disabled_tools", "tools.disabled"),
            ("tools.disabled", "tools.disabled"),
            ("base-url", "baseUrl"),
            ("base_url", "baseUrl"),
            ("baseUrl", "baseUrl"),
            ("tool-format", "toolFormat"),
            ("tool_format", "toolFormat"),
            ("toolFormat", "toolFormat"),
            ("temperature", "temperature"),
            ("top-p", "top_p"),
            ("top_p", "top_p"),
            ("topP", "top_p"),
        ])
    })
}

/// Normalize one setting key to its canonical spelling. Idempotent:
/// `normalize_alias(normalize_alias(k)) == normalize_alias(k)`.
pub fn normalize_alias(key: &str) -> String {
    alias_table()
        .get(key)
        .map(|canonical| canonical.to_string())
        .unwrap_or_else(|| key.to_string())
}

/// Which of the four buckets a (already-aliased) key lands in.
/// Provider-config keys are filtered out before this matters; everything
/// else defaults to `modelParams` (pass-through to the API).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SettingBucket {
    Cli,
    ModelParams,
    ModelBehavior,
    CustomHeader,
}

fn classify(key: &str) -> SettingBucket {
    match key {
        "tools.disabled" | "toolFormat" => SettingBucket::Cli,
        "reasoning" | "thinking" | "strip_thinking" => SettingBucket::ModelBehavior,
        k if k.starts_with("header.") || k.starts_with("customHeaders.") => {
            SettingBucket::CustomHeader
        }
        _ => SettingBucket::ModelParams,
    }
}

#[derive(Debug, Clone, Default)]
pub struct NormalizedSettings {
    pub cli_settings: HashMap<String, Value>,
    pub model_params: HashMap<String, Value>,
    pub model_behavior: HashMap<String, Value>,
    pub custom_headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy)]
pub struct ThinkingConfig {
    pub budget_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct NormalizedRequest {
    pub contents: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub provider_options: NormalizedSettings,
    pub agent_id: String,
    pub prompt_id: String,
    pub thinking: Option<ThinkingConfig>,
}

/// Per-provider rejected parameters, applied after alias resolution and
/// before a setting lands in a bucket.
fn provider_rejects(target: ProviderKind, canonical_key: &str) -> bool {
    match target {
        // Open Question #1: normalize on always dropping `seed` for
        // Anthropic, regardless of how it arrived.
        ProviderKind::Anthropic => canonical_key == "seed",
        _ => false,
    }
}

pub struct RequestNormalizer;

impl RequestNormalizer {
    pub fn new() -> Self {
        Self
    }

    /// Split raw ephemeral settings into the four buckets, applying alias
    /// resolution and provider-specific filtering along the way.
    pub fn normalize_settings(
        &self,
        target: ProviderKind,
        ephemeral_settings: &HashMap<String, Value>,
    ) -> NormalizedSettings {
        let mut out = NormalizedSettings::default();
        for (raw_key, value) in ephemeral_settings {
            let canonical = normalize_alias(raw_key);
            if PROVIDER_CONFIG_KEYS.contains(&canonical.as_str()) {
                continue;
            }
            if provider_rejects(target, &canonical) {
                continue;
            }
            match classify(&canonical) {
                SettingBucket::Cli => {
                    out.cli_settings.insert(canonical, value.clone());
                }
                SettingBucket::ModelParams => {
                    out.model_params.insert(canonical, value.clone());
                }
                SettingBucket::ModelBehavior => {
                    out.model_behavior.insert(canonical, value.clone());
                }
                SettingBucket::CustomHeader => {
                    if let Some(s) = value.as_str() {
                        let header_name = canonical
                            .strip_prefix("header.")
                            .or_else(|| canonical.strip_prefix("customHeaders."))
                            .unwrap_or(&canonical);
                        out.custom_headers
                            .insert(header_name.to_string(), s.to_string());
                    }
                }
            }
        }
        out
    }

    /// Build a `NormalizedRequest` for one turn.
    ///
    /// `reasoning_enabled` + `target == Anthropic` annotates the request
    /// with a `thinking{budgetTokens}` block; `strip_thinking` removes
    /// prior thinking blocks from `history`, except the most recent
    /// orphaned-thinking-before-tool-call sequence, which is replaced by a
    /// `redacted_thinking` block rather than dropped (spec §4.1 invariant).
    pub fn normalize(
        &self,
        caller_message: Message,
        history: Vec<Message>,
        ephemeral_settings: &HashMap<String, Value>,
        target: ProviderKind,
        tools: Vec<ToolDefinition>,
        agent_id: impl Into<String>,
        prompt_id: impl Into<String>,
        reasoning_enabled: bool,
        reasoning_budget_tokens: u32,
    ) -> Result<NormalizedRequest> {
        let provider_options = self.normalize_settings(target, ephemeral_settings);

        let strip_thinking = provider_options
            .model_behavior
            .get("strip_thinking")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        let mut contents = if strip_thinking {
            strip_thinking_blocks(history)
        } else {
            history
        };
        contents.push(caller_message);

        let thinking = if reasoning_enabled && target == ProviderKind::Anthropic {
            Some(ThinkingConfig {
                budget_tokens: reasoning_budget_tokens,
            })
        } else {
            None
        };

        Ok(NormalizedRequest {
            contents,
            tools,
            provider_options,
            agent_id: agent_id.into(),
            prompt_id: prompt_id.into(),
            thinking,
        })
    }
}

impl Default for RequestNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

/// Remove `thinking` blocks from history, except inside the most recent
/// message whose thinking precedes a `tool_call` block — that sequence is
/// kept, but with its thinking replaced by `redacted_thinking`, since a
/// silently-dropped thinking block ahead of a tool_call will make at least
/// one vendor reject the next request.
fn strip_thinking_blocks(history: Vec<Message>) -> Vec<Message> {
    let last_orphaned_idx = history
        .iter()
        .rposition(Message::has_orphaned_thinking_before_tool_call);

    history
        .into_iter()
        .enumerate()
        .map(|(idx, mut msg)| {
            if Some(idx) == last_orphaned_idx {
                for block in &mut msg.blocks {
                    if block.is_thinking() {
                        *block = Block::RedactedThinking { data: None };
                    }
                }
            } else {
                msg.blocks.retain(|b| !b.is_thinking());
            }
            msg
        })
        .collect()
}

/// Surfaced when a caller requests an unknown provider.
pub fn unknown_provider(name: &str) -> CoreError {
    CoreError::config(format!("unknown provider: {name}"))
}
