//! Anthropic Messages API `ProviderDriver`. Authored fresh — the pack's
//! teacher repo has no working Anthropic wire-protocol file to graft
//! from — grounded instead on the `AnthropicProvider` adapter in
//! `sblanchard-SerialAgent/crates/providers/src/anthropic.rs`, one of the
//! other example repos in the retrieval pack: same `content_block_delta`
//! streaming shape, same index-addressed tool-use accumulation, same
//! `x-api-key`/`anthropic-version` header pattern.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use llxprt_contracts::{Block, Message, ProviderErrorCategory, ProviderEvent, Speaker, ToolCallFragment, ToolDefinition, Usage};
use llxprt_core::{CancellationToken, CoreError, EventStream, NormalizedRequest, ProviderDriver, Result, RuntimeContext};
use serde_json::{json, Value};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const OAUTH_BETA_HEADER: &str = "oauth-2025-04-20";
const DEFAULT_API_URL: &str = "https://api.anthropic.com/v1/messages";
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Clone)]
pub struct AnthropicDriver {
    name: String,
    client: reqwest::Client,
}

impl AnthropicDriver {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client: reqwest::Client::new(),
        }
    }
}

impl Default for AnthropicDriver {
    fn default() -> Self {
        Self::new("anthropic")
    }
}

#[async_trait]
impl ProviderDriver for AnthropicDriver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate_chat_completion(
        &self,
        request: NormalizedRequest,
        context: RuntimeContext,
        cancellation: CancellationToken,
    ) -> Result<EventStream> {
        let missing = context.missing_fields(true);
        if !missing.is_empty() {
            return Err(CoreError::MissingRuntimeContext {
                provider_key: context.provider_key.clone(),
                missing_fields: missing,
                requirement: "Anthropic driver requires an API key or OAuth token".to_string(),
                remediation: format!("set credentials for provider '{}'", context.provider_key),
            });
        }

        let url = context
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let messages: Vec<Value> = request.contents.iter().map(convert_message).collect();
        let tools: Vec<Value> = request.tools.iter().map(convert_tool).collect();

        let max_tokens = request
            .provider_options
            .model_params
            .get("max_tokens")
            .and_then(Value::as_u64)
            .map(|v| v as u32)
            .unwrap_or(DEFAULT_MAX_TOKENS);

        let mut body = json!({
            "model": context.model_id,
            "messages": messages,
            "max_tokens": max_tokens,
            "stream": true,
        });

        if !tools.is_empty() {
            body["tools"] = Value::Array(tools);
        }
        if let Some(temp) = request.provider_options.model_params.get("temperature") {
            body["temperature"] = temp.clone();
        }
        if let Some(thinking) = request.thinking {
            body["thinking"] = json!({ "type": "enabled", "budget_tokens": thinking.budget_tokens });
        }

        let mut req = self
            .client
            .post(&url)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json");

        req = match (&context.oauth_token, &context.api_key) {
            (Some(token), _) => req
                .header("Authorization", format!("Bearer {token}"))
                .header("anthropic-beta", OAUTH_BETA_HEADER),
            (None, Some(key)) => req.header("x-api-key", key),
            (None, None) => unreachable!("missing_fields check above guarantees a credential"),
        };
        for (header, value) in &request.provider_options.custom_headers {
            req = req.header(header.as_str(), value.as_str());
        }

        let response = req
            .json(&body)
            .send()
            .await
            .map_err(|e| CoreError::Network(format!("request to {url} failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(map_category_with_detail(ProviderErrorCategory::from_status(status), &text));
        }

        let byte_stream = response.bytes_stream();
        let event_stream = byte_stream.eventsource();

        let state = Arc::new(Mutex::new(StreamState::default()));

        let mapped = event_stream.filter_map(move |result| {
            let cancellation = cancellation.clone();
            let state = state.clone();
            async move {
                if cancellation.is_cancelled() {
                    return Some(Err(CoreError::CancelledByUser));
                }
                match result {
                    Ok(event) => parse_sse_event(&event.event, &event.data, &state),
                    Err(err) => Some(Err(CoreError::Network(format!("SSE stream error: {err}")))),
                }
            }
        });

        Ok(Box::pin(mapped))
    }
}

fn map_category_with_detail(category: ProviderErrorCategory, detail: &str) -> CoreError {
    match category {
        ProviderErrorCategory::RateLimit => CoreError::RateLimit(detail.to_string()),
        ProviderErrorCategory::Quota => CoreError::Quota(detail.to_string()),
        ProviderErrorCategory::Authentication => CoreError::AuthenticationRequired(detail.to_string()),
        ProviderErrorCategory::Server => CoreError::Server(detail.to_string()),
        ProviderErrorCategory::Network => CoreError::Network(detail.to_string()),
        ProviderErrorCategory::Client => CoreError::Client(detail.to_string()),
    }
}

#[derive(Default)]
struct StreamState {
    /// index -> (call_id, name seen at content_block_start)
    active_tool_calls: HashMap<u64, (String, String)>,
    usage: Usage,
    stop_reason: Option<String>,
}

/// Converts one Anthropic SSE event into zero-or-one `ProviderEvent`.
///
/// Only the visible surface of the wire protocol (assistant text, tool
/// calls, usage, finish, error) is exposed through `ProviderEvent` — it
/// has no `thinking` variant. Thinking-block preservation (the
/// orphaned-thinking invariant) operates on the reconstructed `Message`
/// after a turn completes, not on this live per-delta stream.
fn parse_sse_event(event_name: &str, data: &str, state: &Arc<Mutex<StreamState>>) -> Option<Result<ProviderEvent>> {
    let _ = event_name;
    let v: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => return Some(Err(CoreError::Network(format!("failed to parse Anthropic event: {e}")))),
    };

    let event_type = v.get("type").and_then(Value::as_str).unwrap_or("");

    match event_type {
        "message_start" => {
            if let Some(usage) = v.get("message").and_then(|m| m.get("usage")) {
                let mut state = state.lock().unwrap();
                state.usage.prompt_tokens = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
            }
            None
        }
        "content_block_start" => {
            let idx = v.get("index").and_then(Value::as_u64).unwrap_or(0);
            let block = v.get("content_block")?;
            if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                let id = block.get("id").and_then(Value::as_str).unwrap_or("").to_string();
                let name = block.get("name").and_then(Value::as_str).unwrap_or("").to_string();
                state.lock().unwrap().active_tool_calls.insert(idx, (id.clone(), name.clone()));
                return Some(Ok(ProviderEvent::ToolCallFragment(ToolCallFragment {
                    index: idx as usize,
                    id: Some(id),
                    name: Some(name),
                    args_delta: None,
                })));
            }
            None
        }
        "content_block_delta" => {
            let idx = v.get("index").and_then(Value::as_u64).unwrap_or(0);
            let delta = v.get("delta")?;
            match delta.get("type").and_then(Value::as_str) {
                Some("text_delta") => {
                    let text = delta.get("text").and_then(Value::as_str).unwrap_or("").to_string();
                    Some(Ok(ProviderEvent::Content { text }))
                }
                Some("input_json_delta") => {
                    let partial = delta.get("partial_json").and_then(Value::as_str).unwrap_or("").to_string();
                    Some(Ok(ProviderEvent::ToolCallFragment(ToolCallFragment {
                        index: idx as usize,
                        id: None,
                        name: None,
                        args_delta: Some(partial),
                    })))
                }
                _ => None,
            }
        }
        "content_block_stop" => {
            let idx = v.get("index").and_then(Value::as_u64).unwrap_or(0);
            state.lock().unwrap().active_tool_calls.remove(&idx);
            None
        }
        "message_delta" => {
            let mut locked = state.lock().unwrap();
            if let Some(output) = v.get("usage").and_then(|u| u.get("output_tokens")).and_then(Value::as_u64) {
                locked.usage.candidates_tokens = output;
            }
            if let Some(reason) = v.get("delta").and_then(|d| d.get("stop_reason")).and_then(Value::as_str) {
                locked.stop_reason = Some(normalize_stop_reason(reason));
            }
            let usage = locked.usage;
            Some(Ok(ProviderEvent::Usage(usage)))
        }
        "message_stop" => {
            let reason = state.lock().unwrap().stop_reason.clone().unwrap_or_else(|| "stop".to_string());
            Some(Ok(ProviderEvent::Finish { reason }))
        }
        "error" => {
            let message = v
                .get("error")
                .and_then(|e| e.get("message"))
                .and_then(Value::as_str)
                .unwrap_or("unknown Anthropic error")
                .to_string();
            Some(Ok(ProviderEvent::Error { message, category: None }))
        }
        _ => None,
    }
}

fn normalize_stop_reason(reason: &str) -> String {
    match reason {
        "end_turn" => "stop".to_string(),
        "tool_use" => "tool_calls".to_string(),
        other => other.to_string(),
    }
}

fn convert_message(msg: &Message) -> Value {
    let role = match msg.speaker {
        Speaker::Human => "user",
        Speaker::Ai => "assistant",
        // Anthropic has no dedicated tool role: tool results travel back
        // as a user message containing `tool_result` content blocks.
        Speaker::Tool => "user",
    };

    let content: Vec<Value> = msg
        .blocks
        .iter()
        .filter_map(|block| match block {
            Block::Text { text } => Some(json!({ "type": "text", "text": text })),
            Block::ToolCall { id, name, parameters } => Some(json!({
                "type": "tool_use",
                "id": id,
                "name": name,
                "input": parameters,
            })),
            Block::ToolResponse { call_id, result, error, .. } => Some(json!({
                "type": "tool_result",
                "tool_use_id": call_id,
                "content": error.clone().unwrap_or_else(|| result.as_ref().map(|v| v.to_string()).unwrap_or_default()),
                "is_error": error.is_some(),
            })),
            // Anthropic requires the exact thinking block (with its
            // signature) to be replayed verbatim ahead of a tool_use in
            // the same turn; redacted thinking round-trips the same way.
            Block::Thinking { thought, signature, .. } => Some(json!({
                "type": "thinking",
                "thinking": thought,
                "signature": signature,
            })),
            Block::RedactedThinking { data } => Some(json!({
                "type": "redacted_thinking",
                "data": data,
            })),
        })
        .collect();

    json!({ "role": role, "content": content })
}

fn convert_tool(tool: &ToolDefinition) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "input_schema": tool.parameters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use llxprt_core::NormalizedSettings;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request_with(contents: Vec<Message>) -> NormalizedRequest {
        NormalizedRequest {
            contents,
            tools: vec![],
            provider_options: NormalizedSettings::default(),
            agent_id: "agent-1".into(),
            prompt_id: "prompt-1".into(),
            thinking: None,
        }
    }

    #[tokio::test]
    async fn streams_text_deltas_and_finish_reason() {
        let server = MockServer::start().await;
        let sse_body = concat!(
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":10}}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n",
            "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":3}}\n\n",
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("x-api-key", "test-key"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(sse_body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let driver = AnthropicDriver::new("anthropic");
        let context = RuntimeContext::new("anthropic", "claude-opus-4")
            .with_api_key("test-key")
            .with_base_url(format!("{}/v1/messages", server.uri()));

        let mut stream = driver
            .generate_chat_completion(request_with(vec![Message::human("hi")]), context, CancellationToken::new())
            .await
            .unwrap();

        let mut text = String::new();
        let mut finish = None;
        while let Some(event) = stream.next().await {
            match event.unwrap() {
                ProviderEvent::Content { text: t } => text.push_str(&t),
                ProviderEvent::Finish { reason } => finish = Some(reason),
                _ => {}
            }
        }
        assert_eq!(text, "Hi");
        assert_eq!(finish.as_deref(), Some("stop"));
    }

    #[tokio::test]
    async fn oauth_token_sets_bearer_and_beta_header_instead_of_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/messages"))
            .and(header("anthropic-beta", OAUTH_BETA_HEADER))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw("event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n", "text/event-stream"),
            )
            .mount(&server)
            .await;

        let driver = AnthropicDriver::new("anthropic");
        let context = RuntimeContext::new("anthropic", "claude-opus-4")
            .with_oauth_token("oauth-tok")
            .with_base_url(format!("{}/v1/messages", server.uri()));

        let result = driver
            .generate_chat_completion(request_with(vec![Message::human("hi")]), context, CancellationToken::new())
            .await;
        assert!(result.is_ok());
    }

    #[test]
    fn convert_message_carries_tool_use_and_tool_result() {
        let msg = Message::new(
            Speaker::Ai,
            vec![Block::ToolCall {
                id: "hist_tool_1".into(),
                name: "ReadFile".into(),
                parameters: json!({"path": "/a"}),
            }],
        );
        let converted = convert_message(&msg);
        assert_eq!(converted["content"][0]["type"], "tool_use");
        assert_eq!(converted["content"][0]["name"], "ReadFile");
    }

    #[test]
    fn thinking_blocks_round_trip_with_their_signature() {
        let msg = Message::new(
            Speaker::Ai,
            vec![Block::Thinking {
                thought: "step 1".into(),
                source_field: llxprt_contracts::ThinkingSourceField::Thinking,
                signature: Some("sig-abc".into()),
            }],
        );
        let converted = convert_message(&msg);
        assert_eq!(converted["content"][0]["type"], "thinking");
        assert_eq!(converted["content"][0]["signature"], "sig-abc");
    }
}
