//! Google generative-language `ProviderDriver`. The teacher never built a
//! Google driver — enriched from `qmt-google`
//! (`querymt-querymt/crates/google/src/lib.rs`), a pack example repo, for
//! the `generateContent` request/response shapes (`functionCall`,
//! `functionResponse`, `generationConfig`). Reimplemented against
//! `reqwest` in the teacher's driver idiom rather than that repo's
//! `http::Request`-building style.
//!
//! `generateContent` is a single JSON response, not a stream, so a whole
//! turn is reshaped into a short, ordered `ProviderEvent` sequence: text
//! parts and function calls in response order, then usage, then finish.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream;
use llxprt_contracts::{Block, Message, ProviderErrorCategory, ProviderEvent, Speaker, ToolCallFragment, ToolDefinition, Usage};
use llxprt_core::{CancellationToken, CoreError, EventStream, NormalizedRequest, ProviderDriver, Result, RuntimeContext};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";

#[derive(Clone)]
pub struct GoogleDriver {
    name: String,
    client: reqwest::Client,
}

impl GoogleDriver {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client: reqwest::Client::new(),
        }
    }
}

impl Default for GoogleDriver {
    fn default() -> Self {
        Self::new("google")
    }
}

#[async_trait]
impl ProviderDriver for GoogleDriver {
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
                requirement: "Google driver requires an API key".to_string(),
                remediation: format!("set credentials for provider '{}'", context.provider_key),
            });
        }
        let api_key = context.api_key.clone().expect("checked by missing_fields above");

        let base_url = context.base_url.clone().unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        let url = format!("{}/{}:generateContent", base_url.trim_end_matches('/'), context.model_id);

        let contents: Vec<Value> = request.contents.iter().map(convert_message).collect();

        let generation_config = generation_config(&request.provider_options.model_params);
        let tools: Vec<Value> = request.tools.iter().map(convert_tool).collect();

        let mut body = json!({ "contents": contents });
        if let Some(config) = generation_config {
            body["generationConfig"] = config;
        }
        if !tools.is_empty() {
            body["tools"] = json!([{ "functionDeclarations": tools }]);
        }

        let mut req = self.client.post(&url).query(&[("key", api_key.as_str())]).json(&body);
        for (header, value) in &request.provider_options.custom_headers {
            req = req.header(header.as_str(), value.as_str());
        }

        let response = req
            .send()
            .await
            .map_err(|e| CoreError::Network(format!("request to {url} failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(map_category_with_detail(ProviderErrorCategory::from_status(status), &text));
        }

        if cancellation.is_cancelled() {
            return Err(CoreError::CancelledByUser);
        }

        let text = response
            .text()
            .await
            .map_err(|e| CoreError::Network(format!("failed to read Google response body: {e}")))?;
        let parsed: GoogleChatResponse = serde_json::from_str(&text)
            .map_err(|e| CoreError::Server(format!("failed to decode Google response: {e}")))?;

        let events = reshape_response(parsed);
        Ok(Box::pin(stream::iter(events.into_iter().map(Ok))))
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

fn generation_config(model_params: &HashMap<String, Value>) -> Option<Value> {
    let mut config = serde_json::Map::new();
    if let Some(v) = model_params.get("max_tokens") {
        config.insert("maxOutputTokens".to_string(), v.clone());
    }
    if let Some(v) = model_params.get("temperature") {
        config.insert("temperature".to_string(), v.clone());
    }
    if let Some(v) = model_params.get("top_p") {
        config.insert("topP".to_string(), v.clone());
    }
    if let Some(v) = model_params.get("top_k") {
        config.insert("topK".to_string(), v.clone());
    }
    if config.is_empty() {
        None
    } else {
        Some(Value::Object(config))
    }
}

/// Converts one history message into a `contents` entry. Google has no
/// dedicated tool role: tool results travel back as a `function` role
/// message carrying a `functionResponse` part.
fn convert_message(msg: &Message) -> Value {
    let role = match msg.speaker {
        Speaker::Human => "user",
        Speaker::Ai => "model",
        Speaker::Tool => "function",
    };

    let parts: Vec<Value> = msg
        .blocks
        .iter()
        .filter_map(|block| match block {
            Block::Text { text } => Some(json!({ "text": text })),
            Block::ToolCall { name, parameters, .. } => Some(json!({
                "functionCall": { "name": name, "args": parameters },
            })),
            Block::ToolResponse { tool_name, result, error, .. } => Some(json!({
                "functionResponse": {
                    "name": tool_name,
                    "response": {
                        "name": tool_name,
                        "content": error.clone().map(Value::String).or_else(|| result.clone()).unwrap_or(Value::Null),
                    },
                },
            })),
            // Google's generateContent has no thinking-block representation.
            Block::Thinking { .. } | Block::RedactedThinking { .. } => None,
        })
        .collect();

    json!({ "role": role, "parts": parts })
}

fn convert_tool(tool: &ToolDefinition) -> Value {
    json!({
        "name": tool.name,
        "description": tool.description,
        "parameters": tool.parameters,
    })
}

fn reshape_response(response: GoogleChatResponse) -> Vec<ProviderEvent> {
    let mut events = Vec::new();
    let mut index = 0usize;

    if let Some(candidate) = response.candidates.into_iter().next() {
        for part in candidate.content.parts {
            if !part.text.is_empty() {
                events.push(ProviderEvent::Content { text: part.text });
            }
            if let Some(call) = part.function_call {
                events.push(ProviderEvent::ToolCallFragment(ToolCallFragment {
                    index,
                    id: Some(format!("call_{}", call.name)),
                    name: Some(call.name),
                    args_delta: Some(call.args.to_string()),
                }));
                index += 1;
            }
        }

        if let Some(reason) = candidate.finish_reason {
            events.push(ProviderEvent::Finish { reason: normalize_finish_reason(&reason) });
        } else {
            events.push(ProviderEvent::Finish { reason: "stop".to_string() });
        }
    } else {
        events.push(ProviderEvent::Finish { reason: "stop".to_string() });
    }

    if let Some(usage) = response.usage_metadata {
        events.insert(
            events.len() - 1,
            ProviderEvent::Usage(Usage {
                prompt_tokens: usage.prompt_token_count,
                candidates_tokens: usage.candidates_token_count,
            }),
        );
    }

    events
}

fn normalize_finish_reason(reason: &str) -> String {
    match reason {
        "STOP" => "stop".to_string(),
        "MAX_TOKENS" => "length".to_string(),
        other => other.to_ascii_lowercase(),
    }
}

#[derive(Deserialize, Debug)]
struct GoogleChatResponse {
    #[serde(default)]
    candidates: Vec<GoogleCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GoogleUsageMetadata>,
}

#[derive(Deserialize, Debug)]
struct GoogleCandidate {
    content: GoogleResponseContent,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize, Debug)]
struct GoogleResponseContent {
    #[serde(default)]
    parts: Vec<GoogleResponsePart>,
}

#[derive(Deserialize, Debug)]
struct GoogleResponsePart {
    #[serde(default)]
    text: String,
    #[serde(rename = "functionCall")]
    function_call: Option<GoogleFunctionCall>,
}

#[derive(Deserialize, Serialize, Debug)]
struct GoogleFunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

#[derive(Deserialize, Debug)]
struct GoogleUsageMetadata {
    #[serde(rename = "promptTokenCount", default)]
    prompt_token_count: u64,
    #[serde(rename = "candidatesTokenCount", default)]
    candidates_token_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use llxprt_core::NormalizedSettings;
    use wiremock::matchers::{method, path};
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
    async fn reshapes_a_text_response_into_content_usage_and_finish() {
        let server = MockServer::start().await;
        let body = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "hello there" }] },
                "finishReason": "STOP",
            }],
            "usageMetadata": { "promptTokenCount": 5, "candidatesTokenCount": 2 },
        });
        Mock::given(method("POST"))
            .and(path("/gemini-1.5-flash:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let driver = GoogleDriver::new("google");
        let context = RuntimeContext::new("google", "gemini-1.5-flash")
            .with_api_key("test-key")
            .with_base_url(server.uri());

        let mut stream = driver
            .generate_chat_completion(request_with(vec![Message::human("hi")]), context, CancellationToken::new())
            .await
            .unwrap();

        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event.unwrap());
        }

        assert!(matches!(&events[0], ProviderEvent::Content { text } if text == "hello there"));
        assert!(matches!(&events[1], ProviderEvent::Usage(u) if u.prompt_tokens == 5 && u.candidates_tokens == 2));
        assert!(matches!(&events[2], ProviderEvent::Finish { reason } if reason == "stop"));
    }

    #[tokio::test]
    async fn reshapes_a_function_call_into_a_tool_call_fragment() {
        let server = MockServer::start().await;
        let body = json!({
            "candidates": [{
                "content": { "parts": [{ "functionCall": { "name": "ReadFile", "args": { "path": "/a" } } }] },
                "finishReason": "STOP",
            }],
        });
        Mock::given(method("POST"))
            .and(path("/gemini-1.5-flash:generateContent"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let driver = GoogleDriver::new("google");
        let context = RuntimeContext::new("google", "gemini-1.5-flash")
            .with_api_key("test-key")
            .with_base_url(server.uri());

        let mut stream = driver
            .generate_chat_completion(request_with(vec![Message::human("hi")]), context, CancellationToken::new())
            .await
            .unwrap();

        let mut fragment = None;
        while let Some(event) = stream.next().await {
            if let ProviderEvent::ToolCallFragment(f) = event.unwrap() {
                fragment = Some(f);
            }
        }
        let fragment = fragment.expect("expected a tool call fragment");
        assert_eq!(fragment.name.as_deref(), Some("ReadFile"));
        assert_eq!(fragment.id.as_deref(), Some("call_ReadFile"));
    }

    #[tokio::test]
    async fn missing_api_key_fails_fast_without_a_request() {
        let driver = GoogleDriver::new("google");
        let context = RuntimeContext::new("google", "gemini-1.5-flash");
        let err = driver
            .generate_chat_completion(request_with(vec![Message::human("hi")]), context, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::MissingRuntimeContext { .. }));
    }

    #[test]
    fn convert_message_maps_tool_role_to_function() {
        let msg = Message::new(
            Speaker::Tool,
            vec![Block::ToolResponse {
                call_id: "call_1".into(),
                tool_name: "ReadFile".into(),
                result: Some(json!({"contents": "data"})),
                error: None,
            }],
        );
        let converted = convert_message(&msg);
        assert_eq!(converted["role"], "function");
        assert_eq!(converted["parts"][0]["functionResponse"]["name"], "ReadFile");
    }
}
