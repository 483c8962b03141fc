//! OpenAI-compatible chat-completions `ProviderDriver`, grounded on
//! `OpenAIProtocolLlmProvider` from the teacher's `everruns-core::openai`
//! module. Also backs the "custom vendor endpoint" variant described in
//! SPEC_FULL.md §1: same wire format, a different `base_url` and extra
//! headers, both of which already flow through `RuntimeContext` /
//! `NormalizedSettings.custom_headers`.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{stream, StreamExt};
use llxprt_contracts::{Block, Message, ProviderErrorCategory, ProviderEvent, Speaker, ToolCallRequest, ToolDefinition};
use llxprt_core::{
    CancellationToken, CoreError, EventStream, NormalizedRequest, ProviderDriver, Result, RuntimeContext,
    ToolCallAssembler,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const DEFAULT_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Placeholder `tool` message content synthesized for every pending call
/// when a turn ends with tool calls but no text (spec §4.3, §9 OQ2).
const CONTINUATION_PLACEHOLDER: &str = "[Tool call acknowledged - awaiting execution]";

/// Upper bound on how many empty-response continuations one turn will
/// chase before giving up and surfacing whatever the provider last sent.
/// A safety bound, not itself spec'd: a provider that never produces
/// text for its registered tool calls shouldn't spin forever.
const MAX_CONTINUATION_ATTEMPTS: usize = 3;

#[derive(Clone)]
pub struct OpenAiDriver {
    name: String,
    client: reqwest::Client,
}

impl OpenAiDriver {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            client: reqwest::Client::new(),
        }
    }
}

impl Default for OpenAiDriver {
    fn default() -> Self {
        Self::new("openai")
    }
}

#[async_trait]
impl ProviderDriver for OpenAiDriver {
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
                requirement: "OpenAI-compatible driver requires an API key".to_string(),
                remediation: format!("set an API key for provider '{}'", context.provider_key),
            });
        }

        let url = context
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let mut messages: Vec<OpenAiMessage> = request.contents.iter().map(convert_message).collect();
        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(convert_tools(&request.tools))
        };

        let temperature = request
            .provider_options
            .model_params
            .get("temperature")
            .and_then(Value::as_f64)
            .map(|v| v as f32);
        let max_tokens = request
            .provider_options
            .model_params
            .get("max_tokens")
            .and_then(Value::as_u64)
            .map(|v| v as u32);

        let token = context
            .api_key
            .clone()
            .or_else(|| context.oauth_token.clone())
            .expect("missing_fields check above guarantees a credential");

        let mut all_events: Vec<Result<ProviderEvent>> = Vec::new();
        let mut continuations = 0usize;

        loop {
            let body = OpenAiRequest {
                model: context.model_id.clone(),
                messages: messages.clone(),
                temperature,
                max_tokens,
                stream: true,
                tools: tools.clone(),
            };

            let mut req = self
                .client
                .post(&url)
                .header("Authorization", format!("Bearer {token}"))
                .header("Content-Type", "application/json");
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
                let category = ProviderErrorCategory::from_status(status);
                return Err(map_category_with_detail(category, &text));
            }

            let mut event_stream = response.bytes_stream().eventsource();
            let mut iteration = IterationState::default();

            while let Some(result) = event_stream.next().await {
                if cancellation.is_cancelled() {
                    iteration.events.push(Err(CoreError::CancelledByUser));
                    break;
                }
                let event = match result {
                    Ok(event) => event,
                    Err(err) => {
                        iteration.events.push(Err(CoreError::Network(format!("SSE stream error: {err}"))));
                        break;
                    }
                };
                if event.data == "[DONE]" {
                    break;
                }
                match parse_chunk(&event.data) {
                    Ok(ProviderEvent::ToolCallFragment(fragment)) => {
                        iteration.assembler.ingest(fragment.clone());
                        iteration.events.push(Ok(ProviderEvent::ToolCallFragment(fragment)));
                    }
                    Ok(ProviderEvent::Finish { reason }) => {
                        iteration.finish_reason = Some(reason.clone());
                        iteration.events.push(Ok(ProviderEvent::Finish { reason }));
                    }
                    Ok(event) => iteration.events.push(Ok(event)),
                    Err(err) => {
                        iteration.events.push(Err(err));
                        break;
                    }
                }
            }

            let saw_text = iteration
                .events
                .iter()
                .any(|e| matches!(e, Ok(ProviderEvent::Content { text }) if !text.is_empty()));
            let calls = iteration.assembler.finish(&request.agent_id, &request.prompt_id);
            let will_continue = !calls.is_empty()
                && !saw_text
                && iteration.finish_reason.as_deref() == Some("stop")
                && continuations < MAX_CONTINUATION_ATTEMPTS;

            if !will_continue {
                all_events.extend(iteration.events);
                break;
            }

            // This "stop" was an artifact of the provider never emitting
            // text for its registered tool calls, not the real end of
            // turn — drop it before restarting the stream.
            iteration.events.retain(|e| !matches!(e, Ok(ProviderEvent::Finish { .. })));
            all_events.extend(iteration.events);

            messages.push(continuation_assistant_message(&calls));
            for call in &calls {
                messages.push(continuation_tool_message(call));
            }
            messages.push(OpenAiMessage {
                role: "user".to_string(),
                content: Some(
                    "The tool calls above have been registered and are awaiting execution results.".to_string(),
                ),
                tool_calls: None,
                tool_call_id: None,
                name: None,
            });
            continuations += 1;
        }

        Ok(Box::pin(stream::iter(all_events)))
    }
}

#[derive(Default)]
struct IterationState {
    events: Vec<Result<ProviderEvent>>,
    assembler: ToolCallAssembler,
    finish_reason: Option<String>,
}

fn continuation_assistant_message(calls: &[ToolCallRequest]) -> OpenAiMessage {
    OpenAiMessage {
        role: "assistant".to_string(),
        content: None,
        tool_calls: Some(
            calls
                .iter()
                .map(|call| OpenAiToolCall {
                    id: call.call_id.clone(),
                    r#type: "function".to_string(),
                    function: OpenAiFunctionCall {
                        name: call.name.clone(),
                        arguments: serde_json::to_string(&call.args).unwrap_or_default(),
                    },
                })
                .collect(),
        ),
        tool_call_id: None,
        name: None,
    }
}

fn continuation_tool_message(call: &ToolCallRequest) -> OpenAiMessage {
    OpenAiMessage {
        role: "tool".to_string(),
        content: Some(CONTINUATION_PLACEHOLDER.to_string()),
        tool_calls: None,
        tool_call_id: Some(call.call_id.clone()),
        name: Some(call.name.clone()),
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

fn parse_chunk(data: &str) -> Result<ProviderEvent> {
    let chunk: OpenAiStreamChunk = serde_json::from_str(data)
        .map_err(|e| CoreError::Network(format!("failed to parse stream chunk: {e}")))?;

    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok(ProviderEvent::Content { text: String::new() });
    };

    // OpenAI sends at most one tool-call delta per chunk in practice;
    // per-index dedup/merge across chunks is the assembler's job.
    if let Some(tc) = choice.delta.tool_calls.into_iter().flatten().next() {
        return Ok(ProviderEvent::ToolCallFragment(llxprt_contracts::ToolCallFragment {
            index: tc.index as usize,
            id: tc.id,
            name: tc.function.as_ref().and_then(|f| f.name.clone()),
            args_delta: tc.function.and_then(|f| f.arguments),
        }));
    }

    if let Some(content) = choice.delta.content {
        return Ok(ProviderEvent::Content { text: content });
    }

    if let Some(finish_reason) = choice.finish_reason {
        return Ok(ProviderEvent::Finish { reason: finish_reason });
    }

    Ok(ProviderEvent::Content { text: String::new() })
}

fn convert_role(speaker: Speaker) -> &'static str {
    match speaker {
        Speaker::Human => "user",
        Speaker::Ai => "assistant",
        Speaker::Tool => "tool",
    }
}

fn convert_message(msg: &Message) -> OpenAiMessage {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    let mut tool_call_id = None;

    for block in &msg.blocks {
        match block {
            Block::Text { text: t } => text.push_str(t),
            Block::Thinking { .. } | Block::RedactedThinking { .. } => {}
            Block::ToolCall { id, name, parameters } => {
                tool_calls.push(OpenAiToolCall {
                    id: id.clone(),
                    r#type: "function".to_string(),
                    function: OpenAiFunctionCall {
                        name: name.clone(),
                        arguments: serde_json::to_string(parameters).unwrap_or_default(),
                    },
                });
            }
            Block::ToolResponse { call_id, result, error, .. } => {
                tool_call_id = Some(call_id.clone());
                text = error.clone().unwrap_or_else(|| {
                    result
                        .as_ref()
                        .map(|v| v.to_string())
                        .unwrap_or_default()
                });
            }
        }
    }

    OpenAiMessage {
        role: convert_role(msg.speaker).to_string(),
        content: if text.is_empty() && !tool_calls.is_empty() {
            None
        } else {
            Some(text)
        },
        tool_calls: if tool_calls.is_empty() { None } else { Some(tool_calls) },
        tool_call_id,
        name: None,
    }
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<OpenAiTool> {
    tools
        .iter()
        .map(|tool| OpenAiTool {
            r#type: "function".to_string(),
            function: OpenAiFunction {
                name: tool.name.clone(),
                description: tool.description.clone(),
                parameters: tool.parameters.clone(),
            },
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<OpenAiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<OpenAiTool>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiTool {
    r#type: String,
    function: OpenAiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiFunction {
    name: String,
    description: String,
    parameters: Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiToolCall {
    id: String,
    r#type: String,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    choices: Vec<OpenAiStreamChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChoice {
    delta: OpenAiDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiStreamToolCall>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamToolCall {
    index: u32,
    id: Option<String>,
    function: Option<OpenAiStreamFunction>,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use llxprt_core::NormalizedSettings;
    use serde_json::json as j;
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
    async fn streams_content_deltas_from_sse() {
        let server = MockServer::start().await;
        let sse_body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(sse_body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let driver = OpenAiDriver::new("openai");
        let context = RuntimeContext::new("openai", "gpt-4o")
            .with_api_key("test-key")
            .with_base_url(format!("{}/chat/completions", server.uri()));

        let request = request_with(vec![Message::human("hi")]);
        let mut stream = driver
            .generate_chat_completion(request, context, CancellationToken::new())
            .await
            .unwrap();

        let mut texts = Vec::new();
        let mut saw_finish = false;
        while let Some(event) = stream.next().await {
            match event.unwrap() {
                ProviderEvent::Content { text } if !text.is_empty() => texts.push(text),
                ProviderEvent::Finish { reason } => {
                    assert_eq!(reason, "stop");
                    saw_finish = true;
                }
                _ => {}
            }
        }
        assert_eq!(texts.join(""), "Hello");
        assert!(saw_finish);
    }

    #[tokio::test]
    async fn missing_api_key_fails_fast_without_a_request() {
        let driver = OpenAiDriver::new("openai");
        let context = RuntimeContext::new("openai", "gpt-4o");
        let request = request_with(vec![Message::human("hi")]);
        let result = driver
            .generate_chat_completion(request, context, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(CoreError::MissingRuntimeContext { .. })));
    }

    #[tokio::test]
    async fn non_success_status_maps_to_the_right_error_category() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(429).set_body_string("rate limited"))
            .mount(&server)
            .await;

        let driver = OpenAiDriver::new("openai");
        let context = RuntimeContext::new("openai", "gpt-4o")
            .with_api_key("test-key")
            .with_base_url(format!("{}/chat/completions", server.uri()));
        let request = request_with(vec![Message::human("hi")]);

        let result = driver
            .generate_chat_completion(request, context, CancellationToken::new())
            .await;
        assert!(matches!(result, Err(CoreError::RateLimit(_))));
    }

    #[test]
    fn convert_message_drops_thinking_blocks() {
        let msg = Message::new(
            Speaker::Ai,
            vec![
                Block::Thinking {
                    thought: "plan".into(),
                    source_field: llxprt_contracts::ThinkingSourceField::Thinking,
                    signature: None,
                },
                Block::text("answer"),
            ],
        );
        let converted = convert_message(&msg);
        assert_eq!(converted.content, Some("answer".to_string()));
    }

    #[test]
    fn convert_tools_maps_into_function_descriptors() {
        let tools = vec![ToolDefinition {
            name: "ReadFile".into(),
            description: "reads a file".into(),
            parameters: j!({"type": "object"}),
        }];
        let converted = convert_tools(&tools);
        assert_eq!(converted[0].function.name, "ReadFile");
    }

    #[tokio::test]
    async fn empty_response_with_tool_calls_triggers_a_continuation_request() {
        let server = MockServer::start().await;

        let first_body = concat!(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"Ls\",\"arguments\":\"{}\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let second_body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"done\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );

        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(first_body, "text/event-stream"),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_raw(second_body, "text/event-stream"),
            )
            .mount(&server)
            .await;

        let driver = OpenAiDriver::new("openai");
        let context = RuntimeContext::new("openai", "gpt-4o")
            .with_api_key("test-key")
            .with_base_url(format!("{}/chat/completions", server.uri()));
        let request = request_with(vec![Message::human("list files")]);

        let mut stream = driver
            .generate_chat_completion(request, context, CancellationToken::new())
            .await
            .unwrap();

        let mut saw_fragment = false;
        let mut texts = Vec::new();
        let mut finishes = 0;
        while let Some(event) = stream.next().await {
            match event.unwrap() {
                ProviderEvent::ToolCallFragment(_) => saw_fragment = true,
                ProviderEvent::Content { text } if !text.is_empty() => texts.push(text),
                ProviderEvent::Finish { .. } => finishes += 1,
                _ => {}
            }
        }

        assert!(saw_fragment, "expected the tool call fragment to still surface");
        assert_eq!(texts, vec!["done".to_string()]);
        assert_eq!(finishes, 1, "the provisional empty-text stop should not surface as a finish");

        let requests = server.received_requests().await.unwrap();
        assert_eq!(requests.len(), 2);
        let second_request: Value = serde_json::from_slice(&requests[1].body).unwrap();
        let messages = second_request["messages"].as_array().unwrap();

        let assistant_msg = messages
            .iter()
            .find(|m| m["role"] == "assistant" && m["tool_calls"].is_array())
            .expect("continuation should replay the assistant tool_calls message");
        assert_eq!(assistant_msg["tool_calls"][0]["id"], "call_1");

        let tool_msg = messages
            .iter()
            .find(|m| m["role"] == "tool")
            .expect("continuation should include a placeholder tool message");
        assert_eq!(tool_msg["content"], CONTINUATION_PLACEHOLDER);
        assert_eq!(tool_msg["name"], "Ls");

        let nudge = messages
            .iter()
            .find(|m| m["role"] == "user" && m["content"].as_str().unwrap_or_default().contains("have been registered"))
            .expect("continuation should nudge the model to use the pending results");
        assert!(nudge["content"].as_str().unwrap().contains("have been registered"));
    }
}
