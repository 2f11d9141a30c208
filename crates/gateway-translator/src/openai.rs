//! OpenAI chat completions format.
//!
//! System messages are hoisted into the unified system prompt (multiple
//! system messages joined by a blank line). Assistant `tool_calls` become
//! `tool_use` blocks and `tool` role messages become single `tool_result`
//! messages.

use crate::sse::data_payloads;
use crate::{
    f32_field, parse_data_url, parse_json, str_field, string_list, to_bytes, u32_field, unix_now,
    Translator,
};
use bytes::Bytes;
use gateway_core::{
    ApiFormat, ContentBlock, DeltaPayload, GatewayError, GatewayResult, ImageSource,
    MessageContent, Role, StopReason, StreamDelta, StreamDeltaType, ToolDefinition,
    UnifiedMessage, UnifiedRequest, UnifiedResponse, Usage,
};
use serde_json::{json, Map, Value};

const FORMAT: ApiFormat = ApiFormat::OpenAI;

/// Translator for the OpenAI chat completions schema
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenAiTranslator;

impl OpenAiTranslator {
    /// Create a new translator
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

/// Map an OpenAI `finish_reason`
pub(crate) fn stop_reason_from_openai(reason: &str) -> StopReason {
    match reason {
        "length" => StopReason::MaxTokens,
        "tool_calls" | "function_call" => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    }
}

pub(crate) fn stop_reason_to_openai(reason: StopReason) -> &'static str {
    match reason {
        StopReason::EndTurn | StopReason::StopSequence => "stop",
        StopReason::MaxTokens => "length",
        StopReason::ToolUse => "tool_calls",
    }
}

fn content_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| str_field(p, "text"))
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

fn parse_content_blocks(content: Option<&Value>) -> Vec<ContentBlock> {
    match content {
        Some(Value::String(s)) if !s.is_empty() => vec![ContentBlock::text(s.clone())],
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|part| match str_field(part, "type") {
                Some("text") => str_field(part, "text").map(ContentBlock::text),
                Some("image_url") => {
                    let url = part
                        .get("image_url")
                        .and_then(|i| i.get("url").or(Some(i)))
                        .and_then(Value::as_str)?;
                    Some(match parse_data_url(url) {
                        Some((media_type, data)) => ContentBlock::base64_image(media_type, data),
                        None => ContentBlock::image_url(url),
                    })
                }
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn content_from(blocks: Vec<ContentBlock>) -> MessageContent {
    if blocks.is_empty() {
        MessageContent::Text(String::new())
    } else {
        MessageContent::from_blocks(blocks)
    }
}

fn parse_tool_call(call: &Value) -> ContentBlock {
    let function = call.get("function").unwrap_or(&Value::Null);
    let arguments = str_field(function, "arguments").unwrap_or_default();
    let input = if arguments.trim().is_empty() {
        json!({})
    } else {
        serde_json::from_str(arguments).unwrap_or_else(|_| Value::String(arguments.to_string()))
    };
    ContentBlock::ToolUse {
        id: str_field(call, "id").unwrap_or_default().to_string(),
        name: str_field(function, "name").unwrap_or_default().to_string(),
        input,
    }
}

fn tool_call_json(id: &str, name: &str, input: &Value) -> Value {
    let arguments = match input {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    json!({
        "id": id,
        "type": "function",
        "function": {"name": name, "arguments": arguments},
    })
}

fn image_url_json(block: &ContentBlock) -> Option<Value> {
    let ContentBlock::Image {
        source,
        media_type,
        data,
        url,
    } = block
    else {
        return None;
    };
    let url = match source {
        ImageSource::Base64 => format!(
            "data:{};base64,{}",
            media_type.as_deref().unwrap_or("image/png"),
            data.as_deref().unwrap_or_default()
        ),
        ImageSource::Url => url.clone().unwrap_or_default(),
    };
    Some(json!({"type": "image_url", "image_url": {"url": url}}))
}

fn user_content_json(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(text) => Value::String(text.clone()),
        MessageContent::Blocks(blocks) => {
            let parts: Vec<Value> = blocks
                .iter()
                .filter_map(|block| match block {
                    ContentBlock::Text { text } => Some(json!({"type": "text", "text": text})),
                    ContentBlock::Image { .. } => image_url_json(block),
                    _ => None,
                })
                .collect();
            match parts.as_slice() {
                [single] if single["type"] == "text" => single["text"].clone(),
                _ => Value::Array(parts),
            }
        }
    }
}

/// Render one unified message as one or more OpenAI messages
fn message_json(message: &UnifiedMessage) -> Vec<Value> {
    let blocks = message.content.to_blocks();
    let mut out = Vec::new();

    for block in &blocks {
        if let ContentBlock::ToolResult {
            tool_use_id,
            content,
            ..
        } = block
        {
            out.push(json!({"role": "tool", "tool_call_id": tool_use_id, "content": content}));
        }
    }

    match message.role {
        Role::Tool => {}
        Role::System => out.push(json!({"role": "system", "content": message.content.text()})),
        Role::Assistant => {
            let tool_calls: Vec<Value> = blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::ToolUse { id, name, input } => Some(tool_call_json(id, name, input)),
                    _ => None,
                })
                .collect();
            let text = message.content.text();
            let mut msg = json!({"role": "assistant"});
            msg["content"] = if text.is_empty() && !tool_calls.is_empty() {
                Value::Null
            } else {
                Value::String(text)
            };
            if !tool_calls.is_empty() {
                msg["tool_calls"] = Value::Array(tool_calls);
            }
            out.push(msg);
        }
        Role::User => {
            let remainder: Vec<ContentBlock> = blocks
                .into_iter()
                .filter(|b| !matches!(b, ContentBlock::ToolResult { .. }))
                .collect();
            let had_results = out.len();
            if had_results == 0 || !remainder.is_empty() {
                let content = match &message.content {
                    MessageContent::Text(_) => message.content.clone(),
                    MessageContent::Blocks(_) => MessageContent::from_blocks(remainder),
                };
                out.push(json!({"role": "user", "content": user_content_json(&content)}));
            }
        }
    }
    out
}

fn parse_usage(value: Option<&Value>) -> Usage {
    value.map_or_else(Usage::default, |u| {
        let input = u32_field(u, "prompt_tokens").unwrap_or(0);
        let output = u32_field(u, "completion_tokens").unwrap_or(0);
        Usage {
            input_tokens: input,
            output_tokens: output,
            total_tokens: u32_field(u, "total_tokens").unwrap_or(input + output),
        }
    })
}

fn usage_json(usage: &Usage) -> Value {
    json!({
        "prompt_tokens": usage.input_tokens,
        "completion_tokens": usage.output_tokens,
        "total_tokens": usage.total_tokens,
    })
}

impl Translator for OpenAiTranslator {
    fn format(&self) -> ApiFormat {
        FORMAT
    }

    fn parse_request(&self, body: &[u8]) -> GatewayResult<UnifiedRequest> {
        let value = parse_json(FORMAT, body)?;
        let mut system_parts = Vec::new();
        let mut messages = Vec::new();

        for raw in value
            .get("messages")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            match str_field(raw, "role").unwrap_or("user") {
                "system" | "developer" => {
                    let text = content_text(raw.get("content"));
                    if !text.is_empty() {
                        system_parts.push(text);
                    }
                }
                "tool" | "function" => {
                    let id = str_field(raw, "tool_call_id")
                        .or_else(|| str_field(raw, "name"))
                        .unwrap_or_default();
                    messages.push(UnifiedMessage::tool_result(
                        id,
                        content_text(raw.get("content")),
                        None,
                    ));
                }
                "assistant" => {
                    let mut blocks = parse_content_blocks(raw.get("content"));
                    blocks.extend(
                        raw.get("tool_calls")
                            .and_then(Value::as_array)
                            .into_iter()
                            .flatten()
                            .map(parse_tool_call),
                    );
                    messages.push(UnifiedMessage {
                        role: Role::Assistant,
                        content: content_from(blocks),
                    });
                }
                _ => messages.push(UnifiedMessage {
                    role: Role::User,
                    content: content_from(parse_content_blocks(raw.get("content"))),
                }),
            }
        }

        let tools = value
            .get("tools")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|tool| {
                let function = tool.get("function")?;
                Some(ToolDefinition {
                    name: str_field(function, "name")?.to_string(),
                    description: str_field(function, "description").map(String::from),
                    input_schema: function
                        .get("parameters")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                })
            })
            .collect();

        Ok(UnifiedRequest {
            model: str_field(&value, "model").unwrap_or_default().to_string(),
            messages,
            system_prompt: (!system_parts.is_empty()).then(|| system_parts.join("\n\n")),
            max_tokens: u32_field(&value, "max_tokens")
                .or_else(|| u32_field(&value, "max_completion_tokens")),
            temperature: f32_field(&value, "temperature"),
            top_p: f32_field(&value, "top_p"),
            stop_sequences: string_list(value.get("stop")),
            tools,
            stream: value.get("stream").and_then(Value::as_bool).unwrap_or(false),
            metadata: value
                .get("metadata")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        })
    }

    fn build_request(&self, request: &UnifiedRequest) -> GatewayResult<Bytes> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system_prompt {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.extend(request.messages.iter().flat_map(message_json));

        let mut body = Map::new();
        body.insert("model".into(), json!(request.model));
        body.insert("messages".into(), Value::Array(messages));
        if let Some(max_tokens) = request.max_tokens {
            body.insert("max_tokens".into(), json!(max_tokens));
        }
        if let Some(temperature) = request.temperature {
            body.insert("temperature".into(), json!(temperature));
        }
        if let Some(top_p) = request.top_p {
            body.insert("top_p".into(), json!(top_p));
        }
        if !request.stop_sequences.is_empty() {
            body.insert("stop".into(), json!(request.stop_sequences));
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.input_schema,
                        }
                    })
                })
                .collect();
            body.insert("tools".into(), Value::Array(tools));
        }
        if request.stream {
            body.insert("stream".into(), Value::Bool(true));
        }
        if !request.metadata.is_empty() {
            body.insert("metadata".into(), Value::Object(request.metadata.clone()));
        }
        to_bytes(FORMAT, &Value::Object(body))
    }

    fn parse_response(&self, body: &[u8]) -> GatewayResult<UnifiedResponse> {
        let value = parse_json(FORMAT, body)?;
        let choice = value
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|c| c.first())
            .ok_or_else(|| GatewayError::translation(FORMAT, "response has no choices"))?;
        let message = choice.get("message").unwrap_or(&Value::Null);

        let mut content = parse_content_blocks(message.get("content"));
        content.extend(
            message
                .get("tool_calls")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .map(parse_tool_call),
        );

        Ok(UnifiedResponse {
            id: str_field(&value, "id").unwrap_or_default().to_string(),
            model: str_field(&value, "model").unwrap_or_default().to_string(),
            content,
            stop_reason: str_field(choice, "finish_reason").map(stop_reason_from_openai),
            usage: parse_usage(value.get("usage")),
        })
    }

    fn build_response(&self, response: &UnifiedResponse) -> GatewayResult<Bytes> {
        let text = response.text();
        let tool_calls: Vec<Value> = response
            .content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => Some(tool_call_json(id, name, input)),
                _ => None,
            })
            .collect();

        let mut message = json!({"role": "assistant"});
        message["content"] = if text.is_empty() && !tool_calls.is_empty() {
            Value::Null
        } else {
            Value::String(text)
        };
        if !tool_calls.is_empty() {
            message["tool_calls"] = Value::Array(tool_calls);
        }

        let body = json!({
            "id": response.id,
            "object": "chat.completion",
            "created": unix_now(),
            "model": response.model,
            "choices": [{
                "index": 0,
                "message": message,
                "finish_reason": response.stop_reason.map(stop_reason_to_openai),
            }],
            "usage": usage_json(&response.usage),
        });
        to_bytes(FORMAT, &body)
    }

    fn parse_stream_events(&self, chunk: &str) -> Vec<StreamDelta> {
        let mut events = Vec::new();
        for payload in data_payloads(chunk) {
            if payload == "[DONE]" {
                events.push(StreamDelta::message_stop());
                continue;
            }
            let Ok(value) = serde_json::from_str::<Value>(payload) else {
                continue;
            };
            let usage = value
                .get("usage")
                .filter(|u| u.is_object())
                .map(|u| parse_usage(Some(u)));

            let Some(choice) = value
                .get("choices")
                .and_then(Value::as_array)
                .and_then(|c| c.first())
            else {
                if usage.is_some() {
                    events.push(StreamDelta::message_delta(None, usage));
                }
                continue;
            };
            let delta = choice.get("delta").unwrap_or(&Value::Null);

            if str_field(delta, "role").is_some() {
                events.push(StreamDelta::message_start(
                    str_field(&value, "id").unwrap_or_default(),
                    str_field(&value, "model").unwrap_or_default(),
                ));
            }
            if let Some(text) = str_field(delta, "content").filter(|t| !t.is_empty()) {
                events.push(StreamDelta::text(0, text));
            }
            for call in delta
                .get("tool_calls")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let index = u32_field(call, "index").unwrap_or(0) + 1;
                let function = call.get("function").unwrap_or(&Value::Null);
                if let Some(name) = str_field(function, "name") {
                    events.push(StreamDelta::block_start(
                        index,
                        ContentBlock::ToolUse {
                            id: str_field(call, "id").unwrap_or_default().to_string(),
                            name: name.to_string(),
                            input: json!({}),
                        },
                    ));
                }
                if let Some(args) = str_field(function, "arguments").filter(|a| !a.is_empty()) {
                    events.push(StreamDelta::partial_json(index, args));
                }
            }
            if let Some(reason) = str_field(choice, "finish_reason") {
                events.push(StreamDelta::message_delta(
                    Some(stop_reason_from_openai(reason)),
                    usage,
                ));
            }
        }
        events
    }

    fn build_stream_chunk(&self, delta: &StreamDelta) -> String {
        let mut finish_reason = Value::Null;
        let mut usage = None;
        let body = match delta.kind {
            StreamDeltaType::MessageStop => return "data: [DONE]\n\n".to_string(),
            StreamDeltaType::MessageStart => json!({"role": "assistant", "content": ""}),
            StreamDeltaType::ContentBlockStart => match &delta.content_block {
                Some(ContentBlock::ToolUse { id, name, .. }) => json!({
                    "tool_calls": [{
                        "index": delta.index,
                        "id": id,
                        "type": "function",
                        "function": {"name": name, "arguments": ""},
                    }]
                }),
                _ => return String::new(),
            },
            StreamDeltaType::ContentBlockDelta => match &delta.delta {
                Some(DeltaPayload::Text(text)) => json!({"content": text}),
                Some(DeltaPayload::PartialJson(json)) => json!({
                    "tool_calls": [{"index": delta.index, "function": {"arguments": json}}]
                }),
                None => return String::new(),
            },
            StreamDeltaType::ContentBlockStop => return String::new(),
            StreamDeltaType::MessageDelta => {
                finish_reason = delta
                    .stop_reason
                    .map_or(Value::Null, |r| json!(stop_reason_to_openai(r)));
                usage = delta.usage.as_ref().map(usage_json);
                json!({})
            }
        };

        let mut chunk = json!({
            "id": delta.id.as_deref().unwrap_or_default(),
            "object": "chat.completion.chunk",
            "created": unix_now(),
            "model": delta.model.as_deref().unwrap_or_default(),
            "choices": [{"index": 0, "delta": body, "finish_reason": finish_reason}],
        });
        if let Some(usage) = usage {
            chunk["usage"] = usage;
        }
        format!("data: {chunk}\n\n")
    }
}
