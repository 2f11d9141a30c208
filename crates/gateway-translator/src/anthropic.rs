//! Anthropic messages format.
//!
//! Anthropic has a top-level `system` field and only `user`/`assistant`
//! roles, with tool results carried as `tool_result` blocks inside user
//! messages. Consecutive same-role messages are merged on build since the
//! API rejects non-alternating conversations.

use crate::sse::data_payloads;
use crate::{f32_field, parse_json, str_field, string_list, to_bytes, u32_field, Translator};
use bytes::Bytes;
use gateway_core::{
    ApiFormat, ContentBlock, DeltaPayload, GatewayError, GatewayResult, ImageSource,
    MessageContent, Role, StopReason, StreamDelta, StreamDeltaType, ToolDefinition,
    UnifiedMessage, UnifiedRequest, UnifiedResponse, Usage,
};
use serde_json::{json, Map, Value};

const FORMAT: ApiFormat = ApiFormat::Anthropic;

/// `max_tokens` is mandatory for Anthropic; used when the caller sent none
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Translator for the Anthropic messages schema
#[derive(Debug, Clone, Copy, Default)]
pub struct AnthropicTranslator;

impl AnthropicTranslator {
    /// Create a new translator
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn stop_reason_from_anthropic(reason: &str) -> StopReason {
    match reason {
        "max_tokens" => StopReason::MaxTokens,
        "stop_sequence" => StopReason::StopSequence,
        "tool_use" => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    }
}

fn stop_reason_to_anthropic(reason: StopReason) -> &'static str {
    match reason {
        StopReason::EndTurn => "end_turn",
        StopReason::MaxTokens => "max_tokens",
        StopReason::StopSequence => "stop_sequence",
        StopReason::ToolUse => "tool_use",
    }
}

fn text_of(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| str_field(b, "text"))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn parse_block(block: &Value) -> Option<ContentBlock> {
    match str_field(block, "type")? {
        "text" => Some(ContentBlock::text(str_field(block, "text").unwrap_or_default())),
        "image" => {
            let source = block.get("source")?;
            match str_field(source, "type") {
                Some("url") => Some(ContentBlock::image_url(str_field(source, "url")?)),
                _ => Some(ContentBlock::base64_image(
                    str_field(source, "media_type").unwrap_or("image/png"),
                    str_field(source, "data")?,
                )),
            }
        }
        "tool_use" => Some(ContentBlock::ToolUse {
            id: str_field(block, "id").unwrap_or_default().to_string(),
            name: str_field(block, "name").unwrap_or_default().to_string(),
            input: block.get("input").cloned().unwrap_or_else(|| json!({})),
        }),
        "tool_result" => Some(ContentBlock::ToolResult {
            tool_use_id: str_field(block, "tool_use_id").unwrap_or_default().to_string(),
            content: text_of(block.get("content")),
            is_error: block.get("is_error").and_then(Value::as_bool),
        }),
        _ => None,
    }
}

fn parse_blocks(content: Option<&Value>) -> Vec<ContentBlock> {
    match content {
        Some(Value::String(s)) => vec![ContentBlock::text(s.clone())],
        Some(Value::Array(blocks)) => blocks.iter().filter_map(parse_block).collect(),
        _ => Vec::new(),
    }
}

fn block_json(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({"type": "text", "text": text}),
        ContentBlock::Image {
            source: ImageSource::Base64,
            media_type,
            data,
            ..
        } => json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": media_type.as_deref().unwrap_or("image/png"),
                "data": data.as_deref().unwrap_or_default(),
            }
        }),
        ContentBlock::Image {
            source: ImageSource::Url,
            url,
            ..
        } => json!({
            "type": "image",
            "source": {"type": "url", "url": url.as_deref().unwrap_or_default()}
        }),
        ContentBlock::ToolUse { id, name, input } => {
            json!({"type": "tool_use", "id": id, "name": name, "input": input})
        }
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            let mut value = json!({"type": "tool_result", "tool_use_id": tool_use_id, "content": content});
            if let Some(is_error) = is_error {
                value["is_error"] = Value::Bool(*is_error);
            }
            value
        }
    }
}

fn content_json(content: &MessageContent) -> Value {
    match content {
        MessageContent::Text(text) => Value::String(text.clone()),
        MessageContent::Blocks(blocks) => Value::Array(blocks.iter().map(block_json).collect()),
    }
}

fn as_block_array(content: Value) -> Vec<Value> {
    match content {
        Value::Array(blocks) => blocks,
        Value::String(text) => vec![json!({"type": "text", "text": text})],
        _ => Vec::new(),
    }
}

/// Merge consecutive same-role messages into one block array
fn merge_alternating(messages: Vec<(&'static str, Value)>) -> Vec<Value> {
    let mut merged: Vec<(&'static str, Value)> = Vec::with_capacity(messages.len());
    for (role, content) in messages {
        match merged.last_mut() {
            Some((last_role, last_content)) if *last_role == role => {
                let mut blocks = as_block_array(last_content.take());
                blocks.extend(as_block_array(content));
                *last_content = Value::Array(blocks);
            }
            _ => merged.push((role, content)),
        }
    }
    merged
        .into_iter()
        .map(|(role, content)| json!({"role": role, "content": content}))
        .collect()
}

fn parse_usage(value: Option<&Value>) -> Option<Usage> {
    value.filter(|u| u.is_object()).map(|u| {
        Usage::new(
            u32_field(u, "input_tokens").unwrap_or(0),
            u32_field(u, "output_tokens").unwrap_or(0),
        )
    })
}

fn sse_event(name: &str, data: &Value) -> String {
    format!("event: {name}\ndata: {data}\n\n")
}

impl Translator for AnthropicTranslator {
    fn format(&self) -> ApiFormat {
        FORMAT
    }

    fn parse_request(&self, body: &[u8]) -> GatewayResult<UnifiedRequest> {
        let value = parse_json(FORMAT, body)?;
        let mut system_parts = Vec::new();
        let system = text_of(value.get("system"));
        if !system.is_empty() {
            system_parts.push(system);
        }

        let mut messages = Vec::new();
        for raw in value
            .get("messages")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let blocks = parse_blocks(raw.get("content"));
            match str_field(raw, "role").unwrap_or("user") {
                "system" => {
                    let text = text_of(raw.get("content"));
                    if !text.is_empty() {
                        system_parts.push(text);
                    }
                }
                "assistant" => messages.push(UnifiedMessage {
                    role: Role::Assistant,
                    content: MessageContent::from_blocks(blocks),
                }),
                _ => {
                    let (results, rest): (Vec<_>, Vec<_>) = blocks
                        .into_iter()
                        .partition(|b| matches!(b, ContentBlock::ToolResult { .. }));
                    let had_results = !results.is_empty();
                    messages.extend(
                        results
                            .into_iter()
                            .map(|b| UnifiedMessage::blocks(Role::Tool, vec![b])),
                    );
                    if !had_results || !rest.is_empty() {
                        messages.push(UnifiedMessage {
                            role: Role::User,
                            content: MessageContent::from_blocks(rest),
                        });
                    }
                }
            }
        }

        let tools = value
            .get("tools")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|tool| {
                Some(ToolDefinition {
                    name: str_field(tool, "name")?.to_string(),
                    description: str_field(tool, "description").map(String::from),
                    input_schema: tool
                        .get("input_schema")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                })
            })
            .collect();

        Ok(UnifiedRequest {
            model: str_field(&value, "model").unwrap_or_default().to_string(),
            messages,
            system_prompt: (!system_parts.is_empty()).then(|| system_parts.join("\n\n")),
            max_tokens: u32_field(&value, "max_tokens"),
            temperature: f32_field(&value, "temperature"),
            top_p: f32_field(&value, "top_p"),
            stop_sequences: string_list(value.get("stop_sequences")),
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
        let messages = request
            .messages
            .iter()
            .map(|m| {
                let role = if m.role == Role::Assistant { "assistant" } else { "user" };
                (role, content_json(&m.content))
            })
            .collect();

        let mut body = Map::new();
        body.insert("model".into(), json!(request.model));
        body.insert(
            "max_tokens".into(),
            json!(request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
        );
        body.insert("messages".into(), Value::Array(merge_alternating(messages)));
        if let Some(system) = &request.system_prompt {
            body.insert("system".into(), json!(system));
        }
        if let Some(temperature) = request.temperature {
            body.insert("temperature".into(), json!(temperature));
        }
        if let Some(top_p) = request.top_p {
            body.insert("top_p".into(), json!(top_p));
        }
        if !request.stop_sequences.is_empty() {
            body.insert("stop_sequences".into(), json!(request.stop_sequences));
        }
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    let mut tool = json!({"name": t.name, "input_schema": t.input_schema});
                    if let Some(description) = &t.description {
                        tool["description"] = json!(description);
                    }
                    tool
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
        if str_field(&value, "type") == Some("error") {
            return Err(GatewayError::translation(FORMAT, "response is an error payload"));
        }
        Ok(UnifiedResponse {
            id: str_field(&value, "id").unwrap_or_default().to_string(),
            model: str_field(&value, "model").unwrap_or_default().to_string(),
            content: parse_blocks(value.get("content")),
            stop_reason: str_field(&value, "stop_reason").map(stop_reason_from_anthropic),
            usage: parse_usage(value.get("usage")).unwrap_or_default(),
        })
    }

    fn build_response(&self, response: &UnifiedResponse) -> GatewayResult<Bytes> {
        let body = json!({
            "id": response.id,
            "type": "message",
            "role": "assistant",
            "model": response.model,
            "content": response.content.iter().map(block_json).collect::<Vec<_>>(),
            "stop_reason": response.stop_reason.map(stop_reason_to_anthropic),
            "stop_sequence": null,
            "usage": {
                "input_tokens": response.usage.input_tokens,
                "output_tokens": response.usage.output_tokens,
            },
        });
        to_bytes(FORMAT, &body)
    }

    fn parse_stream_events(&self, chunk: &str) -> Vec<StreamDelta> {
        let mut events = Vec::new();
        for payload in data_payloads(chunk) {
            let Ok(value) = serde_json::from_str::<Value>(payload) else {
                continue;
            };
            let index = u32_field(&value, "index").unwrap_or(0);
            match str_field(&value, "type") {
                Some("message_start") => {
                    let message = value.get("message").unwrap_or(&Value::Null);
                    let mut delta = StreamDelta::message_start(
                        str_field(message, "id").unwrap_or_default(),
                        str_field(message, "model").unwrap_or_default(),
                    );
                    delta.usage = parse_usage(message.get("usage"));
                    events.push(delta);
                }
                Some("content_block_start") => {
                    if let Some(block) = value.get("content_block").and_then(parse_block) {
                        events.push(StreamDelta::block_start(index, block));
                    }
                }
                Some("content_block_delta") => {
                    let delta = value.get("delta").unwrap_or(&Value::Null);
                    match str_field(delta, "type") {
                        Some("text_delta") => {
                            events.push(StreamDelta::text(
                                index,
                                str_field(delta, "text").unwrap_or_default(),
                            ));
                        }
                        Some("input_json_delta") => {
                            events.push(StreamDelta::partial_json(
                                index,
                                str_field(delta, "partial_json").unwrap_or_default(),
                            ));
                        }
                        _ => {}
                    }
                }
                Some("content_block_stop") => events.push(StreamDelta::block_stop(index)),
                Some("message_delta") => {
                    let stop = value
                        .get("delta")
                        .and_then(|d| str_field(d, "stop_reason"))
                        .map(stop_reason_from_anthropic);
                    events.push(StreamDelta::message_delta(stop, parse_usage(value.get("usage"))));
                }
                Some("message_stop") => events.push(StreamDelta::message_stop()),
                _ => {}
            }
        }
        events
    }

    fn build_stream_chunk(&self, delta: &StreamDelta) -> String {
        match delta.kind {
            StreamDeltaType::MessageStart => {
                let usage = delta.usage.unwrap_or_default();
                sse_event(
                    "message_start",
                    &json!({
                        "type": "message_start",
                        "message": {
                            "id": delta.id.as_deref().unwrap_or_default(),
                            "type": "message",
                            "role": "assistant",
                            "model": delta.model.as_deref().unwrap_or_default(),
                            "content": [],
                            "stop_reason": null,
                            "stop_sequence": null,
                            "usage": {"input_tokens": usage.input_tokens, "output_tokens": 0},
                        }
                    }),
                )
            }
            StreamDeltaType::ContentBlockStart => {
                let block = match &delta.content_block {
                    Some(ContentBlock::ToolUse { id, name, .. }) => {
                        json!({"type": "tool_use", "id": id, "name": name, "input": {}})
                    }
                    _ => json!({"type": "text", "text": ""}),
                };
                sse_event(
                    "content_block_start",
                    &json!({"type": "content_block_start", "index": delta.index, "content_block": block}),
                )
            }
            StreamDeltaType::ContentBlockDelta => {
                let inner = match &delta.delta {
                    Some(DeltaPayload::Text(text)) => json!({"type": "text_delta", "text": text}),
                    Some(DeltaPayload::PartialJson(json)) => {
                        json!({"type": "input_json_delta", "partial_json": json})
                    }
                    None => return String::new(),
                };
                sse_event(
                    "content_block_delta",
                    &json!({"type": "content_block_delta", "index": delta.index, "delta": inner}),
                )
            }
            StreamDeltaType::ContentBlockStop => sse_event(
                "content_block_stop",
                &json!({"type": "content_block_stop", "index": delta.index}),
            ),
            StreamDeltaType::MessageDelta => {
                let usage = delta.usage.unwrap_or_default();
                sse_event(
                    "message_delta",
                    &json!({
                        "type": "message_delta",
                        "delta": {
                            "stop_reason": delta.stop_reason.map(stop_reason_to_anthropic),
                            "stop_sequence": null,
                        },
                        "usage": {"output_tokens": usage.output_tokens},
                    }),
                )
            }
            StreamDeltaType::MessageStop => {
                sse_event("message_stop", &json!({"type": "message_stop"}))
            }
        }
    }
}
