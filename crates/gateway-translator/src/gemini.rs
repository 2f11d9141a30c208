//! Google Gemini `generateContent` format.
//!
//! Conversation turns live in `contents[].parts[]` with `user`/`model`
//! roles, the system prompt in `systemInstruction` and sampling options in
//! `generationConfig`. Function responses carry the function *name*, so
//! building a request resolves tool call ids back to names from earlier
//! `functionCall` parts.

use crate::sse::data_payloads;
use crate::{f32_field, parse_json, str_field, string_list, to_bytes, u32_field, Translator};
use bytes::Bytes;
use gateway_core::{
    ApiFormat, ContentBlock, DeltaPayload, GatewayError, GatewayResult, ImageSource,
    MessageContent, Role, StopReason, StreamDelta, StreamDeltaType, ToolDefinition,
    UnifiedMessage, UnifiedRequest, UnifiedResponse, Usage,
};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

const FORMAT: ApiFormat = ApiFormat::Gemini;

/// Translator for the Gemini `generateContent` schema
#[derive(Debug, Clone, Copy, Default)]
pub struct GeminiTranslator;

impl GeminiTranslator {
    /// Create a new translator
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

/// Accept both camelCase and snake_case spellings of a field
fn field<'a>(value: &'a Value, camel: &str, snake: &str) -> Option<&'a Value> {
    value.get(camel).or_else(|| value.get(snake))
}

fn stop_reason_from_gemini(reason: &str) -> StopReason {
    match reason {
        "MAX_TOKENS" => StopReason::MaxTokens,
        _ => StopReason::EndTurn,
    }
}

fn stop_reason_to_gemini(reason: StopReason) -> &'static str {
    match reason {
        StopReason::MaxTokens => "MAX_TOKENS",
        _ => "STOP",
    }
}

fn generated_call_id(name: &str) -> String {
    format!("call_{}_{}", name, uuid::Uuid::new_v4().simple())
}

fn system_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(instruction) => instruction
            .get("parts")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|p| str_field(p, "text"))
            .collect::<Vec<_>>()
            .join("\n"),
        None => String::new(),
    }
}

fn response_text(response: Option<&Value>) -> String {
    match response {
        Some(Value::String(s)) => s.clone(),
        Some(value) => match value.get("content") {
            Some(Value::String(s)) => s.clone(),
            _ => value.to_string(),
        },
        None => String::new(),
    }
}

/// Parse one part; function responses come back as `Err` so the caller can
/// split them into tool messages.
fn parse_part(part: &Value) -> Option<Result<ContentBlock, ContentBlock>> {
    if part.get("thought").and_then(Value::as_bool) == Some(true) {
        return None;
    }
    if let Some(text) = str_field(part, "text") {
        return Some(Ok(ContentBlock::text(text)));
    }
    if let Some(inline) = field(part, "inlineData", "inline_data") {
        let media_type = field(inline, "mimeType", "mime_type")
            .and_then(Value::as_str)
            .unwrap_or("image/png");
        let data = str_field(inline, "data")?;
        return Some(Ok(ContentBlock::base64_image(media_type, data)));
    }
    if let Some(file) = field(part, "fileData", "file_data") {
        let uri = field(file, "fileUri", "file_uri").and_then(Value::as_str)?;
        return Some(Ok(ContentBlock::image_url(uri)));
    }
    if let Some(call) = field(part, "functionCall", "function_call") {
        let name = str_field(call, "name").unwrap_or_default();
        return Some(Ok(ContentBlock::ToolUse {
            id: str_field(call, "id").map_or_else(|| generated_call_id(name), String::from),
            name: name.to_string(),
            input: call.get("args").cloned().unwrap_or_else(|| json!({})),
        }));
    }
    if let Some(resp) = field(part, "functionResponse", "function_response") {
        let id = str_field(resp, "id")
            .or_else(|| str_field(resp, "name"))
            .unwrap_or_default();
        return Some(Err(ContentBlock::ToolResult {
            tool_use_id: id.to_string(),
            content: response_text(resp.get("response")),
            is_error: None,
        }));
    }
    None
}

fn image_part(block: &ContentBlock) -> Option<Value> {
    let ContentBlock::Image {
        source,
        media_type,
        data,
        url,
    } = block
    else {
        return None;
    };
    Some(match source {
        ImageSource::Base64 => json!({
            "inlineData": {
                "mimeType": media_type.as_deref().unwrap_or("image/png"),
                "data": data.as_deref().unwrap_or_default(),
            }
        }),
        ImageSource::Url => {
            let mut file = json!({"fileUri": url.as_deref().unwrap_or_default()});
            if let Some(media_type) = media_type {
                file["mimeType"] = json!(media_type);
            }
            json!({"fileData": file})
        }
    })
}

fn parts_json(blocks: &[ContentBlock], tool_names: &HashMap<String, String>) -> Vec<Value> {
    blocks
        .iter()
        .filter_map(|block| match block {
            ContentBlock::Text { text } => Some(json!({"text": text})),
            ContentBlock::Image { .. } => image_part(block),
            ContentBlock::ToolUse { id, name, input } => Some(json!({
                "functionCall": {"id": id, "name": name, "args": input}
            })),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                ..
            } => {
                let name = tool_names
                    .get(tool_use_id)
                    .map_or(tool_use_id.as_str(), String::as_str);
                Some(json!({
                    "functionResponse": {
                        "id": tool_use_id,
                        "name": name,
                        "response": {"content": content},
                    }
                }))
            }
        })
        .collect()
}

fn parse_usage(value: Option<&Value>) -> Option<Usage> {
    value.filter(|u| u.is_object()).map(|u| {
        let input = u32_field(u, "promptTokenCount").unwrap_or(0);
        let output = u32_field(u, "candidatesTokenCount").unwrap_or(0);
        Usage {
            input_tokens: input,
            output_tokens: output,
            total_tokens: u32_field(u, "totalTokenCount").unwrap_or(input + output),
        }
    })
}

fn usage_json(usage: &Usage) -> Value {
    json!({
        "promptTokenCount": usage.input_tokens,
        "candidatesTokenCount": usage.output_tokens,
        "totalTokenCount": usage.total_tokens,
    })
}

fn first_candidate(value: &Value) -> Option<&Value> {
    value
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|c| c.first())
}

fn candidate_parts(candidate: &Value) -> impl Iterator<Item = &Value> {
    candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

impl Translator for GeminiTranslator {
    fn format(&self) -> ApiFormat {
        FORMAT
    }

    fn parse_request(&self, body: &[u8]) -> GatewayResult<UnifiedRequest> {
        let value = parse_json(FORMAT, body)?;
        let system = system_text(field(&value, "systemInstruction", "system_instruction"));

        let mut messages = Vec::new();
        for content in value
            .get("contents")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let role = match str_field(content, "role") {
                Some("model" | "assistant") => Role::Assistant,
                _ => Role::User,
            };
            let mut blocks = Vec::new();
            for part in content
                .get("parts")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                match parse_part(part) {
                    Some(Ok(block)) => blocks.push(block),
                    Some(Err(result)) => messages.push(UnifiedMessage::blocks(Role::Tool, vec![result])),
                    None => {}
                }
            }
            if !blocks.is_empty() {
                messages.push(UnifiedMessage {
                    role,
                    content: MessageContent::from_blocks(blocks),
                });
            }
        }

        let config = field(&value, "generationConfig", "generation_config").unwrap_or(&Value::Null);
        let tools = value
            .get("tools")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|t| field(t, "functionDeclarations", "function_declarations"))
            .filter_map(Value::as_array)
            .flatten()
            .filter_map(|decl| {
                Some(ToolDefinition {
                    name: str_field(decl, "name")?.to_string(),
                    description: str_field(decl, "description").map(String::from),
                    input_schema: decl
                        .get("parameters")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                })
            })
            .collect();

        Ok(UnifiedRequest {
            model: str_field(&value, "model").unwrap_or_default().to_string(),
            messages,
            system_prompt: (!system.is_empty()).then_some(system),
            max_tokens: field(config, "maxOutputTokens", "max_output_tokens")
                .and_then(Value::as_u64)
                .map(|v| v as u32),
            temperature: f32_field(config, "temperature"),
            top_p: field(config, "topP", "top_p")
                .and_then(Value::as_f64)
                .map(|v| v as f32),
            stop_sequences: string_list(field(config, "stopSequences", "stop_sequences")),
            tools,
            stream: value.get("stream").and_then(Value::as_bool).unwrap_or(false),
            metadata: Map::new(),
        })
    }

    fn build_request(&self, request: &UnifiedRequest) -> GatewayResult<Bytes> {
        let tool_names: HashMap<String, String> = request
            .messages
            .iter()
            .flat_map(|m| m.content.to_blocks())
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, .. } => Some((id, name)),
                _ => None,
            })
            .collect();

        let mut contents: Vec<Value> = Vec::with_capacity(request.messages.len());
        for message in &request.messages {
            let role = if message.role == Role::Assistant { "model" } else { "user" };
            let parts = parts_json(&message.content.to_blocks(), &tool_names);
            match contents.last_mut() {
                Some(last) if last["role"] == role => {
                    if let Some(existing) = last["parts"].as_array_mut() {
                        existing.extend(parts);
                    }
                }
                _ => contents.push(json!({"role": role, "parts": parts})),
            }
        }

        let mut body = Map::new();
        body.insert("contents".into(), Value::Array(contents));
        if let Some(system) = &request.system_prompt {
            body.insert(
                "systemInstruction".into(),
                json!({"parts": [{"text": system}]}),
            );
        }

        let mut config = Map::new();
        if let Some(max_tokens) = request.max_tokens {
            config.insert("maxOutputTokens".into(), json!(max_tokens));
        }
        if let Some(temperature) = request.temperature {
            config.insert("temperature".into(), json!(temperature));
        }
        if let Some(top_p) = request.top_p {
            config.insert("topP".into(), json!(top_p));
        }
        if !request.stop_sequences.is_empty() {
            config.insert("stopSequences".into(), json!(request.stop_sequences));
        }
        if !config.is_empty() {
            body.insert("generationConfig".into(), Value::Object(config));
        }

        if !request.tools.is_empty() {
            let declarations: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    let mut decl = json!({"name": t.name, "parameters": t.input_schema});
                    if let Some(description) = &t.description {
                        decl["description"] = json!(description);
                    }
                    decl
                })
                .collect();
            body.insert(
                "tools".into(),
                json!([{"functionDeclarations": declarations}]),
            );
        }
        to_bytes(FORMAT, &Value::Object(body))
    }

    fn parse_response(&self, body: &[u8]) -> GatewayResult<UnifiedResponse> {
        let value = parse_json(FORMAT, body)?;
        let candidate = first_candidate(&value)
            .ok_or_else(|| GatewayError::translation(FORMAT, "response has no candidates"))?;

        let content: Vec<ContentBlock> = candidate_parts(candidate)
            .filter_map(parse_part)
            .filter_map(Result::ok)
            .collect();
        let has_calls = content
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolUse { .. }));
        let stop_reason = if has_calls {
            Some(StopReason::ToolUse)
        } else {
            str_field(candidate, "finishReason").map(stop_reason_from_gemini)
        };

        Ok(UnifiedResponse {
            id: str_field(&value, "responseId")
                .map_or_else(|| format!("gemini-{}", uuid::Uuid::new_v4()), String::from),
            model: str_field(&value, "modelVersion").unwrap_or_default().to_string(),
            content,
            stop_reason,
            usage: parse_usage(value.get("usageMetadata")).unwrap_or_default(),
        })
    }

    fn build_response(&self, response: &UnifiedResponse) -> GatewayResult<Bytes> {
        let parts = parts_json(&response.content, &HashMap::new());
        let mut candidate = json!({
            "content": {"role": "model", "parts": parts},
            "index": 0,
        });
        if let Some(reason) = response.stop_reason {
            candidate["finishReason"] = json!(stop_reason_to_gemini(reason));
        }
        let body = json!({
            "candidates": [candidate],
            "usageMetadata": usage_json(&response.usage),
            "modelVersion": response.model,
            "responseId": response.id,
        });
        to_bytes(FORMAT, &body)
    }

    fn parse_stream_events(&self, chunk: &str) -> Vec<StreamDelta> {
        let mut events = Vec::new();
        for payload in data_payloads(chunk) {
            let Ok(value) = serde_json::from_str::<Value>(payload) else {
                continue;
            };
            let Some(candidate) = first_candidate(&value) else {
                continue;
            };
            let mut has_calls = false;
            for (position, part) in candidate_parts(candidate).enumerate() {
                match parse_part(part) {
                    Some(Ok(ContentBlock::Text { text })) if !text.is_empty() => {
                        events.push(StreamDelta::text(0, text));
                    }
                    Some(Ok(ContentBlock::ToolUse { id, name, input })) => {
                        has_calls = true;
                        let index = position as u32 + 1;
                        events.push(StreamDelta::block_start(
                            index,
                            ContentBlock::ToolUse {
                                id,
                                name,
                                input: json!({}),
                            },
                        ));
                        events.push(StreamDelta::partial_json(index, input.to_string()));
                        events.push(StreamDelta::block_stop(index));
                    }
                    _ => {}
                }
            }
            if let Some(reason) = str_field(candidate, "finishReason") {
                let stop = if has_calls {
                    StopReason::ToolUse
                } else {
                    stop_reason_from_gemini(reason)
                };
                events.push(StreamDelta::message_delta(
                    Some(stop),
                    parse_usage(value.get("usageMetadata")),
                ));
            }
        }
        events
    }

    fn build_stream_chunk(&self, delta: &StreamDelta) -> String {
        let parts = match (delta.kind, &delta.delta, &delta.content_block) {
            (StreamDeltaType::ContentBlockDelta, Some(DeltaPayload::Text(text)), _) => {
                vec![json!({"text": text})]
            }
            // Tool calls arrive here whole; partial input has no Gemini form
            (
                StreamDeltaType::ContentBlockStart,
                _,
                Some(ContentBlock::ToolUse { id, name, input }),
            ) => {
                vec![json!({"functionCall": {"id": id, "name": name, "args": input}})]
            }
            (StreamDeltaType::MessageDelta, _, _) => Vec::new(),
            _ => return String::new(),
        };

        let mut candidate = json!({
            "content": {"role": "model", "parts": parts},
            "index": 0,
        });
        let mut chunk = json!({});
        if delta.kind == StreamDeltaType::MessageDelta {
            candidate["finishReason"] = json!(stop_reason_to_gemini(
                delta.stop_reason.unwrap_or(StopReason::EndTurn)
            ));
            if let Some(usage) = &delta.usage {
                chunk["usageMetadata"] = usage_json(usage);
            }
        }
        chunk["candidates"] = json!([candidate]);
        format!("data: {chunk}\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translator() -> GeminiTranslator {
        GeminiTranslator::new()
    }

    #[test]
    fn test_parse_request_both_spellings() {
        let camel = json!({
            "systemInstruction": {"parts": [{"text": "sys"}]},
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
            "generationConfig": {"maxOutputTokens": 32, "topP": 0.5}
        });
        let snake = json!({
            "system_instruction": {"parts": [{"text": "sys"}]},
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
            "generation_config": {"max_output_tokens": 32, "top_p": 0.5}
        });
        let a = translator().parse_request(camel.to_string().as_bytes()).unwrap();
        let b = translator().parse_request(snake.to_string().as_bytes()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.system_prompt.as_deref(), Some("sys"));
        assert_eq!(a.max_tokens, Some(32));
    }

    #[test]
    fn test_function_response_resolves_name() {
        let req = UnifiedRequest {
            model: "gemini-1.5-pro".into(),
            messages: vec![
                UnifiedMessage::text(Role::User, "weather?"),
                UnifiedMessage::blocks(
                    Role::Assistant,
                    vec![ContentBlock::ToolUse {
                        id: "call_1".into(),
                        name: "get_weather".into(),
                        input: json!({"city": "Rome"}),
                    }],
                ),
                UnifiedMessage::tool_result("call_1", "sunny", None),
            ],
            ..Default::default()
        };
        let body: Value = serde_json::from_slice(&translator().build_request(&req).unwrap()).unwrap();
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["name"], "get_weather");
        assert_eq!(contents[2]["role"], "user");
        assert_eq!(contents[2]["parts"][0]["functionResponse"]["name"], "get_weather");
        assert_eq!(
            contents[2]["parts"][0]["functionResponse"]["response"]["content"],
            "sunny"
        );
    }

    #[test]
    fn test_roundtrip_is_stable() {
        let req = UnifiedRequest {
            model: String::new(),
            system_prompt: Some("rules".into()),
            max_tokens: Some(10),
            messages: vec![
                UnifiedMessage::text(Role::User, "hello"),
                UnifiedMessage::text(Role::Assistant, "hi"),
                UnifiedMessage::blocks(
                    Role::User,
                    vec![
                        ContentBlock::text("see"),
                        ContentBlock::base64_image("image/png", "AAAA"),
                    ],
                ),
            ],
            ..Default::default()
        };
        let t = translator();
        let first = t.parse_request(&t.build_request(&req).unwrap()).unwrap();
        let second = t.parse_request(&t.build_request(&first).unwrap()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.messages, req.messages);
    }

    #[test]
    fn test_parse_response() {
        let body = json!({
            "candidates": [{
                "content": {"role": "model", "parts": [{"text": "Hello "}, {"text": "there"}]},
                "finishReason": "MAX_TOKENS"
            }],
            "usageMetadata": {"promptTokenCount": 2, "candidatesTokenCount": 3, "totalTokenCount": 5},
            "modelVersion": "gemini-1.5-flash"
        });
        let resp = translator().parse_response(body.to_string().as_bytes()).unwrap();
        assert_eq!(resp.text(), "Hello there");
        assert_eq!(resp.stop_reason, Some(StopReason::MaxTokens));
        assert_eq!(resp.usage, Usage::new(2, 3));
        assert!(resp.id.starts_with("gemini-"));
    }

    #[test]
    fn test_function_call_response_stops_for_tool_use() {
        let body = json!({
            "candidates": [{
                "content": {"parts": [{"functionCall": {"name": "lookup", "args": {"q": 1}}}]},
                "finishReason": "STOP"
            }]
        });
        let resp = translator().parse_response(body.to_string().as_bytes()).unwrap();
        assert_eq!(resp.stop_reason, Some(StopReason::ToolUse));
        assert!(matches!(&resp.content[0], ContentBlock::ToolUse { name, .. } if name == "lookup"));
    }

    #[test]
    fn test_stream_events() {
        let t = translator();
        let chunk = "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hi\"}]},\"finishReason\":\"STOP\"}],\"usageMetadata\":{\"promptTokenCount\":1,\"candidatesTokenCount\":1}}";
        let events = t.parse_stream_events(chunk);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], StreamDelta::text(0, "Hi"));
        assert_eq!(events[1].kind, StreamDeltaType::MessageDelta);
        assert_eq!(events[1].stop_reason, Some(StopReason::EndTurn));
        assert_eq!(t.parse_stream_chunk("data: nope"), None);
    }

    #[test]
    fn test_build_stream_chunks() {
        let t = translator();
        let text = t.build_stream_chunk(&StreamDelta::text(0, "yo"));
        assert!(text.contains("\"text\":\"yo\""));
        assert!(t.build_stream_chunk(&StreamDelta::message_stop()).is_empty());

        let done = t.build_stream_chunk(&StreamDelta::message_delta(Some(StopReason::MaxTokens), None));
        assert!(done.contains("MAX_TOKENS"));
    }
}
