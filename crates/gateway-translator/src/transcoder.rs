//! Streaming re-encoding between wire formats.
//!
//! The transcoder consumes raw upstream bytes, reassembles SSE lines, parses
//! them with the upstream translator and renders every delta with the
//! caller's translator. It normalizes the event sequence on the way:
//!
//! ```text
//! message_start
//!   (content_block_start  content_block_delta*  content_block_stop)*
//! message_delta
//! message_stop
//! ```
//!
//! so Anthropic callers always see balanced block events even when the
//! upstream (OpenAI, Gemini) has no notion of blocks, and every stream ends
//! with exactly one terminal event.

use crate::sse::{data_payloads, SseLineBuffer};
use crate::Translator;
use gateway_core::{
    ApiFormat, ContentBlock, DeltaPayload, GatewayError, GatewayResult, StopReason, StreamDelta,
    StreamDeltaType, Usage,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
struct ToolState {
    ordinal: u32,
    id: String,
    name: String,
    input: String,
}

#[derive(Debug)]
struct OpenBlock {
    index: u32,
    tool: Option<ToolState>,
}

/// Stateful SSE transcoder for one streamed response
pub struct StreamTranscoder {
    upstream: Arc<dyn Translator>,
    caller: Arc<dyn Translator>,
    provider: String,
    lines: SseLineBuffer,
    message_id: String,
    model: String,
    input_usage: Option<Usage>,
    stop_reason: Option<StopReason>,
    started: bool,
    delta_sent: bool,
    finished: bool,
    open: Option<OpenBlock>,
    next_index: u32,
    tool_count: u32,
}

impl std::fmt::Debug for StreamTranscoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTranscoder")
            .field("upstream", &self.upstream.format())
            .field("caller", &self.caller.format())
            .field("provider", &self.provider)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl StreamTranscoder {
    /// Create a transcoder from `upstream` format to `caller` format.
    ///
    /// `model` is used for the synthesized `message_start` when the upstream
    /// never announces one.
    pub fn new(
        upstream: Arc<dyn Translator>,
        caller: Arc<dyn Translator>,
        provider: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            upstream,
            caller,
            provider: provider.into(),
            lines: SseLineBuffer::new(),
            message_id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            model: model.into(),
            input_usage: None,
            stop_reason: None,
            started: false,
            delta_sent: false,
            finished: false,
            open: None,
            next_index: 0,
            tool_count: 0,
        }
    }

    /// Whether upstream and caller share a format (bytes are forwarded as-is)
    #[must_use]
    pub fn is_passthrough(&self) -> bool {
        self.upstream.format() == self.caller.format()
    }

    /// Whether the terminal event has been emitted
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed raw upstream bytes, returning rendered caller chunks.
    ///
    /// # Errors
    /// Returns a status error when the upstream embedded an error payload in
    /// the stream
    pub fn push(&mut self, bytes: &[u8]) -> GatewayResult<Vec<String>> {
        let mut out = Vec::new();
        for line in self.lines.push(bytes) {
            self.process_line(&line, &mut out)?;
        }
        Ok(out)
    }

    /// Flush buffered input and close the stream.
    ///
    /// Synthesizes the closing events when the upstream ended without them;
    /// passthrough streams are forwarded untouched.
    pub fn finish(&mut self) -> GatewayResult<Vec<String>> {
        let mut out = Vec::new();
        if let Some(tail) = self.lines.finish() {
            self.process_line(&tail, &mut out)?;
        }
        if !self.is_passthrough() && !self.finished {
            self.close_message(&mut out);
        }
        Ok(out)
    }

    fn process_line(&mut self, line: &str, out: &mut Vec<String>) -> GatewayResult<()> {
        let trimmed = line.trim();
        if self.is_passthrough() {
            check_stream_error(&self.provider, trimmed)?;
            out.push(format!("{line}\n"));
            return Ok(());
        }
        if trimmed.is_empty() || (!trimmed.starts_with("data:") && !trimmed.starts_with('{')) {
            return Ok(());
        }
        check_stream_error(&self.provider, trimmed)?;
        for delta in self.upstream.parse_stream_events(trimmed) {
            self.handle(delta, out);
        }
        Ok(())
    }

    fn handle(&mut self, delta: StreamDelta, out: &mut Vec<String>) {
        if self.finished {
            debug!(provider = %self.provider, "Ignoring event after stream end");
            return;
        }
        match delta.kind {
            StreamDeltaType::MessageStart => {
                if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
                    self.message_id = id;
                }
                if let Some(model) = delta.model.filter(|m| !m.is_empty()) {
                    self.model = model;
                }
                self.input_usage = delta.usage.or(self.input_usage);
                self.ensure_started(out);
            }
            StreamDeltaType::ContentBlockStart => {
                self.ensure_started(out);
                match delta.content_block {
                    Some(ContentBlock::ToolUse { id, name, .. }) => self.open_tool(id, name, out),
                    Some(ContentBlock::Text { .. }) => {
                        self.close_block(out);
                        self.open_text(out);
                    }
                    _ => {}
                }
            }
            StreamDeltaType::ContentBlockDelta => {
                self.ensure_started(out);
                match delta.delta {
                    Some(DeltaPayload::Text(text)) => {
                        let in_text = self.open.as_ref().is_some_and(|b| b.tool.is_none());
                        if !in_text {
                            self.close_block(out);
                            self.open_text(out);
                        }
                        let index = self.open.as_ref().map_or(0, |b| b.index);
                        self.emit(StreamDelta::text(index, text), out);
                    }
                    Some(DeltaPayload::PartialJson(json)) => self.append_tool_input(json, out),
                    None => {}
                }
            }
            StreamDeltaType::ContentBlockStop => self.close_block(out),
            StreamDeltaType::MessageDelta => {
                self.ensure_started(out);
                self.close_block(out);
                self.stop_reason = delta.stop_reason.or(self.stop_reason);
                let stop = self.stop_reason.or(Some(StopReason::EndTurn));
                self.delta_sent = true;
                self.emit(StreamDelta::message_delta(stop, delta.usage), out);
            }
            StreamDeltaType::MessageStop => self.close_message(out),
        }
    }

    fn ensure_started(&mut self, out: &mut Vec<String>) {
        if self.started {
            return;
        }
        self.started = true;
        let mut start = StreamDelta::message_start(self.message_id.clone(), self.model.clone());
        start.usage = self.input_usage;
        self.emit(start, out);
    }

    fn open_text(&mut self, out: &mut Vec<String>) {
        let index = self.next_index;
        self.next_index += 1;
        self.open = Some(OpenBlock { index, tool: None });
        self.emit(StreamDelta::block_start(index, ContentBlock::text("")), out);
    }

    fn open_tool(&mut self, id: String, name: String, out: &mut Vec<String>) {
        self.close_block(out);
        let index = self.next_index;
        self.next_index += 1;
        let ordinal = self.tool_count;
        self.tool_count += 1;

        if self.caller.format() != ApiFormat::Gemini {
            let block = ContentBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: serde_json::json!({}),
            };
            self.emit(StreamDelta::block_start(self.wire_index(index, ordinal), block), out);
        }
        self.open = Some(OpenBlock {
            index,
            tool: Some(ToolState {
                ordinal,
                id,
                name,
                input: String::new(),
            }),
        });
    }

    fn append_tool_input(&mut self, json: String, out: &mut Vec<String>) {
        let Some(OpenBlock {
            index,
            tool: Some(tool),
        }) = self.open.as_mut()
        else {
            debug!(provider = %self.provider, "Dropping tool input without an open tool block");
            return;
        };
        tool.input.push_str(&json);
        let (index, ordinal) = (*index, tool.ordinal);
        if self.caller.format() != ApiFormat::Gemini {
            self.emit(StreamDelta::partial_json(self.wire_index(index, ordinal), json), out);
        }
    }

    fn close_block(&mut self, out: &mut Vec<String>) {
        let Some(block) = self.open.take() else {
            return;
        };
        match block.tool {
            Some(tool) if self.caller.format() == ApiFormat::Gemini => {
                let input = serde_json::from_str(&tool.input)
                    .unwrap_or_else(|_| serde_json::json!({}));
                let complete = ContentBlock::ToolUse {
                    id: tool.id,
                    name: tool.name,
                    input,
                };
                self.emit(StreamDelta::block_start(block.index, complete), out);
            }
            Some(tool) => {
                let index = self.wire_index(block.index, tool.ordinal);
                self.emit(StreamDelta::block_stop(index), out);
            }
            None => self.emit(StreamDelta::block_stop(block.index), out),
        }
    }

    fn close_message(&mut self, out: &mut Vec<String>) {
        if self.finished {
            return;
        }
        self.ensure_started(out);
        self.close_block(out);
        if !self.delta_sent {
            self.delta_sent = true;
            let stop = self.stop_reason.unwrap_or(StopReason::EndTurn);
            self.emit(StreamDelta::message_delta(Some(stop), None), out);
        }
        self.emit(StreamDelta::message_stop(), out);
        self.finished = true;
    }

    /// OpenAI addresses tool calls by their ordinal, everyone else by block index
    fn wire_index(&self, index: u32, ordinal: u32) -> u32 {
        if self.caller.format() == ApiFormat::OpenAI {
            ordinal
        } else {
            index
        }
    }

    fn emit(&self, mut delta: StreamDelta, out: &mut Vec<String>) {
        delta.id.get_or_insert_with(|| self.message_id.clone());
        delta.model.get_or_insert_with(|| self.model.clone());
        let rendered = self.caller.build_stream_chunk(&delta);
        if !rendered.is_empty() {
            out.push(rendered);
        }
    }
}

/// Detect an error payload embedded in an SSE line.
///
/// Providers sometimes report failures inside an otherwise successful
/// stream (`{"error": {...}}` or `{"type": "error", ...}`). The status is
/// taken from a numeric `code` when present, else from the error type.
///
/// # Errors
/// Returns the embedded error as a status error attributed to `provider`
pub fn check_stream_error(provider: &str, line: &str) -> GatewayResult<()> {
    for payload in data_payloads(line) {
        let Ok(value) = serde_json::from_str::<Value>(payload) else {
            continue;
        };
        let is_error = value.get("type").and_then(Value::as_str) == Some("error");
        let Some(error) = value.get("error").filter(|e| !e.is_null()) else {
            if is_error {
                return Err(GatewayError::status(provider, 500, payload));
            }
            continue;
        };
        let status = error
            .get("code")
            .and_then(Value::as_u64)
            .filter(|code| (400..600).contains(code))
            .map(|code| code as u16)
            .unwrap_or_else(|| match error.get("type").and_then(Value::as_str) {
                Some("invalid_request_error") => 400,
                Some("authentication_error") => 401,
                Some("permission_error") => 403,
                Some("not_found_error") => 404,
                Some("rate_limit_error" | "insufficient_quota") => 429,
                Some("overloaded_error") => 529,
                _ => 500,
            });
        return Err(GatewayError::status(provider, status, payload));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AnthropicTranslator, GeminiTranslator, OpenAiTranslator};

    fn transcoder(upstream: Arc<dyn Translator>, caller: Arc<dyn Translator>) -> StreamTranscoder {
        StreamTranscoder::new(upstream, caller, "test", "model-x")
    }

    fn event_names(chunks: &[String]) -> Vec<String> {
        chunks
            .iter()
            .filter_map(|c| c.lines().next())
            .filter_map(|l| l.strip_prefix("event: "))
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_openai_to_anthropic_balances_blocks() {
        let mut t = transcoder(Arc::new(OpenAiTranslator), Arc::new(AnthropicTranslator));
        let upstream = concat!(
            "data: {\"id\":\"c1\",\"model\":\"gpt-4o\",\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"stop\"}]}\n\n",
            "data: [DONE]\n\n",
        );
        let mut chunks = t.push(upstream.as_bytes()).unwrap();
        chunks.extend(t.finish().unwrap());

        assert_eq!(
            event_names(&chunks),
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
        assert!(chunks[0].contains("\"id\":\"c1\""));
        assert!(t.is_finished());
    }

    #[test]
    fn test_anthropic_to_openai_tool_call() {
        let mut t = transcoder(Arc::new(AnthropicTranslator), Arc::new(OpenAiTranslator));
        let upstream = concat!(
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude\"}}\n\n",
            "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"ok\"}}\n\n",
            "event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
            "event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":1,\"content_block\":{\"type\":\"tool_use\",\"id\":\"toolu_1\",\"name\":\"f\",\"input\":{}}}\n\n",
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{}\"}}\n\n",
            "event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":1}\n\n",
            "event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\"},\"usage\":{\"output_tokens\":3}}\n\n",
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
        );
        let chunks = t.push(upstream.as_bytes()).unwrap();

        let tool_start = chunks
            .iter()
            .find(|c| c.contains("\"toolu_1\""))
            .expect("tool call chunk");
        assert!(tool_start.contains("\"index\":0"));
        assert!(chunks.iter().any(|c| c.contains("\"finish_reason\":\"tool_calls\"")));
        assert_eq!(chunks.last().map(String::as_str), Some("data: [DONE]\n\n"));
        assert_eq!(chunks.iter().filter(|c| c.contains("[DONE]")).count(), 1);
    }

    #[test]
    fn test_gemini_stream_gets_terminal_event_on_finish() {
        let mut t = transcoder(Arc::new(GeminiTranslator), Arc::new(OpenAiTranslator));
        let chunks = t
            .push(b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hi\"}]}}]}\n\n")
            .unwrap();
        assert!(chunks[0].contains("\"role\":\"assistant\""));
        assert!(chunks[0].contains("\"model\":\"model-x\""));
        assert!(!t.is_finished());

        let tail = t.finish().unwrap();
        assert_eq!(tail.last().map(String::as_str), Some("data: [DONE]\n\n"));
        assert!(t.finish().unwrap().is_empty());
    }

    #[test]
    fn test_split_chunks_and_duplicate_done() {
        let mut t = transcoder(Arc::new(OpenAiTranslator), Arc::new(AnthropicTranslator));
        let full = "data: {\"choices\":[{\"delta\":{\"content\":\"abc\"}}]}\n\ndata: [DONE]\n\ndata: [DONE]\n\n";
        let (a, b) = full.as_bytes().split_at(17);
        let mut chunks = t.push(a).unwrap();
        assert!(chunks.is_empty());
        chunks.extend(t.push(b).unwrap());
        chunks.extend(t.finish().unwrap());
        assert_eq!(chunks.iter().filter(|c| c.starts_with("event: message_stop")).count(), 1);
    }

    #[test]
    fn test_passthrough_forwards_lines() {
        let mut t = transcoder(Arc::new(OpenAiTranslator), Arc::new(OpenAiTranslator));
        assert!(t.is_passthrough());
        let chunks = t.push(b"data: {\"choices\":[]}\n\n").unwrap();
        assert_eq!(chunks, vec!["data: {\"choices\":[]}\n", "\n"]);
        assert!(t.finish().unwrap().is_empty());
    }

    #[test]
    fn test_embedded_error_is_reported() {
        let mut t = transcoder(Arc::new(AnthropicTranslator), Arc::new(OpenAiTranslator));
        let err = t
            .push(b"event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"busy\"}}\n\n")
            .unwrap_err();
        assert_eq!(err.status_code(), 529);

        let err = check_stream_error("gemini", "data: {\"error\":{\"code\":429,\"message\":\"quota\"}}").unwrap_err();
        assert_eq!(err.status_code(), 429);
        assert!(err.body().is_some_and(|b| b.contains("quota")));

        assert!(check_stream_error("x", "data: {\"choices\":[]}").is_ok());
    }

    #[test]
    fn test_gemini_caller_receives_whole_tool_calls() {
        let mut t = transcoder(Arc::new(OpenAiTranslator), Arc::new(GeminiTranslator));
        let upstream = concat!(
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c\",\"function\":{\"name\":\"f\",\"arguments\":\"{\\\"a\\\":\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"1}\"}}]}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n",
        );
        let chunks = t.push(upstream.as_bytes()).unwrap();
        let call = chunks
            .iter()
            .find(|c| c.contains("functionCall"))
            .expect("function call chunk");
        assert!(call.contains("\"args\":{\"a\":1}"));
    }
}
