//! Unified message model.
//!
//! The format-neutral pivot every translator reads and writes:
//!
//! ```text
//! caller bytes → UnifiedRequest → provider bytes → UnifiedResponse → caller bytes
//! ```
//!
//! No translator talks to another translator directly.

use crate::error::GatewayError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Role of a message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System instructions
    System,
    /// End user
    User,
    /// Model output
    Assistant,
    /// Tool result fed back to the model
    Tool,
}

/// Where the bytes of an image live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageSource {
    /// Inline base64 payload
    Base64,
    /// Remote URL
    Url,
}

/// One typed block of message content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text
    Text {
        /// The text
        text: String,
    },
    /// Image, inline or by reference
    Image {
        /// Inline or remote
        source: ImageSource,
        /// MIME type for inline data
        #[serde(default, skip_serializing_if = "Option::is_none")]
        media_type: Option<String>,
        /// Base64 data when `source` is base64
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<String>,
        /// URL when `source` is url
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    /// Tool invocation requested by the model
    ToolUse {
        /// Call identifier
        id: String,
        /// Tool name
        name: String,
        /// Tool arguments
        input: Value,
    },
    /// Result of a tool invocation
    ToolResult {
        /// Identifier of the `tool_use` this answers
        tool_use_id: String,
        /// Result text
        content: String,
        /// Whether the tool failed
        #[serde(default, skip_serializing_if = "Option::is_none")]
        is_error: Option<bool>,
    },
}

impl ContentBlock {
    /// Create a text block
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// Create an inline base64 image block
    pub fn base64_image(media_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self::Image {
            source: ImageSource::Base64,
            media_type: Some(media_type.into()),
            data: Some(data.into()),
            url: None,
        }
    }

    /// Create a remote image block
    pub fn image_url(url: impl Into<String>) -> Self {
        Self::Image {
            source: ImageSource::Url,
            media_type: None,
            data: None,
            url: Some(url.into()),
        }
    }

    /// Text of a text block
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }

    /// Whether the block is a tool call, tool result or image
    #[must_use]
    pub fn is_structured(&self) -> bool {
        !matches!(self, Self::Text { .. })
    }
}

/// Message content: a plain string or an ordered list of blocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text
    Text(String),
    /// Typed blocks
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    /// Collapse blocks: a lone text block becomes a plain string, anything
    /// carrying tool calls or images stays a block array.
    #[must_use]
    pub fn from_blocks(mut blocks: Vec<ContentBlock>) -> Self {
        if blocks.len() == 1 {
            if let Some(ContentBlock::Text { .. }) = blocks.first() {
                if let Some(ContentBlock::Text { text }) = blocks.pop() {
                    return Self::Text(text);
                }
            }
        }
        Self::Blocks(blocks)
    }

    /// View as blocks, wrapping plain text in a single text block
    #[must_use]
    pub fn to_blocks(&self) -> Vec<ContentBlock> {
        match self {
            Self::Text(text) => vec![ContentBlock::text(text.clone())],
            Self::Blocks(blocks) => blocks.clone(),
        }
    }

    /// Concatenated text of every text block
    #[must_use]
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Blocks(blocks) => blocks
                .iter()
                .filter_map(ContentBlock::as_text)
                .collect::<Vec<_>>()
                .join(""),
        }
    }

    /// Whether there is no content at all
    #[must_use]
    pub fn is_empty(&self) -> bool {
        match self {
            Self::Text(text) => text.is_empty(),
            Self::Blocks(blocks) => blocks.is_empty(),
        }
    }
}

/// One message of a conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedMessage {
    /// Author role
    pub role: Role,
    /// Content
    pub content: MessageContent,
}

impl UnifiedMessage {
    /// Create a plain text message
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: MessageContent::Text(text.into()),
        }
    }

    /// Create a block message
    #[must_use]
    pub fn blocks(role: Role, blocks: Vec<ContentBlock>) -> Self {
        Self {
            role,
            content: MessageContent::Blocks(blocks),
        }
    }

    /// Create a tool-role message carrying exactly one tool result
    pub fn tool_result(
        tool_use_id: impl Into<String>,
        content: impl Into<String>,
        is_error: Option<bool>,
    ) -> Self {
        Self::blocks(
            Role::Tool,
            vec![ContentBlock::ToolResult {
                tool_use_id: tool_use_id.into(),
                content: content.into(),
                is_error,
            }],
        )
    }

    /// Check the structural invariants of the message
    ///
    /// # Errors
    /// Returns a validation error when a tool message does not carry exactly
    /// one `tool_result` block
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.role != Role::Tool {
            return Ok(());
        }
        if let MessageContent::Blocks(blocks) = &self.content {
            let results = blocks
                .iter()
                .filter(|b| matches!(b, ContentBlock::ToolResult { .. }))
                .count();
            if results != 1 || blocks.len() != 1 {
                return Err(GatewayError::validation(
                    "tool messages must carry exactly one tool_result block",
                    Some("messages".to_string()),
                    "invalid_tool_message",
                ));
            }
        }
        Ok(())
    }
}

/// Tool made available to the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// Tool name
    pub name: String,
    /// Description shown to the model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema of the tool input
    pub input_schema: Value,
}

/// Format-neutral chat request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnifiedRequest {
    /// Requested model
    pub model: String,
    /// Conversation, never containing system-role messages
    pub messages: Vec<UnifiedMessage>,
    /// Hoisted system prompt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    /// Generation limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Nucleus sampling cutoff
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    /// Stop sequences
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop_sequences: Vec<String>,
    /// Tools available to the model
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolDefinition>,
    /// Whether the caller wants a streamed response
    #[serde(default)]
    pub stream: bool,
    /// Free-form metadata
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl UnifiedRequest {
    /// Validate the request
    ///
    /// # Errors
    /// Returns error if the model is missing, there are no messages, or a
    /// message breaks its invariants
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.model.trim().is_empty() {
            return Err(GatewayError::validation(
                "model is required",
                Some("model".to_string()),
                "missing_model",
            ));
        }
        if self.messages.is_empty() {
            return Err(GatewayError::validation(
                "messages cannot be empty",
                Some("messages".to_string()),
                "empty_messages",
            ));
        }
        self.messages.iter().try_for_each(UnifiedMessage::validate)
    }
}

/// Why generation stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Natural end of turn
    EndTurn,
    /// Token limit reached
    MaxTokens,
    /// A stop sequence matched
    StopSequence,
    /// The model requested a tool call
    ToolUse,
}

/// Token accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens
    pub input_tokens: u32,
    /// Completion tokens
    pub output_tokens: u32,
    /// Sum of both
    pub total_tokens: u32,
}

impl Usage {
    /// Create usage, computing the total
    #[must_use]
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
        }
    }
}

/// Format-neutral chat response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnifiedResponse {
    /// Response identifier
    pub id: String,
    /// Model that produced the response
    pub model: String,
    /// Generated content
    pub content: Vec<ContentBlock>,
    /// Stop reason
    pub stop_reason: Option<StopReason>,
    /// Token usage
    pub usage: Usage,
}

impl UnifiedResponse {
    /// Concatenated text output
    #[must_use]
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(ContentBlock::as_text)
            .collect::<Vec<_>>()
            .join("")
    }
}

/// Discriminator of a streaming delta
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamDeltaType {
    /// Start of the assistant message
    MessageStart,
    /// Start of a content block (carries the block, e.g. a tool call header)
    ContentBlockStart,
    /// Incremental text or partial tool-input JSON
    ContentBlockDelta,
    /// End of a content block
    ContentBlockStop,
    /// Message level update: stop reason and final usage
    MessageDelta,
    /// End of the message
    MessageStop,
}

/// Incremental payload of a `content_block_delta`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum DeltaPayload {
    /// Text fragment
    Text(String),
    /// Fragment of tool input JSON
    PartialJson(String),
}

/// One streaming event in format-neutral form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDelta {
    /// Event type
    #[serde(rename = "type")]
    pub kind: StreamDeltaType,
    /// Content block index
    #[serde(default)]
    pub index: u32,
    /// Message id (message_start)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Model (message_start)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Block header (content_block_start)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_block: Option<ContentBlock>,
    /// Incremental payload (content_block_delta)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<DeltaPayload>,
    /// Stop reason (message_delta)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
    /// Usage (message_start / message_delta)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl StreamDelta {
    fn of(kind: StreamDeltaType) -> Self {
        Self {
            kind,
            index: 0,
            id: None,
            model: None,
            content_block: None,
            delta: None,
            stop_reason: None,
            usage: None,
        }
    }

    /// `message_start` event
    pub fn message_start(id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            model: Some(model.into()),
            ..Self::of(StreamDeltaType::MessageStart)
        }
    }

    /// `content_block_start` event
    #[must_use]
    pub fn block_start(index: u32, block: ContentBlock) -> Self {
        Self {
            index,
            content_block: Some(block),
            ..Self::of(StreamDeltaType::ContentBlockStart)
        }
    }

    /// Text `content_block_delta`
    pub fn text(index: u32, text: impl Into<String>) -> Self {
        Self {
            index,
            delta: Some(DeltaPayload::Text(text.into())),
            ..Self::of(StreamDeltaType::ContentBlockDelta)
        }
    }

    /// Partial tool-input JSON `content_block_delta`
    pub fn partial_json(index: u32, json: impl Into<String>) -> Self {
        Self {
            index,
            delta: Some(DeltaPayload::PartialJson(json.into())),
            ..Self::of(StreamDeltaType::ContentBlockDelta)
        }
    }

    /// `content_block_stop` event
    #[must_use]
    pub fn block_stop(index: u32) -> Self {
        Self {
            index,
            ..Self::of(StreamDeltaType::ContentBlockStop)
        }
    }

    /// `message_delta` event
    #[must_use]
    pub fn message_delta(stop_reason: Option<StopReason>, usage: Option<Usage>) -> Self {
        Self {
            stop_reason,
            usage,
            ..Self::of(StreamDeltaType::MessageDelta)
        }
    }

    /// `message_stop` event
    #[must_use]
    pub fn message_stop() -> Self {
        Self::of(StreamDeltaType::MessageStop)
    }
}
