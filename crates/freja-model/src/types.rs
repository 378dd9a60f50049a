use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ─── Content part types ───────────────────────────────────────────────────────

/// A single content part in a multi-part message.
///
/// Assistant messages may mix `Text`, `Reasoning`, and `FunctionCall` parts;
/// tool messages carry `FunctionResult` parts.  Images and binary payloads are
/// carried as base64 or by reference so every part serializes cleanly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    /// Model reasoning.  Displayed on the event stream; persisted into
    /// history only when the agent is configured to preserve it.
    Reasoning {
        text: String,
        /// Opaque provider trace (signature blob etc.), forwarded verbatim.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        trace: Option<Value>,
    },
    FunctionCall {
        call_id: String,
        name: String,
        args: Map<String, Value>,
    },
    FunctionResult {
        call_id: String,
        value: Value,
    },
    Image {
        mime: String,
        source: ImageSource,
    },
    Binary {
        mime: String,
        /// Base64-encoded payload.
        data: String,
    },
    Json {
        value: Value,
    },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self::Reasoning { text: text.into(), trace: None }
    }

    pub fn function_call(
        call_id: impl Into<String>,
        name: impl Into<String>,
        args: Map<String, Value>,
    ) -> Self {
        Self::FunctionCall { call_id: call_id.into(), name: name.into(), args }
    }

    pub fn function_result(call_id: impl Into<String>, value: Value) -> Self {
        Self::FunctionResult { call_id: call_id.into(), value }
    }

    /// Encode raw bytes into a `Binary` part.
    pub fn binary(mime: impl Into<String>, bytes: &[u8]) -> Self {
        use base64::Engine;
        Self::Binary {
            mime: mime.into(),
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }

    pub fn is_function_call(&self) -> bool {
        matches!(self, Self::FunctionCall { .. })
    }

    pub fn is_reasoning(&self) -> bool {
        matches!(self, Self::Reasoning { .. })
    }
}

/// Where an image's bytes live.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageSource {
    Url { url: String },
    /// Base64-encoded inline bytes.
    Bytes { data: String },
    /// Provider-side file reference.
    Id { id: String },
}

// ─── Message types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A single message in the conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub contents: Vec<ContentPart>,
    /// Prompt tokens attributed to this message by usage accounting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u32>,
    /// Completion tokens attributed to this message by usage accounting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u32>,
}

impl Message {
    pub fn new(role: Role, contents: Vec<ContentPart>) -> Self {
        Self { role, contents, input_tokens: None, output_tokens: None }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![ContentPart::text(text)])
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![ContentPart::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![ContentPart::text(text)])
    }

    /// A tool-role message aggregating one or more function results.
    pub fn tool_results(parts: Vec<ContentPart>) -> Self {
        Self::new(Role::Tool, parts)
    }

    /// Concatenated text of all `Text` parts.
    pub fn text(&self) -> String {
        self.contents
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// The plain text of this message when it has exactly one text part.
    pub fn as_text(&self) -> Option<&str> {
        match self.contents.as_slice() {
            [ContentPart::Text { text }] => Some(text),
            _ => None,
        }
    }

    /// All function-call parts in order of appearance.
    pub fn function_calls(&self) -> Vec<&ContentPart> {
        self.contents.iter().filter(|p| p.is_function_call()).collect()
    }

    pub fn has_function_calls(&self) -> bool {
        self.contents.iter().any(ContentPart::is_function_call)
    }

    /// Character length of the textual content, used for proportional
    /// output-token attribution.
    pub fn text_len(&self) -> usize {
        self.contents
            .iter()
            .map(|p| match p {
                ContentPart::Text { text } => text.len(),
                ContentPart::Reasoning { text, .. } => text.len(),
                _ => 0,
            })
            .sum()
    }
}

// ─── Requests ─────────────────────────────────────────────────────────────────

/// Sampling and generation options, merged default-then-override per turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
}

impl ChatOptions {
    /// Produce a copy of `self` with every set field of `overlay` winning.
    pub fn merged(&self, overlay: &ChatOptions) -> ChatOptions {
        ChatOptions {
            temperature: overlay.temperature.or(self.temperature),
            top_p: overlay.top_p.or(self.top_p),
            max_output_tokens: overlay.max_output_tokens.or(self.max_output_tokens),
            stop: if overlay.stop.is_empty() { self.stop.clone() } else { overlay.stop.clone() },
        }
    }
}

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: Value,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub options: ChatOptions,
}

// ─── Streamed responses ───────────────────────────────────────────────────────

/// A function call assembled by the provider from streamed fragments.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCallPart {
    pub call_id: String,
    pub name: String,
    pub args: Map<String, Value>,
}

/// A single streamed update from the model.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseUpdate {
    TextDelta(String),
    ReasoningStart,
    ReasoningDelta(String),
    ReasoningEnd {
        /// Opaque provider trace attached to the finished reasoning block.
        trace: Option<Value>,
    },
    FunctionCall(FunctionCallPart),
    Usage(Usage),
    Finished(FinishReason),
}

/// Why the model stopped generating.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    ToolCalls,
    MaxTokens,
    ContentFilter,
    Other(String),
}

/// Token usage from one model invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
