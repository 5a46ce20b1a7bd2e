//! Field-Mapping Resolver (§4.3): given an API flavor and stream mode,
//! yields dotted JSON paths for content/reasoning/token-usage fields plus a
//! stream framing descriptor.

use serde::{Deserialize, Serialize};

use crate::error::MappingError;
use crate::models::ApiFlavor;

/// How to split a streamed HTTP body into discrete frames and detect
/// end-of-stream (§4.3, §4.5, GLOSSARY "Stop sentinel").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamFraming {
    /// Prefix stripped from each `data:`-style line before JSON parsing.
    pub data_prefix: String,
    /// Literal payload that signals end-of-stream once prefix-stripped
    /// (e.g. `[DONE]`). Empty string means "no literal sentinel".
    pub stop_sentinel: String,
    /// Dotted path whose value, if it equals `stop_sentinel_field_value`,
    /// signals end-of-stream (e.g. Claude's `type == "message_stop"`).
    pub end_field_path: Option<String>,
    pub end_field_value: Option<String>,
}

impl Default for StreamFraming {
    fn default() -> Self {
        Self {
            data_prefix: "data:".to_string(),
            stop_sentinel: "[DONE]".to_string(),
            end_field_path: None,
            end_field_value: None,
        }
    }
}

/// Dotted JSON paths naming where to read/write semantic fields (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMapping {
    pub flavor: ApiFlavor,
    pub framing: StreamFraming,

    pub content_path_stream: Option<String>,
    pub content_path_nonstream: Option<String>,
    pub reasoning_path_stream: Option<String>,
    pub reasoning_path_nonstream: Option<String>,

    pub prompt_tokens_path: Option<String>,
    pub completion_tokens_path: Option<String>,
    pub total_tokens_path: Option<String>,

    /// Request-builder-only: where to write the prompt/image for `custom` flavor.
    pub prompt_write_path: Option<String>,
    pub image_write_path: Option<String>,
}

impl FieldMapping {
    pub fn content_path(&self, stream: bool) -> Option<&str> {
        if stream {
            self.content_path_stream.as_deref()
        } else {
            self.content_path_nonstream.as_deref()
        }
    }

    pub fn reasoning_path(&self, stream: bool) -> Option<&str> {
        if stream {
            self.reasoning_path_stream.as_deref()
        } else {
            self.reasoning_path_nonstream.as_deref()
        }
    }
}

fn openai_chat_mapping() -> FieldMapping {
    FieldMapping {
        flavor: ApiFlavor::OpenaiChat,
        framing: StreamFraming::default(),
        content_path_stream: Some("choices.0.delta.content".to_string()),
        content_path_nonstream: Some("choices.0.message.content".to_string()),
        reasoning_path_stream: Some("choices.0.delta.reasoning_content".to_string()),
        reasoning_path_nonstream: Some("choices.0.message.reasoning_content".to_string()),
        prompt_tokens_path: Some("usage.prompt_tokens".to_string()),
        completion_tokens_path: Some("usage.completion_tokens".to_string()),
        total_tokens_path: Some("usage.total_tokens".to_string()),
        prompt_write_path: Some("messages.-1.content".to_string()),
        image_write_path: Some("messages.-1.content".to_string()),
    }
}

fn claude_chat_mapping() -> FieldMapping {
    FieldMapping {
        flavor: ApiFlavor::ClaudeChat,
        framing: StreamFraming {
            data_prefix: "data:".to_string(),
            stop_sentinel: String::new(),
            end_field_path: Some("type".to_string()),
            end_field_value: Some("message_stop".to_string()),
        },
        content_path_stream: Some("delta.text".to_string()),
        content_path_nonstream: Some("content.-1.text".to_string()),
        reasoning_path_stream: Some("delta.thinking".to_string()),
        reasoning_path_nonstream: Some("content.0.thinking".to_string()),
        prompt_tokens_path: Some("usage.input_tokens".to_string()),
        completion_tokens_path: Some("usage.output_tokens".to_string()),
        total_tokens_path: None,
        prompt_write_path: Some("messages.-1.content".to_string()),
        image_write_path: Some("messages.-1.content".to_string()),
    }
}

fn embeddings_mapping() -> FieldMapping {
    FieldMapping {
        flavor: ApiFlavor::Embeddings,
        framing: StreamFraming::default(),
        content_path_stream: None,
        content_path_nonstream: None,
        reasoning_path_stream: None,
        reasoning_path_nonstream: None,
        prompt_tokens_path: None,
        completion_tokens_path: None,
        total_tokens_path: None,
        prompt_write_path: Some("input".to_string()),
        image_write_path: None,
    }
}

/// Resolves a mapping for `(flavor, stream)`. A user-supplied `overrides`
/// JSON (from the job's `field_mapping` column) merges on top of the
/// flavor's defaults — any field it omits falls back to `openai-chat`'s
/// defaults (SPEC_FULL.md §B), any field it sets wins outright.
pub fn resolve(
    flavor: ApiFlavor,
    overrides: Option<&serde_json::Value>,
) -> Result<FieldMapping, MappingError> {
    let base = match flavor {
        ApiFlavor::OpenaiChat => openai_chat_mapping(),
        ApiFlavor::ClaudeChat => claude_chat_mapping(),
        ApiFlavor::Embeddings => embeddings_mapping(),
        ApiFlavor::Custom => openai_chat_mapping(),
    };

    let Some(overrides) = overrides else {
        return Ok(base);
    };

    apply_overrides(base, overrides)
}

fn apply_overrides(
    mut base: FieldMapping,
    overrides: &serde_json::Value,
) -> Result<FieldMapping, MappingError> {
    let obj = overrides
        .as_object()
        .ok_or_else(|| MappingError::InvalidJson("field_mapping must be a JSON object".to_string()))?;

    macro_rules! string_field {
        ($key:literal, $field:ident) => {
            if let Some(v) = obj.get($key) {
                base.$field = v.as_str().map(str::to_string);
            }
        };
    }

    string_field!("content_path_stream", content_path_stream);
    string_field!("content_path_nonstream", content_path_nonstream);
    string_field!("reasoning_path_stream", reasoning_path_stream);
    string_field!("reasoning_path_nonstream", reasoning_path_nonstream);
    string_field!("prompt_tokens_path", prompt_tokens_path);
    string_field!("completion_tokens_path", completion_tokens_path);
    string_field!("total_tokens_path", total_tokens_path);
    string_field!("prompt_write_path", prompt_write_path);
    string_field!("image_write_path", image_write_path);

    if let Some(v) = obj.get("data_prefix").and_then(|v| v.as_str()) {
        base.framing.data_prefix = v.to_string();
    }
    if let Some(v) = obj.get("stop_sentinel").and_then(|v| v.as_str()) {
        base.framing.stop_sentinel = v.to_string();
    }
    if let Some(v) = obj.get("end_field_path").and_then(|v| v.as_str()) {
        base.framing.end_field_path = Some(v.to_string());
    }
    if let Some(v) = obj.get("end_field_value").and_then(|v| v.as_str()) {
        base.framing.end_field_value = Some(v.to_string());
    }

    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openai_chat_stream_frame_yields_content() {
        let mapping = resolve(ApiFlavor::OpenaiChat, None).unwrap();
        let frame: serde_json::Value =
            serde_json::from_str(r#"{"choices":[{"delta":{"content":"x"}}]}"#).unwrap();
        let content = crate::json_path::get_str(&frame, mapping.content_path(true).unwrap());
        assert_eq!(content, Some("x"));
    }

    #[test]
    fn claude_chat_uses_message_stop_end_field() {
        let mapping = resolve(ApiFlavor::ClaudeChat, None).unwrap();
        assert_eq!(mapping.framing.end_field_path.as_deref(), Some("type"));
        assert_eq!(mapping.framing.end_field_value.as_deref(), Some("message_stop"));
    }

    #[test]
    fn custom_override_falls_back_to_openai_defaults_for_omitted_fields() {
        let overrides = serde_json::json!({"content_path_stream": "custom.path"});
        let mapping = resolve(ApiFlavor::Custom, Some(&overrides)).unwrap();
        assert_eq!(mapping.content_path_stream.as_deref(), Some("custom.path"));
        // completion_tokens_path was not overridden, falls back to openai-chat default.
        assert_eq!(
            mapping.completion_tokens_path.as_deref(),
            Some("usage.completion_tokens")
        );
    }

    #[test]
    fn embeddings_mapping_has_no_content_paths() {
        let mapping = resolve(ApiFlavor::Embeddings, None).unwrap();
        assert!(mapping.content_path_stream.is_none());
        assert!(mapping.content_path_nonstream.is_none());
    }
}
