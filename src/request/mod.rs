//! Request Builder (§4.4): merges a payload template with a dataset record
//! according to the API flavor, producing a ready-to-send request.

use serde_json::{json, Value};

use crate::json_path;
use crate::mapping::FieldMapping;
use crate::models::{ApiFlavor, ChatType, PromptRecord};

/// A fully-built, ready-to-send request body. Builder never sends both a
/// JSON body and a raw-text body in the same request (§4.4).
#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(Value),
    Text(String),
}

/// Default payload substituted when a job's template is empty (§4.4).
fn default_payload(model: &str, stream: bool) -> Value {
    json!({
        "model": model,
        "stream": stream,
        "messages": [{"role": "user", "content": "Hi"}],
    })
}

pub struct RequestBuilder<'a> {
    pub flavor: ApiFlavor,
    pub model: &'a str,
    pub stream: bool,
    pub chat_type: ChatType,
    pub mapping: &'a FieldMapping,
}

impl<'a> RequestBuilder<'a> {
    /// Builds the request body for one call. `template` is the job's raw
    /// payload (JSON) or body text; `prompt` is the round-robin record
    /// borrowed for this call, if any dataset is configured.
    pub fn build(
        &self,
        template_json: Option<&Value>,
        template_text: Option<&str>,
        prompt: Option<&PromptRecord>,
    ) -> RequestBody {
        // Builder picks JSON when the record (or template) carries JSON, text otherwise.
        let Some(template) = template_json else {
            return RequestBody::Text(template_text.unwrap_or_default().to_string());
        };

        let mut body = if template.is_null() || (template.is_object() && template.as_object().unwrap().is_empty()) {
            default_payload(self.model, self.stream)
        } else {
            template.clone()
        };

        let Some(prompt) = prompt else {
            return RequestBody::Json(body);
        };

        match self.flavor {
            ApiFlavor::OpenaiChat => self.apply_openai_chat(&mut body, prompt),
            ApiFlavor::ClaudeChat => self.apply_claude_chat(&mut body, prompt),
            ApiFlavor::Embeddings => self.apply_embeddings(&mut body, prompt),
            ApiFlavor::Custom => self.apply_custom(&mut body, prompt),
        }

        RequestBody::Json(body)
    }

    /// openai-chat (§4.4): replaces (or appends) the first user message.
    /// Text-only -> `content` is a string. With image -> `content` is an
    /// array of text + image_url blocks; base64 wins over URL when both
    /// present, as a `data:image/jpeg;base64,...` data URI.
    fn apply_openai_chat(&self, body: &mut Value, prompt: &PromptRecord) {
        let content = if self.chat_type.allows_image() && (prompt.image_base64.is_some() || prompt.image_url.is_some())
        {
            let image_url = prompt
                .image_base64
                .as_ref()
                .map(|b64| format!("data:image/jpeg;base64,{b64}"))
                .or_else(|| prompt.image_url.clone())
                .unwrap_or_default();
            json!([
                {"type": "text", "text": prompt.prompt_text},
                {"type": "image_url", "image_url": {"url": image_url}},
            ])
        } else {
            json!(prompt.prompt_text)
        };

        set_first_user_message(body, "content", content);
    }

    /// claude-chat (§4.4): replaces first user message's `content` with an
    /// array of a text block plus one image block per image source; URL
    /// and base64 blocks are independent entries (both emitted if both present).
    fn apply_claude_chat(&self, body: &mut Value, prompt: &PromptRecord) {
        let mut blocks = vec![json!({"type": "text", "text": prompt.prompt_text})];
        if self.chat_type.allows_image() {
            if let Some(url) = &prompt.image_url {
                blocks.push(json!({"type": "image", "source": {"type": "url", "url": url}}));
            }
            if let Some(b64) = &prompt.image_base64 {
                blocks.push(json!({
                    "type": "image",
                    "source": {"type": "base64", "media_type": "image/jpeg", "data": b64},
                }));
            }
        }
        set_first_user_message(body, "content", Value::Array(blocks));
    }

    /// embeddings (§4.4): sets `input` to the prompt string, leaves everything else.
    fn apply_embeddings(&self, body: &mut Value, prompt: &PromptRecord) {
        if let Value::Object(map) = body {
            map.insert("input".to_string(), json!(prompt.prompt_text));
        }
    }

    /// custom (§4.4): uses the field-mapping's prompt/image JSON paths to
    /// write values into the template.
    fn apply_custom(&self, body: &mut Value, prompt: &PromptRecord) {
        if let Some(path) = &self.mapping.prompt_write_path {
            let _ = json_path::set_field_value(body, path, json!(prompt.prompt_text));
        }
        if self.chat_type.allows_image() {
            if let Some(path) = &self.mapping.image_write_path {
                if let Some(image) = prompt.image_base64.as_ref().or(prompt.image_url.as_ref()) {
                    let _ = json_path::set_field_value(body, path, json!(image));
                }
            }
        }
    }
}

/// Replaces the first `role: user` message's named field, or appends a new
/// user message if none exists, preserving all non-targeted fields.
fn set_first_user_message(body: &mut Value, field: &str, value: Value) {
    let Some(messages) = body.get_mut("messages").and_then(Value::as_array_mut) else {
        body.as_object_mut().map(|m| {
            m.insert(
                "messages".to_string(),
                json!([{"role": "user", field.to_string(): value}]),
            )
        });
        return;
    };

    let existing = messages
        .iter_mut()
        .find(|m| m.get("role").and_then(Value::as_str) == Some("user"));

    match existing {
        Some(msg) => {
            if let Value::Object(map) = msg {
                map.insert(field.to_string(), value);
            }
        }
        None => messages.push(json!({"role": "user", field.to_string(): value})),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping;

    fn rec(prompt: &str) -> PromptRecord {
        PromptRecord {
            id: "r1".to_string(),
            prompt_text: prompt.to_string(),
            image_url: None,
            image_base64: None,
        }
    }

    #[test]
    fn openai_chat_text_only_replaces_first_user_message() {
        let mapping = mapping::resolve(ApiFlavor::OpenaiChat, None).unwrap();
        let builder = RequestBuilder {
            flavor: ApiFlavor::OpenaiChat,
            model: "gpt-4",
            stream: true,
            chat_type: ChatType::Text,
            mapping: &mapping,
        };
        let template = json!({"model": "gpt-4", "stream": true, "messages": [{"role": "user", "content": "placeholder"}]});
        let body = builder.build(Some(&template), None, Some(&rec("hello")));
        match body {
            RequestBody::Json(v) => assert_eq!(v["messages"][0]["content"], json!("hello")),
            _ => panic!("expected JSON body"),
        }
    }

    #[test]
    fn empty_template_substitutes_default_payload() {
        let mapping = mapping::resolve(ApiFlavor::OpenaiChat, None).unwrap();
        let builder = RequestBuilder {
            flavor: ApiFlavor::OpenaiChat,
            model: "gpt-4",
            stream: true,
            chat_type: ChatType::Text,
            mapping: &mapping,
        };
        let body = builder.build(Some(&json!({})), None, None);
        match body {
            RequestBody::Json(v) => {
                assert_eq!(v["model"], json!("gpt-4"));
                assert_eq!(v["messages"][0]["role"], json!("user"));
            }
            _ => panic!("expected JSON body"),
        }
    }

    #[test]
    fn claude_chat_image_url_scenario_s5() {
        let mapping = mapping::resolve(ApiFlavor::ClaudeChat, None).unwrap();
        let builder = RequestBuilder {
            flavor: ApiFlavor::ClaudeChat,
            model: "claude-3",
            stream: false,
            chat_type: ChatType::ImageText,
            mapping: &mapping,
        };
        let mut record = rec("describe");
        record.image_url = Some("https://ex/i.jpg".to_string());
        let template = json!({"model": "claude-3", "messages": [{"role": "user", "content": "placeholder"}]});
        let body = builder.build(Some(&template), None, Some(&record));
        match body {
            RequestBody::Json(v) => {
                let content = v["messages"][0]["content"].as_array().unwrap();
                assert_eq!(content.len(), 2);
                assert_eq!(content[0]["type"], json!("text"));
                assert_eq!(content[1]["type"], json!("image"));
                assert_eq!(content[1]["source"]["type"], json!("url"));
                assert_eq!(content[1]["source"]["url"], json!("https://ex/i.jpg"));
            }
            _ => panic!("expected JSON body"),
        }
    }

    #[test]
    fn base64_wins_over_url_when_both_present_openai() {
        let mapping = mapping::resolve(ApiFlavor::OpenaiChat, None).unwrap();
        let builder = RequestBuilder {
            flavor: ApiFlavor::OpenaiChat,
            model: "gpt-4",
            stream: false,
            chat_type: ChatType::ImageText,
            mapping: &mapping,
        };
        let mut record = rec("describe");
        record.image_url = Some("https://ex/i.jpg".to_string());
        record.image_base64 = Some("Zm9v".to_string());
        let template = json!({"messages": [{"role": "user", "content": "x"}]});
        let body = builder.build(Some(&template), None, Some(&record));
        match body {
            RequestBody::Json(v) => {
                let url = v["messages"][0]["content"][1]["image_url"]["url"].as_str().unwrap();
                assert!(url.starts_with("data:image/jpeg;base64,Zm9v"));
            }
            _ => panic!("expected JSON body"),
        }
    }

    #[test]
    fn no_dataset_passes_template_through_verbatim() {
        let mapping = mapping::resolve(ApiFlavor::OpenaiChat, None).unwrap();
        let builder = RequestBuilder {
            flavor: ApiFlavor::OpenaiChat,
            model: "gpt-4",
            stream: true,
            chat_type: ChatType::Text,
            mapping: &mapping,
        };
        let template = json!({"messages": [{"role": "user", "content": "fixed"}]});
        let body = builder.build(Some(&template), None, None);
        match body {
            RequestBody::Json(v) => assert_eq!(v["messages"][0]["content"], json!("fixed")),
            _ => panic!("expected JSON body"),
        }
    }
}
