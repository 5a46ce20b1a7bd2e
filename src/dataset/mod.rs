//! Dataset Loader (§4.2): parses JSONL / JSON-array / ShareGPT / OpenAI
//! dataset content into a lazy, restartable, shared round-robin queue.

pub mod queue;

pub use queue::PromptQueue;

use std::path::Path;

use base64::Engine as _;
use serde_json::Value;

use crate::error::DatasetError;
use crate::models::{ChatType, PromptRecord};

/// Well-known roots image paths are resolved against when they are not an
/// `http(s)://` URL (§4.2).
const IMAGE_SEARCH_ROOTS: &[&str] = &["/data/uploads/images", "/data/datasets/images", "."];

/// Loads dataset content (inline or from a file) into a [`PromptQueue`].
///
/// `chat_type` is only consulted when `content_or_path` is the sentinel
/// `"default"`, selecting a tiny built-in dataset per chat type (§4.2).
pub fn load(content_or_path: &str, chat_type: ChatType) -> Result<PromptQueue, DatasetError> {
    let raw = if content_or_path == "default" {
        builtin_dataset(chat_type).to_string()
    } else if looks_like_path(content_or_path) {
        std::fs::read_to_string(content_or_path).map_err(|e| DatasetError::Io {
            path: content_or_path.to_string(),
            source: e,
        })?
    } else {
        content_or_path.to_string()
    };

    let records = parse_records(&raw)?;
    Ok(PromptQueue::new(records))
}

fn looks_like_path(s: &str) -> bool {
    !s.trim_start().starts_with(['{', '[']) && Path::new(s).exists()
}

fn builtin_dataset(chat_type: ChatType) -> &'static str {
    match chat_type {
        ChatType::Text => r#"[{"id":"builtin-0","prompt":"Tell me a short story about a robot."}]"#,
        ChatType::ImageText | ChatType::Vision => {
            r#"[{"id":"builtin-0","prompt":"Describe this image.","image":"https://example.com/sample.jpg"}]"#
        }
    }
}

/// Parses dataset content as either a JSON array or JSONL (one JSON object
/// per non-empty line), extracting a [`PromptRecord`] per entry (§4.2).
/// Records with no extractable prompt are skipped silently.
fn parse_records(raw: &str) -> Result<Vec<PromptRecord>, DatasetError> {
    let entries = parse_entries(raw)?;
    let records: Vec<PromptRecord> = entries
        .into_iter()
        .enumerate()
        .filter_map(|(idx, entry)| extract_record(&entry, idx))
        .collect();

    if records.is_empty() {
        return Err(DatasetError::Empty);
    }
    Ok(records)
}

fn parse_entries(raw: &str) -> Result<Vec<Value>, DatasetError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    if trimmed.starts_with('[') {
        let arr: Vec<Value> =
            serde_json::from_str(trimmed).map_err(|e| DatasetError::Parse(e.to_string()))?;
        return Ok(arr);
    }
    // JSONL: one JSON value per non-empty line.
    let mut entries = Vec::new();
    for line in trimmed.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let value: Value = serde_json::from_str(line).map_err(|e| DatasetError::Parse(e.to_string()))?;
        entries.push(value);
    }
    Ok(entries)
}

/// Extracts the prompt text, first non-empty wins (§4.2):
/// 1. top-level `prompt` (string or one-element array of string, else JSON-serialized)
/// 2. `conversations` (ShareGPT; first entry with role human/user)
/// 3. `messages` (OpenAI; first entry with role user/human)
fn extract_record(entry: &Value, idx: usize) -> Option<PromptRecord> {
    let prompt_text = extract_prompt_field(entry)
        .or_else(|| extract_sharegpt(entry))
        .or_else(|| extract_openai_messages(entry))?;

    if prompt_text.trim().is_empty() {
        return None;
    }

    let id = entry
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("record-{idx}"));

    let (image_url, image_base64) = extract_image(entry);

    Some(PromptRecord {
        id,
        prompt_text,
        image_url,
        image_base64,
    })
}

fn extract_prompt_field(entry: &Value) -> Option<String> {
    let v = entry.get("prompt")?;
    string_or_single_element_array(v)
}

fn extract_sharegpt(entry: &Value) -> Option<String> {
    let conversations = entry.get("conversations")?.as_array()?;
    conversations
        .iter()
        .find(|turn| {
            matches!(
                turn.get("from").and_then(Value::as_str),
                Some("human") | Some("user")
            )
        })
        .and_then(|turn| turn.get("value"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn extract_openai_messages(entry: &Value) -> Option<String> {
    let messages = entry.get("messages")?.as_array()?;
    messages
        .iter()
        .find(|m| {
            matches!(
                m.get("role").and_then(Value::as_str),
                Some("user") | Some("human")
            )
        })
        .and_then(|m| m.get("content"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Accepts a string, a one-element array of string, or falls back to
/// JSON-serializing any other shape (§4.2).
fn string_or_single_element_array(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Array(arr) if arr.len() == 1 => arr[0].as_str().map(str::to_string).or_else(|| {
            Some(serde_json::to_string(&arr[0]).unwrap_or_default())
        }),
        Value::Null => None,
        other => Some(serde_json::to_string(other).unwrap_or_default()),
    }
}

/// Extracts an image source: `image` then `image_path` (§4.2). URLs are
/// kept as-is; local paths are resolved against well-known roots and
/// base64-encoded in memory.
fn extract_image(entry: &Value) -> (Option<String>, Option<String>) {
    let raw = entry
        .get("image")
        .or_else(|| entry.get("image_path"))
        .and_then(string_or_single_element_array);

    let Some(raw) = raw else {
        return (None, None);
    };

    if raw.starts_with("http://") || raw.starts_with("https://") {
        return (Some(raw), None);
    }

    match resolve_and_encode(&raw) {
        Some(b64) => (None, Some(b64)),
        None => (None, None),
    }
}

fn resolve_and_encode(path_str: &str) -> Option<String> {
    let direct = Path::new(path_str);
    if direct.exists() {
        return encode_file(direct);
    }
    for root in IMAGE_SEARCH_ROOTS {
        let candidate = Path::new(root).join(path_str);
        if candidate.exists() {
            return encode_file(&candidate);
        }
    }
    None
}

fn encode_file(path: &Path) -> Option<String> {
    let bytes = std::fs::read(path).ok()?;
    Some(base64::engine::general_purpose::STANDARD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_top_level_prompt_string() {
        let v: Value = serde_json::from_str(r#"{"id":"a","prompt":"hi"}"#).unwrap();
        assert_eq!(extract_record(&v, 0).unwrap().prompt_text, "hi");
    }

    #[test]
    fn extracts_top_level_prompt_single_element_array() {
        let v: Value = serde_json::from_str(r#"{"prompt":["hi"]}"#).unwrap();
        assert_eq!(extract_record(&v, 0).unwrap().prompt_text, "hi");
    }

    #[test]
    fn extracts_sharegpt_human_turn() {
        let v: Value = serde_json::from_str(
            r#"{"id":"a","conversations":[{"from":"human","value":"hi"}]}"#,
        )
        .unwrap();
        assert_eq!(extract_record(&v, 0).unwrap().prompt_text, "hi");
    }

    #[test]
    fn extracts_sharegpt_user_turn() {
        let v: Value =
            serde_json::from_str(r#"{"id":"b","conversations":[{"from":"user","value":"yo"}]}"#)
                .unwrap();
        assert_eq!(extract_record(&v, 0).unwrap().prompt_text, "yo");
    }

    #[test]
    fn extracts_openai_messages_user_role() {
        let v: Value =
            serde_json::from_str(r#"{"messages":[{"role":"system","content":"sys"},{"role":"user","content":"hey"}]}"#)
                .unwrap();
        assert_eq!(extract_record(&v, 0).unwrap().prompt_text, "hey");
    }

    #[test]
    fn skips_records_with_no_extractable_prompt() {
        let v: Value = serde_json::from_str(r#"{"foo":"bar"}"#).unwrap();
        assert!(extract_record(&v, 0).is_none());
    }

    #[test]
    fn parses_json_array_dataset() {
        let raw = r#"[{"prompt":"a"},{"prompt":"b"}]"#;
        let records = parse_records(raw).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn parses_jsonl_dataset() {
        let raw = "{\"prompt\":\"a\"}\n{\"prompt\":\"b\"}\n";
        let records = parse_records(raw).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn sharegpt_round_robin_scenario_s3() {
        let raw = r#"[{"id":"a","conversations":[{"from":"human","value":"hi"}]},{"id":"b","conversations":[{"from":"user","value":"yo"}]}]"#;
        let records = parse_records(raw).unwrap();
        let queue = PromptQueue::new(records);
        let mut seen = Vec::new();
        for _ in 0..4 {
            if let Some(r) = queue.borrow() {
                seen.push(r.prompt_text.clone());
                queue.ret(r);
            }
        }
        assert!(seen.contains(&"hi".to_string()));
        assert!(seen.contains(&"yo".to_string()));
    }

    #[test]
    fn image_url_detected_as_url() {
        let v: Value =
            serde_json::from_str(r#"{"prompt":"a","image":"https://ex/i.jpg"}"#).unwrap();
        let rec = extract_record(&v, 0).unwrap();
        assert_eq!(rec.image_url.as_deref(), Some("https://ex/i.jpg"));
        assert!(rec.image_base64.is_none());
    }

    #[test]
    fn empty_dataset_is_an_error() {
        assert!(matches!(parse_records("[]"), Err(DatasetError::Empty)));
    }
}
