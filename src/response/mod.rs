//! Response Processor (§4.5): issues the HTTP call, walks the response (or
//! the stream of frames) through the field mapping, and fires metrics.

use std::time::Instant;

use bytes::Buf;
use futures::StreamExt;
use reqwest::{Method, StatusCode};
use serde_json::Value;

use crate::json_path;
use crate::mapping::FieldMapping;
use crate::metrics::{
    MetricEventBus, COMPLETION_TOKENS, INPUT_TOKENS, TIME_TO_FIRST_OUTPUT_TOKEN,
    TIME_TO_FIRST_REASONING_TOKEN, TIME_TO_OUTPUT_COMPLETION, TIME_TO_REASONING_COMPLETION,
    TOTAL_TIME,
};
use crate::request::RequestBody;

/// Outcome of a single call, reported up to the swarm's per-endpoint stats (§4.5, §4.7).
#[derive(Debug)]
pub enum Outcome {
    Success {
        latency_ms: f64,
        content_length: u64,
        prompt_tokens: Option<u64>,
        completion_tokens: Option<u64>,
    },
    Failure {
        latency_ms: f64,
        category: String,
    },
}

pub struct ResponseProcessor<'a> {
    pub client: &'a reqwest::Client,
    pub mapping: &'a FieldMapping,
    pub metrics: &'a MetricEventBus,
}

impl<'a> ResponseProcessor<'a> {
    /// Issues the call and dispatches to the non-stream or stream path (§4.5).
    pub async fn execute(
        &self,
        method: Method,
        url: &str,
        headers: &reqwest::header::HeaderMap,
        body: &RequestBody,
        stream: bool,
        prompt_text: &str,
    ) -> Outcome {
        let start = Instant::now();
        let mut req = self.client.request(method, url).headers(headers.clone());
        req = match body {
            RequestBody::Json(v) => req.json(v),
            RequestBody::Text(t) => req.body(t.clone()),
        };

        let response = match req.send().await {
            Ok(r) => r,
            Err(e) => return self.classify_send_error(e, start),
        };

        let status = response.status();
        if !status.is_success() {
            let elapsed = start.elapsed().as_secs_f64() * 1000.0;
            return Outcome::Failure {
                latency_ms: elapsed,
                category: format!("http_status_{}", status.as_u16()),
            };
        }

        if stream {
            self.process_stream(response, start, prompt_text).await
        } else {
            self.process_non_stream(response, status, start, prompt_text).await
        }
    }

    fn classify_send_error(&self, e: reqwest::Error, start: Instant) -> Outcome {
        let elapsed = start.elapsed().as_secs_f64() * 1000.0;
        let category = if e.is_timeout() {
            "timeout"
        } else if e.is_connect() {
            "connect"
        } else if e.is_request() {
            "request"
        } else {
            "unexpected"
        };
        Outcome::Failure {
            latency_ms: elapsed,
            category: category.to_string(),
        }
    }

    async fn process_non_stream(
        &self,
        response: reqwest::Response,
        _status: StatusCode,
        start: Instant,
        prompt_text: &str,
    ) -> Outcome {
        let text = match response.text().await {
            Ok(t) => t,
            Err(_) => {
                let elapsed = start.elapsed().as_secs_f64() * 1000.0;
                return Outcome::Failure {
                    latency_ms: elapsed,
                    category: "read_body".to_string(),
                };
            }
        };
        let content_length = text.len() as u64;

        let value: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) => {
                let elapsed = start.elapsed().as_secs_f64() * 1000.0;
                return Outcome::Failure {
                    latency_ms: elapsed,
                    category: "non_json_body".to_string(),
                };
            }
        };

        if has_provider_error(&value) {
            let elapsed = start.elapsed().as_secs_f64() * 1000.0;
            return Outcome::Failure {
                latency_ms: elapsed,
                category: "provider_error".to_string(),
            };
        }

        let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.metrics.fire(TOTAL_TIME, elapsed_ms, content_length);

        let content = self
            .mapping
            .content_path(false)
            .and_then(|p| json_path::get_str(&value, p))
            .unwrap_or_default();

        let (prompt_tokens, completion_tokens) =
            extract_usage(&value, self.mapping, prompt_text, content);
        if let Some(t) = prompt_tokens {
            self.metrics.fire(INPUT_TOKENS, t as f64, 0);
        }
        if let Some(t) = completion_tokens {
            self.metrics.fire(COMPLETION_TOKENS, t as f64, 0);
        }

        Outcome::Success {
            latency_ms: elapsed_ms,
            content_length,
            prompt_tokens,
            completion_tokens,
        }
    }

    /// Stream path (§4.5 steps 1-8).
    async fn process_stream(
        &self,
        response: reqwest::Response,
        start: Instant,
        prompt_text: &str,
    ) -> Outcome {
        let mut byte_stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut content_buf = String::new();
        let mut reasoning_buf = String::new();
        let mut content_length: u64 = 0;

        let mut first_output_at: Option<Instant> = None;
        let mut first_reasoning_at: Option<Instant> = None;
        let mut reasoning_completion_fired = false;
        let mut last_frame_value: Option<Value> = None;

        loop {
            let chunk = match byte_stream.next().await {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => {
                    let elapsed = start.elapsed().as_secs_f64() * 1000.0;
                    let category = if e.is_timeout() { "timeout" } else { "stream_error" };
                    return Outcome::Failure { latency_ms: elapsed, category: category.to_string() };
                }
                None => break,
            };
            content_length += chunk.remaining() as u64;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim_end_matches('\r').to_string();
                buffer.drain(..=pos);
                if line.is_empty() {
                    continue;
                }
                if line.starts_with("event:") || line.starts_with("id:") || line.starts_with("retry:") {
                    continue;
                }

                let payload = strip_prefix(&line, &self.mapping.framing.data_prefix);

                if !self.mapping.framing.stop_sentinel.is_empty() && payload == self.mapping.framing.stop_sentinel {
                    return self.finish_stream(start, first_output_at, content_buf.len() as u64 + reasoning_buf.len() as u64, content_length, &last_frame_value, prompt_text, &content_buf);
                }

                let Ok(frame): Result<Value, _> = serde_json::from_str(payload) else {
                    let elapsed = start.elapsed().as_secs_f64() * 1000.0;
                    return Outcome::Failure { latency_ms: elapsed, category: "non_json_chunk".to_string() };
                };

                if has_provider_error(&frame) {
                    let elapsed = start.elapsed().as_secs_f64() * 1000.0;
                    return Outcome::Failure { latency_ms: elapsed, category: "provider_error".to_string() };
                }

                if let (Some(path), Some(expect)) =
                    (&self.mapping.framing.end_field_path, &self.mapping.framing.end_field_value)
                {
                    if json_path::get_str(&frame, path) == Some(expect.as_str()) {
                        last_frame_value = Some(frame);
                        return self.finish_stream(start, first_output_at, content_buf.len() as u64 + reasoning_buf.len() as u64, content_length, &last_frame_value, prompt_text, &content_buf);
                    }
                }

                let carries_usage = frame_carries_usage(&frame, self.mapping);

                if let Some(p) = self.mapping.content_path(true) {
                    if let Some(piece) = json_path::get_str(&frame, p) {
                        if !piece.is_empty() {
                            if first_output_at.is_none() {
                                first_output_at = Some(Instant::now());
                                let ms = first_output_at.unwrap().duration_since(start).as_secs_f64() * 1000.0;
                                self.metrics.fire(TIME_TO_FIRST_OUTPUT_TOKEN, ms, 0);
                            }
                            if first_reasoning_at.is_some() && !reasoning_completion_fired {
                                reasoning_completion_fired = true;
                                let ms = Instant::now().duration_since(first_reasoning_at.unwrap()).as_secs_f64() * 1000.0;
                                self.metrics.fire(TIME_TO_REASONING_COMPLETION, ms, 0);
                            }
                            if !carries_usage {
                                content_buf.push_str(piece);
                            }
                        }
                    }
                }
                if let Some(p) = self.mapping.reasoning_path(true) {
                    if let Some(piece) = json_path::get_str(&frame, p) {
                        if !piece.is_empty() {
                            if first_reasoning_at.is_none() {
                                first_reasoning_at = Some(Instant::now());
                                let ms = first_reasoning_at.unwrap().duration_since(start).as_secs_f64() * 1000.0;
                                self.metrics.fire(TIME_TO_FIRST_REASONING_TOKEN, ms, 0);
                            }
                            if !carries_usage {
                                reasoning_buf.push_str(piece);
                            }
                        }
                    }
                }

                last_frame_value = Some(frame);
            }
        }

        self.finish_stream(start, first_output_at, content_buf.len() as u64 + reasoning_buf.len() as u64, content_length, &last_frame_value, prompt_text, &content_buf)
    }

    fn finish_stream(
        &self,
        start: Instant,
        first_output_at: Option<Instant>,
        _output_chars: u64,
        content_length: u64,
        last_frame: &Option<Value>,
        prompt_text: &str,
        content_buf: &str,
    ) -> Outcome {
        let now = Instant::now();
        if let Some(first) = first_output_at {
            let ms = now.duration_since(first).as_secs_f64() * 1000.0;
            self.metrics.fire(TIME_TO_OUTPUT_COMPLETION, ms, 0);
        }
        let total_ms = now.duration_since(start).as_secs_f64() * 1000.0;
        self.metrics.fire(TOTAL_TIME, total_ms, content_length);

        let (prompt_tokens, completion_tokens) = match last_frame {
            Some(frame) => extract_usage(frame, self.mapping, prompt_text, content_buf),
            None => extract_usage(&Value::Null, self.mapping, prompt_text, content_buf),
        };
        if let Some(t) = prompt_tokens {
            self.metrics.fire(INPUT_TOKENS, t as f64, 0);
        }
        if let Some(t) = completion_tokens {
            self.metrics.fire(COMPLETION_TOKENS, t as f64, 0);
        }

        Outcome::Success {
            latency_ms: total_ms,
            content_length,
            prompt_tokens,
            completion_tokens,
        }
    }
}

fn strip_prefix<'a>(line: &'a str, prefix: &str) -> &'a str {
    line.strip_prefix(prefix).unwrap_or(line).trim_start()
}

fn has_provider_error(value: &Value) -> bool {
    value.get("error").map(|e| !e.is_null()).unwrap_or(false)
}

/// A usage/final frame is recognized by the presence of any token field (§4.5 step 7).
fn frame_carries_usage(frame: &Value, mapping: &FieldMapping) -> bool {
    [
        &mapping.prompt_tokens_path,
        &mapping.completion_tokens_path,
        &mapping.total_tokens_path,
    ]
    .iter()
    .any(|p| p.as_deref().map(|p| json_path::get_field_value(frame, p).is_some()).unwrap_or(false))
        || frame.get("usage").is_some()
}

/// Token-usage extraction priority chain (§4.5):
/// (a) mapping paths, (b) canonical/Anthropic fallbacks, (c) derive the
/// missing side from `total`, (d) local tokenizer fallback.
fn extract_usage(
    value: &Value,
    mapping: &FieldMapping,
    prompt_text: &str,
    completion_text: &str,
) -> (Option<u64>, Option<u64>) {
    let mut prompt = mapping.prompt_tokens_path.as_deref().and_then(|p| json_path::get_u64(value, p));
    let mut completion = mapping
        .completion_tokens_path
        .as_deref()
        .and_then(|p| json_path::get_u64(value, p));
    let mut total = mapping.total_tokens_path.as_deref().and_then(|p| json_path::get_u64(value, p));

    if prompt.is_none() {
        prompt = json_path::get_u64(value, "usage.prompt_tokens").or_else(|| json_path::get_u64(value, "usage.input_tokens"));
    }
    if completion.is_none() {
        completion =
            json_path::get_u64(value, "usage.completion_tokens").or_else(|| json_path::get_u64(value, "usage.output_tokens"));
    }
    if total.is_none() {
        total = json_path::get_u64(value, "usage.total_tokens");
    }

    if let Some(t) = total {
        if prompt.is_none() && completion.is_some() {
            prompt = Some(t.saturating_sub(completion.unwrap()));
        }
        if completion.is_none() && prompt.is_some() {
            completion = Some(t.saturating_sub(prompt.unwrap()));
        }
    }

    if prompt.is_none() {
        prompt = Some(approx_tokens(prompt_text));
    }
    if completion.is_none() {
        completion = Some(approx_tokens(completion_text));
    }

    (prompt, completion)
}

/// Local tokenizer fallback (SPEC_FULL.md §B): `len/4` character heuristic,
/// used only when no provider usage field is present at any priority.
fn approx_tokens(text: &str) -> u64 {
    ((text.chars().count() as u64) + 3) / 4
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping;
    use crate::models::ApiFlavor;

    #[test]
    fn extract_usage_prefers_mapping_path() {
        let mapping = mapping::resolve(ApiFlavor::OpenaiChat, None).unwrap();
        let value = serde_json::json!({"usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}});
        let (p, c) = extract_usage(&value, &mapping, "hi", "hello");
        assert_eq!(p, Some(10));
        assert_eq!(c, Some(5));
    }

    #[test]
    fn extract_usage_derives_missing_side_from_total() {
        let mapping = mapping::resolve(ApiFlavor::Custom, None).unwrap();
        let value = serde_json::json!({"usage": {"total_tokens": 20, "prompt_tokens": 8}});
        let (p, c) = extract_usage(&value, &mapping, "hi", "hello world");
        assert_eq!(p, Some(8));
        assert_eq!(c, Some(12));
    }

    #[test]
    fn extract_usage_falls_back_to_local_tokenizer() {
        let mapping = mapping::resolve(ApiFlavor::Custom, None).unwrap();
        let value = serde_json::Value::Null;
        let (p, c) = extract_usage(&value, &mapping, "abcdefgh", "abcd");
        assert_eq!(p, Some(2));
        assert_eq!(c, Some(1));
    }

    #[test]
    fn has_provider_error_detects_top_level_error_object() {
        let value = serde_json::json!({"error": {"message": "bad"}});
        assert!(has_provider_error(&value));
        let clean = serde_json::json!({"choices": []});
        assert!(!has_provider_error(&clean));
    }

    #[test]
    fn strip_prefix_removes_data_colon_and_trims() {
        assert_eq!(strip_prefix("data: {\"a\":1}", "data:"), "{\"a\":1}");
        assert_eq!(strip_prefix("[DONE]", "data:"), "[DONE]");
    }
}
