//! End-to-end coverage of the request builder + response processor against
//! a mock HTTP target, exercising both the non-stream and stream paths.

use lmeterx_stress_engine::mapping;
use lmeterx_stress_engine::metrics::{MetricEventBus, COMPLETION_TOKENS, TOTAL_TIME};
use lmeterx_stress_engine::models::ApiFlavor;
use lmeterx_stress_engine::response::{Outcome, ResponseProcessor};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn non_stream_openai_chat_success_fires_total_time_and_tokens() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"content": "hello there"}}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
        })))
        .mount(&server)
        .await;

    let mapping = mapping::resolve(ApiFlavor::OpenaiChat, None).unwrap();
    let metrics = MetricEventBus::new();
    let client = reqwest::Client::new();
    let processor = ResponseProcessor { client: &client, mapping: &mapping, metrics: &metrics };

    let body = lmeterx_stress_engine::request::RequestBody::Json(serde_json::json!({
        "model": "gpt-4", "messages": [{"role": "user", "content": "hi"}],
    }));

    let outcome = processor
        .execute(
            reqwest::Method::POST,
            &format!("{}/v1/chat/completions", server.uri()),
            &reqwest::header::HeaderMap::new(),
            &body,
            false,
            "hi",
        )
        .await;

    match outcome {
        Outcome::Success { prompt_tokens, completion_tokens, .. } => {
            assert_eq!(prompt_tokens, Some(3));
            assert_eq!(completion_tokens, Some(2));
        }
        Outcome::Failure { category, .. } => panic!("expected success, got failure: {category}"),
    }
    assert_eq!(metrics.summary(TOTAL_TIME).count, 1);
}

#[tokio::test]
async fn non_stream_http_error_status_records_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mapping = mapping::resolve(ApiFlavor::OpenaiChat, None).unwrap();
    let metrics = MetricEventBus::new();
    let client = reqwest::Client::new();
    let processor = ResponseProcessor { client: &client, mapping: &mapping, metrics: &metrics };
    let body = lmeterx_stress_engine::request::RequestBody::Json(serde_json::json!({}));

    let outcome = processor
        .execute(
            reqwest::Method::POST,
            &format!("{}/v1/chat/completions", server.uri()),
            &reqwest::header::HeaderMap::new(),
            &body,
            false,
            "hi",
        )
        .await;

    match outcome {
        Outcome::Failure { category, .. } => assert_eq!(category, "http_status_503"),
        Outcome::Success { .. } => panic!("expected failure"),
    }
}

#[tokio::test]
async fn stream_openai_chat_done_sentinel_ends_cleanly_and_fires_completion_tokens() {
    let server = MockServer::start().await;
    let sse_body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"lo\"}}]}\n",
        "data: {\"usage\":{\"prompt_tokens\":4,\"completion_tokens\":2,\"total_tokens\":6}}\n",
        "data: [DONE]\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
        .mount(&server)
        .await;

    let mapping = mapping::resolve(ApiFlavor::OpenaiChat, None).unwrap();
    let metrics = MetricEventBus::new();
    let client = reqwest::Client::new();
    let processor = ResponseProcessor { client: &client, mapping: &mapping, metrics: &metrics };
    let body = lmeterx_stress_engine::request::RequestBody::Json(serde_json::json!({"stream": true}));

    let outcome = processor
        .execute(
            reqwest::Method::POST,
            &format!("{}/v1/chat/completions", server.uri()),
            &reqwest::header::HeaderMap::new(),
            &body,
            true,
            "hi",
        )
        .await;

    match outcome {
        Outcome::Success { completion_tokens, .. } => assert_eq!(completion_tokens, Some(2)),
        Outcome::Failure { category, .. } => panic!("expected success, got failure: {category}"),
    }
    assert_eq!(metrics.summary(lmeterx_stress_engine::metrics::TIME_TO_FIRST_OUTPUT_TOKEN).count, 1);
    assert_eq!(metrics.summary(COMPLETION_TOKENS).count, 1);
}

#[tokio::test]
async fn stream_claude_chat_message_stop_ends_cleanly() {
    let server = MockServer::start().await;
    let sse_body = concat!(
        "data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"hi\"}}\n",
        "data: {\"type\":\"message_stop\",\"usage\":{\"input_tokens\":5,\"output_tokens\":1}}\n",
    );
    Mock::given(method("POST"))
        .and(path("/v1/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
        .mount(&server)
        .await;

    let mapping = mapping::resolve(ApiFlavor::ClaudeChat, None).unwrap();
    let metrics = MetricEventBus::new();
    let client = reqwest::Client::new();
    let processor = ResponseProcessor { client: &client, mapping: &mapping, metrics: &metrics };
    let body = lmeterx_stress_engine::request::RequestBody::Json(serde_json::json!({"stream": true}));

    let outcome = processor
        .execute(
            reqwest::Method::POST,
            &format!("{}/v1/messages", server.uri()),
            &reqwest::header::HeaderMap::new(),
            &body,
            true,
            "hi",
        )
        .await;

    match outcome {
        Outcome::Success { prompt_tokens, completion_tokens, .. } => {
            assert_eq!(prompt_tokens, Some(5));
            assert_eq!(completion_tokens, Some(1));
        }
        Outcome::Failure { category, .. } => panic!("expected success, got failure: {category}"),
    }
}

#[tokio::test]
async fn stream_provider_error_frame_records_failure() {
    let server = MockServer::start().await;
    let sse_body = "data: {\"error\":{\"message\":\"rate limited\"}}\n";
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(sse_body, "text/event-stream"))
        .mount(&server)
        .await;

    let mapping = mapping::resolve(ApiFlavor::OpenaiChat, None).unwrap();
    let metrics = MetricEventBus::new();
    let client = reqwest::Client::new();
    let processor = ResponseProcessor { client: &client, mapping: &mapping, metrics: &metrics };
    let body = lmeterx_stress_engine::request::RequestBody::Json(serde_json::json!({"stream": true}));

    let outcome = processor
        .execute(
            reqwest::Method::POST,
            &format!("{}/v1/chat/completions", server.uri()),
            &reqwest::header::HeaderMap::new(),
            &body,
            true,
            "hi",
        )
        .await;

    match outcome {
        Outcome::Failure { category, .. } => assert_eq!(category, "provider_error"),
        Outcome::Success { .. } => panic!("expected failure"),
    }
}
