//! Drives the Swarm Controller against a mock endpoint end to end: dataset
//! loading, round-robin prompts, request building, and result aggregation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use lmeterx_stress_engine::dataset;
use lmeterx_stress_engine::mapping;
use lmeterx_stress_engine::metrics::MetricEventBus;
use lmeterx_stress_engine::metrics::realtime::LiveCounters;
use lmeterx_stress_engine::models::{ApiFlavor, ChatType, HttpMethod, Job, JobStatus, LlmExtras, LoadConfig};
use lmeterx_stress_engine::swarm::{self, EndpointAggregates, SwarmController};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn fixed_shape_run_aggregates_requests_and_tokens() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"content": "ok"}}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 1, "total_tokens": 2},
        })))
        .mount(&server)
        .await;

    let job = Arc::new(Job {
        id: "swarm-e2e".to_string(),
        name: "n".to_string(),
        created_by: "u".to_string(),
        created_at: chrono::Utc::now(),
        is_deleted: false,
        target_host: server.uri(),
        api_path: "/v1/chat/completions".to_string(),
        method: HttpMethod::Post,
        headers: HashMap::new(),
        cookies: HashMap::new(),
        request_payload: Some(serde_json::json!({"model": "gpt-4", "messages": [{"role": "user", "content": "x"}]})),
        request_body_text: None,
        test_data_path: None,
        test_data_inline: Some("default".to_string()),
        load: LoadConfig::Fixed { users: 2, spawn_rate: 10.0, duration_seconds: 1 },
        llm: Some(LlmExtras {
            model: "gpt-4".to_string(),
            api_flavor: ApiFlavor::OpenaiChat,
            stream_mode: false,
            chat_type: ChatType::Text,
            field_mapping: None,
            warmup_enabled: false,
            warmup_duration_secs: 0,
        }),
        cert_file: None,
        key_file: None,
        status: JobStatus::Running,
        error_message: None,
    });

    let mapping = Arc::new(mapping::resolve(ApiFlavor::OpenaiChat, None).unwrap());
    let queue = Arc::new(dataset::load("default", ChatType::Text).unwrap());

    let controller = SwarmController {
        job: job.clone(),
        mapping,
        client: reqwest::Client::new(),
        metrics: Arc::new(MetricEventBus::new()),
        endpoints: Arc::new(EndpointAggregates::new()),
        prompt_queue: Some(queue),
        live_counters: Arc::new(LiveCounters::default()),
        stop_timeout: Duration::from_secs(2),
    };

    let shape = swarm::from_load_config(&job.load);
    let (_tx, rx) = tokio::sync::watch::channel(false);
    let result = controller.run(shape, rx).await;

    assert!(result.token_stats_requests > 0, "expected at least one completed request");
    assert!(result.total_prompt_tokens > 0);
    let aggregated = result
        .result_rows
        .iter()
        .find(|r| r.metric_type == "Aggregated")
        .expect("aggregated row present");
    assert_eq!(aggregated.num_failures, 0);
    assert!(aggregated.num_requests > 0);
}
