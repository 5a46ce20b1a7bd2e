//! Virtual user loop (§4.7): one lightweight task per simulated user, each
//! driving its own keep-alive HTTP connection against the target endpoint.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use reqwest::Method;

use crate::dataset::queue::PromptQueue;
use crate::mapping::FieldMapping;
use crate::metrics::MetricEventBus;
use crate::models::{ChatType, HttpMethod, Job};
use crate::request::RequestBuilder;
use crate::response::{Outcome, ResponseProcessor};
use crate::swarm::stats::EndpointAggregates;

/// Token-stat totals accumulated across every completed request (§4.7, §5
/// "Global token-stat counters: guarded by a mutex on the master"). A
/// single-process swarm updates these directly instead of relaying
/// worker-to-master messages over IPC.
#[derive(Default)]
pub struct TokenStats {
    pub requests: AtomicU64,
    pub prompt_tokens: AtomicU64,
    pub completion_tokens: AtomicU64,
}

impl TokenStats {
    pub fn record(&self, prompt: Option<u64>, completion: Option<u64>) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if let Some(p) = prompt {
            self.prompt_tokens.fetch_add(p, Ordering::Relaxed);
        }
        if let Some(c) = completion {
            self.completion_tokens.fetch_add(c, Ordering::Relaxed);
        }
    }
}

pub struct UserContext {
    pub index: usize,
    pub target: Arc<AtomicU64>,
    pub job: Arc<Job>,
    pub client: reqwest::Client,
    pub mapping: Arc<FieldMapping>,
    pub metrics: Arc<MetricEventBus>,
    pub endpoints: Arc<EndpointAggregates>,
    pub token_stats: Arc<TokenStats>,
    pub prompt_queue: Option<Arc<PromptQueue>>,
    pub current_users: Arc<AtomicU64>,
}

/// One virtual user: loops issuing requests until its index no longer falls
/// under the controller's current target (i.e. the controller scaled down),
/// at which point it exits voluntarily after finishing any in-flight call.
pub async fn run_user(ctx: UserContext) {
    ctx.current_users.fetch_add(1, Ordering::Relaxed);

    let method = reqwest_method(ctx.job.method);
    let url = ctx.job.target_url();
    let mut headers = reqwest::header::HeaderMap::new();
    for (k, v) in &ctx.job.headers {
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(k.as_bytes()),
            reqwest::header::HeaderValue::from_str(v),
        ) {
            headers.insert(name, value);
        }
    }

    let stream = ctx.job.llm.as_ref().map(|l| l.stream_mode).unwrap_or(false);
    let model = ctx.job.llm.as_ref().map(|l| l.model.as_str()).unwrap_or("");
    let chat_type = ctx.job.llm.as_ref().map(|l| l.chat_type).unwrap_or(ChatType::Text);
    let flavor = ctx.job.llm.as_ref().map(|l| l.api_flavor).unwrap_or(crate::models::ApiFlavor::Custom);

    let builder = RequestBuilder {
        flavor,
        model,
        stream,
        chat_type,
        mapping: &ctx.mapping,
    };

    loop {
        if (ctx.index as u64) >= ctx.target.load(Ordering::Relaxed) {
            break;
        }

        let borrowed = match &ctx.prompt_queue {
            Some(q) => q.borrow(),
            None => None,
        };
        let prompt_text = borrowed.as_ref().map(|r| r.prompt_text.as_str()).unwrap_or("");

        let body = builder.build(
            ctx.job.request_payload.as_ref(),
            ctx.job.request_body_text.as_deref(),
            borrowed.as_ref(),
        );

        let processor = ResponseProcessor {
            client: &ctx.client,
            mapping: &ctx.mapping,
            metrics: &ctx.metrics,
        };

        let outcome = processor.execute(method.clone(), &url, &headers, &body, stream, prompt_text).await;

        if let Some(queue) = &ctx.prompt_queue {
            if let Some(record) = borrowed {
                queue.ret(record);
            }
        }

        match outcome {
            Outcome::Success { latency_ms, content_length, prompt_tokens, completion_tokens } => {
                ctx.endpoints.record_success(ctx.job.method, &ctx.job.api_path, latency_ms, content_length);
                ctx.token_stats.record(prompt_tokens, completion_tokens);
            }
            Outcome::Failure { latency_ms, category } => {
                ctx.endpoints.record_failure(ctx.job.method, &ctx.job.api_path, latency_ms);
                tracing::debug!(task_id = %ctx.job.id, category, "request failed");
            }
        }
    }

    ctx.current_users.fetch_sub(1, Ordering::Relaxed);
}

fn reqwest_method(m: HttpMethod) -> Method {
    match m {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Delete => Method::DELETE,
        HttpMethod::Patch => Method::PATCH,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_stats_accumulate_across_records() {
        let stats = TokenStats::default();
        stats.record(Some(10), Some(5));
        stats.record(Some(3), None);
        assert_eq!(stats.requests.load(Ordering::Relaxed), 2);
        assert_eq!(stats.prompt_tokens.load(Ordering::Relaxed), 13);
        assert_eq!(stats.completion_tokens.load(Ordering::Relaxed), 5);
    }
}
