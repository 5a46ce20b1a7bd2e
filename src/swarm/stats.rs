//! Per-endpoint aggregation (§4.7 GLOSSARY "EndpointStats"): the
//! Locust-style request/failure/latency rollup keyed by `(method, path)`,
//! plus a combined "Aggregated" row matching the `result` table contract (§6).

use std::collections::HashMap;
use std::sync::Mutex;

use crate::models::{HttpMethod, MetricSummary, ResultRow};

const EXACT_LIMIT: usize = 100_000;

#[derive(Default)]
struct Latencies {
    sorted_exact: Vec<f64>,
    sum: f64,
    count: u64,
    min: f64,
    max: f64,
}

impl Latencies {
    fn push(&mut self, ms: f64) {
        self.count += 1;
        self.sum += ms;
        self.min = if self.count == 1 { ms } else { self.min.min(ms) };
        self.max = if self.count == 1 { ms } else { self.max.max(ms) };
        if self.sorted_exact.len() < EXACT_LIMIT {
            self.sorted_exact.push(ms);
        }
    }

    fn summary(&self) -> MetricSummary {
        if self.count == 0 {
            return MetricSummary::default();
        }
        let mut sorted = self.sorted_exact.clone();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
        let median = percentile(&sorted, 0.50);
        let p95 = percentile(&sorted, 0.95);
        MetricSummary {
            count: self.count,
            sum: self.sum,
            min: self.min,
            max: self.max,
            mean: self.sum / self.count as f64,
            median,
            p95,
        }
    }
}

fn percentile(sorted: &[f64], pct: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = pct * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64)
    }
}

#[derive(Default)]
struct Entry {
    num_requests: u64,
    num_failures: u64,
    content_length_sum: u64,
    latencies: Latencies,
}

/// Flattened aggregate latency snapshot consumed by the realtime sampler.
#[derive(Debug, Clone, Copy, Default)]
pub struct AggregateLatency {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
    pub p95: f64,
}

/// Mutex-protected registry of per-endpoint stats, one process per running
/// job. Key is `(method, path)`; an implicit `"Aggregated"` row is derived
/// on read by summing every endpoint's series (§4.7).
#[derive(Default)]
pub struct EndpointAggregates {
    entries: Mutex<HashMap<(HttpMethod, String), Entry>>,
}

impl EndpointAggregates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self, method: HttpMethod, path: &str, latency_ms: f64, content_length: u64) {
        let mut guard = self.entries.lock().unwrap();
        let entry = guard.entry((method, path.to_string())).or_default();
        entry.num_requests += 1;
        entry.content_length_sum += content_length;
        entry.latencies.push(latency_ms);
    }

    pub fn record_failure(&self, method: HttpMethod, path: &str, latency_ms: f64) {
        let mut guard = self.entries.lock().unwrap();
        let entry = guard.entry((method, path.to_string())).or_default();
        entry.num_requests += 1;
        entry.num_failures += 1;
        entry.latencies.push(latency_ms);
    }

    /// Combined latency snapshot across every endpoint, used by the
    /// realtime sampler's per-tick summary.
    pub fn aggregate_latency(&self) -> AggregateLatency {
        let guard = self.entries.lock().unwrap();
        let mut combined = Latencies::default();
        for entry in guard.values() {
            for &v in &entry.latencies.sorted_exact {
                combined.push(v);
            }
        }
        let summary = combined.summary();
        AggregateLatency {
            mean: summary.mean,
            min: summary.min,
            max: summary.max,
            median: summary.median,
            p95: summary.p95,
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.entries.lock().unwrap().values().map(|e| e.num_requests).sum()
    }

    pub fn total_failures(&self) -> u64 {
        self.entries.lock().unwrap().values().map(|e| e.num_failures).sum()
    }

    /// Builds the `result` rows (§3 `ResultRow`, §6): one per endpoint plus
    /// a final `"Aggregated"` row, the way Locust's stats export does.
    pub fn to_result_rows(&self, task_id: &str, elapsed_secs: f64) -> Vec<ResultRow> {
        let guard = self.entries.lock().unwrap();
        let elapsed = elapsed_secs.max(0.001);
        let mut rows = Vec::with_capacity(guard.len() + 1);

        let mut agg = Latencies::default();
        let mut agg_requests = 0u64;
        let mut agg_failures = 0u64;
        let mut agg_content = 0u64;

        for ((method, path), entry) in guard.iter() {
            let summary = entry.latencies.summary();
            rows.push(ResultRow {
                task_id: task_id.to_string(),
                metric_type: format!("{} {}", method.as_str(), path),
                num_requests: entry.num_requests,
                num_failures: entry.num_failures,
                avg_latency: summary.mean,
                min_latency: summary.min,
                max_latency: summary.max,
                median_latency: summary.median,
                p95_latency: summary.p95,
                rps: entry.num_requests as f64 / elapsed,
                avg_content_length: if entry.num_requests == 0 {
                    0.0
                } else {
                    entry.content_length_sum as f64 / entry.num_requests as f64
                },
            });
            agg_requests += entry.num_requests;
            agg_failures += entry.num_failures;
            agg_content += entry.content_length_sum;
            for &v in &entry.latencies.sorted_exact {
                agg.push(v);
            }
        }

        let agg_summary = agg.summary();
        rows.push(ResultRow {
            task_id: task_id.to_string(),
            metric_type: "Aggregated".to_string(),
            num_requests: agg_requests,
            num_failures: agg_failures,
            avg_latency: agg_summary.mean,
            min_latency: agg_summary.min,
            max_latency: agg_summary.max,
            median_latency: agg_summary.median,
            p95_latency: agg_summary.p95,
            rps: agg_requests as f64 / elapsed,
            avg_content_length: if agg_requests == 0 {
                0.0
            } else {
                agg_content as f64 / agg_requests as f64
            },
        });

        rows
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregated_row_sums_every_endpoint() {
        let stats = EndpointAggregates::new();
        stats.record_success(HttpMethod::Post, "/v1/chat", 100.0, 50);
        stats.record_success(HttpMethod::Post, "/v1/chat", 200.0, 60);
        stats.record_failure(HttpMethod::Post, "/v1/embeddings", 50.0);

        let rows = stats.to_result_rows("t1", 10.0);
        let aggregated = rows.iter().find(|r| r.metric_type == "Aggregated").unwrap();
        assert_eq!(aggregated.num_requests, 3);
        assert_eq!(aggregated.num_failures, 1);
        assert_eq!(rows.len(), 3); // 2 endpoints + aggregated
    }

    #[test]
    fn empty_aggregates_have_zeroed_summary() {
        let stats = EndpointAggregates::new();
        let latency = stats.aggregate_latency();
        assert_eq!(latency.mean, 0.0);
        assert_eq!(stats.total_requests(), 0);
    }
}
