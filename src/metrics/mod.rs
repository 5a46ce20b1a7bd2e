//! Metric Event Bus (§4.6): fire-and-aggregate registry for the LLM-specific
//! metric names listed in §2 C6. Locust-style per-endpoint aggregation is
//! implemented separately in [`crate::swarm::EndpointStats`] — this bus
//! only holds the custom metrics.

pub mod realtime;

use std::collections::HashMap;
use std::sync::Mutex;

use crate::models::MetricSummary;

/// Exact-series cutover: below this many samples, percentiles are computed
/// from the full sorted series; above it, from a reservoir sample with an
/// exact tail buffer (§4.6).
const EXACT_SERIES_LIMIT: usize = 100_000;
/// Size of the reservoir kept once a series exceeds [`EXACT_SERIES_LIMIT`].
const RESERVOIR_SIZE: usize = 10_000;
/// Size of the exact tail buffer kept alongside the reservoir, so the most
/// recent observations are never approximated.
const EXACT_TAIL_SIZE: usize = 1_000;

/// Metric names used by the engine (§2 C6).
pub const TIME_TO_FIRST_OUTPUT_TOKEN: &str = "Time_to_first_output_token";
pub const TIME_TO_FIRST_REASONING_TOKEN: &str = "Time_to_first_reasoning_token";
pub const TIME_TO_REASONING_COMPLETION: &str = "Time_to_reasoning_completion";
pub const TIME_TO_OUTPUT_COMPLETION: &str = "Time_to_output_completion";
pub const TOTAL_TIME: &str = "Total_time";
pub const INPUT_TOKENS: &str = "Input_tokens";
pub const COMPLETION_TOKENS: &str = "Completion_tokens";

struct Series {
    reservoir: Vec<f64>,
    tail: std::collections::VecDeque<f64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
    content_length_sum: u64,
}

impl Series {
    fn new() -> Self {
        Self {
            reservoir: Vec::new(),
            tail: std::collections::VecDeque::new(),
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            content_length_sum: 0,
        }
    }

    fn push(&mut self, value: f64, content_length: u64, rng: &mut impl rand::Rng) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.content_length_sum += content_length;

        if (self.count as usize) <= EXACT_SERIES_LIMIT {
            self.reservoir.push(value);
            if self.reservoir.len() > EXACT_SERIES_LIMIT {
                self.degrade_to_reservoir(rng);
            }
        } else {
            // Reservoir sampling for the approximate bulk, exact tail for the recent window.
            let idx = rng.gen_range(0..self.count as usize);
            if idx < RESERVOIR_SIZE {
                if self.reservoir.len() < RESERVOIR_SIZE {
                    self.reservoir.push(value);
                } else {
                    self.reservoir[idx % RESERVOIR_SIZE] = value;
                }
            }
        }

        self.tail.push_back(value);
        if self.tail.len() > EXACT_TAIL_SIZE {
            self.tail.pop_front();
        }
    }

    fn degrade_to_reservoir(&mut self, rng: &mut impl rand::Rng) {
        use rand::seq::SliceRandom;
        self.reservoir.shuffle(rng);
        self.reservoir.truncate(RESERVOIR_SIZE);
    }

    fn summary(&self) -> MetricSummary {
        if self.count == 0 {
            return MetricSummary::default();
        }
        let mean = self.sum / self.count as f64;

        // Below the exact limit the reservoir literally *is* the full series.
        let source: Vec<f64> = if (self.count as usize) <= EXACT_SERIES_LIMIT {
            self.reservoir.clone()
        } else {
            let mut combined: Vec<f64> = self.reservoir.clone();
            combined.extend(self.tail.iter().copied());
            combined
        };

        let (median, p95) = percentiles(&source);

        MetricSummary {
            count: self.count,
            sum: self.sum,
            min: if self.min.is_finite() { self.min } else { 0.0 },
            max: if self.max.is_finite() { self.max } else { 0.0 },
            mean,
            median,
            p95,
        }
    }

    fn avg_content_length(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.content_length_sum as f64 / self.count as f64
        }
    }
}

fn percentiles(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let median = percentile_of_sorted(&sorted, 0.50);
    let p95 = percentile_of_sorted(&sorted, 0.95);
    (median, p95)
}

fn percentile_of_sorted(sorted: &[f64], pct: f64) -> f64 {
    if sorted.len() == 1 {
        return sorted[0];
    }
    let rank = pct * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        sorted[lo]
    } else {
        let frac = rank - lo as f64;
        sorted[lo] + (sorted[hi] - sorted[lo]) * frac
    }
}

/// Single-process, mutex-protected registry of named metric series (§4.6).
pub struct MetricEventBus {
    series: Mutex<HashMap<String, Series>>,
}

impl Default for MetricEventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricEventBus {
    pub fn new() -> Self {
        Self {
            series: Mutex::new(HashMap::new()),
        }
    }

    /// Appends one observation to the named series (§4.6).
    pub fn fire(&self, name: &str, value_ms: f64, content_length: u64) {
        let mut guard = self.series.lock().unwrap();
        let entry = guard.entry(name.to_string()).or_insert_with(Series::new);
        let mut rng = rand::thread_rng();
        entry.push(value_ms, content_length, &mut rng);
    }

    pub fn summary(&self, name: &str) -> MetricSummary {
        self.series
            .lock()
            .unwrap()
            .get(name)
            .map(Series::summary)
            .unwrap_or_default()
    }

    pub fn avg_content_length(&self, name: &str) -> f64 {
        self.series
            .lock()
            .unwrap()
            .get(name)
            .map(Series::avg_content_length)
            .unwrap_or(0.0)
    }

    pub fn metric_names(&self) -> Vec<String> {
        self.series.lock().unwrap().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fires_and_summarizes_single_metric() {
        let bus = MetricEventBus::new();
        bus.fire(TOTAL_TIME, 100.0, 0);
        bus.fire(TOTAL_TIME, 200.0, 0);
        bus.fire(TOTAL_TIME, 300.0, 0);
        let summary = bus.summary(TOTAL_TIME);
        assert_eq!(summary.count, 3);
        assert_eq!(summary.min, 100.0);
        assert_eq!(summary.max, 300.0);
        assert_eq!(summary.mean, 200.0);
        assert_eq!(summary.median, 200.0);
    }

    #[test]
    fn unknown_metric_summary_is_zeroed() {
        let bus = MetricEventBus::new();
        let summary = bus.summary("nonexistent");
        assert_eq!(summary.count, 0);
    }

    #[test]
    fn time_to_first_output_token_fires_exactly_once_scenario_property_3() {
        let bus = MetricEventBus::new();
        // Simulates: one request, first non-empty content chunk fires once.
        bus.fire(TIME_TO_FIRST_OUTPUT_TOKEN, 42.0, 0);
        assert_eq!(bus.summary(TIME_TO_FIRST_OUTPUT_TOKEN).count, 1);
    }
}
