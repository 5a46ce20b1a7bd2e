//! Swarm Controller (§4.7): the cooperative task loop that ramps virtual
//! users according to a [`LoadShape`], then tears them down on stop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::dataset::queue::PromptQueue;
use crate::mapping::FieldMapping;
use crate::metrics::realtime::LiveCounters;
use crate::metrics::MetricEventBus;
use crate::models::{Job, ResultRow};
use crate::swarm::load_shape::{LoadShape, Tick};
use crate::swarm::stats::EndpointAggregates;
use crate::swarm::worker::{run_user, TokenStats, UserContext};

/// Produced by `test_stop` (§4.7): the finished run's aggregates, ready for
/// the Task Pipeline to persist.
pub struct SwarmResult {
    pub result_rows: Vec<ResultRow>,
    pub token_stats_requests: u64,
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub elapsed_secs: f64,
}

pub struct SwarmController {
    pub job: Arc<Job>,
    pub mapping: Arc<FieldMapping>,
    pub client: reqwest::Client,
    pub metrics: Arc<MetricEventBus>,
    pub endpoints: Arc<EndpointAggregates>,
    pub prompt_queue: Option<Arc<PromptQueue>>,
    pub live_counters: Arc<LiveCounters>,
    pub stop_timeout: Duration,
}

impl SwarmController {
    /// Drives the run to completion: ramps per `load_shape`, watches
    /// `external_stop` (the pipeline's stop-signal path, §4.10), and returns
    /// the aggregated result once every user has drained (§4.7 step "on stop").
    pub async fn run(
        &self,
        mut load_shape: Box<dyn LoadShape>,
        mut external_stop: watch::Receiver<bool>,
    ) -> SwarmResult {
        let target = Arc::new(AtomicU64::new(0));
        let token_stats = Arc::new(TokenStats::default());
        let current_users = Arc::new(AtomicU64::new(0));
        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        let mut spawned: usize = 0;

        let start = Instant::now();
        let mut tick_interval = tokio::time::interval(Duration::from_secs(1));
        tick_interval.tick().await; // consume the immediate first tick

        loop {
            if *external_stop.borrow() {
                break;
            }

            let elapsed = start.elapsed();
            match load_shape.tick(elapsed) {
                Tick::Stop => break,
                Tick::Continue { target_users, spawn_rate } => {
                    target.store(target_users as u64, Ordering::Relaxed);
                    self.live_counters.current_users.store(target_users as u64, Ordering::Relaxed);

                    let spawn_interval = if spawn_rate > 0.0 {
                        Duration::from_secs_f64((1.0 / spawn_rate).max(0.001))
                    } else {
                        Duration::from_secs(1)
                    };

                    while spawned < target_users as usize {
                        handles.push(self.spawn_user(spawned, &target, &token_stats, &current_users));
                        spawned += 1;
                        if spawned < target_users as usize {
                            tokio::time::sleep(spawn_interval.min(Duration::from_millis(200))).await;
                        }
                    }
                }
            }

            tokio::select! {
                _ = tick_interval.tick() => {}
                changed = external_stop.changed() => {
                    if changed.is_err() || *external_stop.borrow() {
                        break;
                    }
                }
            }

            self.sync_counters(&current_users);
        }

        // Stopping phase (§4.7, §5): give in-flight users stop-timeout seconds to drain.
        target.store(0, Ordering::Relaxed);
        let drain = tokio::time::timeout(self.stop_timeout, join_all(&mut handles)).await;
        if drain.is_err() {
            for h in &handles {
                h.abort();
            }
        }
        self.sync_counters(&current_users);

        let elapsed_secs = start.elapsed().as_secs_f64();
        SwarmResult {
            result_rows: self.endpoints.to_result_rows(&self.job.id, elapsed_secs),
            token_stats_requests: token_stats.requests.load(Ordering::Relaxed),
            total_prompt_tokens: token_stats.prompt_tokens.load(Ordering::Relaxed),
            total_completion_tokens: token_stats.completion_tokens.load(Ordering::Relaxed),
            elapsed_secs,
        }
    }

    fn spawn_user(
        &self,
        index: usize,
        target: &Arc<AtomicU64>,
        token_stats: &Arc<TokenStats>,
        current_users: &Arc<AtomicU64>,
    ) -> JoinHandle<()> {
        let ctx = UserContext {
            index,
            target: target.clone(),
            job: self.job.clone(),
            client: self.client.clone(),
            mapping: self.mapping.clone(),
            metrics: self.metrics.clone(),
            endpoints: self.endpoints.clone(),
            token_stats: token_stats.clone(),
            prompt_queue: self.prompt_queue.clone(),
            current_users: current_users.clone(),
        };
        tokio::spawn(run_user(ctx))
    }

    fn sync_counters(&self, current_users: &Arc<AtomicU64>) {
        self.live_counters
            .total_requests
            .store(self.endpoints.total_requests(), Ordering::Relaxed);
        self.live_counters
            .total_failures
            .store(self.endpoints.total_failures(), Ordering::Relaxed);
        self.live_counters
            .current_users
            .store(current_users.load(Ordering::Relaxed), Ordering::Relaxed);
    }
}

async fn join_all(handles: &mut Vec<JoinHandle<()>>) {
    for h in handles.drain(..) {
        let _ = h.await;
    }
}
