//! Entry point: `serve` runs the poller/pipeline daemon; the hidden `run`
//! subcommand is the runner mode the Process Supervisor re-execs this same
//! binary into for one claimed job (§4.9).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use lmeterx_stress_engine::config::Config;
use lmeterx_stress_engine::dataset;
use lmeterx_stress_engine::mapping;
use lmeterx_stress_engine::metrics::realtime::{self, LiveCounters};
use lmeterx_stress_engine::metrics::MetricEventBus;
use lmeterx_stress_engine::models::{ApiFlavor, ChatType, HttpMethod, Job, JobStatus, LlmExtras, LoadConfig};
use lmeterx_stress_engine::observability;
use lmeterx_stress_engine::pipeline::Pipeline;
use lmeterx_stress_engine::supervisor::{self, RunnerResult};
use lmeterx_stress_engine::swarm::{self, SwarmController};

#[derive(Parser)]
#[command(name = "lmeterx-engine", about = "Distributed load-testing stress engine")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Emit JSON-formatted logs instead of the human-readable default.
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Runs the poller + pipeline daemon (default when no subcommand is given).
    Serve {
        /// Reconcile once, then exit instead of looping forever.
        #[arg(long)]
        once: bool,
    },
    /// Hidden runner mode: executes exactly one load test, invoked by the supervisor.
    Run(RunArgs),
}

#[derive(Parser)]
struct RunArgs {
    #[arg(long)]
    task_id: String,
    #[arg(long)]
    target_host: String,
    #[arg(long)]
    api_path: String,
    #[arg(long, default_value = "POST")]
    method: String,
    #[arg(long, default_value = "{}")]
    headers_json: String,
    #[arg(long, default_value = "{}")]
    cookies_json: String,
    #[arg(long)]
    payload_json: Option<String>,
    #[arg(long)]
    body_text: Option<String>,
    #[arg(long)]
    dataset: Option<String>,
    #[arg(long)]
    api_flavor: Option<String>,
    #[arg(long, default_value = "")]
    model: String,
    #[arg(long)]
    stream: bool,
    #[arg(long, default_value = "0")]
    chat_type: u8,
    #[arg(long)]
    field_mapping_json: Option<String>,
    #[arg(long)]
    cert_file: Option<String>,
    #[arg(long)]
    key_file: Option<String>,
    #[arg(long, default_value = "fixed")]
    load_mode: String,
    #[arg(long, default_value_t = 1)]
    users: u32,
    #[arg(long, default_value_t = 1.0)]
    spawn_rate: f64,
    #[arg(long, default_value_t = 60)]
    duration_seconds: u64,
    #[arg(long)]
    result_dir: PathBuf,
    #[arg(long)]
    warmup_mode: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    observability::init_tracing(cli.json_logs);

    match cli.command.unwrap_or(Command::Serve { once: false }) {
        Command::Serve { once } => serve(once).await,
        Command::Run(args) => run_one(args).await,
    }
}

async fn serve(once: bool) -> anyhow::Result<()> {
    let config = Config::resolve()?;

    #[cfg(feature = "postgres")]
    {
        let store = lmeterx_stress_engine::db::PgJobStore::connect(&config.database).await?;
        store.run_migrations().await?;
        let store = Arc::new(store);

        let log_dir = PathBuf::from(std::env::var("LOG_DIR").unwrap_or_else(|_| "/tmp/lmeterx_logs".to_string()));
        let tmp_root = PathBuf::from(std::env::var("TMP_ROOT").unwrap_or_else(|_| std::env::temp_dir().display().to_string()));

        let pipeline = Pipeline::new(store, config, log_dir, tmp_root);
        pipeline.reconcile_on_startup().await;

        if once {
            return Ok(());
        }

        pipeline.spawn_background_loops();
        tracing::info!("engine started");
        tokio::signal::ctrl_c().await?;
        tracing::info!("shutdown signal received");
    }

    #[cfg(not(feature = "postgres"))]
    {
        let _ = config;
        anyhow::bail!("the `postgres` feature is required to serve");
    }

    Ok(())
}

/// Runner mode (§4.9, §6): executes one load test end to end and writes the
/// result JSON + real-time sidecar to `--result-dir`.
async fn run_one(args: RunArgs) -> anyhow::Result<()> {
    let config = Config::resolve()?;
    let job = build_job_from_args(&args)?;

    let mapping = Arc::new(
        job.llm
            .as_ref()
            .map(|l| mapping::resolve(l.api_flavor, l.field_mapping.as_ref()))
            .transpose()?
            .unwrap_or(mapping::resolve(ApiFlavor::Custom, None)?),
    );

    let prompt_queue = match &job.test_data_inline.clone().or_else(|| job.test_data_path.clone()) {
        Some(content) => {
            let chat_type = job.llm.as_ref().map(|l| l.chat_type).unwrap_or(ChatType::Text);
            Some(Arc::new(dataset::load(content, chat_type)?))
        }
        None => None,
    };

    let client = reqwest::Client::builder()
        .connect_timeout(config.http.connect_timeout)
        .timeout(config.http.read_timeout)
        .pool_idle_timeout(config.http.pool_idle_timeout)
        .build()?;

    let metrics = Arc::new(MetricEventBus::new());
    let endpoints = Arc::new(swarm::EndpointAggregates::new());
    let live_counters = Arc::new(LiveCounters::default());

    let stop_timeout = Duration::from_secs(if args.warmup_mode {
        config.engine.warmup_stop_timeout_secs
    } else {
        config.engine.llm_stop_timeout_secs
    });

    let controller = SwarmController {
        job: Arc::new(job.clone()),
        mapping,
        client,
        metrics: metrics.clone(),
        endpoints: endpoints.clone(),
        prompt_queue: prompt_queue.filter(|_| !args.warmup_mode),
        live_counters: live_counters.clone(),
        stop_timeout,
    };

    let load_shape = swarm::from_load_config(&job.load);
    let (_stop_tx, stop_rx) = tokio::sync::watch::channel(false);

    let sidecar = args.result_dir.join("realtime_metrics.jsonl");
    let sampler_endpoints = endpoints.clone();
    let sampler_counters = live_counters.clone();
    let (_sampler_stop_tx, sampler_stop_rx) = tokio::sync::watch::channel(false);
    let sampler_task = if !args.warmup_mode {
        Some(tokio::spawn(realtime::run(
            args.task_id.clone(),
            sidecar,
            config.engine.sample_interval,
            sampler_counters,
            sampler_endpoints,
            sampler_stop_rx,
        )))
    } else {
        None
    };

    let result = controller.run(load_shape, stop_rx).await;

    if let Some(task) = sampler_task {
        task.abort();
    }

    if !args.warmup_mode {
        let token_metrics = if job.is_llm() {
            Some(build_token_metrics(&args.task_id, &metrics, &result))
        } else {
            None
        };
        let runner_result = RunnerResult {
            result_rows: result.result_rows,
            token_metrics,
        };
        supervisor::write_result_file(&args.result_dir, &runner_result)?;
    }

    Ok(())
}

fn build_token_metrics(
    task_id: &str,
    metrics: &MetricEventBus,
    result: &swarm::SwarmResult,
) -> lmeterx_stress_engine::models::TokenMetricsRow {
    use lmeterx_stress_engine::metrics::{
        TIME_TO_FIRST_OUTPUT_TOKEN, TIME_TO_FIRST_REASONING_TOKEN,
        TIME_TO_OUTPUT_COMPLETION, TIME_TO_REASONING_COMPLETION, TOTAL_TIME,
    };
    let elapsed = result.elapsed_secs.max(0.001);
    let requests = result.token_stats_requests.max(1) as f64;
    lmeterx_stress_engine::models::TokenMetricsRow {
        task_id: task_id.to_string(),
        total_tps: (result.total_prompt_tokens + result.total_completion_tokens) as f64 / elapsed,
        completion_tps: result.total_completion_tokens as f64 / elapsed,
        avg_total_tokens_per_req: (result.total_prompt_tokens + result.total_completion_tokens) as f64 / requests,
        avg_completion_tokens_per_req: result.total_completion_tokens as f64 / requests,
        time_to_first_output_token: metrics.summary(TIME_TO_FIRST_OUTPUT_TOKEN),
        time_to_first_reasoning_token: metrics.summary(TIME_TO_FIRST_REASONING_TOKEN),
        time_to_reasoning_completion: metrics.summary(TIME_TO_REASONING_COMPLETION),
        time_to_output_completion: metrics.summary(TIME_TO_OUTPUT_COMPLETION),
        total_time: metrics.summary(TOTAL_TIME),
    }
}

fn build_job_from_args(args: &RunArgs) -> anyhow::Result<Job> {
    let method = match args.method.to_uppercase().as_str() {
        "GET" => HttpMethod::Get,
        "PUT" => HttpMethod::Put,
        "DELETE" => HttpMethod::Delete,
        "PATCH" => HttpMethod::Patch,
        _ => HttpMethod::Post,
    };

    let load = if args.load_mode == "stepped" {
        LoadConfig::Stepped {
            start_users: env_parse("STEPPED_START_USERS", 1),
            increment: env_parse("STEPPED_INCREMENT", 1),
            step_duration: env_parse("STEPPED_STEP_DURATION_SECS", 60),
            max_users: env_parse("STEPPED_MAX_USERS", 1),
            sustain_duration: env_parse("STEPPED_SUSTAIN_DURATION_SECS", 0),
        }
    } else {
        LoadConfig::Fixed {
            users: args.users,
            spawn_rate: args.spawn_rate,
            duration_seconds: args.duration_seconds,
        }
    };

    let llm = args.api_flavor.as_ref().map(|flavor| {
        let api_flavor = flavor.parse().unwrap_or(ApiFlavor::OpenaiChat);
        LlmExtras {
            model: args.model.clone(),
            api_flavor,
            stream_mode: args.stream,
            chat_type: ChatType::from_u8(args.chat_type),
            field_mapping: args
                .field_mapping_json
                .as_ref()
                .and_then(|s| serde_json::from_str(s).ok()),
            warmup_enabled: false,
            warmup_duration_secs: 0,
        }
    });

    Ok(Job {
        id: args.task_id.clone(),
        name: args.task_id.clone(),
        created_by: String::new(),
        created_at: chrono::Utc::now(),
        is_deleted: false,
        target_host: args.target_host.clone(),
        api_path: args.api_path.clone(),
        method,
        headers: serde_json::from_str(&args.headers_json).unwrap_or_default(),
        cookies: serde_json::from_str(&args.cookies_json).unwrap_or_default(),
        request_payload: args.payload_json.as_ref().and_then(|s| serde_json::from_str(s).ok()),
        request_body_text: args.body_text.clone(),
        test_data_path: None,
        test_data_inline: args.dataset.clone(),
        load,
        llm,
        cert_file: args.cert_file.clone(),
        key_file: args.key_file.clone(),
        status: JobStatus::Running,
        error_message: None,
    })
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
