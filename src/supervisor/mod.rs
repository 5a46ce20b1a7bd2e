//! Process Supervisor (§4.9): spawns the runner subprocess for one claimed
//! job, drains its stdout/stderr into the per-task log sink, waits with a
//! timeout, and reconciles orphaned processes on startup.
//!
//! The runner subprocess is this same binary re-exec'd under the hidden
//! `run` subcommand (see `main.rs`), following the same spawn-pipe-wait
//! shape as an external tool invocation, adapted here so the process being
//! spawned is ourselves in a different mode.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::error::SupervisorError;
use crate::models::{Job, LoadConfig, ResultRow, TokenMetricsRow};
use crate::observability::TaskLogSink;

/// Result file written by the runner before exit (§4.9 step 6, §6).
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct RunnerResult {
    pub result_rows: Vec<ResultRow>,
    pub token_metrics: Option<TokenMetricsRow>,
}

/// Builds the runner's argv and stepped-mode environment variables (§4.9 step 1).
pub fn build_argv(job: &Job, result_dir: &Path, warmup_mode: bool) -> (Vec<String>, HashMap<String, String>) {
    let mut argv = vec![
        "run".to_string(),
        "--task-id".to_string(),
        job.id.clone(),
        "--target-host".to_string(),
        job.target_host.clone(),
        "--api-path".to_string(),
        job.api_path.clone(),
        "--method".to_string(),
        job.method.as_str().to_string(),
        "--headers-json".to_string(),
        serde_json::to_string(&job.headers).unwrap_or_default(),
        "--cookies-json".to_string(),
        serde_json::to_string(&job.cookies).unwrap_or_default(),
        "--result-dir".to_string(),
        result_dir.display().to_string(),
    ];

    if let Some(payload) = &job.request_payload {
        argv.push("--payload-json".to_string());
        argv.push(serde_json::to_string(payload).unwrap_or_default());
    } else if let Some(text) = &job.request_body_text {
        argv.push("--body-text".to_string());
        argv.push(text.clone());
    }

    let dataset = job
        .test_data_inline
        .clone()
        .or_else(|| job.test_data_path.clone());
    if let Some(dataset) = dataset {
        argv.push("--dataset".to_string());
        argv.push(dataset);
    }

    if let Some(llm) = &job.llm {
        argv.push("--api-flavor".to_string());
        argv.push(format!("{:?}", llm.api_flavor).to_lowercase());
        argv.push("--model".to_string());
        argv.push(llm.model.clone());
        argv.push("--chat-type".to_string());
        argv.push((llm.chat_type as u8).to_string());
        if llm.stream_mode {
            argv.push("--stream".to_string());
        }
        if let Some(mapping) = &llm.field_mapping {
            argv.push("--field-mapping-json".to_string());
            argv.push(serde_json::to_string(mapping).unwrap_or_default());
        }
    }

    if let Some(cert) = &job.cert_file {
        argv.push("--cert-file".to_string());
        argv.push(cert.clone());
    }
    if let Some(key) = &job.key_file {
        argv.push("--key-file".to_string());
        argv.push(key.clone());
    }

    if warmup_mode {
        argv.push("--warmup-mode".to_string());
    }

    let mut env = HashMap::new();
    match &job.load {
        LoadConfig::Fixed { users, spawn_rate, duration_seconds } => {
            argv.push("--load-mode".to_string());
            argv.push("fixed".to_string());
            argv.push("--users".to_string());
            argv.push(users.to_string());
            argv.push("--spawn-rate".to_string());
            argv.push(spawn_rate.to_string());
            argv.push("--duration-seconds".to_string());
            argv.push(duration_seconds.to_string());
        }
        LoadConfig::Stepped {
            start_users,
            increment,
            step_duration,
            max_users,
            sustain_duration,
        } => {
            argv.push("--load-mode".to_string());
            argv.push("stepped".to_string());
            // Stepped-mode parameters travel via environment variables (§4.9 step 1)
            // so the LoadShape built inside the runner can read them directly.
            env.insert("STEPPED_START_USERS".to_string(), start_users.to_string());
            env.insert("STEPPED_INCREMENT".to_string(), increment.to_string());
            env.insert("STEPPED_STEP_DURATION_SECS".to_string(), step_duration.to_string());
            env.insert("STEPPED_MAX_USERS".to_string(), max_users.to_string());
            env.insert("STEPPED_SUSTAIN_DURATION_SECS".to_string(), sustain_duration.to_string());
        }
    }

    (argv, env)
}

/// A spawned runner subprocess with its stdout/stderr pump tasks (§4.9 step 2).
pub struct RunnerHandle {
    child: Child,
    stdout_task: JoinHandle<()>,
    stderr_task: JoinHandle<()>,
}

impl RunnerHandle {
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }
}

/// Spawns the runner subprocess, piping stdout/stderr line-by-line into the
/// per-task log sink via two drain tasks (§4.9 step 2).
pub fn spawn(
    job: &Job,
    result_dir: &Path,
    warmup_mode: bool,
    log_sink: std::sync::Arc<TaskLogSink>,
) -> Result<RunnerHandle, SupervisorError> {
    let exe = std::env::current_exe().map_err(SupervisorError::SpawnFailed)?;
    let (argv, env) = build_argv(job, result_dir, warmup_mode);

    let mut cmd = Command::new(exe);
    cmd.args(&argv).envs(&env).stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        cmd.process_group(0);
    }

    let mut child = cmd.spawn().map_err(SupervisorError::SpawnFailed)?;

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    let sink_out = log_sink.clone();
    let stdout_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink_out.write_line(&line);
        }
    });

    let sink_err = log_sink;
    let stderr_task = tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink_err.write_line(&format!("[stderr] {line}"));
        }
    });

    Ok(RunnerHandle { child, stdout_task, stderr_task })
}

/// Outcome of waiting for the runner to exit (§4.9 step 5).
pub enum RunOutcome {
    Exited(std::process::ExitStatus),
    TimedOut,
}

/// Waits for exit with the contractual `duration + stop_timeout + buffer`
/// ceiling; on timeout, terminates (SIGTERM, 10s grace, SIGKILL) without
/// returning the exit status (§4.9 step 5, §5 cancellation policy).
pub async fn wait_with_timeout(handle: &mut RunnerHandle, timeout: Duration, kill_grace: Duration) -> RunOutcome {
    match tokio::time::timeout(timeout, handle.child.wait()).await {
        Ok(Ok(status)) => RunOutcome::Exited(status),
        Ok(Err(_)) | Err(_) => {
            if let Some(pid) = handle.child.id() {
                terminate_process_group(pid);
                let _ = tokio::time::timeout(kill_grace, handle.child.wait()).await;
                if handle.child.try_wait().ok().flatten().is_none() {
                    let _ = handle.child.start_kill();
                    kill_process_group(pid);
                }
            }
            RunOutcome::TimedOut
        }
    }
}

/// Drains remaining pump-task output after the child has exited.
pub async fn join_pumps(handle: RunnerHandle) {
    let _ = handle.stdout_task.await;
    let _ = handle.stderr_task.await;
}

#[cfg(unix)]
fn terminate_process_group(pid: u32) {
    unsafe {
        libc::kill(-(pid as i32), libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn terminate_process_group(_pid: u32) {}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    unsafe {
        libc::kill(-(pid as i32), libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

/// Sends SIGTERM to a known master pid, waits `grace`, then SIGKILL if still
/// alive (§4.10 "Stop signal path").
pub async fn terminate_then_kill(pid: u32, grace: Duration) {
    terminate_process_group(pid);
    tokio::time::sleep(grace).await;
    if process_alive(pid) {
        kill_process_group(pid);
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}

/// Reads back the runner's result JSON (§4.9 step 6).
pub fn read_result_file(result_dir: &Path) -> Result<RunnerResult, SupervisorError> {
    let path = result_dir.join("result.json");
    let contents = std::fs::read_to_string(&path).map_err(|e| SupervisorError::ResultFileUnavailable {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    serde_json::from_str(&contents).map_err(|e| SupervisorError::ResultFileUnavailable {
        path: path.display().to_string(),
        reason: e.to_string(),
    })
}

pub fn write_result_file(result_dir: &Path, result: &RunnerResult) -> std::io::Result<()> {
    std::fs::create_dir_all(result_dir)?;
    let path = result_dir.join("result.json");
    std::fs::write(path, serde_json::to_string(result).unwrap_or_default())
}

/// Deletes the per-task result directory after its contents have been read
/// into memory (§4.8 "Task Pipeline reads the file into memory before the
/// result directory is deleted").
pub fn cleanup_result_dir(result_dir: &Path) {
    let _ = std::fs::remove_dir_all(result_dir);
}

/// Startup reconciliation (§4.1, §4.9 step 7, S6): true if any live process's
/// command line mentions the task id.
pub fn is_task_still_running(task_id: &str) -> bool {
    use sysinfo::System;
    let mut system = System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
    system.processes().values().any(|p| {
        p.cmd()
            .iter()
            .any(|arg| arg.to_string_lossy().contains(task_id))
    })
}

/// Kills any orphaned runner whose command line contains `task_id`, then
/// removes it (§4.9 step 6).
pub fn sweep_orphan(task_id: &str) {
    use sysinfo::System;
    let mut system = System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
    for (pid, process) in system.processes() {
        let matches = process
            .cmd()
            .iter()
            .any(|arg| arg.to_string_lossy().contains(task_id));
        if matches {
            process.kill();
            tracing::warn!(task_id, pid = pid.as_u32(), "killed orphaned runner process");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ApiFlavor, ChatType, HttpMethod, JobStatus, LlmExtras};
    use std::collections::HashMap as Map;

    fn job_with_load(load: LoadConfig) -> Job {
        Job {
            id: "task-123".to_string(),
            name: "n".to_string(),
            created_by: "u".to_string(),
            created_at: chrono::Utc::now(),
            is_deleted: false,
            target_host: "https://api.example.com".to_string(),
            api_path: "/v1/chat/completions".to_string(),
            method: HttpMethod::Post,
            headers: Map::new(),
            cookies: Map::new(),
            request_payload: Some(serde_json::json!({"model": "gpt-4"})),
            request_body_text: None,
            test_data_path: None,
            test_data_inline: Some("default".to_string()),
            load,
            llm: Some(LlmExtras {
                model: "gpt-4".to_string(),
                api_flavor: ApiFlavor::OpenaiChat,
                stream_mode: true,
                chat_type: ChatType::Text,
                field_mapping: None,
                warmup_enabled: false,
                warmup_duration_secs: 0,
            }),
            cert_file: None,
            key_file: None,
            status: JobStatus::Locked,
            error_message: None,
        }
    }

    #[test]
    fn fixed_load_argv_carries_numeric_flags_no_env() {
        let job = job_with_load(LoadConfig::Fixed { users: 10, spawn_rate: 2.0, duration_seconds: 60 });
        let (argv, env) = build_argv(&job, Path::new("/tmp/r"), false);
        assert!(argv.contains(&"--task-id".to_string()));
        assert!(argv.contains(&"task-123".to_string()));
        assert!(argv.contains(&"fixed".to_string()));
        assert!(env.is_empty());
    }

    #[test]
    fn stepped_load_injects_environment_variables() {
        let job = job_with_load(LoadConfig::Stepped {
            start_users: 1,
            increment: 2,
            step_duration: 5,
            max_users: 20,
            sustain_duration: 30,
        });
        let (argv, env) = build_argv(&job, Path::new("/tmp/r"), false);
        assert!(argv.contains(&"stepped".to_string()));
        assert_eq!(env.get("STEPPED_MAX_USERS"), Some(&"20".to_string()));
        assert_eq!(env.get("STEPPED_START_USERS"), Some(&"1".to_string()));
    }

    #[test]
    fn warmup_mode_adds_flag() {
        let job = job_with_load(LoadConfig::Fixed { users: 1, spawn_rate: 1.0, duration_seconds: 10 });
        let (argv, _) = build_argv(&job, Path::new("/tmp/r"), true);
        assert!(argv.contains(&"--warmup-mode".to_string()));
    }

    #[test]
    fn result_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let result = RunnerResult { result_rows: Vec::new(), token_metrics: None };
        write_result_file(dir.path(), &result).unwrap();
        let read_back = read_result_file(dir.path()).unwrap();
        assert!(read_back.result_rows.is_empty());
    }

    #[test]
    fn missing_result_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_result_file(dir.path()).is_err());
    }
}
