//! One append-only log file per task (§4.9 step 2, §5 "Log sinks").
//!
//! A sink is registered when the Task Pipeline claims a job and closed when
//! the pipeline reaches a terminal state, correlated purely by `task-id`
//! path rather than by a `tracing` span, since the supervisor's subprocess
//! reader threads write raw lines that did not originate from `tracing`.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Append-only sink for one task's runner stdout/stderr.
pub struct TaskLogSink {
    path: PathBuf,
    file: Mutex<std::fs::File>,
}

impl TaskLogSink {
    /// Opens (creating if necessary) `<log_dir>/<task_id>.log`.
    pub fn open(log_dir: &Path, task_id: &str) -> std::io::Result<Self> {
        std::fs::create_dir_all(log_dir)?;
        let path = log_dir.join(format!("{task_id}.log"));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Appends one line (a newline is added if missing).
    pub fn write_line(&self, line: &str) {
        let mut file = match self.file.lock() {
            Ok(f) => f,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = writeln!(file, "{line}");
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_lines_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TaskLogSink::open(dir.path(), "task-1").unwrap();
        sink.write_line("hello");
        sink.write_line("world");
        let contents = std::fs::read_to_string(sink.path()).unwrap();
        assert_eq!(contents, "hello\nworld\n");
    }
}
