use std::time::Duration;

use model_proxy_task::ChildTask;
use tokio::io::{AsyncBufReadExt as _, AsyncRead, BufReader};
use tokio::process::Child;
use tracing::Level;

/// Runtime output lines above this size are dropped and replaced by a
/// synthetic warning.
const MAX_LINE_BYTES: usize = 250 * 1024;
const SYNTHETIC_PREFIX_CHARS: usize = 64;

/// The two line tails attached to the runtime's stdout and stderr.
pub struct RuntimeLogs {
    stdout: Option<ChildTask<()>>,
    stderr: Option<ChildTask<()>>,
}

impl RuntimeLogs {
    /// Takes the stdio pipes off the child and starts one tail task per
    /// stream. stdout lines default to INFO, stderr lines to WARN.
    pub(crate) fn start(child: &mut Child) -> Self {
        let stdout = match child.stdout.take() {
            Some(pipe) => Some(ChildTask::spawn(tail(pipe, Level::INFO))),
            None => {
                warn!("failed to capture stdout of runtime");
                None
            }
        };
        let stderr = match child.stderr.take() {
            Some(pipe) => Some(ChildTask::spawn(tail(pipe, Level::WARN))),
            None => {
                warn!("failed to capture stderr of runtime");
                None
            }
        };
        RuntimeLogs { stdout, stderr }
    }

    /// Joins both tails with a wall-clock cap. The tails end on their own
    /// once the child closes its side of the pipes.
    pub async fn flush(self, timeout: Duration) {
        let join = async {
            if let Some(task) = self.stdout {
                let _ = task.join().await;
            }
            if let Some(task) = self.stderr {
                let _ = task.join().await;
            }
        };
        if tokio::time::timeout(timeout, join).await.is_err() {
            warn!("timed out waiting for log flushing; some runtime output may be lost");
        }
    }
}

async fn tail<R>(pipe: R, default_level: Level)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => emit_line(&line, default_level),
            Ok(None) => break,
            Err(error) => {
                warn!(%error, "failed to read runtime output");
                break;
            }
        }
    }
}

fn emit_line(line: &str, default_level: Level) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    if line.len() > MAX_LINE_BYTES {
        let prefix: String = line.chars().take(SYNTHETIC_PREFIX_CHARS).collect();
        warn!("runtime output is too long. Maximum of 250kB per line. [{prefix}...]");
        return;
    }
    emit(sniff_level(line).unwrap_or(default_level), line);
}

/// Structured runtime output carries its own level: a JSON object with a
/// `log_level` field is re-emitted at that level, raw JSON preserved.
fn sniff_level(line: &str) -> Option<Level> {
    let value: serde_json::Value = serde_json::from_str(line).ok()?;
    let level = value.as_object()?.get("log_level")?.as_str()?;
    parse_level(level)
}

fn parse_level(level: &str) -> Option<Level> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" | "warning" => Some(Level::WARN),
        "error" | "fatal" | "panic" => Some(Level::ERROR),
        _ => None,
    }
}

fn emit(level: Level, line: &str) {
    match level {
        Level::TRACE => trace!(target: "runtime", "{line}"),
        Level::DEBUG => debug!(target: "runtime", "{line}"),
        Level::INFO => info!(target: "runtime", "{line}"),
        Level::WARN => warn!(target: "runtime", "{line}"),
        Level::ERROR => error!(target: "runtime", "{line}"),
    }
}
