use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use super::{BatchExecutor, BatchRequest, ExecutorError};
use crate::config::ExecutorConfig;

/// How much of the captured stderr ends up in the error message.
const STDERR_TAIL_BYTES: u64 = 2048;

/// Runs an external program per batch as `<command…> <input> <output>`.
///
/// stderr goes to `<output>.stderr.log` next to the output; its tail is
/// reported when the program fails. The child is killed when it outlives
/// the timeout.
pub struct CommandExecutor {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    poll_interval: Duration,
}

impl CommandExecutor {
    pub fn new(command: &[String], timeout: Duration) -> Result<Self, ExecutorError> {
        let (program, args) = command
            .split_first()
            .filter(|(program, _)| !program.trim().is_empty())
            .ok_or_else(|| ExecutorError::Rejected("executor command is empty".to_string()))?;

        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
            poll_interval: Duration::from_millis(50),
        })
    }

    pub fn from_config(config: &ExecutorConfig) -> Result<Self, ExecutorError> {
        Self::new(&config.command, Duration::from_secs(config.timeout_secs))
    }

    fn stderr_path(output: &Path) -> PathBuf {
        let mut name = output
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".stderr.log");
        output.with_file_name(name)
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> ExecutorError {
    let path = path.to_path_buf();
    move |source| ExecutorError::Io { path, source }
}

fn read_tail(path: &Path, max_bytes: u64) -> String {
    let Ok(mut file) = File::open(path) else {
        return String::new();
    };
    let len = file.metadata().map(|m| m.len()).unwrap_or(0);
    if len > max_bytes && file.seek(SeekFrom::Start(len - max_bytes)).is_err() {
        return String::new();
    }
    let mut buf = Vec::new();
    if file.read_to_end(&mut buf).is_err() {
        return String::new();
    }
    String::from_utf8_lossy(&buf).trim().to_string()
}

impl BatchExecutor for CommandExecutor {
    fn execute(&self, request: &BatchRequest<'_>) -> Result<(), ExecutorError> {
        if let Some(parent) = request.output.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        // A stale output from an earlier attempt must not pass for success.
        if request.output.exists() {
            std::fs::remove_file(request.output).map_err(io_err(request.output))?;
        }

        let stderr_path = Self::stderr_path(request.output);
        let stderr_file = File::create(&stderr_path).map_err(io_err(&stderr_path))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(request.input)
            .arg(request.output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::from(stderr_file))
            .spawn()
            .map_err(|e| ExecutorError::Spawn {
                program: self.program.clone(),
                source: e,
            })?;

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if started.elapsed() >= self.timeout => {
                    if let Err(e) = child.kill() {
                        tracing::warn!(error = %e, "Failed to kill timed out batch process");
                    }
                    let _ = child.wait();
                    return Err(ExecutorError::Timeout {
                        secs: self.timeout.as_secs(),
                    });
                }
                Ok(None) => thread::sleep(self.poll_interval),
                Err(e) => {
                    let _ = child.kill();
                    return Err(ExecutorError::Io {
                        path: PathBuf::from(&self.program),
                        source: e,
                    });
                }
            }
        };

        if !status.success() {
            return Err(ExecutorError::Failed {
                status: status.to_string(),
                stderr: read_tail(&stderr_path, STDERR_TAIL_BYTES),
            });
        }

        if !request.output.exists() {
            return Err(ExecutorError::MissingOutput(request.output.to_path_buf()));
        }

        tracing::debug!(
            job_id = request.job_id,
            batch_index = request.batch_index,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Batch process finished"
        );
        Ok(())
    }
}
