//! Host process executor.
//!
//! Runs jobs directly on the host. The image is ignored; volume mounts are
//! emulated by rewriting mount paths in the command and working directory to
//! the host directories they stand for.

use async_trait::async_trait;
use chrono::Utc;
use infrakit_core::executor::*;
use infrakit_core::{Error, Result};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Runs jobs as host processes.
#[derive(Debug, Default, Clone)]
pub struct LocalProcessExecutor;

impl LocalProcessExecutor {
    pub fn new() -> Self {
        Self
    }
}

/// Replace container mount paths with their host directories, longest
/// mount path first.
fn rewrite_mounts(value: &str, volumes: &[VolumeMount]) -> String {
    let mut mounts: Vec<&VolumeMount> = volumes.iter().collect();
    mounts.sort_by_key(|v| std::cmp::Reverse(v.mount_path.len()));

    let mut rewritten = value.to_string();
    for mount in mounts {
        rewritten = rewritten.replace(&mount.mount_path, &mount.host_path.display().to_string());
    }
    rewritten
}

#[async_trait]
impl Executor for LocalProcessExecutor {
    fn name(&self) -> &'static str {
        "process"
    }

    async fn run(&self, spec: JobSpec, logs: mpsc::Sender<LogLine>) -> Result<JobResult> {
        let (program, args) = spec
            .command
            .split_first()
            .ok_or_else(|| Error::InvalidInput("empty command".to_string()))?;

        if let Some(image) = &spec.image {
            debug!(image = %image, "Ignoring image for host process");
        }

        let program = rewrite_mounts(program, &spec.volumes);
        let args: Vec<String> = args
            .iter()
            .map(|a| rewrite_mounts(a, &spec.volumes))
            .collect();

        let mut command = Command::new(&program);
        command
            .args(&args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            let dir = PathBuf::from(rewrite_mounts(&dir.display().to_string(), &spec.volumes));
            command.current_dir(dir);
        }

        info!(job = %spec.id, program = %program, "Starting process");
        let started_at = Utc::now();
        let mut child = command
            .spawn()
            .map_err(|e| Error::ExecutionFailed(format!("Failed to start '{}': {}", program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Internal("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::Internal("stderr not captured".to_string()))?;

        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();

        let stream_output = async {
            let mut stdout_done = false;
            let mut stderr_done = false;

            while !(stdout_done && stderr_done) {
                let (stream, line) = tokio::select! {
                    line = stdout_reader.next_line(), if !stdout_done => (LogStream::Stdout, line),
                    line = stderr_reader.next_line(), if !stderr_done => (LogStream::Stderr, line),
                };

                match line {
                    Ok(Some(content)) => {
                        let _ = logs
                            .send(LogLine {
                                timestamp: Utc::now(),
                                stream,
                                content,
                            })
                            .await;
                    }
                    Ok(None) => match stream {
                        LogStream::Stderr => stderr_done = true,
                        _ => stdout_done = true,
                    },
                    Err(e) => {
                        warn!(error = %e, "Error reading process output");
                        match stream {
                            LogStream::Stderr => stderr_done = true,
                            _ => stdout_done = true,
                        }
                    }
                }
            }

            child.wait().await
        };

        let outcome = match spec.timeout {
            Some(limit) => tokio::time::timeout(limit, stream_output).await.ok(),
            None => Some(stream_output.await),
        };
        let finished_at = Utc::now();

        let status = match outcome {
            // Timed out: dropping the future drops the child, which kills it.
            None => {
                let _ = logs
                    .send(LogLine::system(format!(
                        "Job timed out after {:?}",
                        spec.timeout.unwrap_or_default()
                    )))
                    .await;
                return Ok(JobResult {
                    status: JobStatus::Cancelled {
                        started_at,
                        cancelled_at: finished_at,
                    },
                    exit_code: None,
                });
            }
            Some(status) => status?,
        };

        let exit_code = status.code();
        debug!(job = %spec.id, exit_code = ?exit_code, "Process finished");

        let status = if status.success() {
            JobStatus::Succeeded {
                started_at,
                finished_at,
            }
        } else {
            JobStatus::Failed {
                started_at,
                finished_at,
                exit_code,
                message: match exit_code {
                    Some(code) => format!("'{}' exited with code {}", program, code),
                    None => format!("'{}' was terminated by a signal", program),
                },
            }
        };

        Ok(JobResult { status, exit_code })
    }
}
