//! Executor trait and job types.
//!
//! Executors run commands for pipeline actions and asset bundling, either
//! as host processes or inside containers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::{ResourceId, Result};

/// Specification for a job to execute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Unique identifier for this job.
    pub id: ResourceId,
    /// Container image to run in. Host executors ignore it.
    pub image: Option<String>,
    /// Command to execute (program followed by arguments).
    pub command: Vec<String>,
    /// Working directory (host path, or container path when an image is set).
    pub working_dir: Option<PathBuf>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Host directories to mount into the container.
    pub volumes: Vec<VolumeMount>,
    /// Run the container privileged.
    pub privileged: bool,
    /// Maximum execution time.
    pub timeout: Option<Duration>,
}

impl JobSpec {
    /// A job running `script` through `sh -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self {
            id: ResourceId::new(),
            image: None,
            command: vec!["sh".to_string(), "-c".to_string(), script.into()],
            working_dir: None,
            env: BTreeMap::new(),
            volumes: Vec::new(),
            privileged: false,
            timeout: None,
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env.extend(env);
        self
    }

    pub fn with_volume(mut self, host_path: impl Into<PathBuf>, mount_path: impl Into<String>) -> Self {
        self.volumes.push(VolumeMount {
            host_path: host_path.into(),
            mount_path: mount_path.into(),
            read_only: false,
        });
        self
    }
}

/// A volume mount specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Directory on the host.
    pub host_path: PathBuf,
    /// Path to mount in the container.
    pub mount_path: String,
    /// Whether the mount is read-only.
    pub read_only: bool,
}

/// Status of a finished job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum JobStatus {
    /// Job completed successfully.
    Succeeded {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    },
    /// Job failed.
    Failed {
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        exit_code: Option<i32>,
        message: String,
    },
    /// Job was stopped before completion (timeout).
    Cancelled {
        started_at: DateTime<Utc>,
        cancelled_at: DateTime<Utc>,
    },
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded { .. } | JobStatus::Failed { .. } | JobStatus::Cancelled { .. }
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Succeeded { .. })
    }
}

/// Result of a completed job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub status: JobStatus,
    pub exit_code: Option<i32>,
}

/// A line of log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

impl LogLine {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream: LogStream::System,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

/// Trait for job executors.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Run a job to completion, forwarding its output to `logs`.
    ///
    /// A job that runs but exits non-zero is reported through
    /// [`JobStatus::Failed`], not as an error; errors mean the job could not
    /// be run at all.
    async fn run(&self, spec: JobSpec, logs: mpsc::Sender<LogLine>) -> Result<JobResult>;
}
