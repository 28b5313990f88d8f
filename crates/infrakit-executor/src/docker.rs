//! Local Docker executor implementation.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use chrono::Utc;
use futures::StreamExt;
use infrakit_core::executor::*;
use infrakit_core::{Error, ResourceId, Result};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Runs jobs in containers on the local Docker daemon.
pub struct LocalDockerExecutor {
    docker: Docker,
}

impl LocalDockerExecutor {
    /// Create a new LocalDockerExecutor connecting to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Check that the daemon answers.
    pub async fn ping(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    fn container_name(job_id: &ResourceId) -> String {
        format!("infrakit-job-{}", job_id)
    }

    async fn pull(&self, image: &str) {
        info!(image = %image, "Pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };

        let mut pull_stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull_stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    // A locally built image cannot be pulled; creation reports
                    // the real error if it is missing.
                    warn!(error = %e, "Pull warning");
                }
            }
        }
    }

    /// Follow the container's output until it exits, then wait for its exit code.
    async fn follow(&self, container_name: &str, logs: &mpsc::Sender<LogLine>) -> Option<i32> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };

        let mut stream = self.docker.logs(container_name, Some(options));
        while let Some(result) = stream.next().await {
            match result {
                Ok(output) => {
                    let (stream, message) = match output {
                        LogOutput::StdErr { message } => (LogStream::Stderr, message),
                        LogOutput::StdOut { message }
                        | LogOutput::Console { message }
                        | LogOutput::StdIn { message } => (LogStream::Stdout, message),
                    };
                    for content in String::from_utf8_lossy(&message).lines() {
                        let _ = logs
                            .send(LogLine {
                                timestamp: Utc::now(),
                                stream,
                                content: content.to_string(),
                            })
                            .await;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Log stream error");
                    break;
                }
            }
        }

        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait = self.docker.wait_container(container_name, Some(options));
        match wait.next().await {
            Some(Ok(response)) => Some(response.status_code as i32),
            // bollard reports non-zero exits as an error carrying the code.
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                Some(code as i32)
            }
            Some(Err(e)) => {
                warn!(error = %e, "Wait error");
                None
            }
            None => None,
        }
    }

    async fn remove(&self, container_name: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        if let Err(e) = self
            .docker
            .remove_container(container_name, Some(options))
            .await
        {
            warn!(container = %container_name, error = %e, "Failed to remove container");
        }
    }
}

/// `host:container:mode` bind strings.
fn binds(volumes: &[VolumeMount]) -> Option<Vec<String>> {
    if volumes.is_empty() {
        return None;
    }
    Some(
        volumes
            .iter()
            .map(|v| {
                let mode = if v.read_only { "ro" } else { "rw" };
                format!("{}:{}:{}", v.host_path.display(), v.mount_path, mode)
            })
            .collect(),
    )
}

fn env_list(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}

#[async_trait]
impl Executor for LocalDockerExecutor {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn run(&self, spec: JobSpec, logs: mpsc::Sender<LogLine>) -> Result<JobResult> {
        let image = spec.image.clone().ok_or_else(|| {
            Error::InvalidInput("the docker executor requires an image".to_string())
        })?;
        let container_name = Self::container_name(&spec.id);

        self.pull(&image).await;

        let host_config = HostConfig {
            binds: binds(&spec.volumes),
            privileged: Some(spec.privileged),
            ..Default::default()
        };

        let config = Config {
            image: Some(image.clone()),
            cmd: if spec.command.is_empty() {
                None
            } else {
                Some(spec.command.clone())
            },
            env: Some(env_list(&spec.env)),
            working_dir: spec.working_dir.as_ref().map(|d| d.display().to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            host_config: Some(host_config),
            ..Default::default()
        };

        let create_options = CreateContainerOptions {
            name: container_name.clone(),
            platform: None,
        };

        info!(container = %container_name, image = %image, "Creating container");
        self.docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to create container: {}", e)))?;

        let started_at = Utc::now();
        info!(container = %container_name, "Starting container");
        if let Err(e) = self
            .docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
        {
            self.remove(&container_name).await;
            return Err(Error::ExecutionFailed(format!(
                "Failed to start container: {}",
                e
            )));
        }

        let outcome = match spec.timeout {
            Some(limit) => tokio::time::timeout(limit, self.follow(&container_name, &logs))
                .await
                .ok(),
            None => Some(self.follow(&container_name, &logs).await),
        };

        self.remove(&container_name).await;
        let finished_at = Utc::now();

        let result = match outcome {
            None => {
                let _ = logs
                    .send(LogLine::system(format!(
                        "Job timed out after {:?}",
                        spec.timeout.unwrap_or_default()
                    )))
                    .await;
                JobResult {
                    status: JobStatus::Cancelled {
                        started_at,
                        cancelled_at: finished_at,
                    },
                    exit_code: None,
                }
            }
            Some(Some(0)) => JobResult {
                status: JobStatus::Succeeded {
                    started_at,
                    finished_at,
                },
                exit_code: Some(0),
            },
            Some(exit_code) => JobResult {
                status: JobStatus::Failed {
                    started_at,
                    finished_at,
                    exit_code,
                    message: match exit_code {
                        Some(code) => format!("container exited with code {}", code),
                        None => "container exit code unknown".to_string(),
                    },
                },
                exit_code,
            },
        };

        debug!(container = %container_name, success = result.status.is_success(), "Container finished");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_container_name_generation() {
        let id = ResourceId::new();
        let name = LocalDockerExecutor::container_name(&id);

        assert!(name.starts_with("infrakit-job-"));
        assert_eq!(name, LocalDockerExecutor::container_name(&id));
        assert_ne!(name, LocalDockerExecutor::container_name(&ResourceId::new()));
    }

    #[test]
    fn test_binds() {
        assert!(binds(&[]).is_none());

        let volumes = vec![
            VolumeMount {
                host_path: PathBuf::from("/src/code"),
                mount_path: "/asset-input".to_string(),
                read_only: true,
            },
            VolumeMount {
                host_path: PathBuf::from("/out/asset.abc"),
                mount_path: "/asset-output".to_string(),
                read_only: false,
            },
        ];
        assert_eq!(
            binds(&volumes).unwrap(),
            vec![
                "/src/code:/asset-input:ro".to_string(),
                "/out/asset.abc:/asset-output:rw".to_string(),
            ]
        );
    }

    #[test]
    fn test_env_list() {
        let mut env = BTreeMap::new();
        env.insert("B".to_string(), "2".to_string());
        env.insert("A".to_string(), "1".to_string());
        assert_eq!(env_list(&env), vec!["A=1", "B=2"]);
    }
}
