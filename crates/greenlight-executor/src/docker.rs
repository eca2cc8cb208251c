//! Local Docker build executor.

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
use futures::stream::BoxStream;
use greenlight_core::executor::*;
use greenlight_core::{Error, Result, RunId};
use tracing::{debug, info, warn};

/// Runs each build invocation in a container on the local Docker daemon.
pub struct LocalDockerExecutor {
    docker: Docker,
}

impl LocalDockerExecutor {
    /// Connect to the local Docker daemon.
    pub fn new() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().map_err(|e| Error::Internal(e.to_string()))?;
        Ok(Self { docker })
    }

    /// Create with a custom Docker client.
    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    fn container_name(id: &RunId) -> String {
        format!("greenlight-build-{}", id)
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
                    warn!(error = %e, "Pull warning");
                }
            }
        }
    }
}

/// Shell script for an invocation: check out the commit, then run the phases.
fn build_script(invocation: &BuildInvocation) -> String {
    match &invocation.source {
        Some(source) => format!(
            "set -e\ngit clone -- {} {}\ncd {}\ngit checkout {} --\n{}",
            shell_quote(&source.clone_url),
            shell_quote(&source.target_dir),
            shell_quote(&source.target_dir),
            shell_quote(&source.commit),
            invocation.spec.to_script()
        ),
        None => invocation.spec.to_script(),
    }
}

/// Single-quote `value` for `sh`.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

fn parse_time(value: Option<String>) -> Option<chrono::DateTime<Utc>> {
    value
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

#[async_trait]
impl BuildExecutor for LocalDockerExecutor {
    fn name(&self) -> &'static str {
        "docker"
    }

    async fn spawn(&self, invocation: BuildInvocation) -> Result<JobHandle> {
        let container_name = Self::container_name(&invocation.id);
        let build_error = |message: String| Error::BuildExecution {
            job: invocation.job.clone(),
            message,
        };

        self.pull(&invocation.image).await;

        let env: Vec<String> = invocation
            .spec
            .env()
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect();

        let host_config = HostConfig {
            privileged: Some(invocation.privileged),
            ..Default::default()
        };

        let config = Config {
            image: Some(invocation.image.clone()),
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                build_script(&invocation),
            ]),
            env: Some(env),
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

        info!(job = %invocation.job, container = %container_name, "Creating container");
        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .map_err(|e| build_error(format!("failed to create container: {}", e)))?;

        info!(job = %invocation.job, container = %container_name, "Starting container");
        self.docker
            .start_container(&container_name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| build_error(format!("failed to start container: {}", e)))?;

        Ok(JobHandle {
            id: invocation.id,
            executor_id: container.id,
            executor_name: self.name().to_string(),
        })
    }

    async fn logs(&self, handle: &JobHandle) -> Result<BoxStream<'static, LogLine>> {
        let container_name = Self::container_name(&handle.id);

        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            timestamps: true,
            ..Default::default()
        };

        let stream = self.docker.logs(&container_name, Some(options));

        let mapped_stream = stream.filter_map(|result| async move {
            match result {
                Ok(output) => {
                    let (stream, message) = match output {
                        LogOutput::StdErr { message } => (LogStream::Stderr, message),
                        LogOutput::StdOut { message }
                        | LogOutput::Console { message }
                        | LogOutput::StdIn { message } => (LogStream::Stdout, message),
                    };
                    Some(LogLine {
                        timestamp: Utc::now(),
                        stream,
                        content: String::from_utf8_lossy(&message).trim_end().to_string(),
                    })
                }
                Err(e) => {
                    warn!(error = %e, "Log stream error");
                    None
                }
            }
        });

        Ok(Box::pin(mapped_stream))
    }

    async fn status(&self, handle: &JobHandle) -> Result<JobStatus> {
        let container_name = Self::container_name(&handle.id);

        let inspect = self
            .docker
            .inspect_container(&container_name, None)
            .await
            .map_err(|e| Error::NotFound(format!("container not found: {}", e)))?;

        let state = inspect
            .state
            .ok_or_else(|| Error::Internal("container has no state".to_string()))?;

        let status = if state.running.unwrap_or(false) {
            JobStatus::Running {
                started_at: parse_time(state.started_at).unwrap_or_else(Utc::now),
            }
        } else if state.paused.unwrap_or(false) {
            JobStatus::Pending
        } else {
            let exit_code = state.exit_code.map(|c| c as i32);
            let started_at = parse_time(state.started_at);
            let finished_at = parse_time(state.finished_at).unwrap_or_else(Utc::now);

            if exit_code == Some(0) {
                JobStatus::Succeeded {
                    started_at: started_at.unwrap_or(finished_at),
                    finished_at,
                }
            } else {
                JobStatus::Failed {
                    started_at,
                    finished_at,
                    exit_code,
                    message: state
                        .error
                        .filter(|e| !e.is_empty())
                        .unwrap_or_else(|| format!("exited with {:?}", exit_code)),
                }
            }
        };

        Ok(status)
    }

    async fn wait(&self, handle: &JobHandle) -> Result<JobResult> {
        let container_name = Self::container_name(&handle.id);

        let current_status = self.status(handle).await?;
        if current_status.is_terminal() {
            let exit_code = match &current_status {
                JobStatus::Succeeded { .. } => Some(0),
                JobStatus::Failed { exit_code, .. } => *exit_code,
                _ => None,
            };
            return Ok(JobResult {
                status: current_status,
                exit_code,
            });
        }

        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(&container_name, Some(options));

        let exit_code = match stream.next().await {
            Some(Ok(response)) => Some(response.status_code as i32),
            Some(Err(e)) => {
                warn!(error = %e, "Wait error");
                None
            }
            None => None,
        };

        let status = self.status(handle).await?;
        Ok(JobResult { status, exit_code })
    }

    async fn cancel(&self, handle: &JobHandle) -> Result<()> {
        let container_name = Self::container_name(&handle.id);

        if let Err(e) = self.docker.stop_container(&container_name, None).await {
            warn!(container = %container_name, error = %e, "Failed to stop container");
        }
        self.remove_container(&container_name).await
    }

    async fn cleanup(&self, handle: &JobHandle) -> Result<()> {
        let container_name = Self::container_name(&handle.id);
        debug!(container = %container_name, "Removing finished container");
        self.remove_container(&container_name).await
    }
}

impl LocalDockerExecutor {
    async fn remove_container(&self, container_name: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker
            .remove_container(container_name, Some(options))
            .await
            .map_err(|e| Error::Internal(format!("failed to remove container: {}", e)))
    }
}


/// Integration tests that require Docker to be running.
/// Run with: cargo test -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use greenlight_core::buildspec::{BuildPhase, BuildSpec, PhaseName};
    use std::collections::BTreeMap;

    fn invocation(commands: &[&str], env: &[(&str, &str)]) -> BuildInvocation {
        let spec = BuildSpec::new(
            vec![BuildPhase::new(
                PhaseName::Build,
                commands.iter().map(|s| s.to_string()).collect(),
            )],
            env.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        )
        .unwrap();
        BuildInvocation {
            id: RunId::new(),
            job: "integration".to_string(),
            image: "alpine:latest".to_string(),
            privileged: false,
            spec,
            source: None,
        }
    }

    #[tokio::test]
    #[ignore]
    async fn test_build_lifecycle() {
        let executor = LocalDockerExecutor::new().unwrap();
        let handle = executor
            .spawn(invocation(&["echo $MY_VAR"], &[("MY_VAR", "hello_world")]))
            .await
            .expect("Should spawn container");

        let result = executor.wait(&handle).await.expect("Should wait");
        assert_eq!(result.exit_code, Some(0));
        assert!(result.status.is_success());

        let mut logs = executor.logs(&handle).await.expect("Should get logs");
        let mut found = false;
        while let Some(line) = logs.next().await {
            if line.content.contains("hello_world") {
                found = true;
                break;
            }
        }
        assert!(found, "Should find environment variable in output");

        executor.cleanup(&handle).await.expect("Should remove container");
        assert!(executor.status(&handle).await.is_err());
    }

    #[tokio::test]
    #[ignore]
    async fn test_failing_build() {
        let executor = LocalDockerExecutor::new().unwrap();
        let handle = executor
            .spawn(invocation(&["exit 42"], &[]))
            .await
            .expect("Should spawn container");

        let result = executor.wait(&handle).await.expect("Should wait");
        assert_eq!(result.exit_code, Some(42));
        assert!(matches!(result.status, JobStatus::Failed { .. }));

        executor.cleanup(&handle).await.expect("Should remove container");
    }
}
