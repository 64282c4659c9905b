//! Docker engine implementation.
//!
//! Talks to the Docker daemon through `bollard`. The session container runs
//! the image's default command (the supervisor) with stdin held open, and is
//! removed by the daemon as soon as the supervisor exits.

use std::collections::HashMap;
use std::time::Instant;

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config as ContainerConfig,
    CreateContainerOptions, DownloadFromContainerOptions, KillContainerOptions, LogOutput,
    StartContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use futures::StreamExt;
use tokio_util::io::StreamReader;
use tracing::{debug, trace};

use super::{AttachedIo, ContainerEngine, ContainerSpec, EngineError, EngineResult, ExecOutput};

/// Label placed on every container created by testjail.
const SESSION_LABEL: &str = "testjail.session";

/// Docker daemon client.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connects to the daemon at `host`, or to the local default socket.
    ///
    /// No request is made here; use [`ping`](ContainerEngine::ping) to check
    /// reachability.
    pub fn new(host: Option<&str>) -> EngineResult<Self> {
        let docker = match host {
            Some(host) if host.starts_with("unix://") => {
                Docker::connect_with_socket(host, 120, bollard::API_DEFAULT_VERSION)
            }
            Some(host) => Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION),
            None => Docker::connect_with_local_defaults(),
        }
        .map_err(|e| EngineError::Connection(e.to_string()))?;

        Ok(Self { docker })
    }

    /// Connects to the local Docker daemon.
    pub fn local() -> EngineResult<Self> {
        Self::new(None)
    }
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn ping(&self) -> EngineResult<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| EngineError::Connection(e.to_string()))?;
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> EngineResult<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(EngineError::Image(e.to_string())),
        }
    }

    async fn pull_image(&self, image: &str) -> EngineResult<()> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };

        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(info) = progress.next().await {
            let info = info.map_err(|e| EngineError::Image(e.to_string()))?;
            if let Some(status) = info.status {
                trace!("pull {}: {}", image, status);
            }
        }

        Ok(())
    }

    async fn remove_image(&self, image: &str) -> EngineResult<()> {
        self.docker
            .remove_image(image, None, None)
            .await
            .map_err(|e| EngineError::Image(e.to_string()))?;
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String> {
        let host_config = bollard::models::HostConfig {
            auto_remove: Some(true),
            ..Default::default()
        };

        let mut labels = HashMap::new();
        labels.insert(SESSION_LABEL.to_string(), spec.name.clone());

        let container_config = ContainerConfig {
            image: Some(spec.image.clone()),
            host_config: Some(host_config),
            labels: Some(labels),
            // The supervisor reads requests from stdin until EOF.
            open_stdin: Some(true),
            stdin_once: Some(true),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| EngineError::CreateFailed(e.to_string()))?;

        debug!("Created container {} ({})", spec.name, response.id);
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| EngineError::CreateFailed(e.to_string()))?;
        Ok(())
    }

    async fn attach(&self, id: &str) -> EngineResult<AttachedIo> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(false),
            detach_keys: None,
        };

        let AttachContainerResults { output, input } = self
            .docker
            .attach_container(id, Some(options))
            .await
            .map_err(|e| EngineError::AttachFailed(e.to_string()))?;

        // Only stdout carries protocol lines; stderr is surfaced in the log.
        let stdout = output.filter_map(|msg| async move {
            match msg {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    Some(Ok(message))
                }
                Ok(LogOutput::StdErr { message }) => {
                    debug!(
                        "supervisor stderr: {}",
                        String::from_utf8_lossy(&message).trim_end()
                    );
                    None
                }
                Ok(LogOutput::StdIn { .. }) => None,
                Err(e) => Some(Err(std::io::Error::other(e))),
            }
        });

        Ok(AttachedIo {
            output: Box::pin(StreamReader::new(Box::pin(stdout))),
            input,
        })
    }

    async fn exec(&self, id: &str, argv: &[String]) -> EngineResult<ExecOutput> {
        let start = Instant::now();

        let exec_options = CreateExecOptions {
            cmd: Some(argv.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(id, exec_options)
            .await
            .map_err(|e| EngineError::ExecFailed(e.to_string()))?;

        let output = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| EngineError::ExecFailed(e.to_string()))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } = output {
            while let Some(msg) = output.next().await {
                match msg {
                    Ok(LogOutput::StdOut { message }) => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(LogOutput::StdErr { message }) => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    Ok(_) => {}
                    Err(e) => return Err(EngineError::ExecFailed(e.to_string())),
                }
            }
        }

        // The attached stream ends when the process exits.
        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| EngineError::ExecFailed(e.to_string()))?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout,
            stderr,
            duration: start.elapsed(),
        })
    }

    async fn upload(&self, id: &str, dir: &str, archive: Vec<u8>) -> EngineResult<()> {
        self.docker
            .upload_to_container(
                id,
                Some(UploadToContainerOptions {
                    path: dir.to_string(),
                    ..Default::default()
                }),
                archive.into(),
            )
            .await
            .map_err(|e| EngineError::UploadFailed(e.to_string()))?;

        Ok(())
    }

    async fn download(&self, id: &str, path: &str) -> EngineResult<Vec<u8>> {
        let mut stream = self.docker.download_from_container(
            id,
            Some(DownloadFromContainerOptions {
                path: path.to_string(),
            }),
        );

        let mut tar_data = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| EngineError::DownloadFailed(e.to_string()))?;
            tar_data.extend_from_slice(&chunk);
        }

        Ok(tar_data)
    }

    async fn kill(&self, id: &str) -> EngineResult<()> {
        self.docker
            .kill_container(id, None::<KillContainerOptions<String>>)
            .await
            .map_err(|e| EngineError::Other(e.into()))?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "docker"
    }
}
