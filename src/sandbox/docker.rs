//! Docker-backed provisioner using bollard.

use std::collections::HashMap;
use std::io::{self, Write};
use std::path::Path;

use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, LogOutput, LogsOptions, RemoveContainerOptions,
    StopContainerOptions, UploadToContainerOptions, WaitContainerOptions,
};
use bollard::image::{CommitContainerOptions, CreateImageOptions};
use bollard::models::{HostConfig, PortBinding};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SandboxConfig;
use crate::error::ProvisionError;
use crate::sandbox::{
    Environment, EnvironmentTemplate, InstanceSpec, Payload, Provisioner, Template, dispatch_args,
};

/// Label set on every container hookrelay creates.
const MANAGED_LABEL: &str = "hookrelay.managed";

/// Payload archives are uploaded in chunks of this size.
const ARCHIVE_CHUNK_BYTES: usize = 64 * 1024;

/// Chunks buffered between the archive writer and the upload.
const ARCHIVE_CHANNEL_CAPACITY: usize = 4;

/// Connect to the local Docker daemon and verify it answers.
pub async fn connect_docker() -> Result<Docker, ProvisionError> {
    let docker =
        Docker::connect_with_local_defaults().map_err(|e| ProvisionError::DockerNotAvailable {
            reason: e.to_string(),
        })?;

    docker
        .ping()
        .await
        .map_err(|e| ProvisionError::DockerNotAvailable {
            reason: format!("ping failed: {e}"),
        })?;

    Ok(docker)
}

/// Provisions webhook environments as Docker containers.
#[derive(Clone)]
pub struct DockerProvisioner {
    docker: Docker,
    config: SandboxConfig,
}

impl std::fmt::Debug for DockerProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerProvisioner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl DockerProvisioner {
    pub fn new(docker: Docker, config: SandboxConfig) -> Self {
        Self { docker, config }
    }

    async fn pull_image(&self, image: &str) -> Result<(), ProvisionError> {
        if self.docker.inspect_image(image).await.is_ok() {
            tracing::debug!(image = %image, "base image already present, skipping pull");
            return Ok(());
        }

        let (name, tag) = image.rsplit_once(':').unwrap_or((image, "latest"));
        tracing::info!(image = %image, "pulling base image");

        let options = CreateImageOptions {
            from_image: name,
            tag,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        tracing::debug!(status = %status, "pull progress");
                    }
                }
                Err(e) => {
                    return Err(ProvisionError::PullFailed {
                        image: image.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// Run the setup script in the builder container and commit the result.
    async fn run_builder(
        &self,
        container_id: &str,
        recipe: &EnvironmentTemplate,
        image: &str,
    ) -> Result<(), ProvisionError> {
        self.docker
            .start_container::<String>(container_id, None)
            .await
            .map_err(|e| ProvisionError::TemplateBuild {
                reason: format!("failed to start builder: {e}"),
            })?;

        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let exit = self
            .docker
            .wait_container(container_id, Some(options))
            .next()
            .await;

        let failure = match exit {
            Some(Ok(response)) if response.status_code == 0 => None,
            Some(Ok(response)) => Some(format!("setup exited with {}", response.status_code)),
            Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => {
                Some(format!("setup exited with {code}"))
            }
            Some(Err(e)) => Some(format!("failed to wait for builder: {e}")),
            None => Some("builder wait stream closed unexpectedly".to_string()),
        };
        if let Some(reason) = failure {
            let logs = self.tail_logs(container_id).await;
            return Err(ProvisionError::TemplateBuild {
                reason: if logs.is_empty() {
                    reason
                } else {
                    format!("{reason}: {logs}")
                },
            });
        }

        let (repo, tag) = image.split_once(':').unwrap_or((image, "latest"));
        let options = CommitContainerOptions {
            container: container_id.to_string(),
            repo: repo.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };
        let config = Config {
            entrypoint: Some(recipe.entrypoint.clone()),
            cmd: Some(dispatch_args(recipe.exposed_port)),
            working_dir: recipe.final_workdir().map(String::from),
            exposed_ports: Some(exposed_ports(recipe.exposed_port)),
            ..Default::default()
        };
        self.docker
            .commit_container(options, config)
            .await
            .map_err(|e| ProvisionError::TemplateBuild {
                reason: format!("failed to commit template image: {e}"),
            })?;

        Ok(())
    }

    /// Last few lines of a container's output, for error messages.
    async fn tail_logs(&self, container_id: &str) -> String {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: "10".to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.logs(container_id, Some(options));
        let mut lines = Vec::new();
        while let Some(Ok(output)) = stream.next().await {
            match output {
                LogOutput::StdOut { message } | LogOutput::StdErr { message } => {
                    lines.push(String::from_utf8_lossy(&message).trim_end().to_string());
                }
                _ => {}
            }
        }
        lines.join(" | ")
    }

    /// Upload the payload (if any) and start the container.
    async fn prepare_and_start(
        &self,
        container_id: &str,
        payload: Option<Payload>,
    ) -> Result<(), ProvisionError> {
        if let Some(payload) = payload {
            let target = payload.target().to_string();
            let (archive, writer) = stream_archive(payload);

            let options = UploadToContainerOptions {
                path: "/",
                ..Default::default()
            };
            let uploaded = self
                .docker
                .upload_to_container_streaming(container_id, Some(options), archive)
                .await;
            let written = writer.await.map_err(|e| ProvisionError::PayloadUpload {
                reason: format!("archive task failed: {e}"),
            })?;

            // A failed upload stops the writer with a broken pipe, so report
            // the upload error first.
            uploaded.map_err(|e| ProvisionError::PayloadUpload {
                reason: format!("{target}: {e}"),
            })?;
            written?;
        }

        self.docker
            .start_container::<String>(container_id, None)
            .await
            .map_err(|e| ProvisionError::ContainerStartFailed {
                reason: e.to_string(),
            })
    }

    async fn remove_quietly(&self, container_id: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self
            .docker
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(()) => {}
            Err(e) if is_already_gone(&e) => {
                tracing::debug!(container = %container_id, "container already removed");
            }
            Err(e) => {
                tracing::warn!(container = %container_id, error = %e, "Failed to remove container (may require manual cleanup)");
            }
        }
    }
}

#[async_trait::async_trait]
impl Provisioner for DockerProvisioner {
    async fn build_template(
        &self,
        recipe: &EnvironmentTemplate,
    ) -> Result<Template, ProvisionError> {
        let image = recipe.image_tag();

        if self.docker.inspect_image(&image).await.is_ok() {
            tracing::info!(image = %image, "Reusing cached webhook template");
            return Ok(Template::new(recipe.clone(), image));
        }

        self.pull_image(&recipe.base_image).await?;

        tracing::info!(image = %image, base = %recipe.base_image, "Building webhook template");

        let config = Config {
            image: Some(recipe.base_image.clone()),
            entrypoint: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
            cmd: Some(vec![recipe.setup_script()]),
            labels: Some(managed_labels()),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: format!("hookrelay-build-{}", short_id()),
            ..Default::default()
        };
        let builder = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| ProvisionError::TemplateBuild {
                reason: format!("failed to create builder: {e}"),
            })?;

        let result = self.run_builder(&builder.id, recipe, &image).await;
        self.remove_quietly(&builder.id).await;
        result?;

        tracing::info!(image = %image, "Webhook template built");
        Ok(Template::new(recipe.clone(), image))
    }

    async fn instantiate(
        &self,
        template: &Template,
        spec: InstanceSpec,
    ) -> Result<Environment, ProvisionError> {
        let name = format!("hookrelay-{}", short_id());

        let host_config = HostConfig {
            port_bindings: Some(port_bindings(
                spec.port,
                &self.config.publish_host.to_string(),
            )),
            ..Default::default()
        };
        let config = Config {
            image: Some(template.image().to_string()),
            cmd: Some(dispatch_args(spec.port)),
            working_dir: spec.workdir.clone(),
            exposed_ports: Some(exposed_ports(spec.port)),
            host_config: Some(host_config),
            labels: Some(managed_labels()),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| ProvisionError::ContainerCreationFailed {
                reason: e.to_string(),
            })?;

        if let Err(e) = self.prepare_and_start(&response.id, spec.payload).await {
            self.remove_quietly(&response.id).await;
            return Err(e);
        }

        tracing::info!(
            container = %name,
            workdir = spec.workdir.as_deref().unwrap_or("/"),
            "Started webhook environment"
        );

        Ok(Environment {
            id: response.id,
            name,
            port: spec.port,
            created_at: Utc::now(),
        })
    }

    async fn stop(&self, env: &Environment) {
        let options = StopContainerOptions {
            t: self.config.stop_timeout.as_secs() as i64,
        };
        match self.docker.stop_container(&env.id, Some(options)).await {
            Ok(()) => {}
            Err(e) if is_already_gone(&e) => {
                tracing::debug!(container = %env.name, "container already stopped");
            }
            Err(e) => {
                tracing::warn!(container = %env.name, error = %e, "Failed to stop container (may already be stopped)");
            }
        }

        self.remove_quietly(&env.id).await;
        tracing::info!(container = %env.name, "Stopped webhook environment");
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

fn managed_labels() -> HashMap<String, String> {
    HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())])
}

/// Docker port key for a TCP port.
pub(crate) fn port_key(port: u16) -> String {
    format!("{port}/tcp")
}

fn exposed_ports(port: u16) -> HashMap<String, HashMap<(), ()>> {
    HashMap::from([(port_key(port), HashMap::new())])
}

/// Publish `port` on an engine-chosen host port bound to `host_ip`.
fn port_bindings(port: u16, host_ip: &str) -> HashMap<String, Option<Vec<PortBinding>>> {
    let binding = PortBinding {
        host_ip: Some(host_ip.to_string()),
        host_port: Some(String::new()),
    };
    HashMap::from([(port_key(port), Some(vec![binding]))])
}

/// 304 (not modified), 404 (no such container) and 409 (removal already in
/// progress) all mean there is nothing left to stop.
fn is_already_gone(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 304 | 404 | 409,
            ..
        }
    )
}

/// Pack a payload into a tar archive rooted at `/`.
fn write_archive<W: Write>(payload: &Payload, writer: W) -> Result<W, ProvisionError> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);

    let relative = payload.target().trim_start_matches('/');
    let relative = Path::new(relative);

    if let Some(parent) = relative.parent() {
        append_parent_dirs(&mut builder, parent)?;
    }
    match payload {
        Payload::File { contents, .. } => {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_mtime(Utc::now().timestamp().max(0) as u64);
            header.set_entry_type(tar::EntryType::Regular);
            builder.append_data(&mut header, relative, contents.as_slice())?;
        }
        Payload::Directory { source, .. } => {
            builder.append_dir_all(relative, source)?;
        }
    }

    Ok(builder.into_inner()?)
}

fn append_parent_dirs<W: Write>(
    builder: &mut tar::Builder<W>,
    dir: &Path,
) -> Result<(), ProvisionError> {
    let mut current = std::path::PathBuf::new();
    for component in dir.components() {
        current.push(component);
        let mut header = tar::Header::new_gnu();
        header.set_size(0);
        header.set_mode(0o755);
        header.set_mtime(Utc::now().timestamp().max(0) as u64);
        header.set_entry_type(tar::EntryType::Directory);
        builder.append_data(&mut header, &current, std::io::empty())?;
    }
    Ok(())
}

/// Archive `payload` on a blocking thread, yielding it as a chunk stream.
///
/// At most [`ARCHIVE_CHANNEL_CAPACITY`] chunks are held in memory. The
/// returned handle reports archive errors once the stream has ended.
fn stream_archive(
    payload: Payload,
) -> (
    impl Stream<Item = Bytes> + Send + 'static,
    JoinHandle<Result<(), ProvisionError>>,
) {
    let (tx, rx) = mpsc::channel(ARCHIVE_CHANNEL_CAPACITY);
    let writer = tokio::task::spawn_blocking(move || -> Result<(), ProvisionError> {
        write_archive(&payload, ChunkWriter::new(tx))?.finish()?;
        Ok(())
    });
    let chunks = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (chunk, rx))
    });
    (chunks, writer)
}

/// `Write` sink that hands fixed-size chunks to an async receiver.
struct ChunkWriter {
    tx: mpsc::Sender<Bytes>,
    buf: Vec<u8>,
}

impl ChunkWriter {
    fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            tx,
            buf: Vec::with_capacity(ARCHIVE_CHUNK_BYTES),
        }
    }

    fn send(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(ARCHIVE_CHUNK_BYTES));
        self.tx
            .blocking_send(Bytes::from(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "archive upload stopped"))
    }

    fn finish(mut self) -> io::Result<()> {
        self.send()
    }
}

impl Write for ChunkWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= ARCHIVE_CHUNK_BYTES {
            self.send()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;
    use std::path::PathBuf;

    use super::*;

    fn entries(archive: &[u8]) -> Vec<(PathBuf, Vec<u8>)> {
        let mut archive = tar::Archive::new(archive);
        archive
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let path = entry.path().unwrap().into_owned();
                let mut data = Vec::new();
                entry.read_to_end(&mut data).unwrap();
                (path, data)
            })
            .collect()
    }

    #[test]
    fn test_file_archive_places_hooks_file() {
        let payload = Payload::File {
            path: "/hooks/hooks.json".to_string(),
            contents: br#"[{"id":"deploy"}]"#.to_vec(),
        };
        let archive = write_archive(&payload, Vec::new()).unwrap();
        let entries = entries(&archive);

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, PathBuf::from("hooks"));
        assert_eq!(entries[1].0, PathBuf::from("hooks/hooks.json"));
        assert_eq!(entries[1].1, br#"[{"id":"deploy"}]"#.to_vec());
    }

    #[test]
    fn test_directory_archive_mounts_under_name() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(dir.path().join("hooks.json"), "[]").unwrap();
        std::fs::create_dir(dir.path().join("scripts")).unwrap();
        std::fs::write(dir.path().join("scripts/deploy.sh"), "echo hi").unwrap();

        let payload = Payload::Directory {
            mount: "/site".to_string(),
            source: dir.path().to_path_buf(),
        };
        let archive = write_archive(&payload, Vec::new()).unwrap();
        let paths: Vec<PathBuf> = entries(&archive).into_iter().map(|(p, _)| p).collect();

        assert!(paths.contains(&PathBuf::from("site/hooks.json")));
        assert!(paths.contains(&PathBuf::from("site/scripts/deploy.sh")));
        assert!(paths.iter().all(|p| p.starts_with("site")));
    }

    #[tokio::test]
    async fn test_streamed_archive_arrives_in_chunks() {
        let dir = tempfile::TempDir::new().unwrap();
        let large = vec![b'x'; ARCHIVE_CHUNK_BYTES * 3];
        std::fs::write(dir.path().join("blob.bin"), &large).unwrap();

        let payload = Payload::Directory {
            mount: "/site".to_string(),
            source: dir.path().to_path_buf(),
        };
        let (chunks, writer) = stream_archive(payload);
        let chunks: Vec<Bytes> = chunks.collect().await;
        writer.await.unwrap().unwrap();

        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.len() < ARCHIVE_CHUNK_BYTES * 2));

        let archive: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        let blob = entries(&archive)
            .into_iter()
            .find(|(path, _)| path == &PathBuf::from("site/blob.bin"))
            .unwrap();
        assert_eq!(blob.1.len(), large.len());
    }

    #[tokio::test]
    async fn test_streamed_archive_reports_missing_source() {
        let dir = tempfile::TempDir::new().unwrap();
        let payload = Payload::Directory {
            mount: "/site".to_string(),
            source: dir.path().join("gone"),
        };
        let (chunks, writer) = stream_archive(payload);
        let _: Vec<Bytes> = chunks.collect().await;
        assert!(writer.await.unwrap().is_err());
    }

    #[test]
    fn test_port_bindings_use_ephemeral_host_port() {
        let bindings = port_bindings(9000, "127.0.0.1");
        let binding = bindings["9000/tcp"].as_ref().unwrap();
        assert_eq!(binding.len(), 1);
        assert_eq!(binding[0].host_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(binding[0].host_port.as_deref(), Some(""));
    }

    #[test]
    fn test_exposed_ports_key() {
        let ports = exposed_ports(9000);
        assert!(ports.contains_key("9000/tcp"));
    }

    #[test]
    fn test_already_gone_statuses() {
        let gone = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container".to_string(),
        };
        let not_modified = bollard::errors::Error::DockerResponseServerError {
            status_code: 304,
            message: String::new(),
        };
        let server = bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "boom".to_string(),
        };
        assert!(is_already_gone(&gone));
        assert!(is_already_gone(&not_modified));
        assert!(!is_already_gone(&server));
    }

    #[test]
    fn test_short_id_length() {
        assert_eq!(short_id().len(), 12);
        assert_ne!(short_id(), short_id());
    }
}
