use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use aws_sdk_ecr::types::{ImageFailure, ImageFailureCode, ImageIdentifier};
use bollard::image::{CreateImageOptions, PushImageOptions, TagImageOptions};
use bollard::Docker;
use futures_util::StreamExt;
use std::collections::HashSet;
use std::fmt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn, Instrument};

use crate::aws::format_sdk_error;
use crate::registry::EcrRegistry;

/// An image in a source repository, by digest
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageRef {
    pub repo_name: String,
    pub image_digest: String,
}

impl ImageRef {
    pub fn new(repo_name: impl Into<String>, image_digest: impl Into<String>) -> Self {
        Self {
            repo_name: repo_name.into(),
            image_digest: image_digest.into(),
        }
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repo_name, self.image_digest)
    }
}

/// Applies image actions to the destination registry
#[async_trait]
pub trait ImageReplicator: Send + Sync {
    /// Copy the image to the destination repository under `tag`
    async fn push(&self, image: &ImageRef, tag: Option<&str>) -> Result<()>;

    /// Remove the tag (or, untagged, the whole image) from the destination
    async fn delete(&self, image: &ImageRef, tag: Option<&str>) -> Result<()>;
}

/// Replicates through the local Docker daemon: pull from the source, tag, push
/// to the destination. Deletes go straight to the destination ECR API.
pub struct DockerReplicator {
    docker: Docker,
    src: EcrRegistry,
    dst: EcrRegistry,
    /// Images already pulled during this run
    pulled: Mutex<HashSet<ImageRef>>,
}

impl DockerReplicator {
    pub fn new(docker: Docker, src: EcrRegistry, dst: EcrRegistry) -> Self {
        Self {
            docker,
            src,
            dst,
            pulled: Mutex::new(HashSet::new()),
        }
    }

    /// Connect to the local Docker daemon and check that it answers
    pub async fn connect_docker() -> Result<Docker> {
        let docker = Docker::connect_with_local_defaults()
            .context("Unable to connect to Docker")?;
        docker
            .ping()
            .await
            .context("Docker is not available")?;
        Ok(docker)
    }

    /// Local reference of a pulled source image
    fn source_reference(&self, image: &ImageRef) -> String {
        format!(
            "{}@{}",
            self.src.repository(&image.repo_name),
            image.image_digest
        )
    }

    async fn needs_pull(&self, image: &ImageRef) -> bool {
        !self.pulled.lock().await.contains(image)
    }

    async fn mark_pulled(&self, image: &ImageRef) {
        self.pulled.lock().await.insert(image.clone());
    }

    async fn ensure_pulled(&self, image: &ImageRef) -> Result<()> {
        if !self.needs_pull(image).await {
            return Ok(());
        }

        debug!("Pulling image from {}", self.src.host);
        let options = CreateImageOptions {
            from_image: self.src.repository(&image.repo_name),
            tag: image.image_digest.clone(),
            ..Default::default()
        };

        let mut stream = self
            .docker
            .create_image(Some(options), None, Some(self.src.docker_credentials()));
        while let Some(result) = stream.next().await {
            let info = result.with_context(|| format!("Failed to pull image {}", image))?;
            if let Some(error) = info.error {
                bail!("Failed to pull image {}: {}", image, error);
            }
            if let Some(status) = info.status {
                debug!("Pull: {}", status);
            }
        }

        self.mark_pulled(image).await;
        Ok(())
    }
}

fn image_span(image: &ImageRef) -> tracing::Span {
    tracing::info_span!("image", repo = %image.repo_name, digest = %image.image_digest)
}

#[async_trait]
impl ImageReplicator for DockerReplicator {
    async fn push(&self, image: &ImageRef, tag: Option<&str>) -> Result<()> {
        let Some(tag) = tag else {
            bail!("An image tag is required to push {}", image);
        };
        async move {
            self.ensure_pulled(image).await?;

            let dst_repo = self.dst.repository(&image.repo_name);
            info!("Tagging image with {}:{}", dst_repo, tag);
            self.docker
                .tag_image(
                    &self.source_reference(image),
                    Some(TagImageOptions {
                        repo: dst_repo.clone(),
                        tag: tag.to_string(),
                    }),
                )
                .await
                .with_context(|| format!("Failed to tag {} as {}:{}", image, dst_repo, tag))?;

            info!("Pushing image to {}", self.dst.host);
            let mut progress = self.docker.push_image(
                &dst_repo,
                Some(PushImageOptions {
                    tag: tag.to_string(),
                }),
                Some(self.dst.docker_credentials()),
            );
            while let Some(update) = progress.next().await {
                let update =
                    update.with_context(|| format!("Failed to push {}:{}", dst_repo, tag))?;
                if let Some(error) = update.error {
                    bail!("Failed to push {}:{}: {}", dst_repo, tag, error);
                }
                match (update.status, update.progress) {
                    (Some(status), Some(progress)) => debug!("Push: {} {}", status, progress),
                    (Some(status), None) => debug!("Push: {}", status),
                    _ => {}
                }
            }

            info!("Pushed {}:{}", dst_repo, tag);
            Ok(())
        }
        .instrument(image_span(image))
        .await
    }

    async fn delete(&self, image: &ImageRef, tag: Option<&str>) -> Result<()> {
        async move {
            let dst_repo = self.dst.repository(&image.repo_name);
            let image_id = match tag {
                Some(tag) => {
                    info!("Deleting image {}:{}", dst_repo, tag);
                    ImageIdentifier::builder().image_tag(tag).build()
                }
                None => {
                    info!("Deleting image {}@{}", dst_repo, image.image_digest);
                    ImageIdentifier::builder()
                        .image_digest(&image.image_digest)
                        .build()
                }
            };

            let response = self
                .dst
                .ecr
                .batch_delete_image()
                .registry_id(&self.dst.registry_id)
                .repository_name(&image.repo_name)
                .image_ids(image_id)
                .send()
                .await
                .map_err(|e| {
                    anyhow::anyhow!(
                        "Failed to delete image from {}: {}",
                        dst_repo,
                        format_sdk_error(&e)
                    )
                })?;

            check_delete_failures(&dst_repo, response.failures())
        }
        .instrument(image_span(image))
        .await
    }
}

/// Turn `BatchDeleteImage` failures into an error
///
/// An image that is already gone counts as deleted; this happens when a
/// delete is redelivered or the destination was cleaned up by hand.
pub fn check_delete_failures(dst_repo: &str, failures: &[ImageFailure]) -> Result<()> {
    let mut errors = Vec::new();
    for failure in failures {
        let reason = failure.failure_reason().unwrap_or("unknown reason");
        match failure.failure_code() {
            Some(ImageFailureCode::ImageNotFound) => {
                warn!("Image already absent from {}: {}", dst_repo, reason);
            }
            code => errors.push(format!(
                "{}: {}",
                code.map(|c| c.as_str()).unwrap_or("Unknown"),
                reason
            )),
        }
    }

    if !errors.is_empty() {
        bail!(
            "Failed to delete image from {}: {}",
            dst_repo,
            errors.join("; ")
        );
    }
    Ok(())
}
