use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_codebuild::operation::start_build::StartBuildOutput;
use aws_sdk_codebuild::types::{EnvironmentVariable, EnvironmentVariableType};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::{poll_until, Deadline, Progress, WorkerError, WorkerHandle, WorkerLauncher, RECORDS_ID_VAR};
use crate::aws::format_sdk_error;

/// CodeBuild build phases, in the order a build goes through them
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BuildPhase {
    Submitted,
    Queued,
    Provisioning,
    DownloadSource,
    Install,
    PreBuild,
    Build,
    PostBuild,
    UploadArtifacts,
    Finalizing,
    Completed,
}

impl BuildPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildPhase::Submitted => "SUBMITTED",
            BuildPhase::Queued => "QUEUED",
            BuildPhase::Provisioning => "PROVISIONING",
            BuildPhase::DownloadSource => "DOWNLOAD_SOURCE",
            BuildPhase::Install => "INSTALL",
            BuildPhase::PreBuild => "PRE_BUILD",
            BuildPhase::Build => "BUILD",
            BuildPhase::PostBuild => "POST_BUILD",
            BuildPhase::UploadArtifacts => "UPLOAD_ARTIFACTS",
            BuildPhase::Finalizing => "FINALIZING",
            BuildPhase::Completed => "COMPLETED",
        }
    }
}

impl FromStr for BuildPhase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "SUBMITTED" => BuildPhase::Submitted,
            "QUEUED" => BuildPhase::Queued,
            "PROVISIONING" => BuildPhase::Provisioning,
            "DOWNLOAD_SOURCE" => BuildPhase::DownloadSource,
            "INSTALL" => BuildPhase::Install,
            "PRE_BUILD" => BuildPhase::PreBuild,
            "BUILD" => BuildPhase::Build,
            "POST_BUILD" => BuildPhase::PostBuild,
            "UPLOAD_ARTIFACTS" => BuildPhase::UploadArtifacts,
            "FINALIZING" => BuildPhase::Finalizing,
            "COMPLETED" => BuildPhase::Completed,
            other => anyhow::bail!("Unknown build phase: {}", other),
        })
    }
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const STATUS_SUCCEEDED: &str = "SUCCEEDED";
const STATUS_IN_PROGRESS: &str = "IN_PROGRESS";

/// Snapshot of a build from BatchGetBuilds
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildState {
    pub id: String,
    pub phase: BuildPhase,
    pub status: String,
}

impl BuildState {
    pub fn is_healthy(&self) -> bool {
        self.status == STATUS_SUCCEEDED || self.status == STATUS_IN_PROGRESS
    }

    fn failed(&self) -> WorkerError {
        WorkerError::Failed {
            id: self.id.clone(),
            phase: self.phase.to_string(),
            status: self.status.clone(),
        }
    }
}

/// Decide whether waiting for `target` is over
///
/// Done when the build failed, when it finished `target`, or when it is
/// already in a later phase. A build sitting in `target` is still waiting.
pub fn evaluate_build(state: &BuildState, target: BuildPhase) -> bool {
    if !state.is_healthy() {
        return true;
    }
    if state.phase == target {
        return state.status != STATUS_IN_PROGRESS;
    }
    state.phase > target
}

fn started_build_id(response: &StartBuildOutput) -> Result<String> {
    Ok(response
        .build_value()
        .and_then(|b| b.id())
        .context("StartBuild returned no build ID")?
        .to_string())
}

/// Runs the worker as a CodeBuild build of `IMAGES_PROJECT`
pub struct CodeBuildLauncher {
    client: aws_sdk_codebuild::Client,
    project: String,
    poll_interval: Duration,
}

impl CodeBuildLauncher {
    pub fn new(client: aws_sdk_codebuild::Client, project: impl Into<String>, poll_interval: Duration) -> Self {
        Self {
            client,
            project: project.into(),
            poll_interval,
        }
    }

    async fn get_build(&self, id: &str) -> Result<BuildState> {
        let response = self
            .client
            .batch_get_builds()
            .ids(id)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to get build {}: {}", id, format_sdk_error(&e)))?;

        let build = response
            .builds()
            .first()
            .with_context(|| format!("Build {} not found", id))?;

        let phase = build
            .current_phase()
            .context("Build has no current phase")?
            .parse()?;
        let status = build
            .build_status()
            .map(|s| s.as_str().to_string())
            .context("Build has no status")?;

        Ok(BuildState {
            id: id.to_string(),
            phase,
            status,
        })
    }

    async fn check_build(&self, id: &str, target: BuildPhase) -> Result<Progress<BuildState>> {
        let state = self.get_build(id).await?;
        debug!("Build {} is in {} ({})", id, state.phase, state.status);
        if evaluate_build(&state, target) {
            Ok(Progress::Done(state))
        } else {
            Ok(Progress::Waiting)
        }
    }

    async fn wait_for_build(&self, id: &str, target: BuildPhase, deadline: &Deadline) -> Result<BuildState> {
        poll_until(deadline, self.poll_interval, || self.check_build(id, target)).await
    }
}

#[async_trait]
impl WorkerLauncher for CodeBuildLauncher {
    async fn start(&self, records_id: &str, deadline: &Deadline) -> Result<WorkerHandle> {
        let variable = EnvironmentVariable::builder()
            .name(RECORDS_ID_VAR)
            .value(records_id)
            .r#type(EnvironmentVariableType::Plaintext)
            .build()
            .context("Failed to build environment override")?;

        let response = self
            .client
            .start_build()
            .project_name(&self.project)
            .environment_variables_override(variable)
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to start build of {}: {}",
                    self.project,
                    format_sdk_error(&e)
                )
            })?;

        let id = started_build_id(&response)?;
        info!("[{}] Started build {}", records_id, id);

        // Replication runs in BUILD; past PRE_BUILD the worker is up
        let state = self.wait_for_build(&id, BuildPhase::PreBuild, deadline).await?;
        if !state.is_healthy() {
            return Err(state.failed().into());
        }

        Ok(WorkerHandle {
            id,
            records_id: records_id.to_string(),
        })
    }

    async fn join(&self, handle: &WorkerHandle, deadline: &Deadline) -> Result<()> {
        let state = self
            .wait_for_build(&handle.id, BuildPhase::Completed, deadline)
            .await?;
        if state.status != STATUS_SUCCEEDED {
            return Err(state.failed().into());
        }
        info!("[{}] Build {} succeeded", handle.records_id, handle.id);
        Ok(())
    }
}
