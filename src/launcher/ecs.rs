use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_ecs::types::{
    AssignPublicIp, AwsVpcConfiguration, ContainerOverride, KeyValuePair, LaunchType,
    NetworkConfiguration, TaskOverride,
};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

use super::{poll_until, Deadline, Progress, WorkerError, WorkerHandle, WorkerLauncher, RECORDS_ID_VAR};
use crate::aws::format_sdk_error;

/// ECS task lifecycle states, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskStatus {
    Provisioning,
    Pending,
    Activating,
    Running,
    Deactivating,
    Stopping,
    Deprovisioning,
    Stopped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Provisioning => "PROVISIONING",
            TaskStatus::Pending => "PENDING",
            TaskStatus::Activating => "ACTIVATING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Deactivating => "DEACTIVATING",
            TaskStatus::Stopping => "STOPPING",
            TaskStatus::Deprovisioning => "DEPROVISIONING",
            TaskStatus::Stopped => "STOPPED",
        }
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "PROVISIONING" => TaskStatus::Provisioning,
            "PENDING" => TaskStatus::Pending,
            "ACTIVATING" => TaskStatus::Activating,
            "RUNNING" => TaskStatus::Running,
            "DEACTIVATING" => TaskStatus::Deactivating,
            "STOPPING" => TaskStatus::Stopping,
            "DEPROVISIONING" => TaskStatus::Deprovisioning,
            "STOPPED" => TaskStatus::Stopped,
            other => anyhow::bail!("Unknown task status: {}", other),
        })
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where and how to run the worker task
#[derive(Debug, Clone)]
pub struct TaskSettings {
    pub cluster: String,
    pub task_definition: String,
    /// Container that receives the `RECORDS_ID` override
    pub container: String,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub assign_public_ip: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskState {
    pub arn: String,
    pub status: TaskStatus,
    /// Exit code of the worker container, once it has stopped
    pub exit_code: Option<i32>,
    pub stopped_reason: Option<String>,
}

impl TaskState {
    /// A stopped task succeeded only if the worker container exited with 0
    pub fn is_failed(&self) -> bool {
        self.status == TaskStatus::Stopped && self.exit_code != Some(0)
    }

    fn failed(&self) -> WorkerError {
        let status = match (self.exit_code, &self.stopped_reason) {
            (Some(code), _) => format!("exit code {}", code),
            (None, Some(reason)) => reason.clone(),
            (None, None) => "no exit code".to_string(),
        };
        WorkerError::Failed {
            id: self.arn.clone(),
            phase: self.status.to_string(),
            status,
        }
    }
}

/// Whether waiting for `target` is over: the task reached it or went past it
pub fn evaluate_task(state: &TaskState, target: TaskStatus) -> bool {
    state.status >= target
}

/// Runs the worker as a Fargate task
pub struct EcsTaskLauncher {
    client: aws_sdk_ecs::Client,
    task: TaskSettings,
    poll_interval: Duration,
}

impl EcsTaskLauncher {
    pub fn new(client: aws_sdk_ecs::Client, task: TaskSettings, poll_interval: Duration) -> Self {
        Self {
            client,
            task,
            poll_interval,
        }
    }

    fn network_configuration(&self) -> Result<NetworkConfiguration> {
        let assign_public_ip = if self.task.assign_public_ip {
            AssignPublicIp::Enabled
        } else {
            AssignPublicIp::Disabled
        };

        let mut vpc = AwsVpcConfiguration::builder()
            .set_subnets(Some(self.task.subnets.clone()))
            .assign_public_ip(assign_public_ip);
        if !self.task.security_groups.is_empty() {
            vpc = vpc.set_security_groups(Some(self.task.security_groups.clone()));
        }
        let vpc = vpc.build().context("can build aws vpc configuration")?;

        Ok(NetworkConfiguration::builder()
            .awsvpc_configuration(vpc)
            .build())
    }

    async fn describe_task(&self, arn: &str) -> Result<TaskState> {
        let response = self
            .client
            .describe_tasks()
            .cluster(&self.task.cluster)
            .tasks(arn)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to describe task {}: {}", arn, format_sdk_error(&e)))?;

        let task = response
            .tasks()
            .first()
            .with_context(|| format!("Task {} not found", arn))?;

        let status = task
            .last_status()
            .context("Task has no status")?
            .parse()?;
        let exit_code = task
            .containers()
            .iter()
            .find(|c| c.name() == Some(self.task.container.as_str()))
            .and_then(|c| c.exit_code());

        Ok(TaskState {
            arn: arn.to_string(),
            status,
            exit_code,
            stopped_reason: task.stopped_reason().map(str::to_string),
        })
    }

    async fn check_task(&self, arn: &str, target: TaskStatus) -> Result<Progress<TaskState>> {
        let state = self.describe_task(arn).await?;
        debug!("Task {} is {}", arn, state.status);
        if evaluate_task(&state, target) {
            Ok(Progress::Done(state))
        } else {
            Ok(Progress::Waiting)
        }
    }

    async fn wait_for_task(&self, arn: &str, target: TaskStatus, deadline: &Deadline) -> Result<TaskState> {
        poll_until(deadline, self.poll_interval, || self.check_task(arn, target)).await
    }
}

#[async_trait]
impl WorkerLauncher for EcsTaskLauncher {
    #[tracing::instrument(skip(self, deadline))]
    async fn start(&self, records_id: &str, deadline: &Deadline) -> Result<WorkerHandle> {
        let overrides = TaskOverride::builder()
            .container_overrides(
                ContainerOverride::builder()
                    .name(&self.task.container)
                    .environment(
                        KeyValuePair::builder()
                            .name(RECORDS_ID_VAR)
                            .value(records_id)
                            .build(),
                    )
                    .build(),
            )
            .build();

        let response = self
            .client
            .run_task()
            .cluster(&self.task.cluster)
            .task_definition(&self.task.task_definition)
            .launch_type(LaunchType::Fargate)
            .network_configuration(self.network_configuration()?)
            .overrides(overrides)
            .started_by("partition-ecr-replicate")
            .send()
            .await
            .map_err(|e| {
                anyhow::anyhow!(
                    "Failed to run task {}: {}",
                    self.task.task_definition,
                    format_sdk_error(&e)
                )
            })?;

        if let Some(failure) = response.failures().first() {
            anyhow::bail!(
                "Failed to run task {}: {}",
                self.task.task_definition,
                failure.reason().unwrap_or("unknown reason")
            );
        }

        let arn = response
            .tasks()
            .first()
            .and_then(|t| t.task_arn())
            .context("RunTask returned no task")?
            .to_string();
        info!("[{}] Started task {}", records_id, arn);

        let state = self.wait_for_task(&arn, TaskStatus::Running, deadline).await?;
        if state.is_failed() {
            return Err(state.failed().into());
        }

        Ok(WorkerHandle {
            id: arn,
            records_id: records_id.to_string(),
        })
    }

    async fn join(&self, handle: &WorkerHandle, deadline: &Deadline) -> Result<()> {
        let state = self
            .wait_for_task(&handle.id, TaskStatus::Stopped, deadline)
            .await?;
        if state.is_failed() {
            return Err(state.failed().into());
        }
        info!("[{}] Task {} succeeded", handle.records_id, handle.id);
        Ok(())
    }
}
