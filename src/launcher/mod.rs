pub mod codebuild;
pub mod ecs;

pub use codebuild::CodeBuildLauncher;
pub use ecs::EcsTaskLauncher;

use anyhow::Result;
use async_trait::async_trait;
use aws_config::SdkConfig;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::settings::{require, LauncherKind, Settings};

/// Stop polling once this little time is left before the deadline
const MIN_POLL_REMAINING: Duration = Duration::from_secs(5);
/// Don't sleep for another poll once this little time is left
const MIN_SLEEP_REMAINING: Duration = Duration::from_secs(10);

/// Environment variable the worker reads its records ID from
pub const RECORDS_ID_VAR: &str = "RECORDS_ID";

/// Point in time by which the invocation must have returned
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: SystemTime,
}

impl Deadline {
    /// From the Lambda context deadline (milliseconds since the epoch)
    pub fn from_epoch_millis(millis: u64) -> Self {
        Self {
            at: UNIX_EPOCH + Duration::from_millis(millis),
        }
    }

    pub fn after(duration: Duration) -> Self {
        Self {
            at: SystemTime::now() + duration,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.at
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
    }
}

/// A started worker run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerHandle {
    /// CodeBuild build ID or ECS task ARN
    pub id: String,
    pub records_id: String,
}

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Not enough time to wait for worker")]
    OutOfTime,
    #[error("Worker {id} failed: {phase} = {status}")]
    Failed {
        id: String,
        phase: String,
        status: String,
    },
}

/// Runs the replication worker for a records item
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Start the worker and wait until it is actually running
    async fn start(&self, records_id: &str, deadline: &Deadline) -> Result<WorkerHandle>;

    /// Wait for the worker to finish; an unsuccessful worker is an error
    async fn join(&self, handle: &WorkerHandle, deadline: &Deadline) -> Result<()>;
}

/// Outcome of one status poll
#[derive(Debug)]
pub enum Progress<T> {
    Done(T),
    Waiting,
}

/// Poll until `poll` reports done or the deadline is too close
///
/// Polls only while more than 5s remain, and gives up instead of sleeping once
/// 10s or less remain, leaving the invocation time to report back.
pub async fn poll_until<T, F, Fut>(
    deadline: &Deadline,
    interval: Duration,
    mut poll: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Progress<T>>>,
{
    while deadline.remaining() > MIN_POLL_REMAINING {
        if let Progress::Done(value) = poll().await? {
            return Ok(value);
        }

        if deadline.remaining() <= MIN_SLEEP_REMAINING {
            break;
        }
        tokio::time::sleep(interval).await;
    }

    Err(WorkerError::OutOfTime.into())
}

/// Build the launcher selected by `WORKER_LAUNCHER`
pub fn from_settings(settings: &Settings, sdk_config: &SdkConfig) -> Result<Arc<dyn WorkerLauncher>> {
    let poll_interval = settings.worker_poll_interval();

    match settings.worker_launcher {
        LauncherKind::Codebuild => {
            let project = require("IMAGES_PROJECT", &settings.images_project)?;
            Ok(Arc::new(CodeBuildLauncher::new(
                aws_sdk_codebuild::Client::new(sdk_config),
                project,
                poll_interval,
            )))
        }
        LauncherKind::Ecs => {
            let subnets = settings.subnets();
            if subnets.is_empty() {
                anyhow::bail!("IMAGES_SUBNETS is required");
            }
            let task = ecs::TaskSettings {
                cluster: require("IMAGES_CLUSTER", &settings.images_cluster)?.to_string(),
                task_definition: require(
                    "IMAGES_TASK_DEFINITION",
                    &settings.images_task_definition,
                )?
                .to_string(),
                container: require("IMAGES_CONTAINER", &settings.images_container)?.to_string(),
                subnets,
                security_groups: settings.security_groups(),
                assign_public_ip: settings.images_assign_public_ip,
            };
            Ok(Arc::new(EcsTaskLauncher::new(
                aws_sdk_ecs::Client::new(sdk_config),
                task,
                poll_interval,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_deadline_from_context() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64;
        let deadline = Deadline::from_epoch_millis(now + 60_000);
        let remaining = deadline.remaining();
        assert!(remaining > Duration::from_secs(55));
        assert!(remaining <= Duration::from_secs(60));

        assert_eq!(Deadline::from_epoch_millis(0).remaining(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_poll_until_done() {
        let calls = AtomicUsize::new(0);
        let deadline = Deadline::after(Duration::from_secs(60));

        let value = poll_until(&deadline, Duration::ZERO, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Ok::<_, anyhow::Error>(Progress::Waiting)
                } else {
                    Ok(Progress::Done(n))
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_poll_until_out_of_time() {
        let calls = AtomicUsize::new(0);
        // Enough time for one poll, not enough to sleep for another
        let deadline = Deadline::after(Duration::from_secs(8));

        let err = poll_until(&deadline, Duration::from_secs(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, anyhow::Error>(Progress::<()>::Waiting) }
        })
        .await
        .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<WorkerError>(),
            Some(WorkerError::OutOfTime)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_poll_until_no_time_to_poll() {
        let deadline = Deadline::after(Duration::from_secs(3));
        let result = poll_until(&deadline, Duration::ZERO, || async {
            Ok::<_, anyhow::Error>(Progress::Done(()))
        })
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_poll_errors_propagate() {
        let deadline = Deadline::after(Duration::from_secs(60));
        let err = poll_until(&deadline, Duration::ZERO, || async {
            Err::<Progress<()>, _>(anyhow::anyhow!("No builds found"))
        })
        .await
        .unwrap_err();
        assert_eq!(err.to_string(), "No builds found");
    }

    #[test]
    fn test_from_settings_requires_launcher_settings() {
        let sdk_config = SdkConfig::builder().build();

        let settings = Settings::from_source([("WORKER_LAUNCHER", "codebuild")]).unwrap();
        let err = from_settings(&settings, &sdk_config).err().unwrap();
        assert_eq!(err.to_string(), "IMAGES_PROJECT is required");

        let settings = Settings::from_source([
            ("WORKER_LAUNCHER", "ecs"),
            ("IMAGES_CLUSTER", "replicate"),
        ])
        .unwrap();
        let err = from_settings(&settings, &sdk_config).err().unwrap();
        assert_eq!(err.to_string(), "IMAGES_SUBNETS is required");
    }
}
