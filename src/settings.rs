use config::{Config, ConfigError};
use serde::Deserialize;
use std::time::Duration;

fn default_records_ttl() -> u64 {
    3600
}

fn default_results_ttl() -> u64 {
    60
}

fn default_logging_level() -> String {
    "INFO".to_string()
}

fn default_worker_poll_interval() -> u64 {
    10
}

/// Where the queue Lambda runs the replication worker
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LauncherKind {
    /// CodeBuild project named by `IMAGES_PROJECT`
    #[default]
    Codebuild,
    /// ECS Fargate task named by `IMAGES_TASK_DEFINITION`
    Ecs,
}

/// Process settings, read from environment variables
///
/// Every field maps to the upper-case environment variable of the same name
/// (e.g. `dest_repo_region` ← `DEST_REPO_REGION`). Empty values are treated
/// as unset.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Region of the destination repositories (other partition)
    #[serde(default)]
    pub dest_repo_region: Option<String>,
    /// Destination registry ID; defaults to the account of the secret's user
    #[serde(default)]
    pub dest_registry_id: Option<String>,
    /// Secrets Manager secret holding the destination IAM user keys
    #[serde(default)]
    pub dest_secret: Option<String>,

    /// Region of the source repositories; defaults to the SDK region
    #[serde(default)]
    pub src_repo_region: Option<String>,
    /// Source registry ID; defaults to the current account
    #[serde(default)]
    pub src_registry_id: Option<String>,

    /// URL of the SQS FIFO queue for image events
    #[serde(default)]
    pub images_queue: Option<String>,
    /// CodeBuild project that runs the worker
    #[serde(default)]
    pub images_project: Option<String>,

    /// DynamoDB table for records and results
    #[serde(default)]
    pub records_table: Option<String>,
    /// TTL of the records item in seconds (should match the SQS visibility timeout)
    #[serde(default = "default_records_ttl")]
    pub records_ttl: u64,
    /// TTL of the results item in seconds
    #[serde(default = "default_results_ttl")]
    pub results_ttl: u64,

    /// Log level name (DEBUG, INFO, WARNING, ERROR)
    #[serde(default = "default_logging_level")]
    pub logging_level: String,

    #[serde(default)]
    pub worker_launcher: LauncherKind,
    /// Seconds between worker status polls
    #[serde(default = "default_worker_poll_interval")]
    pub worker_poll_interval: u64,

    // ECS Fargate worker
    #[serde(default)]
    pub images_cluster: Option<String>,
    #[serde(default)]
    pub images_task_definition: Option<String>,
    /// Name of the worker container inside the task definition
    #[serde(default)]
    pub images_container: Option<String>,
    /// Comma separated subnet IDs
    #[serde(default)]
    pub images_subnets: Option<String>,
    /// Comma separated security group IDs
    #[serde(default)]
    pub images_security_groups: Option<String>,
    #[serde(default)]
    pub images_assign_public_ip: bool,
}

impl Settings {
    /// Load settings from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_source(std::env::vars())
    }

    /// Load settings from an explicit map of environment variables
    ///
    /// Blank values count as unset, so their defaults apply.
    pub fn from_source<I, K, V>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map: config::Map<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(_, v)| !v.trim().is_empty())
            .collect();
        Self::load(config::Environment::default().source(Some(map)))
    }

    fn load(source: config::Environment) -> Result<Self, ConfigError> {
        let config = Config::builder().add_source(source).build()?;
        let settings: Settings = config.try_deserialize()?;

        if settings.records_ttl == 0 {
            return Err(ConfigError::Message(
                "RECORDS_TTL must be greater than zero".to_string(),
            ));
        }
        for (name, ttl) in [
            ("RECORDS_TTL", settings.records_ttl),
            ("RESULTS_TTL", settings.results_ttl),
        ] {
            if i64::try_from(ttl).is_err() {
                return Err(ConfigError::Message(format!("{} is too large", name)));
            }
        }

        Ok(settings)
    }

    pub fn worker_poll_interval(&self) -> Duration {
        Duration::from_secs(self.worker_poll_interval)
    }

    pub fn subnets(&self) -> Vec<String> {
        split_list(self.images_subnets.as_deref())
    }

    pub fn security_groups(&self) -> Vec<String> {
        split_list(self.images_security_groups.as_deref())
    }
}

/// Return the value of a required setting, or an error naming its variable
pub fn require<'a>(name: &str, value: &'a Option<String>) -> anyhow::Result<&'a str> {
    match value.as_deref() {
        Some(v) => Ok(v),
        None => anyhow::bail!("{} is required", name),
    }
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::from_source(Vec::<(String, String)>::new()).unwrap();
        assert_eq!(settings.records_ttl, 3600);
        assert_eq!(settings.results_ttl, 60);
        assert_eq!(settings.logging_level, "INFO");
        assert_eq!(settings.worker_launcher, LauncherKind::Codebuild);
        assert_eq!(settings.worker_poll_interval(), Duration::from_secs(10));
        assert!(settings.dest_secret.is_none());
        assert!(!settings.images_assign_public_ip);
    }

    #[test]
    fn test_reads_upper_case_variables() {
        let settings = Settings::from_source([
            ("DEST_REPO_REGION", "us-gov-west-1"),
            ("DEST_REGISTRY_ID", "012345678901"),
            ("RECORDS_TABLE", "replicate-records"),
            ("RECORDS_TTL", "900"),
            ("WORKER_LAUNCHER", "ecs"),
        ])
        .unwrap();

        assert_eq!(settings.dest_repo_region.as_deref(), Some("us-gov-west-1"));
        // Leading zeros survive; registry IDs are not numbers
        assert_eq!(settings.dest_registry_id.as_deref(), Some("012345678901"));
        assert_eq!(settings.records_table.as_deref(), Some("replicate-records"));
        assert_eq!(settings.records_ttl, 900);
        assert_eq!(settings.worker_launcher, LauncherKind::Ecs);
    }

    #[test]
    fn test_blank_values_are_unset() {
        let settings = Settings::from_source([
            ("SRC_REGISTRY_ID", ""),
            ("IMAGES_QUEUE", "  "),
            ("RECORDS_TTL", ""),
            ("RESULTS_TTL", " "),
            ("WORKER_POLL_INTERVAL", ""),
            ("WORKER_LAUNCHER", ""),
            ("IMAGES_ASSIGN_PUBLIC_IP", ""),
        ])
        .unwrap();
        assert!(settings.src_registry_id.is_none());
        assert!(settings.images_queue.is_none());
        assert_eq!(settings.records_ttl, 3600);
        assert_eq!(settings.results_ttl, 60);
        assert_eq!(settings.worker_poll_interval(), Duration::from_secs(10));
        assert_eq!(settings.worker_launcher, LauncherKind::Codebuild);
        assert!(!settings.images_assign_public_ip);
    }

    #[test]
    fn test_zero_records_ttl_rejected() {
        assert!(Settings::from_source([("RECORDS_TTL", "0")]).is_err());
    }

    #[test]
    fn test_oversized_ttls_rejected() {
        let err = Settings::from_source([("RECORDS_TTL", "18446744073709551615")]).unwrap_err();
        assert!(err.to_string().contains("RECORDS_TTL is too large"));

        let err = Settings::from_source([("RESULTS_TTL", "9223372036854775808")]).unwrap_err();
        assert!(err.to_string().contains("RESULTS_TTL is too large"));

        let settings = Settings::from_source([("RESULTS_TTL", "9223372036854775807")]).unwrap();
        assert_eq!(settings.results_ttl, i64::MAX as u64);
    }

    #[test]
    fn test_split_lists() {
        let settings = Settings::from_source([
            ("IMAGES_SUBNETS", "subnet-a, subnet-b,,"),
            ("IMAGES_SECURITY_GROUPS", ""),
        ])
        .unwrap();
        assert_eq!(settings.subnets(), vec!["subnet-a", "subnet-b"]);
        assert!(settings.security_groups().is_empty());
    }

    #[test]
    fn test_require() {
        let value = Some("queue-url".to_string());
        assert_eq!(require("IMAGES_QUEUE", &value).unwrap(), "queue-url");

        let err = require("IMAGES_QUEUE", &None).unwrap_err();
        assert_eq!(err.to_string(), "IMAGES_QUEUE is required");
    }
}
