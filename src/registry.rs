use anyhow::{Context, Result};
use aws_config::SdkConfig;
use aws_sdk_ecr::config::Credentials;
use base64::Engine;
use bollard::auth::DockerCredentials;
use serde::Deserialize;
use std::fmt;
use tracing::{debug, info};

use crate::aws::{format_sdk_error, load_sdk_config};
use crate::settings::{require, Settings};

/// Static IAM user keys for the destination partition
///
/// There is no IAM trust between partitions, so the destination can only be
/// reached with long-lived keys of a user that lives in that partition.
#[derive(Clone, Deserialize)]
pub struct DestinationCredentials {
    #[serde(rename = "accesskey")]
    pub access_key_id: String,
    #[serde(rename = "secretaccesskey")]
    secret_access_key: String,
}

impl fmt::Debug for DestinationCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"** redacted **")
            .finish()
    }
}

impl DestinationCredentials {
    /// Parse the secret string
    ///
    /// Expects a JSON object with `accesskey` and `secretaccesskey`; other
    /// fields (such as `region`) are ignored, the region comes from
    /// `DEST_REPO_REGION`.
    pub fn from_secret(secret: &str) -> Result<Self> {
        let creds: Self = serde_json::from_str(secret)
            .context("Destination secret must be JSON with accesskey and secretaccesskey")?;
        if creds.access_key_id.is_empty() || creds.secret_access_key.is_empty() {
            anyhow::bail!("Destination secret has an empty accesskey or secretaccesskey");
        }
        Ok(creds)
    }

    pub fn to_sdk_credentials(&self) -> Credentials {
        Credentials::new(
            &self.access_key_id,
            &self.secret_access_key,
            None,
            None,
            "partition-ecr-replicate",
        )
    }
}

/// Fetch the destination credentials from Secrets Manager
pub async fn get_destination_credentials(
    client: &aws_sdk_secretsmanager::Client,
    secret_id: &str,
) -> Result<DestinationCredentials> {
    let response = client
        .get_secret_value()
        .secret_id(secret_id)
        .send()
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "Failed to get secret '{}': {}",
                secret_id,
                format_sdk_error(&e)
            )
        })?;

    let secret = response
        .secret_string()
        .with_context(|| format!("Secret '{}' has no SecretString", secret_id))?;

    DestinationCredentials::from_secret(secret)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("Authorization token is not valid base64")]
    Encoding,
    #[error("Authorization token is not ASCII")]
    NotAscii,
    #[error("No username in authorization token")]
    NoUsername,
    #[error("No password in authorization token")]
    NoPassword,
}

/// Decode an ECR authorization token into (username, password)
///
/// The token is base64 of `user:password`; the password may itself contain
/// colons.
pub fn parse_authorization_token(token: &str) -> Result<(String, String), TokenError> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(token.trim())
        .map_err(|_| TokenError::Encoding)?;
    if !decoded.is_ascii() {
        return Err(TokenError::NotAscii);
    }
    let decoded = String::from_utf8(decoded).map_err(|_| TokenError::NotAscii)?;

    let (username, password) = decoded.split_once(':').unwrap_or((decoded.as_str(), ""));
    if username.is_empty() {
        return Err(TokenError::NoUsername);
    }
    if password.is_empty() {
        return Err(TokenError::NoPassword);
    }

    Ok((username.to_string(), password.to_string()))
}

/// Registry hostname for an ECR registry
///
/// GovCloud uses the same `amazonaws.com` suffix as the commercial partition;
/// the China regions use `amazonaws.com.cn`.
pub fn registry_host(registry_id: &str, region: &str) -> String {
    let suffix = if region.starts_with("cn-") {
        "amazonaws.com.cn"
    } else {
        "amazonaws.com"
    };
    format!("{}.dkr.ecr.{}.{}", registry_id, region, suffix)
}

/// An ECR registry we hold credentials for
#[derive(Clone)]
pub struct EcrRegistry {
    /// e.g. "123456789012.dkr.ecr.us-gov-west-1.amazonaws.com"
    pub host: String,
    pub registry_id: String,
    pub region: String,
    username: String,
    password: String,
    /// ECR client in the registry's partition and region
    pub ecr: aws_sdk_ecr::Client,
}

impl fmt::Debug for EcrRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EcrRegistry")
            .field("host", &self.host)
            .field("registry_id", &self.registry_id)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl EcrRegistry {
    pub fn new(
        registry_id: impl Into<String>,
        region: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
        ecr: aws_sdk_ecr::Client,
    ) -> Self {
        let registry_id = registry_id.into();
        let region = region.into();
        Self {
            host: registry_host(&registry_id, &region),
            registry_id,
            region,
            username: username.into(),
            password: password.into(),
            ecr,
        }
    }

    /// Full repository path, e.g. "<host>/team/app"
    pub fn repository(&self, repo_name: &str) -> String {
        format!("{}/{}", self.host, repo_name)
    }

    /// Credentials passed to the Docker daemon with every pull/push
    pub fn docker_credentials(&self) -> DockerCredentials {
        DockerCredentials {
            username: Some(self.username.clone()),
            password: Some(self.password.clone()),
            serveraddress: Some(self.host.clone()),
            ..Default::default()
        }
    }
}

/// Get an authorization token for an ECR registry
///
/// Without a `registry_id` the registry of the calling account is used (looked
/// up through STS with the same credentials).
pub async fn login_registry(sdk_config: &SdkConfig, registry_id: Option<&str>) -> Result<EcrRegistry> {
    let region = sdk_config
        .region()
        .map(|r| r.as_ref().to_string())
        .context("No AWS region configured for registry")?;

    let registry_id = match registry_id {
        Some(id) => id.to_string(),
        None => {
            let sts = aws_sdk_sts::Client::new(sdk_config);
            let identity = sts.get_caller_identity().send().await.map_err(|e| {
                anyhow::anyhow!("Failed to get caller identity: {}", format_sdk_error(&e))
            })?;
            identity
                .account()
                .context("Caller identity has no account")?
                .to_string()
        }
    };

    let ecr = aws_sdk_ecr::Client::new(sdk_config);

    info!(
        "Getting authorization token to registry {} in region {}",
        registry_id, region
    );
    #[allow(deprecated)]
    let response = ecr
        .get_authorization_token()
        .registry_ids(&registry_id)
        .send()
        .await
        .map_err(|e| {
            anyhow::anyhow!(
                "Failed to get authorization token for registry {}: {}",
                registry_id,
                format_sdk_error(&e)
            )
        })?;

    let data = response
        .authorization_data()
        .first()
        .context("No authorization data returned")?;
    let token = data
        .authorization_token()
        .context("No authorization token returned")?;
    let (username, password) = parse_authorization_token(token)?;

    let registry = EcrRegistry::new(registry_id, region, username, password, ecr);
    info!("Logged in to registry {}", registry.host);
    debug!(
        "Authorization token for {} expires at {:?}",
        registry.host,
        data.expires_at()
    );

    Ok(registry)
}

/// Log in to the source and destination registries
///
/// The source uses the ambient credentials (worker role); the destination
/// uses the IAM user keys from `DEST_SECRET`.
pub async fn login(settings: &Settings) -> Result<(EcrRegistry, EcrRegistry)> {
    let dest_region = require("DEST_REPO_REGION", &settings.dest_repo_region)?;
    let dest_secret = require("DEST_SECRET", &settings.dest_secret)?;

    let src_config = load_sdk_config(settings.src_repo_region.as_deref(), None).await;
    let src_registry = login_registry(&src_config, settings.src_registry_id.as_deref())
        .await
        .context("Failed to log in to source registry")?;

    // The secret lives next to the worker, in the source partition
    let secrets = aws_sdk_secretsmanager::Client::new(&load_sdk_config(None, None).await);
    let creds = get_destination_credentials(&secrets, dest_secret).await?;
    debug!("Using destination access key {}", creds.access_key_id);

    let dst_config = load_sdk_config(Some(dest_region), Some(creds.to_sdk_credentials())).await;
    let dst_registry = login_registry(&dst_config, settings.dest_registry_id.as_deref())
        .await
        .context("Failed to log in to destination registry")?;

    Ok((src_registry, dst_registry))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(s: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(s)
    }

    #[test]
    fn test_parse_authorization_token() {
        let (user, pass) = parse_authorization_token(&encode("AWS:secret:with:colons")).unwrap();
        assert_eq!(user, "AWS");
        assert_eq!(pass, "secret:with:colons");
    }

    #[test]
    fn test_parse_authorization_token_errors() {
        assert_eq!(
            parse_authorization_token("%%%"),
            Err(TokenError::Encoding)
        );
        assert_eq!(
            parse_authorization_token(&encode(":password")),
            Err(TokenError::NoUsername)
        );
        assert_eq!(
            parse_authorization_token(&encode("AWS:")),
            Err(TokenError::NoPassword)
        );
        assert_eq!(
            parse_authorization_token(&encode("AWS")),
            Err(TokenError::NoPassword)
        );
    }

    #[test]
    fn test_registry_host() {
        assert_eq!(
            registry_host("123456789012", "us-east-1"),
            "123456789012.dkr.ecr.us-east-1.amazonaws.com"
        );
        assert_eq!(
            registry_host("123456789012", "us-gov-west-1"),
            "123456789012.dkr.ecr.us-gov-west-1.amazonaws.com"
        );
        assert_eq!(
            registry_host("123456789012", "cn-north-1"),
            "123456789012.dkr.ecr.cn-north-1.amazonaws.com.cn"
        );
    }

    #[test]
    fn test_destination_credentials_from_secret() {
        let creds = DestinationCredentials::from_secret(
            r#"{"accesskey": "AKIAEXAMPLE", "secretaccesskey": "s3cr3t", "region": "us-gov-west-1"}"#,
        )
        .unwrap();
        assert_eq!(creds.access_key_id, "AKIAEXAMPLE");
        assert!(!format!("{:?}", creds).contains("s3cr3t"));

        let sdk = creds.to_sdk_credentials();
        assert_eq!(sdk.access_key_id(), "AKIAEXAMPLE");
        assert_eq!(sdk.secret_access_key(), "s3cr3t");
    }

    #[test]
    fn test_destination_credentials_rejects_bad_secret() {
        assert!(DestinationCredentials::from_secret(r#"{"accesskey": "AKIA"}"#).is_err());
        assert!(DestinationCredentials::from_secret("not json").is_err());
        assert!(DestinationCredentials::from_secret(
            r#"{"accesskey": "", "secretaccesskey": "x"}"#
        )
        .is_err());
    }
}
