use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_ecr::config::Credentials;
use aws_sdk_ecr::error::ProvideErrorMetadata;

/// Extract a readable message from an AWS SDK error
///
/// Service errors carry an error code and message; everything else (dispatch
/// failures, timeouts) only has a verbose Debug representation, which is
/// truncated.
pub fn format_sdk_error<E>(err: &E) -> String
where
    E: ProvideErrorMetadata + std::fmt::Debug,
{
    match (err.code(), err.message()) {
        (Some(code), Some(message)) => format!("{}: {}", code, message),
        (None, Some(message)) => message.to_string(),
        (Some(code), None) => code.to_string(),
        (None, None) => {
            let debug_str = format!("{:?}", err);
            if debug_str.chars().count() > 200 {
                format!("{}...", debug_str.chars().take(200).collect::<String>())
            } else {
                debug_str
            }
        }
    }
}

/// Load an AWS SDK config
///
/// Without a region the default provider chain picks one; without static
/// credentials the default credential chain is used (Lambda/CodeBuild/ECS
/// role, env vars, ...).
pub async fn load_sdk_config(region: Option<&str>, credentials: Option<Credentials>) -> SdkConfig {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = region {
        loader = loader.region(aws_config::Region::new(region.to_string()));
    }
    if let Some(credentials) = credentials {
        loader = loader.credentials_provider(credentials);
    }
    loader.load().await
}
