use std::env;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Map a log level name (as used by `LOGGING_LEVEL`) to a level filter
///
/// Unknown names fall back to INFO.
pub fn level_from_name(name: &str) -> LevelFilter {
    match name.trim().to_uppercase().as_str() {
        "TRACE" => LevelFilter::TRACE,
        "DEBUG" => LevelFilter::DEBUG,
        "INFO" => LevelFilter::INFO,
        "WARN" | "WARNING" => LevelFilter::WARN,
        "ERROR" | "CRITICAL" | "FATAL" => LevelFilter::ERROR,
        "OFF" | "NONE" => LevelFilter::OFF,
        _ => LevelFilter::INFO,
    }
}

/// Initialize tracing for all commands
///
/// `RUST_LOG` wins when set; otherwise `level` is applied. Under Lambda the
/// output drops timestamps and colours (CloudWatch adds its own) and switches
/// to JSON when the function is configured with the JSON log format.
pub fn init(level: LevelFilter) -> anyhow::Result<()> {
    let filter = match env::var("RUST_LOG") {
        Ok(directives) if !directives.is_empty() => EnvFilter::new(directives),
        _ => EnvFilter::default()
            .add_directive(level.into())
            // The SDK and hyper are chatty at debug
            .add_directive("aws_smithy_runtime=warn".parse()?)
            .add_directive("aws_config=warn".parse()?)
            .add_directive("hyper=warn".parse()?),
    };

    let in_lambda = env::var("AWS_LAMBDA_FUNCTION_NAME").is_ok();
    let is_json = env::var("AWS_LAMBDA_LOG_FORMAT")
        .unwrap_or_default()
        .eq_ignore_ascii_case("JSON");

    let registry = tracing_subscriber::registry().with(filter);

    if is_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .without_time(),
            )
            .try_init()?;
    } else if in_lambda {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .without_time()
                    .with_ansi(false),
            )
            .try_init()?;
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()?;
    }

    Ok(())
}
