use anyhow::{anyhow, Context, Result};
use aws_config::{BehaviorVersion, SdkConfig};
use aws_lambda_events::eventbridge::EventBridgeEvent;
use aws_lambda_events::sqs::SqsEvent;
use clap::{Parser, Subcommand};
use lambda_runtime::{service_fn, LambdaEvent};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::filter::LevelFilter;

mod aws;
mod events;
mod handlers;
mod launcher;
mod logging;
mod queue;
mod records;
mod registry;
mod replicator;
mod settings;
mod worker;

#[cfg(test)]
mod testing;

use events::ImageEventDetail;
use handlers::HandlerKind;
use launcher::Deadline;
use queue::{ImageQueue, SqsImageQueue};
use records::{DynamoRecordsTable, RecordsStore};
use settings::{require, Settings};

#[derive(Parser, Debug)]
#[command(author, version, about = "Replicate ECR images across AWS partitions", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as a Lambda function
    Lambda {
        /// Handler to serve: event_handler or queue_handler
        #[arg(long, env = "_HANDLER")]
        handler: Option<String>,
    },
    /// Replicate a stored batch of image events (runs in the worker)
    Replicate {
        /// Enable debug logging
        #[arg(long, short)]
        debug: bool,
        /// DynamoDB records item to process
        #[arg(env = "RECORDS_ID")]
        records_id: String,
    },
    /// Load the configuration from the environment and report what it can run
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::from_env().context("Invalid configuration")?;

    let level = match &cli.command {
        Commands::Replicate { debug: true, .. } => LevelFilter::DEBUG,
        _ => logging::level_from_name(&settings.logging_level),
    };
    logging::init(level)?;

    match cli.command {
        Commands::Lambda { handler } => {
            let kind: HandlerKind = handler
                .context("No handler given; use --handler or set _HANDLER")?
                .parse()?;
            run_lambda(&settings, kind).await
        }
        Commands::Replicate { records_id, .. } => {
            worker::run_worker(&settings, &records_id).await.map_err(|e| {
                error!("[{}] Replication failed: {:#}", records_id, e);
                e
            })
        }
        Commands::CheckConfig => check_config(&settings),
    }
}

fn lambda_error(e: anyhow::Error) -> lambda_runtime::Error {
    error!("{:#}", e);
    e.into()
}

async fn run_lambda(settings: &Settings, kind: HandlerKind) -> Result<()> {
    let sdk_config = aws::load_sdk_config(None, None).await;
    info!("Starting {}", kind);

    let result = match kind {
        HandlerKind::Event => {
            let queue_url = require("IMAGES_QUEUE", &settings.images_queue)?;
            let queue: Arc<dyn ImageQueue> = Arc::new(SqsImageQueue::new(
                aws_sdk_sqs::Client::new(&sdk_config),
                queue_url,
            ));

            lambda_runtime::run(service_fn(
                move |event: LambdaEvent<EventBridgeEvent<ImageEventDetail>>| {
                    let queue = queue.clone();
                    async move {
                        handlers::event_handler(queue.as_ref(), event.payload)
                            .await
                            .map_err(lambda_error)
                    }
                },
            ))
            .await
        }
        HandlerKind::Queue => {
            let store = queue_handler_store(settings, &sdk_config)?;
            let launcher = launcher::from_settings(settings, &sdk_config)?;

            lambda_runtime::run(service_fn(move |event: LambdaEvent<SqsEvent>| {
                let store = store.clone();
                let launcher = launcher.clone();
                async move {
                    let deadline = Deadline::from_epoch_millis(event.context.deadline);
                    handlers::queue_handler(&store, launcher.as_ref(), event.payload, &deadline)
                        .await
                        .map_err(lambda_error)
                }
            }))
            .await
        }
    };

    result.map_err(|e| anyhow!("Lambda runtime failed: {:?}", e))
}

fn queue_handler_store(settings: &Settings, sdk_config: &SdkConfig) -> Result<RecordsStore> {
    require("IMAGES_QUEUE", &settings.images_queue)?;
    let table_name = require("RECORDS_TABLE", &settings.records_table)?;
    let table = DynamoRecordsTable::new(aws_sdk_dynamodb::Client::new(sdk_config), table_name);
    Ok(RecordsStore::new(
        Arc::new(table),
        settings.records_ttl,
        settings.results_ttl,
    ))
}

fn check_worker(settings: &Settings) -> Result<()> {
    require("DEST_REPO_REGION", &settings.dest_repo_region)?;
    require("DEST_SECRET", &settings.dest_secret)?;
    require("RECORDS_TABLE", &settings.records_table)?;
    Ok(())
}

fn check_config(settings: &Settings) -> Result<()> {
    println!("{:#?}", settings);
    println!();

    // Clients are built but never called
    let sdk_config = SdkConfig::builder()
        .behavior_version(BehaviorVersion::latest())
        .build();

    let checks = [
        (
            HandlerKind::Event.as_str(),
            require("IMAGES_QUEUE", &settings.images_queue).map(|_| ()),
        ),
        (
            HandlerKind::Queue.as_str(),
            queue_handler_store(settings, &sdk_config)
                .and_then(|_| launcher::from_settings(settings, &sdk_config))
                .map(|_| ()),
        ),
        ("replicate", check_worker(settings)),
    ];

    for (name, result) in &checks {
        match result {
            Ok(()) => println!("{:<14} ok", name),
            Err(e) => println!("{:<14} {}", name, e),
        }
    }

    if checks.iter().all(|(_, result)| result.is_err()) {
        anyhow::bail!("Configuration can't run any entry point");
    }
    Ok(())
}
