//! csvpipe ingest - S3 notification to Kafka CSV pipeline

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use csvpipe_common::logging::{init_logging, LogConfig, LogLevel};
use csvpipe_common::signal::wait_for_termination;
use csvpipe_ingest::clients::{load_aws_config, KafkaTransport, S3Store, SqsFeed};
use csvpipe_ingest::config::IngestArgs;
use csvpipe_ingest::pipeline::{Collaborators, Pipeline};
use csvpipe_ingest::shutdown::create_shutdown_channel;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "csvpipe-ingest")]
#[command(author, version, about = "Publish CSV rows from S3 notifications to Kafka")]
struct Cli {
    #[command(flatten)]
    ingest: IngestArgs,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            // Logging may not be up yet.
            eprintln!("csvpipe-ingest: {e:#}");
            error!(error = %format!("{e:#}"), "startup failed");
            1
        },
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };
    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("csvpipe-ingest".to_string())
        .build();
    let log_config = LogConfig::from_env_with(log_config).context("invalid logging configuration")?;
    let _log_guard = init_logging(&log_config)?;

    let config = cli
        .ingest
        .pipeline_config()
        .context("invalid pipeline configuration")?;
    let kafka = cli
        .ingest
        .kafka_settings()
        .context("invalid Kafka configuration")?;

    info!(queue = %config.queue, value_topic = %config.value_topic, error_topic = %config.error_topic, "starting");

    let aws = load_aws_config(&cli.ingest.aws_settings()).await;
    let feed = SqsFeed::connect(&aws, &config.queue, config.wait_time_secs)
        .await
        .context("failed to connect to the notification queue")?;
    let transport = Arc::new(KafkaTransport::new(&kafka).context("failed to create Kafka producer")?);

    let collaborators = Collaborators {
        feed: Arc::new(feed),
        store: Arc::new(S3Store::new(&aws)),
        values: transport.clone(),
        errors: transport,
    };

    let (shutdown, _) = create_shutdown_channel();
    let pipeline = Pipeline::spawn(&config, collaborators, shutdown.clone())?;

    let signals = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            let signal = wait_for_termination().await;
            info!(?signal, "shutting down");
            shutdown.shutdown();
        }
    });

    let summary = pipeline.run().await;
    signals.abort();

    info!(
        run_id = %summary.run_id,
        rows = summary.sink.rows_written,
        files = summary.decode.files,
        acks = summary.sink.acks,
        errors = summary.recoverable + summary.file_fatal + summary.fatal,
        "ingest complete"
    );
    Ok(summary.exit_code())
}
