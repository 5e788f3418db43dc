mod config;

use crate::config::{Config, ConfigError, LoggingConfig, MetricsConfig};
use clap::{Args, Parser, Subcommand};
use impressions::errors::BuildError;
use impressions::status::SyncStatusProvider;
use metrics_exporter_statsd::StatsdBuilder;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "flagsync", about = "Forwards SDK impressions to the events service")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the impression sync agent
    Run(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long, short)]
    config_file: PathBuf,
}

#[derive(thiserror::Error, Debug)]
enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error("could not set up metrics: {0}")]
    Metrics(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        CliCommand::Run(args) => {
            if let Err(err) = run(args) {
                eprintln!("flagsync failed: {err}");
                std::process::exit(1);
            }
        }
    }
}

fn run(args: RunArgs) -> Result<(), CliError> {
    let config = Config::from_file(&args.config_file)?;
    config.validate()?;

    let _sentry_guard = init_logging(&config.logging);
    if let Some(metrics_config) = &config.metrics {
        init_metrics(metrics_config)?;
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(run_async(config))
}

async fn run_async(config: Config) -> Result<(), CliError> {
    // This binary has no SDK-facing ingestion. Only a process embedding the
    // `impressions` crate pushes to the queue, so here passes pop nothing.
    let impressions::Impressions { task, .. } = impressions::build(&config.sync)?;
    let synchronizer = task.synchronizer().clone();
    let handle = task.spawn();

    let provider = Arc::new(SyncStatusProvider::new(synchronizer, handle.clone()));
    let admin = AdminService::<std::io::Error>::new(provider);
    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("received ctrl-c, shutting down");
    };

    let served = run_http_service(
        &config.admin_listener.host,
        config.admin_listener.port,
        admin,
        shutdown,
    )
    .await;

    handle.shutdown().await;
    served?;
    Ok(())
}

fn init_logging(config: &LoggingConfig) -> Option<sentry::ClientInitGuard> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let guard = config.sentry_dsn.as_deref().map(|dsn| {
        sentry::init((
            dsn,
            sentry::ClientOptions {
                release: sentry::release_name!(),
                ..Default::default()
            },
        ))
    });
    let sentry_layer = guard
        .as_ref()
        .map(|_| sentry::integrations::tracing::layer());

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(sentry_layer)
        .init();

    guard
}

fn init_metrics(config: &MetricsConfig) -> Result<(), CliError> {
    let recorder = StatsdBuilder::from(config.statsd_host.clone(), config.statsd_port)
        .build(Some(&config.prefix))
        .map_err(|e| CliError::Metrics(e.to_string()))?;
    metrics::set_global_recorder(recorder).map_err(|e| CliError::Metrics(e.to_string()))?;
    shared::metrics_defs::describe_all(impressions::metrics_defs::ALL_METRICS);

    tracing::info!(
        host = %config.statsd_host,
        port = config.statsd_port,
        "statsd metrics enabled"
    );
    Ok(())
}
