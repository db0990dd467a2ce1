use clap::{Args, Parser, Subcommand, ValueEnum};
use ingest::config::{Config, ConfigError, LoggingConfig, MetricsConfig, ValidationError};
use ingest::producer::{IngestRequest, Producer, PublishError};
use ingest::{IngestError, broker::BrokerError};
use metrics_exporter_statsd::StatsdBuilder;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

#[derive(Parser)]
#[command(name = "gateway", about = "Telemetry ingestion gateway")]
struct Cli {
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the consumers and the admin listener until interrupted
    Run(ConfigArgs),
    /// Create the database schema and exit
    Migrate(ConfigArgs),
    /// Load and validate the config file
    CheckConfig(ConfigArgs),
    /// Publish a request body read from a file
    Send(SendArgs),
}

#[derive(Args)]
struct ConfigArgs {
    #[arg(long, short, default_value = "ingest.yaml")]
    config: PathBuf,
}

#[derive(Args)]
struct SendArgs {
    #[command(flatten)]
    config: ConfigArgs,
    #[arg(long)]
    project: String,
    #[arg(long, value_enum)]
    kind: SendKind,
    /// File holding the request body
    body: PathBuf,
}

#[derive(Clone, Copy, ValueEnum)]
enum SendKind {
    Event,
    Envelope,
    Logs,
    Track,
}

#[derive(thiserror::Error, Debug)]
enum GatewayError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid config: {0}")]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Publish(#[from] PublishError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid log filter: {0}")]
    LogFilter(#[from] tracing_subscriber::filter::ParseError),
    #[error("could not install logger: {0}")]
    Logger(#[from] tracing_subscriber::util::TryInitError),
    #[error("could not build statsd exporter: {0}")]
    Statsd(#[from] metrics_exporter_statsd::StatsdError),
    #[error("a metrics recorder is already installed")]
    MetricsRecorder,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match run_cli(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "gateway failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_cli(cli: Cli) -> Result<(), GatewayError> {
    let args = match &cli.command {
        CliCommand::Run(args) | CliCommand::Migrate(args) | CliCommand::CheckConfig(args) => args,
        CliCommand::Send(send) => &send.config,
    };
    let config = Config::from_file(&args.config)?;
    config.validate()?;

    if let CliCommand::CheckConfig(_) = cli.command {
        println!("config ok: {config}");
        return Ok(());
    }

    let _sentry = init_logging(&config.logging)?;
    if let Some(metrics) = &config.metrics {
        init_metrics(metrics)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let shutdown = CancellationToken::new();
        tokio::spawn(cancel_on_signal(shutdown.clone()));

        match cli.command {
            CliCommand::Run(_) => ingest::run(config, shutdown).await?,
            CliCommand::Migrate(_) => ingest::migrate(&config, &shutdown).await?,
            CliCommand::Send(send) => send_body(&config, &send, &shutdown).await?,
            CliCommand::CheckConfig(_) => {}
        }
        Ok::<_, GatewayError>(())
    })
}

/// Installs the subscriber. `RUST_LOG` overrides the configured level.
fn init_logging(config: &LoggingConfig) -> Result<Option<sentry::ClientInitGuard>, GatewayError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level)?,
    };

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
        .try_init()?;
    Ok(guard)
}

fn init_metrics(config: &MetricsConfig) -> Result<(), GatewayError> {
    let recorder = StatsdBuilder::from(config.statsd_host.clone(), config.statsd_port)
        .build(Some("ingest"))?;
    metrics::set_global_recorder(recorder).map_err(|_| GatewayError::MetricsRecorder)?;
    shared::metrics_defs::describe_all(ingest::metrics_defs::ALL_METRICS);
    tracing::info!(
        host = %config.statsd_host,
        port = config.statsd_port,
        "statsd exporter installed"
    );
    Ok(())
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "could not listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("shutdown signal received");
    shutdown.cancel();
}

async fn send_body(
    config: &Config,
    args: &SendArgs,
    shutdown: &CancellationToken,
) -> Result<(), GatewayError> {
    let body = tokio::fs::read(&args.body).await?;
    let broker = ingest::connect_broker(config, shutdown).await?;
    let consumers = &config.consumers;
    let topic = match args.kind {
        SendKind::Event | SendKind::Envelope => &consumers.events.topic,
        SendKind::Logs | SendKind::Track => &consumers.logs.topic,
    };
    broker.ensure_topic(topic).await?;

    let producer =
        Producer::with_topics(broker, &consumers.events.topic, &consumers.logs.topic);
    let request = IngestRequest::new(args.project.clone());
    match args.kind {
        SendKind::Event => {
            let id = producer.publish_event(&request, &body).await?;
            println!("published event {id}");
        }
        SendKind::Envelope => {
            let id = producer.publish_envelope(&request, &body).await?;
            println!("published event {id}");
        }
        SendKind::Logs => {
            let count = producer.publish_logs(&request, &body).await?;
            println!("published {count} logs");
        }
        SendKind::Track => {
            let count = producer.publish_track(&request, &body).await?;
            println!("published {count} track events");
        }
    }
    Ok(())
}
