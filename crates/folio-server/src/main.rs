use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::{Parser, ValueEnum};
use folio_api::{AppState, api_router};
use folio_common::FolioError;
use folio_jobs::{
    Dispatcher, DocumentPageSource, EventStreamManager, FallbackDispatcher, FileBackend,
    FsPageSource, HttpTranscriber, InProcessDispatcher, JobRegistry, JobRunner, JobStore, PageProcessor,
    PageTranscriber, QueueDispatcher, RetryPolicy, RunnerConfig, WorkQueue,
    config::DEFAULT_WINDOW_SIZE,
    queue::{DEFAULT_DELIVERY_LIMIT, DEFAULT_QUEUE_CAPACITY},
    fail_exhausted, recover_unfinished, start_queue_workers,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_TRANSCRIBER_ENDPOINT: &str = "http://127.0.0.1:8001/transcribe";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DispatchMode {
    /// Run jobs as tasks of this process.
    InProcess,
    /// Run jobs from a durable on-disk queue.
    Queue,
}

#[derive(Parser)]
#[command(name = "folio", about = "Document page transcription job server")]
struct Cli {
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value = "8000")]
    port: u16,

    #[arg(long, default_value = "./data")]
    data_dir: String,

    #[arg(long, default_value = "./documents")]
    documents_dir: String,

    /// Overrides FOLIO_TRANSCRIBER_ENDPOINT.
    #[arg(long)]
    transcriber_endpoint: Option<String>,

    #[arg(long, default_value = "120")]
    transcriber_timeout_secs: u64,

    /// Overrides FOLIO_WINDOW_SIZE.
    #[arg(long)]
    window_size: Option<u32>,

    #[arg(long, default_value = "3")]
    max_retries: u32,

    #[arg(long, default_value = "1500")]
    retry_base_delay_ms: u64,

    #[arg(long, default_value = "300")]
    stream_timeout_secs: u64,

    #[arg(long, value_enum, default_value_t = DispatchMode::InProcess)]
    dispatch: DispatchMode,

    #[arg(long, default_value = "2")]
    queue_workers: usize,

    #[arg(long, default_value = "30")]
    shutdown_grace_secs: u64,

    #[arg(long, default_value_t = false)]
    log_json: bool,
}

fn transcriber_endpoint(cli: &Cli) -> String {
    cli.transcriber_endpoint
        .clone()
        .or_else(|| std::env::var("FOLIO_TRANSCRIBER_ENDPOINT").ok())
        .map(|endpoint| endpoint.trim().to_string())
        .filter(|endpoint| !endpoint.is_empty())
        .unwrap_or_else(|| DEFAULT_TRANSCRIBER_ENDPOINT.to_string())
}

fn window_size(cli: &Cli) -> Result<u32, FolioError> {
    if let Some(size) = cli.window_size {
        return Ok(size);
    }
    match std::env::var("FOLIO_WINDOW_SIZE") {
        Ok(value) => value.trim().parse().map_err(|_| {
            FolioError::InvalidArgument(format!("FOLIO_WINDOW_SIZE must be a number, got {value:?}"))
        }),
        Err(_) => Ok(DEFAULT_WINDOW_SIZE),
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let env_filter = EnvFilter::from_default_env().add_directive("folio=info".parse()?);
    let subscriber = tracing_subscriber::fmt().with_env_filter(env_filter);
    if cli.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    let addr = format!("{}:{}", cli.host, cli.port);
    let data_dir = PathBuf::from(&cli.data_dir);
    tokio::fs::create_dir_all(&data_dir).await?;

    let config = RunnerConfig {
        window_size: window_size(&cli)?,
        retry: RetryPolicy::new(
            cli.max_retries,
            Duration::from_millis(cli.retry_base_delay_ms),
        ),
        stream_timeout: Duration::from_secs(cli.stream_timeout_secs),
        ..RunnerConfig::default()
    };
    config.validate()?;

    let store = JobStore::new(Arc::new(FileBackend::new(data_dir.join("store")).await?));
    let source: Arc<dyn DocumentPageSource> = Arc::new(FsPageSource::new(&cli.documents_dir));
    let http_transcriber = HttpTranscriber::new(
        transcriber_endpoint(&cli),
        Duration::from_secs(cli.transcriber_timeout_secs),
        Arc::clone(&source),
    )?;
    info!(
        endpoint = %http_transcriber.endpoint(),
        window_size = config.window_size,
        max_retries = config.retry.max_attempts,
        "transcriber configured"
    );
    let transcriber: Arc<dyn PageTranscriber> = Arc::new(http_transcriber);

    let events = EventStreamManager::new();
    let runner = Arc::new(JobRunner::new(
        store.clone(),
        source,
        PageProcessor::new(transcriber, config.retry),
        events.clone(),
        config.clone(),
    ));
    let registry = JobRegistry::new();

    let (dispatcher, workers): (Arc<dyn Dispatcher>, Vec<JoinHandle<()>>) = match cli.dispatch {
        DispatchMode::InProcess => {
            let dispatcher: Arc<dyn Dispatcher> = Arc::new(InProcessDispatcher::new(
                Arc::clone(&runner),
                registry.clone(),
            ));
            recover_unfinished(&store, dispatcher.as_ref()).await?;
            (dispatcher, Vec::new())
        }
        DispatchMode::Queue => {
            let queue = Arc::new(
                WorkQueue::load_or_new(
                    data_dir.join("queue"),
                    DEFAULT_QUEUE_CAPACITY,
                    DEFAULT_DELIVERY_LIMIT,
                )
                .await?,
            );
            fail_exhausted(&queue, &runner).await;
            let workers = start_queue_workers(
                Arc::clone(&queue),
                Arc::clone(&runner),
                registry.clone(),
                cli.queue_workers,
            );
            info!(workers = workers.len(), "queue workers started");
            let dispatcher: Arc<dyn Dispatcher> = Arc::new(FallbackDispatcher::new(
                Arc::new(QueueDispatcher::new(queue)),
                Arc::new(InProcessDispatcher::new(
                    Arc::clone(&runner),
                    registry.clone(),
                )),
            ));
            (dispatcher, workers)
        }
    };

    let state = Arc::new(AppState::new(store, dispatcher, events, config.stream_timeout));
    let app = api_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("folio server listening on {addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    for worker in workers {
        worker.abort();
    }
    let aborted = registry
        .shutdown(Duration::from_secs(cli.shutdown_grace_secs))
        .await;
    if aborted > 0 {
        warn!(aborted, "jobs aborted at shutdown; they resume on next start");
    }
    info!("folio server stopped");

    Ok(())
}
