//! `DocVerify` Daemon
//!
//! Runs the verification pipeline over one or more applicant folders as a
//! single batch, streaming progress events to stdout as JSON lines.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tokio_stream::{Stream, StreamExt, StreamMap};
use tracing::{debug, info, warn};

use docverify_core::config::{self, BrokerKind, Config};
use docverify_daemon::orchestration::LocalJobQueue;
use docverify_daemon::pipeline::MasterPipeline;
use docverify_daemon::pipeline::scan::supported_extension;
use docverify_daemon::progress::{DbBroker, LocalBroker, ProgressBroker, ProgressEvent};
use docverify_daemon::service::VerificationService;
use docverify_daemon::session::Session;
use docverify_daemon::storage::Database;

#[derive(Parser, Debug)]
#[command(name = "docverify-daemon")]
#[command(version, about = "DocVerify daemon - applicant document verification runner")]
struct Args {
    /// Applicant folders; each becomes one session of the batch
    #[arg(required = true)]
    folders: Vec<PathBuf>,

    /// Directory searched for `.docverify/settings.json` (defaults to the working directory)
    #[arg(long, env = "DOCVERIFY_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Database file path
    #[arg(long, env = "DOCVERIFY_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Root directory for per-session uploads
    #[arg(long, env = "DOCVERIFY_SESSIONS_DIR")]
    sessions_dir: Option<PathBuf>,

    /// Maximum concurrently executing pipelines
    #[arg(long, env = "DOCVERIFY_MAX_PIPELINES")]
    max_pipelines: Option<usize>,

    /// Run agents in parallel instead of one after another
    #[arg(long)]
    parallel: bool,

    /// Remove sessions older than the configured TTL before starting
    #[arg(long)]
    cleanup: bool,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, env = "DOCVERIFY_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "DOCVERIFY_LOG_JSON")]
    log_json: bool,

    /// OpenTelemetry OTLP endpoint for traces and metrics export
    /// (e.g. `http://localhost:4317`). Requires the `metrics` feature.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "DOCVERIFY_METRICS_ENDPOINT")]
    metrics_endpoint: Option<String>,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(path) = &self.db_path {
            config.daemon.database_path = Some(path.clone());
        }
        if let Some(dir) = &self.sessions_dir {
            config.daemon.sessions_dir = Some(dir.clone());
        }
        if let Some(n) = self.max_pipelines {
            config.daemon.max_concurrent_pipelines = n;
        }
        if self.parallel {
            config.pipeline.parallel_dispatch = true;
        }
        if let Some(level) = &self.log_level {
            config.daemon.log_level.clone_from(level);
        }
    }
}

/// One stdout line per progress event.
#[derive(Serialize)]
struct EventLine<'a> {
    session_id: &'a str,
    folder: &'a str,
    #[serde(flatten)]
    event: &'a ProgressEvent,
}

/// Final line per session.
#[derive(Serialize)]
struct SummaryLine<'a> {
    session_id: &'a str,
    folder: &'a str,
    status: &'a str,
    error_message: Option<&'a str>,
    applicant_name: Option<String>,
}

struct Applicant {
    session_id: String,
    folder: String,
}

type EventStream = Pin<Box<dyn Stream<Item = ProgressEvent> + Send>>;

#[tokio::main]
#[allow(clippy::too_many_lines)]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let project_dir = match &args.project_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()?,
    };
    let mut config = config::load_config(Some(&project_dir))?;
    args.apply(&mut config);

    #[cfg(feature = "metrics")]
    let metrics_endpoint = args.metrics_endpoint.as_deref();
    #[cfg(not(feature = "metrics"))]
    let metrics_endpoint: Option<&str> = None;

    // Hold the guard so the OTel pipeline stays alive for the process lifetime.
    let log_filter = format!(
        "docverify_daemon={level},docverify_core={level}",
        level = config.daemon.log_level
    );
    let telemetry = docverify_core::tracing_init::init_tracing_with_metrics(
        &log_filter,
        args.log_json,
        metrics_endpoint,
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        folders = args.folders.len(),
        max_pipelines = config.daemon.max_concurrent_pipelines,
        parallel = config.pipeline.parallel_dispatch,
        broker = ?config.progress.broker,
        "Starting docverify-daemon"
    );

    for folder in &args.folders {
        anyhow::ensure!(folder.is_dir(), "Not a directory: {}", folder.display());
    }

    let db_path = match &config.daemon.database_path {
        Some(path) => path.clone(),
        None => default_data_dir()?.join("docverify.db"),
    };
    info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).await?;

    let sessions_root = match &config.daemon.sessions_dir {
        Some(dir) => dir.clone(),
        None => default_data_dir()?.join("sessions"),
    };
    tokio::fs::create_dir_all(&sessions_root)
        .await
        .with_context(|| format!("Cannot create sessions directory {}", sessions_root.display()))?;

    let broker: Arc<dyn ProgressBroker> = match config.progress.broker {
        BrokerKind::Local => Arc::new(LocalBroker::new()),
        BrokerKind::Database => Arc::new(DbBroker::new(
            db.clone(),
            Duration::from_millis(config.progress.broker_poll_interval_ms.max(1)),
        )),
    };
    let pipeline = MasterPipeline::from_config(&config)?;
    let service = VerificationService::new(
        db,
        broker,
        Arc::new(LocalJobQueue::new()),
        Arc::new(pipeline),
        &config,
        sessions_root,
    );

    let recovered = service.recover_interrupted().await?;
    if recovered > 0 {
        warn!(count = recovered, "Sessions from an earlier run marked failed");
    }
    if args.cleanup {
        let ttl = Duration::from_secs(config.daemon.session_ttl_hours.saturating_mul(3600));
        service.cleanup_expired(ttl).await?;
    }

    let batch_id = uuid::Uuid::new_v4().to_string();
    let mut applicants = Vec::with_capacity(args.folders.len());
    let mut streams: StreamMap<String, EventStream> = StreamMap::new();

    for folder in &args.folders {
        let session = service.create_session(Some(&batch_id)).await?;
        let copied = stage_folder(folder, &service.upload_dir(&session.id)).await?;
        service.begin_upload(&session.id, copied).await?;

        // Subscribe before starting so no update is missed.
        let subscription = service.subscribe(&session.id).await?;
        streams.insert(session.id.clone(), Box::pin(subscription.into_stream()));
        service.start(&session.id).await?;

        info!(session_id = %session.id, folder = %folder.display(), files = copied, "Session started");
        applicants.push(Applicant {
            session_id: session.id,
            folder: folder.display().to_string(),
        });
    }

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut cancelling = false;

    loop {
        tokio::select! {
            item = streams.next() => {
                let Some((session_id, event)) = item else { break };
                let folder = applicants
                    .iter()
                    .find(|a| a.session_id == session_id)
                    .map_or("", |a| a.folder.as_str());
                emit(&EventLine { session_id: &session_id, folder, event: &event })?;
            }
            () = &mut shutdown, if !cancelling => {
                cancelling = true;
                for applicant in &applicants {
                    match service.cancel(&applicant.session_id).await {
                        Ok(outcome) => debug!(session_id = %applicant.session_id, ?outcome, "Cancel requested"),
                        Err(e) => warn!(session_id = %applicant.session_id, error = %e, "Cancel failed"),
                    }
                }
            }
        }
    }

    for applicant in &applicants {
        let session: Session = service.get(&applicant.session_id).await?;
        let applicant_name = service
            .result(&applicant.session_id)
            .await?
            .and_then(|r| r.applicant_name);
        emit(&SummaryLine {
            session_id: &session.id,
            folder: &applicant.folder,
            status: session.status.as_str(),
            error_message: session.error_message.as_deref(),
            applicant_name,
        })?;
    }

    let batch = service.batch_status(&batch_id).await?;
    info!(
        batch_id = %batch.batch_id,
        state = ?batch.state,
        completed = batch.counts.completed,
        failed = batch.counts.failed,
        "Batch finished"
    );

    telemetry.shutdown();
    Ok(())
}

fn emit<T: Serialize>(line: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string(line)?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{json}")?;
    stdout.flush()?;
    Ok(())
}

/// Copy the supported documents of `folder` into `dest`; returns how many were copied.
async fn stage_folder(folder: &Path, dest: &Path) -> anyhow::Result<u64> {
    let mut entries = tokio::fs::read_dir(folder)
        .await
        .with_context(|| format!("Cannot read {}", folder.display()))?;
    let mut copied = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() || supported_extension(&path).is_none() {
            debug!(path = %path.display(), "Skipping unsupported entry");
            continue;
        }
        tokio::fs::copy(&path, dest.join(entry.file_name()))
            .await
            .with_context(|| format!("Cannot copy {}", path.display()))?;
        copied += 1;
    }
    Ok(copied)
}

/// Default data directory: the platform config dir, else `~/.docverify`.
fn default_data_dir() -> anyhow::Result<PathBuf> {
    if let Some(path) = config::database_path().and_then(|p| p.parent().map(Path::to_path_buf)) {
        return Ok(path);
    }
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".docverify"))
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, cancelling active jobs"),
                    _ = sigterm.recv() => info!("Received SIGTERM, cancelling active jobs"),
                }
            }
            Err(e) => {
                warn!(error = %e, "Cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received Ctrl+C, cancelling active jobs");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, cancelling active jobs");
    }
}
