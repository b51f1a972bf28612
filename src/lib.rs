//! PaySentinel -- real-time payment telemetry and anomaly alerting.
//!
//! This crate provides the core library for transaction ingestion, bucketed
//! metric counters, rule-driven anomaly detection, incident lifecycle
//! management, and LLM-backed incident enrichment.

pub mod api;
pub mod config;
pub mod detect;
pub mod enrich;
pub mod ingest;
pub mod metrics;
pub mod rules;
pub mod storage;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::AppState;
use crate::config::Config;
use crate::detect::engine::Detector;
use crate::enrich::llm::LlmBackend;
use crate::enrich::Enricher;
use crate::ingest::Ingestor;
use crate::metrics::MemoryMetricStore;

/// Depth of the in-process ENRICHING queue. The detector re-fills it from the
/// store whenever it drains, so overflow only costs latency.
const ENRICH_QUEUE_DEPTH: usize = 256;

/// Shared startup: storage, metric store, and the detector holding its lease.
fn start_core(
    cfg: &Arc<Config>,
) -> Result<(
    storage::Pool,
    Arc<MemoryMetricStore>,
    mpsc::Receiver<Uuid>,
    Arc<Detector>,
)> {
    tracing::info!(db = %cfg.database_path, "initializing storage");
    let pool = storage::open_pool(&cfg.database_path).context("opening database")?;

    let store = Arc::new(MemoryMetricStore::new(cfg.bucket_ttl_seconds));
    let (enrich_tx, enrich_rx) = mpsc::channel(ENRICH_QUEUE_DEPTH);

    let detector = Arc::new(Detector::new(
        pool.clone(),
        store.clone(),
        cfg.clone(),
        enrich_tx,
    ));
    detector
        .acquire_startup_lease()
        .context("acquiring detector lease")?;

    Ok((pool, store, enrich_rx, detector))
}

/// Start the full daemon: ingest API, detector loop, and enricher pool.
/// Returns after a graceful shutdown (the token is cancelled).
pub async fn serve(cfg: Config, shutdown: CancellationToken) -> Result<()> {
    let cfg = Arc::new(cfg);
    let (pool, store, enrich_rx, detector) = start_core(&cfg)?;

    let backend = LlmBackend::from_config(&cfg)?;
    let enricher = Enricher::new(pool.clone(), backend, &cfg);
    let _workers = enricher.spawn(enrich_rx, shutdown.clone());
    tokio::spawn(detector.run(shutdown.clone()));

    let ingestor = Arc::new(Ingestor::new(
        pool.clone(),
        store.clone(),
        cfg.ingest_max_in_flight,
    ));
    let app = api::router(AppState::new(pool, store, ingestor));

    let addr: SocketAddr = cfg.bind_addr.parse().context("parsing bind address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("binding listener")?;
    tracing::info!(%addr, "paysentinel listening");

    axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        })
        .await
        .context("http server error")?;

    Ok(())
}

/// Detector-only entry point: evaluation loop and enricher, no ingest API.
pub async fn run_detector(cfg: Config, shutdown: CancellationToken) -> Result<()> {
    let cfg = Arc::new(cfg);
    let (pool, _store, enrich_rx, detector) = start_core(&cfg)?;

    let backend = LlmBackend::from_config(&cfg)?;
    let enricher = Enricher::new(pool, backend, &cfg);
    let _workers = enricher.spawn(enrich_rx, shutdown.clone());

    detector.run(shutdown.clone()).await;
    Ok(())
}
