//! Prometheus `/metrics` exporter, behind the `metrics` cargo feature.
//! Tracing/OTLP export lives in `crate::daemon`; this module only counts.

use crate::config::MetricsConfig;

use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use prometheus::{Encoder as _, IntCounterVec, IntGaugeVec, Opts, Registry};
use tokio::sync::watch;

use std::net::SocketAddr;
use std::sync::LazyLock;

static METRICS: LazyLock<Metrics> = LazyLock::new(Metrics::new);

/// All Prometheus metric handles for the dispatchd process.
///
/// Access via `Metrics::global()`. Metric handles are cheap to clone (Arc
/// internally) so call sites can grab references without threading state.
pub struct Metrics {
    registry: Registry,

    /// Jobs promoted from QUEUED to IN_PROGRESS.
    /// Label: org_id.
    pub jobs_promoted_total: IntCounterVec,

    /// Processed messages reaching COMPLETED, split by whether the
    /// terminal frame was `result` or `error`.
    /// Labels: org_id, outcome ("result" | "error").
    pub messages_completed_total: IntCounterVec,

    /// Coordinator frames retransmitted by the retry sweep.
    /// Label: org_id.
    pub frame_retries_total: IntCounterVec,

    /// Coordinator frames dropped after exhausting `max_retries`.
    /// Label: org_id.
    pub frames_dropped_total: IntCounterVec,

    /// Jobs demoted back to QUEUED by agent disconnect or inactivity sweep.
    /// Label: org_id.
    pub jobs_demoted_total: IntCounterVec,

    /// Currently connected agents per org.
    /// Label: org_id.
    pub active_agents: IntGaugeVec,

    /// Currently open (non-Completed) jobs per org.
    /// Label: org_id.
    pub open_jobs: IntGaugeVec,
}

impl Metrics {
    fn new() -> Self {
        let registry = Registry::new();

        let jobs_promoted_total = IntCounterVec::new(
            Opts::new("dispatchd_jobs_promoted_total", "Jobs promoted from queued to in_progress"),
            &["org_id"],
        )
        .expect("hardcoded metric descriptor");

        let messages_completed_total = IntCounterVec::new(
            Opts::new("dispatchd_messages_completed_total", "Processed messages reaching completed"),
            &["org_id", "outcome"],
        )
        .expect("hardcoded metric descriptor");

        let frame_retries_total = IntCounterVec::new(
            Opts::new("dispatchd_frame_retries_total", "Coordinator frames retransmitted"),
            &["org_id"],
        )
        .expect("hardcoded metric descriptor");

        let frames_dropped_total = IntCounterVec::new(
            Opts::new("dispatchd_frames_dropped_total", "Coordinator frames dropped after exhausting retries"),
            &["org_id"],
        )
        .expect("hardcoded metric descriptor");

        let jobs_demoted_total = IntCounterVec::new(
            Opts::new("dispatchd_jobs_demoted_total", "Jobs demoted back to queued"),
            &["org_id"],
        )
        .expect("hardcoded metric descriptor");

        let active_agents = IntGaugeVec::new(
            Opts::new("dispatchd_active_agents", "Currently connected agents"),
            &["org_id"],
        )
        .expect("hardcoded metric descriptor");

        let open_jobs = IntGaugeVec::new(
            Opts::new("dispatchd_open_jobs", "Currently open (non-completed) jobs"),
            &["org_id"],
        )
        .expect("hardcoded metric descriptor");

        registry.register(Box::new(jobs_promoted_total.clone())).expect("hardcoded metric");
        registry.register(Box::new(messages_completed_total.clone())).expect("hardcoded metric");
        registry.register(Box::new(frame_retries_total.clone())).expect("hardcoded metric");
        registry.register(Box::new(frames_dropped_total.clone())).expect("hardcoded metric");
        registry.register(Box::new(jobs_demoted_total.clone())).expect("hardcoded metric");
        registry.register(Box::new(active_agents.clone())).expect("hardcoded metric");
        registry.register(Box::new(open_jobs.clone())).expect("hardcoded metric");

        Self {
            registry,
            jobs_promoted_total,
            messages_completed_total,
            frame_retries_total,
            frames_dropped_total,
            jobs_demoted_total,
            active_agents,
            open_jobs,
        }
    }

    /// Access the global metrics instance.
    pub fn global() -> &'static Self {
        &METRICS
    }
}

/// Spawn the metrics HTTP server as a background tokio task.
///
/// Returns the `JoinHandle` so the caller can hold it for lifetime management.
/// The server shuts down when `shutdown_rx` signals true.
pub async fn start_metrics_server(
    config: &MetricsConfig,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let raw_bind = config.bind.trim_start_matches('[').trim_end_matches(']');
    let bind_str = if raw_bind.contains(':') {
        format!("[{}]:{}", raw_bind, config.port)
    } else {
        format!("{}:{}", raw_bind, config.port)
    };
    let bind: SocketAddr = bind_str
        .parse()
        .map_err(|error| anyhow::anyhow!("invalid metrics bind address '{}': {}", bind_str, error))?;

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(health_handler));

    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .map_err(|error| anyhow::anyhow!("failed to bind metrics server to {}: {}", bind, error))?;

    tracing::info!(address = %bind, "metrics server started");

    let handle = tokio::spawn(async move {
        let mut shutdown_rx = shutdown_rx;
        let shutdown_signal = async move {
            let _ = shutdown_rx.wait_for(|shutdown| *shutdown).await;
        };

        if let Err(error) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
        {
            tracing::error!(%error, "metrics server failed");
        }
    });

    Ok(handle)
}

async fn metrics_handler() -> impl IntoResponse {
    let metrics = Metrics::global();
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();

    match encoder.encode(&metrics.registry.gather(), &mut buffer) {
        Ok(()) => match String::from_utf8(buffer) {
            Ok(text) => (
                StatusCode::OK,
                [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
                text,
            )
                .into_response(),
            Err(error) => {
                tracing::warn!(%error, "metrics encoding produced invalid UTF-8");
                StatusCode::INTERNAL_SERVER_ERROR.into_response()
            }
        },
        Err(error) => {
            tracing::warn!(%error, "failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn health_handler() -> impl IntoResponse {
    StatusCode::OK
}
