use axum::{
    Json, Router,
    body::Bytes,
    extract::{FromRequest, Query, Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use clap::Parser;
use once_cell::sync::Lazy;
use prometheus::{Counter, Encoder, Histogram, IntGauge, TextEncoder};
use safeauto_core::assignment::ExperimentConfig;
use safeauto_core::error::StoreError;
use safeauto_core::evidence::{EvidenceSource, HttpEvidenceSource};
use safeauto_core::{
    Action, DecisionOrchestrator, DecisionRequest, DecisionResponse, DecisionStore, EngineConfig,
    EngineError, InMemoryStore, Outcome,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

// --- 1. Metrics ---

pub static DECISIONS_TOTAL: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new("safeauto_decisions_total", "Total decisions made").unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static AUTOMATE_TOTAL: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new("safeauto_automate_total", "Decisions with action AUTOMATE").unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static ESCALATE_TOTAL: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new("safeauto_escalate_total", "Decisions with action ESCALATE").unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static SHADOW_TOTAL: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new("safeauto_shadow_decisions_total", "Decisions made in shadow mode").unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static OUTCOMES_TOTAL: Lazy<Counter> = Lazy::new(|| {
    let c = Counter::new("safeauto_outcomes_total", "Outcomes recorded").unwrap();
    prometheus::register(Box::new(c.clone())).unwrap();
    c
});

pub static DROPPED_WRITES: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("safeauto_dropped_writes", "Records dropped by the persistence writer").unwrap();
    prometheus::register(Box::new(g.clone())).unwrap();
    g
});

pub static CRITIC_OBSERVATIONS: Lazy<IntGauge> = Lazy::new(|| {
    let g = IntGauge::new("safeauto_critic_observations", "Outcomes absorbed by the critic").unwrap();
    prometheus::register(Box::new(g.clone())).unwrap();
    g
});

pub static DECISION_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "safeauto_decision_duration_seconds",
        "Histogram of decision latency",
    ))
    .unwrap();
    prometheus::register(Box::new(h.clone())).unwrap();
    h
});

// --- 2. CLI ---

#[derive(Parser, Debug)]
#[command(name = "gatekeeper", about = "Safe automation decision service")]
struct Args {
    /// Engine configuration (JSON); defaults apply when omitted
    #[arg(long)]
    config: Option<String>,

    #[arg(long, default_value = "0.0.0.0:3000")]
    listen: String,

    /// Force shadow mode regardless of configuration
    #[arg(long)]
    shadow: bool,

    /// Detector endpoint as `id=url`; repeatable
    #[arg(long = "detector")]
    detectors: Vec<String>,
}

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<DecisionOrchestrator>,
    store: Arc<dyn DecisionStore>,
}

// --- 3. SIMD-JSON Extractor ---

struct SimdJson<T>(T);

impl<S, T> FromRequest<S> for SimdJson<T>
where
    T: for<'de> Deserialize<'de>,
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state).await.map_err(|e| e.into_response())?;
        let mut bytes_vec = bytes.to_vec();

        let val = simd_json::from_slice::<T>(&mut bytes_vec)
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid JSON: {e}")).into_response())?;

        Ok(SimdJson(val))
    }
}

// --- 4. Handlers ---

async fn decide(State(state): State<AppState>, SimdJson(request): SimdJson<DecisionRequest>) -> Json<DecisionResponse> {
    let timer = DECISION_LATENCY.start_timer();
    let decision = state.orchestrator.decide(&request).await;
    timer.observe_duration();

    DECISIONS_TOTAL.inc();
    match decision.action {
        Action::Automate => AUTOMATE_TOTAL.inc(),
        Action::Escalate => ESCALATE_TOTAL.inc(),
    }
    if decision.shadow {
        SHADOW_TOTAL.inc();
    }

    Json(DecisionResponse::from(&decision))
}

async fn outcome(State(state): State<AppState>, SimdJson(outcome): SimdJson<Outcome>) -> Response {
    match state.orchestrator.record_outcome(outcome).await {
        Ok(receipt) => {
            OUTCOMES_TOTAL.inc();
            Json(receipt).into_response()
        }
        Err(EngineError::Store(StoreError::NotFound(what))) => (StatusCode::NOT_FOUND, what).into_response(),
        Err(EngineError::Store(StoreError::Duplicate(what))) => {
            (StatusCode::CONFLICT, format!("outcome already recorded for {what}")).into_response()
        }
        Err(e) => {
            warn!(error = %e, "Outcome rejected");
            (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response()
        }
    }
}

async fn put_experiment(State(state): State<AppState>, SimdJson(experiment): SimdJson<ExperimentConfig>) -> StatusCode {
    match state.store.put_experiment(experiment).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(e) => {
            warn!(error = %e, "Experiment update failed");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

#[derive(Debug, Deserialize)]
struct SummaryQuery {
    lookback_hours: Option<i64>,
}

async fn metrics_summary(State(state): State<AppState>, Query(query): Query<SummaryQuery>) -> Response {
    match state.orchestrator.metrics_summary(query.lookback_hours.unwrap_or(24)).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}

#[derive(Debug, Serialize)]
struct CriticView {
    agent_name: String,
    version: u64,
    observations: u64,
    theta: Vec<f64>,
    phi: Vec<f64>,
}

async fn critic(State(state): State<AppState>) -> Json<CriticView> {
    let snapshot = state.orchestrator.critic_snapshot();
    Json(CriticView {
        agent_name: snapshot.agent_name.clone(),
        version: snapshot.version,
        observations: snapshot.observations,
        theta: snapshot.theta.to_vec(),
        phi: snapshot.phi.to_vec(),
    })
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    DROPPED_WRITES.set(state.orchestrator.writer().stats().dropped.load(Ordering::Relaxed) as i64);
    CRITIC_OBSERVATIONS.set(state.orchestrator.critic_snapshot().observations as i64);

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }
    String::from_utf8_lossy(&buffer).into_owned().into_response()
}

// --- 5. Main ---

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => match EngineConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!(path = %path, error = %e, "Failed to load config");
                std::process::exit(1);
            }
        },
        None => EngineConfig::default(),
    };
    if args.shadow {
        config.runtime.shadow_mode = true;
    }

    let _ = &*DECISIONS_TOTAL;
    let _ = &*AUTOMATE_TOTAL;
    let _ = &*ESCALATE_TOTAL;
    let _ = &*SHADOW_TOTAL;
    let _ = &*OUTCOMES_TOTAL;
    let _ = &*DROPPED_WRITES;
    let _ = &*CRITIC_OBSERVATIONS;
    let _ = &*DECISION_LATENCY;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(config.runtime.evidence_timeout_ms))
        .pool_max_idle_per_host(10)
        .build()
        .unwrap_or_default();
    let mut sources: Vec<Arc<dyn EvidenceSource>> = Vec::new();
    for arg in &args.detectors {
        match HttpEvidenceSource::parse(arg, client.clone()) {
            Some(source) => sources.push(Arc::new(source)),
            None => warn!(detector = %arg, "Ignoring malformed --detector (expected id=url)"),
        }
    }

    let store: Arc<dyn DecisionStore> =
        Arc::new(InMemoryStore::with_calibration_retention(config.conformal.calibration_window));
    let orchestrator = match DecisionOrchestrator::start(config, store.clone(), sources).await {
        Ok(o) => Arc::new(o),
        Err(e) => {
            error!(error = %e, "Failed to start decision engine");
            std::process::exit(1);
        }
    };

    let token = CancellationToken::new();
    let coverage_handle = orchestrator.coverage_monitor().spawn(token.clone());

    let state = AppState {
        orchestrator: orchestrator.clone(),
        store,
    };

    let app = Router::new()
        .route("/decide", post(decide))
        .route("/outcome", post(outcome))
        .route("/experiments", post(put_experiment))
        .route("/metrics", get(metrics_handler))
        .route("/metrics/summary", get(metrics_summary))
        .route("/critic", get(critic))
        .route("/health", get(|| async { "OK" }))
        .with_state(state);

    let listener = match TcpListener::bind(&args.listen).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %args.listen, error = %e, "Failed to bind");
            std::process::exit(1);
        }
    };
    info!(addr = %args.listen, shadow = orchestrator.config().runtime.shadow_mode, "Gatekeeper listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to install CTRL+C handler");
            }
            info!("Shutting down");
        })
        .await;
    if let Err(e) = served {
        error!(error = %e, "Server error");
    }

    token.cancel();
    let _ = coverage_handle.await;
    orchestrator.shutdown().await;
    info!("Critic checkpointed. Goodbye.");
}
