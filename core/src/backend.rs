/// Capacity-limited backend simulator.
///
/// Stands in for the real service behind the gateway. Under its capacity it
/// answers quickly, failing a configurable fraction of requests; past
/// capacity it degrades the way overloaded services actually do: responses
/// stall for seconds before reporting unavailability. That latency blow-up
/// is what retry amplification must avoid triggering.
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use log::info;
use rand::Rng;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::{probability_in_range, BackendConfig, SinkRef};

const BAR_LEN: usize = 40;
const SEPARATOR: &str = "──────────────────────────────────────────────────";

/// What one incoming request will experience.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponsePlan {
    /// Load beyond capacity: long stall, then 503.
    Overloaded,
    /// Injected internal failure: immediate 500.
    InjectedError,
    /// Normal processing delay, then 200.
    Success,
}

/// Pure decision for a single request, given the interval load *after*
/// this request was counted, the injected probability, and a uniform roll.
pub fn plan_response(load: u64, capacity: u64, failure_probability: f64, roll: f64) -> ResponsePlan {
    if load > capacity {
        ResponsePlan::Overloaded
    } else if roll < failure_probability {
        ResponsePlan::InjectedError
    } else {
        ResponsePlan::Success
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Optimal,
    Stressed,
    Crashing,
}

impl Health {
    pub fn label(self) -> &'static str {
        match self {
            Health::Optimal => "OPTIMAL",
            Health::Stressed => "STRESSED",
            Health::Crashing => "CRASHING (DEATH SPIRAL)",
        }
    }
}

/// Health state for the dashboard: stressed above 80% of capacity,
/// crashing above it.
pub fn classify_health(load: u64, capacity: u64) -> Health {
    if load > capacity {
        Health::Crashing
    } else if load as f64 > capacity as f64 * 0.8 {
        Health::Stressed
    } else {
        Health::Optimal
    }
}

/// Fixed-width load bar for the dashboard.
pub fn load_bar(load: u64, capacity: u64) -> String {
    let ratio = (load as f64 / capacity as f64).min(1.0);
    let filled = (ratio * BAR_LEN as f64).floor() as usize;
    let mut bar = "█".repeat(filled);
    bar.push_str(&"░".repeat(BAR_LEN - filled));
    bar
}

/// Shared simulator state. Counters are interval-scoped and reset by the
/// dashboard tick; the injected probability is runtime-mutable through the
/// admin endpoint only.
pub struct BackendState {
    config: BackendConfig,
    interval_load: AtomicU64,
    success_count: AtomicU64,
    error_count: AtomicU64,
    overload_count: AtomicU64,
    // f64 stored as bits so the admin write and the request-path read stay
    // lock-free.
    failure_probability: AtomicU64,
}

impl BackendState {
    pub fn new(config: BackendConfig) -> Self {
        let initial = config.initial_failure_probability;
        Self {
            config,
            interval_load: AtomicU64::new(0),
            success_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            overload_count: AtomicU64::new(0),
            failure_probability: AtomicU64::new(initial.to_bits()),
        }
    }

    pub fn failure_probability(&self) -> f64 {
        f64::from_bits(self.failure_probability.load(Relaxed))
    }

    /// Validated update of the injected failure probability. Out-of-range
    /// or non-finite values are rejected and existing state is untouched.
    pub fn set_failure_probability(&self, p: f64) -> Result<(), String> {
        if !probability_in_range(p) {
            return Err(format!("probability {} outside [0, 1]", p));
        }
        self.failure_probability.store(p.to_bits(), Relaxed);
        info!("failure injection set to {}", p);
        Ok(())
    }

    /// Counts the request into the current interval and decides its fate.
    fn admit(&self) -> ResponsePlan {
        let load = self.interval_load.fetch_add(1, Relaxed) + 1;
        let roll = rand::rng().random::<f64>();
        let plan = plan_response(load, self.config.capacity, self.failure_probability(), roll);
        match plan {
            ResponsePlan::Overloaded => self.overload_count.fetch_add(1, Relaxed),
            ResponsePlan::InjectedError => self.error_count.fetch_add(1, Relaxed),
            ResponsePlan::Success => self.success_count.fetch_add(1, Relaxed),
        };
        plan
    }

    /// Drains the interval counters for the dashboard.
    fn drain_interval(&self) -> IntervalStats {
        IntervalStats {
            load: self.interval_load.swap(0, Relaxed),
            success: self.success_count.swap(0, Relaxed),
            errors: self.error_count.swap(0, Relaxed),
            overloads: self.overload_count.swap(0, Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct IntervalStats {
    load: u64,
    success: u64,
    errors: u64,
    overloads: u64,
}

#[derive(Debug, Deserialize)]
pub struct FailureParams {
    pub p: f64,
}

async fn handle_resource(State(state): State<Arc<BackendState>>) -> Response {
    match state.admit() {
        ResponsePlan::Overloaded => {
            tokio::time::sleep(state.config.overload_delay()).await;
            (StatusCode::SERVICE_UNAVAILABLE, "Overloaded").into_response()
        }
        ResponsePlan::InjectedError => {
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Error").into_response()
        }
        ResponsePlan::Success => {
            tokio::time::sleep(state.config.processing_delay()).await;
            Json(json!({ "status": "OK", "data": "Payload" })).into_response()
        }
    }
}

async fn handle_set_failure(
    State(state): State<Arc<BackendState>>,
    Query(params): Query<FailureParams>,
) -> Result<&'static str, (StatusCode, String)> {
    state
        .set_failure_probability(params.p)
        .map_err(|e| (StatusCode::BAD_REQUEST, e))?;
    Ok("Updated")
}

pub fn router(state: Arc<BackendState>) -> Router {
    Router::new()
        .route("/api/resource", get(handle_resource))
        .route("/admin/failure", get(handle_set_failure))
        .with_state(state)
}

/// Per-interval dashboard task. Renders health, load bar, and the last
/// interval's counters, then resets them.
pub fn spawn_dashboard(state: Arc<BackendState>, sink: SinkRef) -> DashboardHandle {
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => render(&state, &sink),
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
    });
    DashboardHandle { shutdown_tx, task }
}

pub struct DashboardHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DashboardHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

fn render(state: &BackendState, sink: &SinkRef) {
    let stats = state.drain_interval();
    let capacity = state.config.capacity;
    let health = classify_health(stats.load, capacity);
    let level = match health {
        Health::Optimal => "success",
        Health::Stressed => "warn",
        Health::Crashing => "error",
    };

    sink.on_log("dim", SEPARATOR);
    sink.on_log("phase", "[*] Backend monitor");
    sink.on_log(level, &format!("    Health:    {}", health.label()));
    sink.on_log(
        "info",
        &format!("    Capacity:  {} req/s", capacity),
    );
    sink.on_log(
        "info",
        &format!(
            "    Injected:  {:.0}% failure rate",
            state.failure_probability() * 100.0
        ),
    );
    sink.on_log(
        level,
        &format!("    Load:      {} req/s  {}", stats.load, load_bar(stats.load, capacity)),
    );
    sink.on_log(
        "info",
        &format!(
            "    Last 1s:   {} ok / {} failed / {} overloaded",
            stats.success, stats.errors, stats.overloads
        ),
    );
    sink.on_log("dim", SEPARATOR);
}

/// Serves the simulator until the process is stopped.
pub async fn run(config: BackendConfig, sink: SinkRef) -> anyhow::Result<()> {
    config.validate()?;

    let listen_port = config.listen_port;
    let dashboard_enabled = config.dashboard;
    let state = Arc::new(BackendState::new(config));
    let dashboard = if dashboard_enabled {
        Some(spawn_dashboard(Arc::clone(&state), Arc::clone(&sink)))
    } else {
        None
    };

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", listen_port)).await?;
    info!("backend listening on port {}", listen_port);
    sink.on_log(
        "phase",
        &format!("[*] Backend service running on port {}", listen_port),
    );

    let result = axum::serve(listener, router(state)).await;
    if let Some(dashboard) = dashboard {
        dashboard.shutdown().await;
    }
    result.map_err(Into::into)
}
