/// Gateway assembly: the client-facing endpoint, the state endpoint, and
/// the controller task lifecycle.
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use log::{debug, info};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::core::budget::RetryBudget;
use crate::core::controller::{ControlDecision, DecisionCell, FeedbackController};
use crate::core::metrics::MetricsWindow;
use crate::core::proxy::ProxyExecutor;
use crate::http::{BackendCall, BackendClient};
use crate::{GatewayConfig, SinkRef};

/// Read-only view served by `GET /state`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayState {
    pub retry_budget: u32,
    pub last_window: Option<ControlDecision>,
}

pub struct Gateway {
    config: GatewayConfig,
    metrics: Arc<MetricsWindow>,
    budget: Arc<RetryBudget>,
    last_decision: Arc<DecisionCell>,
    executor: ProxyExecutor,
    sink: SinkRef,
}

impl Gateway {
    pub fn new(config: GatewayConfig, backend: Arc<dyn BackendCall>, sink: SinkRef) -> Self {
        let metrics = Arc::new(MetricsWindow::new());
        // The budget starts at the standard policy and stays clamped to it.
        let budget = Arc::new(RetryBudget::new(config.max_retries, config.max_retries));
        let last_decision = Arc::new(DecisionCell::default());
        let executor = ProxyExecutor::new(
            backend,
            Arc::clone(&metrics),
            Arc::clone(&budget),
            config.max_retries,
        );

        Self {
            config,
            metrics,
            budget,
            last_decision,
            executor,
            sink,
        }
    }

    pub fn state(&self) -> GatewayState {
        GatewayState {
            retry_budget: self.budget.get(),
            last_window: self.last_decision.get(),
        }
    }

    pub fn retry_budget(&self) -> u32 {
        self.budget.get()
    }

    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route("/request", get(handle_request))
            .route("/state", get(handle_state))
            .with_state(Arc::clone(self))
    }

    /// Starts the periodic feedback controller. The returned handle owns
    /// the task; dropping it without `shutdown()` leaves the task running.
    pub fn spawn_controller(self: &Arc<Self>) -> ControllerHandle {
        let controller = FeedbackController::new(
            self.config.clone(),
            Arc::clone(&self.metrics),
            Arc::clone(&self.budget),
            Arc::clone(&self.last_decision),
            Arc::clone(&self.sink),
        );
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(controller.run(shutdown_rx));
        ControllerHandle { shutdown_tx, task }
    }
}

/// Owned handle to the running controller task.
pub struct ControllerHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ControllerHandle {
    /// Stops the controller and waits for the task to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.task.await;
    }
}

async fn handle_request(State(gateway): State<Arc<Gateway>>) -> (StatusCode, &'static str) {
    match gateway.executor.execute().await {
        Ok(()) => (StatusCode::OK, "OK"),
        Err(err) => {
            debug!("logical request failed: {}", err);
            (StatusCode::SERVICE_UNAVAILABLE, "Unavailable")
        }
    }
}

async fn handle_state(State(gateway): State<Arc<Gateway>>) -> Json<GatewayState> {
    Json(gateway.state())
}

/// Binds the listener, starts the controller, and serves until the process
/// is stopped. Nothing the backend does can take this loop down.
pub async fn run(config: GatewayConfig, sink: SinkRef) -> anyhow::Result<()> {
    config.validate()?;

    let backend: Arc<dyn BackendCall> = Arc::new(BackendClient::new(
        &config.backend_url,
        config.backend_timeout(),
    )?);
    let listen_port = config.listen_port;
    let gateway = Arc::new(Gateway::new(config, backend, Arc::clone(&sink)));
    let controller = gateway.spawn_controller();

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", listen_port)).await?;
    info!("gateway listening on port {}", listen_port);
    sink.on_log(
        "phase",
        &format!("[*] Adaptive gateway running on port {}", listen_port),
    );

    let result = axum::serve(listener, gateway.router()).await;
    controller.shutdown().await;
    result.map_err(Into::into)
}
