pub mod backend;
pub mod core;
pub mod experiment;
pub mod gateway;
pub mod http;

use std::sync::Arc;
use std::time::Duration;

use anyhow::ensure;
use serde::{Deserialize, Serialize};
use url::Url;

pub use crate::core::budget::RetryBudget;
pub use crate::core::controller::{plan_budget, ControlDecision, FeedbackController};
pub use crate::core::metrics::{MetricsWindow, WindowSnapshot};
pub use crate::core::proxy::ProxyExecutor;
pub use crate::gateway::Gateway;
pub use crate::http::{BackendCall, BackendClient};

/// Gateway configuration, shared by the CLI and by embedded use.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub listen_port: u16,
    pub backend_url: String,
    /// Safety threshold for backend throughput, in requests per window (C).
    pub capacity_estimate: u32,
    /// Retry count assumed when projecting the load of a non-adaptive policy.
    pub standard_retry_multiplier: u32,
    /// Upper clamp on the retry budget.
    pub max_retries: u32,
    pub window_ms: u64,
    pub backend_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_port: 3000,
            backend_url: "http://127.0.0.1:3001".to_string(),
            capacity_estimate: 50,
            standard_retry_multiplier: 3,
            max_retries: 3,
            window_ms: 1000,
            backend_timeout_ms: 500,
        }
    }
}

impl GatewayConfig {
    pub fn window_duration(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    /// Rejects unusable values before any task or socket is created.
    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.capacity_estimate > 0, "capacityEstimate must be positive");
        ensure!(
            self.standard_retry_multiplier > 0,
            "standardRetryMultiplier must be positive"
        );
        ensure!(self.window_ms > 0, "windowMs must be positive");
        ensure!(self.backend_timeout_ms > 0, "backendTimeoutMs must be positive");
        Url::parse(&self.backend_url)
            .map_err(|e| anyhow::anyhow!("invalid backendUrl '{}': {}", self.backend_url, e))?;
        Ok(())
    }
}

/// Capacity-limited backend simulator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendConfig {
    pub listen_port: u16,
    /// Requests per interval the service can absorb before degrading.
    pub capacity: u64,
    pub initial_failure_probability: f64,
    pub processing_delay_ms: u64,
    /// Latency of the overload path. The blow-up, not the error, is the hazard.
    pub overload_delay_ms: u64,
    pub dashboard: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            listen_port: 3001,
            capacity: 60,
            initial_failure_probability: 0.0,
            processing_delay_ms: 10,
            overload_delay_ms: 3000,
            dashboard: true,
        }
    }
}

impl BackendConfig {
    pub fn processing_delay(&self) -> Duration {
        Duration::from_millis(self.processing_delay_ms)
    }

    pub fn overload_delay(&self) -> Duration {
        Duration::from_millis(self.overload_delay_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.capacity > 0, "capacity must be positive");
        ensure!(
            probability_in_range(self.initial_failure_probability),
            "initialFailureProbability must be within [0, 1]"
        );
        Ok(())
    }
}

/// One step of the experiment's failure-injection schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseConfig {
    pub at_secs: u64,
    pub failure_probability: f64,
    pub label: String,
}

/// Traffic-generation experiment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExperimentConfig {
    pub gateway_url: String,
    pub backend_url: String,
    /// Logical requests fired per second.
    pub traffic_rate: u32,
    pub duration_secs: u64,
    pub request_timeout_ms: u64,
    pub phases: Vec<PhaseConfig>,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            gateway_url: "http://127.0.0.1:3000".to_string(),
            backend_url: "http://127.0.0.1:3001".to_string(),
            traffic_rate: 20,
            duration_secs: 22,
            request_timeout_ms: 10_000,
            phases: vec![
                PhaseConfig {
                    at_secs: 0,
                    failure_probability: 0.0,
                    label: "BASELINE".to_string(),
                },
                PhaseConfig {
                    at_secs: 7,
                    failure_probability: 0.5,
                    label: "MODERATE FAILURE".to_string(),
                },
                PhaseConfig {
                    at_secs: 14,
                    failure_probability: 0.8,
                    label: "CRITICAL FAILURE".to_string(),
                },
            ],
        }
    }
}

impl ExperimentConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.traffic_rate > 0, "trafficRate must be positive");
        ensure!(self.duration_secs > 0, "durationSecs must be positive");
        Url::parse(&self.gateway_url)
            .map_err(|e| anyhow::anyhow!("invalid gatewayUrl '{}': {}", self.gateway_url, e))?;
        Url::parse(&self.backend_url)
            .map_err(|e| anyhow::anyhow!("invalid backendUrl '{}': {}", self.backend_url, e))?;
        let mut last_at = 0u64;
        for phase in &self.phases {
            ensure!(
                probability_in_range(phase.failure_probability),
                "phase '{}': failureProbability must be within [0, 1]",
                phase.label
            );
            ensure!(
                phase.at_secs <= self.duration_secs,
                "phase '{}': atSecs exceeds experiment duration",
                phase.label
            );
            ensure!(phase.at_secs >= last_at, "phases must be ordered by atSecs");
            last_at = phase.at_secs;
        }
        Ok(())
    }
}

pub fn probability_in_range(p: f64) -> bool {
    p.is_finite() && (0.0..=1.0).contains(&p)
}

/// Output abstraction for telemetry and dashboard lines.
/// The CLI implements this with colored terminal output; tests capture lines.
pub trait TelemetrySink: Send + Sync {
    fn on_log(&self, level: &str, message: &str);
}

pub type SinkRef = Arc<dyn TelemetrySink>;

/// Terminal output sink for CLI usage.
pub struct ConsoleSink;

impl ConsoleSink {
    pub fn new_ref() -> SinkRef {
        Arc::new(Self)
    }
}

impl TelemetrySink for ConsoleSink {
    fn on_log(&self, level: &str, message: &str) {
        use colored::*;
        use std::io::Write;
        let colored = match level {
            "success" => message.green().to_string(),
            "error"   => message.red().to_string(),
            "warn"    => message.yellow().to_string(),
            "phase"   => message.bright_cyan().bold().to_string(),
            "dim"     => message.dimmed().to_string(),
            _         => message.to_string(),
        };
        print!("{}\r\n", colored);
        std::io::stdout().flush().ok();
    }
}

/// Sink that drops everything. Used when a component runs headless.
pub struct NullSink;

impl NullSink {
    pub fn new_ref() -> SinkRef {
        Arc::new(Self)
    }
}

impl TelemetrySink for NullSink {
    fn on_log(&self, _level: &str, _message: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_gateway_config_is_valid() {
        assert!(GatewayConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let config = GatewayConfig {
            capacity_estimate: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn bad_backend_url_is_rejected() {
        let config = GatewayConfig {
            backend_url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn backend_probability_bounds() {
        let mut config = BackendConfig::default();
        config.initial_failure_probability = 1.0;
        assert!(config.validate().is_ok());
        config.initial_failure_probability = 1.01;
        assert!(config.validate().is_err());
        config.initial_failure_probability = -0.1;
        assert!(config.validate().is_err());
        config.initial_failure_probability = f64::NAN;
        assert!(config.validate().is_err());
    }

    #[test]
    fn experiment_phase_validation() {
        let mut config = ExperimentConfig::default();
        assert!(config.validate().is_ok());

        config.phases[1].failure_probability = 2.0;
        assert!(config.validate().is_err());

        config = ExperimentConfig::default();
        config.phases[2].at_secs = 99;
        assert!(config.validate().is_err());

        config = ExperimentConfig::default();
        config.phases.swap(0, 2);
        assert!(config.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_json() {
        let config = GatewayConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("capacityEstimate"));
        let back: GatewayConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.capacity_estimate, config.capacity_estimate);
        assert_eq!(back.backend_url, config.backend_url);
    }
}
