/// Phase-driven traffic experiment.
///
/// Drives the gateway with a fixed request rate while stepping the
/// backend's injected failure probability through a schedule, to show the
/// adaptive controller absorbing what would otherwise become a retry
/// storm. Batches are spawned on a once-per-second cadence and log their
/// own result line when they finish, so a slow batch (overloaded backend)
/// does not stall the schedule; it shows up as a late line with a long
/// latency, which is the interesting signal.
use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;
use log::warn;
use reqwest::Client;
use tokio::time::MissedTickBehavior;
use url::Url;

use crate::http::BackendClient;
use crate::{ExperimentConfig, SinkRef};

/// Human-readable plan, used by `--dry-run` and printed before a live run.
pub fn plan_lines(config: &ExperimentConfig) -> Vec<String> {
    let mut lines = vec![format!(
        "[*] Plan: {} req/s against {} for {}s",
        config.traffic_rate, config.gateway_url, config.duration_secs
    )];
    for phase in &config.phases {
        lines.push(format!(
            "[*]   t+{:02}s  {}  (failure injection {:.0}%)",
            phase.at_secs,
            phase.label,
            phase.failure_probability * 100.0
        ));
    }
    lines
}

pub async fn run(config: ExperimentConfig, sink: SinkRef) -> anyhow::Result<()> {
    config.validate()?;

    let request_url = Url::parse(&config.gateway_url)?.join("/request")?;
    let client = Client::builder().timeout(config.request_timeout()).build()?;
    let admin = BackendClient::new(&config.backend_url, config.request_timeout())?;

    sink.on_log("phase", "[*] Reliability experiment starting");
    for line in plan_lines(&config) {
        sink.on_log("dim", &line);
    }

    // Start from a clean backend regardless of what ran before.
    admin.set_failure_probability(0.0).await?;

    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut phase_label = String::from("-");
    let mut batches = Vec::new();

    for elapsed in 0..=config.duration_secs {
        ticker.tick().await;

        for phase in config.phases.iter().filter(|p| p.at_secs == elapsed) {
            sink.on_log(
                "phase",
                &format!(
                    "[*] [PHASE] {}: injecting {:.0}% failure rate",
                    phase.label,
                    phase.failure_probability * 100.0
                ),
            );
            if let Err(e) = admin.set_failure_probability(phase.failure_probability).await {
                warn!("failure injection update failed: {}", e);
                sink.on_log("warn", &format!("[!] Admin update failed: {}", e));
            }
            phase_label = phase.label.clone();
        }

        batches.push(tokio::spawn(run_batch(
            client.clone(),
            request_url.clone(),
            config.traffic_rate,
            elapsed,
            phase_label.clone(),
            Arc::clone(&sink),
        )));
    }

    let mut total_ok = 0u64;
    let mut total_err = 0u64;
    for batch in batches {
        if let Ok((ok, err)) = batch.await {
            total_ok += u64::from(ok);
            total_err += u64::from(err);
        }
    }

    sink.on_log(
        "phase",
        &format!(
            "[*] Experiment complete: {} ok, {} unavailable",
            total_ok, total_err
        ),
    );
    Ok(())
}

/// Fires one second's worth of traffic and logs the outcome line.
async fn run_batch(
    client: Client,
    request_url: Url,
    rate: u32,
    elapsed: u64,
    phase_label: String,
    sink: SinkRef,
) -> (u32, u32) {
    let started = Instant::now();
    let calls = (0..rate).map(|_| {
        let client = client.clone();
        let url = request_url.clone();
        async move {
            match client.get(url).send().await {
                Ok(response) => response.status().is_success(),
                Err(_) => false,
            }
        }
    });

    let results = join_all(calls).await;
    let ok = results.iter().filter(|succeeded| **succeeded).count() as u32;
    let err = rate - ok;
    let latency_ms = started.elapsed().as_millis();

    let level = if err == 0 {
        "success"
    } else if err < rate {
        "warn"
    } else {
        "error"
    };
    sink.on_log(
        level,
        &format!(
            "T+{:02}s | phase {:<16} | load {:>3} | ok {:>3} | err {:>3} | latency {}ms",
            elapsed, phase_label, rate, ok, err, latency_ms
        ),
    );
    (ok, err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_lists_every_phase() {
        let config = ExperimentConfig::default();
        let lines = plan_lines(&config);
        assert_eq!(lines.len(), 1 + config.phases.len());
        assert!(lines[0].contains("20 req/s"));
        assert!(lines[1].contains("BASELINE"));
        assert!(lines[2].contains("t+07s"));
        assert!(lines[2].contains("50%"));
        assert!(lines[3].contains("CRITICAL FAILURE"));
    }

    #[test]
    fn invalid_config_is_rejected_before_any_traffic() {
        let config = ExperimentConfig {
            traffic_rate: 0,
            ..ExperimentConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
