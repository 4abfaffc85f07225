use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, ClientBuilder};
use url::Url;

use super::{AttemptError, BackendCall};

/// Thin reqwest wrapper for talking to the backend service.
///
/// Holds the resolved resource and admin endpoints so the hot path does no
/// URL parsing. The per-attempt timeout is fixed at construction; an
/// elapsed deadline is reported as [`AttemptError::Timeout`] and treated by
/// the caller exactly like a backend-reported failure.
pub struct BackendClient {
    inner: Client,
    resource_url: Url,
    admin_url: Url,
    timeout: Duration,
}

impl BackendClient {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let base = Url::parse(base_url)?;
        let resource_url = base.join("/api/resource")?;
        let admin_url = base.join("/admin/failure")?;

        let inner = ClientBuilder::new().timeout(timeout).build()?;

        Ok(Self {
            inner,
            resource_url,
            admin_url,
            timeout,
        })
    }

    /// One attempt against the backend's resource endpoint.
    pub async fn fetch_resource(&self) -> Result<(), AttemptError> {
        let response = self
            .inner
            .get(self.resource_url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(AttemptError::Status(status.as_u16()))
        }
    }

    /// Updates the backend's injected failure probability. The backend
    /// validates the range; a rejection surfaces as an error here.
    pub async fn set_failure_probability(&self, p: f64) -> anyhow::Result<()> {
        let mut url = self.admin_url.clone();
        url.query_pairs_mut().append_pair("p", &p.to_string());

        debug!("setting backend failure probability to {}", p);
        let response = self.inner.get(url).send().await?;
        anyhow::ensure!(
            response.status().is_success(),
            "backend rejected failure probability {}: status {}",
            p,
            response.status()
        );
        Ok(())
    }
}

#[async_trait]
impl BackendCall for BackendClient {
    async fn call(&self) -> Result<(), AttemptError> {
        self.fetch_resource().await
    }
}

fn classify(err: reqwest::Error) -> AttemptError {
    if err.is_timeout() {
        AttemptError::Timeout
    } else {
        AttemptError::Transport(err.to_string())
    }
}
