//! Readiness probing of a sandbox's desktop service.

use crate::config::BridgeConfig;
use std::time::Duration;
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info};

/// Polls a sandbox's published desktop port until it answers with a success status.
#[derive(Debug, Clone)]
pub struct ReadinessProber {
    client: reqwest::Client,
    base_url: String,
    path: String,
    interval: Duration,
}

impl ReadinessProber {
    pub fn new(base_url: impl Into<String>, path: impl Into<String>, interval: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            path: path.into(),
            interval,
        }
    }

    pub fn from_config(config: &BridgeConfig) -> Self {
        Self::new(
            config.public_base(),
            config.readiness_path.clone(),
            config.readiness_interval,
        )
    }

    pub fn url_for(&self, host_port: u16) -> String {
        format!("{}:{}{}", self.base_url, host_port, self.path)
    }

    /// Returns `true` once a GET succeeds, `false` when `deadline` passes first.
    ///
    /// Request errors count as "not ready yet". Each request is cut off at the
    /// deadline, so this returns within `deadline` plus scheduling slack.
    pub async fn wait_until_ready(&self, host_port: u16, deadline: Duration) -> bool {
        let url = self.url_for(host_port);
        let deadline = Instant::now() + deadline;
        let mut attempts = 0u32;

        loop {
            let now = Instant::now();
            if now >= deadline {
                info!(url = %url, attempts, "Readiness probe timed out");
                return false;
            }

            attempts += 1;
            match timeout(deadline - now, self.client.get(&url).send()).await {
                Ok(Ok(response)) if response.status().is_success() => {
                    info!(url = %url, attempts, "Sandbox desktop is ready");
                    return true;
                }
                Ok(Ok(response)) => debug!(url = %url, status = %response.status(), "Not ready"),
                Ok(Err(e)) => debug!(url = %url, error = %e, "Not ready"),
                Err(_) => {}
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                continue;
            }
            sleep(self.interval.min(remaining)).await;
        }
    }
}
