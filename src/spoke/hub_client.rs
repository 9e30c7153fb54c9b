//! Hub registration client
//!
//! Thin HTTP client for the hub's registry surface: register on startup
//! (with backoff until the startup deadline), heartbeat while serving,
//! deregister on shutdown.

use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::BackoffConfig;
use crate::failsafe::RetryPolicy;
use crate::registry::{Registration, ServiceInstance};
use crate::{Error, Result};

/// Client for the hub's `/registry` endpoints
pub struct HubClient {
    client: reqwest::Client,
    base_url: String,
}

impl HubClient {
    /// Create a client for the hub at `hub_address`
    #[must_use]
    pub fn new(hub_address: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: hub_address.trim_end_matches('/').to_string(),
        }
    }

    /// Register once
    pub async fn register(&self, registration: &Registration) -> Result<ServiceInstance> {
        let response = self
            .client
            .post(format!("{}/registry/register", self.base_url))
            .json(registration)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("hub register: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let detail = response
                .json::<Value>()
                .await
                .ok()
                .and_then(|v| v.get("message").and_then(Value::as_str).map(String::from))
                .unwrap_or_default();
            return Err(Error::Registration(format!(
                "hub rejected registration ({status}): {detail}"
            )));
        }

        response
            .json::<ServiceInstance>()
            .await
            .map_err(|e| Error::Transport(format!("hub register response: {e}")))
    }

    /// Register with exponential backoff until `deadline` from now elapses.
    /// A rejection (tool collision) fails immediately; only transport
    /// failures are retried.
    pub async fn register_with_retry(
        &self,
        registration: &Registration,
        deadline: Duration,
    ) -> Result<ServiceInstance> {
        let give_up = Instant::now() + deadline;
        let policy = RetryPolicy::with_backoff(
            u32::MAX,
            &BackoffConfig {
                base: Duration::from_millis(500),
                max: Duration::from_secs(10),
            },
        );

        let mut attempt: u32 = 0;
        loop {
            match self.register(registration).await {
                Ok(instance) => {
                    info!(instance = %instance.id, "Registered with hub");
                    return Ok(instance);
                }
                Err(e @ Error::Registration(_)) => return Err(e),
                Err(e) => {
                    attempt += 1;
                    let delay = policy.delay_for(attempt);
                    if Instant::now() + delay >= give_up {
                        return Err(Error::Registration(format!(
                            "unregistered after startup deadline: {e}"
                        )));
                    }
                    warn!(attempt, error = %e, "Hub registration failed, backing off");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Send one heartbeat
    pub async fn heartbeat(&self, instance_id: &str) -> Result<()> {
        let response = self
            .client
            .post(format!("{}/registry/{instance_id}/heartbeat", self.base_url))
            .send()
            .await
            .map_err(|e| Error::Transport(format!("hub heartbeat: {e}")))?;

        if response.status().is_success() {
            debug!(instance = instance_id, "Heartbeat acknowledged");
            Ok(())
        } else {
            Err(Error::Transport(format!(
                "hub heartbeat returned {}",
                response.status()
            )))
        }
    }

    /// Deregister on shutdown
    pub async fn deregister(&self, instance_id: &str) -> Result<()> {
        let response = self
            .client
            .delete(format!("{}/registry/{instance_id}", self.base_url))
            .send()
            .await
            .map_err(|e| Error::Transport(format!("hub deregister: {e}")))?;

        if response.status().is_success() {
            info!(instance = instance_id, "Deregistered from hub");
            Ok(())
        } else {
            Err(Error::Transport(format!(
                "hub deregister returned {}",
                response.status()
            )))
        }
    }
}
