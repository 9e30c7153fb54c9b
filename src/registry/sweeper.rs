//! Background health sweeper
//!
//! Polls each registered instance's health endpoint on a fixed interval.
//! Every probe runs with its own timeout so one slow upstream never stalls
//! the sweep of the others, and the whole loop is cancellable.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use super::ServiceRegistry;

/// Body returned by a spoke's health endpoint
#[derive(Debug, Deserialize)]
struct HealthProbeResponse {
    status: String,
    #[serde(default)]
    #[allow(dead_code)]
    detail: Option<String>,
}

/// Probe one health endpoint. Healthy means HTTP 200 with a body whose
/// `status` is `Passing`; anything else (including transport errors and
/// timeouts) degrades the instance.
pub async fn probe_health_endpoint(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> bool {
    let request = client.get(url).timeout(timeout).send();
    match request.await {
        Ok(response) if response.status().is_success() => {
            match response.json::<HealthProbeResponse>().await {
                Ok(body) => body.status == "Passing",
                Err(e) => {
                    trace!(url, error = %e, "Health body unreadable");
                    false
                }
            }
        }
        Ok(response) => {
            trace!(url, status = %response.status(), "Health probe non-200");
            false
        }
        Err(e) => {
            trace!(url, error = %e, "Health probe failed");
            false
        }
    }
}

/// Periodic health prober for all registered instances
pub struct HealthSweeper {
    registry: Arc<ServiceRegistry>,
    client: reqwest::Client,
    /// Called with each purged instance id so dependent router state
    /// (breakers, permits) can be evicted
    on_removed: Option<Arc<dyn Fn(&str) + Send + Sync>>,
}

impl HealthSweeper {
    /// Create a sweeper over the given registry
    #[must_use]
    pub fn new(registry: Arc<ServiceRegistry>) -> Self {
        Self {
            registry,
            client: reqwest::Client::new(),
            on_removed: None,
        }
    }

    /// Attach an eviction hook fired for every purged instance
    #[must_use]
    pub fn with_eviction(mut self, hook: Arc<dyn Fn(&str) + Send + Sync>) -> Self {
        self.on_removed = Some(hook);
        self
    }

    /// Spawn the sweep loop; it stops when `cancel` fires.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        let interval = self.registry.config().probe_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("Health sweeper stopped");
                        return;
                    }
                    _ = ticker.tick() => {
                        self.sweep_once().await;
                    }
                }
            }
        })
    }

    /// One full sweep: probe every instance concurrently, then apply the
    /// heartbeat TTL and the deregistration TTL.
    pub async fn sweep_once(&self) {
        let probe_timeout = self.registry.config().probe_timeout;
        let instances = self.registry.discover(&super::DiscoverFilter::default());
        debug!(count = instances.len(), "Health sweep");

        let probes = instances.iter().map(|inst| {
            let client = self.client.clone();
            let url = inst.health_endpoint.clone();
            let id = inst.id.clone();
            async move {
                let healthy = probe_health_endpoint(&client, &url, probe_timeout).await;
                (id, healthy)
            }
        });

        for (id, healthy) in join_all(probes).await {
            if healthy {
                self.registry.record_probe_success(&id);
            } else {
                self.registry.record_probe_failure(&id);
            }
        }

        let now = Utc::now();
        self.registry.mark_stale_heartbeats(now);
        for removed in self.registry.purge_expired(now) {
            if let Some(hook) = &self.on_removed {
                hook(&removed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::registry::{HealthStatus, Registration, ToolDescriptor};
    use axum::{Json, Router, routing::get};
    use std::collections::{BTreeSet, HashMap};
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicBool, Ordering};

    async fn serve_health(healthy: Arc<AtomicBool>) -> SocketAddr {
        let app = Router::new().route(
            "/health",
            get(move || {
                let healthy = Arc::clone(&healthy);
                async move {
                    let status = if healthy.load(Ordering::Relaxed) {
                        "Passing"
                    } else {
                        "Critical"
                    };
                    Json(serde_json::json!({"status": status}))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn registration(id: &str, health_url: String) -> Registration {
        Registration {
            id: id.to_string(),
            name: "market-spoke".to_string(),
            address: "http://127.0.0.1:1/mcp".to_string(),
            tags: BTreeSet::new(),
            metadata: HashMap::new(),
            health_endpoint: health_url,
            tools: Vec::<ToolDescriptor>::new(),
        }
    }

    #[tokio::test]
    async fn probe_accepts_passing_and_rejects_else() {
        let healthy = Arc::new(AtomicBool::new(true));
        let addr = serve_health(Arc::clone(&healthy)).await;
        let url = format!("http://{addr}/health");
        let client = reqwest::Client::new();

        assert!(probe_health_endpoint(&client, &url, Duration::from_secs(1)).await);

        healthy.store(false, Ordering::Relaxed);
        assert!(!probe_health_endpoint(&client, &url, Duration::from_secs(1)).await);

        // Nothing listening.
        assert!(
            !probe_health_endpoint(
                &client,
                "http://127.0.0.1:1/health",
                Duration::from_millis(200)
            )
            .await
        );
    }

    #[tokio::test]
    async fn sweep_degrades_unreachable_instance_without_stalling_others() {
        let healthy = Arc::new(AtomicBool::new(true));
        let addr = serve_health(Arc::clone(&healthy)).await;

        let registry = Arc::new(ServiceRegistry::new(RegistryConfig {
            probe_timeout: Duration::from_millis(300),
            ..RegistryConfig::default()
        }));
        registry
            .register(registration("good-1", format!("http://{addr}/health")))
            .unwrap();
        registry
            .register(registration(
                "dead-1",
                "http://127.0.0.1:1/health".to_string(),
            ))
            .unwrap();

        let sweeper = HealthSweeper::new(Arc::clone(&registry));
        sweeper.sweep_once().await;

        assert_eq!(
            registry.instance("good-1").unwrap().status,
            HealthStatus::Passing
        );
        assert_eq!(
            registry.instance("dead-1").unwrap().status,
            HealthStatus::Warning
        );
    }

    #[tokio::test]
    async fn spawned_sweeper_stops_on_cancel() {
        let registry = Arc::new(ServiceRegistry::new(RegistryConfig {
            probe_interval: Duration::from_millis(10),
            ..RegistryConfig::default()
        }));
        let cancel = CancellationToken::new();
        let handle = HealthSweeper::new(registry).spawn(cancel.clone());

        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper must stop promptly")
            .unwrap();
    }
}
