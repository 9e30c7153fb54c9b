//! Tool execution router
//!
//! Resolves a tool name to a healthy spoke instance and delivers the call,
//! applying load balancing, per-instance concurrency bounds, circuit
//! breaking, and retry with jittered backoff. Requests are processed in
//! parallel with no cross-request ordering.

pub mod balancer;
mod spoke_client;

pub use spoke_client::{CORRELATION_HEADER, HttpSpokeTransport, SpokeTransport};

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::RouterConfig;
use crate::context::RequestContext;
use crate::failsafe::{BreakerView, CircuitBreaker, CircuitState, RetryPolicy};
use crate::registry::{DiscoverFilter, HealthStatus, ServiceInstance, ServiceRegistry};
use crate::{Error, Result};

/// Tool execution router
pub struct ToolRouter {
    registry: Arc<ServiceRegistry>,
    transport: Arc<dyn SpokeTransport>,
    config: RouterConfig,
    retry: RetryPolicy,
    /// One breaker per `(toolName, instanceId)`, lazily created on first
    /// dispatch and evicted with the instance
    breakers: DashMap<(String, String), Arc<CircuitBreaker>>,
    /// One concurrency semaphore per instance
    permits: DashMap<String, Arc<Semaphore>>,
}

impl ToolRouter {
    /// Create a router over a registry and a spoke transport
    #[must_use]
    pub fn new(
        registry: Arc<ServiceRegistry>,
        transport: Arc<dyn SpokeTransport>,
        config: RouterConfig,
    ) -> Self {
        let retry = RetryPolicy::new(&config);
        Self {
            registry,
            transport,
            config,
            retry,
            breakers: DashMap::new(),
            permits: DashMap::new(),
        }
    }

    /// Deliver `tool` to a healthy instance and return its result.
    ///
    /// # Errors
    ///
    /// - `ToolNotFound` when no service advertises the tool.
    /// - `NoHealthyInstance` when the registry has nothing `Passing`.
    /// - `AllInstancesOpen` when every candidate breaker is open and no
    ///   half-open probe is permitted.
    /// - `DeadlineExceeded` / `Cancelled` from the request context.
    /// - Application errors from the spoke pass through unchanged.
    pub async fn dispatch(
        &self,
        tool: &str,
        arguments: Value,
        ctx: &RequestContext,
    ) -> Result<Value> {
        let service = self
            .registry
            .resolve_tool(tool)
            .ok_or_else(|| Error::ToolNotFound(tool.to_string()))?;

        let mut excluded: HashSet<String> = HashSet::new();
        let mut attempt: u32 = 0;
        let mut last_error: Option<Error> = None;

        loop {
            if ctx.is_cancelled() {
                return Err(Error::Cancelled(format!(
                    "dispatch of '{tool}' aborted (correlation {})",
                    ctx.correlation_id()
                )));
            }
            if ctx.remaining().is_none() {
                return Err(last_error.take().unwrap_or_else(|| {
                    Error::DeadlineExceeded(format!(
                        "dispatch of '{tool}' exceeded deadline (correlation {})",
                        ctx.correlation_id()
                    ))
                }));
            }

            let (instance, is_probe) =
                match self.select(tool, &service, &excluded, &mut last_error) {
                    Ok(chosen) => chosen,
                    Err(e) => return Err(e),
                };
            let breaker = self.breaker(tool, &instance.id);

            // Bound concurrency to the instance; saturation excludes it from
            // this request's selection and re-picks without burning a retry.
            let semaphore = self.permits_for(&instance.id);
            let acquired = tokio::select! {
                () = ctx.cancelled() => {
                    breaker.record_cancelled();
                    return Err(Error::Cancelled(format!(
                        "permit wait for '{tool}' aborted (correlation {})",
                        ctx.correlation_id()
                    )));
                }
                res = tokio::time::timeout(
                    self.config.acquire_timeout,
                    Arc::clone(&semaphore).acquire_owned(),
                ) => res,
            };
            let Ok(Ok(permit)) = acquired else {
                debug!(tool, instance = %instance.id, "Instance saturated, re-selecting");
                breaker.record_cancelled();
                excluded.insert(instance.id.clone());
                continue;
            };

            breaker.touch_attempt();
            let call = self
                .transport
                .call_tool(&instance, tool, arguments.clone(), ctx);
            let result = ctx
                .run_capped("spoke call", self.config.per_call_timeout, call)
                .await;
            drop(permit);

            match result {
                Ok(value) => {
                    breaker.record_success();
                    return Ok(value);
                }
                Err(e @ (Error::Cancelled(_) | Error::DeadlineExceeded(_))) => {
                    // Neither success nor failure for breaker purposes.
                    breaker.record_cancelled();
                    return Err(e);
                }
                Err(e) if e.is_retryable() => {
                    breaker.record_failure();
                    warn!(
                        tool,
                        instance = %instance.id,
                        probe = is_probe,
                        attempt,
                        error = %e,
                        "Spoke call failed"
                    );
                    excluded.insert(instance.id.clone());
                    attempt += 1;
                    if !self.retry.allows(attempt) {
                        return Err(e);
                    }
                    let delay = self.retry.delay_for(attempt);
                    if ctx.remaining().is_none_or(|rem| rem <= delay) {
                        return Err(e);
                    }
                    last_error = Some(e);
                    ctx.run("retry backoff", async {
                        tokio::time::sleep(delay).await;
                        Ok(())
                    })
                    .await?;
                }
                Err(e) => {
                    // The spoke answered; the failure belongs to the request,
                    // not the instance.
                    breaker.record_success();
                    return Err(e);
                }
            }
        }
    }

    /// Pick a dispatchable instance: prefer closed breakers via weighted
    /// headroom, otherwise admit a single half-open probe on the
    /// least-recently-tried eligible candidate.
    fn select(
        &self,
        tool: &str,
        service: &str,
        excluded: &HashSet<String>,
        last_error: &mut Option<Error>,
    ) -> Result<(ServiceInstance, bool)> {
        let instances: Vec<ServiceInstance> = self
            .registry
            .discover(&DiscoverFilter::service(service, HealthStatus::Passing))
            .into_iter()
            .filter(|inst| !excluded.contains(&inst.id))
            .collect();

        if instances.is_empty() {
            return Err(last_error.take().unwrap_or_else(|| {
                Error::NoHealthyInstance(service.to_string())
            }));
        }

        let mut dispatchable = Vec::new();
        let mut probe_pool = Vec::new();
        for inst in &instances {
            match self.breaker(tool, &inst.id).view() {
                BreakerView::Dispatchable => dispatchable.push(balancer::Candidate {
                    instance: inst,
                    in_flight: self.in_flight(&inst.id),
                }),
                BreakerView::ProbeEligible { last_attempt_ms } => {
                    probe_pool.push((last_attempt_ms, inst));
                }
                BreakerView::Cooling => {}
            }
        }

        if let Some(inst) = balancer::pick(&dispatchable, self.config.per_instance_capacity) {
            return Ok((inst.clone(), false));
        }

        probe_pool.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        for (_, inst) in probe_pool {
            if self.breaker(tool, &inst.id).try_begin_probe() {
                return Ok((inst.clone(), true));
            }
        }

        Err(last_error
            .take()
            .unwrap_or_else(|| Error::AllInstancesOpen(tool.to_string())))
    }

    /// Breaker cell for a `(tool, instance)` pair, created on first use
    fn breaker(&self, tool: &str, instance_id: &str) -> Arc<CircuitBreaker> {
        let key = (tool.to_string(), instance_id.to_string());
        Arc::clone(
            &self
                .breakers
                .entry(key)
                .or_insert_with(|| {
                    Arc::new(CircuitBreaker::new(tool, instance_id, &self.config.breaker))
                }),
        )
    }

    fn permits_for(&self, instance_id: &str) -> Arc<Semaphore> {
        Arc::clone(
            &self
                .permits
                .entry(instance_id.to_string())
                .or_insert_with(|| {
                    Arc::new(Semaphore::new(self.config.per_instance_capacity))
                }),
        )
    }

    /// Calls currently in flight to one instance
    #[must_use]
    pub fn in_flight(&self, instance_id: &str) -> usize {
        self.permits.get(instance_id).map_or(0, |sem| {
            self.config
                .per_instance_capacity
                .saturating_sub(sem.available_permits())
        })
    }

    /// Drop breaker and permit state for a removed instance
    pub fn evict_instance(&self, instance_id: &str) {
        self.breakers.retain(|(_, id), _| id != instance_id);
        self.permits.remove(instance_id);
        debug!(instance = %instance_id, "Evicted router state");
    }

    /// Breaker state snapshot for one `(tool, instance)` pair, if it exists
    #[must_use]
    pub fn breaker_state(&self, tool: &str, instance_id: &str) -> Option<(CircuitState, u32)> {
        self.breakers
            .get(&(tool.to_string(), instance_id.to_string()))
            .map(|b| (b.state(), b.consecutive_failures()))
    }
}
