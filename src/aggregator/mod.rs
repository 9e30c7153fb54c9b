//! Multi-source data aggregator
//!
//! Produces normalized market data by querying an ordered list of upstream
//! providers until one succeeds, honoring per-provider token buckets,
//! cooling down unavailable providers, caching results under fingerprint
//! keys, and coalescing concurrent fetches for the same fingerprint into a
//! single upstream call.

mod cache;
mod provider;
pub mod providers;
mod rate_limit;

pub use cache::{AggregatorCache, CachedPayload, fingerprint};
pub use provider::{Operation, Provider, ProviderError, RawResponse, classify_status};
pub use rate_limit::TokenBucket;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::Shared;
use parking_lot::Mutex;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::AggregatorConfig;
use crate::context::RequestContext;
use crate::{Error, Result};

/// Successful chain outcome, cloneable so coalesced waiters share it
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// Normalized payload (also what gets cached)
    pub payload: CachedPayload,
    /// Providers attempted before success, in order
    pub fallback_chain: Vec<String>,
}

/// Chain failure, cloneable so coalesced waiters all receive the same error
#[derive(Debug, Clone, Error)]
pub enum AggregateError {
    /// A provider answered authoritatively that the data does not exist
    #[error("data not found: {0}")]
    NotFound(String),
    /// Every consulted provider was rate-limited
    #[error("all providers rate limited for '{0}'")]
    RateLimited(String),
    /// Providers exhausted without a result
    #[error("all providers failed for '{operation}'")]
    AllFailed {
        /// Logical operation
        operation: String,
        /// Per-provider error breakdown, sanitized of credentials
        breakdown: Vec<(String, String)>,
    },
    /// Deadline elapsed mid-chain
    #[error("deadline exceeded while fetching '{0}'")]
    Deadline(String),
}

impl From<AggregateError> for Error {
    fn from(e: AggregateError) -> Self {
        match e {
            AggregateError::NotFound(m) => Self::DataNotFound(m),
            AggregateError::RateLimited(m) => Self::ProviderRateLimited(m),
            AggregateError::AllFailed {
                operation,
                breakdown,
            } => Self::AllProvidersFailed {
                operation,
                breakdown,
            },
            AggregateError::Deadline(m) => Self::DeadlineExceeded(m),
        }
    }
}

type FlightResult = std::result::Result<FetchOutcome, AggregateError>;
type SharedFlight = Shared<Pin<Box<dyn Future<Output = FlightResult> + Send>>>;

/// What a fingerprint lookup found under the in-flight lock
enum FlightOrHit {
    /// Await this (possibly shared) upstream chain
    Flight(SharedFlight),
    /// Another flight landed first; serve its cached payload
    Hit(CachedPayload),
}

/// Multi-source data aggregator
pub struct Aggregator {
    providers: Vec<Arc<dyn Provider>>,
    /// Ordered provider ids per operation key; fixed configuration
    order: HashMap<String, Vec<String>>,
    budgets: HashMap<String, TokenBucket>,
    /// Providers marked unhealthy until the given instant
    cooldowns: DashMap<String, Instant>,
    provider_cooldown: Duration,
    cache: AggregatorCache,
    ttls: crate::config::AggregatorCacheConfig,
    /// In-flight fetches by fingerprint; concurrent lookups coalesce here
    inflight: Mutex<HashMap<String, SharedFlight>>,
}

impl Aggregator {
    /// Create an aggregator over the given providers
    #[must_use]
    pub fn new(config: &AggregatorConfig, providers: Vec<Arc<dyn Provider>>) -> Self {
        let budgets = providers
            .iter()
            .map(|p| {
                let limit = config
                    .providers
                    .get(p.id())
                    .map(|pc| pc.rate_limit)
                    .unwrap_or_default();
                (p.id().to_string(), TokenBucket::new(&limit))
            })
            .collect();

        Self {
            providers,
            order: config.provider_order.clone(),
            budgets,
            cooldowns: DashMap::new(),
            provider_cooldown: config.provider_cooldown,
            cache: AggregatorCache::new(config.cache.max_entries),
            ttls: config.cache.clone(),
            inflight: Mutex::new(HashMap::new()),
        }
    }

    /// Serve a logical data request through cache, coalescing, and the
    /// provider fallback chain. Returns the normalized response envelope.
    pub async fn request(
        self: &Arc<Self>,
        operation: Operation,
        params: Value,
        ctx: &RequestContext,
    ) -> Result<Value> {
        let key = fingerprint(operation, &params);

        if let Some(hit) = self.cache.get(&key) {
            debug!(operation = operation.as_str(), "Cache hit");
            return Ok(envelope(&hit.data, "cache", hit.fetched_at, true, &[]));
        }

        let flight = match self.join_flight(operation, params, key, ctx) {
            FlightOrHit::Hit(hit) => {
                return Ok(envelope(&hit.data, "cache", hit.fetched_at, true, &[]));
            }
            FlightOrHit::Flight(flight) => flight,
        };
        let outcome = ctx
            .run("aggregate fetch", async move {
                flight.await.map_err(Error::from)
            })
            .await?;

        Ok(envelope(
            &outcome.payload.data,
            &outcome.payload.origin,
            outcome.payload.fetched_at,
            false,
            &outcome.fallback_chain,
        ))
    }

    /// Entries currently cached (test and observability hook)
    #[must_use]
    pub fn cached_entries(&self) -> usize {
        self.cache.len()
    }

    /// Join an existing flight for this fingerprint or start a new one.
    /// Only one upstream chain runs per fingerprint at any moment; a failed
    /// chain delivers the same error value to every waiter.
    fn join_flight(
        self: &Arc<Self>,
        operation: Operation,
        params: Value,
        key: String,
        ctx: &RequestContext,
    ) -> FlightOrHit {
        let mut inflight = self.inflight.lock();
        if let Some(existing) = inflight.get(&key) {
            debug!(operation = operation.as_str(), "Coalescing into in-flight fetch");
            return FlightOrHit::Flight(existing.clone());
        }
        // A flight may have landed between the caller's cache miss and this
        // lock; re-check under the lock so a straggler never refetches.
        if let Some(hit) = self.cache.get(&key) {
            return FlightOrHit::Hit(hit);
        }

        let this = Arc::clone(self);
        let flight_key = key.clone();
        let deadline = ctx.deadline();
        let fut: Pin<Box<dyn Future<Output = FlightResult> + Send>> = Box::pin(async move {
            let result = this.run_chain(operation, &params, deadline).await;
            // Cache before unregistering the flight so a racing request
            // either joins us or sees the fresh entry.
            if let Ok(outcome) = &result {
                this.cache.insert(
                    flight_key.clone(),
                    outcome.payload.clone(),
                    this.ttls.ttl_for(operation.as_str()),
                );
            }
            this.inflight.lock().remove(&flight_key);
            result
        });
        let shared = fut.shared();
        inflight.insert(key, shared.clone());
        FlightOrHit::Flight(shared)
    }

    /// Walk the ordered provider list until one succeeds or the chain is
    /// exhausted.
    async fn run_chain(
        &self,
        operation: Operation,
        params: &Value,
        deadline: tokio::time::Instant,
    ) -> FlightResult {
        let order = self.order.get(operation.as_str()).cloned().unwrap_or_else(|| {
            self.providers.iter().map(|p| p.id().to_string()).collect()
        });

        let mut chain: Vec<String> = Vec::new();
        let mut breakdown: Vec<(String, String)> = Vec::new();
        let mut all_rate_limited = true;

        for pid in order {
            let Some(provider) = self.providers.iter().find(|p| p.id() == pid) else {
                warn!(provider = %pid, "Configured provider not built, skipping");
                continue;
            };
            if !provider.supports(operation, params) {
                continue;
            }
            if let Some(until) = self.cooldowns.get(&pid) {
                if *until > Instant::now() {
                    breakdown.push((pid.clone(), "cooling down after unavailability".into()));
                    all_rate_limited = false;
                    continue;
                }
            }

            chain.push(pid.clone());

            if let Some(bucket) = self.budgets.get(&pid) {
                if !bucket.try_acquire() {
                    debug!(provider = %pid, "Provider budget exhausted");
                    breakdown.push((pid.clone(), "rate limit budget exhausted".into()));
                    continue;
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Err(AggregateError::Deadline(operation.as_str().to_string()));
            }
            let remaining = deadline - now;

            match provider.fetch(operation, params, remaining).await {
                Ok(raw) => match provider.normalize(operation, &raw) {
                    Ok(data) => {
                        info!(
                            provider = %pid,
                            operation = operation.as_str(),
                            attempted = chain.len(),
                            "Provider chain succeeded"
                        );
                        return Ok(FetchOutcome {
                            payload: CachedPayload {
                                data,
                                origin: pid,
                                fetched_at: Utc::now(),
                            },
                            fallback_chain: chain,
                        });
                    }
                    Err(e) => {
                        warn!(provider = %pid, error = %e, "Normalization failed");
                        breakdown.push((pid.clone(), e.to_string()));
                        all_rate_limited = false;
                    }
                },
                Err(ProviderError::NotFound(m)) => {
                    // Canonical absence: later providers would only disagree.
                    return Err(AggregateError::NotFound(m));
                }
                Err(ProviderError::PermanentUnavailable(m)) => {
                    warn!(provider = %pid, "Provider unavailable, cooling down");
                    self.cooldowns
                        .insert(pid.clone(), Instant::now() + self.provider_cooldown);
                    breakdown.push((pid.clone(), m));
                    all_rate_limited = false;
                }
                Err(ProviderError::RateLimited(m)) => {
                    breakdown.push((pid.clone(), m));
                }
                Err(e) => {
                    breakdown.push((pid.clone(), e.to_string()));
                    all_rate_limited = false;
                }
            }
        }

        if all_rate_limited && !breakdown.is_empty() {
            Err(AggregateError::RateLimited(operation.as_str().to_string()))
        } else {
            Err(AggregateError::AllFailed {
                operation: operation.as_str().to_string(),
                breakdown,
            })
        }
    }
}

/// Build the normalized response envelope
fn envelope(
    data: &Value,
    source: &str,
    fetched_at: DateTime<Utc>,
    cache_hit: bool,
    fallback_chain: &[String],
) -> Value {
    json!({
        "data": data,
        "metadata": {
            "source": source,
            "fetchedAt": fetched_at.to_rfc3339(),
            "cacheHit": cache_hit,
            "fallbackChain": fallback_chain,
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ProviderConfig, ProviderRateLimit};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted in-memory provider
    struct FakeProvider {
        id: String,
        calls: AtomicUsize,
        outcome: Box<dyn Fn(u32) -> std::result::Result<Value, ProviderError> + Send + Sync>,
    }

    impl FakeProvider {
        fn ok(id: &str, data: Value) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                calls: AtomicUsize::new(0),
                outcome: Box::new(move |_| Ok(data.clone())),
            })
        }

        fn failing(
            id: &str,
            f: impl Fn(u32) -> std::result::Result<Value, ProviderError> + Send + Sync + 'static,
        ) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                calls: AtomicUsize::new(0),
                outcome: Box::new(f),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn id(&self) -> &str {
            &self.id
        }

        fn supports(&self, _operation: Operation, _params: &Value) -> bool {
            true
        }

        async fn fetch(
            &self,
            _operation: Operation,
            _params: &Value,
            _remaining: Duration,
        ) -> std::result::Result<RawResponse, ProviderError> {
            #[allow(clippy::cast_possible_truncation)]
            let n = self.calls.fetch_add(1, Ordering::SeqCst) as u32;
            match (self.outcome)(n) {
                Ok(data) => Ok(RawResponse {
                    body: data.to_string(),
                    params: Value::Null,
                }),
                Err(e) => Err(e),
            }
        }

        fn normalize(
            &self,
            _operation: Operation,
            raw: &RawResponse,
        ) -> std::result::Result<Value, ProviderError> {
            serde_json::from_str(&raw.body)
                .map_err(|e| ProviderError::Malformed(e.to_string()))
        }
    }

    fn config_with_order(order: &[(&str, &[&str])]) -> AggregatorConfig {
        let mut config = AggregatorConfig::default();
        config.provider_order = order
            .iter()
            .map(|(op, ids)| {
                (
                    (*op).to_string(),
                    ids.iter().map(ToString::to_string).collect(),
                )
            })
            .collect();
        config
    }

    fn ctx() -> RequestContext {
        RequestContext::new(Duration::from_secs(5))
    }

    #[tokio::test]
    async fn first_provider_success_short_chain() {
        let alpha = FakeProvider::ok("alpha", json!({"price": 1.0}));
        let config = config_with_order(&[("quote", &["alpha", "beta"])]);
        let agg = Arc::new(Aggregator::new(
            &config,
            vec![alpha.clone() as Arc<dyn Provider>],
        ));

        let out = agg
            .request(Operation::Quote, json!({"symbol": "AAPL"}), &ctx())
            .await
            .unwrap();
        assert_eq!(out["metadata"]["source"], "alpha");
        assert_eq!(out["metadata"]["cacheHit"], false);
        assert_eq!(out["metadata"]["fallbackChain"], json!(["alpha"]));
    }

    #[tokio::test]
    async fn second_identical_request_hits_cache() {
        let alpha = FakeProvider::ok("alpha", json!({"price": 2.5}));
        let config = config_with_order(&[("quote", &["alpha"])]);
        let agg = Arc::new(Aggregator::new(
            &config,
            vec![alpha.clone() as Arc<dyn Provider>],
        ));
        let params = json!({"symbol": "AAPL"});

        let first = agg
            .request(Operation::Quote, params.clone(), &ctx())
            .await
            .unwrap();
        let second = agg
            .request(Operation::Quote, params, &ctx())
            .await
            .unwrap();

        assert_eq!(first["data"], second["data"], "cache idempotence");
        assert_eq!(second["metadata"]["cacheHit"], true);
        assert_eq!(second["metadata"]["source"], "cache");
        assert_eq!(alpha.call_count(), 1);
    }

    #[tokio::test]
    async fn rate_limited_primary_falls_back_in_order() {
        let alpha = FakeProvider::ok("alpha", json!({"price": 1.0}));
        let beta = FakeProvider::ok("beta", json!({"price": 2.0}));
        let mut config = config_with_order(&[("quote", &["alpha", "beta"])]);
        // alpha has a single token and no refill.
        config.providers.insert(
            "alpha".to_string(),
            ProviderConfig {
                rate_limit: ProviderRateLimit {
                    capacity: 1,
                    refill_per_second: 0.0,
                },
                ..ProviderConfig::default()
            },
        );
        let agg = Arc::new(Aggregator::new(
            &config,
            vec![
                alpha.clone() as Arc<dyn Provider>,
                beta.clone() as Arc<dyn Provider>,
            ],
        ));

        let first = agg
            .request(Operation::Quote, json!({"symbol": "AAPL"}), &ctx())
            .await
            .unwrap();
        assert_eq!(first["metadata"]["source"], "alpha");

        // New fingerprint so the cache does not interfere.
        let second = agg
            .request(Operation::Quote, json!({"symbol": "MSFT"}), &ctx())
            .await
            .unwrap();
        assert_eq!(second["metadata"]["source"], "beta");
        assert_eq!(second["metadata"]["fallbackChain"], json!(["alpha", "beta"]));
        assert_eq!(alpha.call_count(), 1, "empty budget must not call upstream");
    }

    #[tokio::test]
    async fn not_found_stops_the_chain() {
        let alpha = FakeProvider::failing("alpha", |_| {
            Err(ProviderError::NotFound("no such symbol".into()))
        });
        let beta = FakeProvider::ok("beta", json!({"price": 9.0}));
        let config = config_with_order(&[("quote", &["alpha", "beta"])]);
        let agg = Arc::new(Aggregator::new(
            &config,
            vec![
                alpha as Arc<dyn Provider>,
                beta.clone() as Arc<dyn Provider>,
            ],
        ));

        let err = agg
            .request(Operation::Quote, json!({"symbol": "NOPE"}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DataNotFound(_)));
        assert_eq!(beta.call_count(), 0, "later providers must not be consulted");
    }

    #[tokio::test]
    async fn transient_and_malformed_continue_to_next_provider() {
        let alpha =
            FakeProvider::failing("alpha", |_| Err(ProviderError::Transient("503".into())));
        let beta = FakeProvider::ok("beta", json!({"price": 3.0}));
        let config = config_with_order(&[("quote", &["alpha", "beta"])]);
        let agg = Arc::new(Aggregator::new(
            &config,
            vec![alpha as Arc<dyn Provider>, beta as Arc<dyn Provider>],
        ));

        let out = agg
            .request(Operation::Quote, json!({"symbol": "AAPL"}), &ctx())
            .await
            .unwrap();
        assert_eq!(out["metadata"]["source"], "beta");
        assert_eq!(out["metadata"]["fallbackChain"], json!(["alpha", "beta"]));
    }

    #[tokio::test]
    async fn unavailable_provider_enters_cooldown() {
        let alpha = FakeProvider::failing("alpha", |_| {
            Err(ProviderError::PermanentUnavailable("401".into()))
        });
        let beta = FakeProvider::ok("beta", json!({"price": 4.0}));
        let config = config_with_order(&[("quote", &["alpha", "beta"])]);
        let agg = Arc::new(Aggregator::new(
            &config,
            vec![
                alpha.clone() as Arc<dyn Provider>,
                beta as Arc<dyn Provider>,
            ],
        ));

        agg.request(Operation::Quote, json!({"symbol": "A"}), &ctx())
            .await
            .unwrap();
        assert_eq!(alpha.call_count(), 1);

        // While cooling down, alpha is skipped without an upstream call.
        agg.request(Operation::Quote, json!({"symbol": "B"}), &ctx())
            .await
            .unwrap();
        assert_eq!(alpha.call_count(), 1);
    }

    #[tokio::test]
    async fn all_failed_carries_breakdown() {
        let alpha =
            FakeProvider::failing("alpha", |_| Err(ProviderError::Transient("boom".into())));
        let config = config_with_order(&[("quote", &["alpha"])]);
        let agg = Arc::new(Aggregator::new(&config, vec![alpha as Arc<dyn Provider>]));

        let err = agg
            .request(Operation::Quote, json!({"symbol": "AAPL"}), &ctx())
            .await
            .unwrap_err();
        match err {
            Error::AllProvidersFailed {
                operation,
                breakdown,
            } => {
                assert_eq!(operation, "quote");
                assert_eq!(breakdown.len(), 1);
                assert_eq!(breakdown[0].0, "alpha");
            }
            other => panic!("expected AllProvidersFailed, got {other}"),
        }
    }

    #[tokio::test]
    async fn all_rate_limited_surfaces_dedicated_error() {
        let alpha = FakeProvider::ok("alpha", json!({"price": 1.0}));
        let mut config = config_with_order(&[("quote", &["alpha"])]);
        config.providers.insert(
            "alpha".to_string(),
            ProviderConfig {
                rate_limit: ProviderRateLimit {
                    capacity: 0,
                    refill_per_second: 0.0,
                },
                ..ProviderConfig::default()
            },
        );
        let agg = Arc::new(Aggregator::new(
            &config,
            vec![alpha as Arc<dyn Provider>],
        ));

        let err = agg
            .request(Operation::Quote, json!({"symbol": "AAPL"}), &ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProviderRateLimited(_)));
    }

    #[tokio::test]
    async fn concurrent_identical_requests_coalesce_to_one_fetch() {
        let alpha = Arc::new(FakeProvider {
            id: "alpha".to_string(),
            calls: AtomicUsize::new(0),
            outcome: Box::new(|_| Ok(json!({"price": 7.0}))),
        });
        let config = config_with_order(&[("quote", &["alpha"])]);
        let agg = Arc::new(Aggregator::new(
            &config,
            vec![alpha.clone() as Arc<dyn Provider>],
        ));

        let tasks: Vec<_> = (0..100)
            .map(|_| {
                let agg = Arc::clone(&agg);
                tokio::spawn(async move {
                    let ctx = RequestContext::new(Duration::from_secs(5));
                    agg.request(Operation::Quote, json!({"symbol": "AAPL"}), &ctx)
                        .await
                })
            })
            .collect();

        let mut first_data = None;
        for task in tasks {
            let out = task.await.unwrap().unwrap();
            let data = out["data"].clone();
            if let Some(prev) = &first_data {
                assert_eq!(prev, &data, "all waiters must see identical data");
            } else {
                first_data = Some(data);
            }
        }
        assert_eq!(alpha.call_count(), 1, "exactly one upstream call");
    }

    #[tokio::test]
    async fn coalesced_failure_reaches_every_waiter() {
        let alpha = FakeProvider::failing("alpha", |_| {
            Err(ProviderError::Transient("down".into()))
        });
        let config = config_with_order(&[("quote", &["alpha"])]);
        let agg = Arc::new(Aggregator::new(
            &config,
            vec![alpha as Arc<dyn Provider>],
        ));

        let tasks: Vec<_> = (0..10)
            .map(|_| {
                let agg = Arc::clone(&agg);
                tokio::spawn(async move {
                    let ctx = RequestContext::new(Duration::from_secs(5));
                    agg.request(Operation::Quote, json!({"symbol": "AAPL"}), &ctx)
                        .await
                })
            })
            .collect();

        for task in tasks {
            let err = task.await.unwrap().unwrap_err();
            assert_eq!(err.to_rpc_code(), -32011);
        }
    }

    #[tokio::test]
    async fn expired_deadline_fails_without_cache_insert() {
        let slow = FakeProvider::ok("slow", json!({"price": 1.0}));
        let config = config_with_order(&[("quote", &["slow"])]);
        let agg = Arc::new(Aggregator::new(
            &config,
            vec![slow as Arc<dyn Provider>],
        ));

        let ctx = RequestContext::new(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(5)).await;
        let err = agg
            .request(Operation::Quote, json!({"symbol": "AAPL"}), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.to_rpc_code(), -32004);
        assert_eq!(agg.cached_entries(), 0, "no cache entry on timeout");
    }
}
