//! Configuration management
//!
//! One structured source per process: a YAML file merged with
//! `FIN_HUB_`-prefixed environment variables. Configuration is immutable
//! for the process lifetime; a reload is a restart.

use std::{
    collections::HashMap,
    env,
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::secrets::Credential;
use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Loaded in order, later files override earlier. Variables are set into
    /// the process environment for `${VAR}` resolution.
    pub env_files: Vec<String>,
    /// Hub configuration
    pub hub: HubConfig,
    /// Spoke configuration
    pub spoke: SpokeConfig,
    /// Aggregator configuration (market spoke)
    pub aggregator: AggregatorConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("FIN_HUB_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars();

        Ok(config)
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let path = Path::new(path_str);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("Loaded env file: {path_str}"),
                    Err(e) => tracing::warn!("Failed to load env file {path_str}: {e}"),
                }
            } else {
                tracing::debug!("Env file not found (skipped): {path_str}");
            }
        }
    }

    /// Expand `${VAR}` and `${VAR:-default}` patterns in config values
    fn expand_env_vars(&mut self) {
        #[allow(clippy::unwrap_used)]
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();

        for provider in self.aggregator.providers.values_mut() {
            if let Some(url) = provider.base_url.as_mut() {
                *url = Self::expand_string(&re, url);
            }
            if let Some(cred) = provider.credential.as_mut() {
                *cred = Credential::new(Self::expand_string(&re, cred.expose()));
            }
        }
        self.spoke.hub_address = Self::expand_string(&re, &self.spoke.hub_address);
    }

    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

// ============================================================================
// Hub
// ============================================================================

/// Hub-side configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct HubConfig {
    /// Frontend server configuration
    pub server: ServerConfig,
    /// Service registry & health monitor configuration
    pub registry: RegistryConfig,
    /// Tool execution router configuration
    pub router: RouterConfig,
}

/// Frontend server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Per-request deadline applied by the frontend
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum concurrently-executing inbound requests
    pub max_in_flight: usize,
    /// Bounded wait queue beyond `max_in_flight`; overflow is rejected
    pub max_queued: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8700,
            request_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
            max_in_flight: 256,
            max_queued: 1024,
        }
    }
}

/// Service registry & health monitor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Interval between health sweeps
    #[serde(with = "humantime_serde")]
    pub probe_interval: Duration,
    /// Per-probe timeout
    #[serde(with = "humantime_serde")]
    pub probe_timeout: Duration,
    /// Consecutive failed probes before Warning becomes Critical
    pub critical_after_probes: u32,
    /// Heartbeat age past which an instance is forced Critical
    #[serde(with = "humantime_serde")]
    pub heartbeat_ttl: Duration,
    /// Critical age past which an instance is purged
    #[serde(with = "humantime_serde")]
    pub deregister_after: Duration,
    /// Write-through snapshot file for crash recovery (disabled when unset)
    pub snapshot_path: Option<PathBuf>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(3),
            critical_after_probes: 3,
            heartbeat_ttl: Duration::from_secs(30),
            deregister_after: Duration::from_secs(300),
            snapshot_path: None,
        }
    }
}

/// Tool execution router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Concurrency permits per spoke instance
    pub per_instance_capacity: usize,
    /// Ceiling on a single spoke call
    #[serde(with = "humantime_serde")]
    pub per_call_timeout: Duration,
    /// Wait for an instance permit before trying the next candidate
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// Retries across instances after the first attempt
    pub max_retries: u32,
    /// Circuit breaker configuration
    pub breaker: BreakerConfig,
    /// Retry backoff configuration
    pub backoff: BackoffConfig,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            per_instance_capacity: 10,
            per_call_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_millis(100),
            max_retries: 2,
            breaker: BreakerConfig::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Circuit breaker configuration, one breaker per (tool, instance)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Time an open circuit waits before admitting a half-open probe
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Retry backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial backoff
    #[serde(with = "humantime_serde")]
    pub base: Duration,
    /// Backoff ceiling
    #[serde(with = "humantime_serde")]
    pub max: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
        }
    }
}

// ============================================================================
// Spoke
// ============================================================================

/// Spoke-side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SpokeConfig {
    /// Logical service name, e.g. `market-spoke`
    pub name: String,
    /// Host to bind to
    pub host: String,
    /// Port to listen on (0 = ephemeral)
    pub port: u16,
    /// Hub base URL for registration and heartbeats
    pub hub_address: String,
    /// Capability tags advertised at registration
    pub tags: Vec<String>,
    /// Free-form metadata (version, region, ...)
    pub metadata: HashMap<String, String>,
    /// Heartbeat interval
    #[serde(with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    /// Give up on startup if unregistered past this deadline
    #[serde(with = "humantime_serde")]
    pub startup_registration_deadline: Duration,
    /// Drain window for in-flight calls on shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    /// Per-request deadline applied to inbound tool calls
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for SpokeConfig {
    fn default() -> Self {
        Self {
            name: "market-spoke".to_string(),
            host: "127.0.0.1".to_string(),
            port: 0,
            hub_address: "http://127.0.0.1:8700".to_string(),
            tags: Vec::new(),
            metadata: HashMap::new(),
            heartbeat_interval: Duration::from_secs(10),
            startup_registration_deadline: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
        }
    }
}

// ============================================================================
// Aggregator
// ============================================================================

/// Multi-source data aggregator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Ordered provider ids per operation, e.g. `quote: [yahoo, stooq]`
    pub provider_order: HashMap<String, Vec<String>>,
    /// Response cache configuration
    pub cache: AggregatorCacheConfig,
    /// Per-provider settings keyed by provider id
    pub providers: HashMap<String, ProviderConfig>,
    /// Unhealthy-provider cooldown after `PermanentUnavailable`
    #[serde(with = "humantime_serde")]
    pub provider_cooldown: Duration,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        let mut provider_order = HashMap::new();
        provider_order.insert("quote".to_string(), vec!["yahoo".to_string(), "stooq".to_string()]);
        provider_order.insert("history".to_string(), vec!["yahoo".to_string()]);
        provider_order.insert("fx_rate".to_string(), vec!["ecb".to_string()]);

        Self {
            provider_order,
            cache: AggregatorCacheConfig::default(),
            providers: HashMap::new(),
            provider_cooldown: Duration::from_secs(60),
        }
    }
}

/// Aggregator cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorCacheConfig {
    /// Maximum number of entries before LRU eviction
    pub max_entries: usize,
    /// Per-operation TTL
    #[serde(with = "duration_map_serde")]
    pub ttl: HashMap<String, Duration>,
}

impl AggregatorCacheConfig {
    /// TTL for an operation, falling back to the quote TTL
    #[must_use]
    pub fn ttl_for(&self, operation: &str) -> Duration {
        self.ttl
            .get(operation)
            .copied()
            .unwrap_or(Duration::from_secs(300))
    }
}

impl Default for AggregatorCacheConfig {
    fn default() -> Self {
        let mut ttl = HashMap::new();
        ttl.insert("quote".to_string(), Duration::from_secs(300));
        ttl.insert("fx_rate".to_string(), Duration::from_secs(900));
        ttl.insert("history".to_string(), Duration::from_secs(86_400));

        Self {
            max_entries: 10_000,
            ttl,
        }
    }
}

/// Per-provider configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ProviderConfig {
    /// Override the provider's default base URL (useful for tests)
    pub base_url: Option<String>,
    /// API credential; resolved from `${VAR}`, never logged
    pub credential: Option<Credential>,
    /// Token bucket limits for this provider
    pub rate_limit: ProviderRateLimit,
}

/// Token bucket limits for one provider
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderRateLimit {
    /// Bucket capacity
    pub capacity: u32,
    /// Tokens added per second (lazy refill)
    pub refill_per_second: f64,
}

impl Default for ProviderRateLimit {
    fn default() -> Self {
        Self {
            capacity: 10,
            refill_per_second: 1.0,
        }
    }
}

// ============================================================================
// Duration (de)serialization helpers
// ============================================================================

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() > 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse(s: &str) -> Result<Duration, String> {
        let parse_u64 = |v: &str| {
            v.parse::<u64>()
                .map_err(|e| format!("invalid duration '{s}': {e}"))
        };
        if let Some(ms) = s.strip_suffix("ms") {
            parse_u64(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            parse_u64(secs).map(Duration::from_secs)
        } else if let Some(mins) = s.strip_suffix('m') {
            parse_u64(mins).map(|m| Duration::from_secs(m * 60))
        } else if let Some(hours) = s.strip_suffix('h') {
            parse_u64(hours).map(|h| Duration::from_secs(h * 3600))
        } else {
            // Bare number: assume seconds
            parse_u64(s).map(Duration::from_secs)
        }
    }
}

/// Serde for `HashMap<String, Duration>` with humantime values
mod duration_map_serde {
    use std::collections::HashMap;
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, ser::SerializeMap};

    pub fn serialize<S>(map: &HashMap<String, Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut m = serializer.serialize_map(Some(map.len()))?;
        for (k, v) in map {
            m.serialize_entry(k, &format!("{}s", v.as_secs()))?;
        }
        m.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<HashMap<String, Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: HashMap<String, String> = HashMap::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(k, v)| {
                super::humantime_serde::parse(&v)
                    .map(|d| (k, d))
                    .map_err(serde::de::Error::custom)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_timeouts() {
        let config = Config::default();
        assert_eq!(config.hub.registry.probe_interval, Duration::from_secs(10));
        assert_eq!(config.hub.registry.probe_timeout, Duration::from_secs(3));
        assert_eq!(config.hub.registry.critical_after_probes, 3);
        assert_eq!(config.hub.registry.heartbeat_ttl, Duration::from_secs(30));
        assert_eq!(
            config.hub.registry.deregister_after,
            Duration::from_secs(300)
        );
        assert_eq!(config.hub.router.per_instance_capacity, 10);
        assert_eq!(config.hub.router.per_call_timeout, Duration::from_secs(30));
        assert_eq!(
            config.hub.router.acquire_timeout,
            Duration::from_millis(100)
        );
        assert_eq!(config.hub.router.max_retries, 2);
        assert_eq!(config.hub.router.breaker.failure_threshold, 5);
        assert_eq!(config.hub.router.breaker.cooldown, Duration::from_secs(30));
        assert_eq!(config.spoke.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(
            config.spoke.startup_registration_deadline,
            Duration::from_secs(60)
        );
        assert_eq!(config.spoke.shutdown_grace, Duration::from_secs(30));
        assert_eq!(config.aggregator.cache.max_entries, 10_000);
        assert_eq!(config.aggregator.provider_cooldown, Duration::from_secs(60));
    }

    #[test]
    fn duration_strings_parse() {
        assert_eq!(
            humantime_serde::parse("100ms").unwrap(),
            Duration::from_millis(100)
        );
        assert_eq!(humantime_serde::parse("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(humantime_serde::parse("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(humantime_serde::parse("24h").unwrap(), Duration::from_secs(86_400));
        assert_eq!(humantime_serde::parse("45").unwrap(), Duration::from_secs(45));
        assert!(humantime_serde::parse("fast").is_err());
    }

    #[test]
    fn yaml_config_deserializes() {
        let yaml = r#"
hub:
  server:
    host: "0.0.0.0"
    port: 9000
    request_timeout: "20s"
  registry:
    probe_interval: "5s"
    deregister_after: "2m"
  router:
    max_retries: 3
    breaker:
      failure_threshold: 2
      cooldown: "10s"
aggregator:
  cache:
    max_entries: 50
    ttl:
      quote: "1m"
  providers:
    yahoo:
      rate_limit:
        capacity: 5
        refill_per_second: 0.5
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.hub.server.port, 9000);
        assert_eq!(config.hub.registry.probe_interval, Duration::from_secs(5));
        assert_eq!(
            config.hub.registry.deregister_after,
            Duration::from_secs(120)
        );
        assert_eq!(config.hub.router.breaker.failure_threshold, 2);
        assert_eq!(
            config.aggregator.cache.ttl_for("quote"),
            Duration::from_secs(60)
        );
        assert_eq!(config.aggregator.providers["yahoo"].rate_limit.capacity, 5);
    }

    #[test]
    fn ttl_for_unknown_operation_falls_back() {
        let cache = AggregatorCacheConfig::default();
        assert_eq!(cache.ttl_for("made_up"), Duration::from_secs(300));
    }

    #[test]
    fn credential_expansion_from_env() {
        // Unique variable name so parallel tests can't collide.
        let yaml = r#"
aggregator:
  providers:
    yahoo:
      credential: "${FIN_HUB_TEST_CRED_A:-fallback-key}"
"#;
        let mut config: Config = serde_yaml::from_str(yaml).unwrap();
        config.expand_env_vars();
        assert_eq!(
            config.aggregator.providers["yahoo"]
                .credential
                .as_ref()
                .unwrap()
                .expose(),
            "fallback-key"
        );
    }

    #[test]
    fn load_env_files_skips_missing() {
        let config = Config {
            env_files: vec!["/nonexistent/path/.env".to_string()],
            ..Default::default()
        };
        // Should not panic
        config.load_env_files();
    }

    #[test]
    fn load_from_file_and_missing_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fin-hub.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "hub:\n  server:\n    port: 8123").unwrap();
        drop(f);

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.hub.server.port, 8123);

        let missing = dir.path().join("nope.yaml");
        assert!(Config::load(Some(&missing)).is_err());
    }
}
