//! Registry entities: service instances, tool descriptors, discovery filters

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Health status of a registered instance.
///
/// Ordered from healthiest to worst so `minimum status` filters can use a
/// plain comparison: `Passing < Warning < Critical < Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HealthStatus {
    /// Instance is healthy and visible to dispatch
    Passing,
    /// One failed probe; still dispatchable but degraded
    Warning,
    /// Consecutive probe failures or stale heartbeat; hidden from dispatch
    Critical,
    /// Never probed
    Unknown,
}

impl HealthStatus {
    /// Whether this status satisfies a `minimum status` filter
    #[must_use]
    pub fn at_least(self, minimum: Self) -> bool {
        self <= minimum
    }

    /// Lowercase label used in API responses
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Passing => "passing",
            Self::Warning => "warning",
            Self::Critical => "critical",
            Self::Unknown => "unknown",
        }
    }
}

/// One registered spoke process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Unique id for this process lifetime
    pub id: String,
    /// Logical service name; instances sharing a name are peers
    pub name: String,
    /// Callable JSON-RPC endpoint, e.g. `http://127.0.0.1:9201/mcp`
    pub address: String,
    /// Capability markers
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Free-form metadata (version, region, ...)
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Health probe URL
    pub health_endpoint: String,
    /// Assigned by the registry at registration
    pub registered_at: DateTime<Utc>,
    /// Updated on every heartbeat
    pub last_heartbeat_at: DateTime<Utc>,
    /// Current health status
    pub status: HealthStatus,
    /// Monotonic per-instance version, bumped on every state change
    pub version: u64,
    /// Consecutive failed health probes (drives Warning -> Critical)
    #[serde(default)]
    pub consecutive_probe_failures: u32,
    /// When the instance last entered Critical (drives the deregistration TTL)
    #[serde(default)]
    pub critical_since: Option<DateTime<Utc>>,
}

/// Declared capability of a spoke, attached to a service *name*
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Globally unique dotted name, e.g. `market.stock_quote`
    pub qualified_name: String,
    /// Human-readable description
    #[serde(default)]
    pub description: String,
    /// Input JSON Schema
    pub input_schema: Value,
    /// Output JSON Schema
    #[serde(default)]
    pub output_schema: Option<Value>,
    /// Owning service name, resolved to instances at dispatch time
    pub owning_service: String,
}

/// Registration payload: an instance plus its tool manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Registration {
    /// Instance id chosen by the spoke (unique per process lifetime)
    pub id: String,
    /// Logical service name
    pub name: String,
    /// Callable JSON-RPC endpoint
    pub address: String,
    /// Capability markers
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Free-form metadata
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Health probe URL
    pub health_endpoint: String,
    /// Tools advertised by this service
    #[serde(default)]
    pub tools: Vec<ToolDescriptor>,
}

/// Discovery filter: all present fields must match
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoverFilter {
    /// Logical service name
    pub name: Option<String>,
    /// Required tag
    pub tag: Option<String>,
    /// Minimum health status (`Passing` excludes everything else)
    pub min_status: Option<HealthStatus>,
}

impl DiscoverFilter {
    /// Filter on service name with a minimum status
    #[must_use]
    pub fn service(name: impl Into<String>, min_status: HealthStatus) -> Self {
        Self {
            name: Some(name.into()),
            tag: None,
            min_status: Some(min_status),
        }
    }

    /// Whether an instance matches this filter
    #[must_use]
    pub fn matches(&self, instance: &ServiceInstance) -> bool {
        if let Some(name) = &self.name {
            if &instance.name != name {
                return false;
            }
        }
        if let Some(tag) = &self.tag {
            if !instance.tags.contains(tag) {
                return false;
            }
        }
        if let Some(min) = self.min_status {
            if !instance.status.at_least(min) {
                return false;
            }
        }
        true
    }
}
