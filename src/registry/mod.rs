//! Service registry: dynamic registration, health-gated visibility, and
//! tag/capability-indexed lookup for spoke services.
//!
//! The authoritative state is a single in-memory map guarded by a
//! reader-writer lock; readers see atomic snapshots, writers are serialized.
//! A write-through JSON snapshot file provides crash recovery: registrations
//! survive a hub restart and are re-probed from `Unknown`.

mod instance;
mod sweeper;

pub use instance::{
    DiscoverFilter, HealthStatus, Registration, ServiceInstance, ToolDescriptor,
};
pub use sweeper::{HealthSweeper, probe_health_endpoint};

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::RegistryConfig;
use crate::{Error, Result};

/// Authoritative registry state. Cloned wholesale for write-through commits
/// so a failed snapshot write leaves the published state untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryState {
    /// `instanceId -> ServiceInstance`
    instances: HashMap<String, ServiceInstance>,
    /// `qualifiedName -> ToolDescriptor`
    tools: HashMap<String, ToolDescriptor>,
    /// `serviceName -> set of instanceId`
    name_index: HashMap<String, BTreeSet<String>>,
}

/// Service registry & health monitor
pub struct ServiceRegistry {
    /// Authoritative state
    state: RwLock<RegistryState>,
    /// Registry configuration
    config: RegistryConfig,
}

impl ServiceRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            config,
        }
    }

    /// Create a registry, recovering registrations from the snapshot file
    /// if one exists. Recovered instances start as `Unknown` and regain
    /// visibility once the sweeper probes them.
    #[must_use]
    pub fn with_recovery(config: RegistryConfig) -> Self {
        let registry = Self::new(config);

        if let Some(path) = registry.config.snapshot_path.clone() {
            match Self::load_snapshot(&path) {
                Ok(Some(mut state)) => {
                    let now = Utc::now();
                    for inst in state.instances.values_mut() {
                        inst.status = HealthStatus::Unknown;
                        inst.consecutive_probe_failures = 0;
                        inst.critical_since = None;
                        inst.version += 1;
                        inst.last_heartbeat_at = now;
                    }
                    let count = state.instances.len();
                    *registry.state.write() = state;
                    info!(instances = count, path = %path.display(), "Recovered registry snapshot");
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, path = %path.display(), "Failed to recover registry snapshot"),
            }
        }

        registry
    }

    /// Registry configuration
    #[must_use]
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    // ── Public operations ─────────────────────────────────────────────────

    /// Register an instance and its tool manifest.
    ///
    /// Assigns `registered_at`, sets status `Passing`, and stores the
    /// instance. Re-registration of a known id replaces the row and keeps
    /// its version monotonic.
    ///
    /// # Errors
    ///
    /// Rejects the registration when a tool's qualified name is already
    /// owned by a different service name, or when the write-through
    /// snapshot cannot be persisted (the instance is then not visible).
    pub fn register(&self, registration: Registration) -> Result<ServiceInstance> {
        let mut state = self.state.write();

        // Reject tool name collisions across service names before mutating.
        for tool in &registration.tools {
            if let Some(existing) = state.tools.get(&tool.qualified_name) {
                if existing.owning_service != registration.name {
                    return Err(Error::Registration(format!(
                        "tool '{}' is already owned by service '{}'",
                        tool.qualified_name, existing.owning_service
                    )));
                }
            }
        }

        let mut next = state.clone();
        let now = Utc::now();
        let prior_version = next
            .instances
            .get(&registration.id)
            .map_or(0, |existing| existing.version);

        let instance = ServiceInstance {
            id: registration.id.clone(),
            name: registration.name.clone(),
            address: registration.address,
            tags: registration.tags,
            metadata: registration.metadata,
            health_endpoint: registration.health_endpoint,
            registered_at: now,
            last_heartbeat_at: now,
            status: HealthStatus::Passing,
            version: prior_version + 1,
            consecutive_probe_failures: 0,
            critical_since: None,
        };

        next.instances
            .insert(instance.id.clone(), instance.clone());
        next.name_index
            .entry(registration.name.clone())
            .or_default()
            .insert(instance.id.clone());
        for mut tool in registration.tools {
            tool.owning_service = registration.name.clone();
            next.tools.insert(tool.qualified_name.clone(), tool);
        }

        self.commit(&mut state, next)?;
        info!(
            instance = %instance.id,
            service = %instance.name,
            "Instance registered"
        );
        Ok(instance)
    }

    /// Remove an instance. Tool descriptors are dropped once the last
    /// instance of their owning service is gone.
    ///
    /// # Errors
    ///
    /// Returns an error when the instance id is unknown.
    pub fn deregister(&self, instance_id: &str) -> Result<ServiceInstance> {
        let mut state = self.state.write();
        let mut next = state.clone();

        let Some(instance) = next.instances.remove(instance_id) else {
            return Err(Error::UnknownInstance(instance_id.to_string()));
        };

        let orphaned = if let Some(peers) = next.name_index.get_mut(&instance.name) {
            peers.remove(instance_id);
            peers.is_empty()
        } else {
            false
        };
        if orphaned {
            next.name_index.remove(&instance.name);
            next.tools
                .retain(|_, tool| tool.owning_service != instance.name);
        }

        self.commit(&mut state, next)?;
        info!(instance = %instance_id, service = %instance.name, "Instance deregistered");
        Ok(instance)
    }

    /// Record a heartbeat. Returns the instance's current status and health
    /// endpoint so the caller can trigger an immediate recovery probe when
    /// the instance is `Critical`.
    ///
    /// # Errors
    ///
    /// Returns an error when the instance id is unknown.
    pub fn heartbeat(&self, instance_id: &str) -> Result<(HealthStatus, String)> {
        let mut state = self.state.write();
        let Some(instance) = state.instances.get_mut(instance_id) else {
            return Err(Error::UnknownInstance(instance_id.to_string()));
        };
        instance.last_heartbeat_at = Utc::now();
        Ok((instance.status, instance.health_endpoint.clone()))
    }

    /// Instances matching the filter, as an atomic snapshot
    #[must_use]
    pub fn discover(&self, filter: &DiscoverFilter) -> Vec<ServiceInstance> {
        let state = self.state.read();
        let mut matched: Vec<ServiceInstance> = state
            .instances
            .values()
            .filter(|inst| filter.matches(inst))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }

    /// Tool descriptors whose owning service has at least one instance at
    /// `min_status` or better
    #[must_use]
    pub fn list_tools(&self, min_status: HealthStatus) -> Vec<ToolDescriptor> {
        let state = self.state.read();
        let mut tools: Vec<ToolDescriptor> = state
            .tools
            .values()
            .filter(|tool| {
                state
                    .name_index
                    .get(&tool.owning_service)
                    .is_some_and(|ids| {
                        ids.iter().any(|id| {
                            state
                                .instances
                                .get(id)
                                .is_some_and(|inst| inst.status.at_least(min_status))
                        })
                    })
            })
            .cloned()
            .collect();
        tools.sort_by(|a, b| a.qualified_name.cmp(&b.qualified_name));
        tools
    }

    /// Resolve a tool name to its owning service name
    #[must_use]
    pub fn resolve_tool(&self, qualified_name: &str) -> Option<String> {
        self.state
            .read()
            .tools
            .get(qualified_name)
            .map(|tool| tool.owning_service.clone())
    }

    /// Look up one instance by id
    #[must_use]
    pub fn instance(&self, instance_id: &str) -> Option<ServiceInstance> {
        self.state.read().instances.get(instance_id).cloned()
    }

    // ── Health transitions (sweeper) ──────────────────────────────────────

    /// Apply a successful probe: any status returns to `Passing`.
    pub fn record_probe_success(&self, instance_id: &str) {
        let mut state = self.state.write();
        if let Some(instance) = state.instances.get_mut(instance_id) {
            instance.consecutive_probe_failures = 0;
            if instance.status != HealthStatus::Passing {
                debug!(
                    instance = %instance_id,
                    from = instance.status.as_str(),
                    "Probe succeeded, instance passing"
                );
                instance.status = HealthStatus::Passing;
                instance.critical_since = None;
                instance.version += 1;
            }
        }
    }

    /// Apply a failed probe: `Passing -> Warning` immediately, `Warning ->
    /// Critical` after `critical_after_probes` consecutive failures.
    pub fn record_probe_failure(&self, instance_id: &str) {
        let threshold = self.config.critical_after_probes;
        let mut state = self.state.write();
        if let Some(instance) = state.instances.get_mut(instance_id) {
            instance.consecutive_probe_failures += 1;
            let next = match instance.status {
                HealthStatus::Passing | HealthStatus::Unknown => HealthStatus::Warning,
                HealthStatus::Warning if instance.consecutive_probe_failures >= threshold => {
                    HealthStatus::Critical
                }
                other => other,
            };
            if next != instance.status {
                warn!(
                    instance = %instance_id,
                    from = instance.status.as_str(),
                    to = next.as_str(),
                    failures = instance.consecutive_probe_failures,
                    "Health transition"
                );
                instance.status = next;
                if next == HealthStatus::Critical {
                    instance.critical_since = Some(Utc::now());
                }
                instance.version += 1;
            }
        }
    }

    /// Force `Critical` on instances whose heartbeat is older than the TTL.
    /// A crashed spoke is caught here even when its health endpoint still
    /// answers; whichever signal trips first wins.
    pub fn mark_stale_heartbeats(&self, now: DateTime<Utc>) {
        let ttl = chrono::Duration::from_std(self.config.heartbeat_ttl)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let mut state = self.state.write();
        for instance in state.instances.values_mut() {
            if instance.status != HealthStatus::Critical
                && now - instance.last_heartbeat_at > ttl
            {
                warn!(
                    instance = %instance.id,
                    last_heartbeat = %instance.last_heartbeat_at,
                    "Heartbeat TTL expired, instance critical"
                );
                instance.status = HealthStatus::Critical;
                instance.critical_since = Some(now);
                instance.version += 1;
            }
        }
    }

    /// Purge instances that have been `Critical` longer than the
    /// deregistration TTL. Returns the removed instance ids so the caller
    /// can evict dependent state (breakers, permits).
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let ttl = chrono::Duration::from_std(self.config.deregister_after)
            .unwrap_or_else(|_| chrono::Duration::seconds(300));

        let expired: Vec<String> = {
            let state = self.state.read();
            state
                .instances
                .values()
                .filter(|inst| {
                    inst.status == HealthStatus::Critical
                        && inst
                            .critical_since
                            .is_some_and(|since| now - since > ttl)
                })
                .map(|inst| inst.id.clone())
                .collect()
        };

        for id in &expired {
            if let Err(e) = self.deregister(id) {
                warn!(instance = %id, error = %e, "Failed to purge expired instance");
            }
        }
        expired
    }

    // ── Persistence ───────────────────────────────────────────────────────

    /// Commit a mutated state: write-through to the snapshot file first,
    /// then publish. A failed write aborts the mutation.
    fn commit(&self, state: &mut RegistryState, next: RegistryState) -> Result<()> {
        if let Some(path) = &self.config.snapshot_path {
            Self::write_snapshot(path, &next).map_err(|e| {
                Error::Registration(format!("snapshot write failed: {e}"))
            })?;
        }
        *state = next;
        Ok(())
    }

    fn write_snapshot(path: &PathBuf, state: &RegistryState) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec_pretty(state)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    fn load_snapshot(path: &PathBuf) -> Result<Option<RegistryState>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(path)?;
        let state = serde_json::from_slice(&bytes)?;
        Ok(Some(state))
    }
}
