//! Instance selection policy
//!
//! Weighted round-robin over healthy candidates: weight is the remaining
//! concurrency headroom `max(1, capacity - in_flight)`. Ties break by lowest
//! in-flight count, then by lowest instance id, so selection is fully
//! deterministic for a given load snapshot; rotation emerges from in-flight
//! counts changing between dispatches.

use crate::registry::ServiceInstance;

/// A dispatch candidate with its current in-flight call count
#[derive(Debug)]
pub struct Candidate<'a> {
    /// The instance
    pub instance: &'a ServiceInstance,
    /// Calls currently in flight to this instance
    pub in_flight: usize,
}

/// Pick one instance by weighted headroom.
///
/// Returns `None` only for an empty candidate list.
#[must_use]
pub fn pick<'a>(candidates: &[Candidate<'a>], capacity: usize) -> Option<&'a ServiceInstance> {
    candidates
        .iter()
        .max_by(|a, b| {
            let wa = weight(capacity, a.in_flight);
            let wb = weight(capacity, b.in_flight);
            wa.cmp(&wb)
                // Lower in-flight wins, so compare reversed.
                .then_with(|| b.in_flight.cmp(&a.in_flight))
                // Lower id wins, so compare reversed.
                .then_with(|| b.instance.id.cmp(&a.instance.id))
        })
        .map(|c| c.instance)
}

fn weight(capacity: usize, in_flight: usize) -> usize {
    capacity.saturating_sub(in_flight).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::HealthStatus;
    use chrono::Utc;
    use std::collections::{BTreeSet, HashMap};

    fn instance(id: &str) -> ServiceInstance {
        ServiceInstance {
            id: id.to_string(),
            name: "market-spoke".to_string(),
            address: format!("http://127.0.0.1:9000/{id}"),
            tags: BTreeSet::new(),
            metadata: HashMap::new(),
            health_endpoint: String::new(),
            registered_at: Utc::now(),
            last_heartbeat_at: Utc::now(),
            status: HealthStatus::Passing,
            version: 1,
            consecutive_probe_failures: 0,
            critical_since: None,
        }
    }

    #[test]
    fn prefers_most_headroom() {
        let a = instance("m-1");
        let b = instance("m-2");
        let picked = pick(
            &[
                Candidate { instance: &a, in_flight: 7 },
                Candidate { instance: &b, in_flight: 2 },
            ],
            10,
        )
        .unwrap();
        assert_eq!(picked.id, "m-2");
    }

    #[test]
    fn equal_weight_ties_break_by_in_flight_then_id() {
        let a = instance("m-2");
        let b = instance("m-1");
        // Both saturated past capacity: weight clamps to 1 for both, but
        // in-flight 12 > 11 so the lower one wins.
        let picked = pick(
            &[
                Candidate { instance: &a, in_flight: 12 },
                Candidate { instance: &b, in_flight: 11 },
            ],
            10,
        )
        .unwrap();
        assert_eq!(picked.id, "m-1");

        // Fully symmetric load: lexicographically lowest id wins.
        let picked = pick(
            &[
                Candidate { instance: &a, in_flight: 3 },
                Candidate { instance: &b, in_flight: 3 },
            ],
            10,
        )
        .unwrap();
        assert_eq!(picked.id, "m-1");
    }

    #[test]
    fn selection_is_deterministic() {
        let a = instance("m-1");
        let b = instance("m-2");
        let c = instance("m-3");
        for _ in 0..10 {
            let picked = pick(
                &[
                    Candidate { instance: &a, in_flight: 1 },
                    Candidate { instance: &b, in_flight: 1 },
                    Candidate { instance: &c, in_flight: 0 },
                ],
                10,
            )
            .unwrap();
            assert_eq!(picked.id, "m-3");
        }
    }

    #[test]
    fn empty_candidates_yield_none() {
        assert!(pick(&[], 10).is_none());
    }
}
