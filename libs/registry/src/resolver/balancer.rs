use std::sync::atomic::{AtomicUsize, Ordering};

use super::EndpointSet;
use crate::config::LoadBalancingPolicy;
use crate::endpoint::EndpointDescriptor;

/// Stateful picker over an [`EndpointSet`].
///
/// The cursor is shared by every caller, so concurrent picks spread across
/// endpoints rather than all starting at the first one.
#[derive(Debug)]
pub struct Picker {
    policy: LoadBalancingPolicy,
    cursor: AtomicUsize,
}

impl Picker {
    #[must_use]
    pub fn new(policy: LoadBalancingPolicy) -> Self {
        Self {
            policy,
            cursor: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn policy(&self) -> LoadBalancingPolicy {
        self.policy
    }

    /// Next endpoint according to the policy, `None` when the set is empty.
    ///
    /// Every address counts once, even when it is registered under several
    /// versions.
    #[must_use]
    pub fn pick(&self, set: &EndpointSet) -> Option<EndpointDescriptor> {
        let endpoints = set.unique_endpoints();
        if endpoints.is_empty() {
            return None;
        }
        let tick = self.cursor.fetch_add(1, Ordering::Relaxed);
        let picked = match self.policy {
            LoadBalancingPolicy::RoundRobin => endpoints.get(tick % endpoints.len()).copied(),
            LoadBalancingPolicy::WeightedRoundRobin => pick_weighted(&endpoints, tick),
        };
        picked.cloned()
    }
}

fn pick_weighted<'a>(
    endpoints: &[&'a EndpointDescriptor],
    tick: usize,
) -> Option<&'a EndpointDescriptor> {
    let total: u64 = endpoints.iter().map(|d| u64::from(d.weight.max(1))).sum();
    let mut slot = u64::try_from(tick).unwrap_or_default() % total.max(1);
    for d in endpoints {
        let w = u64::from(d.weight.max(1));
        if slot < w {
            return Some(*d);
        }
        slot -= w;
    }
    endpoints.first().copied()
}
