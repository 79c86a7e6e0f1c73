//! Cluster instance pooling and idle teardown.
//!
//! # Key Components
//!
//! - [`ClusterInstance`]: one lazily created cluster and its lifecycle state
//! - [`ClusterPool`]: per-provider pool enforcing the `instances` cap
//! - [`IdleMonitor`]: tears clusters down once their group has no more work
//! - [`ClusterGroup`]: the providers a task needs, one entry per slot

pub mod instance;
pub mod monitor;
pub mod pool;

use std::collections::BTreeMap;
use std::fmt;

pub use instance::{ClusterInstance, InstanceState};
pub use monitor::IdleMonitor;
pub use pool::{ClusterPool, Lease, PoolError, PoolResult};

/// The providers a task is bound to, one entry per required cluster slot.
///
/// The same provider may appear several times when a single provider
/// supplies more than one of the task's clusters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClusterGroup {
    pub providers: Vec<String>,
}

impl ClusterGroup {
    pub fn new<I, S>(providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            providers: providers.into_iter().map(Into::into).collect(),
        }
    }

    /// Distinct provider names, in slot order.
    pub fn distinct(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for provider in &self.providers {
            if !seen.contains(&provider.as_str()) {
                seen.push(provider.as_str());
            }
        }
        seen
    }

    /// Group key used for idle tracking and as the report suite name.
    pub fn key(&self) -> String {
        self.distinct().join(",")
    }

    /// Number of instances needed per provider, sorted by provider name.
    pub fn demand(&self) -> BTreeMap<&str, usize> {
        let mut demand = BTreeMap::new();
        for provider in &self.providers {
            *demand.entry(provider.as_str()).or_insert(0) += 1;
        }
        demand
    }

    pub fn contains(&self, provider: &str) -> bool {
        self.providers.iter().any(|p| p == provider)
    }
}

impl fmt::Display for ClusterGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}
