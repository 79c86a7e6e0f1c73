//! Idle teardown of cluster groups.
//!
//! The [`IdleMonitor`] counts outstanding tasks per cluster group. When the
//! count of a group drops to zero it waits for the largest `test_delay` of
//! the group's providers and then destroys the idle instances of every
//! provider that no other group still needs.
//!
//! The delay is a spawned timer task that is cancelled when new work is
//! registered for the group or when the monitor shuts down early.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ClusterGroup, ClusterPool};

#[derive(Default)]
struct GroupEntry {
    providers: Vec<String>,
    outstanding: usize,
    timer: Option<CancellationToken>,
}

/// Background observer tearing down clusters once their work is done.
pub struct IdleMonitor {
    pools: HashMap<String, Arc<ClusterPool>>,
    groups: Mutex<HashMap<String, GroupEntry>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl IdleMonitor {
    pub fn new(pools: HashMap<String, Arc<ClusterPool>>) -> Self {
        Self {
            pools,
            groups: Mutex::new(HashMap::new()),
            timers: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
        }
    }

    fn groups(&self) -> MutexGuard<'_, HashMap<String, GroupEntry>> {
        self.groups.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records one more outstanding task for `group`, cancelling a pending
    /// teardown of that group.
    pub fn register(&self, group: &ClusterGroup) {
        let mut groups = self.groups();
        let entry = groups.entry(group.key()).or_insert_with(|| GroupEntry {
            providers: group.distinct().into_iter().map(str::to_string).collect(),
            ..Default::default()
        });
        entry.outstanding += 1;
        if let Some(timer) = entry.timer.take() {
            debug!("New work for cluster group {}, teardown cancelled", group);
            timer.cancel();
        }
    }

    /// Records completion of one task of `group`; the last one starts the
    /// delayed teardown.
    pub fn on_task_complete(self: &Arc<Self>, group: &ClusterGroup) {
        let key = group.key();
        let mut groups = self.groups();
        let Some(entry) = groups.get_mut(&key) else {
            warn!("Completion reported for unknown cluster group {}", key);
            return;
        };

        entry.outstanding = entry.outstanding.saturating_sub(1);
        if entry.outstanding > 0 {
            return;
        }

        info!(
            "All tasks for cluster group {} are complete. Starting cluster shutdown",
            key
        );

        let delay = entry
            .providers
            .iter()
            .filter_map(|p| self.pools.get(p))
            .map(|pool| pool.config().test_delay)
            .max()
            .unwrap_or(0);
        let timer = self.shutdown.child_token();
        entry.timer = Some(timer.clone());
        drop(groups);

        let monitor = Arc::clone(self);
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {
                    debug!("Teardown of cluster group {} cancelled", key);
                }
                _ = tokio::time::sleep(Duration::from_secs(delay)) => {
                    monitor.teardown(&key).await;
                }
            }
        });
        self.timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    /// Destroys idle instances of every provider of `key` that has no
    /// outstanding work in another group.
    async fn teardown(&self, key: &str) {
        let providers: Vec<String> = {
            let mut groups = self.groups();
            let Some(entry) = groups.get_mut(key) else {
                return;
            };
            if entry.outstanding > 0 {
                return;
            }
            entry.timer = None;
            let candidates = entry.providers.clone();
            candidates
                .into_iter()
                .filter(|provider| {
                    !groups.iter().any(|(other, e)| {
                        other != key && e.outstanding > 0 && e.providers.contains(provider)
                    })
                })
                .collect()
        };

        for provider in providers {
            if let Some(pool) = self.pools.get(&provider) {
                pool.destroy_all().await;
            }
        }
    }

    /// Stops the monitor. With `wait` pending teardowns run to completion,
    /// otherwise they are cancelled.
    pub async fn shutdown(&self, wait: bool) {
        if !wait {
            self.shutdown.cancel();
        }

        let handles: Vec<_> = self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();

        for result in join_all(handles).await {
            if let Err(e) = result {
                warn!("Cluster teardown task failed: {}", e);
            }
        }
    }

    /// Outstanding task count of a group, for diagnostics.
    pub fn outstanding(&self, group: &ClusterGroup) -> usize {
        self.groups()
            .get(&group.key())
            .map_or(0, |entry| entry.outstanding)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use async_trait::async_trait;
    use tokio::time::Instant;

    use super::*;
    use crate::cluster::InstanceState;
    use crate::config::{InstanceOptions, ProviderConfig, ProviderKind};
    use crate::provider::{
        ClusterDriver, ExecResult, InstanceContext, LifecycleScript, ProviderResult,
    };

    struct NoopDriver;

    #[async_trait]
    impl ClusterDriver for NoopDriver {
        fn kind(&self) -> ProviderKind {
            ProviderKind::Shell
        }

        fn validate(&self) -> ProviderResult<()> {
            Ok(())
        }

        async fn create(
            &self,
            ctx: &InstanceContext,
            _options: &InstanceOptions,
        ) -> ProviderResult<String> {
            Ok(ctx.id.clone())
        }

        async fn run_lifecycle_script(
            &self,
            _script: LifecycleScript,
            _ctx: &InstanceContext,
        ) -> ProviderResult<Option<ExecResult>> {
            Ok(None)
        }

        async fn destroy(&self, _ctx: &InstanceContext) -> ProviderResult<()> {
            Ok(())
        }
    }

    fn pool(name: &str, test_delay: u64) -> Arc<ClusterPool> {
        let mut config = ProviderConfig::new(name);
        config.test_delay = test_delay;
        Arc::new(ClusterPool::new(
            config,
            Arc::new(NoopDriver),
            Path::new("/tmp/cloudtest"),
        ))
    }

    fn monitor(pools: &[Arc<ClusterPool>]) -> Arc<IdleMonitor> {
        Arc::new(IdleMonitor::new(
            pools
                .iter()
                .map(|p| (p.provider().to_string(), p.clone()))
                .collect(),
        ))
    }

    fn states(pool: &ClusterPool) -> Vec<InstanceState> {
        pool.snapshot().iter().map(|i| i.state).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_after_delay() {
        let a = pool("a", 7);
        let monitor = monitor(&[a.clone()]);
        let group = ClusterGroup::new(["a"]);
        monitor.register(&group);
        drop(a.acquire(1, 1).await.unwrap());

        let start = Instant::now();
        monitor.on_task_complete(&group);
        monitor.shutdown(true).await;

        assert!(start.elapsed() >= Duration::from_secs(7));
        assert_eq!(states(&a), vec![InstanceState::Destroyed]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_cancels_pending_teardown() {
        let a = pool("a", 5);
        let monitor = monitor(&[a.clone()]);
        let group = ClusterGroup::new(["a"]);
        monitor.register(&group);
        drop(a.acquire(1, 1).await.unwrap());

        monitor.on_task_complete(&group);
        tokio::time::sleep(Duration::from_secs(2)).await;
        monitor.register(&group);
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(states(&a), vec![InstanceState::Idle]);
        assert_eq!(monitor.outstanding(&group), 1);
        monitor.shutdown(false).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_provider_survives_while_other_group_runs() {
        let a = pool("a", 0);
        let b = pool("b", 0);
        let monitor = monitor(&[a.clone(), b.clone()]);
        let pair = ClusterGroup::new(["a", "b"]);
        let single = ClusterGroup::new(["b"]);
        monitor.register(&pair);
        monitor.register(&single);
        drop(a.acquire(1, 1).await.unwrap());
        drop(b.acquire(1, 1).await.unwrap());

        monitor.on_task_complete(&pair);
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(states(&a), vec![InstanceState::Destroyed]);
        assert_eq!(states(&b), vec![InstanceState::Idle]);
        monitor.shutdown(true).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_instance_is_not_destroyed() {
        let a = pool("a", 3);
        let monitor = monitor(&[a.clone()]);
        let group = ClusterGroup::new(["a"]);
        monitor.register(&group);
        drop(a.acquire(1, 1).await.unwrap());

        monitor.on_task_complete(&group);
        let lease = a.acquire(2, 1).await.unwrap();
        monitor.shutdown(true).await;

        assert_eq!(states(&a), vec![InstanceState::Busy]);
        drop(lease);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_without_wait_cancels_timers() {
        let a = pool("a", 60);
        let monitor = monitor(&[a.clone()]);
        let group = ClusterGroup::new(["a"]);
        monitor.register(&group);
        drop(a.acquire(1, 1).await.unwrap());

        let start = Instant::now();
        monitor.on_task_complete(&group);
        monitor.shutdown(false).await;

        assert!(start.elapsed() < Duration::from_secs(60));
        assert_eq!(states(&a), vec![InstanceState::Idle]);
    }
}
