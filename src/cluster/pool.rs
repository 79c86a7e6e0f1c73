//! Per-provider cluster instance pool.
//!
//! A [`ClusterPool`] owns every instance of one provider. Instances are
//! created lazily on first demand, handed to tasks through [`Lease`]s and
//! reused once released, while the pool never lets more than `instances`
//! of them exist at the same time.
//!
//! # Acquisition
//!
//! [`ClusterPool::acquire`] returns all requested instances at once or
//! suspends until it can. A request is served from `Ready`/`Idle`
//! instances first, in creation order; missing instances are reserved as
//! new slots under the cap and created before the lease is handed out.
//!
//! # Failure handling
//!
//! Each creation attempt is bounded by the provider's `timeout`; failed
//! attempts are cleaned up with a best-effort `destroy` and retried up to
//! `retry_count` times. An instance that exhausts its retries is `Failed`
//! and permanently reduces the pool's capacity. A pool whose capacity
//! reaches zero is fatal: every pending and future `acquire` fails.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::instance::{ClusterInstance, InstanceState};
use crate::config::{FairnessPolicy, InstanceOptions, ProviderConfig};
use crate::provider::template::{TemplateContext, resolve_env};
use crate::provider::{ClusterDriver, InstanceContext, ProviderError};

/// Result type for pool operations.
pub type PoolResult<T> = Result<T, PoolError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum PoolError {
    #[error("illegal transition of {id} from {from} to {to}")]
    InvalidTransition {
        id: String,
        from: InstanceState,
        to: InstanceState,
    },

    #[error(
        "environment variables are not specified for provider {provider}. Required variables: [{}]",
        .missing.join(", ")
    )]
    MissingEnv {
        provider: String,
        missing: Vec<String>,
    },

    /// A single instance could not be created; the pool is still usable.
    #[error("cluster {id} could not be created: {cause}")]
    Creation { id: String, cause: String },

    /// No instance of the provider can ever become usable again.
    #[error("Failed to create cluster instance. Error {cause}")]
    Fatal { provider: String, cause: String },

    #[error("provider {provider} cannot supply {requested} clusters at once, capacity is {capacity}")]
    Unsatisfiable {
        provider: String,
        requested: usize,
        capacity: usize,
    },
}

impl PoolError {
    /// Returns `true` for errors that must halt the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PoolError::Fatal { .. })
    }
}

#[derive(Default)]
struct PoolState {
    instances: Vec<ClusterInstance>,
    next_ordinal: usize,
    /// Instances that failed after exhausting their retries.
    exhausted: usize,
    fatal: Option<String>,
    /// Waiting tickets, front first. Only used by [`FairnessPolicy::Fifo`].
    queue: VecDeque<u64>,
    next_ticket: u64,
    /// Instances whose creation was cancelled midway; their scripts may have
    /// left infrastructure behind.
    abandoned: Vec<InstanceContext>,
}

impl PoolState {
    fn live(&self) -> usize {
        self.instances.iter().filter(|i| i.state.is_live()).count()
    }

    fn get_mut(&mut self, id: &str) -> Option<&mut ClusterInstance> {
        self.instances.iter_mut().find(|i| i.id == id)
    }
}

/// Bounded pool of cluster instances for one provider.
pub struct ClusterPool {
    config: ProviderConfig,
    driver: Arc<dyn ClusterDriver>,
    /// `config_root/<provider>`; each instance works below `<id>`.
    workdir_root: PathBuf,
    options: InstanceOptions,
    fairness: FairnessPolicy,
    state: Mutex<PoolState>,
    changed: Notify,
}

impl ClusterPool {
    pub fn new(config: ProviderConfig, driver: Arc<dyn ClusterDriver>, config_root: &Path) -> Self {
        let workdir_root = config_root.join(&config.name);
        Self {
            config,
            driver,
            workdir_root,
            options: InstanceOptions::default(),
            fairness: FairnessPolicy::default(),
            state: Mutex::new(PoolState::default()),
            changed: Notify::new(),
        }
    }

    pub fn with_options(mut self, options: InstanceOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_fairness(mut self, fairness: FairnessPolicy) -> Self {
        self.fairness = fairness;
        self
    }

    pub fn provider(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn driver(&self) -> &Arc<dyn ClusterDriver> {
        &self.driver
    }

    fn state(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Verifies that every `env_check` variable is set, reporting all
    /// missing ones in a single error.
    pub fn check_required_env<F>(&self, lookup: F) -> PoolResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let missing: Vec<String> = self
            .config
            .env_check
            .iter()
            .filter(|key| lookup(key.as_str()).is_none_or(|value| value.is_empty()))
            .cloned()
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(PoolError::MissingEnv {
                provider: self.config.name.clone(),
                missing,
            })
        }
    }

    /// Acquires `count` instances for `task_id`, all or nothing.
    ///
    /// Suspends while the pool cannot serve the request. Dropping the
    /// returned future gives back everything reserved so far.
    ///
    /// # Errors
    ///
    /// - `PoolError::Fatal` - the pool can no longer create any instance
    /// - `PoolError::Unsatisfiable` - `count` exceeds the pool's capacity
    pub async fn acquire(self: &Arc<Self>, task_id: usize, count: usize) -> PoolResult<Lease> {
        loop {
            let mut ticket = self.enqueue();
            let (mut lease, pending) = self.reserve(task_id, count, &mut ticket).await?;
            if pending.is_empty() {
                return Ok(lease);
            }

            let created = join_all(pending.into_iter().map(|id| self.create_instance(id, task_id))).await;

            let mut failure = None;
            for result in created {
                match result {
                    Ok(id) => lease.ids.push(id),
                    Err(err) => failure = Some(err),
                }
            }

            let Some(err) = failure else {
                return Ok(lease);
            };
            drop(lease);
            debug!("Retrying acquisition for task {} after: {}", task_id, err);
        }
    }

    fn enqueue(self: &Arc<Self>) -> Option<Ticket> {
        if self.fairness != FairnessPolicy::Fifo {
            return None;
        }

        let mut state = self.state();
        state.next_ticket += 1;
        let id = state.next_ticket;
        state.queue.push_back(id);
        Some(Ticket {
            pool: Arc::clone(self),
            id,
        })
    }

    /// Waits until the request fits, then binds reusable instances and
    /// reserves slots for the rest. Returns the lease and the ids of the
    /// reserved instances that still have to be created.
    async fn reserve(
        self: &Arc<Self>,
        task_id: usize,
        count: usize,
        ticket: &mut Option<Ticket>,
    ) -> PoolResult<(Lease, Vec<String>)> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state();
                if let Some(cause) = &state.fatal {
                    return Err(self.fatal_error(cause));
                }

                let capacity = self.config.instances.saturating_sub(state.exhausted);
                if count > capacity {
                    return Err(PoolError::Unsatisfiable {
                        provider: self.config.name.clone(),
                        requested: count,
                        capacity,
                    });
                }

                let my_turn = match ticket {
                    Some(t) => state.queue.front() == Some(&t.id),
                    None => true,
                };
                let reusable: Vec<usize> = state
                    .instances
                    .iter()
                    .enumerate()
                    .filter(|(_, i)| i.state.is_reusable())
                    .map(|(idx, _)| idx)
                    .collect();
                let free_slots = capacity.saturating_sub(state.live());

                if my_turn && reusable.len() + free_slots >= count {
                    let mut ids = Vec::with_capacity(count);
                    for &idx in reusable.iter().take(count) {
                        let instance = &mut state.instances[idx];
                        instance.transition(InstanceState::Busy)?;
                        instance.bound_task_ids.push(task_id);
                        ids.push(instance.id.clone());
                    }

                    let mut pending = Vec::new();
                    while ids.len() + pending.len() < count {
                        state.next_ordinal += 1;
                        let mut instance = ClusterInstance::new(&self.config.name, state.next_ordinal);
                        instance.transition(InstanceState::Creating)?;
                        instance.bound_task_ids.push(task_id);
                        pending.push(instance.id.clone());
                        state.instances.push(instance);
                    }

                    let served = ticket.take();
                    drop(state);
                    drop(served);
                    self.changed.notify_waiters();

                    let lease = Lease {
                        pool: Arc::clone(self),
                        ids,
                    };
                    return Ok((lease, pending));
                }
            }

            notified.await;
        }
    }

    async fn create_instance(self: &Arc<Self>, id: String, task_id: usize) -> PoolResult<String> {
        let mut guard = CreationGuard {
            pool: self,
            id: id.clone(),
            armed: true,
        };

        let workdir = self.workdir_root.join(&id);
        let mut env = vec![("NODE_COUNT".to_string(), self.config.node_count.to_string())];
        match resolve_env(&self.config.env, &TemplateContext::new(&id, &workdir)) {
            Ok(resolved) => env.extend(resolved),
            Err(err) => {
                guard.armed = false;
                return Err(self.mark_failed(&id, err.to_string()));
            }
        }
        let ctx = InstanceContext {
            id: id.clone(),
            provider: self.config.name.clone(),
            workdir,
            env,
        };
        if let Some(instance) = self.state().get_mut(&id) {
            instance.context = Some(ctx.clone());
        }

        let attempts = self.config.retry_count + 1;
        let budget = Duration::from_secs(self.config.timeout);
        let mut cause = String::new();

        for attempt in 1..=attempts {
            let result = match tokio::time::timeout(budget, self.driver.create(&ctx, &self.options)).await {
                Ok(result) => result,
                Err(_) => Err(ProviderError::Timeout(format!(
                    "cluster {} was not created within {} seconds",
                    id, self.config.timeout
                ))),
            };

            match result {
                Ok(connection) => {
                    guard.armed = false;
                    let mut state = self.state();
                    if let Some(instance) = state.get_mut(&id) {
                        instance.connection = Some(connection);
                        instance.transition(InstanceState::Ready)?;
                        instance.transition(InstanceState::Busy)?;
                        instance.bound_task_ids.push(task_id);
                    }
                    info!("Cluster {} created", id);
                    return Ok(id);
                }
                Err(err) => {
                    warn!(
                        "Failed to create cluster {} (attempt {}/{}): {}",
                        id, attempt, attempts, err
                    );
                    cause = err.to_string();
                    if !err.is_retryable() {
                        break;
                    }
                    if let Err(e) = self.driver.destroy(&ctx).await {
                        warn!("Failed to clean up cluster {}: {}", id, e);
                    }
                    if attempt < attempts {
                        if let Some(instance) = self.state().get_mut(&id) {
                            instance.retries_used += 1;
                        }
                    }
                }
            }
        }

        guard.armed = false;
        Err(self.mark_failed(&id, cause))
    }

    /// Moves an instance to `Failed` after its retries are exhausted and
    /// shrinks the pool's capacity accordingly.
    fn mark_failed(&self, id: &str, cause: String) -> PoolError {
        let mut state = self.state();
        if let Some(instance) = state.get_mut(id) {
            if let Err(e) = instance.transition(InstanceState::Failed) {
                warn!("{}", e);
            }
        }
        state.exhausted += 1;

        error!("Failed to create cluster instance {}: {}", id, cause);
        if state.exhausted >= self.config.instances && state.fatal.is_none() {
            state.fatal = Some(cause.clone());
        }
        drop(state);
        self.changed.notify_waiters();

        PoolError::Creation {
            id: id.to_string(),
            cause,
        }
    }

    fn fatal_error(&self, cause: &str) -> PoolError {
        PoolError::Fatal {
            provider: self.config.name.clone(),
            cause: cause.to_string(),
        }
    }

    /// Returns the fatal error of the pool, if it has become unusable.
    pub fn fatal(&self) -> Option<PoolError> {
        self.state().fatal.as_deref().map(|cause| self.fatal_error(cause))
    }

    fn release(&self, ids: &[String]) {
        let mut state = self.state();
        for id in ids {
            if let Some(instance) = state.get_mut(id) {
                if instance.state == InstanceState::Busy {
                    if let Err(e) = instance.transition(InstanceState::Idle) {
                        warn!("{}", e);
                    }
                }
            }
        }
        drop(state);
        self.changed.notify_waiters();
    }

    /// Destroys every `Ready` or `Idle` instance and every instance whose
    /// creation was cancelled; `Busy` ones are left alone.
    ///
    /// Returns the number of destroyed instances. Does nothing when the run
    /// asked to keep instances alive.
    pub async fn destroy_all(&self) -> usize {
        if self.options.no_stop {
            debug!("Keeping clusters of provider {} running", self.config.name);
            return 0;
        }

        let targets: Vec<(String, Option<InstanceContext>)> = {
            let mut state = self.state();
            let abandoned: Vec<_> = state
                .abandoned
                .drain(..)
                .map(|ctx| (ctx.id.clone(), Some(ctx)))
                .collect();
            let mut targets: Vec<_> = state
                .instances
                .iter_mut()
                .filter(|i| i.state.is_reusable())
                .filter_map(|i| match i.transition(InstanceState::Destroying) {
                    Ok(()) => Some((i.id.clone(), i.context.clone())),
                    Err(e) => {
                        warn!("{}", e);
                        None
                    }
                })
                .collect();
            targets.extend(abandoned);
            targets
        };

        join_all(targets.iter().map(|(id, ctx)| async move {
            info!("Destroying cluster {}", id);
            if let Some(ctx) = ctx {
                if let Err(e) = self.driver.destroy(ctx).await {
                    warn!("Failed to destroy cluster {}: {}", id, e);
                }
            }
            if let Some(instance) = self.state().get_mut(id) {
                if instance.state == InstanceState::Destroying {
                    if let Err(e) = instance.transition(InstanceState::Destroyed) {
                        warn!("{}", e);
                    }
                }
            }
        }))
        .await;

        self.changed.notify_waiters();
        targets.len()
    }

    /// Point-in-time copy of every instance the pool has created.
    pub fn snapshot(&self) -> Vec<ClusterInstance> {
        self.state().instances.clone()
    }
}

/// Instances bound to one task. Dropping the lease releases them.
pub struct Lease {
    pool: Arc<ClusterPool>,
    ids: Vec<String>,
}

impl Lease {
    pub fn provider(&self) -> &str {
        self.pool.provider()
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Connection info of the leased instances, in lease order.
    pub fn connections(&self) -> Vec<String> {
        let state = self.pool.state();
        self.ids
            .iter()
            .map(|id| {
                state
                    .instances
                    .iter()
                    .find(|i| &i.id == id)
                    .and_then(|i| i.connection.clone())
                    .unwrap_or_default()
            })
            .collect()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.ids.is_empty() {
            self.pool.release(&self.ids);
        }
    }
}

/// Place of a waiter in a FIFO pool queue.
struct Ticket {
    pool: Arc<ClusterPool>,
    id: u64,
}

impl Drop for Ticket {
    fn drop(&mut self) {
        let mut state = self.pool.state();
        state.queue.retain(|&t| t != self.id);
        drop(state);
        self.pool.changed.notify_waiters();
    }
}

/// Frees a reserved slot when creation is abandoned midway and queues the
/// instance for teardown.
struct CreationGuard<'a> {
    pool: &'a ClusterPool,
    id: String,
    armed: bool,
}

impl Drop for CreationGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("Creation of cluster {} was cancelled", self.id);
        let mut state = self.pool.state();
        let context = state.get_mut(&self.id).and_then(|instance| {
            instance.state = InstanceState::Failed;
            instance.context.clone()
        });
        state.abandoned.extend(context);
        drop(state);
        self.pool.changed.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::config::ProviderKind;
    use crate::provider::{ExecResult, LifecycleScript, ProviderResult};

    #[derive(Default)]
    struct FakeDriver {
        failures_left: AtomicUsize,
        creates: AtomicUsize,
        create_delay: Duration,
        seen_env: Mutex<Vec<(String, String)>>,
        destroyed: Mutex<Vec<String>>,
    }

    impl FakeDriver {
        fn failing(times: usize) -> Self {
            Self {
                failures_left: AtomicUsize::new(times),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ClusterDriver for FakeDriver {
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
            self.creates.fetch_add(1, Ordering::SeqCst);
            *self.seen_env.lock().unwrap() = ctx.env.clone();
            if !self.create_delay.is_zero() {
                tokio::time::sleep(self.create_delay).await;
            }
            let failing = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(ProviderError::ScriptFailed {
                    script: LifecycleScript::Start,
                    exit_code: 1,
                    stderr: "quota exceeded".into(),
                });
            }
            Ok(format!("{}/config", ctx.id))
        }

        async fn run_lifecycle_script(
            &self,
            _script: LifecycleScript,
            _ctx: &InstanceContext,
        ) -> ProviderResult<Option<ExecResult>> {
            Ok(None)
        }

        async fn destroy(&self, ctx: &InstanceContext) -> ProviderResult<()> {
            self.destroyed.lock().unwrap().push(ctx.id.clone());
            Ok(())
        }
    }

    fn pool_with(config: ProviderConfig, driver: Arc<FakeDriver>) -> Arc<ClusterPool> {
        Arc::new(ClusterPool::new(config, driver, Path::new("/tmp/cloudtest")))
    }

    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    fn states(pool: &ClusterPool) -> Vec<InstanceState> {
        pool.snapshot().iter().map(|i| i.state).collect()
    }

    #[tokio::test]
    async fn test_acquire_creates_then_reuses() {
        let driver = Arc::new(FakeDriver::default());
        let pool = pool_with(ProviderConfig::new("p"), driver.clone());

        let lease = pool.acquire(1, 1).await.unwrap();
        assert_eq!(lease.ids(), ["p-1"]);
        assert_eq!(lease.connections(), ["p-1/config"]);
        assert_eq!(states(&pool), vec![InstanceState::Busy]);
        drop(lease);
        assert_eq!(states(&pool), vec![InstanceState::Idle]);

        let lease = pool.acquire(2, 1).await.unwrap();
        assert_eq!(lease.ids(), ["p-1"]);
        assert_eq!(driver.creates.load(Ordering::SeqCst), 1);
        assert_eq!(pool.snapshot()[0].bound_task_ids, vec![2]);
    }

    #[tokio::test]
    async fn test_acquire_waits_at_capacity() {
        let pool = pool_with(ProviderConfig::new("p"), Arc::new(FakeDriver::default()));

        let first = pool.acquire(1, 1).await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(2, 1).await.map(|l| l.ids().to_vec()) })
        };
        settle().await;
        assert!(!waiter.is_finished());
        assert_eq!(pool.snapshot().len(), 1);

        drop(first);
        assert_eq!(waiter.await.unwrap().unwrap(), vec!["p-1".to_string()]);
    }

    #[tokio::test]
    async fn test_multi_instance_acquire_is_atomic() {
        let mut config = ProviderConfig::new("p");
        config.instances = 2;
        let pool = pool_with(config, Arc::new(FakeDriver::default()));

        let lease = pool.acquire(1, 2).await.unwrap();
        assert_eq!(lease.ids(), ["p-1", "p-2"]);

        let err = pool.acquire(2, 3).await.err().unwrap();
        assert!(matches!(err, PoolError::Unsatisfiable { capacity: 2, .. }));
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let mut config = ProviderConfig::new("p");
        config.retry_count = 2;
        let driver = Arc::new(FakeDriver::failing(1));
        let pool = pool_with(config, driver.clone());

        let lease = pool.acquire(1, 1).await.unwrap();

        assert_eq!(lease.ids(), ["p-1"]);
        assert_eq!(pool.snapshot()[0].retries_used, 1);
        assert_eq!(driver.creates.load(Ordering::SeqCst), 2);
        assert_eq!(*driver.destroyed.lock().unwrap(), vec!["p-1".to_string()]);
    }

    #[tokio::test]
    async fn test_exhausted_retries_make_pool_fatal() {
        let mut config = ProviderConfig::new("p");
        config.retry_count = 1;
        let pool = pool_with(config, Arc::new(FakeDriver::failing(usize::MAX)));

        let err = pool.acquire(1, 1).await.err().unwrap();

        assert!(err.is_fatal());
        assert_eq!(
            err.to_string(),
            "Failed to create cluster instance. Error start script failed with exit code 1: quota exceeded"
        );
        assert_eq!(states(&pool), vec![InstanceState::Failed]);
        assert!(pool.fatal().is_some());
    }

    #[tokio::test]
    async fn test_failed_instance_shrinks_capacity() {
        let mut config = ProviderConfig::new("p");
        config.instances = 2;
        let pool = pool_with(config, Arc::new(FakeDriver::failing(1)));

        let lease = pool.acquire(1, 1).await.unwrap();

        assert_eq!(lease.ids(), ["p-2"]);
        assert!(pool.fatal().is_none());
        let err = pool.acquire(2, 2).await.err().unwrap();
        assert!(matches!(err, PoolError::Unsatisfiable { capacity: 1, .. }));
    }

    #[tokio::test]
    async fn test_check_required_env_lists_all_missing() {
        let mut config = ProviderConfig::new("a_provider");
        config.env_check = vec!["A".into(), "B".into(), "C".into()];
        let pool = pool_with(config, Arc::new(FakeDriver::default()));

        let err = pool
            .check_required_env(|key| (key == "C").then(|| "set".to_string()))
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "environment variables are not specified for provider a_provider. Required variables: [A, B]"
        );
    }

    #[tokio::test]
    async fn test_destroy_all_skips_busy() {
        let mut config = ProviderConfig::new("p");
        config.instances = 2;
        let driver = Arc::new(FakeDriver::default());
        let pool = pool_with(config, driver.clone());

        let busy = pool.acquire(1, 1).await.unwrap();
        drop(pool.acquire(2, 1).await.unwrap());

        assert_eq!(pool.destroy_all().await, 1);
        assert_eq!(
            states(&pool),
            vec![InstanceState::Busy, InstanceState::Destroyed]
        );
        assert_eq!(*driver.destroyed.lock().unwrap(), vec!["p-2".to_string()]);

        drop(busy);
        let lease = pool.acquire(3, 2).await.unwrap();
        assert_eq!(lease.ids(), ["p-1", "p-3"]);
    }

    #[tokio::test]
    async fn test_no_stop_keeps_instances() {
        let pool = Arc::new(
            ClusterPool::new(
                ProviderConfig::new("p"),
                Arc::new(FakeDriver::default()),
                Path::new("/tmp/cloudtest"),
            )
            .with_options(InstanceOptions {
                no_stop: true,
                ..Default::default()
            }),
        );
        drop(pool.acquire(1, 1).await.unwrap());

        assert_eq!(pool.destroy_all().await, 0);
        assert_eq!(states(&pool), vec![InstanceState::Idle]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_creation_is_torn_down() {
        let driver = Arc::new(FakeDriver {
            create_delay: Duration::from_secs(10),
            ..Default::default()
        });
        let pool = pool_with(ProviderConfig::new("p"), driver.clone());

        let acquired = tokio::time::timeout(Duration::from_secs(3), pool.acquire(1, 1)).await;
        assert!(acquired.is_err());
        assert_eq!(states(&pool), vec![InstanceState::Failed]);
        assert!(pool.fatal().is_none());

        assert_eq!(pool.destroy_all().await, 1);
        assert_eq!(*driver.destroyed.lock().unwrap(), vec!["p-1".to_string()]);
        assert_eq!(pool.destroy_all().await, 0);
    }

    #[tokio::test]
    async fn test_node_count_is_exported() {
        let driver = Arc::new(FakeDriver::default());
        let mut config = ProviderConfig::new("p");
        config.node_count = 3;
        config.env = vec!["NAME=$(cluster-name)".into()];
        let pool = pool_with(config, driver.clone());

        drop(pool.acquire(1, 1).await.unwrap());

        assert_eq!(
            *driver.seen_env.lock().unwrap(),
            vec![
                ("NODE_COUNT".to_string(), "3".to_string()),
                ("NAME".to_string(), "p-1".to_string()),
            ]
        );
    }

    async fn contended(fairness: FairnessPolicy) -> bool {
        let mut config = ProviderConfig::new("p");
        config.instances = 2;
        let pool = Arc::new(
            ClusterPool::new(config, Arc::new(FakeDriver::default()), Path::new("/tmp/cloudtest"))
                .with_fairness(fairness),
        );

        let first = pool.acquire(1, 1).await.unwrap();
        let wide = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(2, 2).await.map(|l| l.ids().len()) })
        };
        settle().await;
        let narrow = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire(3, 1).await.map(|l| l.ids().len()) })
        };
        settle().await;

        let narrow_overtook = narrow.is_finished();
        drop(first);
        assert_eq!(wide.await.unwrap().unwrap(), 2);
        assert_eq!(narrow.await.unwrap().unwrap(), 1);
        narrow_overtook
    }

    #[tokio::test]
    async fn test_greedy_lets_small_requests_overtake() {
        assert!(contended(FairnessPolicy::Greedy).await);
    }

    #[tokio::test]
    async fn test_fifo_serves_in_arrival_order() {
        assert!(!contended(FairnessPolicy::Fifo).await);
    }
}
