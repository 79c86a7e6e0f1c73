//! Concurrent task scheduling.
//!
//! Every planned task runs as its own future; the pools' instance caps are
//! the only limit on parallelism. A task's life:
//!
//! ```text
//!  acquire (per provider, sorted) ─► bind env ─► run (execution timeout)
//!                                                    │
//!        on_task_complete ◄── release ◄── fold ◄─────┘
//! ```
//!
//! Acquiring providers in sorted name order means two multi-cluster tasks
//! can never wait on each other's instances in a cycle.
//!
//! # Cancellation
//!
//! The global deadline and fatal pool errors cancel every task through one
//! [`CancellationToken`]. Tasks that were already running are reported as
//! failed; tasks still waiting for clusters are dropped. Leases release
//! their instances on drop, so cancelled tasks never leave instances busy.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::planner::{Task, TaskStatus};
use super::runner::TaskRunner;
use crate::cluster::{ClusterPool, IdleMonitor, Lease, PoolError, PoolResult};
use crate::framework::TestResult;
use crate::report::ResultAggregator;

/// Message of tasks interrupted by the global deadline.
pub const GLOBAL_TIMEOUT_MESSAGE: &str = "global timeout elapsed";

/// How a scheduling round ended.
#[derive(Debug)]
pub enum SchedulerOutcome {
    Completed,
    GlobalTimeout,
    Fatal(PoolError),
}

pub struct TaskScheduler {
    pools: HashMap<String, Arc<ClusterPool>>,
    monitor: Arc<IdleMonitor>,
    runner: TaskRunner,
    aggregator: Arc<ResultAggregator>,
}

impl TaskScheduler {
    pub fn new(
        pools: HashMap<String, Arc<ClusterPool>>,
        monitor: Arc<IdleMonitor>,
        runner: TaskRunner,
        aggregator: Arc<ResultAggregator>,
    ) -> Self {
        Self {
            pools,
            monitor,
            runner,
            aggregator,
        }
    }

    /// Runs `tasks` to completion or until `deadline`.
    pub async fn run(&self, tasks: Vec<Task>, deadline: Instant) -> SchedulerOutcome {
        for task in &tasks {
            self.monitor.register(&task.group);
        }

        let cancel = CancellationToken::new();
        let fatal: Mutex<Option<PoolError>> = Mutex::new(None);

        let all = join_all(
            tasks
                .into_iter()
                .map(|task| self.run_task(task, &cancel, &fatal)),
        );
        tokio::pin!(all);

        let timed_out = tokio::time::timeout_at(deadline, all.as_mut())
            .await
            .is_err();
        if timed_out {
            warn!("Global timeout reached, cancelling running tasks");
            cancel.cancel();
            all.await;
        }

        let fatal = fatal.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(err) = fatal {
            return SchedulerOutcome::Fatal(err);
        }
        if timed_out {
            SchedulerOutcome::GlobalTimeout
        } else {
            SchedulerOutcome::Completed
        }
    }

    async fn run_task(
        &self,
        mut task: Task,
        cancel: &CancellationToken,
        fatal: &Mutex<Option<PoolError>>,
    ) {
        let acquired = tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            acquired = self.acquire(&task) => acquired,
        };

        let leases = match acquired {
            Ok(leases) => leases,
            Err(err) if err.is_fatal() => {
                error!("{}", err);
                fatal
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .get_or_insert(err);
                cancel.cancel();
                return;
            }
            Err(err) => {
                task.status = TaskStatus::Failed;
                let result = TestResult::failed(task.case_name(), err.to_string());
                self.aggregator.fold(&task, &result);
                self.monitor.on_task_complete(&task.group);
                return;
            }
        };

        let bindings = bind_env(&task, &leases);
        let instances: Vec<&str> = leases
            .iter()
            .flat_map(|l| l.ids().iter().map(String::as_str))
            .collect();
        info!(
            "Running {} of {} on {}",
            task.case_name(),
            task.execution.name,
            instances.join(", ")
        );
        task.status = TaskStatus::Running;

        let start = Instant::now();
        let timeout = task.timeout();
        let (result, timed_out) = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let message = if fatal.lock().unwrap_or_else(PoisonError::into_inner).is_some() {
                    "run cancelled after a fatal cluster error"
                } else {
                    GLOBAL_TIMEOUT_MESSAGE
                };
                (TestResult::failed(task.case_name(), message), false)
            }
            outcome = tokio::time::timeout(timeout, self.runner.run(&task, &bindings)) => match outcome {
                Ok(result) => (result, false),
                Err(_) => {
                    let message = format!("test timed out after {} seconds", timeout.as_secs());
                    (TestResult::failed(task.case_name(), message), true)
                }
            },
        };
        let result = if result.duration.is_zero() {
            result.with_duration(start.elapsed())
        } else {
            result
        };

        task.status = if timed_out {
            warn!("{} timed out after {:?}", task.case_name(), timeout);
            TaskStatus::TimedOut
        } else if result.is_passed() {
            TaskStatus::Passed
        } else {
            TaskStatus::Failed
        };

        self.aggregator.fold(&task, &result);
        drop(leases);

        if !cancel.is_cancelled() {
            self.monitor.on_task_complete(&task.group);
        }
    }

    /// Acquires every instance of the task's group, one pool at a time in
    /// provider name order.
    async fn acquire(&self, task: &Task) -> PoolResult<Vec<Lease>> {
        let mut leases = Vec::new();
        for (provider, count) in task.group.demand() {
            let pool = self.pools.get(provider).ok_or_else(|| PoolError::Fatal {
                provider: provider.to_string(),
                cause: format!("no cluster pool for provider {provider}"),
            })?;
            leases.push(pool.acquire(task.id, count).await?);
        }
        Ok(leases)
    }
}

/// Binds `env_names[i]` to the connection info of the instance filling
/// slot `i` of the task's group.
fn bind_env(task: &Task, leases: &[Lease]) -> Vec<(String, String)> {
    let connections: HashMap<&str, Vec<String>> = leases
        .iter()
        .map(|lease| (lease.provider(), lease.connections()))
        .collect();
    let mut used: HashMap<&str, usize> = HashMap::new();

    task.group
        .providers
        .iter()
        .zip(&task.env_names)
        .filter_map(|(provider, name)| {
            let offset = used.entry(provider.as_str()).or_insert(0);
            let connection = connections.get(provider.as_str())?.get(*offset)?;
            *offset += 1;
            Some((name.clone(), connection.clone()))
        })
        .collect()
}
