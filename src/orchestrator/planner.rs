//! Execution planning.
//!
//! Expands every enabled execution into tasks, each bound to a
//! [`ClusterGroup`]. Planning is pure: it only looks at configuration,
//! runtime arguments and discovery results, and problems with one
//! execution become [`PlanError`]s instead of aborting the run.
//!
//! # Cluster groups
//!
//! | `cluster_count` | Groups |
//! |-----------------|--------|
//! | 1 | One group per candidate provider |
//! | n, at least n candidates | Consecutive disjoint chunks of n candidates |
//! | n, fewer candidates | One group filled from the candidates' instance capacity |

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::cluster::ClusterGroup;
use crate::config::{ExecutionConfig, ExecutionKind, ProviderConfig, RunArguments};
use crate::framework::TestCase;

/// Variable bound to the cluster of single-cluster executions without
/// explicit `cluster_env`.
pub const DEFAULT_CLUSTER_ENV: &str = "KUBECONFIG";

/// Discovery outcome per execution name.
pub type Discovered = BTreeMap<String, Result<Vec<TestCase>, String>>;

/// What a task runs once its clusters are bound.
#[derive(Debug, Clone)]
pub enum TaskBody {
    Test(TestCase),
    Shell(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Pending,
    Running,
    Passed,
    Failed,
    TimedOut,
}

/// One scheduled run of an execution on its cluster group.
#[derive(Debug, Clone)]
pub struct Task {
    /// Plan-wide sequence number; orders test cases in the report.
    pub id: usize,
    pub execution_index: usize,
    pub execution: Arc<ExecutionConfig>,
    /// Position of `group` among the execution's groups.
    pub group_index: usize,
    pub group: ClusterGroup,
    /// `env_names[i]` receives the connection info of `group.providers[i]`.
    pub env_names: Vec<String>,
    pub body: TaskBody,
    pub status: TaskStatus,
}

impl Task {
    /// Name of the test case this task reports.
    pub fn case_name(&self) -> &str {
        match &self.body {
            TaskBody::Test(test) => &test.name,
            TaskBody::Shell(_) => &self.execution.name,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.execution.timeout)
    }
}

/// An execution that could not be planned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanError {
    pub execution_index: usize,
    pub execution: String,
    pub message: String,
}

impl fmt::Display for PlanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "execution {}: {}", self.execution, self.message)
    }
}

#[derive(Debug, Default)]
pub struct Plan {
    pub tasks: Vec<Task>,
    pub errors: Vec<PlanError>,
}

impl Plan {
    /// Names of the providers used by at least one task, sorted.
    pub fn providers(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tasks
            .iter()
            .flat_map(|t| t.group.providers.iter().cloned())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

/// Builds the task list for `executions`.
pub fn plan(
    executions: &[ExecutionConfig],
    providers: &[ProviderConfig],
    discovered: &Discovered,
    args: &RunArguments,
) -> Plan {
    let mut result = Plan::default();

    for (execution_index, execution) in executions.iter().enumerate() {
        if !execution.enabled {
            continue;
        }

        match plan_execution(execution_index, execution, providers, discovered, args, result.tasks.len()) {
            Ok(tasks) => result.tasks.extend(tasks),
            Err(message) => result.errors.push(PlanError {
                execution_index,
                execution: execution.name.clone(),
                message,
            }),
        }
    }

    result
}

fn plan_execution(
    execution_index: usize,
    execution: &ExecutionConfig,
    providers: &[ProviderConfig],
    discovered: &Discovered,
    args: &RunArguments,
    first_id: usize,
) -> Result<Vec<Task>, String> {
    let unknown: Vec<&str> = execution
        .cluster_selector
        .iter()
        .filter(|name| !providers.iter().any(|p| &p.name == *name))
        .map(String::as_str)
        .collect();
    if !unknown.is_empty() {
        return Err(format!(
            "cluster selector references unknown provider {}",
            unknown.join(", ")
        ));
    }

    let candidates = candidates(execution, providers, args);
    if candidates.is_empty() {
        return Err("no enabled provider matches the cluster selector".to_string());
    }

    let groups = cluster_groups(execution, &candidates)?;
    let env_names = env_names(execution)?;

    let bodies: Vec<TaskBody> = match execution.kind {
        ExecutionKind::Shell => {
            let script = execution
                .run
                .clone()
                .ok_or_else(|| "shell execution without run script".to_string())?;
            vec![TaskBody::Shell(script)]
        }
        ExecutionKind::Package => {
            let tests = match discovered.get(&execution.name) {
                Some(Ok(tests)) => tests,
                Some(Err(err)) => return Err(err.clone()),
                None => return Err("tests were not discovered".to_string()),
            };
            let filter = if args.tags.is_empty() {
                &execution.tags
            } else {
                &args.tags
            };
            tests
                .iter()
                .filter(|test| test.matches(filter))
                .cloned()
                .map(TaskBody::Test)
                .collect()
        }
    };

    let execution = Arc::new(execution.clone());
    let limit = args.count.unwrap_or(usize::MAX);

    let tasks = groups
        .iter()
        .enumerate()
        .flat_map(|(group_index, group)| {
            bodies.iter().map(move |body| (group_index, group, body))
        })
        .take(limit)
        .enumerate()
        .map(|(offset, (group_index, group, body))| Task {
            id: first_id + offset,
            execution_index,
            execution: Arc::clone(&execution),
            group_index,
            group: group.clone(),
            env_names: env_names.clone(),
            body: body.clone(),
            status: TaskStatus::Pending,
        })
        .collect();

    Ok(tasks)
}

/// Enabled providers allowed by the run arguments and the selector, in
/// declaration order.
fn candidates<'a>(
    execution: &ExecutionConfig,
    providers: &'a [ProviderConfig],
    args: &RunArguments,
) -> Vec<&'a ProviderConfig> {
    providers
        .iter()
        .filter(|p| p.enabled)
        .filter(|p| args.providers.is_empty() || args.providers.contains(&p.name))
        .filter(|p| {
            execution.cluster_selector.is_empty() || execution.cluster_selector.contains(&p.name)
        })
        .collect()
}

fn cluster_groups(
    execution: &ExecutionConfig,
    candidates: &[&ProviderConfig],
) -> Result<Vec<ClusterGroup>, String> {
    let count = execution.cluster_count;

    if count <= 1 {
        return Ok(candidates
            .iter()
            .map(|p| ClusterGroup::new([p.name.as_str()]))
            .collect());
    }

    if candidates.len() >= count {
        let chunks = candidates.chunks_exact(count);
        let leftover: Vec<&str> = chunks.remainder().iter().map(|p| p.name.as_str()).collect();
        if !leftover.is_empty() {
            warn!(
                "Execution {}: providers {:?} do not fill a group of {} and are not used",
                execution.name, leftover, count
            );
        }
        return Ok(chunks
            .map(|chunk| ClusterGroup::new(chunk.iter().map(|p| p.name.as_str())))
            .collect());
    }

    let mut slots = Vec::with_capacity(count);
    for provider in candidates {
        let take = provider.instances.min(count - slots.len());
        slots.extend(std::iter::repeat_n(provider.name.as_str(), take));
    }

    if slots.len() < count {
        return Err(format!(
            "unsatisfiable cluster count: {} clusters required, selected providers supply {}",
            count,
            slots.len()
        ));
    }

    Ok(vec![ClusterGroup::new(slots)])
}

fn env_names(execution: &ExecutionConfig) -> Result<Vec<String>, String> {
    let count = execution.cluster_count;

    if execution.cluster_env.is_empty() && count <= 1 {
        return Ok(vec![DEFAULT_CLUSTER_ENV.to_string()]);
    }

    if execution.cluster_env.len() != count {
        return Err(format!(
            "cluster_env names {} variables but cluster_count is {}",
            execution.cluster_env.len(),
            count
        ));
    }

    Ok(execution.cluster_env.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn providers(names: &[&str]) -> Vec<ProviderConfig> {
        names
            .iter()
            .map(|n| ProviderConfig::new(*n).with_script("start", "echo started"))
            .collect()
    }

    fn sample_tests() -> Discovered {
        let tests = vec![
            TestCase::new("TestPass").with_tags(["basic"]),
            TestCase::new("TestFail").with_tags(["basic"]),
            TestCase::new("TestInterdomain").with_tags(["interdomain"]),
        ];
        [("simple".to_string(), Ok(tests))].into_iter().collect()
    }

    fn groups(plan: &Plan) -> Vec<String> {
        plan.tasks.iter().map(|t| t.group.key()).collect()
    }

    #[test]
    fn test_one_task_per_provider_and_test() {
        let executions = vec![ExecutionConfig::package("simple", "./sample").with_tags(["basic"])];

        let plan = plan(
            &executions,
            &providers(&["a_provider", "b_provider"]),
            &sample_tests(),
            &RunArguments::default(),
        );

        assert!(plan.errors.is_empty());
        let summary: Vec<_> = plan
            .tasks
            .iter()
            .map(|t| (t.id, t.group.key(), t.case_name().to_string()))
            .collect();
        assert_eq!(
            summary,
            vec![
                (0, "a_provider".into(), "TestPass".into()),
                (1, "a_provider".into(), "TestFail".into()),
                (2, "b_provider".into(), "TestPass".into()),
                (3, "b_provider".into(), "TestFail".into()),
            ]
        );
        assert_eq!(plan.tasks[0].env_names, vec!["KUBECONFIG"]);
    }

    #[test]
    fn test_selector_disabled_and_argument_filters() {
        let mut all = providers(&["a", "b", "c"]);
        all[1].enabled = false;
        let executions = vec![ExecutionConfig::shell("smoke", "kubectl get nodes").with_selector(["b", "c"])];

        let planned = plan(&executions, &all, &Discovered::new(), &RunArguments::default());
        assert_eq!(groups(&planned), vec!["c"]);

        let args = RunArguments {
            providers: vec!["a".into()],
            ..Default::default()
        };
        let planned = plan(&executions, &all, &Discovered::new(), &args);
        assert!(planned.tasks.is_empty());
        assert_eq!(
            planned.errors[0].message,
            "no enabled provider matches the cluster selector"
        );
    }

    #[test]
    fn test_unknown_selector_only_fails_its_execution() {
        let executions = vec![
            ExecutionConfig::shell("good", "true"),
            ExecutionConfig::shell("bad", "true").with_selector(["a", "nosuch"]),
        ];

        let planned = plan(&executions, &providers(&["a"]), &Discovered::new(), &RunArguments::default());

        assert_eq!(planned.tasks.len(), 1);
        assert_eq!(planned.tasks[0].execution.name, "good");
        assert_eq!(planned.errors.len(), 1);
        assert_eq!(planned.errors[0].execution, "bad");
        assert_eq!(
            planned.errors[0].message,
            "cluster selector references unknown provider nosuch"
        );
    }

    #[test]
    fn test_shell_execution_skips_discovery() {
        let executions = vec![ExecutionConfig::shell("smoke", "echo ok")];

        let plan = plan(&executions, &providers(&["a", "b"]), &Discovered::new(), &RunArguments::default());

        assert_eq!(plan.tasks.len(), 2);
        assert!(matches!(&plan.tasks[0].body, TaskBody::Shell(s) if s == "echo ok"));
        assert_eq!(plan.tasks[1].case_name(), "smoke");
    }

    #[test]
    fn test_cluster_count_pairs_providers() {
        let executions = vec![
            ExecutionConfig::shell("interdomain", "true").with_cluster_env(["CFG1", "CFG2"]),
        ];

        let two = plan(&executions, &providers(&["a", "b"]), &Discovered::new(), &RunArguments::default());
        assert_eq!(two.tasks.len(), 1);
        assert_eq!(two.tasks[0].group.providers, vec!["a", "b"]);
        assert_eq!(two.tasks[0].env_names, vec!["CFG1", "CFG2"]);

        let four = plan(
            &executions,
            &providers(&["a", "b", "c", "d", "e"]),
            &Discovered::new(),
            &RunArguments::default(),
        );
        assert_eq!(groups(&four), vec!["a,b", "c,d"]);
        assert_eq!(four.tasks[1].group_index, 1);
    }

    #[test]
    fn test_cluster_count_from_instance_capacity() {
        let mut single = providers(&["a"]);
        single[0].instances = 2;
        let executions = vec![
            ExecutionConfig::shell("interdomain", "true").with_cluster_env(["CFG1", "CFG2"]),
        ];

        let planned = plan(&executions, &single, &Discovered::new(), &RunArguments::default());
        assert_eq!(planned.tasks[0].group.providers, vec!["a", "a"]);
        assert_eq!(planned.tasks[0].group.key(), "a");

        single[0].instances = 1;
        let planned = plan(&executions, &single, &Discovered::new(), &RunArguments::default());
        assert!(planned.tasks.is_empty());
        assert!(planned.errors[0].message.starts_with("unsatisfiable cluster count"));
    }

    #[test]
    fn test_mismatched_cluster_env_is_error() {
        let mut execution = ExecutionConfig::shell("interdomain", "true");
        execution.cluster_count = 2;
        execution.cluster_env = vec!["ONLY_ONE".into()];

        let planned = plan(&[execution], &providers(&["a", "b"]), &Discovered::new(), &RunArguments::default());

        assert_eq!(planned.errors.len(), 1);
        assert_eq!(planned.errors[0].execution, "interdomain");
    }

    #[test]
    fn test_argument_tags_and_count() {
        let executions = vec![ExecutionConfig::package("simple", "./sample").with_tags(["basic"])];
        let args = RunArguments {
            tags: vec!["interdomain".into()],
            ..Default::default()
        };

        let planned = plan(&executions, &providers(&["a"]), &sample_tests(), &args);
        assert_eq!(planned.tasks.len(), 1);
        assert_eq!(planned.tasks[0].case_name(), "TestInterdomain");

        let args = RunArguments {
            count: Some(3),
            ..Default::default()
        };
        let planned = plan(&executions, &providers(&["a", "b"]), &sample_tests(), &args);
        assert_eq!(planned.tasks.len(), 3);
    }

    #[test]
    fn test_discovery_error_is_planning_error() {
        let executions = vec![ExecutionConfig::package("simple", "./sample")];
        let discovered: Discovered = [("simple".to_string(), Err("go: not found".to_string()))]
            .into_iter()
            .collect();

        let planned = plan(&executions, &providers(&["a"]), &discovered, &RunArguments::default());

        assert_eq!(planned.errors[0].to_string(), "execution simple: go: not found");
    }

    #[test]
    fn test_task_ids_are_plan_wide() {
        let executions = vec![
            ExecutionConfig::shell("first", "true"),
            ExecutionConfig::shell("second", "true"),
        ];

        let planned = plan(&executions, &providers(&["a"]), &Discovered::new(), &RunArguments::default());

        let ids: Vec<_> = planned.tasks.iter().map(|t| (t.id, t.execution_index)).collect();
        assert_eq!(ids, vec![(0, 0), (1, 1)]);
        assert_eq!(planned.providers(), vec!["a"]);
    }
}
