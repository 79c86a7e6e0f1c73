//! Task body execution.
//!
//! The [`TaskRunner`] runs what a task carries once its clusters are bound:
//! package tests go through the [`TestFramework`], inline shell bodies
//! through the [`ScriptRunner`]. Either way the result is a single
//! [`TestResult`]; errors running the body are reported as failures.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::time::Instant;
use tracing::debug;

use super::planner::{Task, TaskBody};
use crate::framework::{TestFramework, TestResult};
use crate::provider::ScriptRunner;

const OUTPUT_TAIL_LINES: usize = 20;

pub struct TaskRunner {
    framework: Arc<dyn TestFramework>,
    scripts: Arc<dyn ScriptRunner>,
    /// Working directory of shell bodies.
    workdir: PathBuf,
}

impl TaskRunner {
    pub fn new(
        framework: Arc<dyn TestFramework>,
        scripts: Arc<dyn ScriptRunner>,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            framework,
            scripts,
            workdir: workdir.into(),
        }
    }

    /// Runs the body of `task` with `bindings` exported.
    pub async fn run(&self, task: &Task, bindings: &[(String, String)]) -> TestResult {
        let start = Instant::now();
        let name = task.case_name();

        match &task.body {
            TaskBody::Test(test) => {
                match self.framework.run(&task.execution, test, bindings).await {
                    Ok(result) => result,
                    Err(e) => TestResult::failed(name, e.to_string()).with_duration(start.elapsed()),
                }
            }
            TaskBody::Shell(script) => {
                match self.scripts.execute(script, bindings, &self.workdir).await {
                    Ok(result) if result.success() => {
                        TestResult::passed(name).with_duration(result.duration)
                    }
                    Ok(result) => {
                        debug!("{} failed:\n{}", name, result.stdout);
                        let output = format!("{}{}", result.stdout, result.stderr);
                        let lines: Vec<&str> = output.lines().collect();
                        let tail = lines[lines.len().saturating_sub(OUTPUT_TAIL_LINES)..].join("\n");
                        TestResult::failed(name, format!("exit code {}\n{}", result.exit_code, tail))
                            .with_duration(result.duration)
                    }
                    Err(e) => TestResult::failed(name, e.to_string()).with_duration(start.elapsed()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::cluster::ClusterGroup;
    use crate::config::ExecutionConfig;
    use crate::framework::{FrameworkError, FrameworkResult, TestCase};
    use crate::orchestrator::planner::TaskStatus;
    use crate::provider::{ExecResult, ProviderResult};

    struct ExitRunner(i32);

    #[async_trait]
    impl ScriptRunner for ExitRunner {
        async fn execute(&self, _script: &str, env: &[(String, String)], _workdir: &Path) -> ProviderResult<ExecResult> {
            let stdout = (1..=30).map(|i| format!("line {i}\n")).collect::<String>();
            Ok(ExecResult {
                exit_code: self.0,
                stdout: format!("{stdout}{}\n", env[0].1),
                stderr: String::new(),
                duration: Duration::from_secs(2),
            })
        }
    }

    struct BrokenFramework;

    #[async_trait]
    impl TestFramework for BrokenFramework {
        async fn discover(&self, _execution: &ExecutionConfig) -> FrameworkResult<Vec<TestCase>> {
            Ok(Vec::new())
        }

        async fn run(
            &self,
            _execution: &ExecutionConfig,
            _test: &TestCase,
            _env: &[(String, String)],
        ) -> FrameworkResult<TestResult> {
            Err(FrameworkError::ExecFailed("go: not found".into()))
        }
    }

    fn task(body: TaskBody) -> Task {
        Task {
            id: 0,
            execution_index: 0,
            execution: Arc::new(ExecutionConfig::shell("smoke", "kubectl get nodes")),
            group_index: 0,
            group: ClusterGroup::new(["a_provider"]),
            env_names: vec!["KUBECONFIG".into()],
            body,
            status: TaskStatus::Pending,
        }
    }

    fn bindings() -> Vec<(String, String)> {
        vec![("KUBECONFIG".into(), "/kube/a_provider-1".into())]
    }

    #[tokio::test]
    async fn test_shell_body_passes_on_zero_exit() {
        let runner = TaskRunner::new(Arc::new(BrokenFramework), Arc::new(ExitRunner(0)), ".");

        let result = runner.run(&task(TaskBody::Shell("kubectl get nodes".into())), &bindings()).await;

        assert!(result.is_passed());
        assert_eq!(result.name, "smoke");
        assert_eq!(result.duration, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_shell_failure_keeps_output_tail() {
        let runner = TaskRunner::new(Arc::new(BrokenFramework), Arc::new(ExitRunner(3)), ".");

        let result = runner.run(&task(TaskBody::Shell("kubectl get nodes".into())), &bindings()).await;

        let message = result.message.unwrap();
        assert!(message.starts_with("exit code 3\n"));
        assert!(message.ends_with("/kube/a_provider-1"));
        assert!(!message.contains("line 11\n"));
        assert!(message.contains("line 12\n"));
    }

    #[tokio::test]
    async fn test_framework_error_is_a_failure() {
        let runner = TaskRunner::new(Arc::new(BrokenFramework), Arc::new(ExitRunner(0)), ".");

        let result = runner
            .run(&task(TaskBody::Test(TestCase::new("TestSingle"))), &bindings())
            .await;

        assert!(!result.is_passed());
        assert_eq!(result.name, "TestSingle");
        assert!(result.message.unwrap().contains("go: not found"));
    }
}
