//! cloudtest CLI - runs test suites on pooled clusters.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use tracing::{Level, error, info};
use tracing_subscriber::FmtSubscriber;

use cloudtest::config::{self, FairnessPolicy, InstanceOptions, RunArguments};
use cloudtest::framework::command::CommandFramework;
use cloudtest::orchestrator::{Orchestrator, TaskBody};
use cloudtest::provider::process::ProcessScriptRunner;
use cloudtest::report::{print_summary, write_report};

#[derive(Parser)]
#[command(name = "cloudtest")]
#[command(about = "Runs test suites against pooled cloud clusters", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "cloudtest.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct Selection {
    /// Only use these providers (repeatable)
    #[arg(short, long = "provider")]
    providers: Vec<String>,

    /// Only run tests with one of these tags (repeatable)
    #[arg(short, long = "tag")]
    tags: Vec<String>,

    /// Run at most this many tasks
    #[arg(long)]
    count: Option<usize>,

    /// Instance scheduling policy (greedy, fifo)
    #[arg(long, value_parser = parse_fairness)]
    fairness: Option<FairnessPolicy>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tests
    Run {
        #[command(flatten)]
        selection: Selection,

        /// Leave clusters running after the run
        #[arg(long)]
        no_stop: bool,

        /// Skip the prepare script of new clusters
        #[arg(long)]
        no_prepare: bool,

        /// Skip the install script of new clusters
        #[arg(long)]
        no_install: bool,

        /// JUnit XML output path
        #[arg(long)]
        junit: Option<PathBuf>,
    },

    /// Discover tests and print the planned tasks without creating clusters
    Plan {
        #[command(flatten)]
        selection: Selection,

        /// Output format (text, json)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Validate configuration file
    Validate,

    /// Initialize a new configuration file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            selection,
            no_stop,
            no_prepare,
            no_install,
            junit,
        } => {
            let options = InstanceOptions {
                no_stop,
                no_prepare,
                no_install,
            };
            run_tests(&cli.config, selection.into_arguments(options), junit).await
        }
        Commands::Plan { selection, format } => {
            plan_tests(&cli.config, selection.into_arguments(InstanceOptions::default()), &format).await
        }
        Commands::Validate => validate_config(&cli.config),
        Commands::Init => init_config(),
    }
}

impl Selection {
    fn into_arguments(self, instance_options: InstanceOptions) -> RunArguments {
        RunArguments {
            providers: self.providers,
            tags: self.tags,
            count: self.count,
            instance_options,
            fairness: self.fairness,
        }
    }
}

fn parse_fairness(value: &str) -> Result<FairnessPolicy, String> {
    match value {
        "greedy" => Ok(FairnessPolicy::Greedy),
        "fifo" => Ok(FairnessPolicy::Fifo),
        other => Err(format!("unknown fairness policy {other}, use greedy or fifo")),
    }
}

fn orchestrator(config_path: &Path) -> Result<Orchestrator> {
    let config = config::load_config(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;
    info!("Loaded configuration from {}", config_path.display());

    let scripts = Arc::new(ProcessScriptRunner::default());
    let framework = CommandFramework::new(config.framework.clone().unwrap_or_default(), scripts.clone());
    Ok(Orchestrator::new(config, Arc::new(framework)).with_script_runner(scripts))
}

async fn run_tests(config_path: &Path, args: RunArguments, junit_path: Option<PathBuf>) -> Result<()> {
    let orchestrator = orchestrator(config_path)?;
    let junit_path = junit_path.or_else(|| orchestrator.config().reporting.junit_report_file.clone());

    let (report, code) = match orchestrator.run(args).await {
        Ok(report) => (Some(report), 0),
        Err(err) => {
            error!("{}", err);
            let code = err.exit_code();
            (err.report().cloned(), code)
        }
    };

    if let Some(report) = &report {
        print_summary(report);
        if let Some(path) = &junit_path {
            write_report(report, path)?;
            info!("Wrote JUnit report to {}", path.display());
        }
    }

    std::process::exit(code);
}

async fn plan_tests(config_path: &Path, args: RunArguments, format: &str) -> Result<()> {
    let orchestrator = orchestrator(config_path)?;
    let plan = orchestrator.plan(&args).await;

    match format {
        "json" => {
            let tasks: Vec<_> = plan
                .tasks
                .iter()
                .map(|task| {
                    serde_json::json!({
                        "id": task.id,
                        "execution": task.execution.name,
                        "group": task.group.providers,
                        "env": task.env_names,
                        "test": task.case_name(),
                    })
                })
                .collect();
            let errors: Vec<_> = plan.errors.iter().map(ToString::to_string).collect();
            let json = serde_json::to_string_pretty(&serde_json::json!({
                "tasks": tasks,
                "errors": errors,
            }))?;
            println!("{}", json);
        }
        "text" => {
            println!("Planned {} tasks:", plan.tasks.len());
            for task in &plan.tasks {
                let kind = match task.body {
                    TaskBody::Test(_) => "test",
                    TaskBody::Shell(_) => "shell",
                };
                println!(
                    "  [{}] {} {} on {}",
                    task.execution.name,
                    kind,
                    task.case_name(),
                    task.group
                );
            }
            for error in &plan.errors {
                println!("  error: {}", error);
            }
        }
        other => bail!("Unknown format: {}. Use: text, json", other),
    }

    Ok(())
}

fn validate_config(config_path: &Path) -> Result<()> {
    let config = match config::load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = config.validate() {
        eprintln!("Configuration error: {}", e);
        std::process::exit(1);
    }

    println!("Configuration is valid!");
    println!();
    println!("Settings:");
    println!("  Timeout: {}s", config.timeout);
    println!("  Config root: {}", config.config_root.display());
    println!("  Fairness: {:?}", config.fairness);
    println!("  Providers:");
    for provider in &config.providers {
        println!(
            "    {} ({}, {} instances, {} retries){}",
            provider.name,
            provider.kind.as_str(),
            provider.instances,
            provider.retry_count,
            if provider.enabled { "" } else { " disabled" }
        );
    }
    println!("  Executions:");
    for execution in &config.executions {
        println!(
            "    {} ({}s timeout, {} clusters){}",
            execution.name,
            execution.timeout,
            execution.cluster_count,
            if execution.enabled { "" } else { " disabled" }
        );
    }

    Ok(())
}

const TEMPLATE: &str = r#"# cloudtest configuration file

# Global run timeout in seconds
timeout = 3600
config_root = ".tests/cloud_test"

[[providers]]
name = "kind"
kind = "shell"
instances = 2
retry_count = 1
timeout = 300
test_delay = 30
env = ["CLUSTER_NAME=$(cluster-name)", "KUBECONFIG=$(tempdir)/config"]

[providers.scripts]
start = "kind create cluster --name $CLUSTER_NAME --kubeconfig $KUBECONFIG"
config = "echo $KUBECONFIG"
stop = "kind delete cluster --name $CLUSTER_NAME"

[[executions]]
name = "basic"
package_root = "./tests/basic"
timeout = 600

[framework]
discover_command = "go test -list '.*' ./... | grep '^Test'"
run_command = "go test -count=1 -v -run '^{test}$' ./..."

[reporting]
junit_report_file = "test-results/junit.xml"
"#;

fn init_config() -> Result<()> {
    let path = PathBuf::from("cloudtest.toml");
    if path.exists() {
        eprintln!("cloudtest.toml already exists. Remove it first or edit manually.");
        std::process::exit(1);
    }

    std::fs::write(&path, TEMPLATE)?;
    println!("Created cloudtest.toml");
    println!();
    println!("Edit the configuration as needed, then run:");
    println!("  cloudtest run");

    Ok(())
}
