//! bv - run container build pipelines.
//!
//! Usage:
//!   bv run <PIPELINE> <TASK>   Run a task and everything it depends on
//!   bv validate <PIPELINE>     Validate a pipeline file without running
//!   bv list <PIPELINE>         List tasks, dependencies and environment names

use buildvault::{DockerCli, Executor, execution_order, load_pipeline};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

/// bv - A minimal build orchestrator running task graphs in containers
#[derive(Parser)]
#[command(name = "bv")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a task and everything it depends on
    Run {
        /// Path to the pipeline YAML file
        #[arg(value_name = "PIPELINE")]
        pipeline: PathBuf,

        /// Name of the task to run
        #[arg(value_name = "TASK")]
        task: String,

        /// Sibling dependencies to run at once (default: from pipeline, else 1)
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,

        /// Container runtime client binary (default: from pipeline, else docker)
        #[arg(long)]
        runtime: Option<String>,

        /// Environment name prefix (default: from pipeline, else buildvault)
        #[arg(long)]
        prefix: Option<String>,

        /// Write the run report as JSON to this file
        #[arg(long, value_name = "FILE")]
        report: Option<PathBuf>,
    },

    /// Validate a pipeline file without running
    Validate {
        /// Path to the pipeline YAML file
        #[arg(value_name = "PIPELINE")]
        pipeline: PathBuf,
    },

    /// List tasks in a pipeline
    List {
        /// Path to the pipeline YAML file
        #[arg(value_name = "PIPELINE")]
        pipeline: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            pipeline,
            task,
            concurrency,
            runtime,
            prefix,
            report,
        } => {
            run_task(pipeline, task, concurrency, runtime, prefix, report).await?;
        }
        Commands::Validate { pipeline } => {
            validate_pipeline(pipeline)?;
        }
        Commands::List { pipeline } => {
            list_tasks(pipeline)?;
        }
    }

    Ok(())
}

/// Run one task of a pipeline.
async fn run_task(
    path: PathBuf,
    task_name: String,
    concurrency: Option<usize>,
    runtime: Option<String>,
    prefix: Option<String>,
    report_path: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Loading pipeline from: {}", path.display());

    let pipeline = load_pipeline(&path)?;
    let task = match pipeline.require(&task_name) {
        Ok(task) => Arc::clone(task),
        Err(e) => {
            error!(
                "Available tasks: {}",
                pipeline
                    .tasks()
                    .iter()
                    .map(|t| t.name())
                    .collect::<Vec<_>>()
                    .join(", ")
            );
            return Err(e.into());
        }
    };

    let mut config = pipeline.executor_config();
    if let Some(concurrency) = concurrency {
        config = config.with_concurrency(concurrency);
    }
    if let Some(prefix) = prefix {
        config = config.with_prefix(prefix);
    }
    let runtime = runtime.unwrap_or_else(|| pipeline.settings().runtime().to_string());

    let executor = Executor::with_config(Arc::new(DockerCli::with_program(runtime)), config);

    info!("Running task '{}'", task.name());
    info!("Press Ctrl+C to abort");

    // Dropping the run future kills any in-flight runtime client.
    tokio::select! {
        result = executor.execute(&task) => {
            match result {
                Ok(report) => {
                    for result in report.tasks() {
                        info!(
                            "  - {} -> {} ({:?})",
                            result.task, result.environment_name, result.duration
                        );
                    }
                    info!(
                        "Task '{}' completed: {} task(s) in {:?}",
                        task.name(),
                        report.task_count(),
                        report.duration
                    );
                    if let Some(path) = report_path {
                        std::fs::write(&path, serde_json::to_vec_pretty(&report)?)?;
                        info!("Report written to {}", path.display());
                    }
                }
                Err(e) => {
                    error!("Run failed: {}", e);
                    return Err(e.into());
                }
            }
        }
        _ = tokio::signal::ctrl_c() => {
            error!("Interrupted, aborting run");
            return Err("run aborted".into());
        }
    }

    Ok(())
}

/// Validate a pipeline without running.
fn validate_pipeline(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating pipeline: {}", path.display());

    match load_pipeline(&path) {
        Ok(pipeline) => {
            info!("All {} task(s) are valid:", pipeline.tasks().len());
            for task in pipeline.tasks() {
                info!("  - {}: OK", task.name());
            }
            Ok(())
        }
        Err(e) => {
            error!("Validation failed: {}", e);
            Err(e.into())
        }
    }
}

/// List the tasks of a pipeline.
fn list_tasks(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let pipeline = load_pipeline(&path)?;
    let executor_config = pipeline.executor_config();

    println!("Tasks in {}:", path.display());
    println!();

    for task in pipeline.tasks() {
        let name = buildvault::environment_name(
            &executor_config.prefix,
            task,
            &buildvault::fingerprint(task),
        );
        println!("{}", task.name());
        println!("  Image: {}", task.base_image());
        println!("  Environment: {}", name);
        for input in task.inputs() {
            println!("  Input: {} -> {}", input.from.display(), input.to);
        }
        println!("  Commands: {}", task.commands().len());

        for dependency in task.dependencies() {
            let artifacts: Vec<String> = dependency
                .artifacts()
                .iter()
                .map(|a| format!("{} -> {}", a.from, a.to))
                .collect();
            if artifacts.is_empty() {
                println!("  Depends on: {}", dependency.task().name());
            } else {
                println!(
                    "  Depends on: {} ({})",
                    dependency.task().name(),
                    artifacts.join(", ")
                );
            }
        }

        if !task.outputs().is_empty() {
            println!(
                "  Outputs: {} -> {}",
                task.outputs().join(", "),
                task.artifacts_dir().display()
            );
        }

        let order = execution_order(task);
        if order.len() > 1 {
            let names: Vec<&str> = order.iter().map(|t| t.name()).collect();
            println!("  Run order: {}", names.join(" -> "));
        }

        println!();
    }

    Ok(())
}
