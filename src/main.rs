use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use sitemedic::backend::HttpRunnerBackend;
use sitemedic::config::Config;
use sitemedic::engine::{Orchestrator, SubmitOptions};
use sitemedic::model::{ExecutionStatus, TestType};
use sitemedic::scheduler::{NewTask, ScheduledTask, Scheduler, TaskSchedule};

#[derive(Parser)]
#[command(
    name = "sitemedic",
    about = "Appliance-grade website quality testing orchestrator",
    version,
    long_about = None
)]
struct Cli {
    /// Config file path
    #[arg(long, global = true, default_value = "sitemedic.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (API server + engine + scheduler)
    Serve {
        /// Bind address (overrides the config file)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Submit a single test and stream its progress
    Run {
        /// Test type: stress, security, api, performance, seo, compatibility
        #[arg(long)]
        test: String,

        /// Target URL (builds a minimal config for the test type)
        #[arg(long)]
        target: Option<String>,

        /// Raw JSON config (overrides --target)
        #[arg(long)]
        config_json: Option<String>,

        /// Queue priority (higher dequeues first)
        #[arg(long, default_value = "0")]
        priority: i32,
    },

    /// Show engine statistics
    Stats,

    /// Manage scheduled tasks
    Schedule {
        #[command(subcommand)]
        action: ScheduleAction,
    },
}

#[derive(Subcommand)]
enum ScheduleAction {
    /// List all tasks
    List,

    /// Add a new task
    Add {
        /// Task name
        #[arg(long)]
        name: String,

        /// Test type to run
        #[arg(long)]
        test: String,

        /// Cron expression (seconds-resolution fields)
        #[arg(long)]
        cron: Option<String>,

        /// Fixed interval in seconds
        #[arg(long)]
        every: Option<u64>,

        /// Target URL (builds a minimal config for the test type)
        #[arg(long)]
        target: Option<String>,

        /// Raw JSON config (overrides --target)
        #[arg(long)]
        config_json: Option<String>,

        /// Stop after this many runs
        #[arg(long)]
        max_runs: Option<u32>,
    },

    /// Remove a task
    Remove {
        /// Task name
        #[arg(long)]
        name: String,
    },

    /// Pause a task without deleting it
    Pause {
        #[arg(long)]
        name: String,
    },

    /// Resume a paused task
    Resume {
        #[arg(long)]
        name: String,
    },

    /// Trigger a task right now, independent of its schedule
    RunNow {
        #[arg(long)]
        name: String,
    },

    /// Preview what will run in the next N hours
    DryRun {
        /// Hours to preview
        #[arg(long, default_value = "24")]
        hours: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(&cli.config)?;

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.daemon.bind = bind;
            }
            tracing::info!(bind = %config.daemon.bind, "Starting SiteMedic daemon");
            sitemedic::serve(config).await?;
        }
        Commands::Run {
            test,
            target,
            config_json,
            priority,
        } => {
            let test_type = parse_test_type(&test)?;
            let test_config = build_config(test_type, target, config_json)?;
            run_once(&config, test_type, test_config, priority).await?;
        }
        Commands::Stats => {
            // Stats live in the daemon process; ask its API.
            let url = format!("http://{}/api/v1/stats", config.daemon.bind);
            let body: serde_json::Value = reqwest::get(&url)
                .await
                .with_context(|| format!("is the daemon running? ({})", url))?
                .json()
                .await?;
            println!("{}", serde_json::to_string_pretty(&body["data"])?);
        }
        Commands::Schedule { action } => {
            let scheduler = build_scheduler(&config)?;

            match action {
                ScheduleAction::List => {
                    let tasks = scheduler.list_tasks().await?;
                    if tasks.is_empty() {
                        println!("No tasks found.");
                    } else {
                        println!(
                            "{:<28} | {:<13} | {:<9} | {:<5} | Next run",
                            "Name", "Test", "Status", "Runs"
                        );
                        println!("{:-<28}-|-{:-<13}-|-{:-<9}-|-{:-<5}-|-{:-<25}", "", "", "", "", "");
                        for task in tasks {
                            println!(
                                "{:<28} | {:<13} | {:<9} | {:<5} | {}",
                                task.name,
                                task.test_type.to_string(),
                                task.status.to_string(),
                                task.run_count,
                                task.next_run
                                    .map(|t| t.to_rfc3339())
                                    .unwrap_or_else(|| "-".to_string()),
                            );
                        }
                    }
                }
                ScheduleAction::Add {
                    name,
                    test,
                    cron,
                    every,
                    target,
                    config_json,
                    max_runs,
                } => {
                    let test_type = parse_test_type(&test)?;
                    let schedule = match (cron, every) {
                        (Some(expr), None) => TaskSchedule::Cron { expr, end_time: None },
                        (None, Some(every_secs)) => TaskSchedule::Interval {
                            every_secs,
                            end_time: None,
                        },
                        _ => bail!("exactly one of --cron or --every is required"),
                    };
                    let task = scheduler
                        .create_task(NewTask {
                            name,
                            test_type,
                            config: build_config(test_type, target, config_json)?,
                            schedule,
                            max_runs,
                        })
                        .await?;
                    println!("Task '{}' added (next run: {:?}).", task.name, task.next_run);
                }
                ScheduleAction::Remove { name } => {
                    let task = find_task(&scheduler, &name).await?;
                    scheduler.delete_task(task.id).await?;
                    println!("Task '{}' removed.", name);
                }
                ScheduleAction::Pause { name } => {
                    let task = find_task(&scheduler, &name).await?;
                    scheduler.pause_task(task.id).await?;
                    println!("Task '{}' paused.", name);
                }
                ScheduleAction::Resume { name } => {
                    let task = find_task(&scheduler, &name).await?;
                    let task = scheduler.resume_task(task.id).await?;
                    println!("Task '{}' resumed (next run: {:?}).", name, task.next_run);
                }
                ScheduleAction::RunNow { name } => {
                    let task = find_task(&scheduler, &name).await?;
                    let execution_id = scheduler.execute_now(task.id).await?;
                    println!("Task '{}' submitted as execution {}.", name, execution_id);
                }
                ScheduleAction::DryRun { hours } => {
                    let preview = scheduler.preview_next_runs(hours).await?;
                    if preview.is_empty() {
                        println!("No runs scheduled in next {} hours.", hours);
                    } else {
                        println!("Upcoming runs (next {} hours):", hours);
                        for (at, name, test_type) in preview {
                            println!("{} : {} ({})", at.to_rfc3339(), name, test_type);
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

fn parse_test_type(raw: &str) -> Result<TestType> {
    raw.parse().map_err(|e: String| anyhow::anyhow!(e))
}

/// Minimal config for a test type when only a target URL is given.
fn build_config(
    test_type: TestType,
    target: Option<String>,
    config_json: Option<String>,
) -> Result<serde_json::Value> {
    if let Some(raw) = config_json {
        return serde_json::from_str(&raw).context("invalid --config-json");
    }
    let target = target.context("either --target or --config-json is required")?;
    Ok(match test_type {
        TestType::Api => json!({ "endpoints": [target] }),
        TestType::Compatibility => json!({
            "target_url": target,
            "browsers": ["chromium", "firefox", "webkit"]
        }),
        _ => json!({ "target_url": target }),
    })
}

fn build_engine(config: &Config) -> Orchestrator {
    let backend = Arc::new(HttpRunnerBackend::new(&config.daemon.runner_url));
    Orchestrator::new(backend, &config.engine, &config.transport, &config.retry)
}

fn build_scheduler(config: &Config) -> Result<Scheduler> {
    if let Some(parent) = std::path::Path::new(&config.daemon.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let pool = sitemedic::storage::open_pool(&config.daemon.db_path)?;
    Ok(Scheduler::new(pool, build_engine(config)))
}

async fn find_task(scheduler: &Scheduler, name: &str) -> Result<ScheduledTask> {
    scheduler
        .list_tasks()
        .await?
        .into_iter()
        .find(|task| task.name == name)
        .with_context(|| format!("task '{}' not found", name))
}

/// Submit one test against the configured runner and stream progress until
/// it finishes. Exit code reflects the outcome.
async fn run_once(
    config: &Config,
    test_type: TestType,
    test_config: serde_json::Value,
    priority: i32,
) -> Result<()> {
    let engine = build_engine(config);
    let id = engine.submit(
        test_type,
        test_config,
        SubmitOptions {
            priority,
            ..Default::default()
        },
    )?;
    println!("Execution {} submitted ({})", id, test_type);

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let progress_tx = tx.clone();
    let complete_tx = tx.clone();
    let _subscription = engine
        .subscribe(
            id,
            Box::new(move |exec| {
                let _ = progress_tx.send(exec.clone());
            }),
            Box::new(move |exec| {
                let _ = complete_tx.send(exec.clone());
            }),
            Box::new(move |exec| {
                let _ = tx.send(exec.clone());
            }),
        )
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    while let Some(exec) = rx.recv().await {
        match exec.status {
            ExecutionStatus::Pending => println!("  queued..."),
            ExecutionStatus::Running => {
                println!("  [{:>3}%] {}", exec.progress, exec.current_step);
            }
            ExecutionStatus::Completed => {
                println!("Completed.");
                if let Some(result) = &exec.result {
                    println!("{}", serde_json::to_string_pretty(result)?);
                }
                return Ok(());
            }
            ExecutionStatus::Cancelled => {
                println!("Cancelled.");
                return Ok(());
            }
            ExecutionStatus::Failed => {
                let message = exec
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| "unknown error".to_string());
                bail!("execution failed: {}", message);
            }
        }
    }
    bail!("subscription channel closed before a terminal state");
}
