//! researchq CLI: drain the research queue, enqueue topics, inspect state.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use researchq::config::Config;
use researchq::config::tools::AllowedTools;
use researchq::db::Db;
use researchq::engine::{CommandRunner, RunReport, RunnerConfig, Scheduler};
use researchq::lease::LockManager;
use researchq::model::{InsertResult, ModelSelector, NewQueueItem, Status};
use researchq::store::QueueStore;
use researchq::telemetry::{TelemetryConfig, init_telemetry};
use researchq::validate::Validator;
use researchq::vcs::GitPublisher;

#[derive(Parser)]
#[command(name = "researchq", about = "Lease-guarded research queue worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drain the queue once under the worker lease
    Run,
    /// Add a research topic to the queue
    Enqueue {
        topic: String,
        /// Longer description; defaults to the topic
        description: Option<String>,
        /// Comma-separated tags
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        /// Priority (lower = more urgent)
        #[arg(long, default_value_t = NewQueueItem::DEFAULT_PRIORITY)]
        priority: i32,
        /// sonnet, opus, or haiku
        #[arg(long, default_value = "sonnet")]
        model: ModelSelector,
        #[arg(long, default_value_t = NewQueueItem::DEFAULT_MAX_ATTEMPTS)]
        max_attempts: u32,
    },
    /// List queue items
    List {
        /// Filter by status
        #[arg(long)]
        status: Option<Status>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Run => cmd_run(config).await,
        Command::Enqueue {
            topic,
            description,
            tags,
            priority,
            model,
            max_attempts,
        } => {
            let db = Db::connect(&config.database_url).await?;
            let mut new = NewQueueItem::new(topic)
                .tags(tags)
                .priority(priority)
                .model(model)
                .max_attempts(max_attempts);
            if let Some(description) = description {
                new = new.description(description);
            }
            cmd_enqueue(&db, new).await
        }
        Command::List { status } => {
            let db = Db::connect(&config.database_url).await?;
            cmd_list(&db, &config, status).await
        }
    }
}

async fn cmd_run(config: Config) -> anyhow::Result<()> {
    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "researchq".to_string(),
        default_filter: config.log_level.clone(),
    })?;

    let db = Db::connect(&config.database_url).await?;
    let tools = AllowedTools::load(&config.allowed_tools_path)?;

    let mut runner_config = RunnerConfig::new(&config.runner_command, &config.workspace_root);
    runner_config.timeout = config.task_timeout;
    runner_config.logs_dir = Some(config.logs_dir.clone());
    runner_config.api_key = config.runner_api_key.clone();

    let scheduler = Scheduler::new(
        Arc::new(db),
        Arc::new(CommandRunner::new(runner_config, tools)),
        Arc::new(GitPublisher::new(
            &config.workspace_root,
            config.protected_files.clone(),
        )),
        Validator::new(&config.workspace_root),
        LockManager::new(&config.lock_path, config.lease_ttl),
    );

    match scheduler.run().await? {
        RunReport::LeaseHeld => {
            tracing::info!("another worker is running, nothing to do");
        }
        RunReport::Drained {
            synced,
            recovered,
            processed,
            completed,
            requeued,
            failed,
        } => {
            tracing::info!(
                synced,
                recovered,
                processed,
                completed,
                requeued,
                failed,
                "run finished"
            );
        }
    }
    Ok(())
}

async fn cmd_enqueue(db: &Db, new: NewQueueItem) -> anyhow::Result<()> {
    match db.insert(new).await? {
        InsertResult::Created(item) => {
            println!("Queued: {} {} (priority {})", item.id, item.topic, item.priority);
        }
        InsertResult::Existing(item) => {
            println!("Already queued: {} {} (status: {})", item.id, item.topic, item.status);
        }
    }
    Ok(())
}

async fn cmd_list(db: &Db, config: &Config, status: Option<Status>) -> anyhow::Result<()> {
    let items = db.list(status).await?;

    if items.is_empty() {
        println!("No queue items found.");
    } else {
        println!(
            "{:<6}  {:<10}  {:<4}  {:<7}  {:<7}  {:<40}  ADDED",
            "ID", "STATUS", "PRI", "TRIES", "MODEL", "TOPIC"
        );
        println!("{}", "-".repeat(96));

        for item in &items {
            let topic: String = item.topic.chars().take(40).collect();
            println!(
                "{:<6}  {:<10}  {:<4}  {:<7}  {:<7}  {:<40}  {}",
                item.id.to_string(),
                item.status,
                item.priority,
                format!("{}/{}", item.attempts, item.max_attempts),
                item.model,
                topic,
                item.added.format("%Y-%m-%d %H:%M")
            );
            if item.status == Status::Failed
                && let Some(ref error) = item.error
            {
                println!("        error: {error}");
            }
        }
        println!("\n{} item(s)", items.len());
    }

    let lease = LockManager::new(&config.lock_path, config.lease_ttl);
    match lease.held_since()? {
        Some(since) => println!("Worker lease held since {}", since.format("%Y-%m-%d %H:%M:%S UTC")),
        None => println!("No worker running."),
    }
    Ok(())
}
