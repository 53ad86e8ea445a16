//! requestq CLI: submit tasks, inspect them, and run workers.

use clap::{Parser, Subcommand};
use requestq::broker::pgmq::PgmqBroker;
use requestq::config::Config;
use requestq::config::secrets::ExposeSecret;
use requestq::lifecycle::Tracker;
use requestq::model::{NewTask, TaskId};
use requestq::queue::QueueClient;
use requestq::store::postgres::PgTaskStore;
use requestq::telemetry::{TelemetryConfig, init_telemetry};
use requestq::worker::{CommandProcessor, EchoProcessor, Processor, Worker, WorkerConfig};
use std::path::PathBuf;
use std::sync::Arc;

type App = Tracker<PgTaskStore, PgmqBroker>;

#[derive(Parser)]
#[command(name = "requestq", about = "Queue-backed request processing")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a query for processing
    Submit {
        query: String,
        /// Submitting principal
        #[arg(long)]
        owner: String,
    },
    /// Take the next task off the queue and print it
    Fetch,
    /// Post the result for a task
    Complete {
        id: TaskId,
        result: String,
    },
    /// Show one task
    Show {
        id: TaskId,
    },
    /// List an owner's tasks
    List {
        #[arg(long)]
        owner: String,
    },
    /// Number of messages waiting in the queue
    Depth,
    /// Run worker loops until Ctrl-C
    Worker {
        /// Executable that receives the query on stdin and prints the result.
        /// Without it, queries are echoed back.
        #[arg(long)]
        command: Option<PathBuf>,
        /// Concurrent worker loops
        #[arg(long, default_value_t = 1)]
        concurrency: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig::from_config(&config, "requestq"))?;

    let store = PgTaskStore::connect(config.database_url.expose_secret()).await?;
    store.migrate().await?;

    let broker = PgmqBroker::new(
        &config.broker,
        config.queue.visibility_timeout,
        config.queue.archive_on_ack,
    );
    let queue = Arc::new(QueueClient::new(
        broker,
        config.pool.clone(),
        config.retry,
        config.queue.clone(),
    ));
    queue.init().await?;

    let app = Tracker::new(Arc::new(store), Arc::clone(&queue), config.result_policy);

    let outcome = match cli.command {
        Command::Submit { query, owner } => cmd_submit(&app, query, owner).await,
        Command::Fetch => cmd_fetch(&app).await,
        Command::Complete { id, result } => cmd_complete(&app, id, result).await,
        Command::Show { id } => cmd_show(&app, id).await,
        Command::List { owner } => cmd_list(&app, owner).await,
        Command::Depth => {
            println!("{}", queue.depth().await?);
            Ok(())
        }
        Command::Worker {
            command,
            concurrency,
        } => cmd_worker(&app, &config, command, concurrency).await,
    };

    queue.shutdown().await;
    outcome
}

async fn cmd_submit(app: &App, query: String, owner: String) -> anyhow::Result<()> {
    let task = app.submit(NewTask::new(query, owner)).await?;
    println!("Submitted: {} (status: {})", task.id, task.status);
    Ok(())
}

async fn cmd_fetch(app: &App) -> anyhow::Result<()> {
    match app.fetch_next().await? {
        Some(dispatch) => {
            println!("{}", serde_json::to_string_pretty(&dispatch.message)?);
            if dispatch.is_redelivery() {
                eprintln!("(delivered {} times)", dispatch.delivery_count);
            }
        }
        None => println!("No requests in queue."),
    }
    Ok(())
}

async fn cmd_complete(app: &App, id: TaskId, result: String) -> anyhow::Result<()> {
    let task = app.complete(id, result).await?;
    println!("Completed: {} (updated: {})", task.id, task.updated_at);
    Ok(())
}

async fn cmd_show(app: &App, id: TaskId) -> anyhow::Result<()> {
    let task = app.get(id).await?;

    println!("ID:       {}", task.id);
    println!("Owner:    {}", task.owner);
    println!("Status:   {}", task.status);
    println!("Query:    {}", task.query);
    println!("Result:   {}", task.result.as_deref().unwrap_or("-"));
    println!("Created:  {}", task.created_at);
    println!("Updated:  {}", task.updated_at);
    Ok(())
}

async fn cmd_list(app: &App, owner: String) -> anyhow::Result<()> {
    let tasks = app.list_for_owner(&owner).await?;

    if tasks.is_empty() {
        println!("No tasks found.");
        return Ok(());
    }

    println!(
        "{:<8}  {:<10}  {:<40}  CREATED",
        "ID", "STATUS", "QUERY"
    );
    println!("{}", "-".repeat(80));

    for task in &tasks {
        let query: String = task.query.chars().take(40).collect();
        println!(
            "{:<8}  {:<10}  {:<40}  {}",
            task.id,
            task.status,
            query,
            task.created_at.format("%Y-%m-%d %H:%M")
        );
    }

    println!("\n{} task(s)", tasks.len());
    Ok(())
}

async fn cmd_worker(
    app: &App,
    config: &Config,
    command: Option<PathBuf>,
    concurrency: usize,
) -> anyhow::Result<()> {
    let processor: Arc<dyn Processor> = match command {
        Some(path) => Arc::new(CommandProcessor::new(path)),
        None => Arc::new(EchoProcessor),
    };

    let worker = Worker::new(
        app.clone(),
        processor,
        WorkerConfig {
            poll_interval: config.worker_poll_interval,
        },
    );

    let ctrl = worker.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        ctrl.shutdown();
    });

    let mut loops = tokio::task::JoinSet::new();
    for _ in 0..concurrency.max(1) {
        let w = worker.clone();
        loops.spawn(async move { w.run().await });
    }
    while let Some(joined) = loops.join_next().await {
        joined??;
    }
    Ok(())
}
