//! jobq CLI: operator interface to Postgres-backed job feeds.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use jobq::config::Config;
use jobq::config::secrets::ExposeSecret;
use jobq::db::Db;
use jobq::engine::{Engine, JobQueue, Reconciler, ReconcilerConfig};
use jobq::model::JobId;
use jobq::telemetry::{TelemetryConfig, init_telemetry};

#[derive(Parser)]
#[command(name = "jobq", about = "Durable job feeds")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Feed management
    Feed {
        #[command(subcommand)]
        action: FeedAction,
    },
    /// Publish a job
    Put {
        feed: String,
        /// Job payload
        content: String,
        /// Insert at the head of the queue
        #[arg(long)]
        priority: bool,
    },
    /// Claim the next job
    Get {
        feed: String,
        /// Seconds to wait; 0 polls once, omit to wait indefinitely
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Mark a claimed job finished
    Finish {
        feed: String,
        id: String,
        /// Result payload to record
        #[arg(long)]
        result: Option<String>,
    },
    /// Return a claimed job to the queue
    Cancel { feed: String, id: String },
    /// Withhold a claimed job from dispatch
    Stall { feed: String, id: String },
    /// Requeue a stalled job
    Retry { feed: String, id: String },
    /// Remove a queued or stalled job
    Retract { feed: String, id: String },
    /// List live job ids, queued first
    Ids { feed: String },
    /// Show how often a job was cancelled
    Failures { feed: String, id: String },
    /// Show the result recorded for a finished job
    Result { feed: String, id: String },
    /// Print feed counters as JSON
    Stats { feed: String },
    /// Restore jobs orphaned by partial failures
    Maintain {
        #[arg(required = true)]
        feeds: Vec<String>,
        /// Keep running, one pass every N seconds (default from config)
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        every: Option<u64>,
        /// Keep running at the configured interval
        #[arg(long, conflicts_with = "every")]
        daemon: bool,
    },
}

#[derive(Subcommand)]
enum FeedAction {
    /// Create a feed (idempotent)
    Create { name: String },
    /// Check whether a feed exists
    Exists { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "jobq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let db = Db::connect(config.database_url.expose_secret())
        .await?
        .with_poll_interval(config.poll_interval);
    db.migrate().await?;
    let engine = Engine::new(Arc::new(db)).with_result_ttl(config.result_ttl);

    match cli.command {
        Command::Feed { action } => match action {
            FeedAction::Create { name } => {
                if engine.create_feed(&name).await? {
                    println!("Created feed {name}");
                } else {
                    println!("Feed {name} already exists");
                }
            }
            FeedAction::Exists { name } => {
                println!("{}", engine.feed_exists(&name).await?);
            }
        },
        Command::Put {
            feed,
            content,
            priority,
        } => {
            let id = engine.job(&feed).await?.put(content, priority).await?;
            println!("{id}");
        }
        Command::Get { feed, timeout } => {
            let jobs = engine.job(&feed).await?;
            let job = jobs.get(timeout.map(Duration::from_secs)).await?;
            println!("ID:        {}", job.id);
            println!("Failures:  {}", job.failure_count);
            println!("Content:   {}", String::from_utf8_lossy(&job.content));
        }
        Command::Finish { feed, id, result } => {
            let jobs = engine.job(&feed).await?;
            jobs.finish(parse_id(&id)?, result.map(String::into_bytes))
                .await?;
        }
        Command::Cancel { feed, id } => engine.job(&feed).await?.cancel(parse_id(&id)?).await?,
        Command::Stall { feed, id } => engine.job(&feed).await?.stall(parse_id(&id)?).await?,
        Command::Retry { feed, id } => engine.job(&feed).await?.retry(parse_id(&id)?).await?,
        Command::Retract { feed, id } => engine.job(&feed).await?.retract(parse_id(&id)?).await?,
        Command::Ids { feed } => cmd_ids(&engine.job(&feed).await?).await?,
        Command::Failures { feed, id } => {
            let count = engine
                .job(&feed)
                .await?
                .get_failure_count(parse_id(&id)?)
                .await?;
            println!("{count}");
        }
        Command::Result { feed, id } => {
            match engine.job(&feed).await?.get_result(parse_id(&id)?).await? {
                Some(result) => println!("{}", String::from_utf8_lossy(&result)),
                None => println!("(no result)"),
            }
        }
        Command::Stats { feed } => {
            let stats = engine.job(&feed).await?.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Maintain {
            feeds,
            every,
            daemon,
        } => {
            let mut queues = Vec::with_capacity(feeds.len());
            for feed in &feeds {
                queues.push(engine.job(feed).await?);
            }
            let interval = match (every, daemon) {
                (Some(secs), _) => Some(Duration::from_secs(secs)),
                (None, true) => Some(config.maintenance_interval),
                (None, false) => None,
            };
            cmd_maintain(queues, interval).await?;
        }
    }

    Ok(())
}

fn parse_id(id: &str) -> anyhow::Result<JobId> {
    Ok(id.parse()?)
}

async fn cmd_ids(jobs: &JobQueue<Db>) -> anyhow::Result<()> {
    let ids = jobs.get_ids().await?;
    if ids.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }

    println!("{:<32}  STATE", "ID");
    println!("{}", "-".repeat(44));
    for id in &ids {
        let state = jobs
            .state(*id)
            .await?
            .map(|s| s.to_string())
            .unwrap_or_else(|| "orphaned".to_string());
        println!("{id:<32}  {state}");
    }
    println!("\n{} job(s)", ids.len());
    Ok(())
}

async fn cmd_maintain(queues: Vec<JobQueue<Db>>, interval: Option<Duration>) -> anyhow::Result<()> {
    let Some(interval) = interval else {
        for jobs in &queues {
            let restored = jobs.maintenance().await?;
            println!("{}: restored {} job(s)", jobs.feed(), restored.len());
        }
        return Ok(());
    };

    let reconciler = Reconciler::new(queues, ReconcilerConfig { interval })?;
    let handle = reconciler.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        handle.shutdown();
    });

    reconciler.run().await?;
    Ok(())
}
