//! leaseq CLI: operator interface to a Postgres-backed queue.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use leaseq::config::Config;
use leaseq::db::Db;
use leaseq::model::{Message, NewMessage};
use leaseq::queue::Queue;
use leaseq::telemetry::{TelemetryConfig, init_telemetry};
use leaseq::worker::{Handler, Listener, Processed, Step};
use secrecy::ExposeSecret;
use serde_json::Value;

#[derive(Parser)]
#[command(name = "leaseq", about = "Persistent work queue with renewable leases")]
struct Cli {
    /// Queue name (overrides LEASEQ_QUEUE)
    #[arg(long, global = true)]
    queue: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Send a JSON payload
    Send {
        /// Payload as JSON
        payload: String,
        /// Priority (higher = more urgent)
        #[arg(long, default_value_t = 0.0)]
        priority: f64,
        /// Hide the message for this many milliseconds
        #[arg(long)]
        delay_ms: Option<u64>,
        /// Retry budget for listeners
        #[arg(long, default_value_t = 0)]
        retries: u32,
    },
    /// Count messages
    Count {
        /// Only leased (`true`) or only unleased (`false`) messages
        #[arg(long)]
        running: Option<bool>,
    },
    /// Print and ack at most one message, then exit
    Drain,
    /// Print and ack messages until Ctrl-C
    Serve,
}

/// Prints every payload to stdout.
struct Echo;

#[async_trait]
impl Handler<Value> for Echo {
    async fn handle(&self, message: &Message<Value>) -> anyhow::Result<()> {
        println!(
            "{}  pri={}  retries={}  {}",
            message.id,
            message.priority,
            message.retries,
            serde_json::to_string(&message.payload)?
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "leaseq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;

    let name = cli.queue.unwrap_or_else(|| config.queue_name.clone());
    let queue = Arc::new(Queue::<Value>::with_reset_duration(
        Arc::new(db.store(name)),
        config.reset_duration,
    ));

    match cli.command {
        Command::Send {
            payload,
            priority,
            delay_ms,
            retries,
        } => cmd_send(&queue, payload, priority, delay_ms, retries).await,
        Command::Count { running } => cmd_count(&queue, running).await,
        Command::Drain => cmd_drain(queue, &config).await,
        Command::Serve => cmd_serve(queue, &config).await,
    }
}

async fn cmd_send(
    queue: &Queue<Value>,
    payload: String,
    priority: f64,
    delay_ms: Option<u64>,
    retries: u32,
) -> anyhow::Result<()> {
    let payload: Value = serde_json::from_str(&payload)?;
    let mut new = NewMessage::new(payload).priority(priority).retries(retries);
    if let Some(ms) = delay_ms {
        new = new.delay(Duration::from_millis(ms));
    }

    let message = queue.send(new).await?;
    println!(
        "Sent: {} (priority: {}, visible: {})",
        message.id.0,
        message.priority,
        message.earliest_get.format("%Y-%m-%d %H:%M:%S%.3f")
    );
    Ok(())
}

async fn cmd_count(queue: &Queue<Value>, running: Option<bool>) -> anyhow::Result<()> {
    let n = match running {
        Some(running) => queue.count_running(running).await?,
        None => queue.count().await?,
    };
    println!("{n}");
    Ok(())
}

async fn cmd_drain(queue: Arc<Queue<Value>>, config: &Config) -> anyhow::Result<()> {
    let listener = Listener::new(queue, Arc::new(Echo), config.listener_config());
    match listener.run_once().await? {
        Step::Idle => println!("Queue empty."),
        Step::Processed(Processed::Acked) => {}
        Step::Processed(other) => println!("Message {}.", other.as_str()),
        Step::Stopped => println!("Stopped."),
    }
    Ok(())
}

async fn cmd_serve(queue: Arc<Queue<Value>>, config: &Config) -> anyhow::Result<()> {
    let listener = Listener::new(queue, Arc::new(Echo), config.listener_config());

    let stop = listener.stop_token();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        stop.cancel();
    });

    listener.run().await;
    Ok(())
}
