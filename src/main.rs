//! CLI for eventcore
//!
//! Subcommands:
//! - `health`: print the broker health report as JSON
//! - `listen`: subscribe a logging handler to some event types and consume
//!   until Ctrl-C
//! - `publish`: publish a single event

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use eventcore::broker::{Broker, Message, Priority, PublishOptions};
use eventcore::config::{Settings, StoreBackend, StoreSettings, load_config_from};
use eventcore::persistence::{MemoryStore, SledStore, Store};
use eventcore::publisher::Publisher;
use eventcore::subscriber::{SubscribeOptions, Subscriber};
use eventcore::utils::{HandlerResult, logging};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "eventcore", version, about = "Event broker with pub/sub and priority queues")]
struct Cli {
    /// Configuration file, extension optional
    #[arg(long, default_value = "config/default")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the broker health report
    Health,
    /// Log every event received on the given event types until Ctrl-C
    Listen {
        #[arg(long = "event", required = true)]
        events: Vec<String>,
        /// Consume from the work queues instead of the broadcast channels
        #[arg(long)]
        point_to_point: bool,
    },
    /// Publish one event
    Publish {
        #[arg(long)]
        event: String,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        payload: String,
        /// low, normal, high or critical
        #[arg(long, default_value = "normal")]
        priority: Priority,
        #[arg(long)]
        point_to_point: bool,
    },
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = match load_config_from(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    logging::init(&settings.logging.level);

    if let Err(e) = run(cli.command, settings).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(command: Command, settings: Settings) -> anyhow::Result<()> {
    let store = open_store(&settings.store)?;
    let broker = Arc::new(Broker::new(store, &settings.broker));

    match command {
        Command::Health => {
            let health = broker.health_check().await;
            println!("{}", serde_json::to_string_pretty(&health)?);
            if !health.is_healthy() {
                anyhow::bail!("store is unreachable");
            }
        }
        Command::Listen {
            events,
            point_to_point,
        } => {
            let subscriber = Subscriber::new(Arc::clone(&broker), settings.consumer);
            let options = if point_to_point {
                SubscribeOptions::point_to_point()
            } else {
                SubscribeOptions::pub_sub()
            };
            for event in &events {
                subscriber.subscribe(event, log_event, options).await;
            }

            subscriber.start_consuming().await;
            info!(events = ?events, "Listening. Press Ctrl-C to stop.");
            tokio::signal::ctrl_c()
                .await
                .context("failed to wait for Ctrl-C")?;
            info!("Shutdown signal received. Stopping consumers.");
            subscriber.stop_consuming().await;
        }
        Command::Publish {
            event,
            payload,
            priority,
            point_to_point,
        } => {
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("payload is not valid JSON")?;
            let mut options = PublishOptions::default().priority(priority);
            if point_to_point {
                options = options.point_to_point();
            }

            let publisher = Publisher::new(broker);
            if !publisher.publish(&event, payload, options).await {
                anyhow::bail!("failed to publish '{event}'");
            }
            info!(%event, ?priority, "Event published");
        }
    }

    Ok(())
}

fn open_store(settings: &StoreSettings) -> anyhow::Result<Arc<dyn Store>> {
    let store: Arc<dyn Store> = match settings.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new(settings.channel_capacity)),
        StoreBackend::Sled => Arc::new(
            SledStore::open(&settings.path, settings.channel_capacity)
                .with_context(|| format!("failed to open sled store at '{}'", settings.path))?,
        ),
    };
    Ok(store)
}

fn log_event(message: &Message) -> HandlerResult {
    info!(
        event_type = %message.event_type,
        message_id = %message.id,
        priority = ?message.priority,
        payload = %message.payload,
        "event received"
    );
    Ok(true)
}
