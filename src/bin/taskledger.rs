//! taskledger CLI: runs the tracker, accounting and schema gate services and
//! a few operator commands.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use secrecy::ExposeSecret;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use taskledger::broker::topology::{self, ACCOUNTING_QUEUE, AUTH_EXCHANGE, TRACKER_EXCHANGE, TRACKER_QUEUE};
use taskledger::broker::{Broker, PgmqBroker};
use taskledger::config::Config;
use taskledger::consumer::Consumer;
use taskledger::db::Db;
use taskledger::event::{Envelope, EventType};
use taskledger::http::{self, accounting_router, schema_gate_router, tracker_router};
use taskledger::ledger::{Ledger, accounting_registry};
use taskledger::model::UserId;
use taskledger::outbox::OutboxRelay;
use taskledger::publisher::EventPublisher;
use taskledger::schema::{HttpSchemaGate, SchemaGate, SchemaRegistry};
use taskledger::telemetry::{TelemetryConfig, TelemetryGuard, init_telemetry};
use taskledger::tracker::{DeliveryMode, SeededRandom, TaskTracker, tracker_registry};

#[derive(Parser)]
#[command(name = "taskledger", about = "Task tracking with an event-sourced ledger")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Task tracker service
    Tracker {
        #[command(subcommand)]
        action: ServeAction,
    },
    /// Accounting service
    Accounting {
        #[command(subcommand)]
        action: AccountingAction,
    },
    /// Schema gate service
    SchemaGate {
        #[command(subcommand)]
        action: ServeAction,
    },
    /// Broker administration
    Broker {
        #[command(subcommand)]
        action: BrokerAction,
    },
    /// Hand-publish events, e.g. to stand in for the identity service
    Events {
        #[command(subcommand)]
        action: EventsAction,
    },
}

#[derive(Subcommand)]
enum ServeAction {
    /// Run the HTTP server and background loops
    Serve {
        /// Bind address; overrides HTTP_ADDR
        #[arg(long)]
        addr: Option<SocketAddr>,
    },
}

#[derive(Subcommand)]
enum AccountingAction {
    /// Run the HTTP server and the accounting consumer
    Serve {
        #[arg(long)]
        addr: Option<SocketAddr>,
    },
    /// Compare a user's balance with their operation log
    Reconcile {
        user_id: UserId,
    },
}

#[derive(Subcommand)]
enum BrokerAction {
    /// Declare the standard queues and bindings
    Declare,
}

#[derive(Subcommand)]
enum EventsAction {
    /// Validate and publish one event
    Publish {
        /// Event type tag, e.g. user_created
        event_type: EventType,
        /// JSON payload
        payload: String,
        /// Target exchange
        #[arg(long, default_value = AUTH_EXCHANGE)]
        exchange: String,
    },
}

const TRACKER_ADDR: &str = "0.0.0.0:8080";
const ACCOUNTING_ADDR: &str = "0.0.0.0:8081";
const SCHEMA_GATE_ADDR: &str = "0.0.0.0:8010";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    match cli.command {
        Command::Tracker {
            action: ServeAction::Serve { addr },
        } => cmd_tracker_serve(config, addr).await,
        Command::Accounting { action } => match action {
            AccountingAction::Serve { addr } => cmd_accounting_serve(config, addr).await,
            AccountingAction::Reconcile { user_id } => cmd_reconcile(config, user_id).await,
        },
        Command::SchemaGate {
            action: ServeAction::Serve { addr },
        } => cmd_schema_gate_serve(config, addr).await,
        Command::Broker {
            action: BrokerAction::Declare,
        } => {
            let broker = connect_broker(&config).await?;
            topology::declare(broker.as_ref()).await?;
            println!("Declared queues {TRACKER_QUEUE}, {ACCOUNTING_QUEUE} and their bindings.");
            Ok(())
        }
        Command::Events {
            action:
                EventsAction::Publish {
                    event_type,
                    payload,
                    exchange,
                },
        } => cmd_events_publish(config, event_type, payload, exchange).await,
    }
}

async fn cmd_tracker_serve(config: Config, addr: Option<SocketAddr>) -> anyhow::Result<()> {
    let _guard = telemetry(&config, "taskledger-tracker")?;

    let db = connect_db(&config).await?;
    let broker = connect_broker(&config).await?;
    topology::declare(broker.as_ref()).await?;
    let gate = schema_gate(&config)?;

    let publisher = EventPublisher::new(broker.clone(), TRACKER_EXCHANGE);
    let tracker = TaskTracker::new(
        db.clone(),
        gate.clone(),
        publisher.clone(),
        Arc::new(SeededRandom::new(config.rng_seed)),
        config.delivery_mode,
    );
    let consumer = Consumer::new(
        broker,
        TRACKER_QUEUE,
        tracker_registry(db.clone()),
        gate,
        config.consumer.clone(),
    );
    let relay = (config.delivery_mode == DeliveryMode::Outbox)
        .then(|| OutboxRelay::new(db.clone(), publisher, config.relay.clone()));

    let stop = shutdown_signal();
    let consumer_task = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.run().await }
    });
    let relay_task = relay.clone().map(|relay| tokio::spawn(async move { relay.run().await }));

    let listener = bind(addr, &config, TRACKER_ADDR).await?;
    http::serve(listener, tracker_router(tracker), wait_for(stop), config.shutdown_grace).await?;

    consumer.shutdown();
    if let Some(relay) = &relay {
        relay.shutdown();
    }
    consumer_task.await??;
    if let Some(task) = relay_task {
        task.await??;
    }
    Ok(())
}

async fn cmd_accounting_serve(config: Config, addr: Option<SocketAddr>) -> anyhow::Result<()> {
    let _guard = telemetry(&config, "taskledger-accounting")?;

    let db = connect_db(&config).await?;
    let broker = connect_broker(&config).await?;
    topology::declare(broker.as_ref()).await?;
    let gate = schema_gate(&config)?;

    let ledger = Ledger::new(db);
    let consumer = Consumer::new(
        broker,
        ACCOUNTING_QUEUE,
        accounting_registry(&ledger),
        gate,
        config.consumer.clone(),
    );

    let stop = shutdown_signal();
    let consumer_task = tokio::spawn({
        let consumer = consumer.clone();
        async move { consumer.run().await }
    });

    let listener = bind(addr, &config, ACCOUNTING_ADDR).await?;
    http::serve(listener, accounting_router(ledger), wait_for(stop), config.shutdown_grace).await?;

    consumer.shutdown();
    consumer_task.await??;
    Ok(())
}

async fn cmd_schema_gate_serve(config: Config, addr: Option<SocketAddr>) -> anyhow::Result<()> {
    let _guard = telemetry(&config, "taskledger-schema-gate")?;

    let registry = local_registry(&config)?;
    info!(documents = registry.len(), "schema registry loaded");

    let stop = shutdown_signal();
    let listener = bind(addr, &config, SCHEMA_GATE_ADDR).await?;
    http::serve(
        listener,
        schema_gate_router(Arc::new(registry)),
        wait_for(stop),
        config.shutdown_grace,
    )
    .await?;
    Ok(())
}

async fn cmd_reconcile(config: Config, user_id: UserId) -> anyhow::Result<()> {
    let db = connect_db(&config).await?;
    let report = Ledger::new(db).reconcile(user_id).await?;

    println!("User:        {}", report.user_id);
    println!("Balance:     {}", report.balance);
    println!("Operations:  {} (sum {})", report.operation_count, report.operations_total);
    if report.is_consistent() {
        println!("Consistent.");
        Ok(())
    } else {
        anyhow::bail!("balance diverges from operation log")
    }
}

async fn cmd_events_publish(
    config: Config,
    event_type: EventType,
    payload: String,
    exchange: String,
) -> anyhow::Result<()> {
    let gate = schema_gate(&config)?;
    gate.validate(event_type, payload.as_bytes())
        .await
        .context("payload rejected by schema gate")?;

    let broker = connect_broker(&config).await?;
    let envelope = Envelope::from_raw(event_type, payload.into_bytes());
    let routed = EventPublisher::new(broker, &exchange)
        .publish(topology::ROUTING_KEY, &envelope)
        .await?;

    match envelope.event_id {
        Some(id) => println!("Published {event_type} {id} to {exchange} ({routed} queue(s))"),
        None => println!("Published {event_type} to {exchange} ({routed} queue(s))"),
    }
    Ok(())
}

fn telemetry(config: &Config, service_name: &str) -> anyhow::Result<TelemetryGuard> {
    Ok(init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: service_name.to_string(),
        log_level: config.log_level.clone(),
    })?)
}

async fn connect_db(config: &Config) -> anyhow::Result<Arc<Db>> {
    let db = Db::connect(config.database_url()?.expose_secret()).await?;
    db.migrate().await?;
    Ok(Arc::new(db))
}

async fn connect_broker(config: &Config) -> anyhow::Result<Arc<dyn Broker>> {
    let broker = PgmqBroker::connect(config.broker_url()?.expose_secret()).await?;
    Ok(Arc::new(broker))
}

/// Remote gate when configured, in-process documents otherwise.
fn schema_gate(config: &Config) -> anyhow::Result<Arc<dyn SchemaGate>> {
    match &config.schema_gate_url {
        Some(url) => Ok(Arc::new(HttpSchemaGate::new(url.clone())?)),
        None => Ok(Arc::new(local_registry(config)?)),
    }
}

fn local_registry(config: &Config) -> anyhow::Result<SchemaRegistry> {
    let registry = SchemaRegistry::load_from_dir(&config.schema_dir)?;
    if registry.is_empty() {
        warn!(
            dir = %config.schema_dir.display(),
            "no schema documents found, using built-in set"
        );
        return Ok(SchemaRegistry::builtin()?);
    }
    Ok(registry)
}

async fn bind(
    addr: Option<SocketAddr>,
    config: &Config,
    default: &str,
) -> anyhow::Result<TcpListener> {
    let addr = match (addr, &config.http_addr) {
        (Some(addr), _) => addr.to_string(),
        (None, Some(configured)) => configured.clone(),
        (None, None) => default.to_string(),
    };
    TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))
}

fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown requested");
        let _ = tx.send(true);
    });
    rx
}

async fn wait_for(mut stop: watch::Receiver<bool>) {
    let _ = stop.wait_for(|stopped| *stopped).await;
}
