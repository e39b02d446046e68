//! Command definitions and handlers for the redis-mq operator CLI.

use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::broker::Broker;
use crate::config::BrokerConfig;
use crate::events::EventBus;
use crate::gc::GcSweeper;
use crate::heartbeat::HeartbeatRegistry;
use crate::keys::{KeySchema, QueueRef};
use crate::manager::{MessageManager, QueueManager};
use crate::message::{now_millis, Priority};
use crate::metrics::{export_metrics, init_metrics, MessageRate, MetricsCollector};
use crate::store::{RedisConnector, Store, StoreConnector};
use crate::ticker::TaskGroup;

/// Default page size for listings.
const DEFAULT_TAKE: u64 = 20;

/// redis-mq: inspect and maintain Redis-backed message queues.
#[derive(Parser)]
#[command(name = "redis-mq")]
#[command(about = "Inspect and maintain Redis-backed message queues")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis connection URL. Overrides REDIS_MQ_URL.
    #[arg(long, global = true)]
    pub redis_url: Option<String>,

    /// Key prefix. Overrides REDIS_MQ_KEY_PREFIX.
    #[arg(long, global = true)]
    pub prefix: Option<String>,

    /// Default namespace for queues given without one. Overrides REDIS_MQ_NAMESPACE.
    #[arg(long, global = true)]
    pub namespace: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// List every known queue.
    Queues,

    /// Show message counts and online consumers of a queue.
    Stats(QueueArgs),

    /// List messages of a queue structure.
    List(ListArgs),

    /// Delete every message of a queue structure.
    Purge(PurgeArgs),

    /// Move a dead-lettered or acknowledged message back to its queue.
    Requeue(RequeueArgs),

    /// Delete a queue and all of its messages.
    DeleteQueue(QueueArgs),

    /// Show the heartbeat of every producer and consumer.
    Heartbeats,

    /// Run the scheduler and garbage collector until interrupted.
    Worker,

    /// Print queue depths in Prometheus text format.
    Metrics,
}

#[derive(Args, Debug, Clone)]
pub struct QueueArgs {
    /// Queue as `name` or `namespace:name`.
    pub queue: String,
}

/// Structures that can be listed or purged.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Pending,
    Priority,
    Acknowledged,
    DeadLetter,
    Scheduled,
}

#[derive(Args, Debug, Clone)]
pub struct ListArgs {
    #[arg(value_enum)]
    pub target: Target,

    /// Queue as `name` or `namespace:name`. Not used for `scheduled`.
    pub queue: Option<String>,

    /// Number of entries to skip.
    #[arg(long, default_value = "0")]
    pub skip: u64,

    /// Maximum number of entries to return.
    #[arg(long, default_value_t = DEFAULT_TAKE)]
    pub take: u64,
}

#[derive(Args, Debug, Clone)]
pub struct PurgeArgs {
    #[arg(value_enum)]
    pub target: Target,

    /// Queue as `name` or `namespace:name`. Not used for `scheduled`.
    pub queue: Option<String>,
}

/// Logs a message can be requeued from.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequeueSource {
    DeadLetter,
    Acknowledged,
}

#[derive(Args, Debug, Clone)]
pub struct RequeueArgs {
    #[arg(value_enum)]
    pub source: RequeueSource,

    /// Queue as `name` or `namespace:name`.
    pub queue: String,

    /// Position of the message in the log, as shown by `list`.
    pub sequence_id: u64,

    /// Id of the message.
    pub message_id: Uuid,

    /// Requeue into the priority queue with this priority (0 = highest, 7 = lowest).
    #[arg(long, value_parser = clap::value_parser!(u8).range(0..=7))]
    pub priority: Option<u8>,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parse arguments and run the selected command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with already parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(&cli)?;

    let store = RedisConnector::new(config.redis_url.clone())
        .connect()
        .await
        .with_context(|| format!("failed to connect to {}", config.redis_url))?;
    let keys = KeySchema::new(&config.key_prefix)?;

    let result = dispatch(cli.command, &config, store.clone(), keys).await;
    store.quit().await?;
    result
}

fn load_config(cli: &Cli) -> anyhow::Result<BrokerConfig> {
    let mut config = BrokerConfig::from_env().context("invalid environment configuration")?;
    if let Some(url) = &cli.redis_url {
        config = config.with_redis_url(url.clone());
    }
    if let Some(prefix) = &cli.prefix {
        config = config.with_key_prefix(prefix.clone());
    }
    if let Some(namespace) = &cli.namespace {
        config = config.with_namespace(namespace.to_lowercase());
    }
    config.validate()?;
    Ok(config)
}

async fn dispatch(
    command: Commands,
    config: &BrokerConfig,
    store: Arc<dyn Store>,
    keys: KeySchema,
) -> anyhow::Result<()> {
    match command {
        Commands::Queues => {
            let queues = queue_manager(config, store, keys).list_queues().await?;
            print_json(&queues)
        }
        Commands::Stats(args) => {
            let queue = parse_queue(&args.queue, config)?;
            let manager = queue_manager(config, store, keys);
            let stats = QueueStats {
                metrics: manager.queue_metrics(&queue).await?,
                consumers: manager.queue_consumers(&queue).await?,
                queue,
            };
            print_json(&stats)
        }
        Commands::List(args) => run_list(args, config, store, keys).await,
        Commands::Purge(args) => run_purge(args, config, store, keys).await,
        Commands::Requeue(args) => run_requeue(args, config, store, keys).await,
        Commands::DeleteQueue(args) => {
            let queue = parse_queue(&args.queue, config)?;
            queue_manager(config, store, keys).delete_queue(&queue).await?;
            println!("Deleted queue {}", queue);
            Ok(())
        }
        Commands::Heartbeats => {
            let registry = HeartbeatRegistry::new(store, keys, config.heartbeat_freshness);
            print_json(&registry.instances(now_millis()).await?)
        }
        Commands::Worker => run_worker(config, store, keys).await,
        Commands::Metrics => run_metrics(config, store, keys).await,
    }
}

// ============================================================================
// Listing and maintenance
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueueStats {
    queue: QueueRef,
    metrics: crate::manager::QueueMetrics,
    consumers: Vec<crate::manager::ConsumerInfo>,
}

async fn run_list(
    args: ListArgs,
    config: &BrokerConfig,
    store: Arc<dyn Store>,
    keys: KeySchema,
) -> anyhow::Result<()> {
    let manager = MessageManager::new(store, keys);
    let queue = || required_queue(args.queue.as_deref(), args.target, config);
    match args.target {
        Target::Scheduled => print_json(&manager.scheduled(args.skip, args.take).await?),
        Target::Pending => print_json(&manager.pending(&queue()?, args.skip, args.take).await?),
        Target::Acknowledged => {
            print_json(&manager.acknowledged(&queue()?, args.skip, args.take).await?)
        }
        Target::DeadLetter => {
            print_json(&manager.dead_lettered(&queue()?, args.skip, args.take).await?)
        }
        Target::Priority => print_json(
            &manager
                .pending_with_priority(&queue()?, args.skip, args.take)
                .await?,
        ),
    }
}

async fn run_purge(
    args: PurgeArgs,
    config: &BrokerConfig,
    store: Arc<dyn Store>,
    keys: KeySchema,
) -> anyhow::Result<()> {
    let manager = MessageManager::new(store, keys);
    if args.target == Target::Scheduled {
        manager.purge_scheduled().await?;
        println!("Purged scheduled messages");
        return Ok(());
    }

    let queue = required_queue(args.queue.as_deref(), args.target, config)?;
    match args.target {
        Target::Pending => manager.purge_pending(&queue).await?,
        Target::Priority => manager.purge_pending_with_priority(&queue).await?,
        Target::Acknowledged => manager.purge_acknowledged(&queue).await?,
        Target::DeadLetter => manager.purge_dead_letter(&queue).await?,
        Target::Scheduled => manager.purge_scheduled().await?,
    }
    println!("Purged {:?} messages of {}", args.target, queue);
    Ok(())
}

async fn run_requeue(
    args: RequeueArgs,
    config: &BrokerConfig,
    store: Arc<dyn Store>,
    keys: KeySchema,
) -> anyhow::Result<()> {
    let queue = parse_queue(&args.queue, config)?;
    let priority = args
        .priority
        .map(Priority::try_from)
        .transpose()
        .map_err(anyhow::Error::msg)?;

    let manager = MessageManager::new(store, keys);
    match args.source {
        RequeueSource::DeadLetter => {
            manager
                .requeue_from_dead_letter(&queue, args.sequence_id, args.message_id, priority)
                .await?
        }
        RequeueSource::Acknowledged => {
            manager
                .requeue_from_acknowledged(&queue, args.sequence_id, args.message_id, priority)
                .await?
        }
    }
    println!("Requeued message {} to {}", args.message_id, queue);
    Ok(())
}

// ============================================================================
// Background maintenance
// ============================================================================

/// Runs the scheduler and the GC sweeper without consuming any queue.
async fn run_worker(config: &BrokerConfig, store: Arc<dyn Store>, keys: KeySchema) -> anyhow::Result<()> {
    let rate = Arc::new(MessageRate::new(config.metrics_enabled));
    let broker = Broker::new(
        store.clone(),
        keys.clone(),
        config.clone(),
        EventBus::new(),
        rate,
    );
    let registry = HeartbeatRegistry::new(store.clone(), keys.clone(), config.heartbeat_freshness);
    let sweeper = GcSweeper::new(store, keys, registry, broker.collector());

    let mut tasks = TaskGroup::new();
    tasks.spawn_ticker(broker.scheduler(), config.scheduler_interval);
    tasks.spawn_ticker(Arc::new(sweeper), config.gc_interval);
    info!(
        scheduler_interval_ms = config.scheduler_interval.as_millis() as u64,
        gc_interval_ms = config.gc_interval.as_millis() as u64,
        "Maintenance worker started, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    info!("Stopping maintenance worker");
    tasks.shutdown(config.shutdown_timeout).await?;
    Ok(())
}

async fn run_metrics(config: &BrokerConfig, store: Arc<dyn Store>, keys: KeySchema) -> anyhow::Result<()> {
    init_metrics().context("failed to register metrics")?;
    let manager = queue_manager(config, store, keys);
    let collector = MetricsCollector::new();
    for queue in manager.list_queues().await? {
        let metrics = manager.queue_metrics(&queue).await?;
        collector.update_queue_depth(
            &queue.to_string(),
            metrics.pending + metrics.pending_with_priority,
        );
    }
    print!("{}", export_metrics());
    Ok(())
}

// ============================================================================
// Helpers
// ============================================================================

fn queue_manager(config: &BrokerConfig, store: Arc<dyn Store>, keys: KeySchema) -> QueueManager {
    QueueManager::new(store, keys, config.heartbeat_freshness)
}

fn parse_queue(input: &str, config: &BrokerConfig) -> anyhow::Result<QueueRef> {
    Ok(QueueRef::parse_in(input, &config.namespace)?)
}

fn required_queue(
    input: Option<&str>,
    target: Target,
    config: &BrokerConfig,
) -> anyhow::Result<QueueRef> {
    let input = input.with_context(|| format!("a queue is required for {:?}", target))?;
    parse_queue(input, config)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_list_defaults() {
        let cli = Cli::try_parse_from(["redis-mq", "list", "pending", "orders"]).expect("should parse");
        match cli.command {
            Commands::List(args) => {
                assert_eq!(args.target, Target::Pending);
                assert_eq!(args.queue.as_deref(), Some("orders"));
                assert_eq!(args.skip, 0);
                assert_eq!(args.take, DEFAULT_TAKE);
            }
            _ => panic!("Expected List command"),
        }
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_requeue_with_priority() {
        let id = Uuid::new_v4().to_string();
        let cli = Cli::try_parse_from([
            "redis-mq",
            "requeue",
            "dead-letter",
            "ns1:orders",
            "3",
            id.as_str(),
            "--priority",
            "2",
            "--redis-url",
            "redis://example:6379",
        ])
        .expect("should parse");
        assert_eq!(cli.redis_url.as_deref(), Some("redis://example:6379"));
        match cli.command {
            Commands::Requeue(args) => {
                assert_eq!(args.source, RequeueSource::DeadLetter);
                assert_eq!(args.sequence_id, 3);
                assert_eq!(args.message_id.to_string(), id);
                assert_eq!(args.priority, Some(2));
            }
            _ => panic!("Expected Requeue command"),
        }
    }

    #[test]
    fn test_requeue_rejects_out_of_range_priority() {
        let id = Uuid::new_v4().to_string();
        let parsed = Cli::try_parse_from([
            "redis-mq",
            "requeue",
            "acknowledged",
            "orders",
            "0",
            id.as_str(),
            "--priority",
            "9",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_required_queue() {
        let config = BrokerConfig::default();
        assert!(required_queue(None, Target::Pending, &config).is_err());
        let queue = required_queue(Some("orders"), Target::Pending, &config).unwrap();
        assert_eq!(queue.to_string(), "default:orders");
    }
}
