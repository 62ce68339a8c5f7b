//! Dispatcher one-shot consumer
//!
//! Diagnostic tool that fetches a single message from a queue, prints it and
//! acknowledges it. Useful to check that submissions reach the broker.
//!
//! ## Usage
//!
//! ```bash
//! # Configured default queue, declaring the default topology first
//! consume-once
//!
//! # Another queue, without touching topology
//! consume-once --queue orders_queue --no-declare
//! ```

use clap::Parser;
use dispatcher::config::GatewayConfig;
use dispatcher::messaging::DEFAULT_EXCHANGE;
use dispatcher::observability::init_from_config;
use dispatcher::task::TaskBody;
use dispatcher::transport::amqp::channel::{exchange_kind, queue_arguments};
use dispatcher::transport::amqp::classify_lapin_error;
use dispatcher::transport::{ExchangeType, QueueSpec};
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicNackOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};
use std::path::PathBuf;
use std::process;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(
    name = "consume-once",
    about = "Fetch, print and acknowledge one message from a dispatcher queue"
)]
struct Args {
    /// Env file seeding the configuration (default: ./.env)
    #[arg(long, value_name = "FILE")]
    env_file: Option<PathBuf>,

    /// Exchange to declare and bind (default: configured exchange)
    #[arg(long)]
    exchange: Option<String>,

    /// Exchange type (default: configured type)
    #[arg(long)]
    exchange_type: Option<ExchangeType>,

    /// Queue to read from (default: configured queue)
    #[arg(long)]
    queue: Option<String>,

    /// Binding key (default: configured routing key)
    #[arg(long)]
    routing_key: Option<String>,

    /// Skip topology declaration and read from an existing queue
    #[arg(long)]
    no_declare: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match GatewayConfig::load(args.env_file.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            process::exit(1);
        }
    };
    init_from_config(&config.log, 0);

    if let Err(e) = consume_once(&args, &config).await {
        error!("consume-once failed: {}", e);
        process::exit(1);
    }
}

async fn consume_once(
    args: &Args,
    config: &GatewayConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    let exchange = args
        .exchange
        .clone()
        .unwrap_or_else(|| config.topology.default_exchange_name.clone());
    let exchange_type = args
        .exchange_type
        .unwrap_or(config.topology.default_exchange_type);
    let queue = args
        .queue
        .clone()
        .unwrap_or_else(|| config.topology.default_queue_name.clone());
    let routing_key = args
        .routing_key
        .clone()
        .unwrap_or_else(|| config.topology.default_routing_key.clone());

    let connection = Connection::connect(
        &config.broker.url,
        ConnectionProperties::default().with_connection_name("dispatcher-consume-once".into()),
    )
    .await
    .map_err(|e| classify_lapin_error(&e))?;
    info!(broker = %config.broker.redacted_url(), "Connected");

    let channel = connection
        .create_channel()
        .await
        .map_err(|e| classify_lapin_error(&e))?;

    if !args.no_declare {
        declare_topology(
            &channel,
            &exchange,
            exchange_type,
            &QueueSpec::durable(&queue, config.topology.queue_max_priority),
            &routing_key,
        )
        .await?;
    }

    let fetched = channel
        .basic_get(&queue, BasicGetOptions::default())
        .await
        .map_err(|e| classify_lapin_error(&e))?;

    match fetched {
        None => println!("Queue '{queue}' is empty"),
        Some(message) => {
            let remaining = message.message_count;
            let delivery = message.delivery;
            let message_id = delivery
                .properties
                .message_id()
                .as_ref()
                .map(|id| id.as_str().to_string())
                .unwrap_or_default();
            let priority = delivery.properties.priority().unwrap_or(0);

            match serde_json::from_slice::<TaskBody>(&delivery.data) {
                Ok(body) => {
                    println!("message_id: {message_id}");
                    println!("priority:   {priority}");
                    println!("remaining:  {remaining}");
                    println!("{}", serde_json::to_string_pretty(&body)?);
                    delivery
                        .acker
                        .ack(BasicAckOptions::default())
                        .await
                        .map_err(|e| classify_lapin_error(&e))?;
                    info!(message_id = %message_id, "Message acknowledged");
                }
                Err(e) => {
                    warn!(message_id = %message_id, error = %e, "Undecodable message, discarding");
                    println!("{}", String::from_utf8_lossy(&delivery.data));
                    delivery
                        .acker
                        .nack(BasicNackOptions {
                            requeue: false,
                            ..Default::default()
                        })
                        .await
                        .map_err(|e| classify_lapin_error(&e))?;
                }
            }
        }
    }

    let _ = channel.close(200, "OK").await;
    let _ = connection.close(200, "OK").await;
    Ok(())
}

async fn declare_topology(
    channel: &Channel,
    exchange: &str,
    exchange_type: ExchangeType,
    queue: &QueueSpec,
    routing_key: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    channel
        .queue_declare(
            &queue.name,
            QueueDeclareOptions {
                durable: queue.durable,
                ..Default::default()
            },
            queue_arguments(queue),
        )
        .await
        .map_err(|e| classify_lapin_error(&e))?;

    if exchange == DEFAULT_EXCHANGE {
        return Ok(());
    }

    channel
        .exchange_declare(
            exchange,
            exchange_kind(exchange_type),
            ExchangeDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| classify_lapin_error(&e))?;

    channel
        .queue_bind(
            &queue.name,
            exchange,
            routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| classify_lapin_error(&e))?;
    Ok(())
}
