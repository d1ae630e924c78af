use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use diesel_migrations::{embed_migrations, EmbeddedMigrations};
use order_service::api;
use order_service::consumer::ValidationHandler;
use order_service::publisher::KafkaOrderPublisher;
use order_service::repository::PgOrderRepository;
use order_service::saga::OrderService;
use shared::config::KafkaArgs;
use shared::consumer::ConsumerGroup;
use shared::db::DatabaseArgs;
use shared::messages::{ORDER_MESSAGE_SCHEMA, ORDER_TOPIC, ORDER_VALIDATION_TOPIC};
use shared::publisher::{create_producer, Publisher};
use shared::registry::{CachedSchemaRegistryClient, SchemaRegistry};
use shared::{http, shutdown, telemetry};
use tracing::{error, info};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Parser)]
#[command(name = "order-service")]
struct Args {
    #[command(flatten)]
    database: DatabaseArgs,

    #[command(flatten)]
    kafka: KafkaArgs,

    #[arg(long, env = "KAFKA_CONSUMER_GROUP", default_value = "order-service")]
    consumer_group: String,

    #[arg(long, env = "PORT", default_value = "3001")]
    port: u16,

    #[arg(long, env = "HTTP_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    shutdown_grace_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();
    let args = Args::parse();

    args.database.run_migrations(MIGRATIONS)?;
    let pool = args.database.create_pool().await?;

    let registry: Arc<dyn SchemaRegistry> =
        Arc::new(CachedSchemaRegistryClient::new(&args.kafka.schema_registry_url));
    let producer = create_producer(&args.kafka)?;
    let publisher = KafkaOrderPublisher::new(Publisher::new(
        producer,
        registry.clone(),
        ORDER_TOPIC,
        ORDER_MESSAGE_SCHEMA,
    ));

    let service = Arc::new(OrderService::new(
        Arc::new(PgOrderRepository::new(pool)),
        Arc::new(publisher),
    ));

    let shutdown = shutdown::root_token();

    let (group, control) = ConsumerGroup::new(
        &args.kafka,
        &args.consumer_group,
        &[ORDER_VALIDATION_TOPIC],
        registry,
        Arc::new(ValidationHandler::new(service.clone())),
    )?;
    shutdown::spawn_pause_toggle(control.clone(), shutdown.clone());
    let consumer = tokio::spawn(group.run(shutdown.clone()));

    tokio::spawn(async move {
        match control.wait_ready().await {
            Ok(()) => info!("Order validation consumer is ready"),
            Err(e) => error!(error = %e, "Order validation consumer never became ready"),
        }
    });

    let app = api::create_router(service);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;
    info!("Order service web server started on port {}", args.port);

    let served = http::serve(
        listener,
        app,
        shutdown.clone(),
        Duration::from_secs(args.shutdown_grace_secs),
    )
    .await;

    shutdown.cancel();
    consumer.await??;
    served
}
