use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use courier_service::api;
use courier_service::consumer::OrderHandler;
use courier_service::location_client::HttpLocationClient;
use courier_service::publisher::KafkaValidationPublisher;
use courier_service::repository::PgCourierRepository;
use courier_service::service::CourierService;
use diesel_migrations::{embed_migrations, EmbeddedMigrations};
use shared::config::KafkaArgs;
use shared::consumer::ConsumerGroup;
use shared::db::DatabaseArgs;
use shared::messages::{ORDER_TOPIC, ORDER_VALIDATION_SCHEMA, ORDER_VALIDATION_TOPIC};
use shared::publisher::{create_producer, Publisher};
use shared::registry::{CachedSchemaRegistryClient, SchemaRegistry};
use shared::{http, shutdown, telemetry};
use tracing::{error, info};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Parser)]
#[command(name = "courier-service")]
struct Args {
    #[command(flatten)]
    database: DatabaseArgs,

    #[command(flatten)]
    kafka: KafkaArgs,

    #[arg(long, env = "KAFKA_CONSUMER_GROUP", default_value = "courier-service")]
    consumer_group: String,

    /// Base URL of the location service's latest-position endpoint.
    #[arg(long, env = "LOCATION_SERVICE_URL", default_value = "http://localhost:3003")]
    location_service_url: String,

    #[arg(long, env = "PORT", default_value = "3002")]
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
    let publisher = KafkaValidationPublisher::new(Publisher::new(
        producer,
        registry.clone(),
        ORDER_VALIDATION_TOPIC,
        ORDER_VALIDATION_SCHEMA,
    ));

    let service = Arc::new(CourierService::new(
        Arc::new(PgCourierRepository::new(pool)),
        Arc::new(HttpLocationClient::new(&args.location_service_url)),
        Arc::new(publisher),
    ));

    let shutdown = shutdown::root_token();

    let (group, control) = ConsumerGroup::new(
        &args.kafka,
        &args.consumer_group,
        &[ORDER_TOPIC],
        registry,
        Arc::new(OrderHandler::new(service.clone())),
    )?;
    shutdown::spawn_pause_toggle(control.clone(), shutdown.clone());
    let consumer = tokio::spawn(group.run(shutdown.clone()));

    tokio::spawn(async move {
        match control.wait_ready().await {
            Ok(()) => info!("Order consumer is ready"),
            Err(e) => error!(error = %e, "Order consumer never became ready"),
        }
    });

    let app = api::create_router(service);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", args.port)).await?;
    info!("Courier service web server started on port {}", args.port);

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
