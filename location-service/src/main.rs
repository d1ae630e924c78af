use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use diesel_migrations::{embed_migrations, EmbeddedMigrations};
use location_service::api::{self, AppState};
use location_service::consumer::TrackHandler;
use location_service::publisher::KafkaLocationPublisher;
use location_service::repository::PgLocationRepository;
use location_service::service::LocationService;
use location_service::workerpool::{LocationPool, PoolArgs};
use shared::config::KafkaArgs;
use shared::consumer::ConsumerGroup;
use shared::db::DatabaseArgs;
use shared::messages::{COURIER_LOCATION_SCHEMA, COURIER_LOCATION_TOPIC};
use shared::publisher::{create_producer, Publisher};
use shared::registry::{CachedSchemaRegistryClient, SchemaRegistry};
use shared::{http, shutdown, telemetry};
use tracing::{error, info};

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[derive(Parser)]
#[command(name = "location-service")]
struct Args {
    #[command(flatten)]
    database: DatabaseArgs,

    #[command(flatten)]
    kafka: KafkaArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Accept location reports over HTTP and answer latest-position lookups.
    Serve {
        #[command(flatten)]
        pool: PoolArgs,

        #[arg(long, env = "PORT", default_value = "3003")]
        port: u16,

        #[arg(long, env = "HTTP_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
        shutdown_grace_secs: u64,
    },
    /// Store every position published on the location topic.
    Track {
        #[arg(long, env = "KAFKA_CONSUMER_GROUP", default_value = "latest_position_courier")]
        consumer_group: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init();
    let args = Args::parse();

    args.database.run_migrations(MIGRATIONS)?;
    let db_pool = args.database.create_pool().await?;
    let repo = Arc::new(PgLocationRepository::new(db_pool));

    let registry: Arc<dyn SchemaRegistry> =
        Arc::new(CachedSchemaRegistryClient::new(&args.kafka.schema_registry_url));
    let shutdown = shutdown::root_token();

    match args.command {
        Command::Serve {
            pool: pool_args,
            port,
            shutdown_grace_secs,
        } => {
            let producer = create_producer(&args.kafka)?;
            let publisher = KafkaLocationPublisher::new(Publisher::new(
                producer,
                registry,
                COURIER_LOCATION_TOPIC,
                COURIER_LOCATION_SCHEMA,
            ));
            let service = Arc::new(LocationService::new(repo, Arc::new(publisher)));

            let (location_pool, workers) =
                LocationPool::start(service.clone(), pool_args.config(), &shutdown);

            let app = api::create_router(AppState {
                service,
                pool: location_pool,
            });
            let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
            info!("Location service web server started on port {port}");

            let served = http::serve(
                listener,
                app,
                shutdown.clone(),
                Duration::from_secs(shutdown_grace_secs),
            )
            .await;

            shutdown.cancel();
            let report = workers.shutdown().await;
            if report.residual > 0 {
                error!(residual = report.residual, "Location reports lost at shutdown");
            }
            served
        }
        Command::Track { consumer_group } => {
            let (group, control) = ConsumerGroup::new(
                &args.kafka,
                &consumer_group,
                &[COURIER_LOCATION_TOPIC],
                registry,
                Arc::new(TrackHandler::new(repo)),
            )?;
            shutdown::spawn_pause_toggle(control.clone(), shutdown.clone());

            tokio::spawn(async move {
                match control.wait_ready().await {
                    Ok(()) => info!("Location tracker is ready"),
                    Err(e) => error!(error = %e, "Location tracker never became ready"),
                }
            });

            group.run(shutdown).await?;
            Ok(())
        }
    }
}
