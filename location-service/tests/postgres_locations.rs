//! Location storage against a real Postgres.
//!
//! Require Docker. Run with:
//!
//! ```bash
//! cargo test -p location-service --test postgres_locations -- --ignored
//! ```

use std::sync::Arc;

use chrono::{Duration, DurationRound, Utc};
use diesel_migrations::{embed_migrations, EmbeddedMigrations};
use location_service::models::CourierLocation;
use location_service::repository::{LatestPositionReader, LocationWriter, PgLocationRepository};
use shared::db::DatabaseArgs;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;
use uuid::Uuid;

const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

struct Database {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<Postgres>,
    args: DatabaseArgs,
}

static DATABASE: OnceCell<Arc<Database>> = OnceCell::const_new();

async fn repository() -> PgLocationRepository {
    let db = DATABASE
        .get_or_init(|| async {
            let container = Postgres::default().start().await.unwrap();
            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432).await.unwrap();

            let args = DatabaseArgs {
                database_url: format!("postgres://postgres:postgres@{host}:{port}/postgres"),
                pool_size: 5,
            };
            let migrate = args.clone();
            tokio::task::spawn_blocking(move || migrate.run_migrations(MIGRATIONS))
                .await
                .unwrap()
                .unwrap();

            Arc::new(Database { container, args })
        })
        .await
        .clone();

    PgLocationRepository::new(db.args.create_pool().await.unwrap())
}

fn location(courier_id: Uuid, seconds_ago: i64, latitude: f64) -> CourierLocation {
    // Postgres keeps microseconds.
    let now = Utc::now()
        .duration_trunc(Duration::microseconds(1))
        .unwrap();
    CourierLocation {
        courier_id,
        latitude,
        longitude: 30.52,
        created_at: now - Duration::seconds(seconds_ago),
    }
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn latest_position_is_newest_report() {
    let repo = repository().await;
    let courier_id = Uuid::new_v4();

    repo.save_location(&location(courier_id, 0, 50.0)).await.unwrap();
    repo.save_location(&location(courier_id, 60, 49.0)).await.unwrap();

    let latest = repo.latest_position(courier_id).await.unwrap();
    assert_eq!(latest.latitude, 50.0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn duplicate_report_is_ignored() {
    let repo = repository().await;
    let courier_id = Uuid::new_v4();
    let first = location(courier_id, 5, 50.0);
    let duplicate = CourierLocation {
        latitude: 10.0,
        ..first.clone()
    };

    repo.save_location(&first).await.unwrap();
    repo.save_location(&duplicate).await.unwrap();

    assert_eq!(repo.latest_position(courier_id).await.unwrap().latitude, 50.0);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn courier_without_reports_is_not_found() {
    let repo = repository().await;

    assert!(repo
        .latest_position(Uuid::new_v4())
        .await
        .unwrap_err()
        .is_not_found());
}
