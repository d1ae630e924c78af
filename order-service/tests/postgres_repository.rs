//! Postgres-backed repository tests.
//!
//! Require Docker. Run with:
//!
//! ```bash
//! cargo test -p order-service --test postgres_repository -- --ignored
//! ```

use std::sync::Arc;

use chrono::Utc;
use diesel_migrations::{embed_migrations, EmbeddedMigrations};
use order_service::models::{Order, OrderStatus, OrderValidation};
use order_service::repository::{OrderStore, PgOrderRepository, ValidationStore};
use shared::db::DatabaseArgs;
use shared::ServiceError;
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

async fn database() -> Arc<Database> {
    DATABASE
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
        .clone()
}

async fn repository() -> PgOrderRepository {
    let db = database().await;
    PgOrderRepository::new(db.args.create_pool().await.unwrap())
}

async fn stored_order(repo: &PgOrderRepository) -> Order {
    let order = Order::new("+380501234567".to_string());
    repo.insert_order(&order).await.unwrap();
    order
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn order_round_trips_with_courier_and_status() {
    let repo = repository().await;
    let mut order = stored_order(&repo).await;

    order.courier_id = Some(Uuid::new_v4());
    order.status = OrderStatus::Accepted;
    repo.update_order(&order).await.unwrap();

    let found = repo.find_order(order.id).await.unwrap();
    assert_eq!(found.courier_id, order.courier_id);
    assert_eq!(found.status, OrderStatus::Accepted);
    assert!(repo.find_order(Uuid::new_v4()).await.unwrap_err().is_not_found());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn duplicate_validation_insert_conflicts() {
    let repo = repository().await;
    let order = stored_order(&repo).await;
    let validation = OrderValidation::new(order.id);

    repo.insert_validation(&validation).await.unwrap();
    let err = repo.insert_validation(&validation).await.unwrap_err();

    assert!(matches!(err, ServiceError::ConcurrentValidationConflict(id) if id == order.id));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn stale_token_update_conflicts() {
    let repo = repository().await;
    let order = stored_order(&repo).await;
    let stored = repo
        .insert_validation(&OrderValidation::new(order.id))
        .await
        .unwrap();

    let mut validated = stored.clone();
    validated.courier_validated_at = Some(Utc::now());
    let updated = repo
        .update_validation(&validated, stored.updated_at)
        .await
        .unwrap();
    assert!(updated.updated_at > stored.updated_at);

    let mut failed = stored.clone();
    failed.courier_error = Some("late".to_string());
    let err = repo
        .update_validation(&failed, stored.updated_at)
        .await
        .unwrap_err();
    assert!(err.is_conflict());

    let current = repo.find_validation(order.id).await.unwrap().unwrap();
    assert_eq!(current.updated_at, updated.updated_at);
    assert!(current.courier_error.is_none());
}
