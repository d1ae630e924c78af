use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use shared::http::{health_check, with_cors, ApiError};
use uuid::Uuid;

use crate::location_client::LocationClient;
use crate::models::{Courier, CourierWithLatestPosition};
use crate::publisher::ValidationPublisher;
use crate::repository::{AssignmentStore, CourierStore};
use crate::service::CourierService;

#[derive(Debug, Deserialize)]
pub struct CreateCourierRequest {
    pub firstname: String,
}

#[derive(Debug, Serialize)]
pub struct CreateCourierResponse {
    pub status: &'static str,
    pub message: &'static str,
    pub entity: Courier,
}

pub fn create_router<R, L, P>(service: Arc<CourierService<R, L, P>>) -> Router
where
    R: CourierStore + AssignmentStore + 'static,
    L: LocationClient + 'static,
    P: ValidationPublisher + 'static,
{
    let router = Router::new()
        .route("/couriers", post(create_courier::<R, L, P>))
        .route("/couriers/:id", get(get_courier::<R, L, P>))
        .route("/health", get(health_check))
        .with_state(service);

    with_cors(router)
}

pub async fn create_courier<R, L, P>(
    State(service): State<Arc<CourierService<R, L, P>>>,
    Json(request): Json<CreateCourierRequest>,
) -> Result<(StatusCode, Json<CreateCourierResponse>), ApiError>
where
    R: CourierStore + AssignmentStore + 'static,
    L: LocationClient + 'static,
    P: ValidationPublisher + 'static,
{
    let courier = service.create_courier(&request.firstname).await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateCourierResponse {
            status: "success",
            message: "New courier created.",
            entity: courier,
        }),
    ))
}

pub async fn get_courier<R, L, P>(
    State(service): State<Arc<CourierService<R, L, P>>>,
    Path(courier_id): Path<Uuid>,
) -> Result<Json<CourierWithLatestPosition>, ApiError>
where
    R: CourierStore + AssignmentStore + 'static,
    L: LocationClient + 'static,
    P: ValidationPublisher + 'static,
{
    let courier = service.get_courier_with_latest_position(courier_id).await?;
    Ok(Json(courier))
}
