use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::http::{health_check, with_cors, ApiError};
use uuid::Uuid;

use crate::models::OrderStatus;
use crate::publisher::OrderPublisher;
use crate::repository::{OrderStore, ValidationStore};
use crate::saga::OrderService;

#[derive(Debug, Deserialize)]
pub struct CreateOrderRequest {
    pub customer_phone_number: String,
}

#[derive(Debug, Serialize)]
pub struct CreateOrderResponse {
    pub id: Uuid,
    pub status: OrderStatus,
}

#[derive(Debug, Serialize)]
pub struct GetOrderResponse {
    pub id: Uuid,
    pub status: OrderStatus,
    pub courier_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

pub fn create_router<R, P>(service: Arc<OrderService<R, P>>) -> Router
where
    R: OrderStore + ValidationStore + 'static,
    P: OrderPublisher + 'static,
{
    let router = Router::new()
        .route("/orders", post(create_order::<R, P>))
        .route("/orders/:id", get(get_order::<R, P>))
        .route("/health", get(health_check))
        .with_state(service);

    with_cors(router)
}

pub async fn create_order<R, P>(
    State(service): State<Arc<OrderService<R, P>>>,
    Json(request): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<CreateOrderResponse>), ApiError>
where
    R: OrderStore + ValidationStore + 'static,
    P: OrderPublisher + 'static,
{
    let order = service.create_order(&request.customer_phone_number).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(CreateOrderResponse {
            id: order.id,
            status: order.status,
        }),
    ))
}

pub async fn get_order<R, P>(
    State(service): State<Arc<OrderService<R, P>>>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<GetOrderResponse>, ApiError>
where
    R: OrderStore + ValidationStore + 'static,
    P: OrderPublisher + 'static,
{
    let order = service.get_order(order_id).await?;

    Ok(Json(GetOrderResponse {
        id: order.id,
        status: order.status,
        courier_id: order.courier_id,
        created_at: order.created_at,
    }))
}
