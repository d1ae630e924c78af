use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use shared::http::{health_check, with_cors, ApiError, ErrorResponse};
use tracing::warn;
use uuid::Uuid;

use crate::models::{CourierLocation, LatestPosition};
use crate::publisher::LocationPublisher;
use crate::repository::{LatestPositionReader, LocationWriter};
use crate::service::{validate_coordinates, LocationService};
use crate::workerpool::LocationPool;

#[derive(Debug, Deserialize)]
pub struct ReportLocationRequest {
    pub latitude: f64,
    pub longitude: f64,
}

pub struct AppState<R, P> {
    pub service: Arc<LocationService<R, P>>,
    pub pool: LocationPool,
}

impl<R, P> Clone for AppState<R, P> {
    fn clone(&self) -> Self {
        Self {
            service: self.service.clone(),
            pool: self.pool.clone(),
        }
    }
}

pub fn create_router<R, P>(state: AppState<R, P>) -> Router
where
    R: LocationWriter + LatestPositionReader + 'static,
    P: LocationPublisher + 'static,
{
    let router = Router::new()
        .route("/couriers/:id/location", post(report_location::<R, P>))
        .route("/couriers/:id/latest-position", get(latest_position::<R, P>))
        .route("/health", get(health_check))
        .with_state(state);

    with_cors(router)
}

/// Queues the report for the worker pool; 202 once it is queued.
pub async fn report_location<R, P>(
    State(state): State<AppState<R, P>>,
    Path(courier_id): Path<Uuid>,
    Json(request): Json<ReportLocationRequest>,
) -> Result<Response, ApiError>
where
    R: LocationWriter + LatestPositionReader + 'static,
    P: LocationPublisher + 'static,
{
    validate_coordinates(request.latitude, request.longitude)?;

    let location = CourierLocation {
        courier_id,
        latitude: request.latitude,
        longitude: request.longitude,
        created_at: Utc::now(),
    };

    match state.pool.add_task(location).await {
        Ok(()) => Ok(StatusCode::ACCEPTED.into_response()),
        Err(e) => {
            warn!(%courier_id, error = %e, "Dropping location report");
            Ok((
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ErrorResponse {
                    error: e.to_string(),
                }),
            )
                .into_response())
        }
    }
}

pub async fn latest_position<R, P>(
    State(state): State<AppState<R, P>>,
    Path(courier_id): Path<Uuid>,
) -> Result<Json<LatestPosition>, ApiError>
where
    R: LocationWriter + LatestPositionReader + 'static,
    P: LocationPublisher + 'static,
{
    let position = state.service.latest_position(courier_id).await?;
    Ok(Json(position))
}
