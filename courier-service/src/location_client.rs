use async_trait::async_trait;
use reqwest::StatusCode;
use shared::{Result, ServiceError};
use uuid::Uuid;

use crate::models::LatestPosition;

/// Client side of the location service's latest-position lookup.
#[async_trait]
pub trait LocationClient: Send + Sync {
    /// `None` when the location service has never seen the courier.
    async fn latest_position(&self, courier_id: Uuid) -> Result<Option<LatestPosition>>;
}

pub struct HttpLocationClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpLocationClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl LocationClient for HttpLocationClient {
    async fn latest_position(&self, courier_id: Uuid) -> Result<Option<LatestPosition>> {
        let url = format!("{}/couriers/{}/latest-position", self.base_url, courier_id);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ServiceError::Transport(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let position = response
                    .json::<LatestPosition>()
                    .await
                    .map_err(|e| ServiceError::Transport(e.to_string()))?;
                Ok(Some(position))
            }
            status => Err(ServiceError::Transport(format!(
                "location service returned {status} for courier {courier_id}"
            ))),
        }
    }
}
