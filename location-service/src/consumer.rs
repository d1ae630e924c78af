use std::sync::Arc;

use async_trait::async_trait;
use shared::consumer::MessageHandler;
use shared::messages::CourierLocationMessage;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::models::CourierLocation;
use crate::repository::LocationWriter;

/// Mirrors `courier_latest_positions.v1` into the location store.
pub struct TrackHandler<W> {
    writer: Arc<W>,
}

impl<W> TrackHandler<W> {
    pub fn new(writer: Arc<W>) -> Self {
        Self { writer }
    }
}

#[async_trait]
impl<W> MessageHandler for TrackHandler<W>
where
    W: LocationWriter + 'static,
{
    async fn handle(&self, message: serde_json::Value) -> anyhow::Result<()> {
        let message: CourierLocationMessage = match serde_json::from_value(message) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Failed to parse courier location, skipping");
                return Ok(());
            }
        };

        let Ok(courier_id) = Uuid::parse_str(&message.courier_id) else {
            warn!(courier_id = %message.courier_id, "Courier location has an invalid courier id, skipping");
            return Ok(());
        };

        let location = CourierLocation {
            courier_id,
            latitude: message.latitude,
            longitude: message.longitude,
            created_at: message.created_at,
        };
        self.writer
            .save_location(&location)
            .await
            .map_err(|e| anyhow::Error::new(e).context(format!("can not store location of courier {courier_id}")))?;

        debug!(%courier_id, "Courier location tracked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{InMemoryLocationRepository, LatestPositionReader};
    use chrono::Utc;
    use serde_json::json;

    #[tokio::test]
    async fn tracked_location_is_stored_once() {
        let repo = Arc::new(InMemoryLocationRepository::new());
        let handler = TrackHandler::new(repo.clone());
        let courier_id = Uuid::new_v4();
        let message = serde_json::to_value(CourierLocationMessage {
            courier_id: courier_id.to_string(),
            latitude: 46.48,
            longitude: 30.72,
            created_at: Utc::now(),
        })
        .unwrap();

        handler.handle(message.clone()).await.unwrap();
        handler.handle(message).await.unwrap();

        assert_eq!(repo.count(courier_id), 1);
        assert_eq!(repo.latest_position(courier_id).await.unwrap().latitude, 46.48);
    }

    #[tokio::test]
    async fn malformed_locations_are_skipped() {
        let repo = Arc::new(InMemoryLocationRepository::new());
        let handler = TrackHandler::new(repo);

        handler.handle(json!({ "courier_id": 7 })).await.unwrap();
        handler
            .handle(json!({
                "courier_id": "not-a-uuid",
                "latitude": 1.0,
                "longitude": 1.0,
                "created_at": Utc::now(),
            }))
            .await
            .unwrap();
    }
}
