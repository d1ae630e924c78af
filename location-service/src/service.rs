use std::sync::Arc;

use async_trait::async_trait;
use shared::{Result, ServiceError};
use tracing::debug;
use uuid::Uuid;

use crate::models::{CourierLocation, LatestPosition};
use crate::publisher::LocationPublisher;
use crate::repository::{LatestPositionReader, LocationWriter};

/// The unit of work the worker pool runs for every reported position.
#[async_trait]
pub trait LocationSaver: Send + Sync {
    async fn save_latest_location(&self, location: &CourierLocation) -> Result<()>;
}

pub fn validate_coordinates(latitude: f64, longitude: f64) -> Result<()> {
    if !(-90.0..=90.0).contains(&latitude) {
        return Err(ServiceError::Validation(
            "latitude must be between -90 and 90".to_string(),
        ));
    }
    if !(-180.0..=180.0).contains(&longitude) {
        return Err(ServiceError::Validation(
            "longitude must be between -180 and 180".to_string(),
        ));
    }
    Ok(())
}

pub struct LocationService<R, P> {
    repo: Arc<R>,
    publisher: Arc<P>,
}

impl<R, P> LocationService<R, P>
where
    R: LocationWriter + LatestPositionReader,
    P: LocationPublisher,
{
    pub fn new(repo: Arc<R>, publisher: Arc<P>) -> Self {
        Self { repo, publisher }
    }

    pub async fn latest_position(&self, courier_id: Uuid) -> Result<LatestPosition> {
        self.repo.latest_position(courier_id).await
    }
}

#[async_trait]
impl<R, P> LocationSaver for LocationService<R, P>
where
    R: LocationWriter + LatestPositionReader,
    P: LocationPublisher,
{
    /// Persists first; a position that failed to store is never announced.
    async fn save_latest_location(&self, location: &CourierLocation) -> Result<()> {
        self.repo.save_location(location).await?;
        self.publisher.publish_location(&location.to_message()).await?;

        debug!(courier_id = %location.courier_id, "Courier location saved");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::publisher::RecordingLocationPublisher;
    use crate::repository::InMemoryLocationRepository;
    use chrono::Utc;

    pub(crate) type TestService = LocationService<InMemoryLocationRepository, RecordingLocationPublisher>;

    pub(crate) fn service() -> (
        TestService,
        Arc<InMemoryLocationRepository>,
        Arc<RecordingLocationPublisher>,
    ) {
        let repo = Arc::new(InMemoryLocationRepository::new());
        let publisher = Arc::new(RecordingLocationPublisher::default());
        (
            LocationService::new(repo.clone(), publisher.clone()),
            repo,
            publisher,
        )
    }

    pub(crate) fn location(courier_id: Uuid) -> CourierLocation {
        CourierLocation {
            courier_id,
            latitude: 50.4501,
            longitude: 30.5234,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn coordinates_are_range_checked() {
        assert!(validate_coordinates(90.0, -180.0).is_ok());
        assert!(matches!(
            validate_coordinates(90.5, 0.0),
            Err(ServiceError::Validation(_))
        ));
        assert!(matches!(
            validate_coordinates(0.0, 181.0),
            Err(ServiceError::Validation(_))
        ));
        assert!(validate_coordinates(f64::NAN, 0.0).is_err());
    }

    #[tokio::test]
    async fn saved_location_is_stored_then_published() {
        let (service, _, publisher) = service();
        let courier_id = Uuid::new_v4();
        let location = location(courier_id);

        service.save_latest_location(&location).await.unwrap();

        assert_eq!(
            service.latest_position(courier_id).await.unwrap(),
            LatestPosition::from(&location)
        );
        assert_eq!(publisher.messages(), vec![location.to_message()]);
    }

    #[tokio::test]
    async fn publish_failure_keeps_stored_location() {
        let (service, repo, publisher) = service();
        publisher.fail();
        let courier_id = Uuid::new_v4();

        let err = service
            .save_latest_location(&location(courier_id))
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::Transport(_)));
        assert_eq!(repo.count(courier_id), 1);
    }
}
