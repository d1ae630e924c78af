use std::sync::Arc;

use shared::{Result, ServiceError};
use tracing::{info, warn};
use uuid::Uuid;

use crate::location_client::LocationClient;
use crate::models::{Courier, CourierAssignment, CourierWithLatestPosition};
use crate::publisher::{assignment_succeeded, ValidationPublisher};
use crate::repository::{AssignmentStore, CourierStore};

const MAX_FIRSTNAME_LEN: usize = 40;

pub struct CourierService<R, L, P> {
    repo: Arc<R>,
    locations: Arc<L>,
    publisher: Arc<P>,
}

impl<R, L, P> CourierService<R, L, P>
where
    R: CourierStore + AssignmentStore,
    L: LocationClient,
    P: ValidationPublisher,
{
    pub fn new(repo: Arc<R>, locations: Arc<L>, publisher: Arc<P>) -> Self {
        Self {
            repo,
            locations,
            publisher,
        }
    }

    pub async fn create_courier(&self, firstname: &str) -> Result<Courier> {
        let firstname = firstname.trim();
        if firstname.is_empty() {
            return Err(ServiceError::Validation("firstname is required".to_string()));
        }
        if firstname.chars().count() > MAX_FIRSTNAME_LEN {
            return Err(ServiceError::Validation(format!(
                "firstname must be at most {MAX_FIRSTNAME_LEN} characters"
            )));
        }

        let courier = Courier::new(firstname.to_string());
        self.repo.insert_courier(&courier).await?;

        info!(courier_id = %courier.id, "Courier created");
        Ok(courier)
    }

    pub async fn get_courier_with_latest_position(
        &self,
        courier_id: Uuid,
    ) -> Result<CourierWithLatestPosition> {
        let courier = self.repo.find_courier(courier_id).await?;
        let latest_position = self.locations.latest_position(courier_id).await?;

        Ok(CourierWithLatestPosition {
            id: courier.id,
            firstname: courier.firstname,
            is_available: courier.is_available,
            latest_position,
        })
    }

    /// Assigns a courier and reports the assignment to the order saga.
    ///
    /// With every courier taken this fails with
    /// [`ServiceError::NoCourierAvailable`] and publishes nothing; the order
    /// message is redelivered and retried.
    pub async fn assign_order_to_courier(&self, order_id: Uuid) -> Result<CourierAssignment> {
        let assignment = match self.repo.assign_order_to_courier(order_id).await {
            Ok(assignment) => assignment,
            Err(e @ ServiceError::NoCourierAvailable(_)) => {
                warn!(%order_id, "No courier available");
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        self.publisher
            .publish_validation(&assignment_succeeded(&assignment))
            .await?;
        info!(%order_id, courier_id = %assignment.courier_id, "Courier assigned");
        Ok(assignment)
    }
}
