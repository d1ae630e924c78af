use thiserror::Error;
use uuid::Uuid;

/// Errors shared by the domain services.
///
/// The variants group into the categories the consumers and HTTP handlers
/// act on: not-found, conflict (retry or redeliver), malformed input (skip),
/// and infrastructure failures (propagate).
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{entity} {id} was not found")]
    NotFound { entity: &'static str, id: String },

    #[error("validation of order {0} was changed concurrently")]
    ConcurrentValidationConflict(Uuid),

    #[error("no courier is available for order {0}")]
    NoCourierAvailable(Uuid),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("{0}")]
    Validation(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("storage error: {0}")]
    Storage(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(String),
}

impl ServiceError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Conflicts are resolved by a later retry or redelivery.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::ConcurrentValidationConflict(_) | Self::NoCourierAvailable(_)
        )
    }
}

impl From<crate::publisher::PublishError> for ServiceError {
    fn from(err: crate::publisher::PublishError) -> Self {
        Self::Transport(err.to_string())
    }
}

pub type Result<T, E = ServiceError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_are_classified() {
        let order_id = Uuid::new_v4();

        assert!(ServiceError::ConcurrentValidationConflict(order_id).is_conflict());
        assert!(ServiceError::NoCourierAvailable(order_id).is_conflict());
        assert!(!ServiceError::not_found("order", order_id).is_conflict());
    }

    #[test]
    fn not_found_message_names_the_entity() {
        let err = ServiceError::not_found("courier", "42");

        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "courier 42 was not found");
    }
}
