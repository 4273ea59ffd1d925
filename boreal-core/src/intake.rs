use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One seat assignment requested by an intake message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeItem {
    pub seat_id: Uuid,
    pub passenger_name: String,
    pub passenger_document: String,
}

/// The unit of work carried by the intake queue. Produced by the HTTP layer
/// and consumed by the fulfillment worker; never persisted as an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakeMessage {
    pub message_id: Uuid,
    pub user_id: Uuid,
    pub flight_id: Uuid,
    pub items: Vec<IntakeItem>,
    pub submitted_at: DateTime<Utc>,
}

/// A structurally invalid message can never succeed, so the worker
/// dead-letters it without retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("intake message has a nil user id")]
    MissingUser,
    #[error("intake message has no seat assignments")]
    NoItems,
    #[error("seat assignment {index} has a nil seat id")]
    NilSeat { index: usize },
    #[error("seat assignment {index} is missing the passenger name")]
    MissingPassengerName { index: usize },
    #[error("seat assignment {index} is missing the passenger document")]
    MissingPassengerDocument { index: usize },
}

impl IntakeMessage {
    pub fn new(user_id: Uuid, flight_id: Uuid, items: Vec<IntakeItem>) -> Self {
        Self {
            message_id: Uuid::new_v4(),
            user_id,
            flight_id,
            items,
            submitted_at: Utc::now(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.user_id.is_nil() {
            return Err(ValidationError::MissingUser);
        }
        if self.items.is_empty() {
            return Err(ValidationError::NoItems);
        }
        for (index, item) in self.items.iter().enumerate() {
            if item.seat_id.is_nil() {
                return Err(ValidationError::NilSeat { index });
            }
            if item.passenger_name.trim().is_empty() {
                return Err(ValidationError::MissingPassengerName { index });
            }
            if item.passenger_document.trim().is_empty() {
                return Err(ValidationError::MissingPassengerDocument { index });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(name: &str, document: &str) -> IntakeItem {
        IntakeItem {
            seat_id: Uuid::new_v4(),
            passenger_name: name.to_string(),
            passenger_document: document.to_string(),
        }
    }

    #[test]
    fn test_valid_message() {
        let msg = IntakeMessage::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            vec![item("Ada Lovelace", "P1234567")],
        );
        assert!(msg.validate().is_ok());
    }

    #[test]
    fn test_nil_user_rejected() {
        let msg = IntakeMessage::new(Uuid::nil(), Uuid::new_v4(), vec![item("A", "D")]);
        assert_eq!(msg.validate(), Err(ValidationError::MissingUser));
    }

    #[test]
    fn test_empty_items_rejected() {
        let msg = IntakeMessage::new(Uuid::new_v4(), Uuid::new_v4(), vec![]);
        assert_eq!(msg.validate(), Err(ValidationError::NoItems));
    }

    #[test]
    fn test_blank_passenger_fields_rejected() {
        let msg = IntakeMessage::new(Uuid::new_v4(), Uuid::new_v4(), vec![item("  ", "P1")]);
        assert_eq!(
            msg.validate(),
            Err(ValidationError::MissingPassengerName { index: 0 })
        );

        let msg = IntakeMessage::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            vec![item("Ada", "P1"), item("Grace", "")],
        );
        assert_eq!(
            msg.validate(),
            Err(ValidationError::MissingPassengerDocument { index: 1 })
        );
    }

    #[test]
    fn test_nil_seat_rejected() {
        let mut bad = item("Ada", "P1");
        bad.seat_id = Uuid::nil();
        let msg = IntakeMessage::new(Uuid::new_v4(), Uuid::new_v4(), vec![bad]);
        assert_eq!(msg.validate(), Err(ValidationError::NilSeat { index: 0 }));
    }
}
