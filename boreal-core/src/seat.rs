use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Seat inventory status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SeatStatus {
    Available,
    Reserved,
    Occupied,
}

impl SeatStatus {
    /// Legal moves: AVAILABLE -> RESERVED (booking), RESERVED -> OCCUPIED
    /// (payment) and RESERVED -> AVAILABLE (cancellation or rollback).
    pub fn can_transition(self, to: SeatStatus) -> bool {
        matches!(
            (self, to),
            (SeatStatus::Available, SeatStatus::Reserved)
                | (SeatStatus::Reserved, SeatStatus::Occupied)
                | (SeatStatus::Reserved, SeatStatus::Available)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SeatStatus::Available => "AVAILABLE",
            SeatStatus::Reserved => "RESERVED",
            SeatStatus::Occupied => "OCCUPIED",
        }
    }
}

impl fmt::Display for SeatStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SeatStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AVAILABLE" => Ok(SeatStatus::Available),
            "RESERVED" => Ok(SeatStatus::Reserved),
            "OCCUPIED" => Ok(SeatStatus::Occupied),
            other => Err(format!("unknown seat status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CabinClass {
    Economy,
    Business,
    First,
}

impl CabinClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            CabinClass::Economy => "ECONOMY",
            CabinClass::Business => "BUSINESS",
            CabinClass::First => "FIRST",
        }
    }
}

impl fmt::Display for CabinClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CabinClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ECONOMY" => Ok(CabinClass::Economy),
            "BUSINESS" => Ok(CabinClass::Business),
            "FIRST" => Ok(CabinClass::First),
            other => Err(format!("unknown cabin class: {}", other)),
        }
    }
}

/// One sellable inventory unit on one flight. Prices are integer minor
/// units. A seat is RESERVED or OCCUPIED for at most one live order at a
/// time; the fulfillment pipeline enforces that by writing the RESERVED
/// transition only while holding the seat's lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Seat {
    pub id: Uuid,
    pub flight_id: Uuid,
    pub seat_number: String,
    pub cabin_class: CabinClass,
    pub price_cents: i64,
    pub status: SeatStatus,
}

impl Seat {
    pub fn new(flight_id: Uuid, seat_number: &str, cabin_class: CabinClass, price_cents: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            flight_id,
            seat_number: seat_number.to_string(),
            cabin_class,
            price_cents,
            status: SeatStatus::Available,
        }
    }
}
