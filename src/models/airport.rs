//! Offline airport dataset row.

use serde::{Deserialize, Serialize};

use super::GeoPoint;

/// Size class from the OurAirports `type` column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AirportSize {
    LargeAirport,
    MediumAirport,
    SmallAirport,
    Other,
}

impl AirportSize {
    pub fn parse(value: &str) -> Self {
        match value.trim() {
            "large_airport" => AirportSize::LargeAirport,
            "medium_airport" => AirportSize::MediumAirport,
            "small_airport" => AirportSize::SmallAirport,
            _ => AirportSize::Other,
        }
    }

    pub fn is_international_class(&self) -> bool {
        matches!(self, AirportSize::LargeAirport | AirportSize::MediumAirport)
    }
}

/// Read-only airport candidate shared by every airport-matching call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AirportCandidate {
    pub name: String,
    pub iata: Option<String>,
    pub icao: Option<String>,
    pub lat: f64,
    pub lon: f64,
    pub size: AirportSize,
    pub scheduled_service: bool,
}

impl AirportCandidate {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.lat, self.lon)
    }

    /// Scheduled passenger service at a large or medium airport
    pub fn is_eligible(&self) -> bool {
        self.scheduled_service && self.size.is_international_class()
    }
}
