//! Where the vehicle is relative to home.
use geo::{HaversineDistance, Point};
use serde::{Deserialize, Serialize};

/// A position on the earth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Latitude in degrees.
    pub latitude: f64,

    /// Longitude in degrees.
    pub longitude: f64,
}

impl Location {
    /// Create a new location.
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Build a location if both coordinates are known.
    #[must_use]
    pub const fn from_coordinates(latitude: Option<f64>, longitude: Option<f64>) -> Option<Self> {
        match (latitude, longitude) {
            (Some(latitude), Some(longitude)) => Some(Self::new(latitude, longitude)),
            _ => None,
        }
    }

    fn point(&self) -> Point<f64> {
        Point::new(self.longitude, self.latitude)
    }

    /// Great circle distance in meters, rounded to whole meters.
    ///
    /// Distances under one meter are zero.
    #[must_use]
    pub fn distance_to(&self, other: &Location) -> f64 {
        let distance = self.point().haversine_distance(&other.point());
        if distance < 1.0 {
            0.0
        } else {
            distance.round()
        }
    }
}

/// Distance in meters from `home`, or `None` if the position is unknown.
#[must_use]
pub fn distance_from_home(position: Option<Location>, home: &Location) -> Option<f64> {
    position.map(|position| position.distance_to(home))
}
