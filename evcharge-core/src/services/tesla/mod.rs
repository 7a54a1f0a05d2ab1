//! Talk to the vehicle.
pub mod api;

use std::{fmt::Display, str::FromStr, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::datetime::duration;
use crate::location::Location;
use crate::settings::ConfigError;

/// Miles to kilometers.
pub const MILES_TO_KM: f64 = 1.609_344;

/// A vehicle ID for the owner-api endpoint.
#[derive(Copy, Clone, Serialize, Deserialize, Debug, Eq, PartialEq, Hash)]
pub struct VehicleId(u64);

impl VehicleId {
    /// Create a new vehicle ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
}

impl Display for VehicleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Is the car currently charging?
#[derive(Debug, Deserialize, Serialize, Copy, Clone, Eq, PartialEq)]
pub enum ChargingStateEnum {
    /// Charging is starting
    Starting,

    /// Charging is complete
    Complete,

    /// Charging is in progress
    Charging,

    /// Charging is not in progress and we are disconnected
    Disconnected,

    /// Charging is not in progress
    Stopped,

    /// Charger cable is connected but not getting power
    NoPower,
}

impl ChargingStateEnum {
    /// Is the car currently charging?
    #[must_use]
    pub const fn is_charging(self) -> bool {
        match self {
            ChargingStateEnum::Starting | ChargingStateEnum::Charging => true,
            ChargingStateEnum::Complete
            | ChargingStateEnum::Disconnected
            | ChargingStateEnum::Stopped
            | ChargingStateEnum::NoPower => false,
        }
    }

    /// Is the car plugged in?
    #[must_use]
    pub const fn is_plugged_in(self) -> bool {
        !matches!(self, ChargingStateEnum::Disconnected)
    }
}

/// Is the car awake?
#[derive(Debug, Deserialize, Serialize, Copy, Clone, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum VehicleState {
    /// Awake and reachable.
    Online,

    /// Sleeping, needs a wake up before most requests.
    Asleep,

    /// Not reachable.
    Offline,

    /// Anything else the API reports.
    #[serde(other)]
    Unknown,
}

impl VehicleState {
    /// Is the car awake?
    #[must_use]
    pub const fn is_online(self) -> bool {
        matches!(self, VehicleState::Online)
    }
}

/// The cheap status of a vehicle, available without waking it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleSummary {
    /// Is the car awake?
    pub state: VehicleState,

    /// Vehicle display name.
    pub display_name: Option<String>,
}

/// Charging related telemetry, in metric units.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargeData {
    /// The current charge state
    pub charging_state: ChargingStateEnum,

    /// Battery level in percent
    pub battery_level: u8,

    /// Battery range in km
    pub battery_range: f64,

    /// The current charge limit in percent
    pub charge_limit_soc: u8,

    /// Range added per hour of charging, in km
    pub charge_rate: f64,

    /// Charger current in A
    pub charger_actual_current: Option<f64>,

    /// Charger voltage in V
    pub charger_voltage: Option<f64>,

    /// Number of charger phases
    pub charger_phases: Option<f64>,

    /// The estimated time to charge in hours
    pub time_to_full_charge: f64,
}

/// Driving related telemetry, in metric units.
#[derive(Debug, Clone, PartialEq)]
pub struct DriveData {
    /// Position, if known
    pub location: Option<Location>,

    /// Speed in km/h, if moving
    pub speed: Option<f64>,
}

/// Full telemetry for a vehicle.
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleData {
    /// Charging related telemetry
    pub charge: ChargeData,

    /// Driving related telemetry
    pub drive: DriveData,

    /// Odometer in km
    pub odometer: f64,
}

/// A generic error return from the API
#[derive(Debug, Error)]
pub enum ApiError {
    /// Reqwest error
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// Json error
    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Rate limit error
    #[error("Rate limit error, retry in: {}", duration::to_string(.0))]
    RateLimit(Duration),

    /// The vehicle did not answer in time.
    #[error("Operation timed out")]
    Timeout,

    /// The token was rejected.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// The HTTP request succeeded, but the response was not successful.
    #[error("Generic tesla error: {0}")]
    Failed(String),
}

impl ApiError {
    /// Is this the distinguished timeout failure?
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, ApiError::Timeout)
    }

    /// Did the request fail to reach the vehicle, as opposed to being rejected by it?
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        !matches!(self, ApiError::Failed(_))
    }
}

/// Which trunk to open.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trunk {
    /// The front trunk
    Front,

    /// The rear trunk
    Rear,
}

impl FromStr for Trunk {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "front" => Ok(Trunk::Front),
            "rear" => Ok(Trunk::Rear),
            _ => Err(ConfigError::InvalidTrunk(s.to_string())),
        }
    }
}

/// Which preset charge limit to use.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ChargeLimitMode {
    /// The standard daily limit
    Standard,

    /// Charge for maximum range
    MaxRange,
}

impl FromStr for ChargeLimitMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(ChargeLimitMode::Standard),
            "max_range" => Ok(ChargeLimitMode::MaxRange),
            _ => Err(ConfigError::InvalidChargeLimitMode(s.to_string())),
        }
    }
}

/// An error from a validated vehicle command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// The argument was rejected before anything was sent.
    #[error("Invalid argument: {0}")]
    Config(#[from] ConfigError),

    /// The request failed.
    #[error("{0}")]
    Api(#[from] ApiError),
}

/// The operations the controller needs from a vehicle.
#[async_trait]
pub trait VehicleClient: Send + Sync {
    /// Get the cheap status of the vehicle.
    ///
    /// # Errors
    ///
    /// If the request failed.
    async fn get_state(&self, id: VehicleId) -> Result<VehicleSummary, ApiError>;

    /// Get full telemetry, waking the vehicle if needed.
    ///
    /// # Errors
    ///
    /// If the request failed.
    async fn get_full_telemetry(&self, id: VehicleId) -> Result<VehicleData, ApiError>;

    /// Request the car start charging
    ///
    /// # Errors
    ///
    /// If the request failed or was rejected.
    async fn start_charging(&self, id: VehicleId) -> Result<(), ApiError>;

    /// Request the car stop charging
    ///
    /// # Errors
    ///
    /// If the request failed or was rejected.
    async fn stop_charging(&self, id: VehicleId) -> Result<(), ApiError>;

    /// Start or stop charging.
    ///
    /// # Errors
    ///
    /// If the request failed or was rejected.
    async fn control_charging(&self, id: VehicleId, on: bool) -> Result<(), ApiError> {
        if on {
            self.start_charging(id).await
        } else {
            self.stop_charging(id).await
        }
    }
}
