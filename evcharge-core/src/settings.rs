//! User settings for one vehicle.
use std::sync::Mutex;

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use crate::datetime::{parse_time_of_day, with_time_of_day};
use crate::services::persistent_state::{self, PersistentStateRow};

/// Smallest accepted location accuracy in meters.
pub const MIN_LOCATION_ACCURACY: f64 = 10.0;

/// Largest accepted location accuracy in meters, also used for invalid values.
pub const MAX_LOCATION_ACCURACY: f64 = 250.0;

/// Largest accepted data fetch interval in minutes.
pub const MAX_DATA_FETCH_INTERVAL: u32 = 1440;

/// A value supplied at a command boundary was rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Data fetch interval must be within 1..=1440 minutes.
    #[error("Invalid data fetch interval: {0} minutes")]
    InvalidFetchInterval(u32),

    /// Charge limit must be within 1..=100 percent.
    #[error("Invalid charge limit: {0}%")]
    InvalidChargeLimit(u8),

    /// Trunk must be front or rear.
    #[error("Invalid trunk: {0}")]
    InvalidTrunk(String),

    /// Charge limit mode must be standard or max_range.
    #[error("Invalid charge limit mode: {0}")]
    InvalidChargeLimitMode(String),

    /// Time of day must be `HH` or `HH:MM`.
    #[error("Invalid time of day: {0}")]
    InvalidTimeOfDay(String),

    /// Unknown charging mode.
    #[error("Invalid charging mode: {0}")]
    InvalidChargingMode(String),
}

/// Parse a time of day given as `HH` or `HH:MM`.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidTimeOfDay`] if the value cannot be parsed.
pub fn time_of_day(value: &str) -> Result<NaiveTime, ConfigError> {
    parse_time_of_day(value).map_err(|_| ConfigError::InvalidTimeOfDay(value.to_string()))
}

/// Check a data fetch interval.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidFetchInterval`] if outside 1..=1440 minutes.
pub fn validate_data_fetch_interval(minutes: u32) -> Result<u32, ConfigError> {
    if (1..=MAX_DATA_FETCH_INTERVAL).contains(&minutes) {
        Ok(minutes)
    } else {
        Err(ConfigError::InvalidFetchInterval(minutes))
    }
}

/// The location accuracy to use, in meters.
///
/// Values outside 10..=250 fall back to 250.
#[must_use]
pub fn location_accuracy(meters: f64) -> f64 {
    if (MIN_LOCATION_ACCURACY..=MAX_LOCATION_ACCURACY).contains(&meters) {
        meters
    } else {
        MAX_LOCATION_ACCURACY
    }
}

const fn default_location_accuracy() -> f64 {
    MAX_LOCATION_ACCURACY
}

const fn default_data_fetch_interval() -> u32 {
    60
}

fn default_price_area() -> String {
    "NO1".into()
}

fn default_currency() -> String {
    "NOK".into()
}

/// Settings that control charging of one vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeSettings {
    /// Start of the charge window, local time.
    #[serde(with = "with_time_of_day")]
    pub charge_start: NaiveTime,

    /// End of the charge window, local time.
    #[serde(with = "with_time_of_day")]
    pub charge_end: NaiveTime,

    /// Never plan more hours than this.
    #[serde(default)]
    pub charge_max_hours: Option<f64>,

    /// Range added per hour of charging, in km.
    pub charge_km_per_hour: f64,

    /// How far from home the vehicle may be and still count as home, in meters.
    #[serde(default = "default_location_accuracy")]
    pub location_accuracy_m: f64,

    /// Fetch full telemetry at least this often, in minutes.
    #[serde(default = "default_data_fetch_interval")]
    pub data_fetch_interval_minutes: u32,

    /// Day-ahead price delivery area.
    #[serde(default = "default_price_area")]
    pub price_area: String,

    /// Price currency.
    #[serde(default = "default_currency")]
    pub currency: String,
}

impl ChargeSettings {
    /// The location accuracy to use, in meters.
    #[must_use]
    pub fn location_accuracy(&self) -> f64 {
        location_accuracy(self.location_accuracy_m)
    }

    /// The data fetch interval to use.
    ///
    /// Invalid stored values fall back to the default.
    #[must_use]
    pub fn data_fetch_interval(&self) -> chrono::TimeDelta {
        let minutes = validate_data_fetch_interval(self.data_fetch_interval_minutes)
            .unwrap_or_else(|_| default_data_fetch_interval());
        chrono::TimeDelta::minutes(i64::from(minutes))
    }
}

/// Where the controller reads and writes its settings.
pub trait SettingsStore: Send + Sync {
    /// Current settings.
    fn load(&self) -> ChargeSettings;

    /// Replace the settings.
    ///
    /// # Errors
    ///
    /// If the settings could not be stored.
    fn save(&self, settings: &ChargeSettings) -> Result<(), persistent_state::Error>;
}

/// Settings kept in memory only.
#[derive(Debug)]
pub struct InMemorySettings {
    settings: Mutex<ChargeSettings>,
}

impl InMemorySettings {
    /// Create a store holding `settings`.
    #[must_use]
    pub const fn new(settings: ChargeSettings) -> Self {
        Self {
            settings: Mutex::new(settings),
        }
    }
}

impl SettingsStore for InMemorySettings {
    fn load(&self) -> ChargeSettings {
        match self.settings.lock() {
            Ok(settings) => settings.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn save(&self, settings: &ChargeSettings) -> Result<(), persistent_state::Error> {
        match self.settings.lock() {
            Ok(mut current) => *current = settings.clone(),
            Err(poisoned) => *poisoned.into_inner() = settings.clone(),
        }
        Ok(())
    }
}

/// Settings saved to a JSON file, starting from configured defaults.
#[derive(Debug)]
pub struct PersistentSettings {
    row: PersistentStateRow<ChargeSettings>,
    cache: InMemorySettings,
}

impl PersistentSettings {
    /// Load the stored settings, or use `defaults` if there are none.
    #[must_use]
    pub fn new(row: PersistentStateRow<ChargeSettings>, defaults: ChargeSettings) -> Self {
        let settings = row.load().unwrap_or_else(|err| {
            tracing::info!("Using default settings: {err}");
            defaults
        });
        Self {
            row,
            cache: InMemorySettings::new(settings),
        }
    }
}

impl SettingsStore for PersistentSettings {
    fn load(&self) -> ChargeSettings {
        self.cache.load()
    }

    fn save(&self, settings: &ChargeSettings) -> Result<(), persistent_state::Error> {
        self.row.save(settings).map_err(|err| {
            error!("Failed to save settings: {err}");
            err
        })?;
        self.cache.save(settings)
    }
}
