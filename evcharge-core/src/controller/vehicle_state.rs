use chrono::{DateTime, Utc};

use crate::datetime::time_delta_to_hours;
use crate::location::{distance_from_home, Location};
use crate::services::tesla::{ChargingStateEnum, VehicleData, VehicleState};

/// Round to two decimals.
#[must_use]
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Charger power in W, if the charger reports all of current, voltage and phases.
#[must_use]
pub fn charger_power(current: Option<f64>, voltage: Option<f64>, phases: Option<f64>) -> Option<f64> {
    match (current, voltage, phases) {
        (Some(current), Some(voltage), Some(phases)) => Some((current * voltage * phases).round()),
        _ => None,
    }
}

/// Did the latest telemetry start or stop charging?
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargeTransition {
    /// Nothing changed.
    None,

    /// The vehicle started charging.
    Started,

    /// The vehicle stopped charging.
    Stopped,
}

/// The last known state of the vehicle, in metric units.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VehicleMirror {
    /// Is the car awake?
    pub vehicle_state: Option<VehicleState>,

    /// Charging state from the latest telemetry.
    pub charging_state: Option<ChargingStateEnum>,

    /// Charging state from the telemetry before that.
    pub previous_charging_state: Option<ChargingStateEnum>,

    /// Battery level in percent.
    pub battery_level: Option<u8>,

    /// Battery range in km.
    pub battery_range: Option<f64>,

    /// Charge limit in percent.
    pub charge_limit_soc: Option<u8>,

    /// Range added per hour of charging, in km.
    pub charge_rate: Option<f64>,

    /// Charger power in W.
    pub power: Option<f64>,

    /// Energy charged in kWh since the last reset.
    pub meter_power: f64,

    /// When `meter_power` was last brought up to date.
    pub meter_updated_at: Option<DateTime<Utc>>,

    /// Odometer in km.
    pub odometer: Option<f64>,

    /// Speed in km/h.
    pub speed: Option<f64>,

    /// Distance from home in meters, `None` if the position is unknown.
    pub distance_from_home: Option<f64>,

    /// Estimated hours until charging is complete.
    pub time_to_full_charge: Option<f64>,
}

impl VehicleMirror {
    /// Is the vehicle charging right now?
    #[must_use]
    pub fn is_charging(&self) -> bool {
        self.charging_state
            .is_some_and(ChargingStateEnum::is_charging)
    }

    fn update_meter_power(&mut self, now: DateTime<Utc>) {
        let last = self.meter_updated_at.replace(now);

        if let (Some(power), Some(last)) = (self.power, last) {
            let hours = time_delta_to_hours(now - last);
            if hours > 0.0 {
                self.meter_power += round2(power / 1000.0 * hours);
            }
        }
    }

    /// Copy in new telemetry.
    pub fn update(
        &mut self,
        data: &VehicleData,
        home: &Location,
        now: DateTime<Utc>,
    ) -> ChargeTransition {
        let charge = &data.charge;

        self.previous_charging_state = self.charging_state;
        self.charging_state = Some(charge.charging_state);
        self.battery_level = Some(charge.battery_level);
        self.battery_range = Some(charge.battery_range);
        self.charge_limit_soc = Some(charge.charge_limit_soc);
        self.charge_rate = Some(charge.charge_rate);
        self.time_to_full_charge = Some(charge.time_to_full_charge);
        self.odometer = Some(data.odometer);
        self.speed = data.drive.speed;
        self.distance_from_home = distance_from_home(data.drive.location, home);

        self.power = charger_power(
            charge.charger_actual_current,
            charge.charger_voltage,
            charge.charger_phases,
        );
        self.update_meter_power(now);

        let was_charging = self
            .previous_charging_state
            .is_some_and(ChargingStateEnum::is_charging);
        match (was_charging, charge.charging_state.is_charging()) {
            (false, true) => ChargeTransition::Started,
            (true, false) => ChargeTransition::Stopped,
            _ => ChargeTransition::None,
        }
    }
}
