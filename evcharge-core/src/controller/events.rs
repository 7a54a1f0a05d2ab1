use tokio::sync::mpsc;
use tracing::debug;

use super::ChargingMode;
use crate::services::tesla::VehicleState;

/// Something the host may want to notify the user about.
#[derive(Debug, Clone, PartialEq)]
pub enum ChargeEvent {
    /// The vehicle started charging.
    ChargingStarted {
        /// Battery level in percent.
        battery_level: Option<u8>,
    },

    /// The vehicle stopped charging.
    ChargingStopped {
        /// Battery level in percent.
        battery_level: Option<u8>,

        /// Energy charged under the current plan, in kWh.
        meter_power: f64,

        /// Did charging stop because it was finished?
        complete: bool,
    },

    /// A new charge plan was made.
    PlanCreated {
        /// Human readable summary of the plan.
        text: String,

        /// Distance the plan will add, in km.
        planned_km: f64,
    },

    /// The charge plan was thrown away.
    PlanCleared,

    /// The charging mode changed.
    ModeChanged {
        /// Previous mode.
        from: ChargingMode,

        /// New mode.
        to: ChargingMode,
    },

    /// The vehicle woke up or went to sleep.
    VehicleStateChanged {
        /// New state.
        state: VehicleState,
    },

    /// The vehicle API keeps failing.
    Unavailable {
        /// The last error.
        reason: String,
    },

    /// The vehicle API works again.
    Available,
}

/// Where the controller sends its events.
pub trait EventSink: Send + Sync {
    /// Deliver an event.
    fn emit(&self, event: ChargeEvent);
}

impl EventSink for mpsc::UnboundedSender<ChargeEvent> {
    fn emit(&self, event: ChargeEvent) {
        if let Err(err) = self.send(event) {
            debug!("Nobody is listening for events: {err}");
        }
    }
}
