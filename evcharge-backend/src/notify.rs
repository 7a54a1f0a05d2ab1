use evcharge_core::{controller::ChargeEvent, spawn};
use tokio::sync::mpsc;
use tracing::{info, warn};

fn battery(level: Option<u8>) -> String {
    level.map_or_else(|| "unknown".to_string(), |level| format!("{level}%"))
}

/// Turn an event into a message for the user, if it deserves one.
pub fn message(name: &str, event: &ChargeEvent) -> Option<String> {
    match event {
        ChargeEvent::ChargingStarted { battery_level } => Some(format!(
            "{name} started charging at {}",
            battery(*battery_level)
        )),
        ChargeEvent::ChargingStopped {
            battery_level,
            meter_power,
            complete: true,
        } => Some(format!(
            "{name} finished charging at {}, charged {meter_power} kWh",
            battery(*battery_level)
        )),
        ChargeEvent::ChargingStopped {
            battery_level,
            meter_power,
            complete: false,
        } => Some(format!(
            "{name} paused charging at {}, charged {meter_power} kWh so far",
            battery(*battery_level)
        )),
        ChargeEvent::PlanCreated { text, .. } => Some(format!("{name} charge plan\n{text}")),
        ChargeEvent::ModeChanged { from, to } => {
            Some(format!("{name} charging mode changed from {from} to {to}"))
        }
        ChargeEvent::Unavailable { reason } => Some(format!("{name} is unavailable: {reason}")),
        ChargeEvent::Available => Some(format!("{name} is available again")),
        ChargeEvent::PlanCleared | ChargeEvent::VehicleStateChanged { .. } => None,
    }
}

/// Log the messages for every event from one vehicle.
pub fn run(name: String, mut rx: mpsc::UnboundedReceiver<ChargeEvent>) {
    spawn(async move {
        while let Some(event) = rx.recv().await {
            match message(&name, &event) {
                Some(text) if matches!(event, ChargeEvent::Unavailable { .. }) => warn!("{text}"),
                Some(text) => info!("{text}"),
                None => info!(name, ?event, "Event"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use evcharge_core::controller::ChargingMode;
    use rstest::rstest;

    #[rstest]
    #[case(
        ChargeEvent::ChargingStarted { battery_level: Some(67) },
        Some("Car started charging at 67%")
    )]
    #[case(
        ChargeEvent::ChargingStopped { battery_level: Some(90), meter_power: 7.36, complete: true },
        Some("Car finished charging at 90%, charged 7.36 kWh")
    )]
    #[case(
        ChargeEvent::ChargingStopped { battery_level: None, meter_power: 1.5, complete: false },
        Some("Car paused charging at unknown, charged 1.5 kWh so far")
    )]
    #[case(
        ChargeEvent::ModeChanged { from: ChargingMode::ChargeNow, to: ChargingMode::Off },
        Some("Car charging mode changed from charge_now to off")
    )]
    #[case(ChargeEvent::PlanCleared, None)]
    fn test_message(#[case] event: ChargeEvent, #[case] expected: Option<&str>) {
        assert_eq!(message("Car", &event).as_deref(), expected);
    }
}
