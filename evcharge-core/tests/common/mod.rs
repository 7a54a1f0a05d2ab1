#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use std::{collections::VecDeque, sync::Mutex};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::{Europe::Oslo, Tz};
use evcharge_core::{
    charge_plan::ChargeConfig,
    controller::{ChargeEvent, EventSink},
    datetime::parse_time_of_day,
    location::Location,
    prices::{PriceError, PriceFeed, PricePoint, PriceSeries},
    services::tesla::{
        ApiError, ChargeData, ChargingStateEnum, DriveData, VehicleClient, VehicleData, VehicleId,
        VehicleState, VehicleSummary,
    },
    settings::ChargeSettings,
};

pub const TIMEZONE: Tz = Oslo;

pub const HOME: Location = Location::new(59.9139, 10.7522);

pub fn dt(s: impl Into<String>) -> DateTime<Utc> {
    s.into().parse().unwrap()
}

const DAY_1: [f64; 24] = [
    0.3579, 0.35732, 0.35646, 0.35646, 0.35414, 0.35385, 0.38241, 0.40702, 0.40683, 0.39081,
    0.38019, 0.37334, 0.37228, 0.37286, 0.36447, 0.36427, 0.36205, 0.36456, 0.37662, 0.38183,
    0.38048, 0.37933, 0.37547, 0.36562,
];

const DAY_2: [f64; 24] = [
    0.3583, 0.35965, 0.35927, 0.35927, 0.35609, 0.37055, 0.39697, 0.43197, 0.46707, 0.44807,
    0.44508, 0.42985, 0.40883, 0.40237, 0.39311, 0.39032, 0.39273, 0.3961, 0.39784, 0.39909,
    0.39427, 0.38926, 0.38318, 0.3718,
];

fn day<'a>(date: &str, prices: &'a [f64]) -> impl Iterator<Item = PricePoint> + 'a {
    let date = date.to_string();
    prices
        .iter()
        .enumerate()
        .map(move |(hour, price)| PricePoint::new(dt(format!("{date}T{hour:02}:00:00+02:00")), *price))
}

/// Hourly prices for 2019-04-02 only.
pub fn day_1_prices() -> PriceSeries {
    day("2019-04-02", &DAY_1).collect()
}

/// Hourly prices for 2019-04-02 and 2019-04-03.
pub fn scenario_a_prices() -> PriceSeries {
    day("2019-04-02", &DAY_1)
        .chain(day("2019-04-03", &DAY_2))
        .collect()
}

pub fn scenario_a_config() -> ChargeConfig {
    ChargeConfig {
        charge_start: parse_time_of_day("22:00").unwrap(),
        charge_end: parse_time_of_day("06:30").unwrap(),
        charge_km_per_hour: 28.0,
        battery_level: 67.0,
        battery_range: 332.0,
        charge_limit_soc: Some(90.0),
        charge_max_hours: None,
    }
}

pub fn charge_settings() -> ChargeSettings {
    ChargeSettings {
        charge_start: parse_time_of_day("22:00").unwrap(),
        charge_end: parse_time_of_day("06:30").unwrap(),
        charge_max_hours: None,
        charge_km_per_hour: 28.0,
        location_accuracy_m: 250.0,
        data_fetch_interval_minutes: 60,
        price_area: "NO1".into(),
        currency: "NOK".into(),
    }
}

pub const VEHICLE_ID: VehicleId = VehicleId::new(1234);

/// Telemetry for a car parked at home, plugged in but not charging.
pub fn vehicle_data() -> VehicleData {
    VehicleData {
        charge: ChargeData {
            charging_state: ChargingStateEnum::Stopped,
            battery_level: 67,
            battery_range: 332.0,
            charge_limit_soc: 90,
            charge_rate: 0.0,
            charger_actual_current: None,
            charger_voltage: None,
            charger_phases: None,
            time_to_full_charge: 0.0,
        },
        drive: DriveData {
            location: Some(HOME),
            speed: None,
        },
        odometer: 10_000.0,
    }
}

#[derive(Debug)]
struct FakeVehicleState {
    state: VehicleState,
    data: VehicleData,
    failures: VecDeque<ApiError>,
    command_failures: VecDeque<ApiError>,
    commands: Vec<bool>,
    full_fetches: usize,
}

/// A vehicle that reports whatever the test tells it to.
#[derive(Debug)]
pub struct FakeVehicle {
    inner: Mutex<FakeVehicleState>,
}

impl FakeVehicle {
    pub fn new(data: VehicleData) -> Self {
        Self {
            inner: Mutex::new(FakeVehicleState {
                state: VehicleState::Online,
                data,
                failures: VecDeque::new(),
                command_failures: VecDeque::new(),
                commands: vec![],
                full_fetches: 0,
            }),
        }
    }

    pub fn update(&self, f: impl FnOnce(&mut VehicleData)) {
        f(&mut self.inner.lock().unwrap().data);
    }

    pub fn set_charging_state(&self, state: ChargingStateEnum) {
        self.update(|data| data.charge.charging_state = state);
    }

    /// Charge at 16 A, 230 V, 3 phases, which is 11.04 kW.
    pub fn start_drawing_power(&self) {
        self.update(|data| {
            data.charge.charging_state = ChargingStateEnum::Charging;
            data.charge.charger_actual_current = Some(16.0);
            data.charge.charger_voltage = Some(230.0);
            data.charge.charger_phases = Some(3.0);
        });
    }

    pub fn stop_drawing_power(&self, state: ChargingStateEnum) {
        self.update(|data| {
            data.charge.charging_state = state;
            data.charge.charger_actual_current = None;
        });
    }

    pub fn fail_next(&self, error: ApiError) {
        self.inner.lock().unwrap().failures.push_back(error);
    }

    pub fn fail_next_command(&self, error: ApiError) {
        self.inner.lock().unwrap().command_failures.push_back(error);
    }

    pub fn commands(&self) -> Vec<bool> {
        self.inner.lock().unwrap().commands.clone()
    }

    pub fn full_fetches(&self) -> usize {
        self.inner.lock().unwrap().full_fetches
    }

    fn command(&self, on: bool) -> Result<(), ApiError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(error) = inner.command_failures.pop_front() {
            return Err(error);
        }
        inner.commands.push(on);
        Ok(())
    }
}

#[async_trait]
impl VehicleClient for FakeVehicle {
    async fn get_state(&self, _id: VehicleId) -> Result<VehicleSummary, ApiError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(error) = inner.failures.pop_front() {
            return Err(error);
        }
        Ok(VehicleSummary {
            state: inner.state,
            display_name: Some("Test car".into()),
        })
    }

    async fn get_full_telemetry(&self, _id: VehicleId) -> Result<VehicleData, ApiError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(error) = inner.failures.pop_front() {
            return Err(error);
        }
        inner.full_fetches += 1;
        Ok(inner.data.clone())
    }

    async fn start_charging(&self, _id: VehicleId) -> Result<(), ApiError> {
        self.command(true)
    }

    async fn stop_charging(&self, _id: VehicleId) -> Result<(), ApiError> {
        self.command(false)
    }
}

/// A price feed serving a fixed series, one local day at a time.
#[derive(Debug)]
pub struct FakePrices {
    prices: PriceSeries,
    requests: Mutex<Vec<NaiveDate>>,
}

impl FakePrices {
    pub fn new(prices: PriceSeries) -> Self {
        Self {
            prices,
            requests: Mutex::new(vec![]),
        }
    }

    pub fn requests(&self) -> Vec<NaiveDate> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl PriceFeed for FakePrices {
    async fn get_hourly_prices(
        &self,
        date: NaiveDate,
        _area: &str,
        _currency: &str,
    ) -> Result<Vec<PricePoint>, PriceError> {
        self.requests.lock().unwrap().push(date);
        Ok(self
            .prices
            .points()
            .iter()
            .filter(|p| p.starts_at.with_timezone(&TIMEZONE).date_naive() == date)
            .copied()
            .collect())
    }
}

/// Keeps every event for later inspection.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ChargeEvent>>,
}

impl RecordingSink {
    /// Remove and return the events so far.
    pub fn take(&self) -> Vec<ChargeEvent> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

impl EventSink for RecordingSink {
    fn emit(&self, event: ChargeEvent) {
        self.events.lock().unwrap().push(event);
    }
}
