//! Poll a vehicle and turn charging on and off.
mod events;
mod vehicle_state;

pub use events::{ChargeEvent, EventSink};
pub use vehicle_state::{charger_power, round2, ChargeTransition, VehicleMirror};

use std::{fmt::Display, str::FromStr, sync::Arc, time::Duration};

use chrono::{DateTime, NaiveTime, TimeDelta, Utc};
use chrono_tz::Tz;
use opentelemetry::{global, metrics::Counter, KeyValue};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{
    select,
    sync::mpsc,
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::{debug, error, info};

use crate::{
    api_errors::{ApiErrorPolicy, ErrorOutcome},
    charge_plan::{ChargeConfig, ChargePlan, ChargePlanner, ChargeWindow, PlanLabels},
    datetime::start_of_hour,
    location::Location,
    prices::{PriceFeed, PriceSeries},
    services::{
        persistent_state::{self, PersistentStateRow},
        tesla::{ApiError, ChargingStateEnum, VehicleClient, VehicleId},
    },
    settings::{
        time_of_day, validate_data_fetch_interval, ChargeSettings, ConfigError, SettingsStore,
    },
    spawn, unsafe_time_delta,
};

/// How often to poll the vehicle.
pub const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Always fetch full telemetry this close to the charge window.
const WINDOW_FETCH_PADDING: TimeDelta = unsafe_time_delta!(minutes: 10);

/// Keep a finished plan around this long after it ends.
const PLAN_EXPIRY: TimeDelta = unsafe_time_delta!(hours: 2);

/// Write the observed charge rate back at most this often.
const CHARGE_RATE_UPDATE_INTERVAL: TimeDelta = unsafe_time_delta!(hours: 24);

/// How the controller decides when to charge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChargingMode {
    /// Leave charging alone.
    #[default]
    Off,

    /// Charge in the cheapest hours of the charge window.
    Automatic,

    /// Charge whenever inside the charge window.
    ManualStd,

    /// Charge straight away.
    ChargeNow,
}

impl ChargingMode {
    const fn as_str(self) -> &'static str {
        match self {
            ChargingMode::Off => "off",
            ChargingMode::Automatic => "automatic",
            ChargingMode::ManualStd => "manual_std",
            ChargingMode::ChargeNow => "charge_now",
        }
    }
}

impl Display for ChargingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChargingMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(ChargingMode::Off),
            "automatic" => Ok(ChargingMode::Automatic),
            "manual_std" => Ok(ChargingMode::ManualStd),
            "charge_now" => Ok(ChargingMode::ChargeNow),
            _ => Err(ConfigError::InvalidChargingMode(s.to_string())),
        }
    }
}

/// Fixed settings for one controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Name used in logs.
    pub name: String,

    /// The vehicle to control.
    pub vehicle_id: VehicleId,

    /// Local timezone of the charge window and prices.
    pub timezone: Tz,

    /// Where the vehicle charges.
    pub home: Location,

    /// Labels for the plan summary.
    pub labels: PlanLabels,

    /// Mode to use if none was saved.
    pub initial_mode: ChargingMode,
}

/// State that survives a restart.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerState {
    /// Charging mode.
    pub mode: ChargingMode,

    /// Energy charged in kWh since the last reset.
    pub meter_power: f64,

    /// When the observed charge rate was last written to the settings.
    pub last_charge_rate_update: Option<DateTime<Utc>>,
}

/// What one poll did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Skipped, the vehicle API is cooling down.
    CoolingDown,

    /// The vehicle could not be reached.
    FetchFailed,

    /// Not plugged in at home, or nothing to charge.
    NotControllable,

    /// Nothing to do.
    Idle,

    /// Sent a start (`true`) or stop (`false`) command.
    Commanded(bool),

    /// A start (`true`) or stop (`false`) command failed.
    CommandFailed(bool),
}

/// Something went wrong changing the controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// The value was rejected.
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// The settings could not be saved.
    #[error("{0}")]
    PersistentState(#[from] persistent_state::Error),

    /// The controller is no longer running.
    #[error("Controller has stopped")]
    Closed,
}

/// A request to the running controller.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerCommand {
    /// Change the charging mode.
    SetMode(ChargingMode),

    /// Change the charge window.
    SetChargeWindow {
        /// Start of the window, local time.
        start: NaiveTime,
        /// End of the window, local time.
        end: NaiveTime,
        /// Never plan more hours than this.
        max_hours: Option<f64>,
    },

    /// Change the full telemetry interval, in minutes.
    SetDataFetchInterval(u32),

    /// Change where prices come from.
    SetPriceArea {
        /// Delivery area.
        area: String,
        /// Currency.
        currency: String,
    },

    /// Set the energy counter to zero.
    ResetMeterPower,

    /// Stop the controller.
    Shutdown,
}

#[derive(Debug)]
struct Meters {
    commands: Counter<u64>,
    plans_created: Counter<u64>,
}

impl Meters {
    fn new() -> Self {
        let meter = global::meter("evcharge::controller");
        Self {
            commands: meter.u64_counter("charge_commands").init(),
            plans_created: meter.u64_counter("plans_created").init(),
        }
    }
}

/// Keeps one vehicle charging in the cheap hours.
pub struct ChargeController {
    config: ControllerConfig,
    vehicle: Arc<dyn VehicleClient>,
    price_feed: Arc<dyn PriceFeed>,
    settings: Arc<dyn SettingsStore>,
    events: Arc<dyn EventSink>,
    psr: Option<PersistentStateRow<ControllerState>>,
    mode: ChargingMode,
    turn_off_charging: bool,
    plan: Option<ChargePlan>,
    prices: Option<PriceSeries>,
    prices_fetched_at: Option<DateTime<Utc>>,
    last_full_fetch: Option<DateTime<Utc>>,
    last_charge_rate_update: Option<DateTime<Utc>>,
    mirror: VehicleMirror,
    errors: ApiErrorPolicy,
    meters: Meters,
}

impl ChargeController {
    /// Create a controller.
    #[must_use]
    pub fn new(
        config: ControllerConfig,
        vehicle: Arc<dyn VehicleClient>,
        price_feed: Arc<dyn PriceFeed>,
        settings: Arc<dyn SettingsStore>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let mode = config.initial_mode;
        Self {
            config,
            vehicle,
            price_feed,
            settings,
            events,
            psr: None,
            mode,
            turn_off_charging: false,
            plan: None,
            prices: None,
            prices_fetched_at: None,
            last_full_fetch: None,
            last_charge_rate_update: None,
            mirror: VehicleMirror::default(),
            errors: ApiErrorPolicy::new(),
            meters: Meters::new(),
        }
    }

    /// Restore and keep saving state in `psr`.
    #[must_use]
    pub fn with_persistent_state(mut self, psr: PersistentStateRow<ControllerState>) -> Self {
        match psr.load() {
            Ok(ps) => {
                info!(name = self.config.name, ?ps, "Loaded persistent state");
                self.mode = ps.mode;
                self.mirror.meter_power = ps.meter_power;
                self.last_charge_rate_update = ps.last_charge_rate_update;
            }
            Err(err) => {
                info!(name = self.config.name, "No persistent state: {err}");
            }
        }
        self.psr = Some(psr);
        self
    }

    /// The current charging mode.
    #[must_use]
    pub const fn mode(&self) -> ChargingMode {
        self.mode
    }

    /// The current plan, if any.
    #[must_use]
    pub const fn plan(&self) -> Option<&ChargePlan> {
        self.plan.as_ref()
    }

    /// The last known state of the vehicle.
    #[must_use]
    pub const fn mirror(&self) -> &VehicleMirror {
        &self.mirror
    }

    /// The last fetched prices.
    #[must_use]
    pub const fn prices(&self) -> Option<&PriceSeries> {
        self.prices.as_ref()
    }

    /// Is the vehicle API working?
    #[must_use]
    pub const fn is_available(&self) -> bool {
        self.errors.is_available()
    }

    /// When polling resumes, if cooling down.
    #[must_use]
    pub const fn cooldown_until(&self) -> Option<DateTime<Utc>> {
        self.errors.cooldown_until()
    }

    fn emit(&self, event: ChargeEvent) {
        debug!(name = self.config.name, ?event, "Event");
        self.events.emit(event);
    }

    fn save_state(&self) {
        let Some(psr) = &self.psr else {
            return;
        };
        let ps = ControllerState {
            mode: self.mode,
            meter_power: self.mirror.meter_power,
            last_charge_rate_update: self.last_charge_rate_update,
        };
        psr.save(&ps).unwrap_or_else(|e| {
            error!(name = self.config.name, "Failed to save persistent state: {:?}", e);
        });
    }

    fn clear_plan(&mut self) {
        if self.plan.take().is_some() {
            info!(name = self.config.name, "Charge plan cleared");
            self.emit(ChargeEvent::PlanCleared);
        }
    }

    fn change_mode(&mut self, mode: ChargingMode) {
        let from = self.mode;
        self.mode = mode;
        info!(name = self.config.name, %from, to = %mode, "Charging mode changed");
        self.emit(ChargeEvent::ModeChanged { from, to: mode });
        self.save_state();
    }

    /// Change the charging mode.
    ///
    /// Returns true if the vehicle should be polled straight away.
    pub fn set_mode(&mut self, mode: ChargingMode) -> bool {
        if mode == self.mode {
            return false;
        }

        let from = self.mode;
        self.turn_off_charging = from == ChargingMode::ChargeNow && mode == ChargingMode::Off;
        self.change_mode(mode);
        self.clear_plan();

        let charge_now = from == ChargingMode::ChargeNow || mode == ChargingMode::ChargeNow;
        if charge_now {
            self.last_full_fetch = None;
        }
        charge_now
    }

    /// Change the charge window.
    ///
    /// # Errors
    ///
    /// If the settings could not be saved.
    pub fn set_charge_window(
        &mut self,
        start: NaiveTime,
        end: NaiveTime,
        max_hours: Option<f64>,
    ) -> Result<(), ControllerError> {
        let mut settings = self.settings.load();
        settings.charge_start = start;
        settings.charge_end = end;
        settings.charge_max_hours = max_hours;
        self.settings.save(&settings)?;
        self.clear_plan();
        Ok(())
    }

    /// Change how often full telemetry is fetched.
    ///
    /// # Errors
    ///
    /// If `minutes` is outside 1..=1440 or the settings could not be saved.
    pub fn set_data_fetch_interval(&mut self, minutes: u32) -> Result<(), ControllerError> {
        let minutes = validate_data_fetch_interval(minutes)?;
        let mut settings = self.settings.load();
        settings.data_fetch_interval_minutes = minutes;
        self.settings.save(&settings)?;
        Ok(())
    }

    /// Change where prices come from. Prices are fetched again.
    ///
    /// # Errors
    ///
    /// If the settings could not be saved.
    pub fn set_price_area(&mut self, area: String, currency: String) -> Result<(), ControllerError> {
        let mut settings = self.settings.load();
        settings.price_area = area;
        settings.currency = currency;
        self.settings.save(&settings)?;
        self.prices = None;
        self.prices_fetched_at = None;
        self.clear_plan();
        Ok(())
    }

    /// Set the energy counter to zero.
    pub fn reset_meter_power(&mut self) {
        self.mirror.meter_power = 0.0;
        self.save_state();
    }

    /// Apply a command. Returns true if the vehicle should be polled straight away.
    pub fn handle_command(&mut self, command: ControllerCommand) -> bool {
        let result = match command {
            ControllerCommand::SetMode(mode) => return self.set_mode(mode),
            ControllerCommand::SetChargeWindow {
                start,
                end,
                max_hours,
            } => self.set_charge_window(start, end, max_hours),
            ControllerCommand::SetDataFetchInterval(minutes) => {
                self.set_data_fetch_interval(minutes)
            }
            ControllerCommand::SetPriceArea { area, currency } => {
                self.set_price_area(area, currency)
            }
            ControllerCommand::ResetMeterPower => {
                self.reset_meter_power();
                Ok(())
            }
            ControllerCommand::Shutdown => Ok(()),
        };

        if let Err(err) = result {
            error!(name = self.config.name, "Command failed: {err}");
        }
        false
    }

    fn record_api_error(&mut self, err: &ApiError, now: DateTime<Utc>) {
        if let ErrorOutcome::CooldownStarted(until) = self.errors.record_failure(err, now) {
            info!(name = self.config.name, %until, "Vehicle unavailable");
            self.emit(ChargeEvent::Unavailable {
                reason: err.to_string(),
            });
        }
    }

    fn record_api_success(&mut self) {
        if self.errors.record_success() {
            self.emit(ChargeEvent::Available);
        }
    }

    /// Poll the vehicle once and act on the result.
    #[tracing::instrument(skip(self), fields(name = %self.config.name))]
    pub async fn poll(&mut self, now: DateTime<Utc>) -> PollOutcome {
        if !self.errors.poll_allowed(now) {
            debug!("Cooling down, not polling");
            return PollOutcome::CoolingDown;
        }

        let settings = self.settings.load();

        if let Err(err) = self.track_state(now, &settings).await {
            error!("Failed to get vehicle state: {err}");
            self.record_api_error(&err, now);
            return PollOutcome::FetchFailed;
        }

        if !self.can_handle_charging(&settings) {
            return PollOutcome::NotControllable;
        }

        match self.mode {
            ChargingMode::Automatic => {
                self.refresh_prices(now, &settings).await;
                self.handle_automatic(now, &settings).await
            }
            ChargingMode::ManualStd => self.handle_manual(now, &settings).await,
            ChargingMode::ChargeNow => self.handle_charge_now(now).await,
            ChargingMode::Off => self.handle_off(now).await,
        }
    }

    fn needs_full_fetch(&self, now: DateTime<Utc>, settings: &ChargeSettings) -> bool {
        let Some(last) = self.last_full_fetch else {
            return true;
        };

        now - last >= settings.data_fetch_interval()
            || self.mirror.charging_state != Some(ChargingStateEnum::Disconnected)
            || self
                .plan
                .as_ref()
                .is_some_and(|plan| plan.window().contains_padded(now, WINDOW_FETCH_PADDING))
    }

    async fn track_state(
        &mut self,
        now: DateTime<Utc>,
        settings: &ChargeSettings,
    ) -> Result<(), ApiError> {
        let id = self.config.vehicle_id;

        let summary = self.vehicle.get_state(id).await?;
        self.record_api_success();
        if self.mirror.vehicle_state != Some(summary.state) {
            self.mirror.vehicle_state = Some(summary.state);
            self.emit(ChargeEvent::VehicleStateChanged {
                state: summary.state,
            });
        }

        if !self.needs_full_fetch(now, settings) {
            return Ok(());
        }

        let data = self.vehicle.get_full_telemetry(id).await?;
        let transition = self.mirror.update(&data, &self.config.home, now);
        self.last_full_fetch = Some(now);

        self.update_charge_rate(now, settings);
        match transition {
            ChargeTransition::Started => {
                info!(battery_level = ?self.mirror.battery_level, "Charging started");
                self.emit(ChargeEvent::ChargingStarted {
                    battery_level: self.mirror.battery_level,
                });
            }
            ChargeTransition::Stopped => self.notify_stopped(now),
            ChargeTransition::None => {}
        }
        self.save_state();

        Ok(())
    }

    fn update_charge_rate(&mut self, now: DateTime<Utc>, settings: &ChargeSettings) {
        let charging = Some(ChargingStateEnum::Charging);
        if self.mirror.charging_state != charging || self.mirror.previous_charging_state != charging {
            return;
        }

        let Some(rate) = self.mirror.charge_rate.filter(|rate| *rate > 0.0) else {
            return;
        };

        if self
            .last_charge_rate_update
            .is_some_and(|last| now - last < CHARGE_RATE_UPDATE_INTERVAL)
        {
            return;
        }

        let mut settings = settings.clone();
        settings.charge_km_per_hour = rate;
        match self.settings.save(&settings) {
            Ok(()) => {
                info!(rate, "Updated charge rate");
                self.last_charge_rate_update = Some(now);
            }
            Err(err) => error!("Failed to save charge rate: {err}"),
        }
    }

    fn notify_stopped(&self, now: DateTime<Utc>) {
        let meter_power = self
            .plan
            .as_ref()
            .and_then(ChargePlan::meter_power_start)
            .map(|start| round2(self.mirror.meter_power - start))
            .filter(|meter_power| *meter_power > 0.0)
            .unwrap_or(0.0);

        let complete = self.mirror.charging_state == Some(ChargingStateEnum::Complete)
            || self
                .plan
                .as_ref()
                .is_some_and(|plan| plan.is_last_period(now, true));

        info!(meter_power, complete, "Charging stopped");
        self.emit(ChargeEvent::ChargingStopped {
            battery_level: self.mirror.battery_level,
            meter_power,
            complete,
        });
    }

    fn can_handle_charging(&mut self, settings: &ChargeSettings) -> bool {
        let plugged_in = self
            .mirror
            .charging_state
            .is_some_and(|state| state.is_plugged_in() && state != ChargingStateEnum::Complete);
        let at_home = self
            .mirror
            .distance_from_home
            .is_some_and(|distance| distance <= settings.location_accuracy());

        if plugged_in && at_home {
            return true;
        }

        debug!(
            charging_state = ?self.mirror.charging_state,
            distance = ?self.mirror.distance_from_home,
            "Cannot handle charging"
        );
        self.turn_off_charging = false;
        self.clear_plan();
        if self.mode == ChargingMode::ChargeNow {
            self.change_mode(ChargingMode::Off);
        }
        false
    }

    async fn refresh_prices(&mut self, now: DateTime<Utc>, settings: &ChargeSettings) {
        let timezone = self.config.timezone;
        let hour = start_of_hour(now, &timezone);
        if self.prices.is_some()
            && self
                .prices_fetched_at
                .is_some_and(|fetched| start_of_hour(fetched, &timezone) == hour)
        {
            return;
        }

        let today = now.with_timezone(&timezone).date_naive();
        let yesterday = today.pred_opt().unwrap_or(today);
        let tomorrow = today.succ_opt().unwrap_or(today);
        let area = settings.price_area.as_str();
        let currency = settings.currency.as_str();

        let feed = &self.price_feed;
        let (r_yesterday, r_today, r_tomorrow) = tokio::join!(
            feed.get_hourly_prices(yesterday, area, currency),
            feed.get_hourly_prices(today, area, currency),
            feed.get_hourly_prices(tomorrow, area, currency),
        );

        let mut points = Vec::new();
        let mut any_ok = false;
        for (date, result) in [
            (yesterday, r_yesterday),
            (today, r_today),
            (tomorrow, r_tomorrow),
        ] {
            match result {
                Ok(prices) => {
                    any_ok = true;
                    points.extend(prices);
                }
                Err(err) => error!(%date, "Failed to fetch prices: {err}"),
            }
        }

        if any_ok {
            let prices = PriceSeries::new(points);
            info!(count = prices.len(), "Fetched prices");
            self.prices = Some(prices);
            self.prices_fetched_at = Some(now);
        }
    }

    fn create_plan_if_missing(&mut self, now: DateTime<Utc>, settings: &ChargeSettings) {
        if self.plan.is_some() {
            return;
        }

        let Some(prices) = &self.prices else {
            debug!("No prices yet");
            return;
        };

        let (Some(battery_level), Some(battery_range)) =
            (self.mirror.battery_level, self.mirror.battery_range)
        else {
            debug!("No battery data yet");
            return;
        };

        let config = ChargeConfig {
            charge_start: settings.charge_start,
            charge_end: settings.charge_end,
            charge_km_per_hour: settings.charge_km_per_hour,
            battery_level: f64::from(battery_level),
            battery_range,
            charge_limit_soc: self.mirror.charge_limit_soc.map(f64::from),
            charge_max_hours: settings.charge_max_hours,
        };

        // Plan the window that is running or starts next, never one that has ended.
        let window = ChargeWindow::current(
            settings.charge_start,
            settings.charge_end,
            now,
            &self.config.timezone,
        );

        let planner = ChargePlanner::new(config, self.config.timezone);
        match planner.create_plan(prices, window.starting_at()) {
            Ok(plan) => {
                let text = plan.as_text(&self.config.labels, &settings.currency);
                info!("Created charge plan:\n{text}");
                self.meters.plans_created.add(1, &[]);
                self.emit(ChargeEvent::PlanCreated {
                    text,
                    planned_km: plan.planned_charge_km(),
                });
                self.plan = Some(plan);
            }
            Err(deferred) => debug!("Not creating a plan yet: {deferred}"),
        }
    }

    async fn handle_automatic(
        &mut self,
        now: DateTime<Utc>,
        settings: &ChargeSettings,
    ) -> PollOutcome {
        let disconnected = !self
            .mirror
            .charging_state
            .is_some_and(ChargingStateEnum::is_plugged_in);
        let expired = self
            .plan
            .as_ref()
            .is_some_and(|plan| plan.is_after_plan(now - PLAN_EXPIRY));
        if disconnected || expired {
            self.clear_plan();
        }

        self.create_plan_if_missing(now, settings);

        let charging = self.mirror.is_charging();
        let meter_power = self.mirror.meter_power;
        let Some(plan) = self.plan.as_mut() else {
            return PollOutcome::Idle;
        };

        let should_charge = plan.should_charge(now);
        if should_charge == charging {
            return PollOutcome::Idle;
        }

        if should_charge && plan.set_meter_power_start(meter_power) {
            debug!(meter_power, "Recorded meter power at start of plan");
        }
        self.control_charging(should_charge, now).await
    }

    async fn handle_manual(
        &mut self,
        now: DateTime<Utc>,
        settings: &ChargeSettings,
    ) -> PollOutcome {
        let window = ChargeWindow::current(
            settings.charge_start,
            settings.charge_end,
            now,
            &self.config.timezone,
        );

        if window.contains(now) && !self.mirror.is_charging() {
            self.control_charging(true, now).await
        } else {
            PollOutcome::Idle
        }
    }

    async fn handle_charge_now(&mut self, now: DateTime<Utc>) -> PollOutcome {
        if self.mirror.is_charging() {
            PollOutcome::Idle
        } else {
            self.control_charging(true, now).await
        }
    }

    async fn handle_off(&mut self, now: DateTime<Utc>) -> PollOutcome {
        if std::mem::take(&mut self.turn_off_charging) && self.mirror.is_charging() {
            self.control_charging(false, now).await
        } else {
            PollOutcome::Idle
        }
    }

    async fn control_charging(&mut self, on: bool, now: DateTime<Utc>) -> PollOutcome {
        let action = if on { "start" } else { "stop" };
        let result = self
            .vehicle
            .control_charging(self.config.vehicle_id, on)
            .await;

        let status = if result.is_ok() { "successful" } else { "error" };
        self.meters.commands.add(
            1,
            &[
                KeyValue::new("action", action),
                KeyValue::new("status", status),
            ],
        );

        match result {
            Ok(()) => {
                info!(mode = %self.mode, "Sent {action} charging");
                PollOutcome::Commanded(on)
            }
            Err(err) => {
                error!(mode = %self.mode, "Failed to {action} charging: {err}");
                if err.is_transient() {
                    self.record_api_error(&err, now);
                }
                PollOutcome::CommandFailed(on)
            }
        }
    }

    /// Run the controller until shut down.
    ///
    /// Polls every `poll_interval`. A poll is never started while the previous one is still
    /// running.
    #[must_use]
    pub fn run(mut self, poll_interval: Duration) -> (ControllerHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(16);
        let name = self.config.name.clone();

        let task = spawn(async move {
            let mut next_poll = Instant::now();

            loop {
                select! {
                    () = sleep_until(next_poll) => {
                        let outcome = self.poll(Utc::now()).await;
                        debug!(name, ?outcome, "Poll done");
                        next_poll = Instant::now() + poll_interval;
                    },
                    command = rx.recv() => {
                        let Some(command) = command else {
                            debug!(name, "All handles dropped, exiting");
                            break;
                        };
                        if command == ControllerCommand::Shutdown {
                            info!(name, "Shutting down");
                            break;
                        }
                        if self.handle_command(command) {
                            next_poll = Instant::now();
                        }
                    },
                }
            }
        });

        (ControllerHandle { tx }, task)
    }
}

/// Send commands to a running controller.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    tx: mpsc::Sender<ControllerCommand>,
}

impl ControllerHandle {
    async fn send(&self, command: ControllerCommand) -> Result<(), ControllerError> {
        self.tx
            .send(command)
            .await
            .map_err(|_| ControllerError::Closed)
    }

    /// Change the charging mode.
    ///
    /// # Errors
    ///
    /// If the controller has stopped.
    pub async fn set_mode(&self, mode: ChargingMode) -> Result<(), ControllerError> {
        self.send(ControllerCommand::SetMode(mode)).await
    }

    /// Change the charge window. Times are `HH` or `HH:MM`.
    ///
    /// # Errors
    ///
    /// If a time cannot be parsed or the controller has stopped.
    pub async fn set_charge_window(
        &self,
        start: &str,
        end: &str,
        max_hours: Option<f64>,
    ) -> Result<(), ControllerError> {
        let start = time_of_day(start)?;
        let end = time_of_day(end)?;
        self.send(ControllerCommand::SetChargeWindow {
            start,
            end,
            max_hours,
        })
        .await
    }

    /// Change the full telemetry interval.
    ///
    /// # Errors
    ///
    /// If `minutes` is outside 1..=1440 or the controller has stopped.
    pub async fn set_data_fetch_interval(&self, minutes: u32) -> Result<(), ControllerError> {
        let minutes = validate_data_fetch_interval(minutes)?;
        self.send(ControllerCommand::SetDataFetchInterval(minutes))
            .await
    }

    /// Change where prices come from.
    ///
    /// # Errors
    ///
    /// If the controller has stopped.
    pub async fn set_price_area(
        &self,
        area: impl Into<String> + Send,
        currency: impl Into<String> + Send,
    ) -> Result<(), ControllerError> {
        self.send(ControllerCommand::SetPriceArea {
            area: area.into(),
            currency: currency.into(),
        })
        .await
    }

    /// Set the energy counter to zero.
    ///
    /// # Errors
    ///
    /// If the controller has stopped.
    pub async fn reset_meter_power(&self) -> Result<(), ControllerError> {
        self.send(ControllerCommand::ResetMeterPower).await
    }

    /// Stop the controller.
    ///
    /// # Errors
    ///
    /// If the controller has already stopped.
    pub async fn shutdown(&self) -> Result<(), ControllerError> {
        self.send(ControllerCommand::Shutdown).await
    }
}
