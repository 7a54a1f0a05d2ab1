//! Wrapper around Tesla's API

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use opentelemetry::{global, metrics::Counter, KeyValue};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tap::Pipe;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::{
    ApiError, ChargeData, ChargeLimitMode, ChargingStateEnum, CommandError, DriveData, Trunk,
    VehicleClient, VehicleData, VehicleId, VehicleState, VehicleSummary, MILES_TO_KM,
};
use crate::{
    datetime::duration,
    is_debug_mode,
    location::Location,
    services::persistent_state::{self, PersistentStateRow},
    settings::ConfigError,
};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const WAKE_UP_POLL_INTERVAL: Duration = Duration::from_millis(500);
const WAKE_UP_ATTEMPTS: u32 = 120;

/// A set of meter counters for the Tesla API
#[derive(Debug)]
pub struct Meters {
    auth_requests: Counter<u64>,
    vehicle_requests: Counter<u64>,
}

impl Meters {
    /// Create a new set of meter counters
    #[must_use]
    pub fn new() -> Self {
        let meter = global::meter("tesla::api");

        Meters {
            auth_requests: meter.u64_counter("auth_requests").init(),
            vehicle_requests: meter.u64_counter("vehicle_requests").init(),
        }
    }
}

impl Default for Meters {
    fn default() -> Self {
        Self::new()
    }
}

fn default_base_url() -> String {
    "https://owner-api.teslamotors.com".into()
}

fn default_auth_url() -> String {
    "https://auth.tesla.com/oauth2/v3/token".into()
}

/// Where to find the API.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Owner API base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Token renewal URL.
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            auth_url: default_auth_url(),
        }
    }
}

#[tracing::instrument]
async fn handle_error(
    response: Result<reqwest::Response, reqwest::Error>,
) -> Result<reqwest::Response, ApiError> {
    let response = match response {
        Ok(response) => response,
        Err(e) if e.is_timeout() => {
            error!("Request timed out: {}", e);
            return Err(ApiError::Timeout);
        }
        Err(e) => {
            error!("Reqwest error: {}", e);
            return Err(ApiError::Reqwest(e));
        }
    };

    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let headers = response.headers();
        let retry_time = headers
            .get("Retry-After")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(60)
            .pipe(Duration::from_secs);

        info!(
            "Got 429 rate limited, retry in: {}",
            duration::to_string(&retry_time)
        );

        return Err(ApiError::RateLimit(retry_time));
    }

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(ApiError::Auth(status.to_string()));
    }

    let checked = response.error_for_status_ref().map(|_| ());
    if let Err(err) = checked {
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::REQUEST_TIMEOUT || body.contains("operation_timedout") {
            info!("Vehicle did not respond in time: {body}");
            return Err(ApiError::Timeout);
        }
        error!("HTTP error {status}: {body}");
        return Err(ApiError::Reqwest(err));
    }

    Ok(response)
}

#[derive(Debug, Clone, Copy)]
enum VehicleOperation {
    GetState,
    GetVehicleData,
    WakeUp,
    ChargeStart,
    ChargeStop,
    SetChargeLimit,
    ChargeStandard,
    ChargeMaxRange,
    ActuateTrunk,
}

impl VehicleOperation {
    const fn as_str(self) -> &'static str {
        match self {
            VehicleOperation::GetState => "get_state",
            VehicleOperation::GetVehicleData => "get_vehicle_data",
            VehicleOperation::WakeUp => "wake_up",
            VehicleOperation::ChargeStart => "charge_start",
            VehicleOperation::ChargeStop => "charge_stop",
            VehicleOperation::SetChargeLimit => "set_charge_limit",
            VehicleOperation::ChargeStandard => "charge_standard",
            VehicleOperation::ChargeMaxRange => "charge_max_range",
            VehicleOperation::ActuateTrunk => "actuate_trunk",
        }
    }
}

const fn status_label<U>(result: &Result<U, ApiError>) -> &'static str {
    match result {
        Ok(_response) => "successful",
        Err(ApiError::RateLimit(_duration)) => "rate_limited",
        Err(ApiError::Timeout) => "timeout",
        Err(_e) => "error",
    }
}

fn increment_vehicle_count<U>(
    operation: VehicleOperation,
    vehicle_id: VehicleId,
    result: Result<U, ApiError>,
    meters: &Meters,
) -> Result<U, ApiError> {
    let attributes = [
        KeyValue::new("operation", operation.as_str()),
        KeyValue::new("vehicle_id", vehicle_id.to_string()),
        KeyValue::new("status", status_label(&result)),
    ];
    meters.vehicle_requests.add(1, &attributes);
    result
}

#[derive(Serialize)]
struct TokenRenew {
    grant_type: String,
    client_id: String,
    refresh_token: String,
    scope: String,
}

impl std::fmt::Debug for TokenRenew {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenRenew")
            .field("grant_type", &self.grant_type)
            .field("client_id", &self.client_id)
            .field("refresh_token", &"[censored]")
            .field("scope", &self.scope)
            .finish()
    }
}

#[derive(Deserialize)]
struct RawToken {
    access_token: String,
    refresh_token: String,
    token_type: String,
    expires_in: u64,
}

/// Token to access the Tesla API
#[derive(Clone, Serialize, Deserialize)]
pub struct Token {
    access_token: String,
    refresh_token: String,
    token_type: String,

    /// Time we should renew the token.
    pub renew_at: DateTime<Utc>,

    /// Time when the token expires.
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"[censored]")
            .field("refresh_token", &"[censored]")
            .field("token_type", &self.token_type)
            .field("renew_at", &self.renew_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Error when something went wrong with the Token
#[derive(Debug, Error)]
pub enum TokenError {
    /// A error loading/saving the persistent token
    #[error("Persistent state error: {0}")]
    Error(#[from] persistent_state::Error),

    /// The renewal request failed
    #[error("Renew error: {0}")]
    Api(#[from] ApiError),
}

impl Token {
    /// Load token from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file could not be read or deserialized.
    pub fn get(ps: &PersistentStateRow<Token>) -> Result<Self, persistent_state::Error> {
        ps.load()
    }

    fn put(&self, ps: &PersistentStateRow<Token>) -> Result<(), persistent_state::Error> {
        ps.save(self)
    }

    fn from_raw(token: RawToken, now: DateTime<Utc>) -> Self {
        let expires_in = Duration::from_secs(token.expires_in);
        let renew_in = expires_in
            .checked_sub(Duration::from_secs(60 * 60))
            .unwrap_or_default();

        let expires_in = TimeDelta::from_std(expires_in).unwrap_or_else(|_| TimeDelta::minutes(1));
        let renew_in = TimeDelta::from_std(renew_in).unwrap_or_else(|_| TimeDelta::minutes(1));

        Token {
            access_token: token.access_token,
            refresh_token: token.refresh_token,
            token_type: token.token_type,
            renew_at: now + renew_in,
            expires_at: now + expires_in,
        }
    }
}

#[derive(Serialize, Debug)]
struct SetChargeLimit {
    percent: u8,
}

#[derive(Serialize, Debug)]
struct ActuateTrunk {
    which_trunk: Trunk,
}

#[derive(Debug, Deserialize)]
struct GenericResponse {
    reason: String,
    result: bool,
}

#[derive(Debug, Deserialize)]
struct WakeUpResponse {
    state: VehicleState,
}

#[derive(Debug, Deserialize)]
struct RawVehicle {
    state: VehicleState,
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawChargeState {
    battery_level: u8,
    battery_range: f64,
    charge_limit_soc: u8,
    charging_state: ChargingStateEnum,
    #[serde(default)]
    charge_rate: f64,
    charger_actual_current: Option<f64>,
    charger_voltage: Option<f64>,
    charger_phases: Option<f64>,
    #[serde(default)]
    time_to_full_charge: f64,
}

#[derive(Debug, Deserialize)]
struct RawDriveState {
    latitude: Option<f64>,
    longitude: Option<f64>,
    speed: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawVehicleState {
    odometer: f64,
}

#[derive(Debug, Deserialize)]
struct RawVehicleData {
    charge_state: RawChargeState,
    drive_state: RawDriveState,
    vehicle_state: RawVehicleState,
}

impl From<RawVehicleData> for VehicleData {
    fn from(raw: RawVehicleData) -> Self {
        let RawVehicleData {
            charge_state,
            drive_state,
            vehicle_state,
        } = raw;

        VehicleData {
            charge: ChargeData {
                charging_state: charge_state.charging_state,
                battery_level: charge_state.battery_level,
                battery_range: charge_state.battery_range * MILES_TO_KM,
                charge_limit_soc: charge_state.charge_limit_soc,
                charge_rate: charge_state.charge_rate * MILES_TO_KM,
                charger_actual_current: charge_state.charger_actual_current,
                charger_voltage: charge_state.charger_voltage,
                charger_phases: charge_state.charger_phases,
                time_to_full_charge: charge_state.time_to_full_charge,
            },
            drive: DriveData {
                location: Location::from_coordinates(drive_state.latitude, drive_state.longitude),
                speed: drive_state.speed.map(|speed| speed * MILES_TO_KM),
            },
            odometer: vehicle_state.odometer * MILES_TO_KM,
        }
    }
}

/// Treat a rejection for one of `reasons` as success; the car is already where we want it.
fn already_done(result: Result<(), ApiError>, reasons: &[&str]) -> Result<(), ApiError> {
    match result {
        Err(ApiError::Failed(reason)) if reasons.contains(&reason.as_str()) => {
            debug!("Command not needed: {reason}");
            Ok(())
        }
        result => result,
    }
}

const fn charge_limit_mode_operation(mode: ChargeLimitMode) -> VehicleOperation {
    match mode {
        ChargeLimitMode::Standard => VehicleOperation::ChargeStandard,
        ChargeLimitMode::MaxRange => VehicleOperation::ChargeMaxRange,
    }
}

#[derive(Debug, Deserialize)]
struct OuterResponse<T> {
    pub response: T,
}

type OuterGenericResponse = OuterResponse<GenericResponse>;

impl From<OuterGenericResponse> for Result<(), ApiError> {
    fn from(response: OuterGenericResponse) -> Self {
        if response.response.result {
            Ok(())
        } else if response.response.reason.is_empty() {
            Err(ApiError::Failed("no reason".into()))
        } else {
            Err(ApiError::Failed(response.response.reason))
        }
    }
}

/// A client for the owner API.
#[derive(Debug)]
pub struct TeslaClient {
    base_url: String,
    auth_url: String,
    client: reqwest::Client,
    token: RwLock<Token>,
    token_row: PersistentStateRow<Token>,
    meters: Meters,
}

impl TeslaClient {
    /// Create a client using the token stored in `token_row`.
    ///
    /// # Errors
    ///
    /// Returns an error if the token could not be loaded.
    pub fn new(config: &Config, token_row: PersistentStateRow<Token>) -> Result<Self, TokenError> {
        let token = Token::get(&token_row)?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_url: config.auth_url.clone(),
            client: reqwest::Client::new(),
            token: RwLock::new(token),
            token_row,
            meters: Meters::new(),
        })
    }

    /// Renew the token if it is going to expire soon
    ///
    /// # Errors
    ///
    /// Returns an error if the renewal failed or the new token could not be saved.
    #[tracing::instrument(skip(self))]
    pub async fn check_token(&self) -> Result<(), TokenError> {
        let mut token = self.token.write().await;
        if token.renew_at > Utc::now() {
            return Ok(());
        }

        let body = TokenRenew {
            grant_type: "refresh_token".into(),
            client_id: "ownerapi".into(),
            refresh_token: token.refresh_token.clone(),
            scope: "openid email offline_access".into(),
        };

        let result: Result<RawToken, ApiError> = async {
            let response = self
                .client
                .post(&self.auth_url)
                .json(&body)
                .timeout(REQUEST_TIMEOUT)
                .send()
                .await
                .pipe(handle_error)
                .await?;
            Ok(response.json().await?)
        }
        .await;

        let status = status_label(&result);
        self.meters.auth_requests.add(
            1,
            &[
                KeyValue::new("operation", "renew_token"),
                KeyValue::new("status", status),
            ],
        );

        let renewed = Token::from_raw(result?, Utc::now());
        renewed.put(&self.token_row)?;
        info!("Renewed token, expires at {}", renewed.expires_at);
        *token = renewed;
        Ok(())
    }

    async fn access_token(&self) -> String {
        self.token.read().await.access_token.clone()
    }

    #[tracing::instrument(skip(self))]
    async fn get_with_token<U: DeserializeOwned>(&self, url: &str) -> Result<U, ApiError> {
        debug!("get_with_token: {}", url);
        let token = self.access_token().await;

        let response = self
            .client
            .get(url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {token}"))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .pipe(handle_error)
            .await?;

        let text = response.json().await?;
        debug!("get_with_token done: {}", url);
        Ok(text)
    }

    #[tracing::instrument(skip(self))]
    async fn post_with_token<T: Serialize + Sync + std::fmt::Debug, U: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<U, ApiError> {
        debug!("post_with_token: {}", url);
        let token = self.access_token().await;

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("Authorization", format!("Bearer {token}"))
            .json(body)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .pipe(handle_error)
            .await?;

        let text = response.json().await?;
        debug!("post_with_token done: {}", url);
        Ok(text)
    }

    fn vehicle_url(&self, id: VehicleId, path: &str) -> String {
        if path.is_empty() {
            format!("{}/api/1/vehicles/{id}", self.base_url)
        } else {
            format!("{}/api/1/vehicles/{id}/{path}", self.base_url)
        }
    }

    async fn wake_up(&self, id: VehicleId) -> Result<VehicleState, ApiError> {
        let url = self.vehicle_url(id, "wake_up");
        let response: OuterResponse<WakeUpResponse> = self
            .post_with_token(&url, &())
            .await
            .pipe(|result| {
                increment_vehicle_count(VehicleOperation::WakeUp, id, result, &self.meters)
            })?;
        Ok(response.response.state)
    }

    /// Wake the car if it is asleep, and wait for it to come online.
    ///
    /// Gives up after a minute with a warning and carries on regardless.
    ///
    /// # Errors
    ///
    /// Returns an error if a request failed.
    #[tracing::instrument(skip(self))]
    pub async fn wake_up_if_necessary(&self, id: VehicleId) -> Result<(), ApiError> {
        if self.get_state(id).await?.state.is_online() {
            return Ok(());
        }

        info!(%id, "Trying to wake up");
        if self.wake_up(id).await?.is_online() {
            info!(%id, "Trying to wake up: Car is online");
            return Ok(());
        }

        for _ in 0..WAKE_UP_ATTEMPTS {
            tokio::time::sleep(WAKE_UP_POLL_INTERVAL).await;
            if self.get_state(id).await?.state.is_online() {
                info!(%id, "Trying to wake up: Car is online");
                return Ok(());
            }
        }

        warn!(%id, "Car did not wake up, continuing anyway");
        Ok(())
    }

    async fn command<T: Serialize + Sync + std::fmt::Debug>(
        &self,
        id: VehicleId,
        operation: VehicleOperation,
        body: &T,
    ) -> Result<(), ApiError> {
        if is_debug_mode() {
            debug!(%id, "Would execute command: {:?} {:?}", operation, body);
            return Ok(());
        }

        self.wake_up_if_necessary(id).await?;

        let url = self.vehicle_url(id, &format!("command/{}", operation.as_str()));
        let response: OuterGenericResponse = self
            .post_with_token(&url, body)
            .await
            .pipe(|result| increment_vehicle_count(operation, id, result, &self.meters))?;

        info!(%id, "Executed command {:?}", operation);
        response.into()
    }

    /// Set the charge limit for the car
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidChargeLimit` unless `percent` is within 1..=100, otherwise an
    /// error if the request failed or was rejected.
    #[tracing::instrument(skip(self))]
    pub async fn set_charge_limit(&self, id: VehicleId, percent: u8) -> Result<(), CommandError> {
        if !(1..=100).contains(&percent) {
            return Err(ConfigError::InvalidChargeLimit(percent).into());
        }

        let body = SetChargeLimit { percent };
        let result = self.command(id, VehicleOperation::SetChargeLimit, &body).await;
        already_done(result, &["already_set"]).map_err(CommandError::from)
    }

    /// Open a trunk.
    ///
    /// # Errors
    ///
    /// Returns an error if the request failed or was rejected.
    #[tracing::instrument(skip(self))]
    pub async fn actuate_trunk(&self, id: VehicleId, trunk: Trunk) -> Result<(), CommandError> {
        let body = ActuateTrunk { which_trunk: trunk };
        self.command(id, VehicleOperation::ActuateTrunk, &body)
            .await
            .map_err(CommandError::from)
    }

    /// Switch between the standard and the maximum range charge limit.
    ///
    /// # Errors
    ///
    /// Returns an error if the request failed or was rejected.
    #[tracing::instrument(skip(self))]
    pub async fn set_charge_limit_mode(
        &self,
        id: VehicleId,
        mode: ChargeLimitMode,
    ) -> Result<(), CommandError> {
        let result = self
            .command(id, charge_limit_mode_operation(mode), &())
            .await;
        already_done(result, &["already_standard", "already_max_range"]).map_err(CommandError::from)
    }
}

#[async_trait]
impl VehicleClient for TeslaClient {
    #[tracing::instrument(skip(self))]
    async fn get_state(&self, id: VehicleId) -> Result<VehicleSummary, ApiError> {
        let url = self.vehicle_url(id, "");
        let response: OuterResponse<RawVehicle> = self
            .get_with_token(&url)
            .await
            .pipe(|result| {
                increment_vehicle_count(VehicleOperation::GetState, id, result, &self.meters)
            })?;

        Ok(VehicleSummary {
            state: response.response.state,
            display_name: response.response.display_name,
        })
    }

    #[tracing::instrument(skip(self))]
    async fn get_full_telemetry(&self, id: VehicleId) -> Result<VehicleData, ApiError> {
        self.wake_up_if_necessary(id).await?;

        let url = self.vehicle_url(id, "vehicle_data");
        let response: OuterResponse<RawVehicleData> = self
            .get_with_token(&url)
            .await
            .pipe(|result| {
                increment_vehicle_count(VehicleOperation::GetVehicleData, id, result, &self.meters)
            })?;

        Ok(response.response.into())
    }

    async fn start_charging(&self, id: VehicleId) -> Result<(), ApiError> {
        let result = self.command(id, VehicleOperation::ChargeStart, &()).await;
        already_done(result, &["is_charging"])
    }

    async fn stop_charging(&self, id: VehicleId) -> Result<(), ApiError> {
        let result = self.command(id, VehicleOperation::ChargeStop, &()).await;
        already_done(result, &["not_charging"])
    }
}
