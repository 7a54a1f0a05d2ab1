//! Decide when a vehicle is unavailable because its API keeps failing.
use chrono::{DateTime, TimeDelta, Utc};
use opentelemetry::{global, metrics::Counter, KeyValue};
use tracing::{info, warn};

use crate::{services::tesla::ApiError, unsafe_time_delta};

/// Consecutive failures before the vehicle is marked unavailable.
pub const MAX_ERRORS_BEFORE_UNAVAILABLE: u32 = 5;

/// Cooldown after too many failures.
pub const ERROR_COOLDOWN: TimeDelta = unsafe_time_delta!(seconds: 300);

/// Cooldown after a timeout.
pub const TIMEOUT_COOLDOWN: TimeDelta = unsafe_time_delta!(seconds: 60);

/// What happened when a failure was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOutcome {
    /// The failure was counted, this is the consecutive count.
    Counted(u32),

    /// Polling is suspended until the given time.
    CooldownStarted(DateTime<Utc>),
}

#[derive(Debug)]
struct Meters {
    failures: Counter<u64>,
    cooldowns: Counter<u64>,
}

impl Meters {
    fn new() -> Self {
        let meter = global::meter("evcharge::api_errors");
        Self {
            failures: meter.u64_counter("api_failures").init(),
            cooldowns: meter.u64_counter("api_cooldowns").init(),
        }
    }
}

/// Counts consecutive API failures and suspends polling while the vehicle is unavailable.
#[derive(Debug)]
pub struct ApiErrorPolicy {
    count: u32,
    available: bool,
    cooldown_until: Option<DateTime<Utc>>,
    meters: Meters,
}

impl Default for ApiErrorPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl ApiErrorPolicy {
    /// Create a policy for an available vehicle.
    #[must_use]
    pub fn new() -> Self {
        Self {
            count: 0,
            available: true,
            cooldown_until: None,
            meters: Meters::new(),
        }
    }

    /// Number of consecutive failures.
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }

    /// Is the vehicle available?
    #[must_use]
    pub const fn is_available(&self) -> bool {
        self.available
    }

    /// When the current cooldown ends, if there is one.
    #[must_use]
    pub const fn cooldown_until(&self) -> Option<DateTime<Utc>> {
        self.cooldown_until
    }

    fn start_cooldown(&mut self, now: DateTime<Utc>, length: TimeDelta, reason: &str) -> ErrorOutcome {
        let until = now + length;
        self.cooldown_until = Some(until);
        self.available = false;
        self.meters
            .cooldowns
            .add(1, &[KeyValue::new("reason", reason.to_string())]);
        warn!("Vehicle unavailable until {until}: {reason}");
        ErrorOutcome::CooldownStarted(until)
    }

    /// Record a failed request.
    ///
    /// A timeout starts a short cooldown straight away without touching the counter. Other
    /// failures start the long cooldown once the counter reaches the threshold.
    pub fn record_failure(&mut self, error: &ApiError, now: DateTime<Utc>) -> ErrorOutcome {
        let kind = if error.is_timeout() { "timeout" } else { "error" };
        self.meters
            .failures
            .add(1, &[KeyValue::new("kind", kind)]);

        if error.is_timeout() {
            return self.start_cooldown(now, TIMEOUT_COOLDOWN, "timeout");
        }

        self.count += 1;
        info!("API error {}/{MAX_ERRORS_BEFORE_UNAVAILABLE}: {error}", self.count);

        if self.cooldown_until.is_none() && self.count >= MAX_ERRORS_BEFORE_UNAVAILABLE {
            return self.start_cooldown(now, ERROR_COOLDOWN, "too many errors");
        }

        ErrorOutcome::Counted(self.count)
    }

    /// Record a successful request.
    ///
    /// Returns true if this made the vehicle available again.
    pub fn record_success(&mut self) -> bool {
        self.count = 0;
        self.cooldown_until = None;
        if self.available {
            false
        } else {
            info!("Vehicle available again");
            self.available = true;
            true
        }
    }

    /// May we poll at `now`?
    ///
    /// An expired cooldown is cleared and the counter reset. The vehicle stays unavailable until
    /// the next success.
    pub fn poll_allowed(&mut self, now: DateTime<Utc>) -> bool {
        match self.cooldown_until {
            Some(until) if now < until => false,
            Some(_) => {
                info!("Cooldown expired, polling again");
                self.cooldown_until = None;
                self.count = 0;
                true
            }
            None => true,
        }
    }
}
