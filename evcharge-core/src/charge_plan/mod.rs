//! Charge plans: which hours of the charge window to charge in.
mod planner;

pub use planner::{lowest_prices, ChargeConfig, ChargePlanner, PlanDeferred};

use chrono::{DateTime, NaiveTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::datetime::{local_to_utc, start_of_hour, time_delta_to_hh_mm};

/// Is `now` within `[start, end)`?
#[must_use]
pub fn is_in_charge_period(now: DateTime<Utc>, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
    now >= start && now < end
}

/// The interval in which charging is allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChargeWindow {
    starting_at: DateTime<Utc>,
    ending_at: DateTime<Utc>,
}

impl ChargeWindow {
    /// The window starting at `charge_start` on the local day of `reference`.
    ///
    /// If `charge_end` is not after `charge_start` the window ends the next day.
    pub fn new<T: TimeZone>(
        charge_start: NaiveTime,
        charge_end: NaiveTime,
        reference: DateTime<Utc>,
        timezone: &T,
    ) -> Self {
        let date = reference.with_timezone(timezone).date_naive();
        let starting_at = local_to_utc(date, charge_start, timezone);
        let mut ending_at = local_to_utc(date, charge_end, timezone);
        if ending_at <= starting_at {
            let next_day = date.succ_opt().unwrap_or(date);
            ending_at = local_to_utc(next_day, charge_end, timezone);
        }
        Self {
            starting_at,
            ending_at,
        }
    }

    /// The window `reference` is in, or else the next window to start.
    ///
    /// Unlike [`ChargeWindow::new`] this returns yesterday's window while a window that crosses
    /// midnight is still running, and tomorrow's once today's has ended.
    pub fn current<T: TimeZone>(
        charge_start: NaiveTime,
        charge_end: NaiveTime,
        reference: DateTime<Utc>,
        timezone: &T,
    ) -> Self {
        let yesterday = Self::new(
            charge_start,
            charge_end,
            reference - TimeDelta::days(1),
            timezone,
        );
        if reference < yesterday.ending_at {
            return yesterday;
        }

        let today = Self::new(charge_start, charge_end, reference, timezone);
        if reference < today.ending_at {
            today
        } else {
            Self::new(
                charge_start,
                charge_end,
                reference + TimeDelta::days(1),
                timezone,
            )
        }
    }

    /// Start of the window.
    #[must_use]
    pub const fn starting_at(&self) -> DateTime<Utc> {
        self.starting_at
    }

    /// End of the window.
    #[must_use]
    pub const fn ending_at(&self) -> DateTime<Utc> {
        self.ending_at
    }

    /// Length of the window in hours.
    #[must_use]
    pub fn hours(&self) -> f64 {
        crate::datetime::time_delta_to_hours(self.ending_at - self.starting_at)
    }

    /// Is `now` within the window?
    #[must_use]
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        is_in_charge_period(now, self.starting_at, self.ending_at)
    }

    /// Is `now` within the window widened by `padding` on both sides?
    #[must_use]
    pub fn contains_padded(&self, now: DateTime<Utc>, padding: TimeDelta) -> bool {
        is_in_charge_period(now, self.starting_at - padding, self.ending_at + padding)
    }
}

/// One hour of the charge window, or less for the final charging hour.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChargeSegment {
    /// Start of the segment.
    pub starts_at: DateTime<Utc>,

    /// End of the segment.
    pub ends_at: DateTime<Utc>,

    /// Price per kWh for the hour.
    pub price: f64,

    /// Should we charge in this segment?
    pub charge: bool,
}

impl ChargeSegment {
    /// Length of the segment.
    #[must_use]
    pub fn duration(&self) -> TimeDelta {
        self.ends_at - self.starts_at
    }

    /// Is `now` within `[starts_at, ends_at)`?
    #[must_use]
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        is_in_charge_period(now, self.starts_at, self.ends_at)
    }
}

/// Labels used when rendering a plan as text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanLabels {
    /// Label for the distance to charge.
    pub charge_plan: String,

    /// Label for the total charge time.
    pub charge_hours: String,

    /// Label for the cost reduction.
    pub cost_reduction: String,
}

impl Default for PlanLabels {
    fn default() -> Self {
        Self {
            charge_plan: "Charge plan".into(),
            charge_hours: "Charge hours".into(),
            cost_reduction: "Cost reduction".into(),
        }
    }
}

/// A charge plan for one charge window.
///
/// Segments are ordered by start time and there is at least one.
#[derive(Debug, Clone, PartialEq)]
pub struct ChargePlan {
    window: ChargeWindow,
    segments: Vec<ChargeSegment>,
    max_to_charge: f64,
    charge_hours: f64,
    timezone: Tz,
    meter_power_start: Option<f64>,
}

impl ChargePlan {
    pub(crate) const fn new(
        window: ChargeWindow,
        segments: Vec<ChargeSegment>,
        max_to_charge: f64,
        charge_hours: f64,
        timezone: Tz,
    ) -> Self {
        Self {
            window,
            segments,
            max_to_charge,
            charge_hours,
            timezone,
            meter_power_start: None,
        }
    }

    /// The window this plan was made for.
    #[must_use]
    pub const fn window(&self) -> &ChargeWindow {
        &self.window
    }

    /// The segments of the plan.
    #[must_use]
    pub fn segments(&self) -> &[ChargeSegment] {
        &self.segments
    }

    /// Distance in km that the plan intends to add.
    #[must_use]
    pub const fn max_to_charge(&self) -> f64 {
        self.max_to_charge
    }

    /// Distance in km that the plan intends to add, rounded for display.
    #[must_use]
    pub fn planned_charge_km(&self) -> f64 {
        self.max_to_charge.round()
    }

    /// Hours of charging the plan was made for.
    #[must_use]
    pub const fn charge_hours(&self) -> f64 {
        self.charge_hours
    }

    /// Energy counter reading when charging first started under this plan.
    #[must_use]
    pub const fn meter_power_start(&self) -> Option<f64> {
        self.meter_power_start
    }

    /// Record the energy counter reading when charging first starts.
    ///
    /// Only the first call has an effect. Returns true if the value was stored.
    pub fn set_meter_power_start(&mut self, meter_power: f64) -> bool {
        if self.meter_power_start.is_some() {
            return false;
        }
        self.meter_power_start = Some(meter_power);
        true
    }

    /// The segment for the hour containing `now`, charging or not.
    #[must_use]
    pub fn charge_at_moment(&self, now: DateTime<Utc>) -> Option<&ChargeSegment> {
        let hour = start_of_hour(now, &self.timezone);
        let next_hour = hour + TimeDelta::hours(1);
        self.segments
            .iter()
            .find(|s| s.starts_at >= hour && s.starts_at < next_hour)
    }

    /// Should the vehicle be charging at `now`?
    #[must_use]
    pub fn should_charge(&self, now: DateTime<Utc>) -> bool {
        self.charge_at_moment(now)
            .is_some_and(|s| s.charge && s.contains(now))
    }

    /// Is `now` before the first segment?
    #[must_use]
    pub fn is_before_plan(&self, now: DateTime<Utc>) -> bool {
        self.segments.first().is_some_and(|s| now < s.starts_at)
    }

    /// Is `now` at or after the end of the last segment?
    #[must_use]
    pub fn is_after_plan(&self, now: DateTime<Utc>) -> bool {
        self.segments.last().is_some_and(|s| now >= s.ends_at)
    }

    /// Is `now` within the first segment?
    #[must_use]
    pub fn is_first_period(&self, now: DateTime<Utc>) -> bool {
        self.segments.first().is_some_and(|s| s.contains(now))
    }

    /// Is `now` within the hour of the last segment?
    ///
    /// With `only_charging` the last charging segment is used instead.
    #[must_use]
    pub fn is_last_period(&self, now: DateTime<Utc>, only_charging: bool) -> bool {
        let last = if only_charging {
            self.segments.iter().rev().find(|s| s.charge)
        } else {
            self.segments.last()
        };
        last.is_some_and(|s| is_in_charge_period(now, s.starts_at, s.starts_at + TimeDelta::hours(1)))
    }

    fn charge_segments(&self) -> impl Iterator<Item = &ChargeSegment> {
        self.segments.iter().filter(|s| s.charge)
    }

    /// Total time the plan charges for.
    #[must_use]
    pub fn sum_charge_hours(&self) -> TimeDelta {
        self.charge_segments().map(ChargeSegment::duration).sum()
    }

    /// How much cheaper the plan is than charging from the start of the window.
    ///
    /// Negative when the plan is cheaper. `None` if the plan costs nothing.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn cost_reduction(&self) -> Option<f64> {
        const HOUR_MS: f64 = 3_600_000.0;

        let cost_charge: f64 = self
            .charge_segments()
            .map(|s| s.duration().num_milliseconds() as f64 * s.price)
            .sum();

        if cost_charge.abs() < f64::EPSILON {
            return None;
        }

        let mut remaining = self.sum_charge_hours().num_milliseconds() as f64;
        let mut cost_start = 0.0;
        for segment in &self.segments {
            cost_start += remaining.clamp(0.0, HOUR_MS) * segment.price;
            if remaining > 0.0 {
                remaining -= HOUR_MS;
            }
        }

        let reduction = (cost_charge - cost_start) / cost_charge;
        Some((reduction * 100_000_000.0).round() / 100_000_000.0)
    }

    /// Render the plan as a human readable summary.
    #[must_use]
    pub fn as_text(&self, labels: &PlanLabels, currency: &str) -> String {
        let mut text = format!(
            "{}: {} km\n{}: {}\n",
            labels.charge_plan,
            self.planned_charge_km(),
            labels.charge_hours,
            time_delta_to_hh_mm(self.sum_charge_hours())
        );

        if let Some(reduction) = self.cost_reduction().filter(|r| *r < 0.0) {
            let percent = (-10_000.0 * reduction).round() / 100.0;
            text.push_str(&format!("{}: {percent} %\n", labels.cost_reduction));
        }

        let lines: Vec<String> = self
            .charge_segments()
            .map(|s| {
                format!(
                    "{}-{}: {} {currency}/kWh",
                    s.starts_at.with_timezone(&self.timezone).format("%H:%M"),
                    s.ends_at.with_timezone(&self.timezone).format("%H:%M"),
                    s.price
                )
            })
            .collect();
        text.push_str(&lines.join("\n"));
        text
    }
}
