use chrono::{DateTime, NaiveTime, TimeDelta, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::{ChargePlan, ChargeSegment, ChargeWindow};
use crate::datetime::{hours_to_time_delta, with_time_of_day};
use crate::prices::{PricePoint, PriceSeries};

/// Battery range assumed at 100% when the battery level is unknown.
const FALLBACK_MAX_BATTERY_RANGE: f64 = 500.0;

/// Charge limit used when the vehicle does not report one.
const DEFAULT_CHARGE_LIMIT_SOC: f64 = 90.0;

/// Shortest time a fractional charge segment is shortened to, in hours.
const MIN_FRACTIONAL_HOURS: f64 = 0.05;

/// Inputs for one planning cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChargeConfig {
    /// Start of the charge window, local time.
    #[serde(with = "with_time_of_day")]
    pub charge_start: NaiveTime,

    /// End of the charge window, local time.
    #[serde(with = "with_time_of_day")]
    pub charge_end: NaiveTime,

    /// Range added per hour of charging, in km.
    pub charge_km_per_hour: f64,

    /// Current battery level in percent.
    pub battery_level: f64,

    /// Current battery range in km.
    pub battery_range: f64,

    /// Charge to this battery level in percent.
    pub charge_limit_soc: Option<f64>,

    /// Never plan more hours than this.
    pub charge_max_hours: Option<f64>,
}

/// Why no plan was made.
///
/// These are not failures. Planning should be retried once more data arrives.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PlanDeferred {
    /// Battery level, battery range or charge rate is unknown.
    #[error("Battery level, range or charge rate unknown")]
    InsufficientData,

    /// Prices do not cover the whole charge window.
    #[error("Prices missing for charge window")]
    MissingPrices,
}

/// Computes the cheapest charge plan for a charge window.
#[derive(Debug, Clone)]
pub struct ChargePlanner {
    config: ChargeConfig,
    timezone: Tz,
}

impl ChargePlanner {
    /// Create a planner for the given settings and local timezone.
    #[must_use]
    pub const fn new(config: ChargeConfig, timezone: Tz) -> Self {
        Self { config, timezone }
    }

    /// The configuration used by this planner.
    #[must_use]
    pub const fn config(&self) -> &ChargeConfig {
        &self.config
    }

    /// The charge window on the day of `reference`.
    #[must_use]
    pub fn window(&self, reference: DateTime<Utc>) -> ChargeWindow {
        ChargeWindow::new(
            self.config.charge_start,
            self.config.charge_end,
            reference,
            &self.timezone,
        )
    }

    /// Hours in the charge window on the day of `reference`.
    #[must_use]
    pub fn hours_in_window(&self, reference: DateTime<Utc>) -> f64 {
        self.window(reference).hours()
    }

    /// Range in km of a full battery.
    #[must_use]
    pub fn max_battery_range(&self) -> f64 {
        let ChargeConfig {
            battery_level,
            battery_range,
            ..
        } = self.config;

        if battery_level > 0.0 && battery_range > 0.0 {
            battery_range / battery_level * 100.0
        } else {
            FALLBACK_MAX_BATTERY_RANGE
        }
    }

    fn charge_limit(&self) -> f64 {
        self.config
            .charge_limit_soc
            .filter(|soc| *soc > 0.0)
            .unwrap_or(DEFAULT_CHARGE_LIMIT_SOC)
            / 100.0
    }

    /// Range in km to add, limited to what fits in the charge window.
    #[must_use]
    pub fn max_to_charge(&self, reference: DateTime<Utc>) -> f64 {
        let wanted =
            (self.max_battery_range() * self.charge_limit() - self.config.battery_range).max(0.0);
        let possible = self.hours_in_window(reference) * self.config.charge_km_per_hour;
        wanted.min(possible).max(0.0)
    }

    /// Hours of charging needed, rounded to two decimals.
    ///
    /// `override_hours` replaces the computed value. Either way the result is capped by
    /// `charge_max_hours`.
    #[must_use]
    pub fn charge_hours(&self, reference: DateTime<Utc>, override_hours: Option<f64>) -> f64 {
        let hours = override_hours.unwrap_or_else(|| {
            if self.config.charge_km_per_hour > 0.0 {
                (100.0 * self.max_to_charge(reference) / self.config.charge_km_per_hour).round()
                    / 100.0
            } else {
                0.0
            }
        });

        let hours = hours.max(0.0);
        match self.config.charge_max_hours {
            Some(max_hours) if hours > max_hours => max_hours.max(0.0),
            _ => hours,
        }
    }

    /// Charge hours formatted as `H:MM`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn charge_hours_formatted(&self, reference: DateTime<Utc>) -> String {
        let hours = self.charge_hours(reference, None);
        let whole = hours.floor();
        let minutes = (60.0 * (hours - whole)).round() as i64;
        format!("{}:{minutes:02}", whole as i64)
    }

    /// Do the prices cover every hour of the charge window?
    #[must_use]
    pub fn has_complete_prices(&self, prices: &PriceSeries, reference: DateTime<Utc>) -> bool {
        let window = self.window(reference);
        prices.covers(window.starting_at(), window.ending_at())
    }

    /// Create the plan for the window on the day of `reference`.
    ///
    /// # Errors
    ///
    /// Returns [`PlanDeferred`] when the battery data is unknown or the prices do not cover the
    /// window yet.
    pub fn create_plan(
        &self,
        prices: &PriceSeries,
        reference: DateTime<Utc>,
    ) -> Result<ChargePlan, PlanDeferred> {
        if self.config.battery_level <= 0.0
            || self.config.battery_range <= 0.0
            || self.config.charge_km_per_hour <= 0.0
        {
            return Err(PlanDeferred::InsufficientData);
        }

        if !self.has_complete_prices(prices, reference) {
            return Err(PlanDeferred::MissingPrices);
        }

        self.create_plan_with_hours(prices, reference, None)
    }

    /// Create the plan for the window on the day of `reference` without checking the inputs.
    ///
    /// `override_hours` replaces the computed charge hours.
    ///
    /// # Errors
    ///
    /// Returns [`PlanDeferred::MissingPrices`] if there are no prices in the window at all.
    pub fn create_plan_with_hours(
        &self,
        prices: &PriceSeries,
        reference: DateTime<Utc>,
        override_hours: Option<f64>,
    ) -> Result<ChargePlan, PlanDeferred> {
        let window = self.window(reference);
        let in_window = prices.in_period(window.starting_at(), window.ending_at());
        if in_window.is_empty() {
            return Err(PlanDeferred::MissingPrices);
        }

        let charge_hours = self.charge_hours(reference, override_hours);
        let selected = lowest_prices(&in_window, charge_hours);
        let boundary = selected.last().map(|p| p.starts_at);

        let fraction = charge_hours - charge_hours.floor();
        let boundary_length = if fraction > 0.0 {
            hours_to_time_delta(fraction.max(MIN_FRACTIONAL_HOURS))
        } else {
            TimeDelta::hours(1)
        };

        let segments: Vec<ChargeSegment> = in_window
            .iter()
            .map(|p| {
                let charge = selected.iter().any(|s| s.starts_at == p.starts_at);
                let length = if charge && boundary == Some(p.starts_at) {
                    boundary_length
                } else {
                    TimeDelta::hours(1)
                };
                ChargeSegment {
                    starts_at: p.starts_at,
                    ends_at: p.starts_at + length,
                    price: p.price,
                    charge,
                }
            })
            .collect();

        debug!(
            "Created charge plan for {:?} with {charge_hours} hours over {} segments",
            window,
            segments.len()
        );

        Ok(ChargePlan::new(
            window,
            segments,
            self.max_to_charge(reference),
            charge_hours,
            self.timezone,
        ))
    }
}

/// The `ceil(hours)` cheapest prices, cheapest first.
///
/// Equal prices keep their original order. The last entry is the most expensive selected
/// price, the one that gets shortened when `hours` is fractional.
#[must_use]
#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
pub fn lowest_prices(prices: &[PricePoint], hours: f64) -> Vec<PricePoint> {
    let count = hours.max(0.0).ceil() as usize;
    let mut sorted = prices.to_vec();
    sorted.sort_by(|a, b| a.price.total_cmp(&b.price));
    sorted.truncate(count);
    sorted
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::datetime::parse_time_of_day;
    use chrono_tz::Europe::Oslo;
    use float_cmp::assert_approx_eq;

    fn dt(s: impl Into<String>) -> DateTime<Utc> {
        s.into().parse().unwrap()
    }

    fn config() -> ChargeConfig {
        ChargeConfig {
            charge_start: parse_time_of_day("01:00").unwrap(),
            charge_end: parse_time_of_day("05:00").unwrap(),
            charge_km_per_hour: 20.0,
            battery_level: 50.0,
            battery_range: 200.0,
            charge_limit_soc: Some(60.0),
            charge_max_hours: None,
        }
    }

    fn prices(values: &[f64]) -> PriceSeries {
        values
            .iter()
            .enumerate()
            .map(|(hour, price)| {
                PricePoint::new(dt(format!("2019-04-02T{hour:02}:00:00+02:00")), *price)
            })
            .collect()
    }

    const REFERENCE: &str = "2019-04-01T22:00:00Z";

    #[test]
    fn test_charge_hours() {
        let planner = ChargePlanner::new(config(), Oslo);
        // full range 400 km, 60% is 240 km, 40 km to go at 20 km/h.
        assert_approx_eq!(f64, planner.max_battery_range(), 400.0);
        assert_approx_eq!(f64, planner.max_to_charge(dt(REFERENCE)), 40.0);
        assert_approx_eq!(f64, planner.charge_hours(dt(REFERENCE), None), 2.0);
        assert_eq!(planner.charge_hours_formatted(dt(REFERENCE)), "2:00");
    }

    #[test]
    fn test_charge_hours_limited_by_window() {
        let mut config = config();
        config.charge_limit_soc = Some(100.0);
        config.battery_range = 20.0;
        config.battery_level = 5.0;
        let planner = ChargePlanner::new(config, Oslo);
        // 4 hours at 20 km/h
        assert_approx_eq!(f64, planner.max_to_charge(dt(REFERENCE)), 80.0);
        assert_approx_eq!(f64, planner.charge_hours(dt(REFERENCE), None), 4.0);
    }

    #[test]
    fn test_nothing_to_charge() {
        let mut config = config();
        config.battery_level = 80.0;
        config.battery_range = 320.0;
        let planner = ChargePlanner::new(config, Oslo);
        assert_approx_eq!(f64, planner.charge_hours(dt(REFERENCE), None), 0.0);

        let plan = planner
            .create_plan(&prices(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]), dt(REFERENCE))
            .unwrap();
        assert!(plan.segments().iter().all(|s| !s.charge));
        assert_eq!(plan.sum_charge_hours(), TimeDelta::zero());
        assert_eq!(plan.cost_reduction(), None);
    }

    #[test]
    fn test_charge_max_hours_only_reduces() {
        let mut config = config();
        config.charge_max_hours = Some(1.5);
        let planner = ChargePlanner::new(config.clone(), Oslo);
        assert_approx_eq!(f64, planner.charge_hours(dt(REFERENCE), None), 1.5);

        config.charge_max_hours = Some(10.0);
        let planner = ChargePlanner::new(config, Oslo);
        assert_approx_eq!(f64, planner.charge_hours(dt(REFERENCE), None), 2.0);
    }

    #[test]
    fn test_create_plan_fractional() {
        let planner = ChargePlanner::new(config(), Oslo);
        let prices = prices(&[9.0, 3.0, 1.0, 2.0, 4.0, 9.0]);
        let plan = planner
            .create_plan_with_hours(&prices, dt(REFERENCE), Some(2.5))
            .unwrap();

        let segments: Vec<_> = plan
            .segments()
            .iter()
            .map(|s| (s.starts_at, s.ends_at, s.charge))
            .collect();
        assert_eq!(
            segments,
            vec![
                (dt("2019-04-02T01:00:00+02:00"), dt("2019-04-02T01:30:00+02:00"), true),
                (dt("2019-04-02T02:00:00+02:00"), dt("2019-04-02T03:00:00+02:00"), true),
                (dt("2019-04-02T03:00:00+02:00"), dt("2019-04-02T04:00:00+02:00"), true),
                (dt("2019-04-02T04:00:00+02:00"), dt("2019-04-02T05:00:00+02:00"), false),
            ]
        );
        assert_eq!(plan.sum_charge_hours(), TimeDelta::minutes(150));
    }

    #[test]
    fn test_create_plan_minimum_fraction() {
        let planner = ChargePlanner::new(config(), Oslo);
        let prices = prices(&[9.0, 3.0, 1.0, 2.0, 4.0, 9.0]);
        let plan = planner
            .create_plan_with_hours(&prices, dt(REFERENCE), Some(1.01))
            .unwrap();
        assert_eq!(plan.sum_charge_hours(), TimeDelta::minutes(63));
    }

    #[test]
    fn test_create_plan_deferred() {
        let mut config = config();
        let planner = ChargePlanner::new(config.clone(), Oslo);
        let partial = prices(&[9.0, 3.0, 1.0]);
        assert_eq!(
            planner.create_plan(&partial, dt(REFERENCE)),
            Err(PlanDeferred::MissingPrices)
        );

        config.battery_level = 0.0;
        let planner = ChargePlanner::new(config, Oslo);
        let full = prices(&[9.0, 3.0, 1.0, 2.0, 4.0, 9.0]);
        assert_eq!(
            planner.create_plan(&full, dt(REFERENCE)),
            Err(PlanDeferred::InsufficientData)
        );
    }

    #[test]
    fn test_lowest_prices_stable() {
        let prices = prices(&[2.0, 1.0, 2.0, 1.0]);
        let lowest = lowest_prices(prices.points(), 2.2);
        let hours: Vec<_> = lowest.iter().map(|p| p.starts_at).collect();
        assert_eq!(
            hours,
            vec![
                dt("2019-04-02T01:00:00+02:00"),
                dt("2019-04-02T03:00:00+02:00"),
                dt("2019-04-02T00:00:00+02:00"),
            ]
        );
    }
}
