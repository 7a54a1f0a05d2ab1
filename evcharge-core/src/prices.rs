//! Hourly day-ahead electricity prices.
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::datetime::duration;

/// The price of energy for the one hour interval starting at `starts_at`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    /// Start of the hour.
    pub starts_at: DateTime<Utc>,

    /// Price per kWh.
    pub price: f64,
}

impl PricePoint {
    /// Create a new price point.
    #[must_use]
    pub const fn new(starts_at: DateTime<Utc>, price: f64) -> Self {
        Self { starts_at, price }
    }

    /// End of the hour covered by this price.
    #[must_use]
    pub fn ends_at(&self) -> DateTime<Utc> {
        self.starts_at + TimeDelta::hours(1)
    }
}

/// An ordered set of hourly prices.
///
/// Points are sorted by `starts_at`. A later point with the same start replaces an
/// earlier one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriceSeries {
    points: Vec<PricePoint>,
}

impl PriceSeries {
    /// Create a new price series.
    #[must_use]
    pub fn new(points: impl IntoIterator<Item = PricePoint>) -> Self {
        let mut points: Vec<PricePoint> = points.into_iter().collect();
        points.sort_by_key(|p| p.starts_at);
        points.dedup_by(|later, earlier| {
            if later.starts_at == earlier.starts_at {
                *earlier = *later;
                true
            } else {
                false
            }
        });
        Self { points }
    }

    /// All points, ordered by start time.
    #[must_use]
    pub fn points(&self) -> &[PricePoint] {
        &self.points
    }

    /// Number of points.
    #[must_use]
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Are there no points?
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Points starting within `[start, end)`, ordered by start time.
    #[must_use]
    pub fn in_period(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<PricePoint> {
        self.points
            .iter()
            .filter(|p| p.starts_at >= start && p.starts_at < end)
            .copied()
            .collect()
    }

    /// Is there a price for every hour of `[start, end)`?
    ///
    /// The first point may start up to an hour after `start`, and the hour containing `end`
    /// counts when `end` is not on an hour boundary.
    #[must_use]
    pub fn covers(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        let points = self.in_period(start, end);
        let Some(first) = points.first() else {
            return false;
        };
        if first.starts_at >= start + TimeDelta::hours(1) {
            return false;
        }

        let mut expected = first.starts_at;
        for point in &points {
            if point.starts_at != expected {
                return false;
            }
            expected = point.ends_at();
        }
        expected >= end
    }
}

impl FromIterator<PricePoint> for PriceSeries {
    fn from_iter<I: IntoIterator<Item = PricePoint>>(iter: I) -> Self {
        Self::new(iter)
    }
}

/// An error fetching prices.
#[derive(Debug, Error)]
pub enum PriceError {
    /// Reqwest error
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),

    /// Json error
    #[error("Json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Url error
    #[error("Url error: {0}")]
    Url(#[from] url::ParseError),

    /// Rate limit error
    #[error("Rate limit error, retry in: {}", duration::to_string(.0))]
    RateLimit(Duration),

    /// The feed returned a timestamp we could not understand.
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// A source of day-ahead prices.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Get the hourly prices for one calendar day.
    ///
    /// A day with no published prices yet returns an empty list.
    ///
    /// # Errors
    ///
    /// If the prices could not be retrieved.
    async fn get_hourly_prices(
        &self,
        date: NaiveDate,
        area: &str,
        currency: &str,
    ) -> Result<Vec<PricePoint>, PriceError>;
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use rstest::rstest;

    fn dt(s: impl Into<String>) -> DateTime<Utc> {
        s.into().parse().unwrap()
    }

    fn series(hours: &[u32]) -> PriceSeries {
        hours
            .iter()
            .map(|h| PricePoint::new(dt(format!("2019-04-02T{h:02}:00:00Z")), f64::from(*h)))
            .collect()
    }

    #[test]
    fn test_new_sorts_and_replaces_duplicates() {
        let series = PriceSeries::new([
            PricePoint::new(dt("2019-04-02T02:00:00Z"), 2.0),
            PricePoint::new(dt("2019-04-02T01:00:00Z"), 1.0),
            PricePoint::new(dt("2019-04-02T02:00:00Z"), 3.0),
        ]);
        assert_eq!(
            series.points(),
            &[
                PricePoint::new(dt("2019-04-02T01:00:00Z"), 1.0),
                PricePoint::new(dt("2019-04-02T02:00:00Z"), 3.0),
            ]
        );
    }

    #[test]
    fn test_in_period_is_half_open() {
        let series = series(&[0, 1, 2, 3]);
        let points = series.in_period(dt("2019-04-02T01:00:00Z"), dt("2019-04-02T03:00:00Z"));
        let starts: Vec<_> = points.iter().map(|p| p.starts_at).collect();
        assert_eq!(
            starts,
            vec![dt("2019-04-02T01:00:00Z"), dt("2019-04-02T02:00:00Z")]
        );
    }

    #[rstest]
    #[case(&[0, 1, 2, 3], "00:00", "04:00", true)]
    #[case(&[0, 1, 2, 3], "00:00", "03:30", true)]
    #[case(&[0, 1, 2], "00:00", "03:30", false)]
    #[case(&[0, 1, 2, 3], "00:15", "04:00", true)]
    #[case(&[0, 2, 3], "00:00", "04:00", false)]
    #[case(&[1, 2, 3], "00:00", "04:00", false)]
    #[case(&[], "00:00", "01:00", false)]
    fn test_covers(
        #[case] hours: &[u32],
        #[case] start: &str,
        #[case] end: &str,
        #[case] expected: bool,
    ) {
        let series = series(hours);
        let start = dt(format!("2019-04-02T{start}:00Z"));
        let end = dt(format!("2019-04-02T{end}:00Z"));
        assert_eq!(series.covers(start, end), expected);
    }
}
