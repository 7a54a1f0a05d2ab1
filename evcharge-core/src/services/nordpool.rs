//! Day-ahead prices from Nord Pool.
use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use opentelemetry::{global, metrics::Counter, KeyValue};
use reqwest::StatusCode;
use serde::Deserialize;
use tap::Pipe;
use tracing::{debug, info};
use url::Url;

use crate::datetime::{duration, start_of_hour};
use crate::prices::{PriceError, PriceFeed, PricePoint};

fn default_base_url() -> String {
    "https://dataportal-api.nordpoolgroup.com/api/".into()
}

/// Where to find the price API.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// API base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DayAheadPrices {
    multi_area_entries: Vec<AreaEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AreaEntry {
    delivery_start: String,
    entry_per_area: BTreeMap<String, f64>,
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, PriceError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.to_utc())
        .map_err(|_| PriceError::InvalidTimestamp(value.to_string()))
}

/// Convert prices per MWh for `area` into hourly prices per kWh.
///
/// Entries shorter than an hour are averaged.
fn hourly_prices(prices: &DayAheadPrices, area: &str) -> Result<Vec<PricePoint>, PriceError> {
    let mut hours: BTreeMap<DateTime<Utc>, (f64, u32)> = BTreeMap::new();

    for entry in &prices.multi_area_entries {
        let Some(price) = entry.entry_per_area.get(area) else {
            continue;
        };
        let starts_at = parse_timestamp(&entry.delivery_start)?;
        let hour = start_of_hour(starts_at, &Utc);
        let (sum, count) = hours.entry(hour).or_insert((0.0, 0));
        *sum += price / 1000.0;
        *count += 1;
    }

    hours
        .into_iter()
        .map(|(starts_at, (sum, count))| PricePoint::new(starts_at, sum / f64::from(count)))
        .collect::<Vec<_>>()
        .pipe(Ok)
}

/// A client for the Nord Pool data portal.
#[derive(Debug)]
pub struct NordpoolClient {
    base_url: String,
    client: reqwest::Client,
    requests: Counter<u64>,
}

impl NordpoolClient {
    /// Create a new client.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        let meter = global::meter("nordpool");
        Self {
            base_url: config.base_url.clone(),
            client: reqwest::Client::new(),
            requests: meter.u64_counter("price_requests").init(),
        }
    }

    fn url(&self, date: NaiveDate, area: &str, currency: &str) -> Result<Url, PriceError> {
        let mut url = Url::parse(&self.base_url)?.join("DayAheadPrices")?;
        url.query_pairs_mut()
            .append_pair("date", &date.format("%Y-%m-%d").to_string())
            .append_pair("market", "DayAhead")
            .append_pair("deliveryArea", area)
            .append_pair("currency", currency);
        Ok(url)
    }

    async fn fetch(
        &self,
        date: NaiveDate,
        area: &str,
        currency: &str,
    ) -> Result<Vec<PricePoint>, PriceError> {
        let url = self.url(date, area, currency)?;
        debug!("get: {}", url);

        let response = self
            .client
            .get(url)
            .timeout(Duration::from_secs(30))
            .send()
            .await?;

        match response.status() {
            StatusCode::NO_CONTENT => {
                info!("No prices published yet for {date}");
                Ok(vec![])
            }
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_time = Duration::from_secs(60);
                info!(
                    "Got 429 rate limited, retry in: {}",
                    duration::to_string(&retry_time)
                );
                Err(PriceError::RateLimit(retry_time))
            }
            _ => {
                let text = response.error_for_status()?.text().await?;
                let prices: DayAheadPrices = serde_json::from_str(&text)?;
                hourly_prices(&prices, area)
            }
        }
    }
}

#[async_trait]
impl PriceFeed for NordpoolClient {
    #[tracing::instrument(skip(self))]
    async fn get_hourly_prices(
        &self,
        date: NaiveDate,
        area: &str,
        currency: &str,
    ) -> Result<Vec<PricePoint>, PriceError> {
        let result = self.fetch(date, area, currency).await;

        let status = match &result {
            Ok(_prices) => "successful",
            Err(PriceError::RateLimit(_duration)) => "rate_limited",
            Err(_e) => "error",
        };
        self.requests.add(
            1,
            &[
                KeyValue::new("area", area.to_string()),
                KeyValue::new("status", status),
            ],
        );

        result
    }
}
