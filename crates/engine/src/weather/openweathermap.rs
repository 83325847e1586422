use async_trait::async_trait;
use chrono::{NaiveDateTime, Timelike};
use reqwest::Client;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{get_json, unix_to_local, CurrentWeather, ForecastBlock, ProviderSettings, WeatherCache, WeatherProvider};
use crate::clock::{Clock, TIMESTAMP_FORMAT};
use crate::error::{ControllerError, Result};

const DEFAULT_BASE_URL: &str = "https://api.openweathermap.org";

#[derive(Debug)]
pub struct OpenWeatherMapProvider {
    http: Client,
    base_url: String,
    settings: ProviderSettings,
    clock: Arc<dyn Clock>,
    cache: WeatherCache,
}

impl OpenWeatherMapProvider {
    pub fn new(settings: ProviderSettings, clock: Arc<dyn Clock>) -> Self {
        let base_url = settings
            .base_url
            .clone()
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            http: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            cache: WeatherCache::new(settings.cache_timeout_min),
            settings,
            clock,
        }
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        vec![
            ("appid", self.settings.api_key.clone()),
            ("lat", self.settings.latitude.to_string()),
            ("lon", self.settings.longitude.to_string()),
            ("units", "metric".to_string()),
        ]
    }

    fn local_time(&self, item: &Value) -> Option<NaiveDateTime> {
        let offset = *self.clock.now().offset();
        item.get("dt")
            .and_then(Value::as_i64)
            .and_then(|secs| unix_to_local(secs, offset))
            .or_else(|| {
                item.get("dt_txt")
                    .and_then(Value::as_str)
                    .and_then(|s| NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT).ok())
            })
    }
}

/// Rain rate from a `{"1h": mm}` or `{"3h": mm}` object, in mm/h.
fn rain_rate(rain: &Value) -> f64 {
    let Some(map) = rain.as_object() else {
        return 0.0;
    };
    map.iter()
        .find_map(|(key, amount)| {
            let hours: f64 = key.strip_suffix('h')?.parse().ok().filter(|h: &f64| *h > 0.0)?;
            Some(amount.as_f64().unwrap_or(0.0) / hours)
        })
        .unwrap_or(0.0)
}

/// Count of block starts still ahead today, plus the next 00:00 block.
fn forecast_count(hour: u32) -> usize {
    (0..=21).step_by(3).filter(|h| *h >= hour).count() + 1
}

#[async_trait]
impl WeatherProvider for OpenWeatherMapProvider {
    fn name(&self) -> &'static str {
        "openweathermap"
    }

    fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    fn cache(&self) -> &WeatherCache {
        &self.cache
    }

    async fn current_weather(&self) -> Result<CurrentWeather> {
        let now = self.clock.now();
        if let Some(cached) = self.cache.fresh_current(now) {
            debug!("returning cached current weather");
            return Ok(cached);
        }

        let url = format!("{}/data/2.5/weather", self.base_url);
        let raw = get_json(&self.http, "OpenWeatherMap current weather", &url, &self.query()).await?;

        let current = CurrentWeather {
            observed_at: self.local_time(&raw),
            is_raining: raw.get("rain").is_some(),
            rain_mm_per_hour: raw.get("rain").map(rain_rate).unwrap_or(0.0),
            raw,
        };
        self.cache.store_current(now, current.clone());
        Ok(current)
    }

    async fn forecast(&self) -> Result<Vec<ForecastBlock>> {
        let now = self.clock.now();
        if let Some(cached) = self.cache.fresh_forecast(now) {
            debug!("returning cached forecast");
            return Ok(cached);
        }

        let mut query = self.query();
        query.push(("cnt", forecast_count(now.hour()).to_string()));
        let url = format!("{}/data/2.5/forecast", self.base_url);
        let raw = get_json(&self.http, "OpenWeatherMap forecast", &url, &query).await?;

        let items = raw
            .get("list")
            .and_then(Value::as_array)
            .ok_or_else(|| ControllerError::Decode {
                what: "OpenWeatherMap forecast",
                source: serde::de::Error::custom("missing 'list' array"),
            })?;

        let blocks = items
            .iter()
            .filter_map(|item| {
                let Some(start) = self.local_time(item) else {
                    warn!("forecast item without a usable time, skipping");
                    return None;
                };
                Some(ForecastBlock {
                    start,
                    pop: item.get("pop").and_then(Value::as_f64).unwrap_or(0.0),
                    rain_mm: item
                        .get("rain")
                        .and_then(|r| r.get("3h"))
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0),
                })
            })
            .collect();

        Ok(self.cache.merge_forecast(now, blocks))
    }
}
